//! Archive readers

use filetime::FileTime;
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::fs::{self, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use tar::{Archive, Entry, EntryType};
use tempfile::NamedTempFile;

use super::entry_name;
use crate::config::STAGING_DIR;
use crate::error::ArchiveError;
use crate::index::FileIndex;
use crate::logging::*;
use crate::types::{ceil_mtime, parent_name, FileInformation};

/// How the remote side applies uploaded archives
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteUnpackOptions {
	/// Apply archived mode and owner even to files that already exist
	pub override_permissions: bool,
}

/// How the local side applies downloaded archives
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalUnpackOptions {
	/// Overwrite local files even if they are newer than the archived copy
	pub overwrite_newer: bool,
}

const COPY_BUFFER_SIZE: usize = 64 * 1024;

struct EntryMeta {
	name: String,
	kind: EntryType,
	size: u64,
	mtime: i64,
	mode: u32,
	uid: u32,
	gid: u32,
}

fn entry_meta<R: Read>(entry: &Entry<'_, R>) -> Result<EntryMeta, ArchiveError> {
	let header = entry.header();
	Ok(EntryMeta {
		name: entry_name(&entry.path().map_err(corrupt)?)?,
		kind: header.entry_type(),
		size: header.size().map_err(corrupt)?,
		mtime: header.mtime().map_err(corrupt)? as i64,
		mode: header.mode().map_err(corrupt)? & 0o7777,
		uid: header.uid().map_err(corrupt)? as u32,
		gid: header.gid().map_err(corrupt)? as u32,
	})
}

fn corrupt(e: io::Error) -> ArchiveError {
	ArchiveError::Corrupt(e.to_string())
}

/// Apply an uploaded archive below `root`
///
/// Existing files keep their mode and owner unless
/// [`RemoteUnpackOptions::override_permissions`] is set. Returns the number of
/// entries applied.
pub fn unpack_remote<R: Read>(
	root: &Path,
	reader: R,
	options: RemoteUnpackOptions,
) -> Result<usize, ArchiveError> {
	let mut archive = Archive::new(GzDecoder::new(reader));
	let mut applied = 0;

	for entry in archive.entries().map_err(corrupt)? {
		let mut entry = entry.map_err(corrupt)?;
		let meta = entry_meta(&entry)?;
		let path = root.join(&meta.name);

		match meta.kind {
			EntryType::Directory => {
				if !path.is_dir() {
					fs::create_dir_all(&path)?;
					fs::set_permissions(&path, Permissions::from_mode(dir_mode(meta.mode)))?;
				}
			}
			EntryType::Regular | EntryType::Continuous => {
				let existing = fs::symlink_metadata(&path).ok().filter(|m| m.is_file());
				let (mode, owner) = match existing {
					Some(existing) if !options.override_permissions => {
						(existing.mode() & 0o7777, Some((existing.uid(), existing.gid())))
					}
					_ => {
						let owner = (meta.uid != 0 || meta.gid != 0).then_some((meta.uid, meta.gid));
						(meta.mode, owner)
					}
				};
				write_entry(root, &path, &mut entry, mode, owner, meta.mtime)?;
			}
			other => {
				debug!("Ignoring {:?} entry {}", other, meta.name);
				continue;
			}
		}
		applied += 1;
	}
	Ok(applied)
}

/// Apply a downloaded archive below `root` and record every written path
///
/// `remote` holds the remote metadata the download was requested for; it
/// supplies the remote mode and owner stored in the index. A local file whose
/// (ceiling) mtime is newer than the archived one is left alone unless
/// [`LocalUnpackOptions::overwrite_newer`] is set. Returns the names that were
/// written.
pub fn unpack_local<R: Read>(
	root: &Path,
	reader: R,
	index: &FileIndex,
	remote: &HashMap<String, FileInformation>,
	options: LocalUnpackOptions,
) -> Result<Vec<String>, ArchiveError> {
	let mut archive = Archive::new(GzDecoder::new(reader));
	let mut written = Vec::new();

	for entry in archive.entries().map_err(corrupt)? {
		let mut entry = entry.map_err(corrupt)?;
		let meta = entry_meta(&entry)?;
		let path = root.join(&meta.name);

		let mut info = remote.get(&meta.name).cloned().unwrap_or_else(|| FileInformation {
			name: meta.name.clone(),
			remote_mode: Some(meta.mode),
			remote_uid: Some(meta.uid),
			remote_gid: Some(meta.gid),
			..Default::default()
		});

		match meta.kind {
			EntryType::Directory => {
				fs::create_dir_all(&path)?;
				info.is_directory = true;
			}
			EntryType::Regular | EntryType::Continuous => {
				let existing = fs::metadata(&path).ok();
				if let Some(local) = existing.as_ref().filter(|m| m.is_file()) {
					if !options.overwrite_newer
						&& ceil_mtime(local.mtime(), local.mtime_nsec()) > meta.mtime
					{
						debug!("Keeping newer local {}", meta.name);
						continue;
					}
				}
				if existing.as_ref().is_some_and(|m| m.is_dir()) {
					fs::remove_dir_all(&path)?;
				}
				let mode = existing
					.as_ref()
					.filter(|m| m.is_file())
					.map_or(meta.mode, |m| m.mode() & 0o7777);
				write_entry(root, &path, &mut entry, mode, None, meta.mtime)?;

				info.is_directory = false;
				info.size = meta.size as i64;
				info.mtime = meta.mtime;
				info.mtime_nano = 0;
			}
			other => {
				debug!("Ignoring {:?} entry {}", other, meta.name);
				continue;
			}
		}

		let mut map = index.lock();
		if let Some(parent) = parent_name(&meta.name) {
			map.create_dir_in_file_map(parent);
		}
		map.set(info);
		drop(map);
		written.push(meta.name);
	}
	Ok(written)
}

/// Write one file entry through a staging file and rename it into place
///
/// Staging files live below [`STAGING_DIR`], which both sides exclude, so
/// no watcher ever reports a half written file.
fn write_entry<R: Read>(
	root: &Path,
	path: &Path,
	entry: &mut Entry<'_, R>,
	mode: u32,
	owner: Option<(u32, u32)>,
	mtime: i64,
) -> Result<(), ArchiveError> {
	let parent = path
		.parent()
		.ok_or_else(|| ArchiveError::Corrupt(format!("no parent for {:?}", path)))?;
	fs::create_dir_all(parent)?;
	let staging = root.join(STAGING_DIR);
	fs::create_dir_all(&staging)?;

	let mut tmp = NamedTempFile::new_in(&staging)?;
	copy_entry(entry, tmp.as_file_mut())?;
	tmp.as_file().set_permissions(Permissions::from_mode(file_mode(mode)))?;
	if let Some((uid, gid)) = owner {
		if let Err(e) = std::os::unix::fs::fchown(tmp.as_file(), Some(uid), Some(gid)) {
			debug!("Cannot chown {:?} to {}:{}: {}", path, uid, gid, e);
		}
	}

	let mtime = FileTime::from_unix_time(mtime, 0);
	match tmp.persist(path) {
		Ok(file) => filetime::set_file_handle_times(&file, None, Some(mtime))?,
		// the target sits on another filesystem, e.g. below a followed symlink
		Err(e) if e.error.raw_os_error() == Some(libc::EXDEV) => {
			fs::copy(e.file.path(), path)?;
			if let Some((uid, gid)) = owner {
				if let Err(e) = std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
					debug!("Cannot chown {:?} to {}:{}: {}", path, uid, gid, e);
				}
			}
			filetime::set_file_mtime(path, mtime)?;
		}
		Err(e) => return Err(ArchiveError::Io(e.error)),
	}
	Ok(())
}

/// Copy the payload of one entry
///
/// Read failures come from the archive stream and make it corrupt; write
/// failures are plain local I/O errors.
fn copy_entry<R: Read>(entry: &mut Entry<'_, R>, out: &mut fs::File) -> Result<(), ArchiveError> {
	let mut buf = vec![0u8; COPY_BUFFER_SIZE];
	loop {
		let n = match entry.read(&mut buf) {
			Ok(0) => return Ok(()),
			Ok(n) => n,
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(e) => return Err(corrupt(e)),
		};
		out.write_all(&buf[..n])?;
	}
}

fn file_mode(mode: u32) -> u32 {
	if mode == 0 {
		0o644
	} else {
		mode
	}
}

fn dir_mode(mode: u32) -> u32 {
	if mode == 0 {
		0o755
	} else {
		mode | 0o700
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::archive::{pack_paths, Archiver};
	use crate::exclusion::Matchers;
	use filetime::set_file_mtime;
	use std::collections::BTreeSet;
	use tempfile::TempDir;

	fn write(root: &Path, name: &str, content: &str, mtime: i64) {
		let path = root.join(name);
		fs::create_dir_all(path.parent().unwrap()).unwrap();
		fs::write(&path, content).unwrap();
		set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).unwrap();
	}

	fn mtime_of(path: &Path) -> i64 {
		fs::metadata(path).unwrap().mtime()
	}

	#[test]
	fn test_upload_archive_applies_remotely() {
		let local = TempDir::new().unwrap();
		let remote = TempDir::new().unwrap();
		write(local.path(), "src/main.rs", "fn main() {}", 1_000);
		write(local.path(), "src/app.log", "noise", 1_000);
		write(local.path(), "README", "hi", 2_000);

		let matchers = Matchers::compile(&["*.log".to_string()], &[], &[]).unwrap();
		let mut archiver = Archiver::new(local.path(), Vec::new(), matchers, FileIndex::new());
		archiver.add("src").unwrap();
		archiver.add("README").unwrap();
		archiver.add("missing").unwrap();
		let (bytes, written) = archiver.finish().unwrap();

		assert!(written.contains_key("src"));
		assert!(written.contains_key("src/main.rs"));
		assert!(!written.contains_key("src/app.log"));
		assert_eq!(written["README"].mtime, 2_000);

		let applied =
			unpack_remote(remote.path(), &bytes[..], RemoteUnpackOptions::default()).unwrap();
		assert_eq!(applied, 3);
		assert_eq!(fs::read_to_string(remote.path().join("src/main.rs")).unwrap(), "fn main() {}");
		assert_eq!(mtime_of(&remote.path().join("README")), 2_000);
		assert!(!remote.path().join("src/app.log").exists());
	}

	#[test]
	fn test_remote_unpack_keeps_existing_mode() {
		let local = TempDir::new().unwrap();
		let remote = TempDir::new().unwrap();
		write(local.path(), "run.sh", "echo new", 1_000);
		fs::set_permissions(local.path().join("run.sh"), Permissions::from_mode(0o644)).unwrap();
		write(remote.path(), "run.sh", "echo old", 500);
		fs::set_permissions(remote.path().join("run.sh"), Permissions::from_mode(0o755)).unwrap();

		let mut archiver = Archiver::new(local.path(), Vec::new(), Matchers::default(), FileIndex::new());
		archiver.add("run.sh").unwrap();
		let (bytes, _) = archiver.finish().unwrap();

		unpack_remote(remote.path(), &bytes[..], RemoteUnpackOptions::default()).unwrap();
		let meta = fs::metadata(remote.path().join("run.sh")).unwrap();
		assert_eq!(meta.mode() & 0o777, 0o755);
		assert_eq!(fs::read_to_string(remote.path().join("run.sh")).unwrap(), "echo new");

		unpack_remote(remote.path(), &bytes[..], RemoteUnpackOptions { override_permissions: true })
			.unwrap();
		let meta = fs::metadata(remote.path().join("run.sh")).unwrap();
		assert_eq!(meta.mode() & 0o777, 0o644);
	}

	#[test]
	fn test_download_archive_updates_index() {
		let remote = TempDir::new().unwrap();
		let local = TempDir::new().unwrap();
		write(remote.path(), "a/b.txt", "remote", 3_000);

		let names = vec!["a".to_string(), "a/b.txt".to_string(), "gone".to_string()];
		let bytes = pack_paths(remote.path(), &names, Vec::new()).unwrap();

		let index = FileIndex::new();
		let written =
			unpack_local(local.path(), &bytes[..], &index, &HashMap::new(), Default::default())
				.unwrap();
		assert_eq!(written, vec!["a".to_string(), "a/b.txt".to_string()]);

		let path = local.path().join("a/b.txt");
		assert_eq!(fs::read_to_string(&path).unwrap(), "remote");
		assert_eq!(mtime_of(&path), 3_000);

		// the freshly written file must look unchanged to the upload side
		let map = index.lock();
		let entry = map.get("a/b.txt").unwrap();
		let local_info = FileInformation::from_metadata("a/b.txt", &fs::metadata(&path).unwrap());
		assert_eq!(entry.mtime, local_info.mtime);
		assert_eq!(entry.size, local_info.size);
		assert!(map.get("a").unwrap().is_directory);
	}

	#[test]
	fn test_download_keeps_newer_local_file() {
		let remote = TempDir::new().unwrap();
		let local = TempDir::new().unwrap();
		write(remote.path(), "f.txt", "remote", 1_000);
		write(local.path(), "f.txt", "local edit", 5_000);

		let bytes = pack_paths(remote.path(), &["f.txt".to_string()], Vec::new()).unwrap();
		let index = FileIndex::new();
		let written =
			unpack_local(local.path(), &bytes[..], &index, &HashMap::new(), Default::default())
				.unwrap();

		assert!(written.is_empty());
		assert_eq!(fs::read_to_string(local.path().join("f.txt")).unwrap(), "local edit");
		assert!(index.lock().get("f.txt").is_none());

		let options = LocalUnpackOptions { overwrite_newer: true };
		let written =
			unpack_local(local.path(), &bytes[..], &index, &HashMap::new(), options).unwrap();
		assert_eq!(written, vec!["f.txt".to_string()]);
		assert_eq!(fs::read_to_string(local.path().join("f.txt")).unwrap(), "remote");
	}

	/// Lists the root on every read, like a watcher racing the unpack
	struct Observer<'a> {
		data: &'a [u8],
		root: &'a Path,
		seen: BTreeSet<String>,
	}

	impl Read for Observer<'_> {
		fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
			for entry in fs::read_dir(self.root)?.flatten() {
				self.seen.insert(entry.file_name().to_string_lossy().into_owned());
			}
			let n = out.len().min(self.data.len()).min(16 * 1024);
			out[..n].copy_from_slice(&self.data[..n]);
			self.data = &self.data[n..];
			Ok(n)
		}
	}

	fn noise(len: usize) -> Vec<u8> {
		let mut state = 0x2545_f491_u32;
		(0..len)
			.map(|_| {
				state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
				(state >> 16) as u8
			})
			.collect()
	}

	#[test]
	fn test_unpack_stages_outside_the_tree() {
		let remote = TempDir::new().unwrap();
		let local = TempDir::new().unwrap();
		fs::write(remote.path().join("big.bin"), noise(1 << 20)).unwrap();
		let bytes = pack_paths(remote.path(), &["big.bin".to_string()], Vec::new()).unwrap();

		let mut observer = Observer { data: &bytes, root: local.path(), seen: BTreeSet::new() };
		let index = FileIndex::new();
		unpack_local(local.path(), &mut observer, &index, &HashMap::new(), Default::default())
			.unwrap();

		// only the target itself and the excluded state directory ever show up
		assert!(observer.seen.contains(".livesync"));
		for name in &observer.seen {
			assert!(name == "big.bin" || name == ".livesync", "unexpected {} in the tree", name);
		}
		assert_eq!(fs::read(local.path().join("big.bin")).unwrap().len(), 1 << 20);
		assert_eq!(fs::read_dir(local.path().join(STAGING_DIR)).unwrap().count(), 0);
	}

	#[test]
	fn test_truncated_stream_is_corrupt() {
		let remote = TempDir::new().unwrap();
		let local = TempDir::new().unwrap();
		fs::write(remote.path().join("big.bin"), noise(256 * 1024)).unwrap();
		let bytes = pack_paths(remote.path(), &["big.bin".to_string()], Vec::new()).unwrap();

		let truncated = &bytes[..bytes.len() / 2];
		let result = unpack_remote(local.path(), truncated, Default::default());
		assert!(matches!(result, Err(ArchiveError::Corrupt(_))));
		assert!(!local.path().join("big.bin").exists());
	}

	#[test]
	fn test_garbage_is_corrupt() {
		let local = TempDir::new().unwrap();
		let result = unpack_remote(local.path(), &b"definitely not gzip"[..], Default::default());
		assert!(matches!(result, Err(ArchiveError::Corrupt(_))));
	}
}

// vim: ts=4
