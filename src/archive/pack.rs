//! Archive writers

use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::fs::{self, File, Metadata};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header};

use super::ExactReader;
use crate::error::ArchiveError;
use crate::exclusion::Matchers;
use crate::index::FileIndex;
use crate::logging::*;
use crate::types::{absolute_path, FileInformation};
use crate::util::{is_recursive_symlink, is_stale};

/// Packs local paths for upload
///
/// Directories are added recursively. Symlinks are followed, so content
/// reached through a link is archived under the link's own path. Headers
/// carry the ceiling mtime and, when the remote ownership of a path is known,
/// its remote mode/uid/gid so re-uploads do not reset them.
pub struct Archiver<W: Write> {
	root: PathBuf,
	builder: Builder<GzEncoder<W>>,
	matchers: Matchers,
	index: FileIndex,
	written: BTreeMap<String, FileInformation>,
}

impl<W: Write> Archiver<W> {
	pub fn new(root: impl Into<PathBuf>, writer: W, matchers: Matchers, index: FileIndex) -> Self {
		Archiver {
			root: root.into(),
			builder: Builder::new(GzEncoder::new(writer, Compression::default())),
			matchers,
			index,
			written: BTreeMap::new(),
		}
	}

	/// Add one path; vanished paths are skipped
	pub fn add(&mut self, name: &str) -> Result<(), ArchiveError> {
		let Some(path) = absolute_path(&self.root, name) else {
			warn!("Refusing to archive {}", name);
			return Ok(());
		};
		match fs::metadata(&path) {
			Ok(stat) => self.add_entry(name, &path, &stat),
			Err(e) if is_stale(&e) => {
				debug!("Skipping vanished {}", name);
				Ok(())
			}
			Err(e) => Err(e.into()),
		}
	}

	/// Finish the stream and hand back the writer and the written entries
	pub fn finish(self) -> Result<(W, BTreeMap<String, FileInformation>), ArchiveError> {
		let encoder = self.builder.into_inner()?;
		let mut writer = encoder.finish()?;
		writer.flush()?;
		Ok((writer, self.written))
	}

	fn add_entry(&mut self, name: &str, path: &Path, stat: &Metadata) -> Result<(), ArchiveError> {
		if self.written.contains_key(name) {
			return Ok(());
		}
		if stat.is_dir() {
			if !name.is_empty() {
				self.append_directory(name, stat)?;
			}
			self.add_children(name, path)
		} else if stat.is_file() {
			self.append_file(name, path)
		} else {
			debug!("Skipping special file {}", name);
			Ok(())
		}
	}

	fn add_children(&mut self, name: &str, path: &Path) -> Result<(), ArchiveError> {
		let entries = match fs::read_dir(path) {
			Ok(entries) => entries,
			Err(e) if is_stale(&e) => return Ok(()),
			Err(e) => return Err(e.into()),
		};

		for entry in entries.flatten() {
			let file_name = entry.file_name();
			let Some(file_name) = file_name.to_str() else {
				warn!("Skipping non UTF-8 name in {}", name);
				continue;
			};
			let child_name =
				if name.is_empty() { file_name.to_string() } else { format!("{}/{}", name, file_name) };
			let child_path = entry.path();

			let Ok(stat) = fs::metadata(&child_path) else {
				// vanished or dangling link
				continue;
			};
			if entry.file_type().is_ok_and(|t| t.is_symlink()) && is_recursive_symlink(&child_path) {
				debug!("Skipping recursive symlink {}", child_name);
				continue;
			}

			let is_dir = stat.is_dir();
			if self.matchers.is_excluded(&child_name, is_dir)
				|| self.matchers.is_upload_excluded(&child_name, is_dir)
			{
				if is_dir && self.matchers.require_full_scan() {
					self.add_children(&child_name, &child_path)?;
				}
				continue;
			}
			self.add_entry(&child_name, &child_path, &stat)?;
		}
		Ok(())
	}

	fn append_directory(&mut self, name: &str, stat: &Metadata) -> Result<(), ArchiveError> {
		let info = FileInformation::from_metadata(name, stat);
		let mut header = self.header_for(&info, EntryType::Directory, 0);
		self.builder.append_data(&mut header, name, io::empty())?;
		self.written.insert(name.to_string(), info);
		Ok(())
	}

	fn append_file(&mut self, name: &str, path: &Path) -> Result<(), ArchiveError> {
		let file = match File::open(path) {
			Ok(file) => file,
			Err(e) if is_stale(&e) => return Ok(()),
			Err(e) => return Err(e.into()),
		};
		let stat = file.metadata()?;
		let info = FileInformation::from_metadata(name, &stat);
		let mut header = self.header_for(&info, EntryType::Regular, stat.len());
		let reader = ExactReader { inner: file, remaining: stat.len() };
		self.builder.append_data(&mut header, name, reader)?;
		self.written.insert(name.to_string(), info);
		Ok(())
	}

	fn header_for(&self, info: &FileInformation, entry_type: EntryType, size: u64) -> Header {
		let (mode, uid, gid) = {
			let map = self.index.lock();
			match map.get(&info.name) {
				Some(tracked) => (
					tracked.remote_mode.unwrap_or(info.mode),
					tracked.remote_uid.unwrap_or(0),
					tracked.remote_gid.unwrap_or(0),
				),
				None => (info.mode, 0, 0),
			}
		};

		let mut header = Header::new_gnu();
		header.set_entry_type(entry_type);
		header.set_size(size);
		header.set_mtime(info.mtime.max(0) as u64);
		header.set_mode(mode);
		header.set_uid(uid as u64);
		header.set_gid(gid as u64);
		header
	}
}

/// Packs remote paths for download
///
/// Only the named paths are archived: directories as bare headers, regular
/// files with their content. Missing paths are skipped.
pub fn pack_paths<W: Write>(root: &Path, names: &[String], writer: W) -> Result<W, ArchiveError> {
	let mut builder = Builder::new(GzEncoder::new(writer, Compression::default()));

	for name in names {
		let Some(path) = absolute_path(root, name) else {
			warn!("Refusing to archive {}", name);
			continue;
		};
		let name = name.trim_start_matches('/');

		let (stat, file) = match fs::metadata(&path) {
			Ok(stat) if stat.is_dir() => (stat, None),
			Ok(stat) if stat.is_file() => match File::open(&path) {
				Ok(file) => (file.metadata()?, Some(file)),
				Err(e) if is_stale(&e) => continue,
				Err(e) => return Err(e.into()),
			},
			Ok(_) => continue,
			Err(e) if is_stale(&e) => {
				debug!("Requested path {} vanished", name);
				continue;
			}
			Err(e) => return Err(e.into()),
		};

		let mut header = Header::new_gnu();
		header.set_mtime(stat.mtime().max(0) as u64);
		header.set_mode(stat.mode() & 0o7777);
		header.set_uid(stat.uid() as u64);
		header.set_gid(stat.gid() as u64);
		match file {
			None => {
				header.set_entry_type(EntryType::Directory);
				header.set_size(0);
				builder.append_data(&mut header, name, io::empty())?;
			}
			Some(file) => {
				header.set_entry_type(EntryType::Regular);
				header.set_size(stat.len());
				let reader = ExactReader { inner: file, remaining: stat.len() };
				builder.append_data(&mut header, name, reader)?;
			}
		}
	}

	let mut writer = builder.into_inner()?.finish()?;
	writer.flush()?;
	Ok(writer)
}

// vim: ts=4
