//! Transfer decisions
//!
//! Every function here reads the index, so callers pass the locked
//! [`FileMap`] and the decision is made under the session lock. None of them
//! mutate the index.

use std::fs;
use std::path::Path;

use crate::exclusion::Matchers;
use crate::index::FileMap;
use crate::types::{absolute_path, Change, FileInformation};

/// Should a local path be uploaded
///
/// `local` is the fresh local stat of the path. During the initial walk a
/// tracked directory is still reported (so it can be created remotely) and
/// file times within one second of the tracked time count as equal. The
/// tolerance is symmetric: an initial upload picked by a prefer-local
/// strategy may carry an older time than the remote copy.
pub fn should_upload(
	map: &FileMap,
	matchers: &Matchers,
	local: &FileInformation,
	is_initial: bool,
) -> bool {
	if local.is_symbolic_link {
		return false;
	}
	if matchers.is_excluded(&local.name, local.is_directory)
		|| matchers.is_upload_excluded(&local.name, local.is_directory)
	{
		return false;
	}

	let Some(tracked) = map.get(&local.name) else {
		return true;
	};
	if tracked.is_symbolic_link {
		return false;
	}
	if tracked.is_directory || local.is_directory {
		if tracked.is_directory && local.is_directory {
			return is_initial;
		}
		// type changed
		return true;
	}

	if tracked.size != local.size {
		return true;
	}
	if is_initial {
		(local.mtime - tracked.mtime).abs() > 1
	} else {
		local.mtime != tracked.mtime
	}
}

/// Should a remote change be downloaded
pub fn should_download(map: &FileMap, matchers: &Matchers, change: &Change) -> bool {
	if matchers.is_excluded(&change.path, change.is_dir)
		|| matchers.is_download_excluded(&change.path, change.is_dir)
	{
		return false;
	}

	let Some(tracked) = map.get(&change.path) else {
		return true;
	};
	if tracked.is_symbolic_link || tracked.is_directory {
		return false;
	}
	if change.is_dir {
		// a tracked file turned into a directory remotely
		return true;
	}

	change.mtime_unix > tracked.mtime
		|| (change.mtime_unix == tracked.mtime && change.size != tracked.size)
}

/// Should a local path be deleted because it vanished remotely
///
/// `collected` is the index entry captured when the deletion was decided.
/// The live local file must still match it, otherwise the user touched the
/// file in the meantime and it is kept.
pub fn should_remove_local(
	map: &FileMap,
	matchers: &Matchers,
	root: &Path,
	collected: &FileInformation,
) -> bool {
	let name = collected.name.as_str();
	if matchers.is_excluded(name, collected.is_directory)
		|| matchers.is_download_excluded(name, collected.is_directory)
	{
		return false;
	}

	let Some(tracked) = map.get(name) else {
		return false;
	};
	let Some(path) = absolute_path(root, name) else {
		return false;
	};
	let Ok(stat) = fs::symlink_metadata(&path) else {
		return false;
	};

	if stat.file_type().is_symlink() {
		return true;
	}
	if stat.is_dir() != tracked.is_directory {
		return false;
	}
	if stat.is_dir() {
		return true;
	}

	if tracked.size != collected.size || tracked.mtime != collected.mtime {
		return false;
	}
	let live = FileInformation::from_metadata(name, &stat);
	live.size == collected.size && live.mtime <= collected.mtime
}

/// Should a remote path be deleted because it vanished locally
pub fn should_remove_remote(map: &FileMap, matchers: &Matchers, name: &str) -> bool {
	let Some(tracked) = map.get(name) else {
		return false;
	};
	if tracked.is_symbolic_link {
		return false;
	}
	!(matchers.is_excluded(name, tracked.is_directory)
		|| matchers.is_upload_excluded(name, tracked.is_directory))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::index::FileIndex;
	use crate::types::ChangeType;
	use filetime::{set_file_mtime, FileTime};
	use tempfile::TempDir;

	fn file(name: &str, size: i64, mtime: i64) -> FileInformation {
		FileInformation { name: name.into(), size, mtime, ..Default::default() }
	}

	fn change(path: &str, size: i64, mtime: i64) -> Change {
		Change {
			change_type: ChangeType::Change,
			path: path.into(),
			size,
			mtime_unix: mtime,
			mtime_unix_nano: 0,
			is_dir: false,
			mode: None,
			uid: None,
			gid: None,
		}
	}

	fn matchers(exclude: &[&str], upload: &[&str], download: &[&str]) -> Matchers {
		let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
		Matchers::compile(&owned(exclude), &owned(upload), &owned(download)).unwrap()
	}

	#[test]
	fn test_should_upload_untracked_and_unchanged() {
		let index = FileIndex::new();
		let none = Matchers::default();
		let mut map = index.lock();

		assert!(should_upload(&map, &none, &file("a.txt", 3, 100), false));

		map.set(file("a.txt", 3, 100));
		assert!(!should_upload(&map, &none, &file("a.txt", 3, 100), false));
		assert!(should_upload(&map, &none, &file("a.txt", 3, 101), false));
		assert!(should_upload(&map, &none, &file("a.txt", 4, 100), false));
	}

	#[test]
	fn test_should_upload_initial_tolerance() {
		let index = FileIndex::new();
		let none = Matchers::default();
		let mut map = index.lock();
		map.set(file("a.txt", 3, 100));

		assert!(!should_upload(&map, &none, &file("a.txt", 3, 101), true));
		assert!(should_upload(&map, &none, &file("a.txt", 3, 102), true));
		assert!(!should_upload(&map, &none, &file("a.txt", 3, 99), true));
		assert!(should_upload(&map, &none, &file("a.txt", 3, 98), true));
		assert!(should_upload(&map, &none, &file("a.txt", 4, 100), true));
	}

	#[test]
	fn test_should_upload_directories_and_symlinks() {
		let index = FileIndex::new();
		let none = Matchers::default();
		let mut map = index.lock();
		map.set(FileInformation::directory("src"));

		let dir = FileInformation::directory("src");
		assert!(!should_upload(&map, &none, &dir, false));
		assert!(should_upload(&map, &none, &dir, true));

		let mut link = file("link", 0, 100);
		link.is_symbolic_link = true;
		assert!(!should_upload(&map, &none, &link, false));
	}

	#[test]
	fn test_should_upload_respects_excludes() {
		let index = FileIndex::new();
		let m = matchers(&["*.log"], &["dist/"], &["uploads/"]);
		let map = index.lock();

		assert!(!should_upload(&map, &m, &file("app.log", 1, 1), false));
		assert!(!should_upload(&map, &m, &file("dist/a.js", 1, 1), false));
		assert!(should_upload(&map, &m, &file("uploads/a.png", 1, 1), false));
	}

	#[test]
	fn test_should_download() {
		let index = FileIndex::new();
		let m = matchers(&["*.log"], &[], &["cache/"]);
		let mut map = index.lock();

		assert!(should_download(&map, &m, &change("new.txt", 1, 100)));
		assert!(!should_download(&map, &m, &change("x.log", 1, 100)));
		assert!(!should_download(&map, &m, &change("cache/x", 1, 100)));

		map.set(file("f", 10, 100));
		assert!(!should_download(&map, &m, &change("f", 10, 100)));
		assert!(!should_download(&map, &m, &change("f", 10, 99)));
		assert!(should_download(&map, &m, &change("f", 10, 101)));
		assert!(should_download(&map, &m, &change("f", 11, 100)));

		map.set(FileInformation::directory("d"));
		let mut dir = change("d", 0, 200);
		dir.is_dir = true;
		assert!(!should_download(&map, &m, &dir));

		let mut link = file("l", 0, 1);
		link.is_symbolic_link = true;
		map.set(link);
		assert!(!should_download(&map, &m, &change("l", 5, 500)));
	}

	#[test]
	fn test_should_remove_remote() {
		let index = FileIndex::new();
		let m = matchers(&[], &["keep/"], &[]);
		let mut map = index.lock();

		assert!(!should_remove_remote(&map, &m, "untracked"));

		map.set(file("gone.txt", 1, 1));
		assert!(should_remove_remote(&map, &m, "gone.txt"));

		map.set(file("keep/a", 1, 1));
		assert!(!should_remove_remote(&map, &m, "keep/a"));

		let mut link = file("link", 0, 1);
		link.is_symbolic_link = true;
		map.set(link);
		assert!(!should_remove_remote(&map, &m, "link"));
	}

	#[test]
	fn test_should_remove_local_requires_unchanged_file() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("f.txt");
		std::fs::write(&path, b"hello").unwrap();
		set_file_mtime(&path, FileTime::from_unix_time(1_000, 0)).unwrap();

		let index = FileIndex::new();
		let none = Matchers::default();
		let mut map = index.lock();
		let collected = file("f.txt", 5, 1_000);
		map.set(collected.clone());

		assert!(should_remove_local(&map, &none, dir.path(), &collected));

		// user modified the file after the deletion was decided
		set_file_mtime(&path, FileTime::from_unix_time(2_000, 0)).unwrap();
		assert!(!should_remove_local(&map, &none, dir.path(), &collected));
	}

	#[test]
	fn test_should_remove_local_untracked_or_missing() {
		let dir = TempDir::new().unwrap();
		let index = FileIndex::new();
		let none = Matchers::default();
		let mut map = index.lock();

		let collected = file("missing.txt", 1, 1);
		assert!(!should_remove_local(&map, &none, dir.path(), &collected));
		map.set(collected.clone());
		assert!(!should_remove_local(&map, &none, dir.path(), &collected));

		std::fs::create_dir(dir.path().join("sub")).unwrap();
		let sub = FileInformation::directory("sub");
		map.set(sub.clone());
		assert!(should_remove_local(&map, &none, dir.path(), &sub));

		let protected = matchers(&[], &[], &["sub/"]);
		assert!(!should_remove_local(&map, &protected, dir.path(), &sub));
	}
}

// vim: ts=4
