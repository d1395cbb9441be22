//! Shared file index
//!
//! One map from relative path to last-known metadata, consulted by both legs
//! to decide whether a path needs transfer. All access goes through a single
//! lock; the guard is a plain `std::sync::MutexGuard`, so it can never be held
//! across an `.await`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::{parent_name, FileInformation};

/// Entries of the index, only reachable through [`FileIndex::lock`]
#[derive(Debug, Default)]
pub struct FileMap {
	entries: BTreeMap<String, FileInformation>,
}

impl FileMap {
	pub fn get(&self, name: &str) -> Option<&FileInformation> {
		self.entries.get(name)
	}

	pub fn contains(&self, name: &str) -> bool {
		self.entries.contains_key(name)
	}

	pub fn set(&mut self, info: FileInformation) {
		self.entries.insert(info.name.clone(), info);
	}

	pub fn delete(&mut self, name: &str) -> Option<FileInformation> {
		self.entries.remove(name)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&String, &FileInformation)> {
		self.entries.iter()
	}

	/// Insert directory entries for `name` and every ancestor not yet present
	pub fn create_dir_in_file_map(&mut self, name: &str) {
		let mut current = Some(name.trim_matches('/'));
		while let Some(dir) = current {
			if dir.is_empty() || dir == "." {
				break;
			}
			if !self.entries.contains_key(dir) {
				self.entries.insert(dir.to_string(), FileInformation::directory(dir));
			}
			current = parent_name(dir);
		}
	}

	/// Remove `name` and every entry below it
	///
	/// Linear in the number of entries; subtree removal is rare compared to
	/// lookups.
	pub fn remove_dir_in_file_map(&mut self, name: &str) {
		let prefix = format!("{}/", name);
		self.entries.retain(|key, _| key != name && !key.starts_with(&prefix));
	}
}

/// Session-wide handle to the shared file map
#[derive(Debug, Clone, Default)]
pub struct FileIndex {
	inner: Arc<Mutex<FileMap>>,
}

impl FileIndex {
	pub fn new() -> Self {
		Self::default()
	}

	/// Acquire the index lock
	///
	/// A poisoned lock still yields the map: every mutation is a single
	/// insert or retain, so the map is never left half-updated.
	pub fn lock(&self) -> MutexGuard<'_, FileMap> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Run `f` with the lock held
	pub fn with_lock<R>(&self, f: impl FnOnce(&mut FileMap) -> R) -> R {
		let mut guard = self.lock();
		f(&mut guard)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn file(name: &str) -> FileInformation {
		FileInformation { name: name.into(), size: 1, mtime: 10, ..Default::default() }
	}

	#[test]
	fn test_subtree_removal_keeps_siblings_with_common_prefix() {
		let index = FileIndex::new();
		index.with_lock(|map| {
			map.set(FileInformation::directory("/a"));
			map.set(file("/a/b"));
			map.set(file("/a2"));
			map.remove_dir_in_file_map("/a");
		});

		let map = index.lock();
		assert_eq!(map.len(), 1);
		assert!(map.contains("/a2"));
	}

	#[test]
	fn test_create_dir_synthesizes_ancestors() {
		let index = FileIndex::new();
		let mut map = index.lock();
		map.set(file("x/y"));
		map.create_dir_in_file_map("a/b/c");

		assert!(map.get("a").unwrap().is_directory);
		assert!(map.get("a/b").unwrap().is_directory);
		assert!(map.get("a/b/c").unwrap().is_directory);
		assert_eq!(map.len(), 4);
	}

	#[test]
	fn test_create_dir_does_not_overwrite_existing_entries() {
		let index = FileIndex::new();
		let mut map = index.lock();
		let mut link = file("a");
		link.is_symbolic_link = true;
		map.set(link);
		map.create_dir_in_file_map("a/b");

		assert!(map.get("a").unwrap().is_symbolic_link);
		assert!(map.get("a/b").unwrap().is_directory);
	}

	#[test]
	fn test_get_set_delete() {
		let index = FileIndex::new();
		let clone = index.clone();
		clone.lock().set(file("f"));
		assert_eq!(index.lock().get("f").map(|f| f.size), Some(1));
		assert!(index.lock().delete("f").is_some());
		assert!(index.lock().is_empty());
	}
}

// vim: ts=4
