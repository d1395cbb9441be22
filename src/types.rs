//! Core data types shared by both sync legs

use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

/// Last-known metadata of one path under the sync root
///
/// `mtime` holds whole seconds. For local files it is the ceiling of the real
/// modification time, for remote entries it is what the remote reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInformation {
	/// POSIX path relative to the sync root, no leading slash
	pub name: String,
	pub size: i64,
	pub mtime: i64,
	pub mtime_nano: i64,
	pub is_directory: bool,
	pub is_symbolic_link: bool,

	/// Metadata was obtained by following a symlink on the way
	#[serde(default)]
	pub resolved_link: bool,

	/// Direct children count, only filled in by the local walk
	#[serde(default)]
	pub files: usize,

	/// Mode bits of the local file (permission bits only)
	#[serde(default)]
	pub mode: u32,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub remote_mode: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub remote_uid: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub remote_gid: Option<u32>,
}

impl FileInformation {
	/// Build from a local stat result, rounding mtime up to the next second
	pub fn from_metadata(name: impl Into<String>, meta: &Metadata) -> Self {
		let mtime_nano = meta.mtime_nsec();
		FileInformation {
			name: name.into(),
			size: meta.len() as i64,
			mtime: ceil_mtime(meta.mtime(), mtime_nano),
			mtime_nano,
			is_directory: meta.is_dir(),
			is_symbolic_link: meta.file_type().is_symlink(),
			mode: meta.mode() & 0o7777,
			..Default::default()
		}
	}

	/// Build an index entry from a remote change record
	pub fn from_change(change: &Change) -> Self {
		FileInformation {
			name: change.path.clone(),
			size: change.size,
			mtime: change.mtime_unix,
			mtime_nano: change.mtime_unix_nano,
			is_directory: change.is_dir,
			remote_mode: change.mode,
			remote_uid: change.uid,
			remote_gid: change.gid,
			..Default::default()
		}
	}

	/// Directory placeholder used when synthesizing ancestors
	pub fn directory(name: impl Into<String>) -> Self {
		FileInformation { name: name.into(), is_directory: true, ..Default::default() }
	}
}

/// Kind of a remote change record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
	#[serde(rename = "CHANGE")]
	Change,
	#[serde(rename = "DELETE")]
	Delete,
}

/// Wire-level change record produced by the remote diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
	pub change_type: ChangeType,
	pub path: String,
	pub size: i64,
	pub mtime_unix: i64,
	pub mtime_unix_nano: i64,
	pub is_dir: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mode: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub uid: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gid: Option<u32>,
}

impl Change {
	/// Same metadata, regardless of change type
	pub fn same_state(&self, other: &Change) -> bool {
		self.size == other.size
			&& self.mtime_unix == other.mtime_unix
			&& self.mtime_unix_nano == other.mtime_unix_nano
			&& self.is_dir == other.is_dir
			&& self.mode == other.mode
	}
}

/// Round a (seconds, nanoseconds) timestamp up to whole seconds
///
/// The remote side reports second resolution, so a local file written at
/// `t.5` must compare equal to a remote copy stamped `t+1`.
pub fn ceil_mtime(secs: i64, nanos: i64) -> i64 {
	if nanos > 0 {
		secs + 1
	} else {
		secs
	}
}

/// Convert an absolute path below `root` into an index key
pub fn relative_name(root: &Path, path: &Path) -> Option<String> {
	let rel = path.strip_prefix(root).ok()?;
	let mut parts = Vec::new();
	for component in rel.components() {
		match component {
			Component::Normal(part) => parts.push(part.to_str()?.to_string()),
			Component::CurDir => {}
			_ => return None,
		}
	}
	Some(parts.join("/"))
}

/// Resolve an index key against `root`
///
/// Keys containing `..` or absolute components are rejected.
pub fn absolute_path(root: &Path, name: &str) -> Option<PathBuf> {
	let mut path = root.to_path_buf();
	for part in name.split('/') {
		match part {
			"" | "." => {}
			".." => return None,
			_ => path.push(part),
		}
	}
	Some(path)
}

/// Parent key of an index key, `None` for top-level entries
pub fn parent_name(name: &str) -> Option<&str> {
	let trimmed = name.trim_end_matches('/');
	trimmed.rfind('/').map(|pos| &trimmed[..pos]).filter(|p| !p.is_empty())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_ceil_mtime() {
		assert_eq!(ceil_mtime(100, 0), 100);
		assert_eq!(ceil_mtime(100, 1), 101);
		assert_eq!(ceil_mtime(100, 999_999_999), 101);
	}

	#[test]
	fn test_relative_name() {
		let root = Path::new("/work/project");
		assert_eq!(relative_name(root, Path::new("/work/project/a/b.txt")), Some("a/b.txt".into()));
		assert_eq!(relative_name(root, Path::new("/work/project")), Some(String::new()));
		assert_eq!(relative_name(root, Path::new("/work/other/x")), None);
	}

	#[test]
	fn test_absolute_path_rejects_parent_components() {
		let root = Path::new("/srv");
		assert_eq!(absolute_path(root, "a/b"), Some(PathBuf::from("/srv/a/b")));
		assert_eq!(absolute_path(root, "/a"), Some(PathBuf::from("/srv/a")));
		assert_eq!(absolute_path(root, "a/../../etc"), None);
	}

	#[test]
	fn test_parent_name() {
		assert_eq!(parent_name("a/b/c"), Some("a/b"));
		assert_eq!(parent_name("a"), None);
	}

	#[test]
	fn test_change_wire_format() {
		let change = Change {
			change_type: ChangeType::Delete,
			path: "src/main.rs".into(),
			size: 12,
			mtime_unix: 1700000000,
			mtime_unix_nano: 0,
			is_dir: false,
			mode: None,
			uid: None,
			gid: None,
		};
		let json = serde_json::to_string(&change).unwrap();
		assert!(json.contains("\"changeType\":\"DELETE\""));
		assert!(json.contains("\"mtimeUnix\":1700000000"));
		assert!(!json.contains("mode"));
	}
}

// vim: ts=4
