//! Filesystem helpers shared by the walkers

use std::fs;
use std::io;
use std::path::Path;

/// The path vanished (or a parent turned into a file) while we looked at it
///
/// Such errors mean "nothing to do" and are never escalated.
pub fn is_stale(e: &io::Error) -> bool {
	e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(libc::ENOTDIR)
}

/// A link pointing at one of its own ancestors would make a walk endless
pub fn is_recursive_symlink(path: &Path) -> bool {
	let (Ok(target), Some(parent)) = (fs::canonicalize(path), path.parent()) else {
		return false;
	};
	fs::canonicalize(parent).is_ok_and(|parent| parent.starts_with(&target))
}


// vim: ts=4
