//! Remote tree snapshots
//!
//! A [`ChangeSource`] produces the full current state of the served tree. The
//! diff and batching logic in the downstream service does not care whether the
//! snapshot came from a fresh walk or from an event-maintained cache.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, TrySendError};
use std::sync::Arc;

use crate::config::is_state_path;
use crate::exclusion::IgnoreMatcher;
use crate::logging::*;
use crate::types::{absolute_path, relative_name, Change, ChangeType};
use crate::util::{is_recursive_symlink, is_stale};

/// Full state of a tree keyed by relative path
pub type Snapshot = BTreeMap<String, Change>;

/// Supplier of tree snapshots
pub trait ChangeSource: Send {
	/// Current state of the whole tree
	fn produce_snapshot(&mut self) -> io::Result<Snapshot>;

	/// Whether the tree may have changed since the last snapshot
	///
	/// Sources that cannot tell always answer `true`.
	fn dirty(&self) -> bool;
}

/// Walks the whole tree on every snapshot
pub struct PollingSource {
	root: PathBuf,
	matcher: Option<Arc<dyn IgnoreMatcher>>,
}

impl PollingSource {
	pub fn new(root: impl Into<PathBuf>, matcher: Option<Arc<dyn IgnoreMatcher>>) -> Self {
		PollingSource { root: root.into(), matcher }
	}
}

impl ChangeSource for PollingSource {
	fn produce_snapshot(&mut self) -> io::Result<Snapshot> {
		let mut snapshot = Snapshot::new();
		walk_into(&self.root, "", self.matcher.as_deref(), &mut snapshot)?;
		Ok(snapshot)
	}

	fn dirty(&self) -> bool {
		true
	}
}

/// Keeps a cached snapshot up to date from filesystem events
///
/// Dirty paths are queued in a bounded channel. When the queue overflows,
/// events are lost and the next snapshot falls back to a full walk.
pub struct NotifySource {
	root: PathBuf,
	matcher: Option<Arc<dyn IgnoreMatcher>>,
	cache: Option<Snapshot>,
	events: Receiver<PathBuf>,
	pending: Arc<AtomicBool>,
	overflow: Arc<AtomicBool>,
	_watcher: RecommendedWatcher,
}

impl NotifySource {
	pub fn new(
		root: impl Into<PathBuf>,
		matcher: Option<Arc<dyn IgnoreMatcher>>,
		queue_size: usize,
	) -> notify::Result<Self> {
		let root = root.into();
		let (tx, events) = sync_channel(queue_size.max(1));
		let pending = Arc::new(AtomicBool::new(false));
		let overflow = Arc::new(AtomicBool::new(false));

		let (pending_flag, overflow_flag) = (pending.clone(), overflow.clone());
		let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
			let paths = match res {
				Ok(event) => event.paths,
				Err(e) => {
					warn!("Watch error: {}", e);
					overflow_flag.store(true, Ordering::SeqCst);
					pending_flag.store(true, Ordering::SeqCst);
					return;
				}
			};
			for path in paths {
				if let Err(TrySendError::Full(_)) = tx.try_send(path) {
					overflow_flag.store(true, Ordering::SeqCst);
				}
			}
			pending_flag.store(true, Ordering::SeqCst);
		})?;
		watcher.watch(&root, RecursiveMode::Recursive)?;

		Ok(NotifySource { root, matcher, cache: None, events, pending, overflow, _watcher: watcher })
	}

	fn full_walk(&mut self) -> io::Result<()> {
		while self.events.try_recv().is_ok() {}
		let mut snapshot = Snapshot::new();
		walk_into(&self.root, "", self.matcher.as_deref(), &mut snapshot)?;
		self.cache = Some(snapshot);
		Ok(())
	}
}

impl ChangeSource for NotifySource {
	fn produce_snapshot(&mut self) -> io::Result<Snapshot> {
		self.pending.store(false, Ordering::SeqCst);
		if self.overflow.swap(false, Ordering::SeqCst) {
			info!("Event queue overflowed, rescanning {:?}", self.root);
			self.full_walk()?;
		}
		let Some(mut cache) = self.cache.take() else {
			self.full_walk()?;
			return Ok(self.cache.clone().unwrap_or_default());
		};

		let mut dirty = BTreeSet::new();
		while let Ok(path) = self.events.try_recv() {
			if let Some(name) = relative_name(&self.root, &path).filter(|n| !is_state_path(n)) {
				dirty.insert(name);
			}
		}

		if dirty.contains("") {
			self.full_walk()?;
			return Ok(self.cache.clone().unwrap_or_default());
		}
		for name in dirty {
			refresh(&self.root, &name, self.matcher.as_deref(), &mut cache)?;
		}
		self.cache = Some(cache.clone());
		Ok(cache)
	}

	fn dirty(&self) -> bool {
		self.cache.is_none()
			|| self.pending.load(Ordering::SeqCst)
			|| self.overflow.load(Ordering::SeqCst)
	}
}

/// Re-stat one path in a cached snapshot, replacing its subtree
fn refresh(
	root: &Path,
	name: &str,
	matcher: Option<&dyn IgnoreMatcher>,
	cache: &mut Snapshot,
) -> io::Result<()> {
	let prefix = format!("{}/", name);
	cache.retain(|key, _| key != name && !key.starts_with(&prefix));

	let Some(path) = absolute_path(root, name) else {
		return Ok(());
	};
	let stat = match fs::metadata(&path) {
		Ok(stat) => stat,
		Err(e) if is_stale(&e) => return Ok(()),
		Err(e) => return Err(e),
	};
	let is_dir = stat.is_dir();
	if let Some(matcher) = matcher {
		if matcher.matches(name, is_dir) {
			if is_dir && matcher.require_full_scan() {
				walk_into(&path, name, Some(matcher), cache)?;
			}
			return Ok(());
		}
	}
	cache.insert(name.to_string(), change_from_metadata(name, &stat));
	if is_dir {
		walk_into(&path, name, matcher, cache)?;
	}
	Ok(())
}

/// Walk `dir` (whose index key is `name`) and add every entry below it
///
/// Symlinks are followed; dangling and self-referencing links are skipped.
/// Ignored directories are pruned unless the matcher requires a full scan.
/// The state directory is never listed.
pub fn walk_into(
	dir: &Path,
	name: &str,
	matcher: Option<&dyn IgnoreMatcher>,
	snapshot: &mut Snapshot,
) -> io::Result<()> {
	let entries = match fs::read_dir(dir) {
		Ok(entries) => entries,
		Err(e) if is_stale(&e) => return Ok(()),
		Err(e) => return Err(e),
	};

	for entry in entries.flatten() {
		let file_name = entry.file_name();
		let Some(file_name) = file_name.to_str() else {
			continue;
		};
		let child_name =
			if name.is_empty() { file_name.to_string() } else { format!("{}/{}", name, file_name) };
		if is_state_path(&child_name) {
			continue;
		}
		let child_path = entry.path();

		let Ok(stat) = fs::metadata(&child_path) else {
			continue;
		};
		if entry.file_type().is_ok_and(|t| t.is_symlink()) && is_recursive_symlink(&child_path) {
			continue;
		}

		let is_dir = stat.is_dir();
		if let Some(matcher) = matcher {
			if matcher.matches(&child_name, is_dir) {
				if is_dir && matcher.require_full_scan() {
					walk_into(&child_path, &child_name, Some(matcher), snapshot)?;
				}
				continue;
			}
		}

		snapshot.insert(child_name.clone(), change_from_metadata(&child_name, &stat));
		if is_dir {
			walk_into(&child_path, &child_name, matcher, snapshot)?;
		}
	}
	Ok(())
}

fn change_from_metadata(name: &str, stat: &fs::Metadata) -> Change {
	Change {
		change_type: ChangeType::Change,
		path: name.to_string(),
		size: if stat.is_dir() { 0 } else { stat.len() as i64 },
		mtime_unix: stat.mtime(),
		mtime_unix_nano: stat.mtime_nsec(),
		is_dir: stat.is_dir(),
		mode: Some(stat.mode() & 0o7777),
		uid: Some(stat.uid()),
		gid: Some(stat.gid()),
	}
}

/// Changes turning `old` into `new`
///
/// Results come in path order, so a directory always precedes its content.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Vec<Change> {
	let mut changes: Vec<Change> = new
		.values()
		.filter(|entry| !matches!(old.get(&entry.path), Some(prev) if prev.same_state(entry)))
		.cloned()
		.collect();

	changes.extend(old.values().filter(|entry| !new.contains_key(&entry.path)).map(|entry| {
		Change { change_type: ChangeType::Delete, ..entry.clone() }
	}));
	changes
}


// vim: ts=4
