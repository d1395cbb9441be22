//! Watches on symlink targets
//!
//! The tree watcher does not descend through symlinks. Every link to content
//! outside the watched tree gets its own watcher on the resolved target;
//! event paths are rewritten back below the link's logical location and fed
//! into the upstream queue like any other event.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::upstream::EventQueue;
use crate::logging::*;

struct SymlinkWatch {
	target: PathBuf,
	_watcher: RecommendedWatcher,
}

/// Active symlink watches keyed by the link's index name
pub struct Symlinks {
	root: PathBuf,
	queue: EventQueue,
	links: Mutex<BTreeMap<String, SymlinkWatch>>,
}

impl Symlinks {
	pub fn new(root: impl Into<PathBuf>, queue: EventQueue) -> Self {
		Symlinks { root: root.into(), queue, links: Mutex::new(BTreeMap::new()) }
	}

	pub fn contains(&self, name: &str) -> bool {
		self.links.lock().unwrap_or_else(PoisonError::into_inner).contains_key(name)
	}

	/// Watch `target` on behalf of the link at `name`
	pub fn add(&self, name: &str, target: &Path) -> notify::Result<()> {
		if self.contains(name) {
			return Ok(());
		}

		let logical = self.root.join(name);
		let source = target.to_path_buf();
		let queue = self.queue.clone();
		let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
			match res {
				Ok(event) => {
					for path in event.paths {
						if let Ok(rest) = path.strip_prefix(&source) {
							queue.push_path(logical.join(rest));
						}
					}
				}
				Err(e) => {
					warn!("[upstream] Symlink watch error: {}", e);
					queue.overflow();
				}
			}
		})?;
		let mode =
			if target.is_dir() { RecursiveMode::Recursive } else { RecursiveMode::NonRecursive };
		watcher.watch(target, mode)?;

		info!("[upstream] Symlink found at {}", name);
		self.links
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(name.to_string(), SymlinkWatch { target: target.to_path_buf(), _watcher: watcher });
		Ok(())
	}

	/// Drop the watches of `name` and every link below it
	pub fn remove_under(&self, name: &str) {
		let prefix = format!("{}/", name);
		let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
		links.retain(|key, watch| {
			let keep = key != name && !key.starts_with(&prefix);
			if !keep {
				debug!("[upstream] Stop watching {:?} for {}", watch.target, key);
			}
			keep
		});
	}
}

// vim: ts=4
