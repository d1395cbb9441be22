//! Initial reconciliation
//!
//! Runs once per session, after the index has been seeded with the remote
//! tree. The local walk and the remote state are compared path by path and
//! turned into an [`InitialPlan`]: what to upload, what to download and, for
//! the mirror strategies, what to delete on the other side. Both legs of the
//! plan then run concurrently and report completion independently.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{SyncError, SyncResult};
use crate::exclusion::Matchers;
use crate::index::{FileIndex, FileMap};
use crate::logging::*;
use crate::strategies::{CompareBy, InitialSyncStrategy};
use crate::types::FileInformation;
use crate::util::{is_recursive_symlink, is_stale};

/// Outcome of comparing one local path with the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
	Upload,
	Download,
	NoAction,
}

/// Result of the local walk
#[derive(Debug, Default)]
pub struct LocalState {
	/// Every reachable path, symlinks resolved to their targets
	pub files: BTreeMap<String, FileInformation>,

	/// Symlinks met on the way: logical name and resolved target
	pub symlinks: Vec<(String, PathBuf)>,
}

/// What the initial reconciliation transfers
#[derive(Debug, Default, PartialEq)]
pub struct InitialPlan {
	/// Local entries to upload
	pub upload: Vec<FileInformation>,

	/// Remote entries to download
	pub download: Vec<FileInformation>,

	/// Remote paths to delete (mirror-local only)
	pub remove_remote: Vec<String>,

	/// Local entries to delete (mirror-remote only)
	pub remove_local: Vec<FileInformation>,
}

impl InitialPlan {
	pub fn is_empty(&self) -> bool {
		self.upload.is_empty()
			&& self.download.is_empty()
			&& self.remove_remote.is_empty()
			&& self.remove_local.is_empty()
	}
}

/// Upload side of the initial run
#[async_trait]
pub trait UploadLeg: Send + Sync {
	async fn initial_upload(
		&self,
		uploads: Vec<FileInformation>,
		removals: Vec<String>,
	) -> SyncResult<()>;
}

/// Download side of the initial run
#[async_trait]
pub trait DownloadLeg: Send + Sync {
	async fn initial_download(
		&self,
		downloads: Vec<FileInformation>,
		removals: Vec<FileInformation>,
	) -> SyncResult<()>;
}

/// One-shot reconciliation of the local tree with the remote one
pub struct InitialSyncer {
	root: PathBuf,
	strategy: InitialSyncStrategy,
	compare_by: CompareBy,
	matchers: Matchers,
}

impl InitialSyncer {
	pub fn new(
		root: impl Into<PathBuf>,
		strategy: InitialSyncStrategy,
		compare_by: CompareBy,
		matchers: Matchers,
	) -> Self {
		InitialSyncer { root: root.into(), strategy, compare_by, matchers }
	}

	/// Walk the local tree, see [`walk_local_tree`]
	pub fn calculate_local_state(&self) -> std::io::Result<LocalState> {
		walk_local_tree(&self.root, &self.matchers)
	}

	/// Decide the transfer for one local path against the index
	pub fn decide(&self, map: &FileMap, local: &FileInformation) -> Action {
		if local.is_symbolic_link || self.matchers.is_excluded(&local.name, local.is_directory) {
			return Action::NoAction;
		}
		let Some(tracked) = map.get(&local.name) else {
			return Action::Upload;
		};
		if local.is_directory || tracked.is_directory || tracked.is_symbolic_link {
			return Action::NoAction;
		}

		// same tolerance as should_upload during the initial sync
		let mtime_diff = local.mtime - tracked.mtime;
		if tracked.size == local.size
			&& (mtime_diff.abs() <= 1 || self.compare_by == CompareBy::Size)
		{
			return Action::NoAction;
		}

		match self.strategy.effective() {
			InitialSyncStrategy::PreferLocal => Action::Upload,
			InitialSyncStrategy::PreferRemote => Action::Download,
			InitialSyncStrategy::PreferNewest => {
				if mtime_diff > 0 {
					Action::Upload
				} else if mtime_diff < 0 {
					Action::Download
				} else {
					Action::NoAction
				}
			}
			_ => Action::NoAction,
		}
	}

	/// Compare both trees and build the transfer plan
	///
	/// `remote` is the remote tree as seeded into `index`. Upload-excluded
	/// local files that win under the strategy are written into the index
	/// here, so the download leg leaves them alone.
	pub fn plan(
		&self,
		mut remote: BTreeMap<String, FileInformation>,
		local: &LocalState,
		index: &FileIndex,
	) -> InitialPlan {
		let strategy = self.strategy.effective();
		remote.retain(|name, info| !self.matchers.is_excluded(name, info.is_directory));

		let mut plan = InitialPlan::default();
		let mut upload = Vec::new();
		{
			let mut map = index.lock();
			for (name, info) in &local.files {
				if self.matchers.is_upload_excluded(name, info.is_directory) {
					let local_wins = map.get(name).is_some_and(|tracked| {
						strategy == InitialSyncStrategy::PreferLocal
							|| (strategy == InitialSyncStrategy::PreferNewest
								&& tracked.mtime < info.mtime)
					});
					if local_wins {
						let mut entry = info.clone();
						if let Some(tracked) = map.get(name) {
							entry.remote_mode = tracked.remote_mode;
							entry.remote_uid = tracked.remote_uid;
							entry.remote_gid = tracked.remote_gid;
						}
						map.set(entry);
						remote.remove(name);
					}
					continue;
				}

				let action = self.decide(&map, info);
				if info.is_directory {
					remote.remove(name);
					if action == Action::Upload
						&& (info.files == 0 || self.strategy == InitialSyncStrategy::MirrorRemote)
					{
						upload.push(info.clone());
					}
					continue;
				}
				match action {
					Action::Upload => {
						remote.remove(name);
						upload.push(info.clone());
					}
					Action::NoAction => {
						remote.remove(name);
					}
					Action::Download => {}
				}
			}
		}

		// mirror-remote: local-only paths go away unless download-excluded
		if self.strategy == InitialSyncStrategy::MirrorRemote {
			for info in upload {
				if self.matchers.is_download_excluded(&info.name, info.is_directory) {
					if !info.is_directory || info.files == 0 {
						plan.upload.push(info);
					}
				} else {
					plan.remove_local.push(info);
				}
			}
		} else {
			plan.upload = upload;
		}

		// whatever is left exists remotely only, or lost a conflict locally
		if self.strategy == InitialSyncStrategy::MirrorLocal {
			let mut removed_dir: Option<String> = None;
			for (name, info) in remote {
				if self.matchers.is_upload_excluded(&name, info.is_directory) {
					plan.download.push(info);
					continue;
				}
				if removed_dir.as_ref().is_some_and(|dir| name.starts_with(&format!("{}/", dir))) {
					continue;
				}
				if info.is_directory {
					removed_dir = Some(name.clone());
				}
				plan.remove_remote.push(name);
			}
		} else {
			plan.download = remote
				.into_values()
				.filter(|info| !self.matchers.is_download_excluded(&info.name, info.is_directory))
				.collect();
		}

		info!(
			"[initial] Plan: upload {}, download {}, remove remote {}, remove local {}",
			plan.upload.len(),
			plan.download.len(),
			plan.remove_remote.len(),
			plan.remove_local.len()
		);
		plan
	}

	/// Run both legs of `plan` concurrently
	///
	/// Each completion callback fires as soon as its own leg finished
	/// successfully; the first failing leg aborts the run.
	pub async fn run<U, D, FU, FD>(
		&self,
		plan: InitialPlan,
		upstream: &U,
		downstream: &D,
		on_upstream_done: FU,
		on_downstream_done: FD,
	) -> SyncResult<()>
	where
		U: UploadLeg + ?Sized,
		D: DownloadLeg + ?Sized,
		FU: FnOnce() + Send,
		FD: FnOnce() + Send,
	{
		let InitialPlan { upload, download, remove_remote, remove_local } = plan;

		let up = async {
			upstream.initial_upload(upload, remove_remote).await?;
			info!("[initial] Upstream done");
			on_upstream_done();
			Ok::<(), SyncError>(())
		};
		let down = async {
			downstream.initial_download(download, remove_local).await?;
			info!("[initial] Downstream done");
			on_downstream_done();
			Ok::<(), SyncError>(())
		};
		tokio::try_join!(up, down)?;
		Ok(())
	}
}

/// Walk the tree below `root`
///
/// Blocking; run it on the blocking pool. Symlinks are followed and reported
/// in [`LocalState::symlinks`]. Excluded directories are pruned unless a
/// matcher needs a full scan. Upload-excluded paths are recorded too: the
/// initial plan may still refresh their index entries.
pub fn walk_local_tree(root: &Path, matchers: &Matchers) -> std::io::Result<LocalState> {
	let mut state = LocalState::default();
	walk_dir(matchers, root, "", &mut state)?;
	Ok(state)
}

/// Returns the number of recorded children
fn walk_dir(
	matchers: &Matchers,
	dir: &Path,
	name: &str,
	state: &mut LocalState,
) -> std::io::Result<usize> {
	let entries = match fs::read_dir(dir) {
		Ok(entries) => entries,
		Err(e) if is_stale(&e) => return Ok(0),
		Err(e) if name.is_empty() => return Err(e),
		Err(e) => {
			info!("Couldn't read dir {}: {}", name, e);
			return Ok(0);
		}
	};

	let mut recorded = 0;
	for entry in entries.flatten() {
		let file_name = entry.file_name();
		let Some(file_name) = file_name.to_str() else {
			warn!("Skipping non UTF-8 name in {:?}", dir);
			continue;
		};
		let child_name =
			if name.is_empty() { file_name.to_string() } else { format!("{}/{}", name, file_name) };
		let child_path = entry.path();

		let is_link = entry.file_type().is_ok_and(|t| t.is_symlink());
		if is_link && is_recursive_symlink(&child_path) {
			debug!("Found recursive symlink at {}", child_name);
			continue;
		}
		// follows links; dangling links and vanished paths are skipped
		let Ok(stat) = fs::metadata(&child_path) else {
			continue;
		};

		let is_dir = stat.is_dir();
		if matchers.is_excluded(&child_name, is_dir) {
			if is_dir && matchers.require_full_scan() {
				walk_dir(matchers, &child_path, &child_name, state)?;
			}
			continue;
		}

		let mut info = FileInformation::from_metadata(child_name.as_str(), &stat);
		if is_link {
			info.resolved_link = true;
			if !matchers.is_upload_excluded(&child_name, is_dir) {
				match fs::canonicalize(&child_path) {
					Ok(target) => state.symlinks.push((child_name.clone(), target)),
					Err(e) => debug!("Cannot resolve {}: {}", child_name, e),
				}
			}
		}
		if is_dir {
			info.files = walk_dir(matchers, &child_path, &child_name, state)?;
		}
		state.files.insert(child_name, info);
		recorded += 1;
	}
	Ok(recorded)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::decision::should_upload;
	use filetime::{set_file_mtime, FileTime};
	use std::sync::atomic::{AtomicBool, Ordering};
	use std::sync::Mutex;
	use tempfile::TempDir;

	fn write(root: &Path, name: &str, content: &str, mtime: i64) {
		let path = root.join(name);
		fs::create_dir_all(path.parent().unwrap()).unwrap();
		fs::write(&path, content).unwrap();
		set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).unwrap();
	}

	fn remote_file(name: &str, size: i64, mtime: i64) -> FileInformation {
		FileInformation { name: name.into(), size, mtime, ..Default::default() }
	}

	fn seeded(remote: &[FileInformation]) -> (FileIndex, BTreeMap<String, FileInformation>) {
		let index = FileIndex::new();
		let mut state = BTreeMap::new();
		for info in remote {
			index.lock().set(info.clone());
			state.insert(info.name.clone(), info.clone());
		}
		(index, state)
	}

	fn syncer(root: &Path, strategy: InitialSyncStrategy, matchers: Matchers) -> InitialSyncer {
		InitialSyncer::new(root, strategy, CompareBy::MtimeSize, matchers)
	}

	fn names(infos: &[FileInformation]) -> Vec<&str> {
		infos.iter().map(|i| i.name.as_str()).collect()
	}

	#[test]
	fn test_prefer_newest() {
		let dir = TempDir::new().unwrap();
		write(dir.path(), "a", "local", 200);
		write(dir.path(), "b", "local", 100);
		write(dir.path(), "c", "new", 100);

		let (index, remote) = seeded(&[
			remote_file("a", 6, 100),
			remote_file("b", 6, 200),
			remote_file("d", 1, 100),
		]);
		let syncer = syncer(dir.path(), InitialSyncStrategy::PreferNewest, Matchers::default());
		let local = syncer.calculate_local_state().unwrap();
		let plan = syncer.plan(remote, &local, &index);

		assert_eq!(names(&plan.upload), vec!["a", "c"]);
		assert_eq!(names(&plan.download), vec!["b", "d"]);
		assert!(plan.remove_remote.is_empty());
		assert!(plan.remove_local.is_empty());
	}

	#[test]
	fn test_mirror_local_deletes_remote_only_paths() {
		let dir = TempDir::new().unwrap();
		write(dir.path(), "keep.txt", "x", 100);

		let (index, remote) = seeded(&[
			remote_file("keep.txt", 1, 100),
			FileInformation::directory("old"),
			remote_file("old/a", 1, 1),
			remote_file("old/b", 1, 1),
			remote_file("gen/out.js", 1, 1),
		]);
		let matchers = Matchers::compile(&[], &["gen/".to_string()], &[]).unwrap();
		let syncer = syncer(dir.path(), InitialSyncStrategy::MirrorLocal, matchers);
		let local = syncer.calculate_local_state().unwrap();
		let plan = syncer.plan(remote, &local, &index);

		assert_eq!(plan.remove_remote, vec!["old".to_string()]);
		assert_eq!(names(&plan.download), vec!["gen/out.js"]);
		assert!(plan.upload.is_empty());
	}

	#[test]
	fn test_mirror_remote_deletes_local_only_paths() {
		let dir = TempDir::new().unwrap();
		write(dir.path(), "stray/a.txt", "x", 100);
		write(dir.path(), "uploads/u.png", "x", 100);

		let (index, remote) = seeded(&[remote_file("r.txt", 1, 100)]);
		let matchers = Matchers::compile(&[], &[], &["uploads/".to_string()]).unwrap();
		let syncer = syncer(dir.path(), InitialSyncStrategy::MirrorRemote, matchers);
		let local = syncer.calculate_local_state().unwrap();
		let plan = syncer.plan(remote, &local, &index);

		assert_eq!(names(&plan.remove_local), vec!["stray", "stray/a.txt"]);
		assert_eq!(names(&plan.upload), vec!["uploads/u.png"]);
		assert_eq!(names(&plan.download), vec!["r.txt"]);
	}

	#[test]
	fn test_keep_all_and_compare_by_size() {
		let dir = TempDir::new().unwrap();
		write(dir.path(), "same-size", "abc", 500);
		write(dir.path(), "conflict", "abcd", 500);

		let (index, remote) =
			seeded(&[remote_file("same-size", 3, 100), remote_file("conflict", 9, 100)]);
		let keep_all = syncer(dir.path(), InitialSyncStrategy::KeepAll, Matchers::default());
		let local = keep_all.calculate_local_state().unwrap();
		assert!(keep_all.plan(remote.clone(), &local, &index).is_empty());

		let by_size = InitialSyncer::new(
			dir.path(),
			InitialSyncStrategy::PreferRemote,
			CompareBy::Size,
			Matchers::default(),
		);
		let plan = by_size.plan(remote, &local, &index);
		assert!(plan.upload.is_empty());
		assert_eq!(names(&plan.download), vec!["conflict"]);
	}

	#[test]
	fn test_plan_is_idempotent_on_synced_trees() {
		let dir = TempDir::new().unwrap();
		write(dir.path(), "src/main.rs", "fn main() {}", 100);
		write(dir.path(), "README", "hi", 100);

		let (index, remote) = seeded(&[
			FileInformation::directory("src"),
			remote_file("src/main.rs", 12, 100),
			remote_file("README", 2, 100),
		]);
		let syncer = syncer(dir.path(), InitialSyncStrategy::MirrorLocal, Matchers::default());
		let local = syncer.calculate_local_state().unwrap();
		assert!(syncer.plan(remote, &local, &index).is_empty());
	}

	#[test]
	fn test_planned_uploads_pass_the_initial_upload_check() {
		let dir = TempDir::new().unwrap();
		write(dir.path(), "a", "12345", 101);
		write(dir.path(), "b", "12345", 99);
		write(dir.path(), "c", "12345", 102);
		write(dir.path(), "d", "1234", 50);

		let (index, remote) = seeded(&[
			remote_file("a", 5, 100),
			remote_file("b", 5, 100),
			remote_file("c", 5, 100),
			remote_file("d", 5, 100),
		]);
		let syncer = syncer(dir.path(), InitialSyncStrategy::PreferNewest, Matchers::default());
		let local = syncer.calculate_local_state().unwrap();
		let plan = syncer.plan(remote, &local, &index);

		// one second apart with equal size is the same file
		assert_eq!(names(&plan.upload), vec!["c"]);
		assert_eq!(names(&plan.download), vec!["d"]);

		let map = index.lock();
		for info in &plan.upload {
			assert!(should_upload(&map, &Matchers::default(), info, true), "{} dropped", info.name);
		}
	}

	#[test]
	fn test_upload_excluded_local_newer_is_indexed() {
		let dir = TempDir::new().unwrap();
		write(dir.path(), "build.log", "local", 300);

		let (index, remote) = seeded(&[remote_file("build.log", 1, 100)]);
		let matchers = Matchers::compile(&[], &["*.log".to_string()], &[]).unwrap();
		let syncer = syncer(dir.path(), InitialSyncStrategy::PreferNewest, matchers);
		let local = syncer.calculate_local_state().unwrap();
		let plan = syncer.plan(remote, &local, &index);

		assert!(plan.is_empty());
		assert_eq!(index.lock().get("build.log").unwrap().mtime, 300);
	}

	#[test]
	fn test_walk_prunes_excluded_and_follows_symlinks() {
		let dir = TempDir::new().unwrap();
		let target = TempDir::new().unwrap();
		write(dir.path(), "node_modules/x/index.js", "x", 1);
		write(dir.path(), "src/lib.rs", "x", 1);
		write(target.path(), "shared.txt", "x", 1);
		std::os::unix::fs::symlink(target.path(), dir.path().join("linked")).unwrap();

		let matchers = Matchers::compile(&["node_modules/".to_string()], &[], &[]).unwrap();
		let syncer = syncer(dir.path(), InitialSyncStrategy::PreferNewest, matchers);
		let local = syncer.calculate_local_state().unwrap();

		assert!(!local.files.contains_key("node_modules"));
		assert!(local.files.contains_key("linked/shared.txt"));
		assert!(local.files["linked"].resolved_link);
		assert_eq!(local.files["src"].files, 1);
		assert_eq!(local.symlinks.len(), 1);
		assert_eq!(local.symlinks[0].0, "linked");
	}

	struct Recorder {
		calls: Mutex<Vec<String>>,
	}

	#[async_trait]
	impl UploadLeg for Recorder {
		async fn initial_upload(
			&self,
			uploads: Vec<FileInformation>,
			removals: Vec<String>,
		) -> SyncResult<()> {
			self.calls.lock().unwrap().push(format!("up {} {}", uploads.len(), removals.len()));
			Ok(())
		}
	}

	#[async_trait]
	impl DownloadLeg for Recorder {
		async fn initial_download(
			&self,
			downloads: Vec<FileInformation>,
			removals: Vec<FileInformation>,
		) -> SyncResult<()> {
			self.calls.lock().unwrap().push(format!("down {} {}", downloads.len(), removals.len()));
			Ok(())
		}
	}

	#[tokio::test]
	async fn test_run_signals_each_leg() {
		let dir = TempDir::new().unwrap();
		let syncer = syncer(dir.path(), InitialSyncStrategy::PreferNewest, Matchers::default());
		let recorder = Recorder { calls: Mutex::new(Vec::new()) };
		let plan = InitialPlan {
			upload: vec![remote_file("a", 1, 1)],
			download: vec![remote_file("b", 1, 1), remote_file("c", 1, 1)],
			..Default::default()
		};

		let up_done = AtomicBool::new(false);
		let down_done = AtomicBool::new(false);
		syncer
			.run(
				plan,
				&recorder,
				&recorder,
				|| up_done.store(true, Ordering::SeqCst),
				|| down_done.store(true, Ordering::SeqCst),
			)
			.await
			.unwrap();

		assert!(up_done.load(Ordering::SeqCst));
		assert!(down_done.load(Ordering::SeqCst));
		let mut calls = recorder.calls.lock().unwrap().clone();
		calls.sort();
		assert_eq!(calls, vec!["down 2 0", "up 1 0"]);
	}
}

// vim: ts=4
