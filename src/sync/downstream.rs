//! Remote → local leg
//!
//! Polls the pending change count of the remote tree and, once it is stable,
//! fetches the change records, creates directories, downloads files in one
//! archive per batch and applies deletions. Every applied path is written to
//! the index right away so the upload leg does not send it back.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::SyncContext;
use crate::archive::{unpack_local, ChannelReader, LocalUnpackOptions, ARCHIVE_CHANNEL_SIZE};
use crate::decision::{should_download, should_remove_local};
use crate::error::{SyncError, SyncResult};
use crate::exclusion::Matchers;
use crate::index::{FileIndex, FileMap};
use crate::initial::DownloadLeg;
use crate::logging::*;
use crate::protocol::{Message, Method, ProtocolError};
use crate::remote::CHANGE_BATCH_SIZE;
use crate::types::{absolute_path, ceil_mtime, parent_name, Change, ChangeType, FileInformation};
use crate::util::is_stale;

const LEG: &str = "downstream";

/// The download leg of a session
pub struct Downstream {
	ctx: Arc<SyncContext>,
}

impl Downstream {
	pub fn new(ctx: Arc<SyncContext>) -> Self {
		Downstream { ctx }
	}

	/// Seed the index with the complete remote tree
	///
	/// The first `Changes` call diffs against an empty snapshot, so it lists
	/// every remote path. Returns the remote state for the initial plan.
	pub async fn populate_file_map(&self) -> SyncResult<BTreeMap<String, FileInformation>> {
		let changes = self.fetch_changes().await?;
		let mut remote = BTreeMap::new();

		let mut map = self.ctx.index.lock();
		for change in changes.iter().filter(|c| c.change_type == ChangeType::Change) {
			let info = FileInformation::from_change(change);
			if let Some(parent) = parent_name(&info.name) {
				map.create_dir_in_file_map(parent);
			}
			map.set(info.clone());
			remote.insert(info.name.clone(), info);
		}
		drop(map);

		info!("[downstream] Remote tree has {} entries", remote.len());
		Ok(remote)
	}

	/// Commit and fetch the pending remote changes
	pub async fn fetch_changes(&self) -> SyncResult<Vec<Change>> {
		let context = "[downstream] changes";
		let wrap = |e: ProtocolError| SyncError::protocol(context, e);

		let mut call = self.ctx.downstream.open(Method::Changes).await.map_err(wrap)?;
		call.send_message(Message::Empty).await.map_err(wrap)?;
		call.close_send().await.map_err(wrap)?;

		let mut changes = Vec::new();
		while let Some(message) = call.recv_message().await.map_err(wrap)? {
			match message {
				Message::ChangeChunk { changes: batch } => changes.extend(batch),
				other => {
					return Err(wrap(ProtocolError::ProtocolViolation(format!(
						"unexpected {} message in changes",
						other.kind()
					))));
				}
			}
		}
		Ok(changes)
	}

	/// Size of the pending remote diff
	pub async fn changes_count(&self) -> SyncResult<usize> {
		let context = "[downstream] changes count";
		match self.ctx.downstream.unary(Method::ChangesCount, Message::Empty).await {
			Ok(Message::ChangeAmount { amount }) => Ok(amount.max(0) as usize),
			Ok(other) => Err(SyncError::protocol(
				context,
				ProtocolError::ProtocolViolation(format!("unexpected {} response", other.kind())),
			)),
			Err(e) => Err(SyncError::protocol(context, e)),
		}
	}

	/// Poll loop; returns when the session is cancelled
	///
	/// Changes are fetched once the pending count is non-zero and the same on
	/// two consecutive polls, so a remote tree that is still being written is
	/// not picked up half way.
	pub async fn run(&self) -> SyncResult<()> {
		let mut last_count = 0;
		let mut failures = 0;

		loop {
			tokio::select! {
				_ = self.ctx.cancel.cancelled() => return Ok(()),
				_ = tokio::time::sleep(self.ctx.config.polling_interval()) => {}
			}

			match self.poll(&mut last_count).await {
				Ok(()) => failures = 0,
				Err(e) if e.is_fatal() || self.ctx.cancel.is_cancelled() => return Err(e),
				Err(e) => {
					failures += 1;
					if failures >= self.ctx.config.sync_retries {
						return Err(SyncError::RetriesExhausted {
							leg: LEG,
							attempts: failures,
							last: e.to_string(),
						});
					}
					warn!("[downstream] {}, retrying", e);
				}
			}
		}
	}

	async fn poll(&self, last_count: &mut usize) -> SyncResult<()> {
		let count = self.changes_count().await?;
		if count == 0 || count != *last_count {
			*last_count = count;
			return Ok(());
		}
		*last_count = 0;

		let changes = self.fetch_changes().await?;
		debug!("[downstream] Fetched {} changes", changes.len());
		self.apply_changes(changes).await
	}

	/// Apply fetched change records to the local tree
	pub async fn apply_changes(&self, changes: Vec<Change>) -> SyncResult<()> {
		let (creates, deletes): (Vec<Change>, Vec<Change>) =
			changes.into_iter().partition(|c| c.change_type == ChangeType::Change);

		if !deletes.is_empty() {
			let collected: Vec<FileInformation> = {
				let map = self.ctx.index.lock();
				deletes.iter().filter_map(|c| map.get(&c.path).cloned()).collect()
			};
			self.remove_local(collected, false).await?;
		}

		let creates: Vec<FileInformation> = {
			let map = self.ctx.index.lock();
			creates
				.iter()
				.filter(|c| should_download(&map, &self.ctx.matchers, c))
				.map(FileInformation::from_change)
				.collect()
		};
		self.create(creates, LocalUnpackOptions::default()).await
	}

	/// Create directories, then download files
	async fn create(
		&self,
		creates: Vec<FileInformation>,
		options: LocalUnpackOptions,
	) -> SyncResult<()> {
		let (dirs, files): (Vec<FileInformation>, Vec<FileInformation>) =
			creates.into_iter().partition(|info| info.is_directory);

		if !dirs.is_empty() {
			let (root, index) = (self.ctx.root.clone(), self.ctx.index.clone());
			let created = tokio::task::spawn_blocking(move || create_dirs(&root, &index, dirs)).await??;
			log_names("Created", &created);
		}
		if !files.is_empty() {
			self.download_with_retries(files, options).await?;
		}
		Ok(())
	}

	/// Downloads are idempotent, so a failed batch is simply requested again
	async fn download_with_retries(
		&self,
		files: Vec<FileInformation>,
		options: LocalUnpackOptions,
	) -> SyncResult<()> {
		let mut attempt = 0;
		loop {
			attempt += 1;
			let err = match self.download(&files, options).await {
				Ok(()) => return Ok(()),
				Err(e) => e,
			};
			if err.is_fatal() || self.ctx.cancel.is_cancelled() {
				return Err(err);
			}
			if attempt >= self.ctx.config.sync_retries {
				return Err(SyncError::RetriesExhausted {
					leg: LEG,
					attempts: attempt,
					last: err.to_string(),
				});
			}
			warn!("[downstream] Download attempt {} failed: {}, retrying", attempt, err);
			tokio::select! {
				_ = self.ctx.cancel.cancelled() => return Err(SyncError::Stopped),
				_ = tokio::time::sleep(self.ctx.config.retry_delay()) => {}
			}
		}
	}

	/// Download `files` in one archive and unpack it
	async fn download(
		&self,
		files: &[FileInformation],
		options: LocalUnpackOptions,
	) -> SyncResult<()> {
		let context = "[downstream] download";
		let wrap = |e: ProtocolError| SyncError::protocol(context, e);

		let mut call = self.ctx.downstream.open(Method::Download).await.map_err(wrap)?;
		for batch in files.chunks(CHANGE_BATCH_SIZE) {
			let paths = batch.iter().map(|info| info.name.clone()).collect();
			call.send_message(Message::Paths { paths }).await.map_err(wrap)?;
		}
		call.close_send().await.map_err(wrap)?;

		let remote: HashMap<String, FileInformation> =
			files.iter().map(|info| (info.name.clone(), info.clone())).collect();
		let (tx, rx) = mpsc::channel(ARCHIVE_CHANNEL_SIZE);
		let (root, index) = (self.ctx.root.clone(), self.ctx.index.clone());
		let job = tokio::task::spawn_blocking(move || {
			unpack_local(&root, ChannelReader::new(rx), &index, &remote, options)
		});

		let mut failure = None;
		loop {
			match call.recv_chunk().await {
				Ok(Some(chunk)) => {
					if tx.send(chunk).await.is_err() {
						// unpacking stopped early, its result explains why
						break;
					}
				}
				Ok(None) => break,
				Err(e) => {
					failure = Some(wrap(e));
					break;
				}
			}
		}
		drop(tx);

		let unpacked = job.await?;
		if let Some(err) = failure {
			return Err(err);
		}
		let written = unpacked?;
		log_names("Downloaded", &written);
		Ok(())
	}

	/// Delete local paths that vanished remotely
	///
	/// `collected` holds the index entries captured when the deletions were
	/// fetched. With `force` set the paths are untracked local-only paths of
	/// a mirror-remote initial sync.
	async fn remove_local(&self, collected: Vec<FileInformation>, force: bool) -> SyncResult<()> {
		if collected.is_empty() {
			return Ok(());
		}
		let (root, index, matchers) =
			(self.ctx.root.clone(), self.ctx.index.clone(), self.ctx.matchers.clone());
		let removed = tokio::task::spawn_blocking(move || {
			if force {
				remove_untracked(&root, collected)
			} else {
				remove_tracked(&root, &index, &matchers, collected)
			}
		})
		.await?;
		log_names("Removed", &removed);
		Ok(())
	}
}

#[async_trait]
impl DownloadLeg for Downstream {
	async fn initial_download(
		&self,
		downloads: Vec<FileInformation>,
		removals: Vec<FileInformation>,
	) -> SyncResult<()> {
		self.remove_local(removals, true).await?;

		// the index already holds the remote state, so should_download would
		// reject everything here; the plan decided these against the strategy
		let downloads = downloads
			.into_iter()
			.filter(|info| {
				!self.ctx.matchers.is_excluded(&info.name, info.is_directory)
					&& !self.ctx.matchers.is_download_excluded(&info.name, info.is_directory)
			})
			.collect();
		self.create(downloads, LocalUnpackOptions { overwrite_newer: true }).await
	}
}

fn log_names(action: &str, names: &[String]) {
	if names.len() <= 10 {
		names.iter().for_each(|name| info!("[downstream] {} {}", action, name));
	} else {
		info!("[downstream] {} {} paths", action, names.len());
	}
}

/// Create remote directories locally and track them
fn create_dirs(
	root: &Path,
	index: &FileIndex,
	dirs: Vec<FileInformation>,
) -> io::Result<Vec<String>> {
	let mut created = Vec::new();
	for info in dirs {
		let Some(path) = absolute_path(root, &info.name) else {
			warn!("[downstream] Refusing to create {}", info.name);
			continue;
		};
		if fs::symlink_metadata(&path).is_ok_and(|m| !m.is_dir()) {
			// a tracked file turned into a directory remotely
			fs::remove_file(&path)?;
		}
		if let Err(e) = fs::create_dir_all(&path) {
			warn!("[downstream] Cannot create {}: {}", info.name, e);
			continue;
		}

		let mut map = index.lock();
		if let Some(parent) = parent_name(&info.name) {
			map.create_dir_in_file_map(parent);
		}
		created.push(info.name.clone());
		map.set(info);
	}
	Ok(created)
}

/// Delete tracked paths that still match their collected state
fn remove_tracked(
	root: &Path,
	index: &FileIndex,
	matchers: &Matchers,
	mut collected: Vec<FileInformation>,
) -> Vec<String> {
	collected.sort_by(|a, b| a.name.cmp(&b.name));
	let mut removed = Vec::new();

	for info in collected {
		// held from the check through the delete: a local edit recorded by
		// the upload leg in between must not be deleted
		let mut map = index.lock();
		if !should_remove_local(&map, matchers, root, &info) {
			debug!("[downstream] Keeping {}", info.name);
			continue;
		}
		let Some(path) = absolute_path(root, &info.name) else {
			continue;
		};

		let result = match fs::symlink_metadata(&path) {
			Ok(stat) if stat.is_dir() => remove_dir_guarded(root, &mut map, matchers, &info.name),
			Ok(_) => fs::remove_file(&path),
			Err(e) => Err(e),
		};
		match result {
			Ok(()) => {
				map.remove_dir_in_file_map(&info.name);
				removed.push(info.name);
			}
			Err(e) if is_stale(&e) => map.remove_dir_in_file_map(&info.name),
			Err(e) => debug!("[downstream] Keeping {}: {}", info.name, e),
		}
	}
	removed
}

/// Remove the tracked, unchanged content of a directory, then the directory
/// itself; fails while untracked or modified content is left in it
fn remove_dir_guarded(
	root: &Path,
	map: &mut FileMap,
	matchers: &Matchers,
	name: &str,
) -> io::Result<()> {
	let path = absolute_path(root, name)
		.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path escapes the root"))?;

	for entry in fs::read_dir(&path)?.flatten() {
		let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
			continue;
		};
		let child = format!("{}/{}", name, file_name);
		let Some(tracked) = map.get(&child).cloned() else {
			debug!("[downstream] Keeping untracked {}", child);
			continue;
		};
		if !should_remove_local(map, matchers, root, &tracked) {
			debug!("[downstream] Keeping {}", child);
			continue;
		}

		let result = if entry.file_type().is_ok_and(|t| t.is_dir()) {
			remove_dir_guarded(root, map, matchers, &child)
		} else {
			fs::remove_file(entry.path())
		};
		match result {
			Ok(()) => map.remove_dir_in_file_map(&child),
			Err(e) => debug!("[downstream] Keeping {}: {}", child, e),
		}
	}
	fs::remove_dir(&path)
}

/// Delete local-only paths; files first, then directories deepest first
fn remove_untracked(root: &Path, mut collected: Vec<FileInformation>) -> Vec<String> {
	collected.sort_by(|a, b| b.name.cmp(&a.name));
	let (dirs, files): (Vec<FileInformation>, Vec<FileInformation>) =
		collected.into_iter().partition(|info| info.is_directory);
	let mut removed = Vec::new();

	for info in files {
		let Some(path) = absolute_path(root, &info.name) else {
			continue;
		};
		let Ok(stat) = fs::symlink_metadata(&path) else {
			continue;
		};
		let unchanged = stat.file_type().is_symlink()
			|| (stat.is_file()
				&& stat.len() as i64 == info.size
				&& ceil_mtime(stat.mtime(), stat.mtime_nsec()) <= info.mtime);
		if !unchanged {
			debug!("[downstream] Keeping modified {}", info.name);
			continue;
		}
		match fs::remove_file(&path) {
			Ok(()) => removed.push(info.name),
			Err(e) => debug!("[downstream] Cannot remove {}: {}", info.name, e),
		}
	}
	for info in dirs {
		let Some(path) = absolute_path(root, &info.name) else {
			continue;
		};
		match fs::remove_dir(&path) {
			Ok(()) => removed.push(info.name),
			Err(e) => debug!("[downstream] Keeping directory {}: {}", info.name, e),
		}
	}
	removed
}


// vim: ts=4
