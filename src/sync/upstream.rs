//! Local → remote leg
//!
//! Filesystem events land in a bounded [`EventQueue`]. The batch loop waits
//! for the queue to settle, stats every dirty path, filters it through the
//! decision functions and sends one archive plus batched removals per batch.
//! The index is only updated once the remote side confirmed a transfer.

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};

use super::symlink::Symlinks;
use super::SyncContext;
use crate::archive::{Archiver, ChannelWriter, ARCHIVE_CHANNEL_SIZE};
use crate::decision::{should_remove_remote, should_upload};
use crate::error::{SyncError, SyncResult};
use crate::initial::{walk_local_tree, UploadLeg};
use crate::logging::*;
use crate::protocol::{Message, Method, ProtocolError};
use crate::types::{absolute_path, parent_name, relative_name, FileInformation};
use crate::util::is_stale;

const LEG: &str = "upstream";

/// Poll interval of [`Upstream::wait_idle`]
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Work item of the upstream queue
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
	/// Something happened at this absolute path
	Path(PathBuf),

	/// Initial upload candidate picked by the plan
	Seed(FileInformation),
}

/// Producer side of the upstream queue
///
/// Every queued event is counted until its batch has been processed, so
/// [`is_busy`](Self::is_busy) covers both queued and in-flight work.
#[derive(Clone)]
pub struct EventQueue {
	tx: mpsc::Sender<UpstreamEvent>,
	in_flight: Arc<AtomicUsize>,
	overflow: Arc<AtomicBool>,
}

impl EventQueue {
	fn new(size: usize) -> (Self, mpsc::Receiver<UpstreamEvent>) {
		let (tx, rx) = mpsc::channel(size.max(1));
		let queue = EventQueue {
			tx,
			in_flight: Arc::new(AtomicUsize::new(0)),
			overflow: Arc::new(AtomicBool::new(false)),
		};
		(queue, rx)
	}

	/// Queue a watcher event; a full queue degrades to a rescan
	pub fn push_path(&self, path: PathBuf) {
		self.in_flight.fetch_add(1, Ordering::SeqCst);
		match self.tx.try_send(UpstreamEvent::Path(path)) {
			Ok(()) => {}
			Err(TrySendError::Full(_)) => {
				self.in_flight.fetch_sub(1, Ordering::SeqCst);
				self.overflow();
			}
			Err(TrySendError::Closed(_)) => {
				self.in_flight.fetch_sub(1, Ordering::SeqCst);
			}
		}
	}

	/// Queue an initial candidate, waiting for room
	pub async fn push_seed(&self, info: FileInformation) -> SyncResult<()> {
		self.in_flight.fetch_add(1, Ordering::SeqCst);
		if self.tx.send(UpstreamEvent::Seed(info)).await.is_err() {
			self.in_flight.fetch_sub(1, Ordering::SeqCst);
			return Err(SyncError::Stopped);
		}
		Ok(())
	}

	/// Events were lost; the next batch rescans the whole tree
	pub fn overflow(&self) {
		self.overflow.store(true, Ordering::SeqCst);
	}

	pub fn is_busy(&self) -> bool {
		self.in_flight.load(Ordering::SeqCst) > 0 || self.overflow.load(Ordering::SeqCst)
	}

	fn take_overflow(&self) -> bool {
		self.overflow.swap(false, Ordering::SeqCst)
	}

	fn processed(&self, count: usize) {
		self.in_flight.fetch_sub(count, Ordering::SeqCst);
	}
}

/// Transfer candidates of one batch
#[derive(Debug, Default)]
struct Candidates {
	creates: Vec<FileInformation>,
	removes: Vec<String>,
	initial: bool,
}

impl Candidates {
	fn is_empty(&self) -> bool {
		self.creates.is_empty() && self.removes.is_empty()
	}
}

/// The upload leg of a session
pub struct Upstream {
	ctx: Arc<SyncContext>,
	queue: EventQueue,
	events: tokio::sync::Mutex<mpsc::Receiver<UpstreamEvent>>,
	symlinks: Arc<Symlinks>,
	watcher: Mutex<Option<RecommendedWatcher>>,
}

impl Upstream {
	pub fn new(ctx: Arc<SyncContext>) -> Self {
		let (queue, events) = EventQueue::new(ctx.config.event_queue_size);
		let symlinks = Arc::new(Symlinks::new(ctx.root.clone(), queue.clone()));
		Upstream {
			ctx,
			queue,
			events: tokio::sync::Mutex::new(events),
			symlinks,
			watcher: Mutex::new(None),
		}
	}

	/// Start watching the local tree
	pub fn watch(&self) -> notify::Result<()> {
		let queue = self.queue.clone();
		let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
			match res {
				Ok(event) => event.paths.into_iter().for_each(|path| queue.push_path(path)),
				Err(e) => {
					warn!("[upstream] Watch error: {}", e);
					queue.overflow();
				}
			}
		})?;
		watcher.watch(&self.ctx.root, RecursiveMode::Recursive)?;
		*self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
		info!("[upstream] Watching {:?}", self.ctx.root);
		Ok(())
	}

	/// Watch a symlink target found by the initial walk
	pub fn add_symlink(&self, name: &str, target: &std::path::Path) {
		if let Err(e) = self.symlinks.add(name, target) {
			warn!("[upstream] Cannot watch symlink {}: {}", name, e);
		}
	}

	pub fn is_busy(&self) -> bool {
		self.queue.is_busy()
	}

	/// Wait until the queue is drained and no batch is in flight
	pub async fn wait_idle(&self) -> SyncResult<()> {
		while self.is_busy() {
			tokio::select! {
				_ = self.ctx.cancel.cancelled() => return Err(SyncError::Stopped),
				_ = tokio::time::sleep(IDLE_POLL) => {}
			}
		}
		Ok(())
	}

	/// Batch loop; returns when the session is cancelled
	pub async fn run(&self) -> SyncResult<()> {
		let mut events = self.events.lock().await;
		let quiescence = self.ctx.config.batch_quiescence();

		loop {
			let mut batch = Vec::new();
			tokio::select! {
				_ = self.ctx.cancel.cancelled() => return Ok(()),
				event = events.recv() => match event {
					Some(event) => batch.push(event),
					None => return Ok(()),
				},
				_ = tokio::time::sleep(quiescence) => {
					if !self.queue.overflow.load(Ordering::SeqCst) {
						continue;
					}
				}
			}

			// gather until the queue settles
			let started = Instant::now();
			loop {
				let before = batch.len();
				tokio::select! {
					_ = self.ctx.cancel.cancelled() => return Ok(()),
					_ = tokio::time::sleep(quiescence) => {}
				}
				while let Ok(event) = events.try_recv() {
					batch.push(event);
				}
				if batch.len() == before
					|| batch.len() > self.ctx.config.max_batch_changes
					|| started.elapsed() > self.ctx.config.max_batch_wait()
				{
					break;
				}
			}

			let count = batch.len();
			let rescan = self.queue.take_overflow();
			let result = self.process(batch, rescan).await;
			self.queue.processed(count);
			result?;
		}
	}

	async fn process(&self, batch: Vec<UpstreamEvent>, rescan: bool) -> SyncResult<()> {
		let mut paths = BTreeSet::new();
		let mut seeds = Vec::new();
		for event in batch {
			match event {
				UpstreamEvent::Path(path) => {
					if let Some(name) = relative_name(&self.ctx.root, &path).filter(|n| !n.is_empty())
					{
						paths.insert(name);
					}
				}
				UpstreamEvent::Seed(info) => seeds.push(info),
			}
		}

		if rescan {
			info!("[upstream] Event queue overflowed, rescanning");
			let candidates = self.blocking(|upstream| upstream.rescan()).await?;
			self.apply(candidates).await?;
		}
		if !seeds.is_empty() {
			// the plan already decided these; only retries re-check them
			self.apply(Candidates { creates: seeds, removes: Vec::new(), initial: true }).await?;
		}
		if !paths.is_empty() {
			let candidates = self.blocking(move |upstream| Ok(upstream.evaluate(paths))).await?;
			self.apply(candidates).await?;
		}
		Ok(())
	}

	/// Run `f` on the blocking pool
	async fn blocking<T, F>(&self, f: F) -> SyncResult<T>
	where
		T: Send + 'static,
		F: FnOnce(&Evaluator) -> SyncResult<T> + Send + 'static,
	{
		let evaluator = Evaluator { ctx: self.ctx.clone(), symlinks: self.symlinks.clone() };
		tokio::task::spawn_blocking(move || f(&evaluator)).await?
	}

	/// Transfer a batch, retrying with re-filtered candidates
	async fn apply(&self, mut candidates: Candidates) -> SyncResult<()> {
		let started = Instant::now();
		let retries = self.ctx.config.sync_retries;
		let mut attempt = 0;

		loop {
			if candidates.is_empty() {
				return Ok(());
			}
			attempt += 1;

			let mut failure = None;
			if !candidates.removes.is_empty() {
				match self.send_removes(&candidates.removes).await {
					Ok(()) => candidates.removes.clear(),
					Err(e) => failure = Some(e),
				}
			}
			if failure.is_none() && !candidates.creates.is_empty() {
				match self.upload(&candidates.creates).await {
					Ok(()) => candidates.creates.clear(),
					Err(e) => failure = Some(e),
				}
			}
			let Some(err) = failure else {
				return Ok(());
			};

			if err.is_fatal() || self.ctx.cancel.is_cancelled() {
				return Err(err);
			}
			let timed_out = self
				.ctx
				.config
				.upload_retry_timeout()
				.is_some_and(|limit| started.elapsed() >= limit);
			if attempt >= retries || timed_out {
				return Err(SyncError::RetriesExhausted {
					leg: LEG,
					attempts: attempt,
					last: err.to_string(),
				});
			}

			warn!("[upstream] Attempt {} failed: {}, retrying", attempt, err);
			tokio::select! {
				_ = self.ctx.cancel.cancelled() => return Err(SyncError::Stopped),
				_ = tokio::time::sleep(self.ctx.config.retry_delay()) => {}
			}
			candidates = self.blocking(move |upstream| Ok(upstream.refilter(candidates))).await?;
		}
	}

	/// Delete remote paths, then forget them
	async fn send_removes(&self, names: &[String]) -> SyncResult<()> {
		let context = "[upstream] remove";
		let mut call = self
			.ctx
			.upstream
			.open(Method::Remove)
			.await
			.map_err(|e| SyncError::protocol(context, e))?;
		for batch in names.chunks(self.ctx.config.remove_batch_size) {
			call.send_message(Message::Paths { paths: batch.to_vec() })
				.await
				.map_err(|e| SyncError::protocol(context, e))?;
		}
		expect_empty(call.close_and_recv().await).map_err(|e| SyncError::protocol(context, e))?;

		let mut map = self.ctx.index.lock();
		for name in names {
			map.remove_dir_in_file_map(name);
		}
		drop(map);

		if names.len() <= 10 {
			names.iter().for_each(|name| info!("[upstream] Removed {}", name));
		} else {
			info!("[upstream] Removed {} paths", names.len());
		}
		Ok(())
	}

	/// Archive `creates` into one upload call, then record what was sent
	async fn upload(&self, creates: &[FileInformation]) -> SyncResult<()> {
		let context = "[upstream] upload";
		let (tx, mut rx) = mpsc::channel(ARCHIVE_CHANNEL_SIZE);
		let names: Vec<String> = creates.iter().map(|info| info.name.clone()).collect();
		let (root, matchers, index) =
			(self.ctx.root.clone(), self.ctx.matchers.clone(), self.ctx.index.clone());
		let job = tokio::task::spawn_blocking(move || {
			let mut archiver = Archiver::new(root, ChannelWriter::new(tx), matchers, index);
			for name in &names {
				archiver.add(name)?;
			}
			archiver.finish().map(|(_, written)| written)
		});

		let mut call = self
			.ctx
			.upstream
			.open(Method::Upload)
			.await
			.map_err(|e| SyncError::protocol(context, e))?;
		while let Some(chunk) = rx.recv().await {
			call.send_chunk(chunk).await.map_err(|e| SyncError::protocol(context, e))?;
		}
		let written = job.await??;
		expect_empty(call.close_and_recv().await).map_err(|e| SyncError::protocol(context, e))?;

		self.record_uploaded(&written);
		if written.len() <= 10 {
			written.keys().for_each(|name| info!("[upstream] Uploaded {}", name));
		} else {
			info!("[upstream] Uploaded {} entries", written.len());
		}
		Ok(())
	}

	fn record_uploaded(&self, written: &BTreeMap<String, FileInformation>) {
		let mut map = self.ctx.index.lock();
		for (name, info) in written {
			let mut entry = info.clone();
			if let Some(tracked) = map.get(name) {
				entry.remote_mode = tracked.remote_mode;
				entry.remote_uid = tracked.remote_uid;
				entry.remote_gid = tracked.remote_gid;
			}
			if let Some(parent) = parent_name(name) {
				map.create_dir_in_file_map(parent);
			}
			map.set(entry);
		}
	}
}

#[async_trait]
impl UploadLeg for Upstream {
	async fn initial_upload(
		&self,
		uploads: Vec<FileInformation>,
		removals: Vec<String>,
	) -> SyncResult<()> {
		if !removals.is_empty() {
			info!("[upstream] Removing {} remote paths", removals.len());
			self.apply(Candidates { creates: Vec::new(), removes: removals, initial: true })
				.await?;
		}

		let batch_size = self.ctx.config.initial_upstream_batch_size;
		for batch in uploads.chunks(batch_size) {
			debug!("[upstream] Queueing {} initial candidates", batch.len());
			for info in batch {
				self.queue.push_seed(info.clone()).await?;
			}
			self.wait_idle().await?;
		}
		self.wait_idle().await
	}
}

/// Blocking half of the leg: stats and decisions
struct Evaluator {
	ctx: Arc<SyncContext>,
	symlinks: Arc<Symlinks>,
}

impl Evaluator {
	/// Turn dirty paths into candidates
	fn evaluate(&self, paths: BTreeSet<String>) -> Candidates {
		let mut candidates = Candidates::default();
		for name in paths {
			match self.stat(&name) {
				Some(info) => {
					if info.resolved_link && info.is_directory {
						self.watch_symlink(&name);
					}
					let map = self.ctx.index.lock();
					if should_upload(&map, &self.ctx.matchers, &info, false) {
						candidates.creates.push(info);
					}
				}
				None => {
					self.symlinks.remove_under(&name);
					let map = self.ctx.index.lock();
					if should_remove_remote(&map, &self.ctx.matchers, &name) {
						candidates.removes.push(name);
					}
				}
			}
		}
		trim_nested(&mut candidates.removes);
		candidates
	}

	fn watch_symlink(&self, name: &str) {
		if self.symlinks.contains(name) {
			return;
		}
		let Some(path) = absolute_path(&self.ctx.root, name) else {
			return;
		};
		match fs::canonicalize(&path) {
			Ok(target) if !target.starts_with(&self.ctx.root) => {
				if let Err(e) = self.symlinks.add(name, &target) {
					warn!("[upstream] Cannot watch symlink {}: {}", name, e);
				}
			}
			Ok(_) => {}
			Err(e) => debug!("[upstream] Cannot resolve {}: {}", name, e),
		}
	}

	/// Re-check candidates before another attempt
	fn refilter(&self, candidates: Candidates) -> Candidates {
		let Candidates { creates, removes, initial } = candidates;
		let mut fresh = Candidates { initial, ..Default::default() };

		for old in creates {
			let Some(info) = self.stat(&old.name) else {
				continue;
			};
			let map = self.ctx.index.lock();
			if should_upload(&map, &self.ctx.matchers, &info, initial) {
				fresh.creates.push(info);
			}
		}
		for name in removes {
			if self.stat(&name).is_some() {
				continue;
			}
			let map = self.ctx.index.lock();
			if should_remove_remote(&map, &self.ctx.matchers, &name) {
				fresh.removes.push(name);
			}
		}
		fresh
	}

	/// Deep walk after lost events: every changed path plus every vanished one
	fn rescan(&self) -> SyncResult<Candidates> {
		let local = walk_local_tree(&self.ctx.root, &self.ctx.matchers)?;
		let mut candidates = Candidates::default();

		let map = self.ctx.index.lock();
		for info in local.files.values() {
			if should_upload(&map, &self.ctx.matchers, info, false) {
				candidates.creates.push(info.clone());
			}
		}
		for (name, _) in map.iter() {
			if !local.files.contains_key(name)
				&& self.stat(name).is_none()
				&& should_remove_remote(&map, &self.ctx.matchers, name)
			{
				candidates.removes.push(name.clone());
			}
		}
		drop(map);

		trim_nested(&mut candidates.removes);
		Ok(candidates)
	}

	/// Current local state of `name`, `None` if it is gone
	fn stat(&self, name: &str) -> Option<FileInformation> {
		let path = absolute_path(&self.ctx.root, name)?;
		let stat = match fs::metadata(&path) {
			Ok(stat) => stat,
			Err(e) => {
				if !is_stale(&e) {
					debug!("[upstream] Cannot stat {}: {}", name, e);
				}
				return None;
			}
		};
		let mut info = FileInformation::from_metadata(name, &stat);
		info.resolved_link = fs::symlink_metadata(&path).is_ok_and(|l| l.file_type().is_symlink());
		Some(info)
	}
}

/// Drop names below another name of the list; the list ends up sorted
fn trim_nested(names: &mut Vec<String>) {
	names.sort();
	let mut kept: Vec<String> = Vec::with_capacity(names.len());
	for name in names.drain(..) {
		if kept.last().is_some_and(|parent| name.starts_with(&format!("{}/", parent))) {
			continue;
		}
		kept.push(name);
	}
	*names = kept;
}

fn expect_empty(response: Result<Message, ProtocolError>) -> Result<(), ProtocolError> {
	match response? {
		Message::Empty => Ok(()),
		other => Err(ProtocolError::ProtocolViolation(format!(
			"unexpected {} response",
			other.kind()
		))),
	}
}


// vim: ts=4
