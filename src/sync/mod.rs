//! Sync session
//!
//! A [`Session`] owns the shared index and runs both legs against two
//! connected [`RpcClient`]s:
//!
//! 1. the local watcher starts, so nothing changed during startup is lost
//! 2. the index is seeded with the remote tree
//! 3. the initial reconciliation runs both legs concurrently
//! 4. the upstream batch loop and the downstream poll loop run until stopped
//!
//! Heartbeats run on both connections the whole time. The first fatal error
//! of any task stops the session.
//!
//! # Example Usage
//!
//! ```ignore
//! use livesync::{Session, SyncConfig};
//!
//! let session = Session::start(&local_dir, SyncConfig::default(), upstream, downstream).await?;
//! session.upstream_initial_done().cancelled().await;
//! session.done().cancelled().await;
//! ```

pub mod downstream;
mod symlink;
pub mod upstream;

pub use downstream::Downstream;
pub use upstream::{EventQueue, Upstream, UpstreamEvent};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::exclusion::Matchers;
use crate::index::FileIndex;
use crate::initial::InitialSyncer;
use crate::logging::*;
use crate::protocol::{keep_alive, RpcClient};

/// State shared by every task of a session
pub struct SyncContext {
	/// Canonical local sync root
	pub root: PathBuf,
	pub config: SyncConfig,
	pub index: FileIndex,
	pub matchers: Matchers,

	/// Cancelled once the session stops
	pub cancel: CancellationToken,

	/// Connection serving the upload leg
	pub upstream: RpcClient,

	/// Connection serving the download leg
	pub downstream: RpcClient,

	stopped: AtomicBool,
	errors: mpsc::Sender<SyncError>,
}

impl SyncContext {
	/// Stop the session; only the first call has any effect
	///
	/// Cancels every loop, closes both connections and delivers `err` on the
	/// session's error channel.
	pub fn stop(&self, err: Option<SyncError>) {
		if self.stopped.swap(true, Ordering::SeqCst) {
			return;
		}
		match err {
			Some(err) => {
				error!("Sync stopped: {}", err);
				// capacity one, and this is the only sender call
				let _ = self.errors.try_send(err);
			}
			None => info!("Sync stopped"),
		}
		self.cancel.cancel();

		let (upstream, downstream) = (self.upstream.clone(), self.downstream.clone());
		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			handle.spawn(async move {
				futures::join!(upstream.shutdown(), downstream.shutdown());
			});
		}
	}

	pub fn is_stopped(&self) -> bool {
		self.stopped.load(Ordering::SeqCst)
	}
}

/// A running sync session
pub struct Session {
	ctx: Arc<SyncContext>,
	upstream_initial_done: CancellationToken,
	downstream_initial_done: CancellationToken,
	done: CancellationToken,
	errors: Mutex<mpsc::Receiver<SyncError>>,
}

impl Session {
	/// Validate the configuration and start all session tasks
	pub async fn start(
		local_root: &Path,
		config: SyncConfig,
		upstream: RpcClient,
		downstream: RpcClient,
	) -> SyncResult<Session> {
		config.validate()?;
		let root = tokio::fs::canonicalize(local_root).await?;
		let matchers = Matchers::compile(
			&config.effective_excludes(),
			&config.upload_exclude_paths,
			&config.download_exclude_paths,
		)?;

		let (errors_tx, errors_rx) = mpsc::channel(1);
		let ctx = Arc::new(SyncContext {
			root,
			config,
			index: FileIndex::new(),
			matchers,
			cancel: CancellationToken::new(),
			upstream,
			downstream,
			stopped: AtomicBool::new(false),
			errors: errors_tx,
		});

		let session = Session {
			ctx: ctx.clone(),
			upstream_initial_done: CancellationToken::new(),
			downstream_initial_done: CancellationToken::new(),
			done: CancellationToken::new(),
			errors: Mutex::new(errors_rx),
		};

		info!(
			"Starting sync of {:?} (initial sync: {}, compare by: {})",
			ctx.root, ctx.config.initial_sync, ctx.config.compare_by
		);
		spawn_connection_guards(&ctx);

		let main = tokio::spawn(run(
			ctx.clone(),
			session.upstream_initial_done.clone(),
			session.downstream_initial_done.clone(),
		));
		let done = session.done.clone();
		tokio::spawn(async move {
			match main.await {
				Ok(Ok(())) => ctx.stop(None),
				Ok(Err(e)) => ctx.stop(Some(e)),
				Err(e) => ctx.stop(Some(e.into())),
			}
			done.cancel();
		});

		Ok(session)
	}

	/// Cancelled once the initial upload finished
	pub fn upstream_initial_done(&self) -> CancellationToken {
		self.upstream_initial_done.clone()
	}

	/// Cancelled once the initial download finished
	pub fn downstream_initial_done(&self) -> CancellationToken {
		self.downstream_initial_done.clone()
	}

	/// Cancelled once every session task has ended
	pub fn done(&self) -> CancellationToken {
		self.done.clone()
	}

	/// The error that stopped the session, if any
	///
	/// Waits until the session is done. Only the first call gets the error.
	pub async fn error(&self) -> Option<SyncError> {
		self.done.cancelled().await;
		self.errors.lock().await.try_recv().ok()
	}

	/// Stop without an error
	pub fn stop(&self) {
		self.ctx.stop(None);
	}

	pub fn index(&self) -> &FileIndex {
		&self.ctx.index
	}

	pub fn root(&self) -> &Path {
		&self.ctx.root
	}
}

impl Drop for Session {
	fn drop(&mut self) {
		self.ctx.stop(None);
	}
}

/// Heartbeats, plus a fatal stop when either connection drops
fn spawn_connection_guards(ctx: &Arc<SyncContext>) {
	let legs = [("upstream", ctx.upstream.clone()), ("downstream", ctx.downstream.clone())];
	for (leg, client) in legs {
		let ctx = ctx.clone();
		tokio::spawn(async move {
			let closed = client.closed();
			tokio::select! {
				_ = ctx.cancel.cancelled() => {}
				_ = closed.cancelled() => {
					ctx.stop(Some(SyncError::fatal(leg, "connection closed")));
				}
				result = keep_alive(client.clone(), ctx.config.ping_interval(), ctx.cancel.clone()) => {
					if let Err(e) = result {
						ctx.stop(Some(SyncError::protocol(format!("[{}] ping", leg), e)));
					}
				}
			}
		});
	}
}

async fn run(
	ctx: Arc<SyncContext>,
	upstream_done: CancellationToken,
	downstream_done: CancellationToken,
) -> SyncResult<()> {
	let upstream = Arc::new(Upstream::new(ctx.clone()));
	let downstream = Downstream::new(ctx.clone());
	upstream.watch().map_err(|e| SyncError::fatal("upstream", format!("watch failed: {}", e)))?;

	let remote = downstream.populate_file_map().await?;

	let syncer = Arc::new(InitialSyncer::new(
		ctx.root.clone(),
		ctx.config.initial_sync,
		ctx.config.compare_by,
		ctx.matchers.clone(),
	));
	let walker = syncer.clone();
	let local = tokio::task::spawn_blocking(move || walker.calculate_local_state()).await??;
	debug!("[initial] Local tree has {} entries", local.files.len());

	let plan = syncer.plan(remote, &local, &ctx.index);
	for (name, target) in &local.symlinks {
		if !target.starts_with(&ctx.root) {
			upstream.add_symlink(name, target);
		}
	}

	let batch_loop = upstream.clone();
	let batch_ctx = ctx.clone();
	tokio::spawn(async move {
		if let Err(e) = batch_loop.run().await {
			batch_ctx.stop(Some(e));
		}
	});

	syncer
		.run(
			plan,
			upstream.as_ref(),
			&downstream,
			|| upstream_done.cancel(),
			|| downstream_done.cancel(),
		)
		.await?;
	info!("Initial sync completed");

	downstream.run().await
}

// vim: ts=4
