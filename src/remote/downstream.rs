//! Remote side of the download leg

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use super::watch::{diff, ChangeSource, Snapshot};
use crate::archive::{pack_paths, ChannelWriter, ARCHIVE_CHANNEL_SIZE};
use crate::logging::*;
use crate::protocol::{
	Message, Method, PingTimeout, ProtocolError, ProtocolResult, ServerCall, Service,
};
use crate::types::Change;

/// Change records per streamed message
pub const CHANGE_BATCH_SIZE: usize = 64;

struct WatchState {
	source: Box<dyn ChangeSource>,

	/// State the client has been told about
	watched: Snapshot,

	/// Last uncommitted snapshot and its diff size
	pending: Option<(Snapshot, usize)>,
}

impl WatchState {
	fn latest(&mut self) -> std::io::Result<Snapshot> {
		if !self.source.dirty() {
			if let Some((snapshot, _)) = &self.pending {
				return Ok(snapshot.clone());
			}
		}
		self.source.produce_snapshot()
	}

	fn count(&mut self) -> std::io::Result<usize> {
		if !self.source.dirty() {
			if let Some((_, count)) = &self.pending {
				return Ok(*count);
			}
		}
		let snapshot = self.source.produce_snapshot()?;
		let count = diff(&self.watched, &snapshot).len();
		self.pending = Some((snapshot, count));
		Ok(count)
	}

	fn commit(&mut self) -> std::io::Result<Vec<Change>> {
		let snapshot = self.latest()?;
		let changes = diff(&self.watched, &snapshot);
		self.watched = snapshot;
		self.pending = Some((self.watched.clone(), 0));
		Ok(changes)
	}
}

/// Serves change detection and downloads of the served tree
pub struct DownstreamService {
	root: PathBuf,
	state: Arc<Mutex<WatchState>>,
	ping: Option<PingTimeout>,
}

impl DownstreamService {
	pub fn new(root: impl Into<PathBuf>, source: Box<dyn ChangeSource>) -> Self {
		let state = WatchState { source, watched: Snapshot::new(), pending: None };
		DownstreamService { root: root.into(), state: Arc::new(Mutex::new(state)), ping: None }
	}

	/// Record pings into `ping`
	pub fn with_ping_timeout(mut self, ping: PingTimeout) -> Self {
		self.ping = Some(ping);
		self
	}

	async fn with_state<T, F>(&self, f: F) -> ProtocolResult<T>
	where
		T: Send + 'static,
		F: FnOnce(&mut WatchState) -> std::io::Result<T> + Send + 'static,
	{
		let state = self.state.clone();
		tokio::task::spawn_blocking(move || {
			let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
			f(&mut state)
		})
		.await
		.map_err(|e| ProtocolError::Other(e.to_string()))?
		.map_err(ProtocolError::from)
	}

	async fn changes(&self, call: &mut ServerCall) -> ProtocolResult<()> {
		call.request().await?;
		let changes = self.with_state(|state| state.commit()).await?;
		debug!("Streaming {} changes", changes.len());

		let mut changes = changes.into_iter().peekable();
		while changes.peek().is_some() {
			let batch: Vec<Change> = changes.by_ref().take(CHANGE_BATCH_SIZE).collect();
			call.send_message(Message::ChangeChunk { changes: batch }).await?;
		}
		Ok(())
	}

	async fn changes_count(&self, call: &mut ServerCall) -> ProtocolResult<()> {
		call.request().await?;
		let amount = self.with_state(|state| state.count()).await?;
		call.send_message(Message::ChangeAmount { amount: amount as i64 }).await
	}

	async fn download(&self, call: &mut ServerCall) -> ProtocolResult<()> {
		let mut names = Vec::new();
		while let Some(message) = call.recv_message().await? {
			match message {
				Message::Paths { paths } => names.extend(paths),
				other => {
					return Err(ProtocolError::ProtocolViolation(format!(
						"unexpected {} message in download",
						other.kind()
					)));
				}
			}
		}
		debug!("Packing {} requested paths", names.len());

		let (tx, mut rx) = mpsc::channel(ARCHIVE_CHANNEL_SIZE);
		let root = self.root.clone();
		let job = tokio::task::spawn_blocking(move || {
			pack_paths(&root, &names, ChannelWriter::new(tx)).map(|_| ())
		});

		while let Some(chunk) = rx.recv().await {
			call.send_chunk(chunk).await?;
		}
		job.await
			.map_err(|e| ProtocolError::Other(e.to_string()))?
			.map_err(|e| ProtocolError::Other(format!("download failed: {}", e)))
	}
}

#[async_trait]
impl Service for DownstreamService {
	async fn handle(&self, method: Method, call: &mut ServerCall) -> ProtocolResult<()> {
		match method {
			Method::Ping => {
				if let Some(ping) = &self.ping {
					ping.touch();
				}
				call.request().await?;
				call.send_message(Message::Empty).await
			}
			Method::Changes => self.changes(call).await,
			Method::ChangesCount => self.changes_count(call).await,
			Method::Download => self.download(call).await,
			other => Err(ProtocolError::Other(format!("{} is not served by downstream", other))),
		}
	}
}

// vim: ts=4
