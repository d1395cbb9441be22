//! Remote side of the upload leg

use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::archive::{unpack_remote, ChannelReader, RemoteUnpackOptions, ARCHIVE_CHANNEL_SIZE};
use crate::error::ArchiveError;
use crate::exclusion::IgnoreMatcher;
use crate::logging::*;
use crate::protocol::{
	Message, Method, PingTimeout, ProtocolError, ProtocolResult, ServerCall, Service,
};
use crate::types::absolute_path;
use crate::util::is_stale;

/// Applies uploads and removals to the served tree
pub struct UpstreamService {
	root: PathBuf,
	matcher: Option<Arc<dyn IgnoreMatcher>>,
	unpack: RemoteUnpackOptions,
	ping: Option<PingTimeout>,
}

impl UpstreamService {
	pub fn new(root: impl Into<PathBuf>, matcher: Option<Arc<dyn IgnoreMatcher>>) -> Self {
		UpstreamService { root: root.into(), matcher, unpack: Default::default(), ping: None }
	}

	pub fn with_unpack_options(mut self, unpack: RemoteUnpackOptions) -> Self {
		self.unpack = unpack;
		self
	}

	/// Record pings into `ping`
	pub fn with_ping_timeout(mut self, ping: PingTimeout) -> Self {
		self.ping = Some(ping);
		self
	}

	async fn upload(&self, call: &mut ServerCall) -> ProtocolResult<()> {
		let (tx, rx) = mpsc::channel(ARCHIVE_CHANNEL_SIZE);
		let root = self.root.clone();
		let options = self.unpack;
		let job =
			tokio::task::spawn_blocking(move || unpack_remote(&root, ChannelReader::new(rx), options));

		while let Some(chunk) = call.recv_chunk().await? {
			if tx.send(chunk).await.is_err() {
				// unpacking stopped early, its result explains why
				break;
			}
		}
		drop(tx);

		let applied = job.await.map_err(|e| ProtocolError::Other(e.to_string()))?.map_err(|e| {
			let msg = format!("upload failed: {}", e);
			match e {
				// the tree now holds part of a broken stream
				ArchiveError::Corrupt(_) => ProtocolError::ProtocolViolation(msg),
				ArchiveError::Io(_) => ProtocolError::Other(msg),
			}
		})?;
		debug!("Applied {} uploaded entries", applied);
		call.send_message(Message::Empty).await
	}

	async fn remove(&self, call: &mut ServerCall) -> ProtocolResult<()> {
		let mut removed = 0usize;
		while let Some(message) = call.recv_message().await? {
			let Message::Paths { paths } = message else {
				return Err(ProtocolError::ProtocolViolation(format!(
					"unexpected {} message in remove",
					message.kind()
				)));
			};

			let root = self.root.clone();
			let matcher = self.matcher.clone();
			removed += tokio::task::spawn_blocking(move || {
				paths.iter().filter(|name| remove_path(&root, name, matcher.as_deref())).count()
			})
			.await
			.map_err(|e| ProtocolError::Other(e.to_string()))?;
		}
		debug!("Removed {} paths", removed);
		call.send_message(Message::Empty).await
	}
}

#[async_trait]
impl Service for UpstreamService {
	async fn handle(&self, method: Method, call: &mut ServerCall) -> ProtocolResult<()> {
		match method {
			Method::Ping => {
				if let Some(ping) = &self.ping {
					ping.touch();
				}
				call.request().await?;
				call.send_message(Message::Empty).await
			}
			Method::Upload => self.upload(call).await,
			Method::Remove => self.remove(call).await,
			other => Err(ProtocolError::Other(format!("{} is not served by upstream", other))),
		}
	}
}

/// Remove one path below `root`; returns whether anything was removed
///
/// Directories are removed recursively, except for descendants matched by
/// `matcher`; a directory still holding ignored content survives.
fn remove_path(root: &Path, name: &str, matcher: Option<&dyn IgnoreMatcher>) -> bool {
	let name = name.trim_matches('/');
	if name.is_empty() {
		warn!("Refusing to remove the sync root");
		return false;
	}
	let Some(path) = absolute_path(root, name) else {
		warn!("Refusing to remove {}", name);
		return false;
	};
	let stat = match fs::symlink_metadata(&path) {
		Ok(stat) => stat,
		Err(_) => return false,
	};

	let result = if stat.is_dir() {
		remove_dir_filtered(&path, name, matcher)
	} else {
		fs::remove_file(&path)
	};
	match result {
		Ok(()) => true,
		Err(e) if is_stale(&e) => false,
		Err(e) => {
			warn!("Removing {} failed: {}", name, e);
			false
		}
	}
}

fn remove_dir_filtered(dir: &Path, name: &str, matcher: Option<&dyn IgnoreMatcher>) -> io::Result<()> {
	for entry in fs::read_dir(dir)?.flatten() {
		let file_name = entry.file_name();
		let Some(file_name) = file_name.to_str() else {
			continue;
		};
		let child_name = format!("{}/{}", name, file_name);
		let child_path = entry.path();
		let Ok(file_type) = entry.file_type() else {
			continue;
		};
		let is_dir = file_type.is_dir();

		if let Some(matcher) = matcher {
			if matcher.matches(&child_name, is_dir) {
				if is_dir && matcher.require_full_scan() {
					remove_dir_filtered(&child_path, &child_name, Some(matcher))?;
				}
				continue;
			}
		}

		let result = if is_dir {
			remove_dir_filtered(&child_path, &child_name, matcher)
		} else {
			fs::remove_file(&child_path)
		};
		if let Err(e) = result {
			if !is_stale(&e) {
				return Err(e);
			}
		}
	}

	match fs::remove_dir(dir) {
		Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {
			debug!("Keeping {} for its ignored content", name);
			Ok(())
		}
		other => other,
	}
}


// vim: ts=4
