//! Remote helper entry points
//!
//! The helper is started once per leg inside the remote environment and
//! speaks the RPC protocol over its own stdin/stdout. Both entry points exit
//! the process when either stream closes or when no ping arrived within the
//! heartbeat timeout, so a lost client never leaves a helper behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::archive::RemoteUnpackOptions;
use crate::error::{SyncError, SyncResult};
use crate::exclusion::{GitignoreMatcher, IgnoreMatcher};
use crate::logging::*;
use crate::protocol::{PingTimeout, RpcServer, Service, StreamJoint};
use crate::remote::{ChangeSource, DownstreamService, NotifySource, PollingSource, UpstreamService};

/// Settings of a remote helper
#[derive(Debug, Clone)]
pub struct ServeOptions {
	pub exclude: Vec<String>,
	pub polling: bool,
	pub override_permissions: bool,
	pub event_queue_size: usize,
	pub heartbeat_timeout: Duration,
}

impl Default for ServeOptions {
	fn default() -> Self {
		ServeOptions {
			exclude: Vec::new(),
			polling: false,
			override_permissions: false,
			event_queue_size: 1000,
			heartbeat_timeout: Duration::from_secs(60),
		}
	}
}

impl ServeOptions {
	fn matcher(&self) -> SyncResult<Option<Arc<dyn IgnoreMatcher>>> {
		if self.exclude.is_empty() {
			return Ok(None);
		}
		Ok(Some(Arc::new(GitignoreMatcher::new(&self.exclude)?)))
	}
}

/// Serve the upload leg for `dir` over stdin/stdout
pub async fn serve_upstream(dir: &Path, options: ServeOptions) -> SyncResult<()> {
	let root = canonical_root(dir)?;
	let ping = PingTimeout::new(options.heartbeat_timeout);
	let service = UpstreamService::new(root.clone(), options.matcher()?)
		.with_unpack_options(RemoteUnpackOptions {
			override_permissions: options.override_permissions,
		})
		.with_ping_timeout(ping.clone());

	info!("Serving upstream for {:?}", root);
	serve_stdio(service, ping).await
}

/// Serve the download leg for `dir` over stdin/stdout
pub async fn serve_downstream(dir: &Path, options: ServeOptions) -> SyncResult<()> {
	let root = canonical_root(dir)?;
	let matcher = options.matcher()?;
	let source: Box<dyn ChangeSource> = if options.polling {
		Box::new(PollingSource::new(root.clone(), matcher))
	} else {
		let source = NotifySource::new(root.clone(), matcher, options.event_queue_size)
			.map_err(|e| SyncError::fatal("downstream", format!("watch failed: {}", e)))?;
		Box::new(source)
	};

	let ping = PingTimeout::new(options.heartbeat_timeout);
	let service = DownstreamService::new(root.clone(), source).with_ping_timeout(ping.clone());

	info!("Serving downstream for {:?} ({})", root, if options.polling { "polling" } else { "notify" });
	serve_stdio(service, ping).await
}

fn canonical_root(dir: &Path) -> SyncResult<PathBuf> {
	let root = std::fs::canonicalize(dir)?;
	if !root.is_dir() {
		return Err(SyncError::InvalidConfig { message: format!("{:?} is not a directory", root) });
	}
	Ok(root)
}

async fn serve_stdio<S: Service>(service: S, ping: PingTimeout) -> SyncResult<()> {
	ping.start(|| std::process::exit(1));

	let stream = StreamJoint::new(tokio::io::stdin(), tokio::io::stdout()).exit_on_close();
	RpcServer::new(service)
		.serve(stream)
		.await
		.map_err(|e| SyncError::protocol("serve", e))
}


// vim: ts=4
