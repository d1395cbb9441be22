//! Sync session configuration
//!
//! The configuration follows a priority chain:
//! 1. Built-in defaults (SyncConfig::default())
//! 2. Config file (`.toml`, `.json` or `.json5`)
//! 3. CLI flags (highest priority)

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::SyncError;
use crate::strategies::{CompareBy, InitialSyncStrategy};

/// Directory below the sync root that is never synchronized
pub const STATE_DIR: &str = ".livesync/";

/// Staging area for files being unpacked, inside [`STATE_DIR`]
pub const STAGING_DIR: &str = ".livesync/tmp";

/// Whether a root-relative name lies in [`STATE_DIR`]
pub fn is_state_path(name: &str) -> bool {
	let dir = STATE_DIR.trim_end_matches('/');
	name.strip_prefix(dir).is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Configuration of one sync session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
	// ========================================================================
	// EXCLUSION
	// ========================================================================
	/// Gitignore-style patterns excluded in both directions
	pub exclude_paths: Vec<String>,

	/// Patterns never uploaded (and never deleted remotely)
	pub upload_exclude_paths: Vec<String>,

	/// Patterns never downloaded (and never deleted locally)
	pub download_exclude_paths: Vec<String>,

	// ========================================================================
	// INITIAL RECONCILIATION
	// ========================================================================
	pub initial_sync: InitialSyncStrategy,
	pub compare_by: CompareBy,

	// ========================================================================
	// WATCHING
	// ========================================================================
	/// Remote side walks the tree on every poll instead of watching it
	pub polling: bool,

	/// Interval between remote change polls
	pub polling_interval_ms: u64,

	/// Upstream batches close after this much quiet time
	pub batch_quiescence_ms: u64,

	/// Upstream batches close at this many changes
	pub max_batch_changes: usize,

	/// Upstream batches close after waiting this long
	pub max_batch_wait_secs: u64,

	/// Bounded watcher queue; overflowing it forces a full rescan
	pub event_queue_size: usize,

	// ========================================================================
	// TRANSFER
	// ========================================================================
	/// Initial upload candidates handed to upstream per batch
	pub initial_upstream_batch_size: usize,

	/// Paths per remove message
	pub remove_batch_size: usize,

	/// Upload attempts per batch before the session fails
	pub sync_retries: u32,

	/// Delay between upload attempts
	pub retry_delay_ms: u64,

	/// Optional wall-clock limit for all attempts of one batch
	pub upload_retry_timeout_secs: Option<u64>,

	// ========================================================================
	// HEARTBEAT
	// ========================================================================
	/// Client ping interval (also the ping timeout)
	pub ping_interval_secs: u64,

	/// Remote helper exits without a ping for this long
	pub heartbeat_timeout_secs: u64,

	// ========================================================================
	// REMOTE
	// ========================================================================
	/// Apply uploaded mode and owner even to existing remote files
	pub override_permissions: bool,
}

impl Default for SyncConfig {
	fn default() -> Self {
		SyncConfig {
			exclude_paths: Vec::new(),
			upload_exclude_paths: Vec::new(),
			download_exclude_paths: Vec::new(),
			initial_sync: InitialSyncStrategy::PreferNewest,
			compare_by: CompareBy::MtimeSize,
			polling: false,
			polling_interval_ms: 1700,
			batch_quiescence_ms: 600,
			max_batch_changes: 25000,
			max_batch_wait_secs: 60,
			event_queue_size: 1000,
			initial_upstream_batch_size: 5000,
			remove_batch_size: 64,
			sync_retries: 5,
			retry_delay_ms: 1000,
			upload_retry_timeout_secs: None,
			ping_interval_secs: 15,
			heartbeat_timeout_secs: 60,
			override_permissions: false,
		}
	}
}

impl SyncConfig {
	/// Load a config file; the format follows the extension
	pub fn load(path: &Path) -> Result<Self, SyncError> {
		let content = std::fs::read_to_string(path)?;
		let invalid = |message: String| SyncError::InvalidConfig {
			message: format!("{}: {}", path.display(), message),
		};

		match path.extension().and_then(|e| e.to_str()) {
			Some("toml") => toml::from_str(&content).map_err(|e| invalid(e.to_string())),
			Some("json") | Some("json5") => {
				json5::from_str(&content).map_err(|e| invalid(e.to_string()))
			}
			other => Err(invalid(format!("unsupported config format {:?}", other))),
		}
	}

	/// Exclude patterns including the state directory
	pub fn effective_excludes(&self) -> Vec<String> {
		let mut patterns = vec![STATE_DIR.to_string()];
		patterns.extend(self.exclude_paths.iter().cloned());
		patterns
	}

	pub fn polling_interval(&self) -> Duration {
		Duration::from_millis(self.polling_interval_ms)
	}

	pub fn batch_quiescence(&self) -> Duration {
		Duration::from_millis(self.batch_quiescence_ms)
	}

	pub fn max_batch_wait(&self) -> Duration {
		Duration::from_secs(self.max_batch_wait_secs)
	}

	pub fn retry_delay(&self) -> Duration {
		Duration::from_millis(self.retry_delay_ms)
	}

	pub fn upload_retry_timeout(&self) -> Option<Duration> {
		self.upload_retry_timeout_secs.map(Duration::from_secs)
	}

	pub fn ping_interval(&self) -> Duration {
		Duration::from_secs(self.ping_interval_secs)
	}

	pub fn heartbeat_timeout(&self) -> Duration {
		Duration::from_secs(self.heartbeat_timeout_secs)
	}

	/// Reject values the session cannot work with
	pub fn validate(&self) -> Result<(), SyncError> {
		let checks = [
			(self.sync_retries == 0, "syncRetries must be at least 1"),
			(self.remove_batch_size == 0, "removeBatchSize must be at least 1"),
			(self.initial_upstream_batch_size == 0, "initialUpstreamBatchSize must be at least 1"),
			(self.event_queue_size == 0, "eventQueueSize must be at least 1"),
			(self.ping_interval_secs == 0, "pingIntervalSecs must be at least 1"),
			(
				self.heartbeat_timeout_secs <= self.ping_interval_secs,
				"heartbeatTimeoutSecs must exceed pingIntervalSecs",
			),
		];
		match checks.iter().find(|(failed, _)| *failed) {
			Some((_, message)) => Err(SyncError::InvalidConfig { message: message.to_string() }),
			None => Ok(()),
		}
	}
}


// vim: ts=4
