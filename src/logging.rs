//! Logging prelude module for convenient access to tracing macros.
//!
//! # Usage
//!
//! ```ignore
//! use crate::logging::*;
//!
//! info!("[upstream] uploaded {} entries", n);
//! debug!("Skipping vanished {}", name);
//! ```

pub use tracing::{debug, error, info, warn};

/// Initialize the tracing subscriber with environment filter support.
///
/// Logs always go to stderr: the remote helper speaks the sync protocol on
/// stdout. By default, logs at INFO level and above are displayed. Control the
/// log level with the `RUST_LOG` environment variable:
///
/// ```bash
/// RUST_LOG=debug livesync sync ./app -- ssh host livesync serve-upstream /app
/// RUST_LOG=livesync::sync=trace,livesync::protocol=debug livesync ...
/// ```
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.with_writer(std::io::stderr)
		.try_init();
}

// vim: ts=4
