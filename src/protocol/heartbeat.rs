//! Heartbeat in both directions
//!
//! The client pings every connection periodically. The server side arms a
//! [`PingTimeout`]; when no ping arrives within the timeout the peer is
//! presumed dead and the timeout callback runs (the helper process exits).

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::client::RpcClient;
use super::ProtocolResult;
use crate::logging::*;

/// Tracks the last ping seen by a server
#[derive(Clone)]
pub struct PingTimeout {
	last_ping: Arc<Mutex<Instant>>,
	timeout: Duration,
}

impl PingTimeout {
	pub fn new(timeout: Duration) -> Self {
		PingTimeout { last_ping: Arc::new(Mutex::new(Instant::now())), timeout }
	}

	/// Record a ping
	pub fn touch(&self) {
		*self.last_ping.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
	}

	pub fn expired(&self) -> bool {
		self.last_ping.lock().unwrap_or_else(PoisonError::into_inner).elapsed() > self.timeout
	}

	/// Spawn the watchdog; `on_timeout` runs once when the timeout expires
	pub fn start<F>(&self, on_timeout: F) -> tokio::task::JoinHandle<()>
	where
		F: FnOnce() + Send + 'static,
	{
		let this = self.clone();
		let tick = (self.timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
		tokio::spawn(async move {
			loop {
				tokio::time::sleep(tick).await;
				if this.expired() {
					error!("No ping received within {:?}", this.timeout);
					on_timeout();
					return;
				}
			}
		})
	}
}

/// Ping `client` every `interval` until cancelled
///
/// Each ping must complete within `interval` as well. Returns the first
/// failure; the caller decides how to tear down.
pub async fn keep_alive(
	client: RpcClient,
	interval: Duration,
	cancel: CancellationToken,
) -> ProtocolResult<()> {
	loop {
		tokio::select! {
			_ = cancel.cancelled() => return Ok(()),
			_ = tokio::time::sleep(interval) => {}
		}
		client.ping(interval).await?;
		debug!("Ping ok");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicBool, Ordering};

	#[tokio::test]
	async fn test_timeout_fires_without_pings() {
		let fired = Arc::new(AtomicBool::new(false));
		let flag = fired.clone();
		let timeout = PingTimeout::new(Duration::from_millis(50));
		let handle = timeout.start(move || flag.store(true, Ordering::SeqCst));

		handle.await.unwrap();
		assert!(fired.load(Ordering::SeqCst));
	}

	#[tokio::test]
	async fn test_touch_postpones_timeout() {
		let timeout = PingTimeout::new(Duration::from_millis(200));
		tokio::time::sleep(Duration::from_millis(120)).await;
		timeout.touch();
		tokio::time::sleep(Duration::from_millis(120)).await;
		assert!(!timeout.expired());
	}
}

// vim: ts=4
