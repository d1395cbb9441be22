//! # livesync - Bidirectional Live Directory Sync
//!
//! livesync keeps a local directory and a directory inside a remote
//! environment in sync, in both directions, while both sides keep changing.
//! The remote side is reached through a helper process that speaks a small
//! RPC protocol over its standard input and output; one helper serves the
//! upload leg, another one the download leg.
//!
//! A session starts with an initial reconciliation driven by an
//! [`InitialSyncStrategy`], then keeps both trees converged: local changes
//! are batched and uploaded as gzip tar archives, remote changes are polled
//! and downloaded the same way. A shared [`FileIndex`] of the last agreed
//! state decides what moves where and keeps the two legs from echoing each
//! other's writes.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use livesync::{RpcClient, Session, StreamJoint, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let upstream = RpcClient::new(StreamJoint::new(up_stdout, up_stdin));
//!     let downstream = RpcClient::new(StreamJoint::new(down_stdout, down_stdin));
//!
//!     let session = Session::start("./project".as_ref(), SyncConfig::default(), upstream, downstream).await?;
//!     session.done().cancelled().await;
//!     if let Some(err) = session.error().await {
//!         return Err(err.into());
//!     }
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod decision;
pub mod error;
pub mod exclusion;
pub mod index;
pub mod initial;
pub mod logging;
pub mod protocol;
pub mod remote;
pub mod serve;
pub mod strategies;
pub mod sync;
pub mod types;
pub mod util;

// Re-export commonly used types and functions
pub use config::SyncConfig;
pub use error::{ArchiveError, SyncError, SyncResult};
pub use index::{FileIndex, FileMap};
pub use initial::{Action, InitialSyncer};
pub use protocol::{ProtocolError, RpcClient, RpcServer, StreamJoint};
pub use strategies::{CompareBy, InitialSyncStrategy};
pub use sync::Session;
pub use types::{Change, ChangeType, FileInformation};

// vim: ts=4
