//! Remote helper services
//!
//! The process running next to the remote tree serves two connections: one
//! for the upload leg ([`UpstreamService`]) and one for the download leg
//! ([`DownstreamService`]).

pub mod downstream;
pub mod upstream;
pub mod watch;

pub use downstream::{DownstreamService, CHANGE_BATCH_SIZE};
pub use upstream::UpstreamService;
pub use watch::{diff, ChangeSource, NotifySource, PollingSource, Snapshot};

// vim: ts=4
