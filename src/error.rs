//! Error types for sync operations

use std::error::Error;
use std::fmt;
use std::io;

use crate::exclusion::ExclusionError;
use crate::protocol::ProtocolError;

/// Main error type for a sync session
#[derive(Debug)]
pub enum SyncError {
	/// I/O error
	Io(io::Error),

	/// Transport failure during an operation of one leg
	Protocol { context: String, source: ProtocolError },

	/// Archive could not be written or read
	Archive(ArchiveError),

	/// Invalid configuration
	InvalidConfig { message: String },

	/// Upload retries exhausted
	RetriesExhausted { leg: &'static str, attempts: u32, last: String },

	/// Unrecoverable failure of one leg
	Fatal { leg: &'static str, message: String },

	/// Session was stopped
	Stopped,
}

impl SyncError {
	pub fn protocol(context: impl Into<String>, source: ProtocolError) -> Self {
		SyncError::Protocol { context: context.into(), source }
	}

	pub fn fatal(leg: &'static str, message: impl fmt::Display) -> Self {
		SyncError::Fatal { leg, message: message.to_string() }
	}

	/// Retrying cannot help; the session must stop
	pub fn is_fatal(&self) -> bool {
		match self {
			SyncError::Protocol { source, .. } => source.is_fatal(),
			// part of a broken stream may already be applied
			SyncError::Archive(ArchiveError::Corrupt(_)) => true,
			SyncError::Io(_) | SyncError::Archive(ArchiveError::Io(_)) => false,
			SyncError::InvalidConfig { .. }
			| SyncError::RetriesExhausted { .. }
			| SyncError::Fatal { .. }
			| SyncError::Stopped => true,
		}
	}
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::Io(e) => write!(f, "I/O error: {}", e),
			SyncError::Protocol { context, source } => write!(f, "{}: {}", context, source),
			SyncError::Archive(e) => write!(f, "Archive error: {}", e),
			SyncError::InvalidConfig { message } => {
				write!(f, "Invalid configuration: {}", message)
			}
			SyncError::RetriesExhausted { leg, attempts, last } => {
				write!(f, "[{}] giving up after {} attempts: {}", leg, attempts, last)
			}
			SyncError::Fatal { leg, message } => write!(f, "[{}] {}", leg, message),
			SyncError::Stopped => write!(f, "Sync session stopped"),
		}
	}
}

impl Error for SyncError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			SyncError::Io(e) => Some(e),
			SyncError::Protocol { source, .. } => Some(source),
			SyncError::Archive(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for SyncError {
	fn from(e: io::Error) -> Self {
		SyncError::Io(e)
	}
}

impl From<ArchiveError> for SyncError {
	fn from(e: ArchiveError) -> Self {
		SyncError::Archive(e)
	}
}

impl From<ExclusionError> for SyncError {
	fn from(e: ExclusionError) -> Self {
		SyncError::InvalidConfig { message: e.to_string() }
	}
}

impl From<tokio::task::JoinError> for SyncError {
	fn from(e: tokio::task::JoinError) -> Self {
		SyncError::Io(io::Error::other(e.to_string()))
	}
}

/// Archive (tar + gzip) errors
#[derive(Debug)]
pub enum ArchiveError {
	/// Reading or writing the archive or the tree failed
	Io(io::Error),

	/// The archive stream is malformed
	Corrupt(String),
}

impl fmt::Display for ArchiveError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ArchiveError::Io(e) => write!(f, "I/O error: {}", e),
			ArchiveError::Corrupt(msg) => write!(f, "Corrupt archive: {}", msg),
		}
	}
}

impl Error for ArchiveError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			ArchiveError::Io(e) => Some(e),
			ArchiveError::Corrupt(_) => None,
		}
	}
}

impl From<io::Error> for ArchiveError {
	fn from(e: io::Error) -> Self {
		ArchiveError::Io(e)
	}
}

/// Result type for session operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_error_display_names_the_leg() {
		let err = SyncError::RetriesExhausted {
			leg: "upstream",
			attempts: 5,
			last: "Connection closed".into(),
		};
		assert_eq!(err.to_string(), "[upstream] giving up after 5 attempts: Connection closed");

		let err = SyncError::protocol("[downstream] changes", ProtocolError::Timeout);
		assert!(err.to_string().starts_with("[downstream] changes"));
		assert!(err.source().is_some());
	}

	#[test]
	fn test_fatal_classification() {
		let upload = |e: ProtocolError| SyncError::protocol("upload", e);
		assert!(upload(ProtocolError::Closed).is_fatal());
		assert!(!upload(ProtocolError::Remote("disk full".into())).is_fatal());
		assert!(upload(ProtocolError::RemoteFatal("corrupt archive".into())).is_fatal());
		assert!(SyncError::Archive(ArchiveError::Corrupt("eof".into())).is_fatal());
		let disk_full = io::Error::other("no space left");
		assert!(!SyncError::Archive(ArchiveError::Io(disk_full)).is_fatal());
		assert!(SyncError::Stopped.is_fatal());
	}

	#[test]
	fn test_io_conversion() {
		let err: SyncError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
		assert!(matches!(err, SyncError::Io(_)));
	}
}

// vim: ts=4
