//! Protocol error types
//!
//! Error handling for the transport with conversions from the underlying
//! I/O and JSON errors.

use std::fmt;
use std::io;

/// Protocol error type
#[derive(Debug)]
pub enum ProtocolError {
	/// I/O error from async operations
	Io(io::Error),
	/// JSON parsing error
	Json(String),
	/// Protocol violation (unexpected format or state)
	ProtocolViolation(String),
	/// Connection closed before the call finished
	Closed,
	/// The peer answered the call with an error
	Remote(String),
	/// The peer failed the call and its state can no longer be trusted
	RemoteFatal(String),
	/// The peer did not answer in time
	Timeout,
	/// Generic error message
	Other(String),
}

impl ProtocolError {
	/// The connection or the peer's state is broken; retrying is pointless
	pub fn is_fatal(&self) -> bool {
		matches!(
			self,
			ProtocolError::Closed
				| ProtocolError::ProtocolViolation(_)
				| ProtocolError::Json(_)
				| ProtocolError::RemoteFatal(_)
		)
	}
}

impl fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ProtocolError::Io(e) => write!(f, "I/O error: {}", e),
			ProtocolError::Json(msg) => write!(f, "JSON parse error: {}", msg),
			ProtocolError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
			ProtocolError::Closed => write!(f, "Connection closed"),
			ProtocolError::Remote(msg) => write!(f, "Remote error: {}", msg),
			ProtocolError::RemoteFatal(msg) => write!(f, "Remote failure: {}", msg),
			ProtocolError::Timeout => write!(f, "Timed out waiting for peer"),
			ProtocolError::Other(msg) => write!(f, "{}", msg),
		}
	}
}

impl std::error::Error for ProtocolError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			ProtocolError::Io(e) => Some(e),
			_ => None,
		}
	}
}

// From implementations for automatic conversion
impl From<io::Error> for ProtocolError {
	fn from(e: io::Error) -> Self {
		ProtocolError::Io(e)
	}
}

impl From<String> for ProtocolError {
	fn from(e: String) -> Self {
		ProtocolError::Other(e)
	}
}

impl From<&str> for ProtocolError {
	fn from(e: &str) -> Self {
		ProtocolError::Other(e.to_string())
	}
}

impl From<serde_json::Error> for ProtocolError {
	fn from(e: serde_json::Error) -> Self {
		ProtocolError::Json(e.to_string())
	}
}

impl From<tokio::time::error::Elapsed> for ProtocolError {
	fn from(_: tokio::time::error::Elapsed) -> Self {
		ProtocolError::Timeout
	}
}

// vim: ts=4
