//! Streaming RPC transport
//!
//! A small call-multiplexing protocol over any duplex byte stream. The sync
//! engine only sees [`RpcClient`] on the local side and implements
//! [`Service`] on the remote side; how the stream was obtained (child process
//! pipes, a socket, an in-memory pipe in tests) is irrelevant to it.
//!
//! # Example Usage
//!
//! ```ignore
//! use livesync::protocol::{Message, Method, RpcClient, StreamJoint};
//!
//! let client = RpcClient::new(StreamJoint::new(child_stdout, child_stdin));
//! let amount = client.unary(Method::ChangesCount, Message::Empty).await?;
//! ```

pub mod client;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod joint;
pub mod messages;
pub mod server;

pub use client::{ClientCall, RpcClient};
pub use error::ProtocolError;
pub use heartbeat::{keep_alive, PingTimeout};
pub use joint::StreamJoint;
pub use messages::{Message, Method};
pub use server::{RpcServer, ServerCall, Service};

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Buffered items per call before the connection reader waits
pub const CALL_CHANNEL_SIZE: usize = 64;

/// Archive payloads are sent in chunks of this size
pub const CHUNK_SIZE: usize = 16 * 1024;

/// One item received on a call
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
	Message(Message),
	Chunk(Vec<u8>),
	End,
	Error { msg: String, fatal: bool },
}

// vim: ts=4
