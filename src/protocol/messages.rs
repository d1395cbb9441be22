//! RPC methods and message bodies

use serde::{Deserialize, Serialize};

use crate::types::Change;

/// Remote procedures offered by the helper process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
	/// Heartbeat, unary
	Ping,
	/// Client streams a gzip tar, server unpacks it
	Upload,
	/// Client streams batches of paths to delete
	Remove,
	/// Server streams the diff against its last committed snapshot
	Changes,
	/// Unary: size of the pending diff, nothing is committed
	ChangesCount,
	/// Client streams paths, server answers with a gzip tar of them
	Download,
}

impl std::fmt::Display for Method {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Method::Ping => write!(f, "ping"),
			Method::Upload => write!(f, "upload"),
			Method::Remove => write!(f, "remove"),
			Method::Changes => write!(f, "changes"),
			Method::ChangesCount => write!(f, "changes-count"),
			Method::Download => write!(f, "download"),
		}
	}
}

/// Structured message carried inside a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "typ")]
pub enum Message {
	#[serde(rename = "EMPTY")]
	Empty,
	#[serde(rename = "PATHS")]
	Paths { paths: Vec<String> },
	#[serde(rename = "CHANGES")]
	ChangeChunk { changes: Vec<Change> },
	#[serde(rename = "AMOUNT")]
	ChangeAmount { amount: i64 },
}

impl Message {
	/// Short name for log and error messages
	pub fn kind(&self) -> &'static str {
		match self {
			Message::Empty => "EMPTY",
			Message::Paths { .. } => "PATHS",
			Message::ChangeChunk { .. } => "CHANGES",
			Message::ChangeAmount { .. } => "AMOUNT",
		}
	}
}


// vim: ts=4
