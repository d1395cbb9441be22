//! Frame codec
//!
//! Every frame starts with one JSON header line. `CHK` headers are followed by
//! exactly `len` raw bytes and a newline:
//!
//! ```text
//! {"cmd":"OPEN","id":1,"mth":"download"}
//! {"cmd":"MSG","id":1,"body":{"typ":"PATHS","paths":["src/main.rs"]}}
//! {"cmd":"END","id":1}
//! {"cmd":"CHK","id":1,"len":5}
//! hello
//! {"cmd":"END","id":1}
//! {"cmd":"ERR","id":2,"msg":"corrupt archive","fatal":true}
//! ```

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::error::ProtocolError;
use super::messages::{Message, Method};
use super::ProtocolResult;

/// Largest accepted chunk payload
pub const MAX_CHUNK_LEN: usize = 4 * 1024 * 1024;

/// One protocol frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
	Open { id: u64, method: Method },
	Message { id: u64, body: Message },
	Chunk { id: u64, data: Vec<u8> },
	End { id: u64 },
	Error { id: u64, msg: String, fatal: bool },
}

impl Frame {
	pub fn id(&self) -> u64 {
		match self {
			Frame::Open { id, .. }
			| Frame::Message { id, .. }
			| Frame::Chunk { id, .. }
			| Frame::End { id }
			| Frame::Error { id, .. } => *id,
		}
	}
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "cmd")]
enum Header {
	#[serde(rename = "OPEN")]
	Open { id: u64, mth: Method },
	#[serde(rename = "MSG")]
	Msg { id: u64, body: Message },
	#[serde(rename = "CHK")]
	Chk { id: u64, len: usize },
	#[serde(rename = "END")]
	End { id: u64 },
	#[serde(rename = "ERR")]
	Err {
		id: u64,
		msg: String,
		#[serde(default, skip_serializing_if = "is_false")]
		fatal: bool,
	},
}

fn is_false(value: &bool) -> bool {
	!*value
}

/// Read the next frame, `None` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R) -> ProtocolResult<Option<Frame>>
where
	R: AsyncBufRead + Unpin,
{
	let mut line = String::new();
	loop {
		line.clear();
		if reader.read_line(&mut line).await? == 0 {
			return Ok(None);
		}
		if !line.trim().is_empty() {
			break;
		}
	}

	let header: Header = serde_json::from_str(line.trim())?;
	let frame = match header {
		Header::Open { id, mth } => Frame::Open { id, method: mth },
		Header::Msg { id, body } => Frame::Message { id, body },
		Header::End { id } => Frame::End { id },
		Header::Err { id, msg, fatal } => Frame::Error { id, msg, fatal },
		Header::Chk { id, len } => {
			if len > MAX_CHUNK_LEN {
				return Err(ProtocolError::ProtocolViolation(format!(
					"chunk of {} bytes exceeds limit",
					len
				)));
			}
			let mut data = vec![0u8; len];
			reader.read_exact(&mut data).await?;
			let mut terminator = [0u8; 1];
			reader.read_exact(&mut terminator).await?;
			if terminator[0] != b'\n' {
				return Err(ProtocolError::ProtocolViolation(
					"chunk payload not terminated by newline".to_string(),
				));
			}
			Frame::Chunk { id, data }
		}
	};
	Ok(Some(frame))
}

/// Encode a frame into its wire bytes
pub fn encode_frame(frame: &Frame) -> ProtocolResult<Vec<u8>> {
	let (header, payload) = match frame {
		Frame::Open { id, method } => (Header::Open { id: *id, mth: *method }, None),
		Frame::Message { id, body } => (Header::Msg { id: *id, body: body.clone() }, None),
		Frame::Chunk { id, data } => (Header::Chk { id: *id, len: data.len() }, Some(data)),
		Frame::End { id } => (Header::End { id: *id }, None),
		Frame::Error { id, msg, fatal } => {
			(Header::Err { id: *id, msg: msg.clone(), fatal: *fatal }, None)
		}
	};

	let mut buf = serde_json::to_vec(&header)?;
	buf.push(b'\n');
	if let Some(data) = payload {
		buf.extend_from_slice(data);
		buf.push(b'\n');
	}
	Ok(buf)
}

/// Write half of a connection, shared by every call on it
///
/// Frames are written whole under the lock so concurrent calls never
/// interleave their bytes.
pub struct FrameWriter {
	inner: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl FrameWriter {
	pub fn new<W>(writer: W) -> Self
	where
		W: AsyncWrite + Send + Unpin + 'static,
	{
		FrameWriter { inner: Mutex::new(Box::new(writer)) }
	}

	pub async fn send(&self, frame: &Frame) -> ProtocolResult<()> {
		let buf = encode_frame(frame)?;
		let mut writer = self.inner.lock().await;
		writer.write_all(&buf).await?;
		writer.flush().await?;
		Ok(())
	}

	/// Close the underlying stream
	pub async fn shutdown(&self) -> ProtocolResult<()> {
		let mut writer = self.inner.lock().await;
		writer.shutdown().await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::BufReader;

	#[tokio::test]
	async fn test_frames_survive_the_wire() {
		let frames = vec![
			Frame::Open { id: 1, method: Method::Download },
			Frame::Message { id: 1, body: Message::Paths { paths: vec!["a\nb".into()] } },
			Frame::Chunk { id: 1, data: b"bin\n\0ary".to_vec() },
			Frame::Chunk { id: 1, data: Vec::new() },
			Frame::End { id: 1 },
			Frame::Error { id: 2, msg: "boom".into(), fatal: false },
			Frame::Error { id: 3, msg: "corrupt".into(), fatal: true },
		];

		let mut wire = Vec::new();
		for frame in &frames {
			wire.extend(encode_frame(frame).unwrap());
		}

		let mut reader = BufReader::new(&wire[..]);
		for expected in &frames {
			assert_eq!(read_frame(&mut reader).await.unwrap().as_ref(), Some(expected));
		}
		assert!(read_frame(&mut reader).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_truncated_chunk_is_an_error() {
		let wire = b"{\"cmd\":\"CHK\",\"id\":1,\"len\":10}\nabc".to_vec();
		let mut reader = BufReader::new(&wire[..]);
		assert!(read_frame(&mut reader).await.is_err());
	}

	#[tokio::test]
	async fn test_garbage_header_is_rejected() {
		let wire = b"not json\n".to_vec();
		let mut reader = BufReader::new(&wire[..]);
		assert!(matches!(read_frame(&mut reader).await, Err(ProtocolError::Json(_))));
	}
}

// vim: ts=4
