//! RPC client
//!
//! One reader task per connection demultiplexes incoming frames by call id.
//! Each call owns a bounded channel; a slow consumer therefore slows the
//! whole connection instead of buffering without limit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::ProtocolError;
use super::frame::{read_frame, Frame, FrameWriter};
use super::messages::{Message, Method};
use super::{Incoming, ProtocolResult, CALL_CHANNEL_SIZE};
use crate::logging::*;

type CallTable = Mutex<HashMap<u64, mpsc::Sender<Incoming>>>;

struct ClientInner {
	writer: FrameWriter,
	calls: CallTable,
	next_id: AtomicU64,
	closed: CancellationToken,
}

/// Client end of an RPC connection
#[derive(Clone)]
pub struct RpcClient {
	inner: Arc<ClientInner>,
}

impl RpcClient {
	/// Start a client over any duplex stream
	///
	/// Spawns the reader task, so this must run inside a tokio runtime.
	pub fn new<T>(stream: T) -> Self
	where
		T: AsyncRead + AsyncWrite + Send + 'static,
	{
		let (read_half, write_half) = tokio::io::split(stream);
		let inner = Arc::new(ClientInner {
			writer: FrameWriter::new(write_half),
			calls: Mutex::new(HashMap::new()),
			next_id: AtomicU64::new(1),
			closed: CancellationToken::new(),
		});

		let reader_inner = inner.clone();
		tokio::spawn(async move {
			let mut reader = BufReader::new(read_half);
			if let Err(e) = read_loop(&reader_inner, &mut reader).await {
				warn!("RPC connection failed: {}", e);
			} else {
				debug!("RPC connection closed by peer");
			}
			reader_inner.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
			reader_inner.closed.cancel();
		});

		RpcClient { inner }
	}

	/// Cancelled once the connection is gone
	pub fn closed(&self) -> CancellationToken {
		self.inner.closed.clone()
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.is_cancelled()
	}

	/// Start a new call
	pub async fn open(&self, method: Method) -> ProtocolResult<ClientCall> {
		if self.is_closed() {
			return Err(ProtocolError::Closed);
		}

		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = mpsc::channel(CALL_CHANNEL_SIZE);
		self.inner.calls.lock().unwrap_or_else(PoisonError::into_inner).insert(id, tx);

		let call = ClientCall { id, client: self.clone(), rx, send_closed: false };
		self.inner.writer.send(&Frame::Open { id, method }).await?;
		Ok(call)
	}

	/// Request/response call
	pub async fn unary(&self, method: Method, request: Message) -> ProtocolResult<Message> {
		let mut call = self.open(method).await?;
		call.send_message(request).await?;
		call.close_and_recv().await
	}

	/// Heartbeat round trip, bounded by `timeout`
	pub async fn ping(&self, timeout: Duration) -> ProtocolResult<()> {
		match tokio::time::timeout(timeout, self.unary(Method::Ping, Message::Empty)).await?? {
			Message::Empty => Ok(()),
			other => Err(ProtocolError::ProtocolViolation(format!(
				"unexpected {} answer to ping",
				other.kind()
			))),
		}
	}

	/// Close the outgoing stream; the peer sees end of input
	pub async fn shutdown(&self) {
		if let Err(e) = self.inner.writer.shutdown().await {
			debug!("Closing RPC stream failed: {}", e);
		}
	}

	async fn send(&self, frame: Frame) -> ProtocolResult<()> {
		if self.is_closed() {
			return Err(ProtocolError::Closed);
		}
		self.inner.writer.send(&frame).await
	}

	fn forget(&self, id: u64) {
		self.inner.calls.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
	}
}

async fn read_loop<R>(inner: &ClientInner, reader: &mut R) -> ProtocolResult<()>
where
	R: tokio::io::AsyncBufRead + Unpin,
{
	while let Some(frame) = read_frame(reader).await? {
		let id = frame.id();
		let (incoming, last) = match frame {
			Frame::Message { body, .. } => (Incoming::Message(body), false),
			Frame::Chunk { data, .. } => (Incoming::Chunk(data), false),
			Frame::End { .. } => (Incoming::End, true),
			Frame::Error { msg, fatal, .. } => (Incoming::Error { msg, fatal }, true),
			Frame::Open { .. } => {
				return Err(ProtocolError::ProtocolViolation(
					"server tried to open a call".to_string(),
				));
			}
		};

		let sender = {
			let mut calls = inner.calls.lock().unwrap_or_else(PoisonError::into_inner);
			if last {
				calls.remove(&id)
			} else {
				calls.get(&id).cloned()
			}
		};
		match sender {
			Some(sender) => {
				if sender.send(incoming).await.is_err() {
					// caller dropped the call, discard the rest
					inner.calls.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
				}
			}
			None => debug!("Dropping frame for unknown call {}", id),
		}
	}
	Ok(())
}

/// One in-flight call
pub struct ClientCall {
	id: u64,
	client: RpcClient,
	rx: mpsc::Receiver<Incoming>,
	send_closed: bool,
}

impl ClientCall {
	pub async fn send_message(&mut self, body: Message) -> ProtocolResult<()> {
		self.client.send(Frame::Message { id: self.id, body }).await
	}

	pub async fn send_chunk(&mut self, data: Vec<u8>) -> ProtocolResult<()> {
		self.client.send(Frame::Chunk { id: self.id, data }).await
	}

	/// Half-close: nothing more will be sent on this call
	pub async fn close_send(&mut self) -> ProtocolResult<()> {
		if self.send_closed {
			return Ok(());
		}
		self.send_closed = true;
		self.client.send(Frame::End { id: self.id }).await
	}

	/// Fail the call on the server side
	pub async fn abort(mut self, reason: &str) -> ProtocolResult<()> {
		self.send_closed = true;
		let frame = Frame::Error { id: self.id, msg: reason.to_string(), fatal: false };
		self.client.send(frame).await
	}

	/// Next item from the server, `None` once the server finished the call
	pub async fn recv(&mut self) -> ProtocolResult<Option<Incoming>> {
		match self.rx.recv().await {
			None => Err(ProtocolError::Closed),
			Some(Incoming::End) => Ok(None),
			Some(Incoming::Error { msg, fatal: true }) => Err(ProtocolError::RemoteFatal(msg)),
			Some(Incoming::Error { msg, .. }) => Err(ProtocolError::Remote(msg)),
			Some(other) => Ok(Some(other)),
		}
	}

	pub async fn recv_message(&mut self) -> ProtocolResult<Option<Message>> {
		match self.recv().await? {
			None => Ok(None),
			Some(Incoming::Message(body)) => Ok(Some(body)),
			Some(_) => Err(ProtocolError::ProtocolViolation(
				"expected a message, got a data chunk".to_string(),
			)),
		}
	}

	pub async fn recv_chunk(&mut self) -> ProtocolResult<Option<Vec<u8>>> {
		match self.recv().await? {
			None => Ok(None),
			Some(Incoming::Chunk(data)) => Ok(Some(data)),
			Some(_) => Err(ProtocolError::ProtocolViolation(
				"expected a data chunk, got a message".to_string(),
			)),
		}
	}

	/// Half-close and wait for the single response message
	pub async fn close_and_recv(mut self) -> ProtocolResult<Message> {
		self.close_send().await?;
		let response = self.recv_message().await?.ok_or_else(|| {
			ProtocolError::ProtocolViolation("call finished without a response".to_string())
		})?;
		if self.recv().await?.is_some() {
			return Err(ProtocolError::ProtocolViolation(
				"more than one response to a unary call".to_string(),
			));
		}
		Ok(response)
	}
}

impl Drop for ClientCall {
	fn drop(&mut self) {
		self.client.forget(self.id);
		if self.send_closed || self.client.is_closed() {
			return;
		}
		// abandoned mid-stream: fail the call so the handler does not wait forever
		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			let client = self.client.clone();
			let id = self.id;
			handle.spawn(async move {
				let msg = "call cancelled by client".to_string();
				let frame = Frame::Error { id, msg, fatal: false };
				if let Err(e) = client.send(frame).await {
					debug!("Cancelling call {} failed: {}", id, e);
				}
			});
		}
	}
}

// vim: ts=4
