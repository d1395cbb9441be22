//! RPC server
//!
//! Every `OPEN` frame spawns a handler task; later frames with the same id are
//! routed to that task's channel.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;

use super::error::ProtocolError;
use super::frame::{read_frame, Frame, FrameWriter};
use super::messages::{Message, Method};
use super::{Incoming, ProtocolResult, CALL_CHANNEL_SIZE};
use crate::logging::*;

/// Server-side call handler
#[async_trait]
pub trait Service: Send + Sync + 'static {
	/// Handle one call; returning `Ok` finishes the call, `Err` fails it
	async fn handle(&self, method: Method, call: &mut ServerCall) -> ProtocolResult<()>;
}

/// Serves a [`Service`] over duplex streams
pub struct RpcServer<S> {
	service: Arc<S>,
}

impl<S: Service> RpcServer<S> {
	pub fn new(service: S) -> Self {
		RpcServer { service: Arc::new(service) }
	}

	pub fn from_arc(service: Arc<S>) -> Self {
		RpcServer { service }
	}

	/// Serve calls until the peer closes its stream
	pub async fn serve<T>(&self, stream: T) -> ProtocolResult<()>
	where
		T: AsyncRead + AsyncWrite + Send + 'static,
	{
		let (read_half, write_half) = tokio::io::split(stream);
		let writer = Arc::new(FrameWriter::new(write_half));
		let mut reader = BufReader::new(read_half);
		let mut calls: HashMap<u64, mpsc::Sender<Incoming>> = HashMap::new();

		while let Some(frame) = read_frame(&mut reader).await? {
			let id = frame.id();
			let (incoming, last) = match frame {
				Frame::Open { id, method } => {
					let (tx, rx) = mpsc::channel(CALL_CHANNEL_SIZE);
					calls.insert(id, tx);
					self.spawn_call(id, method, rx, writer.clone());
					continue;
				}
				Frame::Message { body, .. } => (Incoming::Message(body), false),
				Frame::Chunk { data, .. } => (Incoming::Chunk(data), false),
				Frame::End { .. } => (Incoming::End, true),
				Frame::Error { msg, fatal, .. } => (Incoming::Error { msg, fatal }, true),
			};

			let Some(sender) = (if last { calls.remove(&id) } else { calls.get(&id).cloned() })
			else {
				debug!("Dropping frame for finished call {}", id);
				continue;
			};
			if sender.send(incoming).await.is_err() {
				calls.remove(&id);
			}
		}

		debug!("Client closed the connection");
		Ok(())
	}

	fn spawn_call(
		&self,
		id: u64,
		method: Method,
		rx: mpsc::Receiver<Incoming>,
		writer: Arc<FrameWriter>,
	) {
		let service = self.service.clone();
		tokio::spawn(async move {
			let mut call = ServerCall { id, rx, writer: writer.clone(), finished: false };
			match service.handle(method, &mut call).await {
				Ok(()) => {
					if let Err(e) = call.finish().await {
						debug!("Finishing {} call {} failed: {}", method, id, e);
					}
				}
				Err(e) => {
					warn!("{} call failed: {}", method, e);
					let frame = Frame::Error { id, msg: e.to_string(), fatal: e.is_fatal() };
					if let Err(e) = writer.send(&frame).await {
						debug!("Reporting {} failure failed: {}", method, e);
					}
				}
			}
		});
	}
}

/// Server end of one call
pub struct ServerCall {
	id: u64,
	rx: mpsc::Receiver<Incoming>,
	writer: Arc<FrameWriter>,
	finished: bool,
}

impl ServerCall {
	/// Next item from the client, `None` once the client half-closed
	pub async fn recv(&mut self) -> ProtocolResult<Option<Incoming>> {
		match self.rx.recv().await {
			None | Some(Incoming::End) => Ok(None),
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

	/// Read the single request message of a unary call
	pub async fn request(&mut self) -> ProtocolResult<Message> {
		let request = self.recv_message().await?.ok_or_else(|| {
			ProtocolError::ProtocolViolation("call closed without a request".to_string())
		})?;
		while self.recv().await?.is_some() {}
		Ok(request)
	}

	pub async fn send_message(&mut self, body: Message) -> ProtocolResult<()> {
		self.writer.send(&Frame::Message { id: self.id, body }).await
	}

	pub async fn send_chunk(&mut self, data: Vec<u8>) -> ProtocolResult<()> {
		self.writer.send(&Frame::Chunk { id: self.id, data }).await
	}

	/// End the call; further sends are a protocol error on the client side
	pub async fn finish(&mut self) -> ProtocolResult<()> {
		if self.finished {
			return Ok(());
		}
		self.finished = true;
		self.writer.send(&Frame::End { id: self.id }).await
	}
}

// vim: ts=4
