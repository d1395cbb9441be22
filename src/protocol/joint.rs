//! Duplex stream built from two unidirectional streams
//!
//! The remote helper is reached through a process' standard input and output,
//! not a socket. [`StreamJoint`] glues a reader and a writer into one
//! `AsyncRead + AsyncWrite` object that the RPC layer can split again.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::logging::*;

/// Reader and writer joined into one duplex stream
pub struct StreamJoint<R, W> {
	reader: R,
	writer: W,
	exit_on_close: bool,
}

impl<R, W> StreamJoint<R, W> {
	pub fn new(reader: R, writer: W) -> Self {
		StreamJoint { reader, writer, exit_on_close: false }
	}

	/// Terminate the process once either half closes or fails
	///
	/// Used by the remote helper: a session whose peer is gone must not
	/// linger half-open.
	pub fn exit_on_close(mut self) -> Self {
		self.exit_on_close = true;
		self
	}

	fn closed(&self, what: &str, err: Option<&io::Error>) {
		if !self.exit_on_close {
			return;
		}
		match err {
			Some(e) => {
				error!("{} failed: {}, exiting", what, e);
				std::process::exit(1);
			}
			None => {
				info!("{} closed, exiting", what);
				std::process::exit(0);
			}
		}
	}
}

impl<R, W> AsyncRead for StreamJoint<R, W>
where
	R: AsyncRead + Unpin,
	W: Unpin,
{
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		let before = buf.filled().len();
		match Pin::new(&mut this.reader).poll_read(cx, buf) {
			Poll::Ready(Ok(())) => {
				if buf.remaining() > 0 && buf.filled().len() == before {
					this.closed("input stream", None);
				}
				Poll::Ready(Ok(()))
			}
			Poll::Ready(Err(e)) => {
				this.closed("input stream", Some(&e));
				Poll::Ready(Err(e))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

impl<R, W> AsyncWrite for StreamJoint<R, W>
where
	R: Unpin,
	W: AsyncWrite + Unpin,
{
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		data: &[u8],
	) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		match Pin::new(&mut this.writer).poll_write(cx, data) {
			Poll::Ready(Err(e)) => {
				this.closed("output stream", Some(&e));
				Poll::Ready(Err(e))
			}
			other => other,
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		match Pin::new(&mut this.writer).poll_flush(cx) {
			Poll::Ready(Err(e)) => {
				this.closed("output stream", Some(&e));
				Poll::Ready(Err(e))
			}
			other => other,
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
	}
}


// vim: ts=4
