//! Gzip-compressed tar archives streamed in fixed-size chunks
//!
//! Archives are produced and consumed on blocking threads. [`ChannelWriter`]
//! and [`ChannelReader`] bridge them to the async call that moves the
//! chunks over the transport.

mod pack;
mod unpack;

pub use pack::{pack_paths, Archiver};
pub use unpack::{unpack_local, unpack_remote, LocalUnpackOptions, RemoteUnpackOptions};

use std::io::{self, Read, Write};
use std::path::{Component, Path};
use tokio::sync::mpsc;

use crate::error::ArchiveError;
use crate::protocol::CHUNK_SIZE;

/// Number of chunks buffered between the archive thread and the call
pub const ARCHIVE_CHANNEL_SIZE: usize = 16;

/// `Write` end that cuts the byte stream into [`CHUNK_SIZE`] chunks
pub struct ChannelWriter {
	tx: mpsc::Sender<Vec<u8>>,
	buf: Vec<u8>,
}

impl ChannelWriter {
	pub fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
		ChannelWriter { tx, buf: Vec::with_capacity(CHUNK_SIZE) }
	}

	fn send(&mut self, chunk: Vec<u8>) -> io::Result<()> {
		self.tx
			.blocking_send(chunk)
			.map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive receiver gone"))
	}
}

impl Write for ChannelWriter {
	fn write(&mut self, data: &[u8]) -> io::Result<usize> {
		let room = CHUNK_SIZE - self.buf.len();
		let taken = room.min(data.len());
		self.buf.extend_from_slice(&data[..taken]);
		if self.buf.len() == CHUNK_SIZE {
			let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
			self.send(chunk)?;
		}
		Ok(taken)
	}

	fn flush(&mut self) -> io::Result<()> {
		if !self.buf.is_empty() {
			let chunk = std::mem::take(&mut self.buf);
			self.send(chunk)?;
		}
		Ok(())
	}
}

/// `Read` end fed by chunks received from a call
pub struct ChannelReader {
	rx: mpsc::Receiver<Vec<u8>>,
	current: Vec<u8>,
	pos: usize,
}

impl ChannelReader {
	pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
		ChannelReader { rx, current: Vec::new(), pos: 0 }
	}
}

impl Read for ChannelReader {
	fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
		while self.pos >= self.current.len() {
			match self.rx.blocking_recv() {
				Some(chunk) => {
					self.current = chunk;
					self.pos = 0;
				}
				None => return Ok(0),
			}
		}
		let n = out.len().min(self.current.len() - self.pos);
		out[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
		self.pos += n;
		Ok(n)
	}
}

/// Index key of an archive entry; anything escaping the root is rejected
fn entry_name(path: &Path) -> Result<String, ArchiveError> {
	let mut parts = Vec::new();
	for component in path.components() {
		match component {
			Component::Normal(part) => parts.push(
				part.to_str()
					.ok_or_else(|| ArchiveError::Corrupt(format!("non UTF-8 path {:?}", path)))?
					.to_string(),
			),
			Component::CurDir => {}
			_ => {
				return Err(ArchiveError::Corrupt(format!("path {:?} escapes the root", path)));
			}
		}
	}
	if parts.is_empty() {
		return Err(ArchiveError::Corrupt("empty entry path".to_string()));
	}
	Ok(parts.join("/"))
}

/// Reader that fails instead of silently producing a short entry
///
/// A file that shrinks while it is archived would otherwise corrupt the tar
/// stream, since the header already announced its size.
struct ExactReader<R> {
	inner: R,
	remaining: u64,
}

impl<R: Read> Read for ExactReader<R> {
	fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
		if self.remaining == 0 {
			return Ok(0);
		}
		let max = out.len().min(self.remaining as usize);
		let n = self.inner.read(&mut out[..max])?;
		if n == 0 {
			return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "file shrank while archiving"));
		}
		self.remaining -= n as u64;
		Ok(n)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_entry_name() {
		assert_eq!(entry_name(Path::new("./a/b.txt")).unwrap(), "a/b.txt");
		assert!(entry_name(Path::new("../etc/passwd")).is_err());
		assert!(entry_name(Path::new("/etc/passwd")).is_err());
		assert!(entry_name(Path::new(".")).is_err());
	}

	#[tokio::test]
	async fn test_channel_writer_cuts_fixed_chunks() {
		let (tx, mut rx) = mpsc::channel(8);
		let writer = tokio::task::spawn_blocking(move || {
			let mut writer = ChannelWriter::new(tx);
			writer.write_all(&vec![7u8; CHUNK_SIZE * 2 + 10]).unwrap();
			writer.flush().unwrap();
		});

		let mut sizes = Vec::new();
		while let Some(chunk) = rx.recv().await {
			sizes.push(chunk.len());
		}
		writer.await.unwrap();
		assert_eq!(sizes, vec![CHUNK_SIZE, CHUNK_SIZE, 10]);
	}

	#[tokio::test]
	async fn test_channel_reader_joins_chunks() {
		let (tx, rx) = mpsc::channel(4);
		tx.send(b"hel".to_vec()).await.unwrap();
		tx.send(Vec::new()).await.unwrap();
		tx.send(b"lo".to_vec()).await.unwrap();
		drop(tx);

		let text = tokio::task::spawn_blocking(move || {
			let mut out = String::new();
			ChannelReader::new(rx).read_to_string(&mut out).unwrap();
			out
		})
		.await
		.unwrap();
		assert_eq!(text, "hello");
	}

	#[test]
	fn test_exact_reader_detects_short_input() {
		let mut reader = ExactReader { inner: &b"abc"[..], remaining: 5 };
		let mut out = Vec::new();
		assert!(reader.read_to_end(&mut out).is_err());

		let mut reader = ExactReader { inner: &b"abcdef"[..], remaining: 3 };
		let mut out = Vec::new();
		reader.read_to_end(&mut out).unwrap();
		assert_eq!(out, b"abc");
	}
}

// vim: ts=4
