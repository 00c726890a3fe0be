//! Output sinks: bounded per-execution capture and line-atomic funnelling.
//!
//! `BoundedSink` caps what one execution may keep in memory, no matter how
//! much the process writes. `LineSink` lets many producers share one
//! output without ever interleaving partial lines:
//!
//! ```text
//!   hop 1 stdout ──▶ LineSink ──┐
//!   hop 2 stdout ──▶ LineSink ──┼──▶ Arc<Mutex<W>> ──▶ stdout
//!   hop 3 stdout ──▶ LineSink ──┘      (whole lines only)
//! ```

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Appended once when a `BoundedSink` saturates. Not counted against the
/// sink's limit.
pub const TRUNCATION_MARKER: &str = "[...]";

/// A writer that keeps at most `limit` bytes and silently drops the rest.
///
/// The first write that fills the buffer appends [`TRUNCATION_MARKER`];
/// every write reports its full input length so the producing process
/// never sees an error or a short write from the capture side.
#[derive(Debug)]
pub struct BoundedSink {
    limit: usize,
    buf: Vec<u8>,
}

impl BoundedSink {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buf: Vec::with_capacity(limit.min(8192)),
        }
    }

    /// Consume the sink, yielding the captured bytes as a string.
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl io::Write for BoundedSink {
    fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        if self.buf.len() >= self.limit {
            return Ok(p.len());
        }
        let keep = p.len().min(self.limit - self.buf.len());
        self.buf.extend_from_slice(&p[..keep]);
        if self.buf.len() == self.limit {
            self.buf.extend_from_slice(TRUNCATION_MARKER.as_bytes());
        }
        Ok(p.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A line-aligned funnel over a shared writer.
///
/// Each instance buffers its own partial line; on the first newline in a
/// write, everything buffered up to and including it is drained to the
/// shared writer under the mutex, and the bytes after the newline are
/// retained for the next drain. Callers must terminate each logical
/// record with a newline — this is not a general multiplexer.
#[derive(Debug)]
pub struct LineSink<W> {
    shared: Arc<Mutex<W>>,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> LineSink<W> {
    pub fn new(shared: Arc<Mutex<W>>) -> Self {
        Self {
            shared,
            buf: Vec::new(),
        }
    }

    /// Buffer `p`, draining up to the first newline it contains.
    pub async fn write(&mut self, p: &[u8]) -> io::Result<()> {
        match p.iter().position(|&b| b == b'\n') {
            None => {
                self.buf.extend_from_slice(p);
            }
            Some(idx) => {
                self.buf.extend_from_slice(&p[..=idx]);
                {
                    let mut w = self.shared.lock().await;
                    w.write_all(&self.buf).await?;
                }
                self.buf.clear();
                self.buf.extend_from_slice(&p[idx + 1..]);
            }
        }
        Ok(())
    }

    /// Drain whatever is buffered, newline or not.
    pub async fn flush(&mut self) -> io::Result<()> {
        let mut w = self.shared.lock().await;
        w.write_all(&self.buf).await?;
        w.flush().await?;
        self.buf.clear();
        Ok(())
    }
}
