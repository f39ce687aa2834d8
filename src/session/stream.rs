//! Finish-once, close-once byte pipe for session output.
//!
//! Writers append; readers consume in order and block while the buffer is
//! empty. `finish` marks the end of input: readers drain whatever is still
//! buffered and then see EOF. `close` releases the buffer outright.

use bytes::{Buf, BytesMut};
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    buf: BytesMut,
    finished: bool,
    closed: bool,
}

/// Buffered output stream shared by one copy task and any number of readers.
#[derive(Default)]
pub struct BufferedStream {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl std::fmt::Debug for BufferedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("BufferedStream")
            .field("buffered", &inner.buf.len())
            .field("finished", &inner.finished)
            .field("closed", &inner.closed)
            .finish()
    }
}

impl BufferedStream {
    /// Creates an empty, open stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `data`.
    ///
    /// # Errors
    ///
    /// Returns `BrokenPipe` once the stream is finished or closed.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        {
            let mut inner = self.lock();
            if inner.finished || inner.closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "stream no longer accepts data",
                ));
            }
            inner.buf.extend_from_slice(data);
        }
        self.notify.notify_waiters();
        Ok(data.len())
    }

    /// Marks the end of input. Idempotent.
    pub fn finish(&self) {
        self.lock().finished = true;
        self.notify.notify_waiters();
    }

    /// Drops buffered data and ends every reader. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.closed = true;
            inner.finished = true;
            inner.buf.clear();
        }
        self.notify.notify_waiters();
    }

    /// Returns true once `finish` or `close` was called.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Returns true once `close` was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of bytes buffered and not yet read.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.lock().buf.len()
    }

    /// Reads into `buf`, waiting for data. Returns 0 at EOF.
    pub async fn read(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a write in between is not missed.
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if !inner.buf.is_empty() {
                    let n = buf.len().min(inner.buf.len());
                    buf[..n].copy_from_slice(&inner.buf[..n]);
                    inner.buf.advance(n);
                    return n;
                }
                if inner.finished {
                    return 0;
                }
            }
            notified.await;
        }
    }

    /// Reads until EOF.
    pub async fn read_to_end(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(&mut chunk).await;
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }
}
