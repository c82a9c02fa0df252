//! Bounded in-memory byte pipe with pause/resume hysteresis.
//!
//! The writer side appends chunks without suspending; `flush` is where
//! backpressure materializes. Once the buffered amount reaches the pause
//! threshold, `flush` suspends until the reader has drained the buffer to
//! half the threshold. The gap between the two thresholds stops a
//! producer/consumer pair from thrashing around a single boundary.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

#[derive(Debug)]
struct PipeState {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    write_closed: bool,
    read_closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<PipeState>,
    readable: Notify,
    writable: Notify,
    /// Buffered bytes at which `flush` starts suspending. Zero disables
    /// the bound entirely.
    pause_at: usize,
}

impl Shared {
    fn resume_at(&self) -> usize {
        self.pause_at / 2
    }
}

/// Create a pipe that pauses its producer at `max_pending` buffered bytes.
///
/// `max_pending == 0` means unbounded (flush never suspends).
pub fn pipe(max_pending: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(PipeState {
            chunks: VecDeque::new(),
            buffered: 0,
            write_closed: false,
            read_closed: false,
        }),
        readable: Notify::new(),
        writable: Notify::new(),
        pause_at: max_pending,
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

/// Producer half of a [`pipe`].
#[derive(Debug, Clone)]
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Append a chunk without suspending.
    ///
    /// Fails with `BrokenPipe` once the reader half has been closed.
    pub fn write(&self, data: Bytes) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut state = self.shared.state.lock().unwrap();
        if state.read_closed || state.write_closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe reader closed",
            ));
        }
        state.buffered += data.len();
        state.chunks.push_back(data);
        drop(state);
        self.shared.readable.notify_one();
        Ok(())
    }

    /// Whether a flush right now would have to suspend.
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        if self.shared.pause_at == 0 {
            return false;
        }
        self.shared.state.lock().unwrap().buffered >= self.shared.pause_at
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().unwrap().buffered
    }

    /// Wait for the buffer to drain below the resume threshold.
    ///
    /// Completes immediately while the buffer is under the pause
    /// threshold. Fails with `BrokenPipe` if the reader goes away while
    /// data is still pending.
    pub async fn flush(&self) -> io::Result<()> {
        {
            let state = self.shared.state.lock().unwrap();
            if state.read_closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe reader closed",
                ));
            }
            if self.shared.pause_at == 0 || state.buffered < self.shared.pause_at {
                return Ok(());
            }
        }
        loop {
            let drained = self.shared.writable.notified();
            {
                let state = self.shared.state.lock().unwrap();
                if state.read_closed {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "pipe reader closed",
                    ));
                }
                if state.buffered <= self.shared.resume_at() {
                    return Ok(());
                }
            }
            drained.await;
        }
    }

    /// Signal end of stream. The reader drains what is buffered and then
    /// observes EOF.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.write_closed = true;
        drop(state);
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
    }
}

/// Consumer half of a [`pipe`].
#[derive(Debug, Clone)]
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Wait for and take the next chunk; `None` once the writer has closed
    /// and the buffer is drained.
    pub async fn read(&self) -> Option<Bytes> {
        loop {
            let readable = self.shared.readable.notified();
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.read_closed {
                    return None;
                }
                if let Some(chunk) = state.chunks.pop_front() {
                    state.buffered -= chunk.len();
                    let below_resume = state.buffered <= self.shared.resume_at();
                    drop(state);
                    if below_resume {
                        self.shared.writable.notify_waiters();
                    }
                    return Some(chunk);
                }
                if state.write_closed {
                    return None;
                }
            }
            readable.await;
        }
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().unwrap().buffered
    }

    /// Tear the pipe down from the consumer side. Buffered data is
    /// discarded and pending or future writes fail with `BrokenPipe`.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.read_closed = true;
        state.chunks.clear();
        state.buffered = 0;
        drop(state);
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
    }
}
