//! Bounded, append-only output buffer with independent readers.
//!
//! Each chunk gets a sequence number. A chunk larger than the capacity keeps
//! only its tail. When the retained bytes exceed the capacity the oldest
//! chunks are dropped; a reader whose cursor points at dropped chunks is
//! told how many it missed and resumes at the oldest retained one.

use std::{collections::VecDeque, sync::Arc};

use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

/// Pipe a chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSource {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Item of an output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    /// A chunk of output, at most one line.
    Chunk {
        /// Position in the log.
        seq: u64,
        /// Originating pipe.
        source: OutputSource,
        /// Chunk text; invalid UTF-8 is replaced.
        text: Arc<str>,
    },
    /// The reader fell behind the retained window and `skipped` chunks were
    /// lost.
    Truncated {
        /// Number of chunks the reader missed.
        skipped: u64,
    },
}

#[derive(Debug, Clone)]
struct Chunk {
    seq: u64,
    source: OutputSource,
    text: Arc<str>,
}

#[derive(Debug, Default)]
struct LogState {
    chunks: VecDeque<Chunk>,
    next_seq: u64,
    bytes: usize,
    closed: bool,
}

struct ReadBatch {
    skipped: u64,
    chunks: Vec<Chunk>,
    next: u64,
    closed: bool,
}

/// Byte-bounded output of one job.
#[derive(Debug)]
pub struct OutputLog {
    capacity: usize,
    state: Mutex<LogState>,
    changed: Notify,
}

impl OutputLog {
    /// Empty log retaining at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LogState::default()),
            changed: Notify::new(),
        }
    }

    /// Append a chunk, evicting the oldest ones to stay within capacity.
    pub fn push(&self, source: OutputSource, text: impl Into<Arc<str>>) {
        let mut text = text.into();
        if text.len() > self.capacity {
            text = Arc::from(tail(&text, self.capacity));
        }
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.bytes += text.len();
            state.chunks.push_back(Chunk { seq, source, text });

            // The newest chunk always fits; only older ones are evicted.
            while state.bytes > self.capacity && state.chunks.len() > 1 {
                if let Some(evicted) = state.chunks.pop_front() {
                    state.bytes -= evicted.text.len();
                }
            }
        }
        self.changed.notify_waiters();
    }

    /// Mark the log complete; readers end once they have drained it.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_waiters();
    }

    /// No more output will arrive.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Bytes currently held.
    pub fn retained_bytes(&self) -> usize {
        self.state.lock().bytes
    }

    /// Stream every event from the start of the log until it is closed.
    pub fn attach(self: Arc<Self>) -> impl Stream<Item = OutputEvent> + Send + 'static {
        async_stream::stream! {
            let mut cursor = 0u64;
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let batch = self.read_from(cursor);
                if batch.skipped > 0 {
                    yield OutputEvent::Truncated { skipped: batch.skipped };
                }
                for chunk in batch.chunks {
                    yield OutputEvent::Chunk {
                        seq: chunk.seq,
                        source: chunk.source,
                        text: chunk.text,
                    };
                }
                cursor = batch.next;

                if batch.closed {
                    break;
                }
                notified.await;
            }
        }
    }

    fn read_from(&self, cursor: u64) -> ReadBatch {
        let state = self.state.lock();
        let first = state
            .chunks
            .front()
            .map_or(state.next_seq, |chunk| chunk.seq);
        let start = cursor.max(first);

        ReadBatch {
            skipped: first.saturating_sub(cursor),
            chunks: state
                .chunks
                .iter()
                .filter(|chunk| chunk.seq >= start)
                .cloned()
                .collect(),
            next: state.next_seq,
            closed: state.closed,
        }
    }
}

/// The last `max_bytes` bytes of `text`, starting on a character boundary.
fn tail(text: &str, max_bytes: usize) -> &str {
    let mut start = text.len().saturating_sub(max_bytes);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
