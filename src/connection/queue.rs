//! Ordered queue of in-flight requests.
//!
//! Entries move `staged → written → done`. The writer fuses the coalescible
//! staged prefix into one socket write; the reader consumes responses for
//! the written head in FIFO order. New writes are gated until every written
//! response has been consumed, so the reader and writer never touch the
//! same entry concurrently.

use std::any::Any;
use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::adapter::{AdapterError, ErasedAdapter};
use crate::core::error::{RedmuxError, RedmuxResult};
use crate::resp3::Request;

/// Completion payload delivered to the submitting caller: the recovered
/// adapter plus the number of response bytes consumed.
pub(crate) type ExecOutcome = RedmuxResult<(Box<dyn Any + Send>, usize)>;

/// Queue entry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    /// Appended, not yet on the wire.
    Staged,
    /// On the wire, awaiting responses.
    Written,
}

/// One queued request with its adapter and completion handle.
pub(crate) struct QueuedEntry {
    /// Serialized pipeline.
    pub payload: Bytes,

    /// Total responses this request expects.
    pub expected: usize,

    /// Responses still outstanding.
    pub remaining: usize,

    /// Index of the response currently being consumed.
    pub response_index: usize,

    /// Lifecycle state.
    pub state: EntryState,

    /// Collected into a write batch whose socket write is in progress.
    /// Such entries are no longer cancellable: their bytes may already be
    /// on the wire.
    in_write: bool,

    /// Request flags captured at submit time.
    pub coalesce: bool,
    pub cancel_on_connection_lost: bool,
    pub retry: bool,

    /// Type-erased response adapter.
    pub adapter: Box<dyn ErasedAdapter>,

    /// First adapter error seen while consuming this entry's responses.
    pub sink_error: Option<AdapterError>,

    /// Response bytes consumed so far.
    pub read_size: usize,

    tx: oneshot::Sender<ExecOutcome>,
}

impl QueuedEntry {
    pub fn new(
        req: &Request,
        adapter: Box<dyn ErasedAdapter>,
        tx: oneshot::Sender<ExecOutcome>,
    ) -> Self {
        let config = req.config();
        Self {
            payload: Bytes::copy_from_slice(req.payload()),
            expected: req.expected_responses(),
            remaining: req.expected_responses(),
            response_index: 0,
            state: EntryState::Staged,
            in_write: false,
            coalesce: config.coalesce,
            cancel_on_connection_lost: config.cancel_on_connection_lost,
            retry: config.retry,
            adapter,
            sink_error: None,
            read_size: 0,
            tx,
        }
    }

    /// The submitting caller dropped its future; nobody is waiting.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }

    /// Complete the entry, handing the adapter back to the caller or
    /// reporting the first adapter error.
    pub fn complete(self) {
        let outcome = match self.sink_error {
            Some(err) => Err(RedmuxError::Adapter(err)),
            None => Ok((self.adapter.into_any(), self.read_size)),
        };
        let _ = self.tx.send(outcome);
    }

    /// Fail the entry with the given error.
    pub fn fail(self, error: RedmuxError) {
        let _ = self.tx.send(Err(error));
    }

    /// Reset a surviving entry for resubmission on the next run.
    fn reset(&mut self) {
        self.state = EntryState::Staged;
        self.in_write = false;
        self.remaining = self.expected;
        self.response_index = 0;
        self.read_size = 0;
        self.sink_error = None;
    }
}

impl std::fmt::Debug for QueuedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedEntry")
            .field("state", &self.state)
            .field("expected", &self.expected)
            .field("remaining", &self.remaining)
            .field("coalesce", &self.coalesce)
            .finish()
    }
}

/// A fused write prepared from the staged prefix.
#[derive(Debug)]
pub(crate) struct WriteBatch {
    /// Concatenated payloads.
    pub payload: Vec<u8>,

    /// Number of queue-front entries covered by the write.
    pub entry_count: usize,
}

/// FIFO of in-flight requests plus wire accounting.
#[derive(Default)]
pub(crate) struct RequestQueue {
    entries: VecDeque<QueuedEntry>,

    /// Responses written to the socket and not yet consumed.
    written_responses: usize,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a staged entry.
    pub fn push(&mut self, entry: QueuedEntry) {
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Responses on the wire still awaiting consumption.
    pub fn written_responses(&self) -> usize {
        self.written_responses
    }

    pub fn consumed_written_response(&mut self) {
        debug_assert!(self.written_responses > 0);
        self.written_responses -= 1;
    }

    /// Drop staged entries whose caller went away before the write.
    pub fn purge_abandoned_staged(&mut self) {
        self.entries
            .retain(|e| e.state != EntryState::Staged || e.in_write || !e.is_abandoned());
    }

    /// Collect the coalescible staged prefix for one socket write.
    ///
    /// Writes are gated while responses are outstanding, which keeps
    /// submission order equal to write order equal to completion order. The
    /// first staged entry is always written; successors fuse only while
    /// both neighbors opted into coalescing.
    pub fn collect_writable(&mut self) -> Option<WriteBatch> {
        if self.written_responses != 0 {
            return None;
        }
        let first = self.entries.front()?;
        debug_assert_eq!(first.state, EntryState::Staged);

        let mut payload = Vec::with_capacity(first.payload.len());
        payload.extend_from_slice(&first.payload);
        let mut entry_count = 1;

        for pair in 1..self.entries.len() {
            let prev = &self.entries[pair - 1];
            let next = &self.entries[pair];
            if !prev.coalesce || !next.coalesce {
                break;
            }
            payload.extend_from_slice(&next.payload);
            entry_count += 1;
        }

        // The batch can no longer be cancelled while the write is in
        // flight.
        for entry in self.entries.iter_mut().take(entry_count) {
            entry.in_write = true;
        }

        Some(WriteBatch {
            payload,
            entry_count,
        })
    }

    /// Mark the first `count` entries written after a successful write.
    ///
    /// Entries that expect no response (subscribe-only pipelines) complete
    /// on write; they are extracted and returned so the caller can finish
    /// them outside the queue lock.
    pub fn mark_written(&mut self, count: usize) -> Vec<QueuedEntry> {
        let mut completed = Vec::new();
        let mut kept = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(mut entry) = self.entries.pop_front() else {
                break;
            };
            entry.state = EntryState::Written;
            entry.in_write = false;
            self.written_responses += entry.remaining;
            if entry.remaining == 0 {
                completed.push(entry);
            } else {
                kept.push(entry);
            }
        }
        for entry in kept.into_iter().rev() {
            self.entries.push_front(entry);
        }
        completed
    }

    /// Take the head entry for response consumption, if it is written.
    pub fn checkout_written_head(&mut self) -> Option<QueuedEntry> {
        if self.entries.front()?.state == EntryState::Written {
            self.entries.pop_front()
        } else {
            None
        }
    }

    /// Return a checked-out head after a reader failure so teardown can
    /// apply the loss policy to it.
    pub fn return_head(&mut self, entry: QueuedEntry) {
        self.entries.push_front(entry);
    }

    /// Fail every staged entry with `Cancelled`.
    ///
    /// Written entries are untouched: their bytes are on the wire and the
    /// response will still arrive.
    pub fn cancel_staged(&mut self) -> usize {
        let mut cancelled = 0;
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.state == EntryState::Staged && !entry.in_write {
                cancelled += 1;
                entry.fail(RedmuxError::Cancelled);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        cancelled
    }

    /// Apply the connection-loss policy after a run terminates.
    ///
    /// Returns the number of entries failed. Surviving entries (retryable
    /// written ones and keep-alive submissions) reset to staged for the
    /// next run.
    pub fn teardown(&mut self) -> usize {
        let mut cancelled = 0;
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for mut entry in self.entries.drain(..) {
            if entry.is_abandoned() {
                continue;
            }
            let written = entry.state == EntryState::Written;
            if entry.cancel_on_connection_lost || (written && !entry.retry) {
                cancelled += 1;
                entry.fail(RedmuxError::ConnectionLost);
            } else {
                entry.reset();
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        self.written_responses = 0;
        cancelled
    }
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("entries", &self.entries.len())
            .field("written_responses", &self.written_responses)
            .finish()
    }
}
