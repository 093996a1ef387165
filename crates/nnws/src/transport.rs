//! Ordered read and write tasks over a byte stream.
//!
//! [`TransportScheduler`] keeps one FIFO queue of read requests and one of write requests.
//! Only the head of each queue is active. A read completes once the buffered input holds the
//! requested number of bytes or the requested terminator, a write completes once the stream has
//! accepted all of its bytes. Each task may carry a timeout that starts counting when the task
//! becomes the head of its queue; an expired timeout reports a read or write timeout and drops
//! every task in that queue.
//!
//! The scheduler performs no I/O. Whoever owns the socket feeds it with
//! [`on_bytes`](TransportScheduler::on_bytes), drains [`transmit`](TransportScheduler::transmit)
//! and acknowledges progress with [`on_written`](TransportScheduler::on_written).

use std::{
    collections::VecDeque,
    fmt,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};

use crate::{Result, WebSocketError, options::VerboseLevel};

/// Largest amount of input a delimited read buffers while looking for its terminator.
pub const MAX_DELIMITED_READ: usize = 16 * 1024;

/// What a read is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadKind {
    /// Exactly this many bytes.
    Exact(usize),
    /// Everything up to and including the terminator.
    Until(Bytes),
}

#[derive(Debug, Clone)]
pub struct ReadTask<T> {
    pub tag: T,
    pub kind: ReadKind,
    pub timeout: Option<Duration>,
}

impl<T> ReadTask<T> {
    pub fn exact(tag: T, len: usize, timeout: Option<Duration>) -> Self {
        Self {
            tag,
            kind: ReadKind::Exact(len),
            timeout,
        }
    }

    pub fn until(tag: T, terminator: impl Into<Bytes>, timeout: Option<Duration>) -> Self {
        Self {
            tag,
            kind: ReadKind::Until(terminator.into()),
            timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteTask<T> {
    pub tag: T,
    pub data: Bytes,
    pub timeout: Option<Duration>,
}

/// Sans-IO read/write task queues.
pub struct TransportScheduler<T> {
    input: BytesMut,
    reads: VecDeque<ReadTask<T>>,
    writes: VecDeque<WriteTask<T>>,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    /// Bytes of the head write already accepted by the stream.
    written: usize,
    /// Prefix of `input` already searched for the head read's terminator.
    scanned: usize,
    verbose: VerboseLevel,
}

impl<T: Copy + fmt::Debug> TransportScheduler<T> {
    pub fn new(verbose: VerboseLevel) -> Self {
        Self {
            input: BytesMut::new(),
            reads: VecDeque::new(),
            writes: VecDeque::new(),
            read_deadline: None,
            write_deadline: None,
            written: 0,
            scanned: 0,
            verbose,
        }
    }

    /// Queues a read. Its timeout starts now if no other read is ahead of it.
    pub fn enqueue_read(&mut self, task: ReadTask<T>, now: Instant) {
        log_at!(self.verbose, trace, tag = ?task.tag, kind = ?task.kind, "queue read");
        if self.reads.is_empty() {
            self.read_deadline = task.timeout.map(|t| now + t);
        }
        self.reads.push_back(task);
    }

    /// Queues a write. Its timeout starts now if no other write is ahead of it.
    pub fn enqueue_write(&mut self, task: WriteTask<T>, now: Instant) {
        log_at!(self.verbose, trace, tag = ?task.tag, len = task.data.len(), "queue write");
        if self.writes.is_empty() {
            self.write_deadline = task.timeout.map(|t| now + t);
            self.written = 0;
        }
        self.writes.push_back(task);
    }

    /// Appends bytes received from the stream.
    pub fn on_bytes(&mut self, data: &[u8]) {
        self.input.extend_from_slice(data);
    }

    /// Completes the head read if the buffered input satisfies it.
    ///
    /// Returns the tag of the completed task together with the bytes it consumed. Call again
    /// until it returns `None`, later reads may already be satisfiable.
    pub fn poll_read(&mut self, now: Instant) -> Option<Result<(T, Bytes)>> {
        let len = match &self.reads.front()?.kind {
            ReadKind::Exact(n) => (self.input.len() >= *n).then_some(*n),
            ReadKind::Until(terminator) => {
                let from = self
                    .scanned
                    .saturating_sub(terminator.len().saturating_sub(1));
                let found = find(&self.input[from..], terminator);
                self.scanned = self.input.len();
                found.map(|pos| from + pos + terminator.len())
            }
        };

        let Some(len) = len else {
            if self.input.len() > MAX_DELIMITED_READ
                && matches!(self.reads.front(), Some(task) if matches!(task.kind, ReadKind::Until(_)))
            {
                self.reads.clear();
                self.read_deadline = None;
                self.scanned = 0;
                return Some(Err(WebSocketError::DelimiterNotFound(MAX_DELIMITED_READ)));
            }
            return None;
        };

        let task = self.reads.pop_front()?;
        let data = self.input.split_to(len).freeze();
        self.scanned = 0;
        self.read_deadline = self
            .reads
            .front()
            .and_then(|next| next.timeout)
            .map(|t| now + t);

        log_at!(self.verbose, trace, tag = ?task.tag, len, "read complete");
        Some(Ok((task.tag, data)))
    }

    /// Bytes the stream should accept next, if any write is pending.
    pub fn transmit(&self) -> Option<Bytes> {
        self.writes
            .front()
            .map(|task| task.data.slice(self.written..))
    }

    /// Acknowledges `n` bytes accepted by the stream.
    ///
    /// Returns the tag of the write that was completed by this acknowledgement, if any.
    pub fn on_written(&mut self, n: usize, now: Instant) -> Option<T> {
        let head = self.writes.front()?;
        self.written += n;
        if self.written < head.data.len() {
            return None;
        }

        let task = self.writes.pop_front()?;
        self.written = 0;
        self.write_deadline = self
            .writes
            .front()
            .and_then(|next| next.timeout)
            .map(|t| now + t);

        log_at!(self.verbose, trace, tag = ?task.tag, "write complete");
        Some(task.tag)
    }

    /// Drops queued writes that have not started, keeping a write that is partially sent.
    pub fn discard_pending_writes(&mut self) {
        let keep = usize::from(self.written > 0);
        self.writes.truncate(keep);
        if self.writes.is_empty() {
            self.write_deadline = None;
        }
    }

    /// Earliest instant at which [`on_timer`](Self::on_timer) has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.read_deadline, self.write_deadline) {
            (Some(r), Some(w)) => Some(r.min(w)),
            (r, w) => r.or(w),
        }
    }

    /// Expires the active read or write if its timeout has passed.
    ///
    /// The whole queue of the expired task is dropped.
    pub fn on_timer(&mut self, now: Instant) -> Option<WebSocketError> {
        if self.read_deadline.is_some_and(|deadline| deadline <= now) {
            log_at!(self.verbose, debug, pending = self.reads.len(), "read timed out");
            self.reads.clear();
            self.read_deadline = None;
            self.scanned = 0;
            return Some(WebSocketError::ReadTimeout);
        }
        if self.write_deadline.is_some_and(|deadline| deadline <= now) {
            log_at!(self.verbose, debug, pending = self.writes.len(), "write timed out");
            self.writes.clear();
            self.written = 0;
            self.write_deadline = None;
            return Some(WebSocketError::WriteTimeout);
        }
        None
    }

    /// Cancels every task and forgets buffered input.
    pub fn abort(&mut self) {
        self.input.clear();
        self.reads.clear();
        self.writes.clear();
        self.written = 0;
        self.scanned = 0;
        self.read_deadline = None;
        self.write_deadline = None;
    }

    pub fn pending_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Bytes received but not yet consumed by a read.
    pub fn buffered(&self) -> usize {
        self.input.len()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
