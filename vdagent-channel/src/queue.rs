//! Token-gated FIFO of outbound agent chunks
//!
//! The server grants tokens on the main channel; each carrier chunk costs
//! one. Producers enqueue the chunks of one logical message as a group, so
//! chunks of different messages never interleave. Flush waiters are keyed
//! by the tail chunk of the group they care about and complete when that
//! chunk has been written out.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FlushError {
    #[error("agent disconnected")]
    AgentGone,
}

pub type FlushWaiter = oneshot::Sender<Result<(), FlushError>>;

/// Opaque handle naming the tail chunk of an enqueued group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlushHandle(u64);

/// A chunk handed out for writing, plus the waiters it completes.
pub struct SentChunk {
    pub bytes: Vec<u8>,
    waiters: Vec<FlushWaiter>,
}

impl SentChunk {
    /// The chunk made it onto the wire.
    pub fn complete(self) {
        for w in self.waiters {
            let _ = w.send(Ok(()));
        }
    }

    /// The write failed; the channel is going down.
    pub fn fail(self) {
        for w in self.waiters {
            let _ = w.send(Err(FlushError::AgentGone));
        }
    }
}

#[derive(Default)]
pub struct TokenQueue {
    tokens: u32,
    next_seq: u64,
    queue: VecDeque<(u64, Vec<u8>)>,
    waiters: HashMap<u64, Vec<FlushWaiter>>,
}

impl TokenQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    pub fn set_tokens(&mut self, n: u32) {
        self.tokens = n;
    }

    pub fn on_tokens(&mut self, n: u32) {
        self.tokens = self.tokens.saturating_add(n);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Append all chunks of one logical message atomically. Returns the
    /// handle of the tail chunk, or `None` for an empty group.
    pub fn enqueue(&mut self, chunks: Vec<Vec<u8>>) -> Option<FlushHandle> {
        let mut tail = None;
        for bytes in chunks {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.queue.push_back((seq, bytes));
            tail = Some(FlushHandle(seq));
        }
        tail
    }

    /// Register a waiter on a handle. Completes immediately when the chunk
    /// is no longer queued (already sent, or the group was empty).
    pub fn register_flush(&mut self, handle: Option<FlushHandle>, tx: FlushWaiter) {
        match handle {
            Some(h) if self.queue.iter().any(|(seq, _)| *seq == h.0) => {
                self.waiters.entry(h.0).or_default().push(tx);
            }
            _ => {
                let _ = tx.send(Ok(()));
            }
        }
    }

    /// Wait until everything queued right now has been sent. Completes
    /// immediately with success on an empty queue.
    pub fn flush_async(&mut self) -> oneshot::Receiver<Result<(), FlushError>> {
        let (tx, rx) = oneshot::channel();
        let tail = self.queue.back().map(|(seq, _)| FlushHandle(*seq));
        self.register_flush(tail, tx);
        rx
    }

    /// Dequeue the head chunk if a token is available, consuming one.
    pub fn pop_sendable(&mut self) -> Option<SentChunk> {
        if self.tokens == 0 {
            return None;
        }

        let (seq, bytes) = self.queue.pop_front()?;
        self.tokens -= 1;
        let waiters = self.waiters.remove(&seq).unwrap_or_default();

        Some(SentChunk { bytes, waiters })
    }

    /// Fail every outstanding flush waiter, keeping queued chunks. The
    /// server expects pending multi-chunk messages to be completed even
    /// after the agent went away.
    pub fn fail_waiters(&mut self) {
        for (_, waiters) in self.waiters.drain() {
            for w in waiters {
                let _ = w.send(Err(FlushError::AgentGone));
            }
        }
    }

    /// Drop all pending chunks and fail every waiter.
    pub fn reset(&mut self) {
        self.tokens = 0;
        self.queue.clear();
        self.fail_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(q: &mut TokenQueue) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(sent) = q.pop_sendable() {
            out.push(sent.bytes.clone());
            sent.complete();
        }
        out
    }

    #[test]
    fn fifo_across_groups() {
        let mut q = TokenQueue::new();
        q.enqueue(vec![vec![1], vec![2]]);
        q.enqueue(vec![vec![3]]);
        q.set_tokens(10);

        assert_eq!(drain(&mut q), vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn tokens_gate_the_queue() {
        let mut q = TokenQueue::new();
        q.enqueue(vec![vec![1], vec![2], vec![3]]);

        assert!(q.pop_sendable().is_none());

        q.on_tokens(2);
        assert_eq!(drain(&mut q).len(), 2);
        assert_eq!(q.tokens(), 0);
        assert_eq!(q.len(), 1);

        q.on_tokens(1);
        assert_eq!(drain(&mut q), vec![vec![3]]);
    }

    #[test]
    fn flush_completes_when_tail_is_sent() {
        let mut q = TokenQueue::new();
        let handle = q.enqueue(vec![vec![1], vec![2]]);
        let (tx, mut rx) = oneshot::channel();
        q.register_flush(handle, tx);

        q.set_tokens(1);
        q.pop_sendable().unwrap().complete();
        assert!(rx.try_recv().is_err());

        q.on_tokens(1);
        q.pop_sendable().unwrap().complete();
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn flush_on_empty_queue_is_immediate() {
        let mut q = TokenQueue::new();

        let mut rx = q.flush_async();

        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn flush_on_already_sent_handle_is_immediate() {
        let mut q = TokenQueue::new();
        let handle = q.enqueue(vec![vec![1]]);
        q.set_tokens(1);
        q.pop_sendable().unwrap().complete();

        let (tx, mut rx) = oneshot::channel();
        q.register_flush(handle, tx);

        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn reset_fails_outstanding_waiters() {
        let mut q = TokenQueue::new();
        let handle = q.enqueue(vec![vec![1]]);
        let (tx, mut rx) = oneshot::channel();
        q.register_flush(handle, tx);

        q.reset();

        assert_eq!(rx.try_recv().unwrap(), Err(FlushError::AgentGone));
        assert!(q.is_empty());
        assert_eq!(q.tokens(), 0);
    }

    #[test]
    fn fail_waiters_keeps_chunks() {
        let mut q = TokenQueue::new();
        let handle = q.enqueue(vec![vec![1]]);
        let (tx, mut rx) = oneshot::channel();
        q.register_flush(handle, tx);

        q.fail_waiters();

        assert_eq!(rx.try_recv().unwrap(), Err(FlushError::AgentGone));
        assert_eq!(q.len(), 1);
    }
}
