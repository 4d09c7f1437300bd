//! Bounded candidate oracle queue.
//!
//! The hot loop enqueues unknown-frame candidates without ever suspending;
//! a single background worker dequeues in FIFO order. On overflow the
//! OLDEST entry is dropped and `shed_count` increments. Counters cross the
//! thread boundary as atomics; the queue itself sits behind a short
//! critical section.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::debug;

use sightline_core::types::OracleCandidate;

/// Counter snapshot reported in `metrics.json`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OracleMetrics {
    pub maxlen: usize,
    pub current_depth: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub shed_count: u64,
    pub shed_rate: f64,
}

struct QueueState {
    queue: VecDeque<OracleCandidate>,
    closed: bool,
}

/// Thread-safe bounded FIFO with drop-oldest overflow.
pub struct CandidateOracle {
    maxlen: usize,
    state: Mutex<QueueState>,
    available: Condvar,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    shed: AtomicU64,
}

impl std::fmt::Debug for CandidateOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateOracle")
            .field("maxlen", &self.maxlen)
            .field("depth", &self.depth())
            .finish()
    }
}

impl CandidateOracle {
    pub fn new(maxlen: usize) -> Self {
        Self {
            maxlen,
            state: Mutex::new(QueueState {
                queue: VecDeque::with_capacity(maxlen),
                closed: false,
            }),
            available: Condvar::new(),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            shed: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking. Returns false once the oracle is closed.
    ///
    /// A zero-capacity oracle sheds everything; a full queue drops its
    /// oldest entry before accepting the new one.
    pub fn try_enqueue(&self, candidate: OracleCandidate) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        if self.maxlen == 0 {
            self.shed.fetch_add(1, Ordering::Relaxed);
            debug!(frame_seq = candidate.frame_seq, "oracle shed (zero capacity)");
            return true;
        }
        if state.queue.len() >= self.maxlen {
            if let Some(dropped) = state.queue.pop_front() {
                self.shed.fetch_add(1, Ordering::Relaxed);
                debug!(frame_seq = dropped.frame_seq, "oracle shed (overflow)");
            }
        }
        state.queue.push_back(candidate);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Blocking dequeue for the worker. Returns `None` once the oracle is
    /// closed; pending entries are abandoned at that point.
    pub fn dequeue_blocking(&self) -> Option<OracleCandidate> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(candidate) = state.queue.pop_front() {
                self.dequeued.fetch_add(1, Ordering::Relaxed);
                return Some(candidate);
            }
            self.available.wait(&mut state);
        }
    }

    /// Non-blocking dequeue (used by tests and drain inspection).
    pub fn try_dequeue(&self) -> Option<OracleCandidate> {
        let mut state = self.state.lock();
        let candidate = state.queue.pop_front()?;
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(candidate)
    }

    /// Stop accepting enqueues and wake the worker so it can exit.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.available.notify_all();
    }

    pub fn depth(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn metrics(&self) -> OracleMetrics {
        let enqueued = self.enqueued.load(Ordering::Relaxed);
        let shed = self.shed.load(Ordering::Relaxed);
        OracleMetrics {
            maxlen: self.maxlen,
            current_depth: self.depth(),
            enqueued,
            dequeued: self.dequeued.load(Ordering::Relaxed),
            shed_count: shed,
            shed_rate: shed as f64 / (enqueued.max(1)) as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(seq: u64) -> OracleCandidate {
        OracleCandidate {
            embedding: vec![1.0, 0.0],
            candidates: vec![],
            frame_seq: seq,
        }
    }

    #[test]
    fn overflow_drops_oldest_and_counts_shed() {
        let oracle = CandidateOracle::new(64);
        for seq in 0..70 {
            assert!(oracle.try_enqueue(candidate(seq)));
        }
        let metrics = oracle.metrics();
        assert_eq!(metrics.enqueued, 70);
        assert_eq!(metrics.shed_count, 6);
        assert_eq!(metrics.current_depth, 64);

        // FIFO preserved for the retained entries: 6..70.
        let mut expected = 6u64;
        while let Some(c) = oracle.try_dequeue() {
            assert_eq!(c.frame_seq, expected);
            expected += 1;
        }
        assert_eq!(expected, 70);
    }

    #[test]
    fn shed_rate_uses_enqueued_denominator() {
        let oracle = CandidateOracle::new(1);
        oracle.try_enqueue(candidate(0));
        oracle.try_enqueue(candidate(1));
        let m = oracle.metrics();
        assert_eq!(m.shed_count, 1);
        assert!((m.shed_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn zero_capacity_sheds_everything() {
        let oracle = CandidateOracle::new(0);
        oracle.try_enqueue(candidate(0));
        let m = oracle.metrics();
        assert_eq!(m.shed_count, 1);
        assert_eq!(m.current_depth, 0);
    }

    #[test]
    fn close_rejects_enqueues_and_abandons_pending() {
        let oracle = CandidateOracle::new(8);
        oracle.try_enqueue(candidate(0));
        oracle.close();
        assert!(!oracle.try_enqueue(candidate(1)));
        assert!(oracle.dequeue_blocking().is_none());
    }

    #[test]
    fn worker_sees_fifo_order_across_threads() {
        use std::sync::Arc;

        let oracle = Arc::new(CandidateOracle::new(128));
        let consumer = {
            let oracle = Arc::clone(&oracle);
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(c) = oracle.dequeue_blocking() {
                    seen.push(c.frame_seq);
                }
                seen
            })
        };

        for seq in 0..50 {
            oracle.try_enqueue(candidate(seq));
        }
        // Give the worker a chance to drain, then close.
        while oracle.depth() > 0 {
            std::thread::yield_now();
        }
        oracle.close();
        let seen = consumer.join().expect("worker panicked");
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }
}
