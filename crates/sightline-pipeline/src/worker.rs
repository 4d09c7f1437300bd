//! Background verify worker: oracle → verify → evidence ledger.
//!
//! Exactly one worker thread runs per engine. It dequeues in FIFO order,
//! runs the verify gate, and appends accepted evidence to the ledger.
//! Ledger appends go through a single-writer mutex; the hot loop never
//! touches the ledger.
//!
//! Shutdown: closing the oracle wakes the worker; it finishes the item in
//! flight (its ledger record is fully written or not at all) and abandons
//! the rest of the queue.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use sightline_storage::EvidenceLedger;

use crate::oracle::CandidateOracle;
use crate::verify::VerifyGate;

/// Handle over the spawned worker thread.
pub struct VerifyWorker {
    handle: Option<JoinHandle<u64>>,
}

impl VerifyWorker {
    /// Spawn the worker. The oracle must outlive the run; closing it is the
    /// only shutdown signal.
    pub fn spawn(
        oracle: Arc<CandidateOracle>,
        gate: Arc<VerifyGate>,
        ledger: Arc<Mutex<EvidenceLedger>>,
    ) -> Self {
        let handle = std::thread::Builder::new()
            .name("sightline-verify".to_string())
            .spawn(move || {
                let mut appended = 0u64;
                while let Some(candidate) = oracle.dequeue_blocking() {
                    let evidence = gate.verify(&candidate);
                    if !evidence.accepted {
                        continue;
                    }
                    let timestamp_ms = chrono::Utc::now().timestamp_millis();
                    let mut ledger = ledger.lock();
                    match ledger.append(
                        &evidence.label,
                        evidence.embedding.clone(),
                        true,
                        timestamp_ms,
                    ) {
                        Ok(entry) => {
                            appended += 1;
                            info!(
                                label = %entry.label,
                                sequence = entry.sequence,
                                "evidence accepted"
                            );
                        }
                        Err(e) => {
                            // Counted, never crashes the hot loop.
                            error!(error = %e, "ledger append failed");
                        }
                    }
                }
                appended
            })
            .expect("spawning verify worker thread");
        Self {
            handle: Some(handle),
        }
    }

    /// Join after the oracle has been closed. Returns appended-entry count.
    pub fn join(mut self) -> u64 {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(count) => count,
                Err(_) => {
                    warn!("verify worker panicked");
                    0
                }
            },
            None => 0,
        }
    }
}

impl Drop for VerifyWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sightline_core::types::{NeighborHit, OracleCandidate};
    use sightline_storage::read_entries;
    use std::collections::HashMap;
    use tempfile::TempDir;

    use crate::verify::Gallery;

    fn axis(dim: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[i] = 1.0;
        v
    }

    #[test]
    fn worker_appends_accepts_in_dequeue_order() {
        let dir = TempDir::new().unwrap();
        let ledger_path = dir.path().join("ledger.jsonl");

        let mut gallery = Gallery::default();
        gallery.add("mug", axis(8, 0));
        let mut thresholds = HashMap::new();
        thresholds.insert("mug".to_string(), 0.5);
        let gate = Arc::new(VerifyGate::new(gallery, thresholds, 0.5));

        let oracle = Arc::new(CandidateOracle::new(16));
        let ledger = Arc::new(Mutex::new(EvidenceLedger::open(&ledger_path).unwrap()));

        let worker = VerifyWorker::spawn(
            Arc::clone(&oracle),
            Arc::clone(&gate),
            Arc::clone(&ledger),
        );

        for seq in 0..4u64 {
            // Even frames match the gallery, odd frames are orthogonal.
            let embedding = if seq % 2 == 0 { axis(8, 0) } else { axis(8, 3) };
            oracle.try_enqueue(OracleCandidate {
                embedding,
                candidates: vec![NeighborHit {
                    label: "mug".to_string(),
                    score: 0.9,
                }],
                frame_seq: seq,
            });
        }

        // Drain, then close so the worker exits.
        while oracle.depth() > 0 {
            std::thread::yield_now();
        }
        oracle.close();
        let appended = worker.join();
        assert_eq!(appended, 2);

        let entries = read_entries(&ledger_path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 0);
        assert_eq!(entries[1].sequence, 1);
        assert!(entries.iter().all(|e| e.accepted && e.label == "mug"));

        let snap = gate.snapshot();
        assert_eq!(snap.called, 4);
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.rejected, 2);
    }

    #[test]
    fn closing_with_pending_entries_abandons_them() {
        let dir = TempDir::new().unwrap();
        let ledger_path = dir.path().join("ledger.jsonl");

        let gate = Arc::new(VerifyGate::new(Gallery::default(), HashMap::new(), 0.5));
        let oracle = Arc::new(CandidateOracle::new(16));
        let ledger = Arc::new(Mutex::new(EvidenceLedger::open(&ledger_path).unwrap()));

        // Close before spawning: the worker must exit immediately and leave
        // the queue contents unprocessed.
        for seq in 0..8u64 {
            oracle.try_enqueue(OracleCandidate {
                embedding: axis(4, 0),
                candidates: vec![],
                frame_seq: seq,
            });
        }
        oracle.close();

        let worker = VerifyWorker::spawn(oracle, gate.clone(), ledger);
        assert_eq!(worker.join(), 0);
        assert_eq!(gate.snapshot().called, 0);
    }
}
