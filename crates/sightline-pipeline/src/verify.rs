//! Second-stage verify gate over a curated gallery.
//!
//! The gallery (label → reference embeddings) is independent of the
//! LabelBank shard. A candidate is accepted when its max cosine against the
//! proposed label's gallery vectors clears the per-label calibrated
//! threshold. An unlisted label is a reject with a reason, never an error.
//!
//! Accounting invariant: `called == accepted + rejected` for every call.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use sightline_core::error::SightlineError;
use sightline_core::similarity::{clamp_score, normalize, Kernel};
use sightline_core::types::{OracleCandidate, VerifyEvidence};

/// One gallery manifest line: `{"label": ..., "embedding": [...]}`.
#[derive(Debug, Deserialize)]
struct GalleryLine {
    label: String,
    embedding: Vec<f32>,
}

/// Curated reference gallery.
#[derive(Debug, Default, Clone)]
pub struct Gallery {
    refs: HashMap<String, Vec<Vec<f32>>>,
}

impl Gallery {
    /// Load from a JSONL manifest. Vectors are normalized on load.
    pub fn load_jsonl(path: &Path) -> Result<Self, SightlineError> {
        let file = File::open(path)
            .map_err(|e| SightlineError::Data(format!("gallery manifest {}: {e}", path.display())))?;
        let reader = BufReader::new(file);

        let mut gallery = Gallery::default();
        for (idx, line) in reader.lines().enumerate() {
            let line =
                line.map_err(|e| SightlineError::Data(format!("gallery line {idx}: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: GalleryLine = serde_json::from_str(&line)
                .map_err(|e| SightlineError::Data(format!("gallery line {idx}: {e}")))?;
            gallery.add(parsed.label, parsed.embedding);
        }
        if gallery.refs.is_empty() {
            return Err(SightlineError::Data(format!(
                "gallery manifest {} is empty",
                path.display()
            )));
        }
        info!(
            labels = gallery.refs.len(),
            path = %path.display(),
            "verify gallery loaded"
        );
        Ok(gallery)
    }

    pub fn add(&mut self, label: impl Into<String>, mut embedding: Vec<f32>) {
        normalize(&mut embedding);
        self.refs.entry(label.into()).or_default().push(embedding);
    }

    pub fn contains(&self, label: &str) -> bool {
        self.refs.contains_key(label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.refs.keys().map(String::as_str)
    }

    fn vectors(&self, label: &str) -> Option<&[Vec<f32>]> {
        self.refs.get(label).map(Vec::as_slice)
    }
}

/// Counter snapshot for `metrics.json`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VerifySnapshot {
    pub called: u64,
    pub accepted: u64,
    pub rejected: u64,
}

/// The verify gate itself; shared between the shadow path and the worker.
pub struct VerifyGate {
    gallery: Gallery,
    /// Per-label accept thresholds derived from shard calibration.
    thresholds: HashMap<String, f32>,
    fallback_tau: f32,
    called: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl std::fmt::Debug for VerifyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyGate")
            .field("labels", &self.thresholds.len())
            .field("fallback_tau", &self.fallback_tau)
            .finish()
    }
}

impl VerifyGate {
    pub fn new(gallery: Gallery, thresholds: HashMap<String, f32>, fallback_tau: f32) -> Self {
        Self {
            gallery,
            thresholds,
            fallback_tau,
            called: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn tau(&self, label: &str) -> f32 {
        self.thresholds
            .get(label)
            .copied()
            .unwrap_or(self.fallback_tau)
    }

    /// Verify a candidate against its best proposed label.
    ///
    /// The re-embed hook currently reuses the candidate embedding; the
    /// interface allows a different embedder later without changing
    /// callers.
    pub fn verify(&self, candidate: &OracleCandidate) -> VerifyEvidence {
        self.called.fetch_add(1, Ordering::Relaxed);

        let Some(best) = candidate.candidates.first() else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return VerifyEvidence {
                label: String::new(),
                embedding: candidate.embedding.clone(),
                accepted: false,
                reason: "no candidate label".to_string(),
                score: 0.0,
            };
        };
        let label = best.label.clone();

        let Some(refs) = self.gallery.vectors(&label) else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(label, "verify reject: label not in gallery");
            return VerifyEvidence {
                label,
                embedding: candidate.embedding.clone(),
                accepted: false,
                reason: "label not in gallery".to_string(),
                score: 0.0,
            };
        };

        let kernel = Kernel::Scalar;
        let score = refs
            .iter()
            .map(|r| clamp_score(kernel.dot(&candidate.embedding, r)))
            .fold(f32::NEG_INFINITY, f32::max);
        let tau = self.tau(&label);

        if score >= tau {
            self.accepted.fetch_add(1, Ordering::Relaxed);
            VerifyEvidence {
                label,
                embedding: candidate.embedding.clone(),
                accepted: true,
                reason: format!("max-cosine {score:.4} >= tau {tau:.4}"),
                score,
            }
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            VerifyEvidence {
                label,
                embedding: candidate.embedding.clone(),
                accepted: false,
                reason: format!("max-cosine {score:.4} < tau {tau:.4}"),
                score,
            }
        }
    }

    pub fn snapshot(&self) -> VerifySnapshot {
        VerifySnapshot {
            called: self.called.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}
