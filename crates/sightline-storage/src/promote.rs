//! Offline KB promotion: accepted ledger evidence → capped int8 medoids.
//!
//! Deterministic herding per class:
//!
//! 1. load accepted embeddings (L2-normalized float32)
//! 2. centroid μ = normalize(mean)
//! 3. greedily pick up to 3 medoids maximizing
//!    `⟨μ, m⟩ − λ · max_{i<j} ⟨m_i, m⟩` (λ = 0.5), ties to the earliest
//!    ledger sequence
//! 4. quantize each pick to int8 (scalar scale, zero point 0)
//! 5. atomically replace the class medoid file
//! 6. append a record to the promotion ledger
//!
//! Runtime never runs concurrently with the promoter: the hot loop is a
//! reader of shard + gallery + medoids, the promoter is the only writer.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use sightline_core::error::PromotionError;
use sightline_core::quant::{dequant_cosine, quantize_i8};
use sightline_core::similarity::{normalize, Kernel};

use crate::ledger::LedgerEntry;
use crate::medoid::{write_class_medoids, MEDOID_CAP};

/// Diversity penalty weight in the herding objective.
pub const DEFAULT_LAMBDA: f32 = 0.5;

/// Acceptable mean cosine error introduced by int8 quantization.
pub const MAX_DEQUANT_COSINE_ERROR: f32 = 5e-3;

/// One promotion ledger record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionRecord {
    pub label: String,
    /// Ledger sequences of the chosen medoids (empty when skipped).
    pub sequences: Vec<u64>,
    pub medoids: usize,
    /// Blake2s digest of the written medoid file (empty when skipped).
    pub digest: String,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome summary returned to the caller, mirroring the ledger record.
pub type PromotionOutcome = PromotionRecord;

/// Offline promoter over a medoid directory.
#[derive(Debug)]
pub struct Promoter {
    medoid_dir: PathBuf,
    lambda: f32,
}

impl Promoter {
    pub fn new(medoid_dir: &Path) -> Self {
        Self {
            medoid_dir: medoid_dir.to_path_buf(),
            lambda: DEFAULT_LAMBDA,
        }
    }

    pub fn with_lambda(mut self, lambda: f32) -> Self {
        self.lambda = lambda;
        self
    }

    /// File holding a class's medoids.
    pub fn class_path(&self, label: &str) -> PathBuf {
        self.medoid_dir.join(format!("{}.medoids", sanitize(label)))
    }

    /// Promotion ledger path.
    pub fn ledger_path(&self) -> PathBuf {
        self.medoid_dir.join("promotion_ledger.jsonl")
    }

    /// Promote every class present in `entries`.
    ///
    /// Classes without accepted evidence are skipped with a note; an IO
    /// error aborts the whole run and leaves previous medoids untouched.
    pub fn promote_all(
        &self,
        entries: &[LedgerEntry],
    ) -> Result<Vec<PromotionOutcome>, PromotionError> {
        let mut by_label: BTreeMap<&str, Vec<&LedgerEntry>> = BTreeMap::new();
        for entry in entries {
            by_label.entry(entry.label.as_str()).or_default().push(entry);
        }

        let mut outcomes = Vec::with_capacity(by_label.len());
        for (label, class_entries) in by_label {
            let outcome = self.promote_class(label, &class_entries)?;
            self.log_promotion(&outcome)?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn promote_class(
        &self,
        label: &str,
        entries: &[&LedgerEntry],
    ) -> Result<PromotionOutcome, PromotionError> {
        let accepted: Vec<&LedgerEntry> = entries.iter().copied().filter(|e| e.accepted).collect();
        if accepted.is_empty() {
            warn!(label, "promotion skipped: no accepted evidence");
            return Ok(PromotionRecord {
                label: label.to_string(),
                sequences: Vec::new(),
                medoids: 0,
                digest: String::new(),
                skipped: true,
                reason: Some("no accepted evidence".to_string()),
            });
        }

        let dim = accepted[0].embedding.len();
        for e in &accepted {
            if e.embedding.len() != dim {
                return Err(PromotionError::DimMismatch {
                    label: label.to_string(),
                    expected: dim,
                    actual: e.embedding.len(),
                });
            }
        }

        // Normalized copies; ledger embeddings should already be unit.
        let vectors: Vec<Vec<f32>> = accepted
            .iter()
            .map(|e| {
                let mut v = e.embedding.clone();
                normalize(&mut v);
                v
            })
            .collect();

        let mut centroid = vec![0.0f32; dim];
        for v in &vectors {
            for (c, x) in centroid.iter_mut().zip(v.iter()) {
                *c += x;
            }
        }
        for c in centroid.iter_mut() {
            *c /= vectors.len() as f32;
        }
        normalize(&mut centroid);

        let picks = self.herd(&centroid, &vectors, &accepted);

        let mut quantized = Vec::with_capacity(picks.len());
        let mut sequences = Vec::with_capacity(picks.len());
        for &idx in &picks {
            let q = quantize_i8(&vectors[idx]);
            let cos = dequant_cosine(&vectors[idx], &q);
            if cos < 1.0 - MAX_DEQUANT_COSINE_ERROR {
                warn!(label, cosine = cos, "medoid quantization error above target");
            }
            quantized.push(q);
            sequences.push(accepted[idx].sequence);
        }

        let path = self.class_path(label);
        let digest = write_class_medoids(&path, &quantized)?;

        info!(
            label,
            medoids = quantized.len(),
            digest = %digest,
            "class promoted"
        );
        Ok(PromotionRecord {
            label: label.to_string(),
            sequences,
            medoids: quantized.len(),
            digest,
            skipped: false,
            reason: None,
        })
    }

    /// Greedy diversity-penalized selection; returns indices into `vectors`.
    fn herd(
        &self,
        centroid: &[f32],
        vectors: &[Vec<f32>],
        entries: &[&LedgerEntry],
    ) -> Vec<usize> {
        let kernel = Kernel::Scalar;
        let cap = MEDOID_CAP.min(vectors.len());
        let mut selected: Vec<usize> = Vec::with_capacity(cap);

        while selected.len() < cap {
            let mut best: Option<(usize, f32)> = None;
            for (i, v) in vectors.iter().enumerate() {
                if selected.contains(&i) {
                    continue;
                }
                let affinity = kernel.dot(centroid, v);
                let redundancy = selected
                    .iter()
                    .map(|&j| kernel.dot(&vectors[j], v))
                    .fold(f32::NEG_INFINITY, f32::max);
                let penalty = if redundancy > f32::NEG_INFINITY {
                    self.lambda * redundancy
                } else {
                    0.0
                };
                let objective = affinity - penalty;

                let better = match best {
                    None => true,
                    Some((bi, bs)) => {
                        objective > bs
                            || (objective == bs && entries[i].sequence < entries[bi].sequence)
                    }
                };
                if better {
                    best = Some((i, objective));
                }
            }
            match best {
                Some((i, _)) => selected.push(i),
                None => break,
            }
        }
        selected
    }

    fn log_promotion(&self, record: &PromotionRecord) -> Result<(), PromotionError> {
        std::fs::create_dir_all(&self.medoid_dir)
            .map_err(|e| PromotionError::io("creating medoid directory", e))?;
        let line = serde_json::to_string(record).map_err(|e| PromotionError::CorruptFile {
            path: self.ledger_path(),
            reason: format!("promotion record encode: {e}"),
        })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.ledger_path())
            .map_err(|e| PromotionError::io("opening promotion ledger", e))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.flush())
            .map_err(|e| PromotionError::io("appending promotion ledger", e))?;
        Ok(())
    }
}

fn sanitize(label: &str) -> String {
    let safe: String = label
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = safe.trim_matches('_');
    if trimmed.is_empty() {
        "label".to_string()
    } else {
        trimmed.to_string()
    }
}
