//! Offline shard construction with calibration.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use tracing::info;

use crate::calibration::{build_table, CalibrationTable, DEFAULT_EPSILON};
use crate::error::BankError;
use crate::similarity::{clamp_score, is_unit, l2_norm, Kernel};

use super::format::{hex, struct_hash, write_shard};

/// Summary of a built shard artifact.
#[derive(Debug, Clone)]
pub struct ShardMeta {
    pub dim: usize,
    pub count: usize,
    pub label_count: usize,
    pub struct_hash_hex: String,
}

/// Accumulates (label, vector) exemplars and writes the shard artifact.
///
/// Vectors must be L2-normalized; rows are re-sorted internally so the
/// resulting artifact is independent of insertion order.
pub struct ShardBuilder {
    dim: Option<usize>,
    rows: Vec<(String, Vec<f32>)>,
    epsilon: f64,
    fallback_tau: f32,
}

impl ShardBuilder {
    pub fn new() -> Self {
        Self {
            dim: None,
            rows: Vec::new(),
            epsilon: DEFAULT_EPSILON,
            fallback_tau: 0.35,
        }
    }

    /// Other-class mass allowed above τ when deriving thresholds.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// τ for labels without enough same-class samples.
    pub fn with_fallback_tau(mut self, tau: f32) -> Self {
        self.fallback_tau = tau;
        self
    }

    /// Add one exemplar. Rejects dimension drift and non-unit vectors.
    pub fn add(&mut self, label: impl Into<String>, vec: Vec<f32>) -> Result<(), BankError> {
        let label = label.into();
        match self.dim {
            None => self.dim = Some(vec.len()),
            Some(dim) if dim != vec.len() => {
                return Err(BankError::DimMismatch {
                    expected: dim,
                    actual: vec.len(),
                });
            }
            _ => {}
        }
        if !is_unit(&vec) {
            return Err(BankError::NotNormalized {
                norm: l2_norm(&vec),
                label,
            });
        }
        self.rows.push((label, vec));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sort rows, compute calibration and the struct hash, and write the
    /// artifact via temp + rename so a crash never leaves a torn shard.
    pub fn build_to(mut self, path: &Path) -> Result<ShardMeta, BankError> {
        if self.rows.is_empty() {
            return Err(BankError::EmptyShard);
        }
        let dim = self.dim.unwrap_or(0);

        // Label ids follow sorted label order; lower id = lexically earlier.
        let unique: BTreeSet<&str> = self.rows.iter().map(|(l, _)| l.as_str()).collect();
        let labels: Vec<String> = unique.into_iter().map(str::to_string).collect();
        let id_of = |label: &str| -> u32 {
            labels.binary_search_by(|l| l.as_str().cmp(label)).unwrap_or(0) as u32
        };

        self.rows.sort_by(|(la, va), (lb, vb)| {
            id_of(la)
                .cmp(&id_of(lb))
                .then_with(|| vec_bytes(va).cmp(&vec_bytes(vb)))
        });
        let row_label_ids: Vec<u32> = self.rows.iter().map(|(l, _)| id_of(l)).collect();

        let calibration = self.calibrate(&labels, &row_label_ids);
        let hash = struct_hash(dim, &self.rows);

        let tmp = path.with_extension("shard.tmp");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| BankError::io("creating shard directory", e))?;
            }
        }
        let file = File::create(&tmp).map_err(|e| BankError::io("creating shard temp file", e))?;
        let mut writer = BufWriter::new(file);
        write_shard(
            &mut writer,
            dim,
            &self.rows,
            &labels,
            &row_label_ids,
            &calibration,
            &hash,
        )?;
        writer
            .into_inner()
            .map_err(|e| BankError::io("flushing shard temp file", e.into()))?
            .sync_all()
            .map_err(|e| BankError::io("syncing shard temp file", e))?;
        std::fs::rename(&tmp, path).map_err(|e| BankError::io("renaming shard into place", e))?;

        let meta = ShardMeta {
            dim,
            count: self.rows.len(),
            label_count: labels.len(),
            struct_hash_hex: hex(&hash),
        };
        info!(
            path = %path.display(),
            count = meta.count,
            labels = meta.label_count,
            dim,
            "shard built"
        );
        Ok(meta)
    }

    /// Per-label same-class and nearest-other-class score distributions.
    fn calibrate(&self, labels: &[String], row_label_ids: &[u32]) -> CalibrationTable {
        let n = self.rows.len();
        let kernel = Kernel::Scalar;
        let mut same: Vec<Vec<f32>> = vec![Vec::new(); labels.len()];
        let mut other: Vec<Vec<f32>> = vec![Vec::new(); labels.len()];

        for i in 0..n {
            let mut nearest_other = f32::NEG_INFINITY;
            for j in 0..n {
                if i == j {
                    continue;
                }
                let cos = clamp_score(kernel.dot(&self.rows[i].1, &self.rows[j].1));
                if row_label_ids[i] == row_label_ids[j] {
                    if i < j {
                        same[row_label_ids[i] as usize].push(cos);
                    }
                } else if cos > nearest_other {
                    nearest_other = cos;
                }
            }
            if nearest_other > f32::NEG_INFINITY {
                other[row_label_ids[i] as usize].push(nearest_other);
            }
        }

        build_table(&same, &other, self.epsilon, self.fallback_tau)
    }
}

impl Default for ShardBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn vec_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}
