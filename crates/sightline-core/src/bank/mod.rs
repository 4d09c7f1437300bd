//! LabelBank: exact top-k nearest-neighbor lookup over an immutable,
//! memory-mapped shard of labeled exemplar vectors.
//!
//! The shard is built offline ([`ShardBuilder`]), opened read-only at
//! startup, and never mutated during a run; sharing a `&Shard` across the
//! hot loop and the verify worker is safe. Lookup is an exact dot product
//! (cosine over unit vectors) with bounded-heap top-k selection; no
//! approximate index, no full sorts on the hot path.

mod builder;
mod format;

pub use builder::{ShardBuilder, ShardMeta};
pub use format::{hex, SHARD_MAGIC, SHARD_VERSION};

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, info};

use crate::calibration::CalibrationTable;
use crate::config::MatcherConfig;
use crate::error::BankError;
use crate::similarity::{clamp_score, Kernel, ScoredRow, TopK};
use crate::types::{Backend, MatchCore, NeighborHit, UNKNOWN_LABEL};

use format::{parse_shard, struct_hash};

/// Hard ceiling on k regardless of configuration.
pub const MAX_TOPK: usize = 64;

/// Resolve the configured backend request to a kernel and wire tag.
pub fn resolve_backend(requested: &str) -> Result<(Kernel, Backend), BankError> {
    match requested {
        "numpy" => Ok((Kernel::Scalar, Backend::Numpy)),
        #[cfg(feature = "fused-kernel")]
        "faiss" | "auto" => Ok((Kernel::Fused, Backend::Faiss)),
        #[cfg(not(feature = "fused-kernel"))]
        "auto" => Ok((Kernel::Scalar, Backend::Numpy)),
        other => Err(BankError::BackendUnavailable {
            requested: other.to_string(),
        }),
    }
}

/// An opened, immutable LabelBank shard.
pub struct Shard {
    mmap: Mmap,
    path: PathBuf,
    dim: usize,
    count: usize,
    labels: Vec<String>,
    row_label_ids: Vec<u32>,
    calibration: CalibrationTable,
    struct_hash: [u8; 32],
    slab_offset: usize,
    kernel: Kernel,
    backend: Backend,
    topk_limit: usize,
    threshold: f32,
    min_neighbors: usize,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("path", &self.path)
            .field("dim", &self.dim)
            .field("count", &self.count)
            .field("labels", &self.labels.len())
            .field("backend", &self.backend)
            .finish()
    }
}

impl Shard {
    /// Memory-map and validate a shard file.
    ///
    /// Validation covers magic/version/dim/count, slab size, and a full
    /// recomputation of the structural hash. All failures here are fatal;
    /// after a successful open, `topk` cannot fail on pre-validated input.
    pub fn open(path: &Path, matcher: &MatcherConfig) -> Result<Self, BankError> {
        let (kernel, backend) = resolve_backend(&matcher.backend)?;

        let file = File::open(path).map_err(|e| BankError::io("opening shard file", e))?;
        // Safety: the shard is never written after build; the mmap stays
        // read-only for the process lifetime.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| BankError::io("mapping shard", e))?;

        let parsed = parse_shard(&mmap, path)?;
        if parsed.slab_offset % std::mem::align_of::<f32>() != 0 {
            return Err(BankError::CorruptShard {
                path: path.to_path_buf(),
                reason: "slab misaligned".to_string(),
            });
        }

        let shard = Self {
            dim: parsed.dim,
            count: parsed.count,
            labels: parsed.labels,
            row_label_ids: parsed.row_label_ids,
            calibration: parsed.calibration,
            struct_hash: parsed.struct_hash,
            slab_offset: parsed.slab_offset,
            kernel,
            backend,
            topk_limit: matcher.topk.min(MAX_TOPK),
            threshold: matcher.threshold,
            min_neighbors: matcher.min_neighbors,
            path: path.to_path_buf(),
            mmap,
        };

        // Recompute the struct hash from the mapped rows.
        let rows: Vec<(String, Vec<f32>)> = (0..shard.count)
            .map(|i| {
                (
                    shard.labels[shard.row_label_ids[i] as usize].clone(),
                    shard.row(i).to_vec(),
                )
            })
            .collect();
        if struct_hash(shard.dim, &rows) != shard.struct_hash {
            return Err(BankError::StructHashMismatch {
                path: path.to_path_buf(),
            });
        }

        info!(
            path = %path.display(),
            count = shard.count,
            dim = shard.dim,
            backend = backend.as_str(),
            "shard opened"
        );
        Ok(shard)
    }

    /// The mapped vector slab as `&[f32]`.
    ///
    /// Alignment is validated at open; the format stores components
    /// little-endian, matching every supported host.
    #[inline]
    fn slab(&self) -> &[f32] {
        let bytes = &self.mmap[self.slab_offset..];
        // Safety: offset alignment checked at open; length derived from the
        // validated header.
        unsafe {
            std::slice::from_raw_parts(bytes.as_ptr() as *const f32, self.count * self.dim)
        }
    }

    /// One exemplar row.
    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.slab()[i * self.dim..(i + 1) * self.dim]
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn calibration(&self) -> &CalibrationTable {
        &self.calibration
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn struct_hash_hex(&self) -> String {
        hex(&self.struct_hash)
    }

    /// Exact top-k neighbors for a query.
    ///
    /// `k` is clamped to the configured maximum; a shard with fewer rows
    /// returns them all. Ties break toward the lower label id; scores are
    /// clamped to `[-1, 1]`.
    pub fn topk(&self, query: &[f32], k: usize) -> Result<Vec<NeighborHit>, BankError> {
        if query.len() != self.dim {
            return Err(BankError::DimMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        let k = k.min(self.topk_limit).min(self.count);
        let mut heap = TopK::new(k);
        for i in 0..self.count {
            let score = clamp_score(self.kernel.dot(query, self.row(i)));
            heap.push(ScoredRow {
                score,
                label_id: self.row_label_ids[i],
                row: i as u32,
            });
        }
        Ok(heap
            .into_sorted()
            .into_iter()
            .map(|r| NeighborHit {
                label: self.labels[r.label_id as usize].clone(),
                score: r.score,
            })
            .collect())
    }

    /// Top-k plus the open-set aggregation rule.
    ///
    /// Top-1 wins unless its score falls below the calibrated accept
    /// threshold for its own label, or fewer than `min_neighbors` hits
    /// clear their thresholds; then the result label is `"unknown"`.
    pub fn lookup(&self, query: &[f32], k: usize) -> Result<MatchCore, BankError> {
        if query.len() != self.dim {
            return Err(BankError::DimMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        let k = k.min(self.topk_limit).min(self.count);
        let mut heap = TopK::new(k);
        for i in 0..self.count {
            let score = clamp_score(self.kernel.dot(query, self.row(i)));
            heap.push(ScoredRow {
                score,
                label_id: self.row_label_ids[i],
                row: i as u32,
            });
        }
        let rows = heap.into_sorted();
        let neighbors: Vec<NeighborHit> = rows
            .iter()
            .map(|r| NeighborHit {
                label: self.labels[r.label_id as usize].clone(),
                score: r.score,
            })
            .collect();

        let Some(top) = rows.first() else {
            return Ok(MatchCore {
                label: UNKNOWN_LABEL.to_string(),
                label_id: None,
                confidence: 0.0,
                neighbors,
                backend: self.backend,
            });
        };

        let cleared = rows
            .iter()
            .filter(|r| r.score >= self.tau(r.label_id))
            .count();
        let known = top.score >= self.tau(top.label_id) && cleared >= self.min_neighbors;

        if known {
            Ok(MatchCore {
                label: self.labels[top.label_id as usize].clone(),
                label_id: Some(top.label_id),
                confidence: top.score,
                neighbors,
                backend: self.backend,
            })
        } else {
            debug!(
                top_score = top.score,
                tau = self.tau(top.label_id),
                "lookup resolved to unknown"
            );
            Ok(MatchCore {
                label: UNKNOWN_LABEL.to_string(),
                label_id: None,
                confidence: top.score,
                neighbors,
                backend: self.backend,
            })
        }
    }

    /// Accept threshold for a label id: calibrated τ when present and
    /// supported, otherwise the global matcher threshold.
    #[inline]
    fn tau(&self, label_id: u32) -> f32 {
        match self.calibration.entry(label_id) {
            Ok(entry) if entry.support >= 2 => entry.tau,
            _ => self.threshold,
        }
    }
}
