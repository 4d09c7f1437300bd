//! Dot-product kernels and bounded top-k selection.
//!
//! All similarity in the system is cosine over L2-normalized vectors, which
//! reduces to a plain dot product. The hot path avoids full sorts: top-k is
//! selected with a bounded min-heap of capacity k.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Unit-norm tolerance: `| ||v|| - 1 | <= NORM_TOLERANCE` passes.
pub const NORM_TOLERANCE: f32 = 1e-5;

/// Kernel used for query-row dot products.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    /// 8-wide unrolled fused kernel. Wire tag "faiss".
    #[cfg(feature = "fused-kernel")]
    Fused,
    /// Straight scalar loop. Wire tag "numpy".
    Scalar,
}

impl Kernel {
    /// Dot product of two equal-length slices.
    #[inline]
    pub fn dot(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            #[cfg(feature = "fused-kernel")]
            Kernel::Fused => dot_fused(a, b),
            Kernel::Scalar => dot_scalar(a, b),
        }
    }
}

#[inline]
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// 8-lane unrolled dot product. The accumulator split keeps the adds
/// independent so the compiler can vectorize without reassociation flags.
#[cfg(feature = "fused-kernel")]
#[inline]
fn dot_fused(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0f32; 8];
    let chunks = a.len() / 8;
    for c in 0..chunks {
        let base = c * 8;
        for lane in 0..8 {
            acc[lane] += a[base + lane] * b[base + lane];
        }
    }
    let mut sum = acc.iter().sum::<f32>();
    for i in (chunks * 8)..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// L2 norm of a vector.
#[inline]
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// True when the vector is unit length within [`NORM_TOLERANCE`].
#[inline]
pub fn is_unit(v: &[f32]) -> bool {
    (l2_norm(v) - 1.0).abs() <= NORM_TOLERANCE
}

/// L2-normalize in place. A zero vector is left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Clamp a raw dot product into the cosine range.
#[inline]
pub fn clamp_score(score: f32) -> f32 {
    score.clamp(-1.0, 1.0)
}

// ============================================================================
// Bounded top-k
// ============================================================================

/// Candidate row during top-k selection.
///
/// Ordering: higher score wins; equal scores break toward the LOWER label
/// id, so in the "is this better" ordering a lower label id compares
/// greater.
#[derive(Debug, Clone, Copy)]
pub struct ScoredRow {
    pub score: f32,
    pub label_id: u32,
    pub row: u32,
}

impl PartialEq for ScoredRow {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredRow {}

impl PartialOrd for ScoredRow {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredRow {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.label_id.cmp(&self.label_id))
            .then_with(|| other.row.cmp(&self.row))
    }
}

/// Bounded min-heap keeping the best `k` rows seen so far.
///
/// The heap stores `Reverse`-ordered entries so the current worst is at the
/// top and evicted in O(log k) when something better arrives.
pub struct TopK {
    cap: usize,
    heap: BinaryHeap<std::cmp::Reverse<ScoredRow>>,
}

impl TopK {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            heap: BinaryHeap::with_capacity(cap.saturating_add(1)),
        }
    }

    /// Offer a row; keeps it only if it beats the current worst.
    #[inline]
    pub fn push(&mut self, entry: ScoredRow) {
        if self.cap == 0 {
            return;
        }
        if self.heap.len() < self.cap {
            self.heap.push(std::cmp::Reverse(entry));
        } else if let Some(worst) = self.heap.peek() {
            if entry > worst.0 {
                self.heap.pop();
                self.heap.push(std::cmp::Reverse(entry));
            }
        }
    }

    /// Drain into a vector sorted best-first.
    pub fn into_sorted(self) -> Vec<ScoredRow> {
        let mut rows: Vec<ScoredRow> = self.heap.into_iter().map(|r| r.0).collect();
        rows.sort_by(|a, b| b.cmp(a));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_and_fused_kernels_agree() {
        let a: Vec<f32> = (0..37).map(|i| (i as f32 * 0.13).sin()).collect();
        let b: Vec<f32> = (0..37).map(|i| (i as f32 * 0.07).cos()).collect();
        let scalar = Kernel::Scalar.dot(&a, &b);
        #[cfg(feature = "fused-kernel")]
        {
            let fused = Kernel::Fused.dot(&a, &b);
            assert!((scalar - fused).abs() < 1e-4, "{scalar} vs {fused}");
        }
        assert!(scalar.is_finite());
    }

    #[test]
    fn normalize_produces_unit_vectors() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!(is_unit(&v));
        assert!((v[0] - 0.6).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn topk_keeps_best_and_sorts_descending() {
        let mut topk = TopK::new(3);
        for (i, score) in [0.1f32, 0.9, 0.5, 0.7, 0.3].iter().enumerate() {
            topk.push(ScoredRow {
                score: *score,
                label_id: i as u32,
                row: i as u32,
            });
        }
        let rows = topk.into_sorted();
        let scores: Vec<f32> = rows.iter().map(|r| r.score).collect();
        assert_eq!(scores, vec![0.9, 0.7, 0.5]);
    }

    #[test]
    fn topk_ties_break_to_lower_label_id() {
        let mut topk = TopK::new(2);
        topk.push(ScoredRow {
            score: 0.5,
            label_id: 7,
            row: 0,
        });
        topk.push(ScoredRow {
            score: 0.5,
            label_id: 2,
            row: 1,
        });
        topk.push(ScoredRow {
            score: 0.5,
            label_id: 9,
            row: 2,
        });
        let rows = topk.into_sorted();
        assert_eq!(rows[0].label_id, 2);
        assert_eq!(rows[1].label_id, 7);
    }

    #[test]
    fn topk_with_fewer_rows_than_k_returns_all() {
        let mut topk = TopK::new(10);
        topk.push(ScoredRow {
            score: 0.4,
            label_id: 0,
            row: 0,
        });
        assert_eq!(topk.into_sorted().len(), 1);
    }
}
