//! Quantile calibration for accept thresholds and score → probability.
//!
//! At shard build time we compute, per label, the empirical distribution of
//! same-class cosine scores and of nearest-other-class cosine scores. From
//! these we derive an accept threshold τ_label and a single scalar
//! temperature T such that `sigmoid((cos − τ)/T)` tracks the same-class
//! indicator. Both are persisted in the shard metadata and are read-only at
//! runtime.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CalibrationError;

/// Temperature search bounds. Golden-section stays inside these.
const T_MIN: f32 = 0.05;
const T_MAX: f32 = 5.0;

/// Default epsilon: allowed other-class mass above τ.
pub const DEFAULT_EPSILON: f64 = 0.01;

/// Per-label calibration entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelCalibration {
    pub label_id: u32,
    /// Accept threshold: max-cosine below τ resolves to "unknown".
    pub tau: f32,
    /// Same-class cosine quantiles.
    pub q50: f32,
    pub q90: f32,
    pub q99: f32,
    /// Number of same-class score samples behind the quantiles.
    pub support: u32,
}

/// Whole-shard calibration block, indexed by label id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationTable {
    per_label: Vec<LabelCalibration>,
    /// Scalar temperature for score → probability.
    pub temperature: f32,
    /// τ used for labels without enough same-class samples.
    pub fallback_tau: f32,
}

impl CalibrationTable {
    /// Build an explicit table. Entries must be indexed by `label_id` order.
    pub fn new(per_label: Vec<LabelCalibration>, temperature: f32, fallback_tau: f32) -> Self {
        Self {
            per_label,
            temperature: temperature.clamp(T_MIN, T_MAX),
            fallback_tau,
        }
    }

    /// Accept threshold for a label id.
    pub fn tau(&self, label_id: u32) -> f32 {
        self.per_label
            .get(label_id as usize)
            .map(|c| c.tau)
            .unwrap_or(self.fallback_tau)
    }

    /// Entry lookup for reporting.
    pub fn entry(&self, label_id: u32) -> Result<&LabelCalibration, CalibrationError> {
        self.per_label
            .get(label_id as usize)
            .ok_or(CalibrationError::UnknownLabelId(label_id))
    }

    /// Calibrated probability that `cos` is a same-class score for the label.
    pub fn probability(&self, label_id: u32, cos: f32) -> f32 {
        let tau = self.tau(label_id);
        sigmoid((cos - tau) / self.temperature)
    }

    /// Minimum τ across all labels (fallback when the table is empty).
    pub fn tau_min(&self) -> f32 {
        self.per_label
            .iter()
            .map(|c| c.tau)
            .fold(f32::INFINITY, f32::min)
            .min(self.fallback_tau)
    }

    pub fn len(&self) -> usize {
        self.per_label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.per_label.is_empty()
    }
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Inclusive ("linear") quantile over an ascending-sorted slice.
///
/// Index `q·(n−1)` with linear interpolation between the bracketing
/// samples, matching NumPy's default interpolation.
pub fn quantile_linear(sorted: &[f32], q: f64) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = (pos - lo as f64) as f32;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

/// One labeled score sample for temperature fitting.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationSample {
    pub label_id: u32,
    pub cos: f32,
    pub same_class: bool,
}

/// Build the per-label table from same-class and nearest-other-class scores.
///
/// `same_scores[i]` / `other_scores[i]` hold the score samples for label id
/// `i`. τ_label = max(q05 of same-class, q(1−ε) of other-class); a label
/// with fewer than 2 same-class samples falls back to `fallback_tau`.
pub fn build_table(
    same_scores: &[Vec<f32>],
    other_scores: &[Vec<f32>],
    epsilon: f64,
    fallback_tau: f32,
) -> CalibrationTable {
    let mut per_label = Vec::with_capacity(same_scores.len());
    let mut samples: Vec<CalibrationSample> = Vec::new();

    for (id, same) in same_scores.iter().enumerate() {
        let mut same_sorted = same.clone();
        same_sorted.sort_by(f32::total_cmp);
        let other = other_scores.get(id).cloned().unwrap_or_default();
        let mut other_sorted = other;
        other_sorted.sort_by(f32::total_cmp);

        let tau = if same_sorted.len() < 2 {
            fallback_tau
        } else {
            let same_q05 = quantile_linear(&same_sorted, 0.05);
            let other_hi = if other_sorted.is_empty() {
                f32::NEG_INFINITY
            } else {
                quantile_linear(&other_sorted, 1.0 - epsilon)
            };
            same_q05.max(other_hi)
        };

        per_label.push(LabelCalibration {
            label_id: id as u32,
            tau,
            q50: quantile_linear(&same_sorted, 0.50),
            q90: quantile_linear(&same_sorted, 0.90),
            q99: quantile_linear(&same_sorted, 0.99),
            support: same_sorted.len() as u32,
        });

        for &cos in &same_sorted {
            samples.push(CalibrationSample {
                label_id: id as u32,
                cos,
                same_class: true,
            });
        }
        for &cos in &other_sorted {
            samples.push(CalibrationSample {
                label_id: id as u32,
                cos,
                same_class: false,
            });
        }
    }

    let draft = CalibrationTable::new(per_label, 1.0, fallback_tau);
    let temperature = fit_temperature(&samples, &draft);
    debug!(
        labels = draft.len(),
        temperature, "calibration table built"
    );
    CalibrationTable::new(draft.per_label, temperature, fallback_tau)
}

/// Binary cross-entropy of `sigmoid((cos − τ_label)/T)` vs the indicator.
fn bce(samples: &[CalibrationSample], table: &CalibrationTable, t: f32) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut loss = 0.0f64;
    for s in samples {
        let tau = table.tau(s.label_id);
        let p = sigmoid((s.cos - tau) / t).clamp(1e-7, 1.0 - 1e-7) as f64;
        loss -= if s.same_class {
            p.ln()
        } else {
            (1.0 - p).ln()
        };
    }
    loss / samples.len() as f64
}

/// Expected calibration error over equal-width probability bins.
///
/// ECE = Σ |bin| / N · |accuracy(bin) − mean_confidence(bin)|. The bench
/// gate holds this at ≤ 0.05 for shipped calibration tables.
pub fn expected_calibration_error(
    samples: &[CalibrationSample],
    table: &CalibrationTable,
    bins: usize,
) -> f64 {
    if samples.is_empty() || bins == 0 {
        return 0.0;
    }
    let mut bin_conf = vec![0.0f64; bins];
    let mut bin_hits = vec![0.0f64; bins];
    let mut bin_n = vec![0usize; bins];

    for s in samples {
        let p = table.probability(s.label_id, s.cos) as f64;
        let idx = ((p * bins as f64) as usize).min(bins - 1);
        bin_conf[idx] += p;
        bin_hits[idx] += if s.same_class { 1.0 } else { 0.0 };
        bin_n[idx] += 1;
    }

    let n = samples.len() as f64;
    let mut ece = 0.0;
    for i in 0..bins {
        if bin_n[i] == 0 {
            continue;
        }
        let weight = bin_n[i] as f64 / n;
        let avg_conf = bin_conf[i] / bin_n[i] as f64;
        let accuracy = bin_hits[i] / bin_n[i] as f64;
        ece += weight * (avg_conf - accuracy).abs();
    }
    ece
}

/// Fit the scalar temperature by golden-section search over `[T_MIN, T_MAX]`.
///
/// Deterministic and dependency-free; the loss is unimodal enough in
/// practice that 60 iterations land well inside 1e-4.
pub fn fit_temperature(samples: &[CalibrationSample], table: &CalibrationTable) -> f32 {
    if samples.is_empty() {
        return 1.0;
    }
    let phi = (5.0f32.sqrt() - 1.0) / 2.0;
    let (mut a, mut b) = (T_MIN, T_MAX);
    let mut c = b - phi * (b - a);
    let mut d = a + phi * (b - a);
    let mut fc = bce(samples, table, c);
    let mut fd = bce(samples, table, d);

    for _ in 0..60 {
        if (b - a).abs() < 1e-4 {
            break;
        }
        if fc < fd {
            b = d;
            d = c;
            fd = fc;
            c = b - phi * (b - a);
            fc = bce(samples, table, c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + phi * (b - a);
            fd = bce(samples, table, d);
        }
    }
    ((a + b) / 2.0).clamp(T_MIN, T_MAX)
}
