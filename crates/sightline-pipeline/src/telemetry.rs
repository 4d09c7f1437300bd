//! Run telemetry: stage accumulators, `metrics.json`, `stage_timings.csv`,
//! and the canonical metrics hash.
//!
//! Stage timings accumulate only for processed frames; per-frame durations
//! are recorded for every frame. Artifacts are written atomically (temp +
//! rename). The metrics hash covers a canonical subset that excludes
//! wall-clock-derived fields so two runs over the same seed and fixture are
//! bit-identical.

use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use sightline_core::types::{Backend, METRICS_SCHEMA_VERSION, SDK_VERSION};

use crate::oracle::OracleMetrics;
use crate::provenance::Provenance;
use crate::purity::PurityReport;
use crate::verify::VerifySnapshot;

/// Per-stage accumulator plus per-frame bookkeeping.
#[derive(Debug, Default)]
pub struct Telemetry {
    pub per_frame_ms: Vec<f64>,
    /// Wall durations of processed frames only, parallel to the stage vecs.
    pub processed_frame_ms: Vec<f64>,
    pub detect_ms: Vec<f64>,
    pub track_ms: Vec<f64>,
    pub embed_ms: Vec<f64>,
    pub match_ms: Vec<f64>,
    pub unknown_flags: Vec<bool>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fully processed frame.
    pub fn record_processed(
        &mut self,
        frame_ms: f64,
        detect: f64,
        track: f64,
        embed: f64,
        matching: f64,
        unknown: bool,
    ) {
        self.per_frame_ms.push(frame_ms);
        self.processed_frame_ms.push(frame_ms);
        self.detect_ms.push(detect);
        self.track_ms.push(track);
        self.embed_ms.push(embed);
        self.match_ms.push(matching);
        self.unknown_flags.push(unknown);
    }

    /// Record a skipped frame: duration and reused unknown flag only.
    pub fn record_skipped(&mut self, frame_ms: f64, reused_unknown: bool) {
        self.per_frame_ms.push(frame_ms);
        self.unknown_flags.push(reused_unknown);
    }

    pub fn frames_total(&self) -> usize {
        self.per_frame_ms.len()
    }

    pub fn frames_processed(&self) -> usize {
        self.detect_ms.len()
    }

    pub fn unknown_rate(&self) -> f64 {
        if self.unknown_flags.is_empty() {
            return 0.0;
        }
        self.unknown_flags.iter().filter(|&&f| f).count() as f64 / self.unknown_flags.len() as f64
    }
}

/// Controller block in `metrics.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerReport {
    pub auto_stride: bool,
    pub min_stride: u32,
    pub max_stride: u32,
    pub window: usize,
    pub low_water: f64,
    pub start_stride: u32,
    pub end_stride: u32,
    pub frames_total: u64,
    pub frames_processed: u64,
    pub p50_window_ms: Option<f64>,
    pub p95_window_ms: Option<f64>,
    pub p99_window_ms: Option<f64>,
    pub fps_window: Option<f64>,
}

/// Stage means block.
#[derive(Debug, Clone, Serialize)]
pub struct StageMeans {
    pub detect: f64,
    pub track: f64,
    pub embed: f64,
    #[serde(rename = "match")]
    pub match_: f64,
    pub overhead: f64,
}

/// Aggregate run metrics; serialized as `metrics.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    pub metrics_schema_version: String,
    pub fps: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub stage_ms: StageMeans,
    pub kb_size: usize,
    pub backend_selected: Backend,
    pub sdk_version: String,
    pub controller: ControllerReport,
    pub unknown_rate: f64,
    pub unknown_rate_band: [f64; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unknown_rate_violation: Option<bool>,
    pub slo_budget_ms: f64,
    pub slo_within_budget_pct: f64,
    pub oracle: OracleMetrics,
    pub verify: VerifySnapshot,
    pub purity: PurityReport,
    /// Wall time spent opening the LabelBank shard before the first frame.
    pub index_bootstrap_ms: f64,
    pub provenance: Provenance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_cold_start_ms: Option<f64>,
}

/// Inclusive-linear percentile over unsorted samples; `q` in `[0, 100]`.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    if sorted.len() == 1 {
        return sorted[0];
    }
    let k = (sorted.len() - 1) as f64 * (q / 100.0);
    let f = k.floor() as usize;
    let c = (f + 1).min(sorted.len() - 1);
    if f == c {
        return sorted[f];
    }
    sorted[f] * (c as f64 - k) + sorted[c] * (k - f as f64)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Aggregate accumulated telemetry into the metrics record.
#[allow(clippy::too_many_arguments)]
pub fn aggregate(
    telemetry: &Telemetry,
    controller: ControllerReport,
    kb_size: usize,
    backend: Backend,
    budget_ms: f64,
    unknown_rate_band: [f64; 2],
    oracle: OracleMetrics,
    verify: VerifySnapshot,
    purity: PurityReport,
    index_bootstrap_ms: f64,
    provenance: Provenance,
    process_cold_start_ms: Option<f64>,
) -> RunMetrics {
    let frames = &telemetry.per_frame_ms;
    let fps = {
        let avg = mean(frames);
        if avg > 0.0 {
            1000.0 / avg
        } else {
            0.0
        }
    };

    // Overhead: frame wall time minus accounted stages, processed frames
    // only (skipped frames have no stage samples to subtract).
    let overheads: Vec<f64> = telemetry
        .processed_frame_ms
        .iter()
        .enumerate()
        .map(|(i, &frame_ms)| {
            frame_ms
                - (telemetry.detect_ms[i]
                    + telemetry.track_ms[i]
                    + telemetry.embed_ms[i]
                    + telemetry.match_ms[i])
        })
        .collect();

    let unknown_rate = telemetry.unknown_rate();
    let [band_low, band_high] = unknown_rate_band;
    let violation = unknown_rate < band_low || unknown_rate > band_high;

    let within = if frames.is_empty() {
        0.0
    } else {
        frames.iter().filter(|&&ms| ms <= budget_ms).count() as f64 / frames.len() as f64 * 100.0
    };

    RunMetrics {
        metrics_schema_version: METRICS_SCHEMA_VERSION.to_string(),
        fps,
        p50: percentile(frames, 50.0),
        p95: percentile(frames, 95.0),
        p99: percentile(frames, 99.0),
        stage_ms: StageMeans {
            detect: mean(&telemetry.detect_ms),
            track: mean(&telemetry.track_ms),
            embed: mean(&telemetry.embed_ms),
            match_: mean(&telemetry.match_ms),
            overhead: mean(&overheads),
        },
        kb_size,
        backend_selected: backend,
        sdk_version: SDK_VERSION.to_string(),
        controller,
        unknown_rate,
        unknown_rate_band,
        unknown_rate_violation: if violation { Some(true) } else { None },
        slo_budget_ms: budget_ms,
        slo_within_budget_pct: within,
        oracle,
        verify,
        purity,
        index_bootstrap_ms,
        provenance,
        process_cold_start_ms,
    }
}

/// Atomically write `metrics.json`.
pub fn write_metrics_json(path: &Path, metrics: &RunMetrics) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(metrics)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    info!(path = %path.display(), "metrics written");
    Ok(())
}

/// Write `stage_timings.csv`: `stage,total_ms,mean_ms,count`, LF endings.
/// `count` reflects processed frames only.
pub fn write_stage_timings_csv(path: &Path, telemetry: &Telemetry) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut out = String::from("stage,total_ms,mean_ms,count\n");
    let stage_data: [(&str, &Vec<f64>); 4] = [
        ("detect", &telemetry.detect_ms),
        ("track", &telemetry.track_ms),
        ("embed", &telemetry.embed_ms),
        ("match", &telemetry.match_ms),
    ];
    for (name, samples) in stage_data {
        let total: f64 = samples.iter().sum();
        out.push_str(&format!(
            "{name},{:.6},{:.6},{}\n",
            total,
            mean(samples),
            samples.len()
        ));
    }
    let tmp = path.with_extension("csv.tmp");
    std::fs::write(&tmp, out.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Canonical subset hashed for A/B stability. Wall-clock-derived fields
/// (fps, percentiles, stage means, bootstrap, cold start) and the
/// host/provenance block never enter the hash.
#[derive(Serialize)]
struct MetricsHashSubset<'a> {
    metrics_schema_version: &'a str,
    kb_size: usize,
    backend_selected: Backend,
    sdk_version: &'a str,
    auto_stride: bool,
    min_stride: u32,
    max_stride: u32,
    window: usize,
    low_water: f64,
    start_stride: u32,
    end_stride: u32,
    frames_total: u64,
    frames_processed: u64,
    unknown_rate: f64,
    unknown_rate_band: [f64; 2],
    oracle: &'a OracleMetrics,
    verify: &'a VerifySnapshot,
    purity: &'a PurityReport,
}

/// SHA-256 hex over the canonical metrics subset.
pub fn metrics_hash(metrics: &RunMetrics) -> String {
    let subset = MetricsHashSubset {
        metrics_schema_version: &metrics.metrics_schema_version,
        kb_size: metrics.kb_size,
        backend_selected: metrics.backend_selected,
        sdk_version: &metrics.sdk_version,
        auto_stride: metrics.controller.auto_stride,
        min_stride: metrics.controller.min_stride,
        max_stride: metrics.controller.max_stride,
        window: metrics.controller.window,
        low_water: metrics.controller.low_water,
        start_stride: metrics.controller.start_stride,
        end_stride: metrics.controller.end_stride,
        frames_total: metrics.controller.frames_total,
        frames_processed: metrics.controller.frames_processed,
        unknown_rate: metrics.unknown_rate,
        unknown_rate_band: metrics.unknown_rate_band,
        oracle: &metrics.oracle,
        verify: &metrics.verify,
        purity: &metrics.purity,
    };
    let canonical = serde_json::to_string(&subset).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metrics(unknown_rate_shift: bool) -> RunMetrics {
        let mut telemetry = Telemetry::new();
        telemetry.record_processed(10.0, 2.0, 1.0, 4.0, 1.5, false);
        telemetry.record_processed(12.0, 2.0, 1.0, 5.0, 1.5, unknown_rate_shift);
        telemetry.record_skipped(0.5, unknown_rate_shift);

        let controller = ControllerReport {
            auto_stride: true,
            min_stride: 1,
            max_stride: 4,
            window: 120,
            low_water: 0.8,
            start_stride: 1,
            end_stride: 1,
            frames_total: 3,
            frames_processed: 2,
            p50_window_ms: None,
            p95_window_ms: None,
            p99_window_ms: None,
            fps_window: None,
        };
        aggregate(
            &telemetry,
            controller,
            5,
            Backend::Numpy,
            33.0,
            [0.0, 1.0],
            OracleMetrics {
                maxlen: 64,
                current_depth: 0,
                enqueued: 1,
                dequeued: 1,
                shed_count: 0,
                shed_rate: 0.0,
            },
            VerifySnapshot {
                called: 1,
                accepted: 1,
                rejected: 0,
            },
            PurityReport {
                network_syscalls: false,
                sockets_blocked: 0,
                dns_blocked: 0,
            },
            1.25,
            Provenance::default(),
            None,
        )
    }

    #[test]
    fn percentile_is_inclusive_linear() {
        let vals = [10.0, 20.0, 30.0, 40.0];
        assert!((percentile(&vals, 50.0) - 25.0).abs() < 1e-9);
        assert!((percentile(&vals, 100.0) - 40.0).abs() < 1e-9);
        assert_eq!(percentile(&[], 95.0), 0.0);
    }

    #[test]
    fn skipped_frames_count_in_durations_not_stages() {
        let mut t = Telemetry::new();
        t.record_processed(10.0, 1.0, 1.0, 1.0, 1.0, false);
        t.record_skipped(0.1, false);
        assert_eq!(t.frames_total(), 2);
        assert_eq!(t.frames_processed(), 1);
    }

    #[test]
    fn metrics_hash_is_stable_and_ignores_wall_clock() {
        let a = sample_metrics(false);
        let mut b = sample_metrics(false);
        // Perturb wall-clock and host-identity fields only.
        b.fps += 17.0;
        b.p95 += 3.0;
        b.stage_ms.detect += 1.0;
        b.index_bootstrap_ms += 5.0;
        b.provenance.git_commit = "feedface".to_string();
        b.provenance.hardware_id = "other|host".to_string();
        assert_eq!(metrics_hash(&a), metrics_hash(&b));

        // A decision-level change must move the hash.
        let c = sample_metrics(true);
        assert_ne!(metrics_hash(&a), metrics_hash(&c));
    }

    #[test]
    fn band_violation_is_flagged() {
        let mut telemetry = Telemetry::new();
        telemetry.record_processed(10.0, 1.0, 1.0, 1.0, 1.0, true);
        let controller = ControllerReport {
            auto_stride: true,
            min_stride: 1,
            max_stride: 4,
            window: 120,
            low_water: 0.8,
            start_stride: 1,
            end_stride: 1,
            frames_total: 1,
            frames_processed: 1,
            p50_window_ms: None,
            p95_window_ms: None,
            p99_window_ms: None,
            fps_window: None,
        };
        let metrics = aggregate(
            &telemetry,
            controller,
            0,
            Backend::Numpy,
            33.0,
            [0.0, 0.5],
            OracleMetrics {
                maxlen: 64,
                current_depth: 0,
                enqueued: 0,
                dequeued: 0,
                shed_count: 0,
                shed_rate: 0.0,
            },
            VerifySnapshot {
                called: 0,
                accepted: 0,
                rejected: 0,
            },
            PurityReport {
                network_syscalls: false,
                sockets_blocked: 0,
                dns_blocked: 0,
            },
            0.0,
            Provenance::default(),
            None,
        );
        assert_eq!(metrics.unknown_rate, 1.0);
        assert_eq!(metrics.unknown_rate_violation, Some(true));
    }

    #[test]
    fn csv_has_contract_header_and_processed_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage_timings.csv");
        let mut t = Telemetry::new();
        t.record_processed(10.0, 1.0, 2.0, 3.0, 4.0, false);
        t.record_processed(11.0, 1.0, 2.0, 3.0, 4.0, false);
        t.record_skipped(0.2, false);
        write_stage_timings_csv(&path, &t).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("stage,total_ms,mean_ms,count"));
        let detect = lines.next().unwrap();
        assert!(detect.starts_with("detect,"));
        assert!(detect.ends_with(",2"));
        assert!(!contents.contains('\r'));
    }
}
