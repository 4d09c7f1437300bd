//! The hot-loop engine: detect → track → embed → match, per frame, in
//! input order, single-threaded.
//!
//! The loop never suspends on I/O and never raises mid-run: per-frame
//! failures are converted to `label: "unknown", confidence: 0,
//! budget_hit: true`. Unknown frames are offered to the candidate oracle
//! without blocking. Exactly one background worker (when enabled) runs the
//! oracle → verify → ledger path in parallel with the loop.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use sightline_core::bank::Shard;
use sightline_core::config::Config;
use sightline_core::controller::LatencyController;
use sightline_core::error::SightlineError;
use sightline_core::types::{
    BBox, MatchResult, NeighborHit, OracleCandidate, SDK_VERSION, UNKNOWN_LABEL,
};
use sightline_storage::EvidenceLedger;

use crate::oracle::CandidateOracle;
use crate::provenance::Provenance;
use crate::purity::PurityGuard;
use crate::telemetry::{aggregate, metrics_hash, ControllerReport, RunMetrics, Telemetry};
use crate::verify::{Gallery, VerifyGate};
use crate::worker::VerifyWorker;

/// One input frame. `data` is the opaque pixel payload owned by the
/// collaborators; the engine never interprets it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub data: Vec<u8>,
    pub bbox_hint: Option<BBox>,
    pub timestamp_ms: Option<i64>,
}

/// Detection collaborator seam.
pub trait Detector {
    fn detect(&mut self, frame: &Frame) -> Vec<BBox>;
}

/// A tracked detection.
#[derive(Debug, Clone, Copy)]
pub struct TrackedBox {
    pub track_id: u64,
    pub bbox: BBox,
}

/// Tracking collaborator seam.
pub trait Tracker {
    fn update(&mut self, detections: Vec<BBox>) -> Vec<TrackedBox>;
}

/// Embedder failure surfaced as a user/data error; the engine converts it
/// per frame instead of propagating.
#[derive(Debug, Error)]
#[error("embedder failure: {0}")]
pub struct EmbedderError(pub String);

/// Embedding collaborator seam. Must return an L2-normalized vector of the
/// shard dimension.
pub trait Embedder {
    fn embed(&mut self, frame: &Frame, bbox: Option<&BBox>) -> Result<Vec<f32>, EmbedderError>;
}

/// Everything a finished run produces.
#[derive(Debug)]
pub struct RunReport {
    pub results: Vec<MatchResult>,
    pub metrics: RunMetrics,
    pub metrics_hash: String,
    pub ledger_appends: u64,
    /// Raw accumulators, kept for the stage-timings artifact writer.
    pub telemetry: Telemetry,
}

impl RunReport {
    /// Apply end-of-run gates. `enforce_budget` adds the p95-vs-budget
    /// check (artifacts are already written by then; only the exit code
    /// changes).
    pub fn enforce(&self, enforce_budget: bool) -> Result<(), SightlineError> {
        if self.metrics.purity.network_syscalls {
            return Err(SightlineError::PurityViolation {
                sockets: self.metrics.purity.sockets_blocked,
                dns: self.metrics.purity.dns_blocked,
            });
        }
        if self.metrics.unknown_rate_violation == Some(true) {
            return Err(SightlineError::BandViolation {
                rate: self.metrics.unknown_rate,
                low: self.metrics.unknown_rate_band[0],
                high: self.metrics.unknown_rate_band[1],
            });
        }
        if enforce_budget && self.metrics.p95 > self.metrics.slo_budget_ms {
            return Err(SightlineError::BudgetBreach {
                p95_ms: self.metrics.p95,
                budget_ms: self.metrics.slo_budget_ms,
            });
        }
        Ok(())
    }
}

/// Per-run engine. Construct, feed frames via [`Engine::run`], read the
/// report.
pub struct Engine {
    shard: Arc<Shard>,
    config: Config,
    controller: LatencyController,
    oracle: Arc<CandidateOracle>,
    gate: Option<Arc<VerifyGate>>,
    worker: Option<VerifyWorker>,
    shadow_verify: bool,
    telemetry: Telemetry,
    purity: Arc<PurityGuard>,
    results: Vec<MatchResult>,
    frame_idx: u64,
    last_label: String,
    last_confidence: f32,
    last_unknown: bool,
    debug_timing: bool,
    index_bootstrap_ms: f64,
    provenance: Provenance,
    started: Instant,
    first_result_ms: Option<f64>,
}

impl Engine {
    /// Wire up a run. The gallery enables the verify gate; the ledger (plus
    /// `oracle.worker = true`) enables the background append path.
    pub fn new(
        shard: Arc<Shard>,
        config: Config,
        gallery: Option<Gallery>,
        ledger: Option<EvidenceLedger>,
    ) -> Result<Self, SightlineError> {
        config.validate()?;

        let oracle = Arc::new(CandidateOracle::new(config.oracle.maxlen));
        let gate = gallery.map(|g| {
            let thresholds = shard
                .labels()
                .iter()
                .enumerate()
                .map(|(id, label)| {
                    let tau = match shard.calibration().entry(id as u32) {
                        Ok(entry) if entry.support >= 2 => entry.tau,
                        _ => config.matcher.threshold,
                    };
                    (label.clone(), tau)
                })
                .collect();
            Arc::new(VerifyGate::new(g, thresholds, config.matcher.threshold))
        });

        let worker = match (&gate, ledger, config.oracle.worker) {
            (Some(gate), Some(ledger), true) => Some(VerifyWorker::spawn(
                Arc::clone(&oracle),
                Arc::clone(gate),
                Arc::new(Mutex::new(ledger)),
            )),
            _ => None,
        };
        let shadow_verify = worker.is_none() && config.oracle.shadow_verify && gate.is_some();

        info!(
            kb_size = shard.len(),
            backend = shard.backend().as_str(),
            worker = worker.is_some(),
            shadow_verify,
            "engine ready"
        );

        Ok(Self {
            controller: LatencyController::new(config.controller()),
            oracle,
            gate,
            worker,
            shadow_verify,
            telemetry: Telemetry::new(),
            purity: Arc::new(PurityGuard::new()),
            results: Vec::new(),
            frame_idx: 0,
            last_label: UNKNOWN_LABEL.to_string(),
            last_confidence: 0.0,
            last_unknown: true,
            debug_timing: false,
            index_bootstrap_ms: 0.0,
            provenance: Provenance::default(),
            started: Instant::now(),
            first_result_ms: None,
            shard,
            config,
        })
    }

    /// Emit `process_cold_start_ms` in the metrics.
    pub fn with_debug_timing(mut self, enabled: bool) -> Self {
        self.debug_timing = enabled;
        self
    }

    /// Record how long the LabelBank shard took to open.
    pub fn with_index_bootstrap_ms(mut self, ms: f64) -> Self {
        self.index_bootstrap_ms = ms;
        self
    }

    /// Stamp the run's provenance block into the metrics.
    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    /// Purity counter surface, shared with any networking shim.
    pub fn purity(&self) -> Arc<PurityGuard> {
        Arc::clone(&self.purity)
    }

    /// Drive the full run: every frame in input order, then shutdown,
    /// then aggregation.
    pub fn run(
        mut self,
        detector: &mut dyn Detector,
        tracker: &mut dyn Tracker,
        embedder: &mut dyn Embedder,
        frames: impl Iterator<Item = Frame>,
    ) -> RunReport {
        self.started = Instant::now();
        self.purity.arm();

        for frame in frames {
            self.step(detector, tracker, embedder, frame);
        }

        self.purity.disarm();

        // Shutdown: stop enqueues, let the worker finish its in-flight
        // item, abandon the rest.
        self.oracle.close();
        let ledger_appends = self.worker.take().map(|w| w.join()).unwrap_or(0);

        self.finish(ledger_appends)
    }

    fn step(
        &mut self,
        detector: &mut dyn Detector,
        tracker: &mut dyn Tracker,
        embedder: &mut dyn Embedder,
        frame: Frame,
    ) {
        let idx = self.frame_idx;
        self.frame_idx += 1;
        let stride_used = self.controller.stride();
        let t_frame = Instant::now();

        if self.controller.should_process(idx) {
            let (result, stages) = self.process_frame(detector, tracker, embedder, &frame, idx);
            let frame_ms = ms_since(t_frame);
            if self.first_result_ms.is_none() {
                self.first_result_ms = Some(ms_since(self.started));
            }
            self.telemetry.record_processed(
                frame_ms,
                stages.detect,
                stages.track,
                stages.embed,
                stages.matching,
                self.last_unknown,
            );
            self.results.push(result);
            self.controller.record_frame(frame_ms);
        } else {
            // Skipped: reuse the last processed frame's outcome so the
            // unknown-rate is not distorted; stages do not accumulate.
            let result = MatchResult {
                label: self.last_label.clone(),
                confidence: self.last_confidence,
                neighbors: Vec::new(),
                backend: self.shard.backend(),
                stride: stride_used,
                budget_hit: true,
                bbox: frame.bbox_hint,
                timestamp_ms: frame.timestamp_ms,
                sdk_version: SDK_VERSION.to_string(),
            };
            let frame_ms = ms_since(t_frame);
            self.telemetry.record_skipped(frame_ms, self.last_unknown);
            self.results.push(result);
            self.controller.record_frame(frame_ms);
        }
    }

    fn process_frame(
        &mut self,
        detector: &mut dyn Detector,
        tracker: &mut dyn Tracker,
        embedder: &mut dyn Embedder,
        frame: &Frame,
        idx: u64,
    ) -> (MatchResult, StageTimings) {
        self.controller.note_processed();
        let stride_used = self.controller.stride();
        let mut stages = StageTimings::default();

        let t = Instant::now();
        let detections = detector.detect(frame);
        stages.detect = ms_since(t);

        let t = Instant::now();
        let tracks = tracker.update(detections);
        stages.track = ms_since(t);

        let bbox = tracks.first().map(|t| t.bbox).or(frame.bbox_hint);

        let t = Instant::now();
        let embedded = embedder.embed(frame, bbox.as_ref());
        stages.embed = ms_since(t);

        let embedding = match embedded {
            Ok(v) => v,
            Err(e) => {
                warn!(frame = idx, error = %e, "embed failed; converting to unknown");
                return (self.failure_result(stride_used, bbox, frame.timestamp_ms), stages);
            }
        };

        let t = Instant::now();
        let lookup = self.shard.lookup(&embedding, self.config.matcher.topk);
        stages.matching = ms_since(t);

        let core = match lookup {
            Ok(core) => core,
            Err(e) => {
                warn!(frame = idx, error = %e, "lookup failed; converting to unknown");
                return (self.failure_result(stride_used, bbox, frame.timestamp_ms), stages);
            }
        };

        let unknown = core.is_unknown();
        if unknown {
            let candidate = OracleCandidate {
                embedding,
                candidates: prune_candidates(&core.neighbors),
                frame_seq: idx,
            };
            if self.shadow_verify {
                if let Some(gate) = &self.gate {
                    // Telemetry-only shadow pass; nothing reaches the ledger.
                    let _ = gate.verify(&candidate);
                }
            }
            self.oracle.try_enqueue(candidate);
        }

        self.last_label = core.label.clone();
        self.last_confidence = core.confidence;
        self.last_unknown = unknown;

        (
            core.into_result(stride_used, false, bbox, frame.timestamp_ms),
            stages,
        )
    }

    fn failure_result(
        &mut self,
        stride: u32,
        bbox: Option<BBox>,
        timestamp_ms: Option<i64>,
    ) -> MatchResult {
        self.last_label = UNKNOWN_LABEL.to_string();
        self.last_confidence = 0.0;
        self.last_unknown = true;
        MatchResult {
            label: UNKNOWN_LABEL.to_string(),
            confidence: 0.0,
            neighbors: Vec::new(),
            backend: self.shard.backend(),
            stride,
            budget_hit: true,
            bbox,
            timestamp_ms,
            sdk_version: SDK_VERSION.to_string(),
        }
    }

    fn finish(self, ledger_appends: u64) -> RunReport {
        let cfg = self.controller.config();
        let controller = ControllerReport {
            auto_stride: cfg.auto_stride,
            min_stride: cfg.min_stride,
            max_stride: cfg.max_stride,
            window: cfg.window,
            low_water: cfg.low_water,
            start_stride: cfg.start_stride,
            end_stride: self.controller.stride(),
            frames_total: self.controller.frames_total(),
            frames_processed: self.controller.frames_processed(),
            p50_window_ms: self.controller.p50_window_ms(),
            p95_window_ms: self.controller.p95_window_ms(),
            p99_window_ms: self.controller.p99_window_ms(),
            fps_window: self.controller.fps_window(),
        };

        let verify = self
            .gate
            .as_ref()
            .map(|g| g.snapshot())
            .unwrap_or(crate::verify::VerifySnapshot {
                called: 0,
                accepted: 0,
                rejected: 0,
            });

        let metrics = aggregate(
            &self.telemetry,
            controller,
            self.shard.len(),
            self.shard.backend(),
            self.config.latency.budget_ms as f64,
            self.config.unknown_rate_band,
            self.oracle.metrics(),
            verify,
            self.purity.report(),
            self.index_bootstrap_ms,
            self.provenance,
            if self.debug_timing {
                self.first_result_ms
            } else {
                None
            },
        );
        let hash = metrics_hash(&metrics);

        info!(
            frames = metrics.controller.frames_total,
            processed = metrics.controller.frames_processed,
            unknown_rate = metrics.unknown_rate,
            end_stride = metrics.controller.end_stride,
            "run finished"
        );

        RunReport {
            results: self.results,
            metrics,
            metrics_hash: hash,
            ledger_appends,
            telemetry: self.telemetry,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct StageTimings {
    detect: f64,
    track: f64,
    embed: f64,
    matching: f64,
}

#[inline]
fn ms_since(t: Instant) -> f64 {
    t.elapsed().as_secs_f64() * 1000.0
}

/// Keep only neighbors that could plausibly name the candidate: positive
/// scores, best first (they are already sorted descending).
fn prune_candidates(neighbors: &[NeighborHit]) -> Vec<NeighborHit> {
    neighbors.iter().filter(|n| n.score > 0.0).cloned().collect()
}
