//! `run`: drive the recognition loop over a fixture directory and emit the
//! end-of-run artifacts.
//!
//! A fixture directory contains `frames.jsonl` (one frame per line:
//! `{"embedding": [...], "bbox": [x1,y1,x2,y2], "timestamp_ms": ...}`,
//! bbox and timestamp optional) and an optional `manifest.json` with an
//! `unknown_rate_band`. Band precedence: CLI flag > fixture manifest >
//! configuration.
//!
//! Artifacts written to the output directory: `metrics.json`,
//! `stage_timings.csv`, `results.jsonl`, `metrics_hash.txt`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use serde::Deserialize;
use tracing::{info, warn};

use sightline_core::bank::Shard;
use sightline_core::types::BBox;
use sightline_core::SightlineError;
use sightline_pipeline::engine::{Engine, Frame};
use sightline_pipeline::provenance;
use sightline_pipeline::telemetry::{write_metrics_json, write_stage_timings_csv};
use sightline_pipeline::verify::Gallery;
use sightline_storage::EvidenceLedger;
use sightline_testkit::{encode_payload, FakeDetector, PassThroughTracker, PayloadEmbedder};

use super::load_config;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Fixture directory with frames.jsonl (+ optional manifest.json).
    #[arg(long)]
    pub fixture: PathBuf,

    /// Artifact output directory (defaults to paths.out_dir).
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Override latency.budget_ms.
    #[arg(long)]
    pub budget_ms: Option<u32>,

    /// Override the unknown-rate band as "low,high".
    #[arg(long, value_parser = parse_band)]
    pub band: Option<(f64, f64)>,

    /// Override the shard path.
    #[arg(long)]
    pub shard: Option<PathBuf>,

    /// Cycle the fixture for this many minutes instead of one pass.
    #[arg(long, default_value_t = 0)]
    pub duration_min: u64,

    /// Fail with exit 2 when end-of-run p95 exceeds the budget.
    #[arg(long, default_value_t = false)]
    pub gate: bool,

    /// Emit process_cold_start_ms in metrics.json.
    #[arg(long, default_value_t = false)]
    pub debug_timing: bool,
}

fn parse_band(s: &str) -> Result<(f64, f64), String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 2 {
        return Err("expected low,high".to_string());
    }
    let low: f64 = parts[0].trim().parse().map_err(|e| format!("{e}"))?;
    let high: f64 = parts[1].trim().parse().map_err(|e| format!("{e}"))?;
    Ok((low, high))
}

#[derive(Debug, Deserialize)]
struct FixtureFrame {
    embedding: Vec<f32>,
    #[serde(default)]
    bbox: Option<[i32; 4]>,
    #[serde(default)]
    timestamp_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct FixtureManifest {
    #[serde(default)]
    unknown_rate_band: Option<[f64; 2]>,
}

fn load_frames(dir: &Path) -> Result<Vec<Frame>, SightlineError> {
    let path = dir.join("frames.jsonl");
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| SightlineError::Data(format!("fixture {}: {e}", path.display())))?;

    let mut frames = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: FixtureFrame = serde_json::from_str(line)
            .map_err(|e| SightlineError::Data(format!("fixture frame {idx}: {e}")))?;
        frames.push(Frame {
            seq: frames.len() as u64,
            data: encode_payload(&parsed.embedding),
            bbox_hint: parsed.bbox.map(BBox),
            timestamp_ms: parsed.timestamp_ms,
        });
    }
    if frames.is_empty() {
        return Err(SightlineError::Data(format!(
            "fixture {} contains no frames",
            path.display()
        )));
    }
    Ok(frames)
}

fn load_manifest(dir: &Path) -> FixtureManifest {
    let path = dir.join("manifest.json");
    if !path.exists() {
        return FixtureManifest::default();
    }
    match std::fs::read_to_string(&path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
    {
        Some(manifest) => manifest,
        None => {
            warn!(path = %path.display(), "ignoring unreadable fixture manifest");
            FixtureManifest::default()
        }
    }
}

pub fn execute(config_path: Option<&Path>, args: RunArgs) -> Result<(), SightlineError> {
    let mut config = load_config(config_path)?;

    // Precedence: CLI > fixture manifest > config defaults.
    if let Some(budget) = args.budget_ms {
        config.latency.budget_ms = budget;
    }
    let manifest = load_manifest(&args.fixture);
    if let Some((low, high)) = args.band {
        config.unknown_rate_band = [low, high];
    } else if let Some(band) = manifest.unknown_rate_band {
        config.unknown_rate_band = band;
    }
    config.validate()?;

    let shard_path = args
        .shard
        .unwrap_or_else(|| PathBuf::from(&config.paths.shard));
    let out_dir = args
        .out
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.paths.out_dir));

    let t_bootstrap = std::time::Instant::now();
    let shard = Arc::new(Shard::open(&shard_path, &config.matcher)?);
    let index_bootstrap_ms = t_bootstrap.elapsed().as_secs_f64() * 1000.0;
    info!(
        bootstrap_ms = index_bootstrap_ms,
        kb_size = shard.len(),
        "label bank ready"
    );

    let frames = load_frames(&args.fixture)?;

    let gallery_path = PathBuf::from(&config.paths.gallery_jsonl);
    let gallery = if gallery_path.exists() {
        Some(Gallery::load_jsonl(&gallery_path)?)
    } else {
        info!(path = %gallery_path.display(), "no verify gallery; gate disabled");
        None
    };
    let ledger = if config.oracle.worker {
        Some(EvidenceLedger::open(Path::new(&config.paths.ledger))?)
    } else {
        None
    };

    // Provenance is collected before the hot loop starts; the git probe is
    // a local subprocess and must not run between first and last frame.
    let fixture_files = vec![
        args.fixture.join("frames.jsonl"),
        args.fixture.join("manifest.json"),
    ];
    let stamp = provenance::collect(&fixture_files);

    let engine = Engine::new(shard, config.clone(), gallery, ledger)?
        .with_debug_timing(args.debug_timing)
        .with_index_bootstrap_ms(index_bootstrap_ms)
        .with_provenance(stamp);

    info!(frames = frames.len(), fixture = %args.fixture.display(), "run starting");
    // A run ends when input is exhausted, or when the wall-clock duration
    // flag elapses (the fixture cycles until the deadline).
    let frame_iter: Box<dyn Iterator<Item = Frame>> = if args.duration_min > 0 {
        let deadline =
            std::time::Instant::now() + std::time::Duration::from_secs(args.duration_min * 60);
        Box::new(
            frames
                .into_iter()
                .cycle()
                .take_while(move |_| std::time::Instant::now() < deadline),
        )
    } else {
        Box::new(frames.into_iter())
    };
    let report = engine.run(
        &mut FakeDetector,
        &mut PassThroughTracker::default(),
        &mut PayloadEmbedder,
        frame_iter,
    );

    // Artifacts are written before any gate decides the exit code.
    write_metrics_json(&out_dir.join("metrics.json"), &report.metrics)
        .map_err(|e| SightlineError::Data(format!("writing metrics.json: {e}")))?;
    write_stage_timings_csv(&out_dir.join("stage_timings.csv"), &report.telemetry)
        .map_err(|e| SightlineError::Data(format!("writing stage_timings.csv: {e}")))?;
    write_results_jsonl(&out_dir.join("results.jsonl"), &report)?;
    std::fs::write(
        out_dir.join("metrics_hash.txt"),
        format!("{}\n", report.metrics_hash),
    )
    .map_err(|e| SightlineError::Data(format!("writing metrics_hash.txt: {e}")))?;

    println!(
        "frames {} processed {} unknown_rate {:.3} p95 {:.3}ms stride {} -> {}",
        report.metrics.controller.frames_total,
        report.metrics.controller.frames_processed,
        report.metrics.unknown_rate,
        report.metrics.p95,
        report.metrics.controller.start_stride,
        report.metrics.controller.end_stride,
    );
    println!("metrics_hash {}", report.metrics_hash);

    report.enforce(args.gate)
}

fn write_results_jsonl(
    path: &Path,
    report: &sightline_pipeline::engine::RunReport,
) -> Result<(), SightlineError> {
    let map_err = |e: std::io::Error| SightlineError::Data(format!("writing results.jsonl: {e}"));
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(map_err)?;
        }
    }
    let mut file = std::fs::File::create(path).map_err(map_err)?;
    for result in &report.results {
        let line = serde_json::to_string(result)
            .map_err(|e| SightlineError::Data(format!("encoding result: {e}")))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(map_err)?;
    }
    Ok(())
}
