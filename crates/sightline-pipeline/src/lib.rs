//! Sightline runtime: the per-frame hot loop and its control plane.
//!
//! - [`engine`]: detect → track → embed → match loop, skip semantics,
//!   failure conversion, run report
//! - [`oracle`]: bounded drop-oldest candidate queue
//! - [`verify`]: curated-gallery second-stage gate
//! - [`worker`]: the single background oracle → verify → ledger thread
//! - [`telemetry`]: `metrics.json`, `stage_timings.csv`, metrics hash
//! - [`provenance`]: git/host/fixture stamps for metrics
//! - [`purity`]: hot-loop network-syscall accounting
//! - [`slo`]: offline/e2e service-level gates

pub mod engine;
pub mod oracle;
pub mod provenance;
pub mod purity;
pub mod slo;
pub mod telemetry;
pub mod verify;
pub mod worker;

pub use engine::{Detector, Embedder, EmbedderError, Engine, Frame, RunReport, TrackedBox, Tracker};
pub use oracle::{CandidateOracle, OracleMetrics};
pub use provenance::Provenance;
pub use purity::{PurityGuard, PurityReport};
pub use slo::SloGates;
pub use telemetry::{metrics_hash, RunMetrics, Telemetry};
pub use verify::{Gallery, VerifyGate, VerifySnapshot};
pub use worker::VerifyWorker;
