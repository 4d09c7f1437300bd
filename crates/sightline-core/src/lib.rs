//! Sightline core library.
//!
//! Domain types and hot-path algorithms for the latency-bounded open-set
//! recognition engine:
//!
//! - [`bank`]: LabelBank shard build/open and exact top-k lookup
//! - [`calibration`]: quantile accept thresholds and temperature scaling
//! - [`controller`]: windowed p95 latency controller (stride adaptation)
//! - [`quant`]: int8 medoid quantization
//! - [`similarity`]: dot-product kernels and bounded top-k selection
//! - [`config`] / [`error`] / [`types`]: ambient plumbing shared by every
//!   crate in the workspace
//!
//! The runtime path (oracle, verify, engine, telemetry) lives in
//! `sightline-pipeline`; durable artifacts (ledger, medoids) live in
//! `sightline-storage`.

pub mod bank;
pub mod calibration;
pub mod config;
pub mod controller;
pub mod error;
pub mod quant;
pub mod similarity;
pub mod types;

pub use config::Config;
pub use error::{CoreResult, SightlineError};
pub use types::{
    Backend, MatchCore, MatchResult, NeighborHit, METRICS_SCHEMA_VERSION, SDK_VERSION,
    UNKNOWN_LABEL,
};
