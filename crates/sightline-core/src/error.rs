//! Error types for the sightline workspace.
//!
//! This module defines the central error types used throughout the system:
//!
//! - [`SightlineError`]: top-level unified error for all crate errors
//! - Sub-error types: [`BankError`], [`ConfigError`], [`LedgerError`],
//!   [`PromotionError`], [`CalibrationError`]
//!
//! Library code never panics; everything returns `Result` and propagates
//! with `?`. The CLI boundary translates a [`SightlineError`] into a process
//! exit code via [`SightlineError::exit_code`].

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for core operations.
pub type CoreResult<T> = Result<T, SightlineError>;

// ============================================================================
// Top-level unified error type
// ============================================================================

/// Top-level unified error for the sightline system.
///
/// # Exit codes
///
/// - `2`: user/data errors (bad input, config, band/budget gate, ledger
///   corruption, purity violation)
/// - `3`: a requested optional backend is not compiled in
#[derive(Debug, Error)]
pub enum SightlineError {
    /// LabelBank shard error.
    #[error("label bank error: {0}")]
    Bank(#[from] BankError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Calibration error.
    #[error("calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    /// Evidence ledger error.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// KB promotion error.
    #[error("promotion error: {0}")]
    Promotion(#[from] PromotionError),

    /// Malformed input data (empty fixture, bad record, dim mismatch).
    #[error("data error: {0}")]
    Data(String),

    /// Sustained p95 over budget at end of run with the gate enabled.
    #[error("budget breach: p95 {p95_ms:.3}ms > budget {budget_ms:.3}ms")]
    BudgetBreach { p95_ms: f64, budget_ms: f64 },

    /// Unknown-rate outside the configured band.
    #[error("unknown rate {rate:.3} outside band [{low:.3}, {high:.3}]")]
    BandViolation { rate: f64, low: f64, high: f64 },

    /// Network syscalls were recorded inside the hot loop.
    #[error("purity violation: {sockets} socket / {dns} dns operations in hot loop")]
    PurityViolation { sockets: u64, dns: u64 },
}

impl SightlineError {
    /// Map this error to the process exit code contract.
    ///
    /// `0` is success and never produced here; `2` covers user/data errors
    /// and gate failures; `3` is reserved for a missing optional backend.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Bank(BankError::BackendUnavailable { .. }) => 3,
            _ => 2,
        }
    }
}

// ============================================================================
// LabelBank errors
// ============================================================================

/// Errors raised by shard build, open, and lookup.
#[derive(Debug, Error)]
pub enum BankError {
    /// Query or exemplar dimension does not match the shard dimension.
    #[error("dim mismatch: expected {expected}, got {actual}")]
    DimMismatch { expected: usize, actual: usize },

    /// The shard contains no exemplars.
    #[error("shard is empty")]
    EmptyShard,

    /// A vector failed the unit-norm check at build time.
    #[error("vector for label {label:?} is not L2-normalized (|v| = {norm})")]
    NotNormalized { label: String, norm: f32 },

    /// Structural failure while decoding a shard file.
    #[error("corrupt shard at {path}: {reason}")]
    CorruptShard { path: PathBuf, reason: String },

    /// The struct hash recorded in the shard does not match its contents.
    #[error("struct hash mismatch for {path}")]
    StructHashMismatch { path: PathBuf },

    /// The requested kernel is not compiled into this binary.
    #[error("backend {requested:?} is not available in this build")]
    BackendUnavailable { requested: String },

    /// IO failure during shard open or build.
    #[error("shard io: {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl BankError {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

// ============================================================================
// Configuration errors
// ============================================================================

/// Invalid config value or load failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value failed validation.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    /// The layered loader failed to read or parse a source.
    #[error("failed to load configuration: {0}")]
    Load(String),
}

// ============================================================================
// Calibration errors
// ============================================================================

/// Errors during calibration table construction.
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// No scores available to fit against.
    #[error("calibration set is empty")]
    EmptySet,

    /// Label id out of range for the table.
    #[error("label id {0} not in calibration table")]
    UnknownLabelId(u32),
}

// ============================================================================
// Ledger errors
// ============================================================================

/// Evidence ledger failures. A chain break is fatal.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The hash chain or sequence numbering is broken.
    #[error("ledger corrupt at sequence {sequence}: {reason}")]
    Corrupt { sequence: u64, reason: String },

    /// A record failed to parse as JSON.
    #[error("ledger record {line} is not valid JSON: {reason}")]
    BadRecord { line: usize, reason: String },

    /// IO failure during append or replay.
    #[error("ledger io: {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl LedgerError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

// ============================================================================
// Promotion errors
// ============================================================================

/// Offline KB promotion failures.
///
/// An empty class is a skip, not an error; it is logged to the promotion
/// ledger by the promoter.
#[derive(Debug, Error)]
pub enum PromotionError {
    /// Embeddings for a class disagree on dimension.
    #[error("class {label:?} has inconsistent dims: expected {expected}, got {actual}")]
    DimMismatch {
        label: String,
        expected: usize,
        actual: usize,
    },

    /// A medoid file failed its digest check on read-back.
    #[error("medoid file {path} failed integrity check")]
    BadDigest { path: PathBuf },

    /// Malformed medoid file.
    #[error("corrupt medoid file {path}: {reason}")]
    CorruptFile { path: PathBuf, reason: String },

    /// IO failure; aborts the promotion run, prior medoids untouched.
    #[error("promotion io: {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl PromotionError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_contract() {
        let backend = SightlineError::Bank(BankError::BackendUnavailable {
            requested: "faiss".to_string(),
        });
        assert_eq!(backend.exit_code(), 3);

        let data = SightlineError::Data("empty fixture".to_string());
        assert_eq!(data.exit_code(), 2);

        let band = SightlineError::BandViolation {
            rate: 0.55,
            low: 0.10,
            high: 0.40,
        };
        assert_eq!(band.exit_code(), 2);

        let ledger = SightlineError::Ledger(LedgerError::Corrupt {
            sequence: 1,
            reason: "prev_hash mismatch".to_string(),
        });
        assert_eq!(ledger.exit_code(), 2);
    }
}
