//! Domain types shared across the workspace.
//!
//! The per-frame result contract ([`MatchResult`]) is frozen at
//! `metrics_schema_version = "0.1"`: unknown state is encoded as the
//! reserved label value `"unknown"` rather than a separate variant so the
//! JSON schema stays flat for v0.1 consumers. Additive fields require a new
//! schema version.

use serde::{Deserialize, Serialize};

/// Reserved label value for open-set "no known label applies".
pub const UNKNOWN_LABEL: &str = "unknown";

/// Schema version stamped into `metrics.json` and honored by `MatchResult`.
pub const METRICS_SCHEMA_VERSION: &str = "0.1";

/// Crate version reported as `sdk_version` in results and metrics.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Matching
// ============================================================================

/// Which dot-product kernel served a lookup.
///
/// The wire tags are fixed by the v0.1 contract: the fused matrix-vector
/// kernel reports as `"faiss"` and the scalar fallback as `"numpy"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    #[serde(rename = "faiss")]
    Faiss,
    #[serde(rename = "numpy")]
    Numpy,
}

impl Backend {
    /// Wire tag for reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Faiss => "faiss",
            Backend::Numpy => "numpy",
        }
    }
}

/// One top-k neighbor: label plus cosine score in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborHit {
    pub label: String,
    pub score: f32,
}

/// Axis-aligned box as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBox(pub [i32; 4]);

/// Per-frame result record, one per processed or skipped frame.
///
/// Invariants upheld by producers:
/// - `neighbors` sorted strictly descending by score, scores in `[-1, 1]`
/// - if `label != "unknown"` and `neighbors` is non-empty then
///   `label == neighbors[0].label`
/// - `stride >= 1`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub label: String,
    pub confidence: f32,
    pub neighbors: Vec<NeighborHit>,
    pub backend: Backend,
    pub stride: u32,
    pub budget_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
    pub sdk_version: String,
}

impl MatchResult {
    /// True when the frame resolved to no known label.
    pub fn is_unknown(&self) -> bool {
        self.label == UNKNOWN_LABEL
    }
}

/// Lookup output before the controller stamps stride/budget fields.
#[derive(Debug, Clone)]
pub struct MatchCore {
    pub label: String,
    pub label_id: Option<u32>,
    pub confidence: f32,
    pub neighbors: Vec<NeighborHit>,
    pub backend: Backend,
}

impl MatchCore {
    /// True when the lookup resolved to no known label.
    pub fn is_unknown(&self) -> bool {
        self.label == UNKNOWN_LABEL
    }

    /// Promote into the frozen per-frame record.
    pub fn into_result(
        self,
        stride: u32,
        budget_hit: bool,
        bbox: Option<BBox>,
        timestamp_ms: Option<i64>,
    ) -> MatchResult {
        MatchResult {
            label: self.label,
            confidence: self.confidence,
            neighbors: self.neighbors,
            backend: self.backend,
            stride,
            budget_hit,
            bbox,
            timestamp_ms,
            sdk_version: SDK_VERSION.to_string(),
        }
    }
}

// ============================================================================
// Oracle / verify payloads
// ============================================================================

/// Payload captured for an unknown frame, pending verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleCandidate {
    /// L2-normalized embedding of the unknown frame.
    pub embedding: Vec<f32>,
    /// Candidate labels with scores, best first.
    pub candidates: Vec<NeighborHit>,
    /// Frame sequence number the candidate came from.
    pub frame_seq: u64,
}

/// Outcome of the verify gate for a single candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyEvidence {
    pub label: String,
    /// Re-embedded vector (the current gate reuses the candidate embedding).
    pub embedding: Vec<f32>,
    pub accepted: bool,
    pub reason: String,
    /// Max cosine against the gallery of the proposed label.
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_wire_tags() {
        assert_eq!(Backend::Faiss.as_str(), "faiss");
        assert_eq!(Backend::Numpy.as_str(), "numpy");
        let json = serde_json::to_string(&Backend::Faiss).unwrap();
        assert_eq!(json, "\"faiss\"");
    }

    #[test]
    fn match_result_serializes_optionals_sparsely() {
        let core = MatchCore {
            label: UNKNOWN_LABEL.to_string(),
            label_id: None,
            confidence: 0.0,
            neighbors: vec![],
            backend: Backend::Numpy,
        };
        let result = core.into_result(1, false, None, None);
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("bbox").is_none());
        assert!(json.get("timestamp_ms").is_none());
        assert_eq!(json["label"], UNKNOWN_LABEL);
        assert_eq!(json["stride"], 1);
    }

    #[test]
    fn unknown_flag_follows_reserved_label() {
        let core = MatchCore {
            label: "red-mug".to_string(),
            label_id: Some(0),
            confidence: 0.78,
            neighbors: vec![NeighborHit {
                label: "red-mug".to_string(),
                score: 0.78,
            }],
            backend: Backend::Faiss,
        };
        assert!(!core.is_unknown());
        assert!(core.into_result(1, false, None, None).label == "red-mug");
    }
}
