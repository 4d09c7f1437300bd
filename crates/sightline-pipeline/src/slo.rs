//! Service-level objective gates for offline and end-to-end benches.
//!
//! The offline gates cover LabelBank lookup quality and speed (recall@k,
//! lookup p95); the e2e gates cover the full loop (precision@1, frame p95).
//! Gate mode in the CLI maps a failed check to exit code 2 after artifacts
//! are written.

use sightline_core::SightlineError;

/// SLO thresholds enforced across benches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SloGates {
    /// Minimum recall@k for bench queries against their own shard.
    pub offline_recall: f64,
    /// Maximum lookup p95 for shards up to 10k labels.
    pub offline_p95_ms: f64,
    /// Minimum precision@1 on the e2e bench.
    pub e2e_p_at_1: f64,
    /// Maximum per-frame p95 on the e2e bench.
    pub e2e_p95_ms: f64,
}

impl Default for SloGates {
    fn default() -> Self {
        Self {
            offline_recall: 0.95,
            offline_p95_ms: 10.0,
            e2e_p_at_1: 0.80,
            e2e_p95_ms: 33.0,
        }
    }
}

impl SloGates {
    /// Check the offline lookup gates.
    pub fn check_offline(&self, recall: f64, lookup_p95_ms: f64) -> Result<(), SightlineError> {
        if recall < self.offline_recall {
            return Err(SightlineError::Data(format!(
                "offline recall {recall:.4} < gate {:.4}",
                self.offline_recall
            )));
        }
        if lookup_p95_ms > self.offline_p95_ms {
            return Err(SightlineError::BudgetBreach {
                p95_ms: lookup_p95_ms,
                budget_ms: self.offline_p95_ms,
            });
        }
        Ok(())
    }

    /// Check the end-to-end gates.
    pub fn check_e2e(&self, p_at_1: f64, frame_p95_ms: f64) -> Result<(), SightlineError> {
        if p_at_1 < self.e2e_p_at_1 {
            return Err(SightlineError::Data(format!(
                "p@1 {p_at_1:.4} < gate {:.4}",
                self.e2e_p_at_1
            )));
        }
        if frame_p95_ms > self.e2e_p95_ms {
            return Err(SightlineError::BudgetBreach {
                p95_ms: frame_p95_ms,
                budget_ms: self.e2e_p95_ms,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_published_gates() {
        let gates = SloGates::default();
        assert_eq!(gates.offline_recall, 0.95);
        assert_eq!(gates.offline_p95_ms, 10.0);
        assert_eq!(gates.e2e_p_at_1, 0.80);
        assert_eq!(gates.e2e_p95_ms, 33.0);
    }

    #[test]
    fn passing_metrics_clear_both_gates() {
        let gates = SloGates::default();
        assert!(gates.check_offline(0.99, 4.0).is_ok());
        assert!(gates.check_e2e(0.9, 20.0).is_ok());
    }

    #[test]
    fn each_breach_is_reported() {
        let gates = SloGates::default();
        assert!(gates.check_offline(0.90, 4.0).is_err());
        assert!(matches!(
            gates.check_offline(0.99, 12.0),
            Err(SightlineError::BudgetBreach { .. })
        ));
        assert!(gates.check_e2e(0.5, 20.0).is_err());
        assert!(matches!(
            gates.check_e2e(0.9, 40.0),
            Err(SightlineError::BudgetBreach { .. })
        ));
    }
}
