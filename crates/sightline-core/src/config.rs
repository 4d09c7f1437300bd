//! Configuration for the sightline engine.
//!
//! Values are resolved once at startup into an immutable [`Config`] that is
//! passed into the pipeline; there are no process-wide singletons at
//! runtime. Precedence, lowest to highest: built-in defaults →
//! `sightline.toml` → environment variables prefixed `SIGHTLINE__` (`__`
//! separates section and key, e.g. `SIGHTLINE__LATENCY__BUDGET_MS=33`) →
//! CLI flags applied by the binary after loading.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::controller::ControllerConfig;
use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub latency: LatencyConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Accepted unknown-rate band `[low, high]`; runs outside it fail the
    /// gate with exit code 2.
    #[serde(default = "default_unknown_rate_band")]
    pub unknown_rate_band: [f64; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Per-frame wall budget in milliseconds. The demo profile uses 33.
    pub budget_ms: u32,
    /// Ring-buffer window for the p95 controller.
    pub window: usize,
    /// Fraction of budget under which frames count toward stride recovery.
    pub low_water: f64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            budget_ms: 66,
            window: 120,
            low_water: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub frame_stride: u32,
    pub min_stride: u32,
    pub max_stride: u32,
    pub auto_stride: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_stride: 1,
            min_stride: 1,
            max_stride: 4,
            auto_stride: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub topk: usize,
    /// Global accept threshold; per-label calibrated τ overrides it.
    pub threshold: f32,
    /// Minimum neighbors clearing their thresholds for a known match.
    pub min_neighbors: usize,
    /// Kernel request: "auto", "faiss", or "numpy".
    pub backend: String,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            topk: 5,
            threshold: 0.35,
            min_neighbors: 1,
            backend: "auto".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Bounded queue capacity; overflow drops the oldest entry.
    pub maxlen: usize,
    /// Run the background verify worker (appends accepts to the ledger).
    pub worker: bool,
    /// When abstaining, still exercise the verify gate for telemetry only.
    pub shadow_verify: bool,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            maxlen: 64,
            worker: false,
            shadow_verify: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Exemplar store consumed by `build-shard`.
    pub kb_json: String,
    /// Built LabelBank shard artifact.
    pub shard: String,
    /// Verify gallery manifest (JSONL of `{label, embedding}`).
    pub gallery_jsonl: String,
    /// Evidence ledger file.
    pub ledger: String,
    /// Directory for per-class medoid files and the promotion ledger.
    pub medoid_dir: String,
    /// Run artifact directory (`metrics.json`, `stage_timings.csv`).
    pub out_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            kb_json: "data/kb.json".to_string(),
            shard: "data/labelbank.shard".to_string(),
            gallery_jsonl: "data/gallery_manifest.jsonl".to_string(),
            ledger: "artifacts/evidence_ledger.jsonl".to_string(),
            medoid_dir: "artifacts/medoids".to_string(),
            out_dir: "artifacts".to_string(),
        }
    }
}

fn default_unknown_rate_band() -> [f64; 2] {
    [0.10, 0.40]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            latency: LatencyConfig::default(),
            pipeline: PipelineConfig::default(),
            matcher: MatcherConfig::default(),
            oracle: OracleConfig::default(),
            paths: PathsConfig::default(),
            unknown_rate_band: default_unknown_rate_band(),
        }
    }
}

impl Config {
    /// Load configuration with layered precedence (defaults < toml < env).
    ///
    /// `toml_path` defaults to `sightline.toml` in the working directory;
    /// a missing file is not an error. CLI overrides are applied by the
    /// binary after this returns.
    pub fn load(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match toml_path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name("sightline").required(false),
        };
        let loaded: Config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("SIGHTLINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Validate value ranges; called after every load or override pass.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.latency.budget_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "latency.budget_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.latency.window < 2 {
            return Err(ConfigError::InvalidValue {
                key: "latency.window",
                reason: "must be at least 2".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.latency.low_water) {
            return Err(ConfigError::InvalidValue {
                key: "latency.low_water",
                reason: "must be in (0, 1)".to_string(),
            });
        }
        if self.pipeline.min_stride < 1 {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.min_stride",
                reason: "stride floor is 1".to_string(),
            });
        }
        if self.pipeline.max_stride < self.pipeline.min_stride {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.max_stride",
                reason: "must be >= pipeline.min_stride".to_string(),
            });
        }
        if self.pipeline.frame_stride < self.pipeline.min_stride
            || self.pipeline.frame_stride > self.pipeline.max_stride
        {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.frame_stride",
                reason: "must lie within [min_stride, max_stride]".to_string(),
            });
        }
        if self.matcher.topk == 0 {
            return Err(ConfigError::InvalidValue {
                key: "matcher.topk",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(-1.0..=1.0).contains(&self.matcher.threshold) {
            return Err(ConfigError::InvalidValue {
                key: "matcher.threshold",
                reason: "cosine threshold must be in [-1, 1]".to_string(),
            });
        }
        match self.matcher.backend.as_str() {
            "auto" | "faiss" | "numpy" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "matcher.backend",
                    reason: format!("unknown backend {other:?}"),
                });
            }
        }
        let [low, high] = self.unknown_rate_band;
        if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low > high {
            return Err(ConfigError::InvalidValue {
                key: "unknown_rate_band",
                reason: "band must satisfy 0 <= low <= high <= 1".to_string(),
            });
        }
        Ok(())
    }

    /// Controller configuration derived from the latency/pipeline sections.
    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            budget_ms: self.latency.budget_ms as f64,
            window: self.latency.window,
            low_water: self.latency.low_water,
            auto_stride: self.pipeline.auto_stride,
            min_stride: self.pipeline.min_stride,
            max_stride: self.pipeline.max_stride,
            start_stride: self.pipeline.frame_stride,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.latency.budget_ms, 66);
        assert_eq!(cfg.oracle.maxlen, 64);
        assert_eq!(cfg.unknown_rate_band, [0.10, 0.40]);
    }

    #[test]
    fn invalid_low_water_rejected() {
        let mut cfg = Config::default();
        cfg.latency.low_water = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue {
                key: "latency.low_water",
                ..
            })
        ));
    }

    #[test]
    fn stride_bounds_enforced() {
        let mut cfg = Config::default();
        cfg.pipeline.max_stride = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.pipeline.frame_stride = 9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn band_must_be_ordered() {
        let mut cfg = Config::default();
        cfg.unknown_rate_band = [0.5, 0.2];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sightline.toml");
        std::fs::write(
            &path,
            "[latency]\nbudget_ms = 33\n\n[matcher]\ntopk = 8\n",
        )
        .unwrap();
        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.latency.budget_ms, 33);
        assert_eq!(cfg.matcher.topk, 8);
        // Untouched sections keep defaults.
        assert_eq!(cfg.pipeline.max_stride, 4);
    }
}
