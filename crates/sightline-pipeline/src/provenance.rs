//! Provenance stamps for `metrics.json`.
//!
//! Every run records which code, host, and fixture produced it so two
//! metrics files can be compared meaningfully. These fields describe the
//! environment, not the run's decisions, so they stay outside the
//! canonical metrics-hash subset.

use std::path::PathBuf;
use std::process::Command;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Provenance block embedded in [`crate::telemetry::RunMetrics`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Provenance {
    pub git_commit: String,
    pub hardware_id: String,
    pub fixture_hash: String,
}

impl Default for Provenance {
    fn default() -> Self {
        Self {
            git_commit: "unknown".to_string(),
            hardware_id: "unknown".to_string(),
            fixture_hash: "unknown".to_string(),
        }
    }
}

/// Current git commit, falling back to the `GIT_COMMIT` environment
/// variable and then `"unknown"` when git is unavailable.
pub fn git_commit() -> String {
    let out = Command::new("git").args(["rev-parse", "HEAD"]).output();
    match out {
        Ok(out) if out.status.success() => {
            let commit = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if commit.is_empty() {
                fallback_commit()
            } else {
                commit
            }
        }
        _ => fallback_commit(),
    }
}

fn fallback_commit() -> String {
    std::env::var("GIT_COMMIT").unwrap_or_else(|_| "unknown".to_string())
}

/// Simple host identifier string.
pub fn hardware_id() -> String {
    format!("{}|{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// SHA-256 over the ordered filenames and bytes of the fixture files.
/// Unreadable entries contribute their name only.
pub fn fixture_hash(files: &[PathBuf]) -> String {
    let mut sorted: Vec<&PathBuf> = files.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    for path in sorted {
        if let Some(name) = path.file_name() {
            hasher.update(name.to_string_lossy().as_bytes());
        }
        if let Ok(bytes) = std::fs::read(path) {
            hasher.update(&bytes);
        }
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Collect the full provenance block for a run over `files`.
pub fn collect(files: &[PathBuf]) -> Provenance {
    Provenance {
        git_commit: git_commit(),
        hardware_id: hardware_id(),
        fixture_hash: fixture_hash(files),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fixture_hash_is_order_independent_and_content_sensitive() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.jsonl");
        let b = dir.path().join("b.json");
        std::fs::write(&a, "alpha").unwrap();
        std::fs::write(&b, "beta").unwrap();

        let forward = fixture_hash(&[a.clone(), b.clone()]);
        let reversed = fixture_hash(&[b.clone(), a.clone()]);
        assert_eq!(forward, reversed);
        assert_eq!(forward.len(), 64);

        std::fs::write(&a, "alpha2").unwrap();
        assert_ne!(forward, fixture_hash(&[a, b]));
    }

    #[test]
    fn missing_file_contributes_name_only() {
        let dir = TempDir::new().unwrap();
        let ghost = dir.path().join("ghost.jsonl");
        let hash = fixture_hash(&[ghost]);
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn hardware_id_names_os_and_arch() {
        let id = hardware_id();
        assert!(id.contains('|'));
        assert!(!id.starts_with('|') && !id.ends_with('|'));
    }

    #[test]
    fn collect_fills_every_field() {
        let prov = collect(&[]);
        assert!(!prov.git_commit.is_empty());
        assert!(!prov.hardware_id.is_empty());
        assert!(!prov.fixture_hash.is_empty());
    }
}
