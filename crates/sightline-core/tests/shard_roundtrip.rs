//! Shard build → open round trips and open-set lookup behavior.

use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

use sightline_core::bank::{Shard, ShardBuilder};
use sightline_core::config::MatcherConfig;
use sightline_core::error::BankError;
use sightline_core::similarity::normalize;
use sightline_core::UNKNOWN_LABEL;

fn unit_vec(rng: &mut ChaCha8Rng, dim: usize) -> Vec<f32> {
    let mut v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
    normalize(&mut v);
    v
}

fn matcher() -> MatcherConfig {
    MatcherConfig {
        backend: "numpy".to_string(),
        ..MatcherConfig::default()
    }
}

/// 32-d orthonormal-ish fixture: e1 along axis 0, e2 along axis 1.
fn axis_vec(dim: usize, axis: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dim];
    v[axis] = 1.0;
    v
}

#[test]
fn build_open_preserves_struct_hash_and_topk_order() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bank.shard");
    let mut rng = ChaCha8Rng::seed_from_u64(11);

    let mut builder = ShardBuilder::new();
    let mut vectors = Vec::new();
    for label in ["apple", "banana", "carrot"] {
        for _ in 0..4 {
            let v = unit_vec(&mut rng, 32);
            vectors.push((label.to_string(), v.clone()));
            builder.add(label, v).unwrap();
        }
    }
    let meta = builder.build_to(&path).unwrap();
    assert_eq!(meta.count, 12);
    assert_eq!(meta.label_count, 3);

    let shard = Shard::open(&path, &matcher()).unwrap();
    assert_eq!(shard.struct_hash_hex(), meta.struct_hash_hex);

    // Rebuild with shuffled insertion order: the hash must not move.
    let path2 = dir.path().join("bank2.shard");
    let mut builder2 = ShardBuilder::new();
    for (label, v) in vectors.iter().rev() {
        builder2.add(label.clone(), v.clone()).unwrap();
    }
    let meta2 = builder2.build_to(&path2).unwrap();
    assert_eq!(meta2.struct_hash_hex, meta.struct_hash_hex);

    // Identical queries resolve to identical neighbor sequences.
    let shard2 = Shard::open(&path2, &matcher()).unwrap();
    let q = unit_vec(&mut rng, 32);
    let a = shard.topk(&q, 5).unwrap();
    let b = shard2.topk(&q, 5).unwrap();
    assert_eq!(a, b);
}

#[test]
fn known_hit_resolves_top1_label() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bank.shard");

    let e1 = axis_vec(32, 0);
    let e2 = axis_vec(32, 1);

    let mut builder = ShardBuilder::new().with_fallback_tau(0.50);
    builder.add("red-mug", e1).unwrap();
    builder.add("maroon-cup", e2).unwrap();
    builder.build_to(&path).unwrap();

    let mut cfg = matcher();
    cfg.threshold = 0.50;
    let shard = Shard::open(&path, &cfg).unwrap();

    // Query with cos(e1) = 0.78, cos(e2) = 0.65 by construction.
    let mut q = vec![0.0f32; 32];
    q[0] = 0.78;
    q[1] = 0.65;

    let core = shard.lookup(&q, 5).unwrap();
    assert_eq!(core.label, "red-mug");
    assert!((core.confidence - 0.78).abs() < 1e-4);
    assert_eq!(core.neighbors.len(), 2);
    assert_eq!(core.neighbors[0].label, "red-mug");
    assert_eq!(core.neighbors[1].label, "maroon-cup");
    assert!(core.neighbors[0].score > core.neighbors[1].score);
}

#[test]
fn orthogonal_query_is_unknown_with_populated_neighbors() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bank.shard");

    let mut builder = ShardBuilder::new();
    builder.add("red-mug", axis_vec(32, 0)).unwrap();
    builder.add("maroon-cup", axis_vec(32, 1)).unwrap();
    builder.build_to(&path).unwrap();

    let shard = Shard::open(&path, &matcher()).unwrap();
    let q = axis_vec(32, 5);
    let core = shard.lookup(&q, 5).unwrap();

    assert_eq!(core.label, UNKNOWN_LABEL);
    assert_eq!(core.neighbors.len(), 2);
    assert!(core.confidence <= shard.calibration().tau_min().max(0.35));
}

#[test]
fn shard_smaller_than_k_returns_all_rows() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bank.shard");

    let mut builder = ShardBuilder::new();
    builder.add("only", axis_vec(8, 0)).unwrap();
    builder.build_to(&path).unwrap();

    let shard = Shard::open(&path, &matcher()).unwrap();
    let hits = shard.topk(&axis_vec(8, 0), 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert!((hits[0].score - 1.0).abs() < 1e-5);
}

#[test]
fn dim_mismatch_and_empty_build_are_fatal() {
    let mut builder = ShardBuilder::new();
    builder.add("a", axis_vec(8, 0)).unwrap();
    assert!(matches!(
        builder.add("b", axis_vec(16, 0)),
        Err(BankError::DimMismatch {
            expected: 8,
            actual: 16
        })
    ));

    let dir = TempDir::new().unwrap();
    let empty = ShardBuilder::new();
    assert!(matches!(
        empty.build_to(&dir.path().join("none.shard")),
        Err(BankError::EmptyShard)
    ));
}

#[test]
fn non_unit_vector_rejected_at_build() {
    let mut builder = ShardBuilder::new();
    let v = vec![0.5f32; 8];
    assert!(matches!(
        builder.add("bad", v),
        Err(BankError::NotNormalized { .. })
    ));
}

#[test]
fn truncated_shard_reports_corrupt() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bank.shard");

    let mut builder = ShardBuilder::new();
    builder.add("a", axis_vec(8, 0)).unwrap();
    builder.add("b", axis_vec(8, 1)).unwrap();
    builder.build_to(&path).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

    assert!(matches!(
        Shard::open(&path, &matcher()),
        Err(BankError::CorruptShard { .. })
    ));
}

#[test]
fn scores_stay_clamped_for_degenerate_queries() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bank.shard");

    let mut builder = ShardBuilder::new();
    builder.add("a", axis_vec(8, 0)).unwrap();
    builder.build_to(&path).unwrap();
    let shard = Shard::open(&path, &matcher()).unwrap();

    // Unnormalized query at runtime: scores must still clamp to [-1, 1].
    let q = vec![10.0f32, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
    let hits = shard.topk(&q, 1).unwrap();
    assert_eq!(hits[0].score, 1.0);
}
