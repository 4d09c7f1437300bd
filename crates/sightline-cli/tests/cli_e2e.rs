//! End-to-end CLI runs against the compiled binary.

use std::path::Path;
use std::process::Command;

use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

fn sightline() -> Command {
    Command::new(env!("CARGO_BIN_EXE_sightline"))
}

fn unit_vec(rng: &mut ChaCha8Rng, dim: usize) -> Vec<f32> {
    let mut v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    for x in &mut v {
        *x /= norm;
    }
    v
}

fn write_kb(path: &Path, rng: &mut ChaCha8Rng) {
    let mut items = Vec::new();
    for label in ["mug", "cup", "bowl"] {
        for _ in 0..4 {
            items.push(serde_json::json!({
                "label": label,
                "embedding": unit_vec(rng, 32),
            }));
        }
    }
    std::fs::write(path, serde_json::to_string(&items).unwrap()).unwrap();
}

fn write_fixture(dir: &Path, kb_path: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    let kb: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(kb_path).unwrap()).unwrap();

    let mut lines = Vec::new();
    // Replay a few exemplars as frames (known hits) plus one orthogonal-ish
    // unknown; exact embeddings make the run deterministic.
    for item in kb.iter().take(6) {
        lines.push(serde_json::json!({ "embedding": item["embedding"] }).to_string());
    }
    let mut unknown = vec![0.0f32; 32];
    unknown[31] = 1.0;
    lines.push(serde_json::json!({ "embedding": unknown }).to_string());
    std::fs::write(dir.join("frames.jsonl"), lines.join("\n") + "\n").unwrap();
}

#[test]
fn build_run_promote_pipeline() {
    let dir = TempDir::new().unwrap();
    let kb = dir.path().join("kb.json");
    let shard = dir.path().join("bank.shard");
    let fixture = dir.path().join("fixture");
    let out = dir.path().join("artifacts");
    let mut rng = ChaCha8Rng::seed_from_u64(77);

    write_kb(&kb, &mut rng);
    write_fixture(&fixture, &kb);

    let status = sightline()
        .args(["build-shard", "--kb"])
        .arg(&kb)
        .arg("--out")
        .arg(&shard)
        .status()
        .expect("spawn build-shard");
    assert!(status.success());

    let status = sightline()
        .args(["run", "--fixture"])
        .arg(&fixture)
        .arg("--out")
        .arg(&out)
        .arg("--shard")
        .arg(&shard)
        .args(["--band", "0,1"])
        .current_dir(dir.path())
        .status()
        .expect("spawn run");
    assert!(status.success(), "run exited {:?}", status.code());

    let metrics: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("metrics.json")).unwrap()).unwrap();
    assert_eq!(metrics["metrics_schema_version"], "0.1");
    assert_eq!(metrics["kb_size"], 12);
    assert!(metrics["controller"]["frames_total"].as_u64().unwrap() == 7);
    let backend = metrics["backend_selected"].as_str().unwrap();
    assert!(backend == "faiss" || backend == "numpy");
    assert_eq!(metrics["purity"]["sockets_blocked"], 0);
    assert_eq!(metrics["purity"]["dns_blocked"], 0);
    assert!(metrics["index_bootstrap_ms"].as_f64().unwrap() >= 0.0);
    assert_eq!(
        metrics["provenance"]["hardware_id"],
        format!("{}|{}", std::env::consts::OS, std::env::consts::ARCH)
    );
    assert_eq!(
        metrics["provenance"]["fixture_hash"].as_str().unwrap().len(),
        64
    );
    assert!(!metrics["provenance"]["git_commit"]
        .as_str()
        .unwrap()
        .is_empty());

    let csv = std::fs::read_to_string(out.join("stage_timings.csv")).unwrap();
    assert!(csv.starts_with("stage,total_ms,mean_ms,count\n"));

    let results = std::fs::read_to_string(out.join("results.jsonl")).unwrap();
    assert_eq!(results.lines().count(), 7);

    let hash1 = std::fs::read_to_string(out.join("metrics_hash.txt")).unwrap();

    // Second identical run: the metrics hash must be bit-stable.
    let out2 = dir.path().join("artifacts2");
    let status = sightline()
        .args(["run", "--fixture"])
        .arg(&fixture)
        .arg("--out")
        .arg(&out2)
        .arg("--shard")
        .arg(&shard)
        .args(["--band", "0,1"])
        .current_dir(dir.path())
        .status()
        .expect("spawn second run");
    assert!(status.success());
    let hash2 = std::fs::read_to_string(out2.join("metrics_hash.txt")).unwrap();
    assert_eq!(hash1, hash2);
}

#[test]
fn band_violation_exits_two() {
    let dir = TempDir::new().unwrap();
    let kb = dir.path().join("kb.json");
    let shard = dir.path().join("bank.shard");
    let fixture = dir.path().join("fixture");
    let mut rng = ChaCha8Rng::seed_from_u64(78);

    write_kb(&kb, &mut rng);
    write_fixture(&fixture, &kb);

    assert!(sightline()
        .args(["build-shard", "--kb"])
        .arg(&kb)
        .arg("--out")
        .arg(&shard)
        .status()
        .unwrap()
        .success());

    // A band no mixed run can satisfy.
    let status = sightline()
        .args(["run", "--fixture"])
        .arg(&fixture)
        .arg("--out")
        .arg(dir.path().join("artifacts"))
        .arg("--shard")
        .arg(&shard)
        .args(["--band", "0.99,1.0"])
        .current_dir(dir.path())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2));
}

#[test]
fn missing_fixture_is_a_data_error() {
    let dir = TempDir::new().unwrap();
    let status = sightline()
        .args(["run", "--fixture"])
        .arg(dir.path().join("nope"))
        .arg("--shard")
        .arg(dir.path().join("missing.shard"))
        .current_dir(dir.path())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2));
}

#[test]
fn check_ledger_reports_corruption() {
    let dir = TempDir::new().unwrap();
    let ledger = dir.path().join("ledger.jsonl");
    std::fs::write(&ledger, "{\"not\": \"a ledger entry\"}\n").unwrap();

    let status = sightline()
        .args(["check-ledger", "--ledger"])
        .arg(&ledger)
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2));
}
