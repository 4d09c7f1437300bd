//! `build-shard`: kb.json exemplar store → immutable LabelBank shard.

use std::path::{Path, PathBuf};

use clap::Args;
use serde::Deserialize;
use tracing::info;

use sightline_core::bank::ShardBuilder;
use sightline_core::similarity::normalize;
use sightline_core::SightlineError;

use super::load_config;

#[derive(Args, Debug)]
pub struct BuildShardArgs {
    /// Exemplar store: JSON array of {label, embedding}.
    #[arg(long)]
    pub kb: Option<PathBuf>,

    /// Output shard path.
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Other-class mass allowed above the accept threshold.
    #[arg(long, default_value_t = 0.01)]
    pub epsilon: f64,
}

#[derive(Debug, Deserialize)]
struct KbItem {
    label: String,
    embedding: Vec<f32>,
}

pub fn execute(config_path: Option<&Path>, args: BuildShardArgs) -> Result<(), SightlineError> {
    let config = load_config(config_path)?;
    let kb_path = args
        .kb
        .unwrap_or_else(|| PathBuf::from(&config.paths.kb_json));
    let out_path = args
        .out
        .unwrap_or_else(|| PathBuf::from(&config.paths.shard));

    let raw = std::fs::read_to_string(&kb_path)
        .map_err(|e| SightlineError::Data(format!("kb store {}: {e}", kb_path.display())))?;
    let items: Vec<KbItem> = serde_json::from_str(&raw)
        .map_err(|e| SightlineError::Data(format!("kb store {}: {e}", kb_path.display())))?;
    if items.is_empty() {
        return Err(SightlineError::Data(format!(
            "kb store {} has no exemplars",
            kb_path.display()
        )));
    }

    let mut builder = ShardBuilder::new()
        .with_epsilon(args.epsilon)
        .with_fallback_tau(config.matcher.threshold);
    for item in items {
        let mut v = item.embedding;
        normalize(&mut v);
        builder.add(item.label, v)?;
    }
    let meta = builder.build_to(&out_path)?;

    info!(
        out = %out_path.display(),
        count = meta.count,
        labels = meta.label_count,
        dim = meta.dim,
        struct_hash = %meta.struct_hash_hex,
        "shard build complete"
    );
    println!(
        "built shard {} ({} exemplars, {} labels, dim {})",
        out_path.display(),
        meta.count,
        meta.label_count,
        meta.dim
    );
    Ok(())
}
