//! `promote`: accepted evidence → capped int8 medoids per class.

use std::path::{Path, PathBuf};

use clap::Args;
use tracing::info;

use sightline_core::SightlineError;
use sightline_storage::{read_entries, Promoter};

use super::load_config;

#[derive(Args, Debug)]
pub struct PromoteArgs {
    /// Evidence ledger to promote from.
    #[arg(long)]
    pub ledger: Option<PathBuf>,

    /// Medoid output directory.
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Diversity penalty weight in the herding objective.
    #[arg(long, default_value_t = 0.5)]
    pub lambda: f32,
}

pub fn execute(config_path: Option<&Path>, args: PromoteArgs) -> Result<(), SightlineError> {
    let config = load_config(config_path)?;
    let ledger_path = args
        .ledger
        .unwrap_or_else(|| PathBuf::from(&config.paths.ledger));
    let out_dir = args
        .out
        .unwrap_or_else(|| PathBuf::from(&config.paths.medoid_dir));

    // A broken chain aborts before anything is written.
    let entries = read_entries(&ledger_path)?;
    if entries.is_empty() {
        return Err(SightlineError::Data(format!(
            "ledger {} has no entries to promote",
            ledger_path.display()
        )));
    }

    let promoter = Promoter::new(&out_dir).with_lambda(args.lambda);
    let outcomes = promoter.promote_all(&entries)?;

    let promoted = outcomes.iter().filter(|o| !o.skipped).count();
    let skipped = outcomes.len() - promoted;
    info!(promoted, skipped, out = %out_dir.display(), "promotion complete");
    for outcome in &outcomes {
        if outcome.skipped {
            println!(
                "skipped {}: {}",
                outcome.label,
                outcome.reason.as_deref().unwrap_or("unknown reason")
            );
        } else {
            println!(
                "promoted {} -> {} medoids (digest {})",
                outcome.label, outcome.medoids, outcome.digest
            );
        }
    }
    Ok(())
}
