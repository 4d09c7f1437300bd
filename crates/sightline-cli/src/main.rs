//! sightline CLI.
//!
//! ```bash
//! # Build a LabelBank shard from an exemplar store
//! sightline build-shard --kb data/kb.json --out data/labelbank.shard
//!
//! # Run the recognition loop over a fixture directory
//! sightline run --fixture bench/fixtures/smoke --out artifacts \
//!     --budget-ms 33 --gate
//!
//! # Promote accepted ledger evidence into int8 medoids
//! sightline promote --ledger artifacts/evidence_ledger.jsonl \
//!     --out artifacts/medoids
//!
//! # Verify the evidence ledger hash chain
//! sightline check-ledger --ledger artifacts/evidence_ledger.jsonl
//! ```
//!
//! Exit codes: `0` success, `2` user/data error (bad input, config, gate
//! violations, ledger corruption), `3` missing optional backend.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use sightline_core::SightlineError;

#[derive(Parser, Debug)]
#[command(name = "sightline")]
#[command(about = "Latency-bounded open-set recognition engine")]
#[command(version)]
struct Cli {
    /// Log filter, e.g. "info" or "sightline_pipeline=debug".
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Path to sightline.toml (defaults to ./sightline.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the recognition loop over a frame fixture.
    Run(commands::run::RunArgs),
    /// Build an immutable LabelBank shard from a kb.json exemplar store.
    BuildShard(commands::shard::BuildShardArgs),
    /// Promote accepted ledger evidence into capped int8 medoids.
    Promote(commands::promote::PromoteArgs),
    /// Verify the evidence ledger hash chain.
    CheckLedger(commands::ledger::CheckLedgerArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let outcome: Result<(), SightlineError> = match cli.command {
        Command::Run(args) => commands::run::execute(cli.config.as_deref(), args),
        Command::BuildShard(args) => commands::shard::execute(cli.config.as_deref(), args),
        Command::Promote(args) => commands::promote::execute(cli.config.as_deref(), args),
        Command::CheckLedger(args) => commands::ledger::execute(args),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
