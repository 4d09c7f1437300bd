//! `check-ledger`: verify the evidence ledger hash chain.

use std::path::PathBuf;

use clap::Args;

use sightline_core::SightlineError;
use sightline_storage::read_entries;

#[derive(Args, Debug)]
pub struct CheckLedgerArgs {
    /// Evidence ledger path.
    #[arg(long)]
    pub ledger: PathBuf,
}

pub fn execute(args: CheckLedgerArgs) -> Result<(), SightlineError> {
    let entries = read_entries(&args.ledger)?;
    let accepted = entries.iter().filter(|e| e.accepted).count();
    println!(
        "{}: {} entries ({} accepted), chain verified",
        args.ledger.display(),
        entries.len(),
        accepted
    );
    Ok(())
}
