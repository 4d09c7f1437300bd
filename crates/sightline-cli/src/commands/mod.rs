//! CLI command handlers.
//!
//! - `run`: the end-to-end recognition loop over a fixture directory
//! - `shard`: offline LabelBank shard construction
//! - `promote`: offline KB promotion from the evidence ledger
//! - `ledger`: hash-chain verification

pub mod ledger;
pub mod promote;
pub mod run;
pub mod shard;

use std::path::Path;

use sightline_core::{Config, SightlineError};

/// Load layered configuration (defaults < toml < env); CLI overrides are
/// applied by each command afterwards.
pub fn load_config(toml_path: Option<&Path>) -> Result<Config, SightlineError> {
    Ok(Config::load(toml_path)?)
}
