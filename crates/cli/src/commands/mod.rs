//! CLI commands for the options guard engine.

pub mod explain;
pub mod greeks;
pub mod run;
pub mod size;

pub use explain::{run_explain, ExplainArgs};
pub use greeks::{run_greeks, GreeksArgs};
pub use run::{run_service, RunArgs};
pub use size::{run_size, SizeArgs};

use anyhow::{Context, Result};
use options_guard_core::{AppConfig, ConfigLoader};

/// Loads `path`. A profile switches to the default location with
/// `config/Config.{profile}.toml` layered on top.
pub(crate) fn load_config(path: &str, profile: Option<&str>) -> Result<AppConfig> {
    match profile {
        Some(profile) => ConfigLoader::load_with_profile(profile),
        None => ConfigLoader::load_from(path),
    }
    .with_context(|| format!("loading configuration from {path}"))
}
