use std::path::Path;

use anyhow::Result;
use echosim::{scenario::ScenarioConfig, Config};

pub(super) fn create_config(output: &Path) -> Result<()> {
    ScenarioConfig::default().save(output)?;
    println!("Wrote default scenario to {}", output.display());
    Ok(())
}
