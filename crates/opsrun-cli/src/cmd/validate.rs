use crate::output::print_json;
use anyhow::Context;
use opsrun_core::action::ActionRegistry;
use opsrun_core::config::{OrchestratorConfig, WarnLevel};
use std::path::Path;

pub fn run(config_path: &Path, json: bool) -> anyhow::Result<()> {
    let config = OrchestratorConfig::load(config_path).context("failed to load config")?;
    let catalog = config
        .compile(&ActionRegistry::builtin())
        .context("invalid task definitions")?;
    let warnings = config.validate();

    if json {
        let value = serde_json::json!({
            "tasks": catalog.len(),
            "warnings": warnings,
        });
        print_json(&value)?;
    } else if warnings.is_empty() {
        println!("Config is valid: {} task(s). No warnings.", catalog.len());
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
