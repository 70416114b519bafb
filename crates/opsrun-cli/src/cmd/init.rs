use anyhow::Context;
use opsrun_core::config::OrchestratorConfig;
use std::path::Path;

pub fn run(config: &Path) -> anyhow::Result<()> {
    let created = OrchestratorConfig::init(config)
        .with_context(|| format!("failed to write {}", config.display()))?;
    if created {
        println!("  created: {}", config.display());
    } else {
        println!("  exists:  {}", config.display());
    }
    Ok(())
}
