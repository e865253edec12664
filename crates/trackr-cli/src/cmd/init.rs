use crate::output::print_json;
use anyhow::Context;
use std::path::Path;
use trackr_core::config::Config;
use trackr_core::{io, paths, Engine};

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let dir = paths::trackr_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let config_path = paths::config_path(root);
    let created_config = !config_path.exists();
    if created_config {
        Config::default()
            .save(root)
            .context("failed to write config.yaml")?;
    }
    let config = Config::load(root).context("failed to load config")?;

    // Opening creates the database and the system collections.
    let engine = Engine::open(root, config).context("failed to open engine")?;
    let objects = engine.list_objects();
    engine.shutdown().context("failed to shut down engine")?;

    if json {
        print_json(&serde_json::json!({
            "root": root.display().to_string(),
            "config_created": created_config,
            "objects": objects,
        }))?;
    } else {
        println!("Initialized trackr in: {}", root.display());
        let status = if created_config { "created" } else { "exists: " };
        println!("  {status} {}", paths::CONFIG_FILE);
        println!("  {} system collections ready", objects.len());
    }
    Ok(())
}
