use crate::output::{print_json, print_table};
use anyhow::Context;
use std::path::Path;
use trackr_core::{paths, Engine};

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let tasks = Engine::pending(&paths::trackr_dir(root)).context("failed to read recovery file")?;

    if json {
        return print_json(&tasks);
    }
    if tasks.is_empty() {
        println!("No pending tasks.");
        return Ok(());
    }
    let rows = tasks
        .iter()
        .map(|t| vec![t.id().to_string(), t.kind().to_string(), t.target().to_string()])
        .collect();
    print_table(&["ID", "KIND", "TARGET"], rows);
    Ok(())
}
