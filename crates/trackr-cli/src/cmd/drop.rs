use super::with_engine;
use crate::output::print_json;
use anyhow::Context;
use std::path::Path;
use trackr_core::task::Task;

pub fn run(root: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    let task = Task::drop(name);
    let target = task.target().to_string();
    with_engine(root, |engine| {
        engine
            .execute_now(task)
            .with_context(|| format!("failed to drop '{target}'"))?;
        Ok(())
    })?;

    if json {
        print_json(&serde_json::json!({ "dropped": target }))?;
    } else {
        println!("Dropped object '{target}'");
    }
    Ok(())
}
