use super::with_engine;
use crate::output::print_json;
use anyhow::Context;
use std::path::Path;
use trackr_core::task::{InsertData, Task};

pub fn run(root: &Path, name: &str, data: &str, json: bool) -> anyhow::Result<()> {
    let data: InsertData =
        serde_json::from_str(data).context("records must be a JSON object or array of objects")?;
    let count = data.records().len();
    let task = Task::insert_many(name, data.records().to_vec());
    let target = task.target().to_string();

    with_engine(root, |engine| {
        engine
            .execute_now(task)
            .with_context(|| format!("failed to insert into '{target}'"))?;
        Ok(())
    })?;

    if json {
        print_json(&serde_json::json!({ "object": target, "inserted": count }))?;
    } else {
        println!("Inserted {count} record(s) into '{target}'");
    }
    Ok(())
}
