use super::{parse_pairs, with_engine};
use crate::output::print_json;
use anyhow::Context;
use std::path::Path;
use trackr_core::task::{Query, Task};

pub fn run(
    root: &Path,
    name: &str,
    changes: &[String],
    filters: &[String],
    limit: usize,
    offset: usize,
    json: bool,
) -> anyhow::Result<()> {
    let query = Query {
        filter: parse_pairs(filters)?,
        limit,
        offset,
    };
    let changes = parse_pairs(changes)?;
    let task = Task::update(name, query, changes.clone());
    let target = task.target().to_string();

    with_engine(root, |engine| {
        engine
            .execute_now(task)
            .with_context(|| format!("failed to update '{target}'"))?;
        Ok(())
    })?;

    if json {
        print_json(&serde_json::json!({ "object": target, "changes": changes }))?;
    } else {
        println!("Updated '{target}'");
    }
    Ok(())
}
