use super::{parse_pairs, with_engine};
use crate::output::print_json;
use anyhow::Context;
use std::path::Path;
use trackr_core::task::{Query, Task};

pub fn run(
    root: &Path,
    name: &str,
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
    let task = Task::delete(name, query);
    let target = task.target().to_string();

    let (before, after) = with_engine(root, |engine| {
        // Reflected objects count their rows in the background after open.
        engine.wait_idle(engine.config().wait_timeout());
        let before = engine.object_info(&target)?.row_count;
        engine
            .execute_now(task)
            .with_context(|| format!("failed to delete from '{target}'"))?;
        let after = engine.object_info(&target)?.row_count;
        Ok((before, after))
    })?;
    let removed = before.zip(after).map(|(b, a)| b.saturating_sub(a));

    if json {
        print_json(&serde_json::json!({ "object": target, "deleted": removed }))?;
    } else {
        match removed {
            Some(n) => println!("Deleted {n} record(s) from '{target}'"),
            None => println!("Deleted matching records from '{target}'"),
        }
    }
    Ok(())
}
