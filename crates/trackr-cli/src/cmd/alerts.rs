use super::with_engine;
use crate::output::{print_json, print_records};
use std::path::Path;
use trackr_core::registry::ALERT_FINDS;
use trackr_core::schema::CREATED_FIELD;
use trackr_core::task::{Query, Selection, Task};

const COLUMNS: [&str; 6] = [
    CREATED_FIELD,
    "rule_name",
    "object_name",
    "column_name",
    "found_value",
    "found_id",
];

pub fn run(root: &Path, limit: usize, json: bool) -> anyhow::Result<()> {
    let selection = Selection::new(Query::all().limit(limit)).sort_by("_id", true);
    let finds = with_engine(root, |engine| {
        Ok(engine.submit_and_wait(Task::select(ALERT_FINDS, selection))?)
    })?;

    if json {
        return print_json(&finds);
    }
    if finds.is_empty() {
        println!("No alerts.");
        return Ok(());
    }
    let columns: Vec<String> = COLUMNS.iter().map(|c| c.to_string()).collect();
    print_records(&columns, &finds);
    Ok(())
}
