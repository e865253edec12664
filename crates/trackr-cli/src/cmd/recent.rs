use super::with_engine;
use crate::output::{print_json, print_table};
use chrono::{DateTime, Utc};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let entries = with_engine(root, |engine| Ok(engine.recent_activity()))?;

    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No recent activity.");
        return Ok(());
    }
    let now = Utc::now();
    let rows = entries
        .into_iter()
        .map(|e| vec![age(&e.timestamp, now), e.object_name, e.timestamp])
        .collect();
    print_table(&["AGE", "OBJECT", "CREATED"], rows);
    Ok(())
}

fn age(timestamp: &str, now: DateTime<Utc>) -> String {
    let Ok(ts) = DateTime::parse_from_rfc3339(timestamp) else {
        return "?".to_string();
    };
    let secs = (now - ts.with_timezone(&Utc)).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86_399 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86_400),
    }
}
