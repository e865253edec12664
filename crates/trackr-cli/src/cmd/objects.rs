use super::with_engine;
use crate::output::{print_json, print_table};
use std::path::Path;

pub fn run(root: &Path, include_system: bool, json: bool) -> anyhow::Result<()> {
    let objects: Vec<_> = with_engine(root, |engine| {
        engine.wait_idle(engine.config().wait_timeout());
        Ok(engine.objects_info())
    })?
        .into_iter()
        .filter(|o| include_system || !o.system)
        .collect();

    if json {
        return print_json(&objects);
    }
    if objects.is_empty() {
        println!("No objects. Create one with: trackr create <name> --field <name:type>");
        return Ok(());
    }
    let rows = objects
        .iter()
        .map(|o| {
            vec![
                o.name.clone(),
                o.alias.clone(),
                o.row_count.map_or_else(|| "?".to_string(), |n| n.to_string()),
                if o.system { "yes".into() } else { String::new() },
            ]
        })
        .collect();
    print_table(&["NAME", "ALIAS", "ROWS", "SYSTEM"], rows);
    Ok(())
}
