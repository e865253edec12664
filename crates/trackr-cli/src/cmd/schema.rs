use super::with_engine;
use crate::output::{print_json, print_table};
use std::path::Path;
use trackr_core::schema::display_value;

pub fn run(root: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    let fields = with_engine(root, |engine| Ok(engine.object_schema(name)?))?;

    if json {
        return print_json(&fields);
    }
    let rows = fields
        .iter()
        .map(|f| {
            vec![
                f.name.clone(),
                f.field_type.to_string(),
                if f.nullable { String::new() } else { "required".into() },
                if f.unique { "unique".into() } else { String::new() },
                f.default.as_ref().map(display_value).unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["FIELD", "TYPE", "NULL", "UNIQUE", "DEFAULT"], rows);
    Ok(())
}
