use super::{parse_pairs, with_engine};
use crate::output::{print_json, print_records};
use std::path::Path;
use trackr_core::task::{Query, Selection, Task};

pub struct SelectArgs {
    pub filters: Vec<String>,
    pub fields: Vec<String>,
    pub sort: Option<String>,
    pub desc: bool,
    pub limit: usize,
    pub offset: usize,
}

pub fn run(root: &Path, name: &str, args: SelectArgs, json: bool) -> anyhow::Result<()> {
    let query = Query {
        filter: parse_pairs(&args.filters)?,
        limit: args.limit,
        offset: args.offset,
    };
    let mut selection = Selection::new(query).fields(args.fields);
    if let Some(field) = args.sort {
        selection = selection.sort_by(field, args.desc);
    } else {
        selection.descending = args.desc;
    }

    let (columns, records) = with_engine(root, |engine| {
        let columns = if selection.fields.is_empty() {
            engine
                .object_schema(name)?
                .into_iter()
                .map(|f| f.name)
                .collect()
        } else {
            selection.fields.clone()
        };
        let records = engine.submit_and_wait(Task::select(name, selection.clone()))?;
        Ok((columns, records))
    })?;

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No records.");
        return Ok(());
    }
    print_records(&columns, &records);
    Ok(())
}
