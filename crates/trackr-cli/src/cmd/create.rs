use super::with_engine;
use crate::output::print_json;
use anyhow::{bail, Context};
use serde_json::Value;
use std::path::Path;
use trackr_core::paths::{normalize_name, slugify};
use trackr_core::schema::{FieldDef, FieldType};
use trackr_core::task::Task;

pub fn run(
    root: &Path,
    name: &str,
    alias: Option<&str>,
    specs: &[String],
    json: bool,
) -> anyhow::Result<()> {
    if specs.is_empty() {
        bail!("at least one --field is required");
    }
    let fields = specs
        .iter()
        .map(String::as_str)
        .map(parse_field)
        .collect::<anyhow::Result<Vec<_>>>()?;
    let alias = alias.map(str::to_string).unwrap_or_else(|| slugify(name));
    let name = normalize_name(name);

    with_engine(root, |engine| {
        engine
            .execute_now(Task::create(&name, fields.clone(), Some(&alias)))
            .with_context(|| format!("failed to create '{name}'"))?;
        Ok(())
    })?;

    if json {
        print_json(&serde_json::json!({
            "name": name,
            "alias": alias,
            "fields": fields,
        }))?;
    } else {
        println!("Created object '{name}' (alias: {alias})");
    }
    Ok(())
}

/// `NAME:TYPE[:required][:unique][:default=VALUE]`
pub fn parse_field(spec: &str) -> anyhow::Result<FieldDef> {
    let mut parts = spec.split(':');
    let name = parts.next().unwrap_or_default().trim();
    let Some(ty) = parts.next() else {
        bail!("field '{spec}' needs a type, e.g. {name}:text");
    };
    let field_type: FieldType = ty.parse()?;
    let mut field = FieldDef::new(name, field_type);
    for flag in parts {
        match flag.split_once('=') {
            Some(("default", value)) => field = field.with_default(Value::String(value.to_string())),
            None if flag == "required" => field = field.required(),
            None if flag == "unique" => field = field.unique(),
            _ => bail!("unknown field flag '{flag}' in '{spec}'"),
        }
    }
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_field_with_flags() {
        let f = parse_field("attempts:int:required:default=0").unwrap();
        assert_eq!(f.name, "attempts");
        assert_eq!(f.field_type, FieldType::Integer);
        assert!(!f.nullable);
        assert!(!f.unique);
        assert_eq!(f.default, Some(Value::String("0".into())));
    }

    #[test]
    fn parse_field_rejects_missing_type_and_bad_flag() {
        assert!(parse_field("status").is_err());
        assert!(parse_field("status:text:loud").is_err());
        assert!(parse_field("status:blob").is_err());
    }
}
