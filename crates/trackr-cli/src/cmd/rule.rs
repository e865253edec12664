use super::with_engine;
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use trackr_core::alert::AlertRule;
use trackr_core::registry::ALERT_RULES;
use trackr_core::task::{Selection, Task};

#[derive(Subcommand)]
pub enum RuleSubcommand {
    /// Add an alert rule
    Add {
        /// Unique rule name
        name: String,
        /// Object whose inserts are checked
        #[arg(long)]
        object: String,
        /// Field to compare
        #[arg(long)]
        column: String,
        /// Value that triggers the rule (compared as text)
        #[arg(long, default_value = "")]
        value: String,
    },
    /// List alert rules
    List,
}

pub fn run(root: &Path, subcmd: RuleSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        RuleSubcommand::Add {
            name,
            object,
            column,
            value,
        } => add(root, AlertRule::new(name, &object, column, value), json),
        RuleSubcommand::List => list(root, json),
    }
}

fn add(root: &Path, rule: AlertRule, json: bool) -> anyhow::Result<()> {
    with_engine(root, |engine| {
        let object = engine
            .object_info(&rule.object_name)
            .with_context(|| format!("rule targets unknown object '{}'", rule.object_name))?;
        if object.system {
            anyhow::bail!("rules cannot target system collection '{}'", object.name);
        }
        if !engine
            .object_schema(&object.name)?
            .iter()
            .any(|f| f.name == rule.column_name)
        {
            anyhow::bail!(
                "object '{}' has no field '{}'",
                object.name,
                rule.column_name
            );
        }
        engine
            .execute_now(Task::insert(ALERT_RULES, rule.to_record()))
            .with_context(|| format!("failed to add rule '{}'", rule.name))?;
        Ok(())
    })?;

    if json {
        print_json(&rule)?;
    } else {
        println!(
            "Added rule '{}': {}.{} == '{}'",
            rule.name,
            rule.object_name,
            rule.column_name,
            rule.column_value.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let rows = with_engine(root, |engine| {
        Ok(engine.submit_and_wait(Task::select(ALERT_RULES, Selection::default()))?)
    })?;
    let rules = rows
        .iter()
        .map(AlertRule::from_record)
        .collect::<Result<Vec<_>, _>>()?;

    if json {
        return print_json(&rules);
    }
    if rules.is_empty() {
        println!("No alert rules.");
        return Ok(());
    }
    let table = rules
        .iter()
        .map(|r| {
            vec![
                r.name.clone(),
                r.object_name.clone(),
                r.column_name.clone(),
                r.column_value.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["NAME", "OBJECT", "COLUMN", "VALUE"], table);
    Ok(())
}
