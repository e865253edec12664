pub mod alerts;
pub mod config;
pub mod create;
pub mod delete;
pub mod drop;
pub mod init;
pub mod insert;
pub mod objects;
pub mod pending;
pub mod recent;
pub mod rule;
pub mod schema;
pub mod select;
pub mod update;

use anyhow::{bail, Context};
use serde_json::Value;
use std::path::Path;
use trackr_core::config::Config;
use trackr_core::schema::Record;
use trackr_core::Engine;

/// Open the engine for `root`, run `f`, let follow-up tasks (alert finds,
/// row counts) settle, then shut down.
pub fn with_engine<T>(
    root: &Path,
    f: impl FnOnce(&Engine) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let config = Config::load(root).context("failed to load config")?;
    let settle = config.wait_timeout();
    let engine = Engine::open(root, config).context("failed to open engine")?;
    let result = f(&engine);
    if !engine.wait_idle(settle) {
        tracing::warn!("background tasks still running at exit");
    }
    let saved = engine.shutdown().context("failed to shut down engine")?;
    if saved > 0 {
        tracing::warn!(saved, "unfinished tasks saved for the next run");
    }
    result
}

/// Parse repeated `FIELD=VALUE` arguments. Values stay strings; the object's
/// schema coerces them.
pub fn parse_pairs(pairs: &[String]) -> anyhow::Result<Record> {
    let mut record = Record::new();
    for pair in pairs {
        let Some((field, value)) = pair.split_once('=') else {
            bail!("expected FIELD=VALUE, got '{pair}'");
        };
        let field = field.trim();
        if field.is_empty() {
            bail!("empty field name in '{pair}'");
        }
        record.insert(field.to_string(), Value::String(value.to_string()));
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pairs_keeps_everything_after_first_equals() {
        let rec = parse_pairs(&["status=ok".into(), "note=a=b".into()]).unwrap();
        assert_eq!(rec["status"], "ok");
        assert_eq!(rec["note"], "a=b");
    }

    #[test]
    fn parse_pairs_rejects_missing_equals() {
        assert!(parse_pairs(&["status".into()]).is_err());
        assert!(parse_pairs(&["=ok".into()]).is_err());
    }
}
