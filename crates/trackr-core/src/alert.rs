use crate::error::{Result, TrackrError};
use crate::paths::normalize_name;
use crate::queue::TaskQueue;
use crate::registry::{Registry, ALERT_FINDS, ALERT_RULES};
use crate::schema::{display_value, Record};
use crate::storage::{SortSpec, Storage, Window};
use crate::task::Task;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A row of `_Alert_Rules`: fire when `column_name` of a record inserted into
/// `object_name` equals `column_value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub object_name: String,
    pub column_name: String,
    #[serde(default)]
    pub column_value: Option<String>,
}

impl AlertRule {
    pub fn new(
        name: impl Into<String>,
        object_name: &str,
        column_name: impl Into<String>,
        column_value: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            object_name: normalize_name(object_name),
            column_name: column_name.into(),
            column_value: Some(column_value.into()),
        }
    }

    pub fn from_record(row: &Record) -> Result<Self> {
        serde_json::from_value(Value::Object(row.clone()))
            .map_err(|e| TrackrError::InvalidRecord(format!("alert rule: {e}")))
    }

    pub fn to_record(&self) -> Record {
        let mut row = Record::new();
        row.insert("name".into(), Value::from(self.name.clone()));
        row.insert("object_name".into(), Value::from(self.object_name.clone()));
        row.insert("column_name".into(), Value::from(self.column_name.clone()));
        row.insert(
            "column_value".into(),
            self.column_value.clone().map_or(Value::Null, Value::from),
        );
        row
    }

    /// The stringified value that triggered the rule, if it matches.
    /// Null and missing values compare as the empty string.
    pub fn matches(&self, record: &Record) -> Option<String> {
        let found = display_value(record.get(&self.column_name).unwrap_or(&Value::Null));
        let expected = self.column_value.as_deref().unwrap_or("");
        (found == expected).then_some(found)
    }

    /// The `_Alert_Finds` row recorded when this rule matches record `found_id`.
    pub fn find_record(&self, found_value: String, found_id: u64) -> Record {
        let mut row = Record::new();
        row.insert("rule_name".into(), Value::from(self.name.clone()));
        row.insert("object_name".into(), Value::from(self.object_name.clone()));
        row.insert("column_name".into(), Value::from(self.column_name.clone()));
        row.insert("found_value".into(), Value::from(found_value));
        row.insert("found_id".into(), Value::from(found_id));
        row
    }
}

/// Matches freshly inserted records against the configured rules and queues
/// an `_Alert_Finds` insert for every hit.
pub struct AlertEngine {
    storage: Arc<dyn Storage>,
    registry: Arc<Registry>,
    queue: Arc<TaskQueue>,
}

impl AlertEngine {
    pub fn new(storage: Arc<dyn Storage>, registry: Arc<Registry>, queue: Arc<TaskQueue>) -> Self {
        Self {
            storage,
            registry,
            queue,
        }
    }

    /// Rules targeting `object_name`, read under the rules collection's lock.
    pub fn rules_for(&self, object_name: &str) -> Result<Vec<AlertRule>> {
        let rules = self.registry.lookup(ALERT_RULES)?;
        let mut filter = Record::new();
        filter.insert("object_name".into(), Value::from(object_name));
        let rows = {
            let _guard = rules.lock();
            self.storage
                .select(rules.table(), &filter, &SortSpec::default(), Window::default())?
        };
        rows.iter().map(AlertRule::from_record).collect()
    }

    /// Evaluate one inserted record. Never fails the insert: errors are
    /// logged and reported as zero finds.
    pub fn evaluate(&self, object_name: &str, record: &Record, id: u64) -> usize {
        let rules = match self.rules_for(object_name) {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!(object = %object_name, error = %e, "alert rules unavailable");
                return 0;
            }
        };
        let mut queued = 0;
        for rule in &rules {
            if let Some(found) = rule.matches(record) {
                tracing::info!(rule = %rule.name, object = %object_name, id, "alert rule matched");
                self.queue
                    .push(Task::insert(ALERT_FINDS, rule.find_record(found, id)));
                queued += 1;
            }
        }
        queued
    }
}
