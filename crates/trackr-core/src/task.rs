use crate::paths::normalize_name;
use crate::schema::{FieldDef, Record};
use crate::storage::{SortSpec, Window};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Create,
    Drop,
    Insert,
    Delete,
    Update,
    Select,
    UpdateCount,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Create => "create",
            TaskKind::Drop => "drop",
            TaskKind::Insert => "insert",
            TaskKind::Delete => "delete",
            TaskKind::Update => "update",
            TaskKind::Select => "select",
            TaskKind::UpdateCount => "update_count",
        }
    }

    /// Kinds whose effect changes stored rows or schemas.
    pub fn is_mutation(self) -> bool {
        !matches!(self, TaskKind::Select)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Equality filter plus a limit/offset window. `limit == 0` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default, skip_serializing_if = "Record::is_empty")]
    pub filter: Record,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(field.into(), value.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn window(&self) -> Window {
        Window::new(self.limit, self.offset)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    #[serde(default)]
    pub query: Query,
    /// Projection; empty selects every field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub descending: bool,
}

impl Selection {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            ..Self::default()
        }
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.sort_by = Some(field.into());
        self.descending = descending;
        self
    }

    pub fn sort_spec(&self) -> SortSpec {
        let mut spec = SortSpec::default();
        if let Some(field) = &self.sort_by {
            spec.field = field.clone();
        }
        spec.descending = self.descending;
        spec
    }
}

/// Insert payload: a single record or a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InsertData {
    One(Record),
    Many(Vec<Record>),
}

impl InsertData {
    pub fn records(&self) -> &[Record] {
        match self {
            InsertData::One(r) => std::slice::from_ref(r),
            InsertData::Many(rs) => rs,
        }
    }
}

/// What a task does, with its kind-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "parameters", rename_all = "snake_case")]
pub enum Action {
    Create {
        fields: Vec<FieldDef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
    Drop,
    Insert {
        records: InsertData,
    },
    Delete {
        #[serde(default)]
        query: Query,
    },
    Update {
        #[serde(default)]
        query: Query,
        changes: Record,
    },
    Select(Selection),
    UpdateCount,
}

impl Action {
    pub fn kind(&self) -> TaskKind {
        match self {
            Action::Create { .. } => TaskKind::Create,
            Action::Drop => TaskKind::Drop,
            Action::Insert { .. } => TaskKind::Insert,
            Action::Delete { .. } => TaskKind::Delete,
            Action::Update { .. } => TaskKind::Update,
            Action::Select(_) => TaskKind::Select,
            Action::UpdateCount => TaskKind::UpdateCount,
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One requested operation against one dynamic object. Immutable once built;
/// the id survives serialization so a task can be recognized after recovery
/// or reassignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: Uuid,
    target: String,
    action: Action,
}

impl Task {
    pub fn new(target: &str, action: Action) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: normalize_name(target),
            action,
        }
    }

    pub fn create(target: &str, fields: Vec<FieldDef>, alias: Option<&str>) -> Self {
        Self::new(
            target,
            Action::Create {
                fields,
                alias: alias.map(str::to_string),
            },
        )
    }

    pub fn drop(target: &str) -> Self {
        Self::new(target, Action::Drop)
    }

    pub fn insert(target: &str, record: Record) -> Self {
        Self::new(
            target,
            Action::Insert {
                records: InsertData::One(record),
            },
        )
    }

    pub fn insert_many(target: &str, records: Vec<Record>) -> Self {
        Self::new(
            target,
            Action::Insert {
                records: InsertData::Many(records),
            },
        )
    }

    pub fn delete(target: &str, query: Query) -> Self {
        Self::new(target, Action::Delete { query })
    }

    pub fn update(target: &str, query: Query, changes: Record) -> Self {
        Self::new(target, Action::Update { query, changes })
    }

    pub fn select(target: &str, selection: Selection) -> Self {
        Self::new(target, Action::Select(selection))
    }

    pub fn update_count(target: &str) -> Self {
        Self::new(target, Action::UpdateCount)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn kind(&self) -> TaskKind {
        self.action.kind()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}' [{}]", self.kind(), self.target, self.id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use serde_json::json;

    fn record(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn target_is_normalized() {
        let task = Task::drop("failed logins");
        assert_eq!(task.target(), "Failed Logins");
        assert_eq!(task.kind(), TaskKind::Drop);
    }

    #[test]
    fn each_task_gets_its_own_id() {
        assert_ne!(Task::drop("a").id(), Task::drop("a").id());
    }

    #[test]
    fn serialized_task_keeps_id_and_parameters() {
        let task = Task::create(
            "logins",
            vec![FieldDef::new("status", FieldType::Text)],
            Some("logins"),
        );
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["action"]["kind"], "create");
        assert_eq!(json["action"]["parameters"]["alias"], "logins");

        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn unit_actions_serialize_without_parameters() {
        let json = serde_json::to_value(Task::update_count("logins")).unwrap();
        assert_eq!(json["action"], json!({"kind": "update_count"}));
    }

    #[test]
    fn insert_accepts_single_object_or_list() {
        let one: InsertData = serde_json::from_value(json!({"status": "ok"})).unwrap();
        assert_eq!(one.records().len(), 1);
        let many: InsertData =
            serde_json::from_value(json!([{"status": "ok"}, {"status": "failed"}])).unwrap();
        assert_eq!(many.records().len(), 2);
    }

    #[test]
    fn selection_builds_sort_spec() {
        let sel = Selection::new(Query::all().where_eq("status", "ok").limit(5))
            .fields(["_id", "status"])
            .sort_by("_timestamp_created", true);
        let spec = sel.sort_spec();
        assert_eq!(spec.field, "_timestamp_created");
        assert!(spec.descending);
        assert_eq!(sel.query.window(), Window::new(5, 0));
        assert_eq!(sel.query.filter, record(json!({"status": "ok"})));
    }

    #[test]
    fn default_sort_is_ascending_id() {
        let spec = Selection::default().sort_spec();
        assert_eq!(spec.field, "_id");
        assert!(!spec.descending);
    }
}
