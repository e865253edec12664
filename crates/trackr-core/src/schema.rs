//! Field descriptors and record binding.
//!
//! Every dynamic object shares one record representation, [`Record`], a JSON
//! object keyed by field name. A [`Schema`] binds raw producer input to that
//! representation: unknown fields are rejected, values are coerced to the
//! declared [`FieldType`], defaults and nullability are applied, and the three
//! system fields are maintained by the engine rather than the caller.

use crate::error::{Result, TrackrError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// A single row: field name → JSON value.
pub type Record = serde_json::Map<String, Value>;

pub const ID_FIELD: &str = "_id";
pub const CREATED_FIELD: &str = "_timestamp_created";
pub const MODIFIED_FIELD: &str = "_timestamp_modified";

pub const SYSTEM_FIELDS: [&str; 3] = [ID_FIELD, CREATED_FIELD, MODIFIED_FIELD];

pub fn is_system_field(name: &str) -> bool {
    SYSTEM_FIELDS.contains(&name)
}

/// Timestamps are stored as RFC 3339 strings with a fixed precision so that
/// lexical order equals chronological order.
pub fn timestamp_value(ts: DateTime<Utc>) -> Value {
    Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true))
}

// ---------------------------------------------------------------------------
// FieldType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Integer,
    Boolean,
    Float,
    Timestamp,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Float => "float",
            FieldType::Timestamp => "timestamp",
        }
    }

    /// Coerce `value` into this type's canonical JSON form. `Null` passes
    /// through; nullability is the caller's concern.
    pub fn coerce(self, value: &Value) -> std::result::Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self {
            FieldType::Text => Ok(match value {
                Value::String(s) => Value::String(s.clone()),
                Value::Number(_) | Value::Bool(_) => Value::String(value.to_string()),
                _ => return Err(format!("expected text, got {value}")),
            }),
            FieldType::Integer => match value {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Value::from(i))
                    } else {
                        match n.as_f64() {
                            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                                Ok(Value::from(f as i64))
                            }
                            _ => Err(format!("expected integer, got {n}")),
                        }
                    }
                }
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| format!("expected integer, got '{s}'")),
                _ => Err(format!("expected integer, got {value}")),
            },
            FieldType::Float => match value {
                Value::Number(n) => n
                    .as_f64()
                    .map(Value::from)
                    .ok_or_else(|| format!("expected float, got {n}")),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(Value::from)
                    .ok_or_else(|| format!("expected float, got '{s}'")),
                _ => Err(format!("expected float, got {value}")),
            },
            FieldType::Boolean => match value {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => Ok(Value::Bool(true)),
                    "false" | "0" | "no" => Ok(Value::Bool(false)),
                    _ => Err(format!("expected boolean, got '{s}'")),
                },
                Value::Number(n) => match n.as_i64() {
                    Some(0) => Ok(Value::Bool(false)),
                    Some(1) => Ok(Value::Bool(true)),
                    _ => Err(format!("expected boolean, got {n}")),
                },
                _ => Err(format!("expected boolean, got {value}")),
            },
            FieldType::Timestamp => match value {
                Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
                    .map(|dt| timestamp_value(dt.with_timezone(&Utc)))
                    .map_err(|_| format!("expected RFC 3339 timestamp, got '{s}'")),
                _ => Err(format!("expected timestamp, got {value}")),
            },
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FieldType {
    type Err = TrackrError;

    /// Accepts the canonical names plus the common SQL spellings.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "string" | "unicode" => Ok(FieldType::Text),
            "integer" | "int" => Ok(FieldType::Integer),
            "boolean" | "bool" => Ok(FieldType::Boolean),
            "float" | "double" => Ok(FieldType::Float),
            "timestamp" | "datetime" => Ok(FieldType::Timestamp),
            other => Err(TrackrError::InvalidDefinition(format!(
                "unknown field type: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// FieldDef
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_nullable() -> bool {
    true
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
            unique: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// The implicit fields every table carries, in storage order.
pub fn system_field_defs() -> Vec<FieldDef> {
    vec![
        FieldDef::new(ID_FIELD, FieldType::Integer).required().unique(),
        FieldDef::new(CREATED_FIELD, FieldType::Timestamp).required(),
        FieldDef::new(MODIFIED_FIELD, FieldType::Timestamp).required(),
    ]
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// The user-declared fields of one dynamic object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<FieldDef>,
}

impl Schema {
    /// Validate a field list for a new object.
    pub fn new(fields: Vec<FieldDef>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for field in &fields {
            let name = field.name.trim();
            if name.is_empty() {
                return Err(TrackrError::InvalidDefinition(
                    "field name must not be empty".to_string(),
                ));
            }
            if name != field.name {
                return Err(TrackrError::InvalidDefinition(format!(
                    "field name '{}' has surrounding whitespace",
                    field.name
                )));
            }
            if name.starts_with('_') {
                return Err(TrackrError::InvalidDefinition(format!(
                    "field name '{name}' is reserved: names starting with '_' belong to the system"
                )));
            }
            if !seen.insert(name.to_string()) {
                return Err(TrackrError::InvalidDefinition(format!(
                    "field '{name}' declared twice"
                )));
            }
            if let Some(default) = &field.default {
                field.field_type.coerce(default).map_err(|e| {
                    TrackrError::InvalidDefinition(format!("default for '{name}': {e}"))
                })?;
            }
        }
        Ok(Self { fields })
    }

    /// Rebuild a schema from stored columns without re-validating names.
    /// Reflected tables may carry system fields; those are dropped here.
    pub fn from_columns(columns: Vec<FieldDef>) -> Self {
        Self {
            fields: columns
                .into_iter()
                .filter(|c| !is_system_field(&c.name))
                .collect(),
        }
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// System fields followed by the declared fields.
    pub fn all_fields(&self) -> Vec<FieldDef> {
        let mut all = system_field_defs();
        all.extend(self.fields.iter().cloned());
        all
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn field_type_of(&self, name: &str) -> Option<FieldType> {
        match name {
            ID_FIELD => Some(FieldType::Integer),
            CREATED_FIELD | MODIFIED_FIELD => Some(FieldType::Timestamp),
            _ => self.field(name).map(|f| f.field_type),
        }
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field_type_of(name).is_some()
    }

    // -----------------------------------------------------------------------
    // Binding
    // -----------------------------------------------------------------------

    /// Bind a producer-supplied record for insertion. The result carries every
    /// declared field plus fresh creation/modification stamps; `_id` is
    /// assigned by storage.
    pub fn bind_insert(&self, input: &Record, now: DateTime<Utc>) -> Result<Record> {
        for key in input.keys() {
            if key == ID_FIELD {
                return Err(TrackrError::InvalidRecord(
                    "'_id' is assigned by storage".to_string(),
                ));
            }
            if !is_system_field(key) && self.field(key).is_none() {
                return Err(TrackrError::InvalidRecord(format!("unknown field '{key}'")));
            }
        }

        let mut out = Record::new();
        let stamp = timestamp_value(now);
        out.insert(CREATED_FIELD.to_string(), stamp.clone());
        out.insert(MODIFIED_FIELD.to_string(), stamp);

        for field in &self.fields {
            let raw = input
                .get(&field.name)
                .or(field.default.as_ref())
                .unwrap_or(&Value::Null);
            let value = field
                .field_type
                .coerce(raw)
                .map_err(|e| TrackrError::InvalidRecord(format!("field '{}': {e}", field.name)))?;
            if value.is_null() && !field.nullable {
                return Err(TrackrError::InvalidRecord(format!(
                    "field '{}' is required",
                    field.name
                )));
            }
            out.insert(field.name.clone(), value);
        }
        Ok(out)
    }

    /// Bind an update map. System timestamps are silently dropped (the storage
    /// layer stamps the modification time itself); `_id` is rejected.
    pub fn bind_update(&self, changes: &Record) -> Result<Record> {
        let mut out = Record::new();
        for (key, raw) in changes {
            if key == ID_FIELD {
                return Err(TrackrError::InvalidRecord(
                    "'_id' cannot be updated".to_string(),
                ));
            }
            if is_system_field(key) {
                continue;
            }
            let field = self
                .field(key)
                .ok_or_else(|| TrackrError::InvalidRecord(format!("unknown field '{key}'")))?;
            let value = field
                .field_type
                .coerce(raw)
                .map_err(|e| TrackrError::InvalidRecord(format!("field '{key}': {e}")))?;
            if value.is_null() && !field.nullable {
                return Err(TrackrError::InvalidRecord(format!(
                    "field '{key}' is required"
                )));
            }
            out.insert(key.clone(), value);
        }
        Ok(out)
    }

    /// Bind an equality filter so that `"5"` matches an integer column holding 5.
    pub fn bind_filter(&self, filter: &Record) -> Result<Record> {
        let mut out = Record::new();
        for (key, raw) in filter {
            let field_type = self
                .field_type_of(key)
                .ok_or_else(|| TrackrError::InvalidRecord(format!("unknown field '{key}'")))?;
            let value = field_type
                .coerce(raw)
                .map_err(|e| TrackrError::InvalidRecord(format!("filter '{key}': {e}")))?;
            out.insert(key.clone(), value);
        }
        Ok(out)
    }

    pub fn check_known(&self, names: &[String]) -> Result<()> {
        match names.iter().find(|n| !self.has_field(n)) {
            Some(unknown) => Err(TrackrError::InvalidRecord(format!(
                "unknown field '{unknown}'"
            ))),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order used for sorting: nulls first, then by JSON kind, then by value.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i.cmp(&j),
            _ => {
                let fx = x.as_f64().unwrap_or(0.0);
                let fy = y.as_f64().unwrap_or(0.0);
                fx.partial_cmp(&fy).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Equality used by filters; integers and floats compare numerically.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Ordering::Equal,
        _ => a == b,
    }
}

/// String form used by alert matching: strings unquoted, null empty.
pub fn display_value(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
