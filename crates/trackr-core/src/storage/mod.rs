//! Storage capability consumed by the executor.
//!
//! The engine never talks to a database directly; it calls into a [`Storage`]
//! implementation that knows how to create and drop typed tables and how to
//! filter, order and window rows. Two backends ship with the crate:
//! [`RedbStorage`] (durable) and [`MemoryStorage`] (volatile). Both share the
//! row-level helpers below so that filtering, ordering and unique checks
//! behave identically.

pub mod memory;
pub mod redb_store;

pub use memory::MemoryStorage;
pub use redb_store::RedbStorage;

use crate::error::{Result, TrackrError};
use crate::schema::{compare_values, values_equal, FieldDef, Record, ID_FIELD, MODIFIED_FIELD};
use serde_json::Value;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

/// Limit/offset window. A limit of 0 means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    pub limit: usize,
    pub offset: usize,
}

impl Window {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }

    pub fn apply<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        if self.limit == 0 {
            iter.collect()
        } else {
            iter.take(self.limit).collect()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub descending: bool,
}

impl Default for SortSpec {
    fn default() -> Self {
        Self {
            field: ID_FIELD.to_string(),
            descending: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage trait
// ---------------------------------------------------------------------------

/// Table-level operations. Tables are addressed by name; rows are keyed by a
/// monotonically increasing `u64` id that is never reused within a table's
/// lifetime. A missing table is a [`TrackrError::Storage`] failure.
pub trait Storage: Send + Sync {
    /// Create an empty table. Fails with `DuplicateName` if it already exists.
    fn create_table(&self, table: &str, columns: &[FieldDef]) -> Result<()>;

    /// Drop a table and its rows. Returns false if it did not exist.
    fn drop_table(&self, table: &str) -> Result<bool>;

    fn list_tables(&self) -> Result<Vec<String>>;

    /// Declared columns of an existing table.
    fn columns(&self, table: &str) -> Result<Option<Vec<FieldDef>>>;

    /// Persist one bound row and return its id.
    fn insert(&self, table: &str, row: Record) -> Result<u64>;

    fn select(
        &self,
        table: &str,
        filter: &Record,
        sort: &SortSpec,
        window: Window,
    ) -> Result<Vec<Record>>;

    /// Delete matching rows (natural order, windowed). Returns the count removed.
    fn delete(&self, table: &str, filter: &Record, window: Window) -> Result<u64>;

    /// Apply `changes` to matching rows and stamp `now` as the modification
    /// time. Returns the count updated.
    fn update(
        &self,
        table: &str,
        filter: &Record,
        window: Window,
        changes: &Record,
        now: &Value,
    ) -> Result<u64>;

    fn count(&self, table: &str) -> Result<u64>;
}

pub(crate) fn table_not_found(table: &str) -> TrackrError {
    TrackrError::Storage(format!("table not found: {table}"))
}

// ---------------------------------------------------------------------------
// Row helpers shared by the backends
// ---------------------------------------------------------------------------

pub(crate) fn matches(row: &Record, filter: &Record) -> bool {
    filter.iter().all(|(key, expected)| {
        let actual = row.get(key).unwrap_or(&Value::Null);
        values_equal(actual, expected)
    })
}

/// Ids of rows matching `filter`, in natural order, windowed.
pub(crate) fn matching_ids(rows: &BTreeMap<u64, Record>, filter: &Record, window: Window) -> Vec<u64> {
    window.apply(
        rows.iter()
            .filter(|(_, row)| matches(row, filter))
            .map(|(id, _)| *id),
    )
}

/// Filter, order and window rows already in natural order. The sort is
/// stable so ties keep natural order in both directions.
pub(crate) fn select_rows<'a>(
    rows: impl Iterator<Item = &'a Record>,
    filter: &Record,
    sort: &SortSpec,
    window: Window,
) -> Vec<Record> {
    let mut selected: Vec<Record> = rows.filter(|r| matches(r, filter)).cloned().collect();
    if sort.field != ID_FIELD || sort.descending {
        selected.sort_by(|a, b| {
            let va = a.get(&sort.field).unwrap_or(&Value::Null);
            let vb = b.get(&sort.field).unwrap_or(&Value::Null);
            let ord = compare_values(va, vb);
            if sort.descending {
                ord.reverse()
            } else {
                ord
            }
        });
    }
    window.apply(selected)
}

/// Reject `candidate` if it collides with another row on a unique column.
/// Nulls never collide.
pub(crate) fn check_unique<'a>(
    columns: &[FieldDef],
    rows: impl Iterator<Item = (u64, &'a Record)>,
    candidate: &Record,
    skip_id: Option<u64>,
) -> Result<()> {
    let unique: Vec<&FieldDef> = columns.iter().filter(|c| c.unique).collect();
    if unique.is_empty() {
        return Ok(());
    }
    for (id, row) in rows {
        if Some(id) == skip_id {
            continue;
        }
        for col in &unique {
            let new = candidate.get(&col.name).unwrap_or(&Value::Null);
            if new.is_null() {
                continue;
            }
            if let Some(old) = row.get(&col.name) {
                if values_equal(old, new) {
                    return Err(TrackrError::InvalidRecord(format!(
                        "unique field '{}' already holds {new}",
                        col.name
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Apply an update to every matching row of an in-memory table image.
/// Returns the ids that changed; on a unique violation nothing is applied.
pub(crate) fn update_rows(
    rows: &mut BTreeMap<u64, Record>,
    columns: &[FieldDef],
    filter: &Record,
    window: Window,
    changes: &Record,
    now: &Value,
) -> Result<Vec<u64>> {
    let ids = matching_ids(rows, filter, window);
    let mut staged = rows.clone();
    for id in &ids {
        let mut row = staged.get(id).cloned().unwrap_or_default();
        for (key, value) in changes {
            row.insert(key.clone(), value.clone());
        }
        row.insert(MODIFIED_FIELD.to_string(), now.clone());
        check_unique(columns, staged.iter().map(|(k, v)| (*k, v)), &row, Some(*id))?;
        staged.insert(*id, row);
    }
    *rows = staged;
    Ok(ids)
}

pub(crate) fn with_id(mut row: Record, id: u64) -> Record {
    row.insert(ID_FIELD.to_string(), Value::from(id));
    row
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
