//! Durable storage for dynamic objects using redb.
//!
//! # Table design
//!
//! Each dynamic table `<name>` becomes a redb table `rows:<name>` keyed by the
//! row id:
//! ```text
//! rows:<name>   u64 id  → JSON-encoded Record (including `_id`)
//! __schemas     name    → JSON-encoded Vec<FieldDef>
//! __sequences   name    → last id handed out
//! ```
//!
//! The `__schemas` entry is the source of truth for whether a table exists;
//! the row table is created and deleted alongside it in the same write
//! transaction. Ids come from `__sequences` rather than the last key so that a
//! deleted tail row never has its id reused.

use std::collections::BTreeMap;
use std::path::Path;

use redb::{
    Database, ReadableTable, ReadableTableMetadata, TableDefinition, TableError, WriteTransaction,
};
use serde_json::Value;

use super::{check_unique, matching_ids, select_rows, table_not_found, update_rows, with_id, SortSpec, Storage, Window};
use crate::error::{Result, TrackrError};
use crate::schema::{FieldDef, Record};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const SCHEMAS: TableDefinition<&str, &[u8]> = TableDefinition::new("__schemas");
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("__sequences");

fn rows_table_name(table: &str) -> String {
    format!("rows:{table}")
}

// ---------------------------------------------------------------------------
// RedbStorage
// ---------------------------------------------------------------------------

pub struct RedbStorage {
    db: Database,
}

impl RedbStorage {
    /// Open or create the redb database at `path`.
    ///
    /// Creates the metadata tables if they don't already exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(TrackrError::storage)?;
        // Ensure the metadata tables exist before any reads
        let wt = db.begin_write().map_err(TrackrError::storage)?;
        wt.open_table(SCHEMAS).map_err(TrackrError::storage)?;
        wt.open_table(SEQUENCES).map_err(TrackrError::storage)?;
        wt.commit().map_err(TrackrError::storage)?;
        Ok(Self { db })
    }

    fn read_columns_in(wt: &WriteTransaction, table: &str) -> Result<Vec<FieldDef>> {
        let schemas = wt.open_table(SCHEMAS).map_err(TrackrError::storage)?;
        let raw = schemas
            .get(table)
            .map_err(TrackrError::storage)?
            .ok_or_else(|| table_not_found(table))?;
        let columns = serde_json::from_slice(raw.value())?;
        Ok(columns)
    }

    fn load_rows_in(wt: &WriteTransaction, table: &str) -> Result<BTreeMap<u64, Record>> {
        let name = rows_table_name(table);
        let def: TableDefinition<u64, &[u8]> = TableDefinition::new(&name);
        let rows = wt.open_table(def).map_err(TrackrError::storage)?;
        let mut out = BTreeMap::new();
        for entry in rows.iter().map_err(TrackrError::storage)? {
            let (k, v) = entry.map_err(TrackrError::storage)?;
            let record: Record = serde_json::from_slice(v.value())?;
            out.insert(k.value(), record);
        }
        Ok(out)
    }
}

impl Storage for RedbStorage {
    fn create_table(&self, table: &str, columns: &[FieldDef]) -> Result<()> {
        let encoded = serde_json::to_vec(columns)?;
        let name = rows_table_name(table);
        let def: TableDefinition<u64, &[u8]> = TableDefinition::new(&name);
        let wt = self.db.begin_write().map_err(TrackrError::storage)?;
        {
            let mut schemas = wt.open_table(SCHEMAS).map_err(TrackrError::storage)?;
            if schemas.get(table).map_err(TrackrError::storage)?.is_some() {
                return Err(TrackrError::DuplicateName(format!("table '{table}' exists")));
            }
            schemas
                .insert(table, encoded.as_slice())
                .map_err(TrackrError::storage)?;
            let mut sequences = wt.open_table(SEQUENCES).map_err(TrackrError::storage)?;
            sequences.insert(table, 0u64).map_err(TrackrError::storage)?;
            wt.open_table(def).map_err(TrackrError::storage)?;
        }
        wt.commit().map_err(TrackrError::storage)?;
        Ok(())
    }

    fn drop_table(&self, table: &str) -> Result<bool> {
        let name = rows_table_name(table);
        let def: TableDefinition<u64, &[u8]> = TableDefinition::new(&name);
        let wt = self.db.begin_write().map_err(TrackrError::storage)?;
        let existed = {
            let mut schemas = wt.open_table(SCHEMAS).map_err(TrackrError::storage)?;
            let removed = schemas.remove(table).map_err(TrackrError::storage)?.is_some();
            let mut sequences = wt.open_table(SEQUENCES).map_err(TrackrError::storage)?;
            sequences.remove(table).map_err(TrackrError::storage)?;
            removed
        };
        wt.delete_table(def).map_err(TrackrError::storage)?;
        wt.commit().map_err(TrackrError::storage)?;
        Ok(existed)
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        let rt = self.db.begin_read().map_err(TrackrError::storage)?;
        let schemas = rt.open_table(SCHEMAS).map_err(TrackrError::storage)?;
        let mut names = Vec::new();
        for entry in schemas.iter().map_err(TrackrError::storage)? {
            let (k, _) = entry.map_err(TrackrError::storage)?;
            names.push(k.value().to_string());
        }
        Ok(names)
    }

    fn columns(&self, table: &str) -> Result<Option<Vec<FieldDef>>> {
        let rt = self.db.begin_read().map_err(TrackrError::storage)?;
        let schemas = rt.open_table(SCHEMAS).map_err(TrackrError::storage)?;
        let columns = match schemas.get(table).map_err(TrackrError::storage)? {
            Some(raw) => Some(serde_json::from_slice(raw.value())?),
            None => None,
        };
        Ok(columns)
    }

    fn insert(&self, table: &str, row: Record) -> Result<u64> {
        let name = rows_table_name(table);
        let def: TableDefinition<u64, &[u8]> = TableDefinition::new(&name);
        let wt = self.db.begin_write().map_err(TrackrError::storage)?;
        let id = {
            let columns = Self::read_columns_in(&wt, table)?;
            if columns.iter().any(|c| c.unique) {
                let existing = Self::load_rows_in(&wt, table)?;
                check_unique(&columns, existing.iter().map(|(k, v)| (*k, v)), &row, None)?;
            }

            let mut sequences = wt.open_table(SEQUENCES).map_err(TrackrError::storage)?;
            let last = sequences
                .get(table)
                .map_err(TrackrError::storage)?
                .map(|g| g.value())
                .unwrap_or(0);
            let id = last + 1;
            sequences.insert(table, id).map_err(TrackrError::storage)?;

            let encoded = serde_json::to_vec(&with_id(row, id))?;
            let mut rows = wt.open_table(def).map_err(TrackrError::storage)?;
            rows.insert(id, encoded.as_slice())
                .map_err(TrackrError::storage)?;
            id
        };
        wt.commit().map_err(TrackrError::storage)?;
        Ok(id)
    }

    fn select(
        &self,
        table: &str,
        filter: &Record,
        sort: &SortSpec,
        window: Window,
    ) -> Result<Vec<Record>> {
        let name = rows_table_name(table);
        let def: TableDefinition<u64, &[u8]> = TableDefinition::new(&name);
        let rt = self.db.begin_read().map_err(TrackrError::storage)?;
        let rows = match rt.open_table(def) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Err(table_not_found(table)),
            Err(e) => return Err(TrackrError::storage(e)),
        };

        let mut all = Vec::new();
        for entry in rows.iter().map_err(TrackrError::storage)? {
            let (_, v) = entry.map_err(TrackrError::storage)?;
            let record: Record = serde_json::from_slice(v.value())?;
            all.push(record);
        }
        Ok(select_rows(all.iter(), filter, sort, window))
    }

    fn delete(&self, table: &str, filter: &Record, window: Window) -> Result<u64> {
        let name = rows_table_name(table);
        let def: TableDefinition<u64, &[u8]> = TableDefinition::new(&name);
        let wt = self.db.begin_write().map_err(TrackrError::storage)?;
        let removed = {
            Self::read_columns_in(&wt, table)?;
            let existing = Self::load_rows_in(&wt, table)?;
            let ids = matching_ids(&existing, filter, window);
            let mut rows = wt.open_table(def).map_err(TrackrError::storage)?;
            for id in &ids {
                rows.remove(*id).map_err(TrackrError::storage)?;
            }
            ids.len() as u64
        };
        wt.commit().map_err(TrackrError::storage)?;
        Ok(removed)
    }

    fn update(
        &self,
        table: &str,
        filter: &Record,
        window: Window,
        changes: &Record,
        now: &Value,
    ) -> Result<u64> {
        let name = rows_table_name(table);
        let def: TableDefinition<u64, &[u8]> = TableDefinition::new(&name);
        let wt = self.db.begin_write().map_err(TrackrError::storage)?;
        let updated = {
            let columns = Self::read_columns_in(&wt, table)?;
            let mut image = Self::load_rows_in(&wt, table)?;
            let ids = update_rows(&mut image, &columns, filter, window, changes, now)?;
            let mut rows = wt.open_table(def).map_err(TrackrError::storage)?;
            for id in &ids {
                if let Some(record) = image.get(id) {
                    let encoded = serde_json::to_vec(record)?;
                    rows.insert(*id, encoded.as_slice())
                        .map_err(TrackrError::storage)?;
                }
            }
            ids.len() as u64
        };
        wt.commit().map_err(TrackrError::storage)?;
        Ok(updated)
    }

    fn count(&self, table: &str) -> Result<u64> {
        let name = rows_table_name(table);
        let def: TableDefinition<u64, &[u8]> = TableDefinition::new(&name);
        let rt = self.db.begin_read().map_err(TrackrError::storage)?;
        let rows = match rt.open_table(def) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Err(table_not_found(table)),
            Err(e) => return Err(TrackrError::storage(e)),
        };
        let count = rows.len().map_err(TrackrError::storage)?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
