use super::{check_unique, matching_ids, select_rows, table_not_found, update_rows, with_id, SortSpec, Storage, Window};
use crate::error::{Result, TrackrError};
use crate::schema::{FieldDef, Record};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct MemTable {
    columns: Vec<FieldDef>,
    rows: BTreeMap<u64, Record>,
    next_id: u64,
}

/// Volatile storage: tables live in a process-local map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: RwLock<HashMap<String, MemTable>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn create_table(&self, table: &str, columns: &[FieldDef]) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.contains_key(table) {
            return Err(TrackrError::DuplicateName(format!("table '{table}' exists")));
        }
        tables.insert(
            table.to_string(),
            MemTable {
                columns: columns.to_vec(),
                rows: BTreeMap::new(),
                next_id: 1,
            },
        );
        Ok(())
    }

    fn drop_table(&self, table: &str) -> Result<bool> {
        Ok(self.tables.write().remove(table).is_some())
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn columns(&self, table: &str) -> Result<Option<Vec<FieldDef>>> {
        Ok(self.tables.read().get(table).map(|t| t.columns.clone()))
    }

    fn insert(&self, table: &str, row: Record) -> Result<u64> {
        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| table_not_found(table))?;
        check_unique(&t.columns, t.rows.iter().map(|(k, v)| (*k, v)), &row, None)?;
        let id = t.next_id;
        t.next_id += 1;
        t.rows.insert(id, with_id(row, id));
        Ok(id)
    }

    fn select(
        &self,
        table: &str,
        filter: &Record,
        sort: &SortSpec,
        window: Window,
    ) -> Result<Vec<Record>> {
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| table_not_found(table))?;
        Ok(select_rows(t.rows.values(), filter, sort, window))
    }

    fn delete(&self, table: &str, filter: &Record, window: Window) -> Result<u64> {
        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| table_not_found(table))?;
        let ids = matching_ids(&t.rows, filter, window);
        for id in &ids {
            t.rows.remove(id);
        }
        Ok(ids.len() as u64)
    }

    fn update(
        &self,
        table: &str,
        filter: &Record,
        window: Window,
        changes: &Record,
        now: &Value,
    ) -> Result<u64> {
        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| table_not_found(table))?;
        let changed = update_rows(&mut t.rows, &t.columns, filter, window, changes, now)?;
        Ok(changed.len() as u64)
    }

    fn count(&self, table: &str) -> Result<u64> {
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| table_not_found(table))?;
        Ok(t.rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use serde_json::json;

    fn row(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn ids_are_not_reused_after_delete() {
        let s = MemoryStorage::new();
        s.create_table("t", &[FieldDef::new("a", FieldType::Text)]).unwrap();
        let first = s.insert("t", row(json!({"a": "x"}))).unwrap();
        s.delete("t", &Record::new(), Window::default()).unwrap();
        let second = s.insert("t", row(json!({"a": "y"}))).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn create_twice_is_duplicate() {
        let s = MemoryStorage::new();
        s.create_table("t", &[]).unwrap();
        assert!(matches!(
            s.create_table("t", &[]),
            Err(TrackrError::DuplicateName(_))
        ));
    }

    #[test]
    fn missing_table_is_storage_error() {
        let s = MemoryStorage::new();
        assert!(matches!(s.count("ghost"), Err(TrackrError::Storage(_))));
    }
}
