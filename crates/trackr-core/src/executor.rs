//! Applies tasks to the registry and storage.
//!
//! Every action except `create` runs under the target object's lock. Lock
//! order is object lock, then the catalog or rules lock, then (briefly) the
//! registry lock.

use crate::alert::AlertEngine;
use crate::error::{Result, TrackrError};
use crate::pool::{TaskOutput, TaskRunner};
use crate::queue::TaskQueue;
use crate::recent::{RecentActivity, RecentEntry};
use crate::registry::{
    is_system_name, system_collections, Definition, DynamicObject, ObjectState, Registry,
    RowCount, CATALOG,
};
use crate::schema::{timestamp_value, FieldDef, Record, Schema, CREATED_FIELD};
use crate::storage::{SortSpec, Storage, Window};
use crate::task::{Action, InsertData, Query, Selection, Task};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const COUNT_ATTEMPTS: usize = 3;
const COUNT_RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct Executor {
    storage: Arc<dyn Storage>,
    registry: Arc<Registry>,
    alerts: AlertEngine,
    recent: Arc<RecentActivity>,
}

impl Executor {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<Registry>,
        queue: Arc<TaskQueue>,
        recent: Arc<RecentActivity>,
    ) -> Self {
        let alerts = AlertEngine::new(Arc::clone(&storage), Arc::clone(&registry), queue);
        Self {
            storage,
            registry,
            alerts,
            recent,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn alerts(&self) -> &AlertEngine {
        &self.alerts
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Register the system collections (creating missing tables), then every
    /// object listed in the catalog. Reflected tables get an `update_count`
    /// task queued.
    pub fn bootstrap(&self) -> Result<()> {
        for (name, fields) in system_collections() {
            match self.storage.columns(name)? {
                Some(columns) => {
                    self.registry
                        .register(name, Definition::Existing(columns), None)?;
                }
                None => {
                    let schema = Schema::new(fields)?;
                    self.storage.create_table(name, &schema.all_fields())?;
                    self.registry.register(name, Definition::New(schema), None)?;
                    tracing::info!(object = %name, "created system collection");
                }
            }
        }

        let entries =
            self.storage
                .select(CATALOG, &Record::new(), &SortSpec::default(), Window::default())?;
        for entry in entries {
            let (Some(name), Some(alias)) = (
                entry.get("object_name").and_then(Value::as_str),
                entry.get("alias").and_then(Value::as_str),
            ) else {
                tracing::warn!(?entry, "malformed catalog entry");
                continue;
            };
            match self.storage.columns(name)? {
                Some(columns) => {
                    if let Err(e) =
                        self.registry
                            .register(name, Definition::Existing(columns), Some(alias))
                    {
                        tracing::warn!(object = %name, error = %e, "could not reflect object");
                    }
                }
                None => tracing::warn!(object = %name, "catalog entry has no table"),
            }
        }

        for table in self.storage.list_tables()? {
            if !self.registry.contains(&table) {
                tracing::warn!(table = %table, "table is not in the catalog; ignored");
            }
        }
        Ok(())
    }

    /// Newest creation timestamps across user objects, for seeding the
    /// recent-activity cache.
    pub fn recent_inserts(&self, per_object: usize) -> Result<Vec<RecentEntry>> {
        let sort = SortSpec {
            field: CREATED_FIELD.to_string(),
            descending: true,
        };
        let mut entries = Vec::new();
        for object in self.registry.objects() {
            if object.is_system() {
                continue;
            }
            let rows = {
                let _guard = object.lock();
                self.storage
                    .select(object.table(), &Record::new(), &sort, Window::new(per_object, 0))?
            };
            entries.extend(rows.iter().filter_map(|row| {
                row.get(CREATED_FIELD)
                    .and_then(Value::as_str)
                    .map(|ts| RecentEntry {
                        object_name: object.name().to_string(),
                        timestamp: ts.to_string(),
                    })
            }));
        }
        Ok(entries)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    pub fn execute(&self, task: &Task) -> Result<TaskOutput> {
        if let Action::Create { fields, alias } = task.action() {
            return self.create(task.target(), fields, alias.as_deref());
        }

        let object = self.registry.lookup(task.target())?;
        let mut state = object.lock();
        if state.is_dropped() {
            return Err(TrackrError::UnknownObject(object.name().to_string()));
        }
        let mutation = task.kind().is_mutation();
        if mutation && state.already_applied(task.id()) {
            tracing::info!(task = %task, "task already applied; skipping");
            return Ok(TaskOutput::Done);
        }

        let result = match task.action() {
            Action::Create { .. } => unreachable!("create is handled above"),
            Action::Drop => self.drop_object(&object, &mut state),
            Action::Insert { records } => self.insert(&object, records),
            Action::Delete { query } => self.delete(&object, query),
            Action::Update { query, changes } => self.update(&object, query, changes),
            Action::Select(selection) => self.select(&object, selection),
            Action::UpdateCount => self.update_count(&object),
        };
        if mutation {
            state.record_applied(task.id());
        }
        result
    }

    // -----------------------------------------------------------------------
    // Schema actions
    // -----------------------------------------------------------------------

    fn create(&self, name: &str, fields: &[FieldDef], alias: Option<&str>) -> Result<TaskOutput> {
        let schema = Schema::new(fields.to_vec())?;
        let reservation = self.registry.reserve(name, alias)?;
        let name = reservation.name().to_string();

        if self.storage.columns(&name)?.is_some() {
            return Err(TrackrError::DuplicateName(format!("table '{name}' exists")));
        }
        self.storage.create_table(&name, &schema.all_fields())?;

        if !is_system_name(&name) {
            if let Err(e) = self.insert_catalog_entry(&name, reservation.alias()) {
                if let Err(drop_err) = self.storage.drop_table(&name) {
                    tracing::error!(object = %name, error = %drop_err, "could not roll back table");
                }
                return Err(e);
            }
        }

        reservation.complete(Definition::New(schema))?;
        tracing::info!(object = %name, "created object");
        Ok(TaskOutput::Done)
    }

    fn insert_catalog_entry(&self, name: &str, alias: &str) -> Result<()> {
        let catalog = self.registry.lookup(CATALOG)?;
        let _guard = catalog.lock();
        let mut entry = Record::new();
        entry.insert("object_name".into(), Value::from(name));
        entry.insert("alias".into(), Value::from(alias));
        let row = catalog.schema().bind_insert(&entry, Utc::now())?;
        self.storage.insert(catalog.table(), row)?;
        catalog.adjust_row_count(1, 0);
        Ok(())
    }

    fn drop_object(&self, object: &DynamicObject, state: &mut ObjectState) -> Result<TaskOutput> {
        if object.is_system() {
            return Err(TrackrError::InvalidDefinition(format!(
                "system collection '{}' cannot be dropped",
                object.name()
            )));
        }

        {
            let catalog = self.registry.lookup(CATALOG)?;
            let _guard = catalog.lock();
            let mut filter = Record::new();
            filter.insert("object_name".into(), Value::from(object.name()));
            let removed = self
                .storage
                .delete(catalog.table(), &filter, Window::default())?;
            catalog.adjust_row_count(0, removed);
        }

        self.storage.drop_table(object.table())?;
        state.mark_dropped();
        self.registry.unregister(object.name());
        tracing::info!(object = %object.name(), "dropped object");
        Ok(TaskOutput::Done)
    }

    // -----------------------------------------------------------------------
    // Record actions
    // -----------------------------------------------------------------------

    fn insert(&self, object: &DynamicObject, data: &InsertData) -> Result<TaskOutput> {
        let mut committed = 0;
        let mut outcome = Ok(TaskOutput::Done);
        for input in data.records() {
            let stored = object
                .schema()
                .bind_insert(input, Utc::now())
                .and_then(|row| {
                    let id = self.storage.insert(object.table(), row.clone())?;
                    Ok((id, row))
                });
            let (id, row) = match stored {
                Ok(stored) => stored,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            };
            committed += 1;
            if !object.is_system() {
                self.alerts.evaluate(object.name(), &row, id);
                if let Some(ts) = row.get(CREATED_FIELD).and_then(Value::as_str) {
                    self.recent.record(object.name(), ts);
                }
            }
        }
        object.adjust_row_count(committed, 0);
        tracing::debug!(object = %object.name(), committed, "inserted records");
        outcome
    }

    fn delete(&self, object: &DynamicObject, query: &Query) -> Result<TaskOutput> {
        let filter = object.schema().bind_filter(&query.filter)?;
        let removed = self
            .storage
            .delete(object.table(), &filter, query.window())?;
        object.adjust_row_count(0, removed);
        tracing::debug!(object = %object.name(), removed, "deleted records");
        Ok(TaskOutput::Done)
    }

    fn update(&self, object: &DynamicObject, query: &Query, changes: &Record) -> Result<TaskOutput> {
        let schema = object.schema();
        let filter = schema.bind_filter(&query.filter)?;
        let changes = schema.bind_update(changes)?;
        let now = timestamp_value(Utc::now());
        let updated = self
            .storage
            .update(object.table(), &filter, query.window(), &changes, &now)?;
        tracing::debug!(object = %object.name(), updated, "updated records");
        Ok(TaskOutput::Done)
    }

    fn select(&self, object: &DynamicObject, selection: &Selection) -> Result<TaskOutput> {
        let schema = object.schema();
        let filter = schema.bind_filter(&selection.query.filter)?;
        schema.check_known(&selection.fields)?;
        let sort = selection.sort_spec();
        if !schema.has_field(&sort.field) {
            return Err(TrackrError::InvalidRecord(format!(
                "unknown sort field '{}'",
                sort.field
            )));
        }
        let rows = self
            .storage
            .select(object.table(), &filter, &sort, selection.query.window())?;
        Ok(TaskOutput::Rows(project(rows, &selection.fields)))
    }

    fn update_count(&self, object: &DynamicObject) -> Result<TaskOutput> {
        let mut attempt = 1;
        loop {
            match self.storage.count(object.table()) {
                Ok(count) => {
                    object.set_row_count(RowCount::Known(count));
                    tracing::debug!(object = %object.name(), count, "row count refreshed");
                    return Ok(TaskOutput::Done);
                }
                Err(e) if attempt < COUNT_ATTEMPTS => {
                    tracing::debug!(object = %object.name(), error = %e, attempt, "count failed; retrying");
                    attempt += 1;
                    thread::sleep(COUNT_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl TaskRunner for Executor {
    fn run(&self, task: &Task) -> Result<TaskOutput> {
        self.execute(task)
    }
}

/// Keep only `fields`, in the requested order. Empty keeps every field.
fn project(rows: Vec<Record>, fields: &[String]) -> Vec<Record> {
    if fields.is_empty() {
        return rows;
    }
    rows.into_iter()
        .map(|row| {
            fields
                .iter()
                .map(|f| (f.clone(), row.get(f).cloned().unwrap_or(Value::Null)))
                .collect()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
