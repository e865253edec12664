//! Catalog of the dynamic objects known to the engine.
//!
//! Each [`DynamicObject`] carries its schema, its table binding, a cached row
//! count and the per-object lock that serializes every action against it.
//! The [`Registry`] maps normalized names (and aliases) to objects and tracks
//! names reserved by creates that are still building their table.
//!
//! The registry lock is only ever held for map operations. It is never held
//! while an object lock or the queue lock is taken.

use crate::error::{Result, TrackrError};
use crate::paths::{normalize_name, validate_alias};
use crate::queue::TaskQueue;
use crate::schema::{FieldDef, FieldType, Schema};
use crate::task::Task;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// System collections
// ---------------------------------------------------------------------------

pub const CATALOG: &str = "_Catalog";
pub const USERS: &str = "_Users";
pub const ALERT_RULES: &str = "_Alert_Rules";
pub const ALERT_FINDS: &str = "_Alert_Finds";

pub const SYSTEM_NAMES: [&str; 4] = [CATALOG, USERS, ALERT_RULES, ALERT_FINDS];

/// True only for the fixed system collections. Other `_`-prefixed names are
/// not system objects; user creates of such names are refused.
pub fn is_system_name(name: &str) -> bool {
    SYSTEM_NAMES.contains(&name)
}

/// Field lists of the collections that exist in every store.
pub fn system_collections() -> Vec<(&'static str, Vec<FieldDef>)> {
    vec![
        (
            CATALOG,
            vec![
                FieldDef::new("object_name", FieldType::Text).required().unique(),
                FieldDef::new("alias", FieldType::Text).required().unique(),
            ],
        ),
        (
            USERS,
            vec![
                FieldDef::new("name", FieldType::Text),
                FieldDef::new("username", FieldType::Text).required().unique(),
                FieldDef::new("email", FieldType::Text).unique(),
                FieldDef::new("password", FieldType::Text),
                FieldDef::new("hidden_from_ui", FieldType::Boolean).with_default(false),
                FieldDef::new("is_admin", FieldType::Boolean).with_default(false),
            ],
        ),
        (
            ALERT_RULES,
            vec![
                FieldDef::new("name", FieldType::Text).required().unique(),
                FieldDef::new("object_name", FieldType::Text).required(),
                FieldDef::new("column_name", FieldType::Text).required(),
                FieldDef::new("column_value", FieldType::Text),
            ],
        ),
        (
            ALERT_FINDS,
            vec![
                FieldDef::new("rule_name", FieldType::Text).required(),
                FieldDef::new("object_name", FieldType::Text).required(),
                FieldDef::new("column_name", FieldType::Text).required(),
                FieldDef::new("found_value", FieldType::Text),
                FieldDef::new("found_id", FieldType::Integer).required(),
            ],
        ),
    ]
}

// ---------------------------------------------------------------------------
// DynamicObject
// ---------------------------------------------------------------------------

/// Cached row count; `Unknown` until a count query has run for a reflected table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowCount {
    Known(u64),
    Unknown,
}

impl RowCount {
    pub fn known(self) -> Option<u64> {
        match self {
            RowCount::Known(n) => Some(n),
            RowCount::Unknown => None,
        }
    }
}

impl fmt::Display for RowCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowCount::Known(n) => write!(f, "{n}"),
            RowCount::Unknown => f.write_str("unknown"),
        }
    }
}

/// Number of applied task ids each object remembers.
const APPLIED_WINDOW: usize = 256;

/// State guarded by the per-object lock.
#[derive(Debug, Default)]
pub struct ObjectState {
    applied: VecDeque<Uuid>,
    dropped: bool,
}

impl ObjectState {
    pub fn already_applied(&self, id: Uuid) -> bool {
        self.applied.contains(&id)
    }

    pub fn record_applied(&mut self, id: Uuid) {
        if self.applied.len() == APPLIED_WINDOW {
            self.applied.pop_front();
        }
        self.applied.push_back(id);
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    pub fn mark_dropped(&mut self) {
        self.dropped = true;
    }
}

#[derive(Debug)]
pub struct DynamicObject {
    name: String,
    alias: String,
    schema: Schema,
    system: bool,
    state: Mutex<ObjectState>,
    row_count: Mutex<RowCount>,
}

impl DynamicObject {
    fn new(name: String, alias: String, schema: Schema, row_count: RowCount) -> Self {
        let system = is_system_name(&name);
        Self {
            name,
            alias,
            schema,
            system,
            state: Mutex::new(ObjectState::default()),
            row_count: Mutex::new(row_count),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Storage table backing this object.
    pub fn table(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn is_system(&self) -> bool {
        self.system
    }

    /// Acquire the per-object lock. Held for the full duration of an action.
    pub fn lock(&self) -> MutexGuard<'_, ObjectState> {
        self.state.lock()
    }

    pub fn row_count(&self) -> RowCount {
        *self.row_count.lock()
    }

    pub fn set_row_count(&self, count: RowCount) {
        *self.row_count.lock() = count;
    }

    /// Adjust a known count; an unknown count stays unknown.
    pub fn adjust_row_count(&self, added: u64, removed: u64) {
        let mut count = self.row_count.lock();
        if let RowCount::Known(n) = *count {
            *count = RowCount::Known((n + added).saturating_sub(removed));
        }
    }

    pub fn info(&self) -> ObjectInfo {
        ObjectInfo {
            name: self.name.clone(),
            alias: self.alias.clone(),
            row_count: self.row_count().known(),
            system: self.system,
        }
    }
}

/// Summary of one object, as shown to producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub name: String,
    pub alias: String,
    /// `None` while the count is still being computed.
    pub row_count: Option<u64>,
    pub system: bool,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// How an object comes into the registry.
#[derive(Debug, Clone)]
pub enum Definition {
    /// A schema whose table was created empty.
    New(Schema),
    /// Columns reflected from a table that already held data.
    Existing(Vec<FieldDef>),
}

#[derive(Debug, Default)]
struct RegistryState {
    objects: BTreeMap<String, Arc<DynamicObject>>,
    aliases: BTreeMap<String, String>,
    reserved_names: HashSet<String>,
    reserved_aliases: HashSet<String>,
}

impl RegistryState {
    fn check_free(&self, name: &str, alias: &str) -> Result<()> {
        if self.objects.contains_key(name) || self.reserved_names.contains(name) {
            return Err(TrackrError::DuplicateName(format!("object '{name}' exists")));
        }
        if self.aliases.contains_key(alias) || self.reserved_aliases.contains(alias) {
            return Err(TrackrError::DuplicateName(format!("alias '{alias}' is taken")));
        }
        Ok(())
    }
}

pub struct Registry {
    state: Mutex<RegistryState>,
    queue: Arc<TaskQueue>,
}

impl Registry {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            queue,
        }
    }

    /// Resolve the alias an object will be registered under. System
    /// collections always use their lower-cased name.
    pub fn resolve_alias(name: &str, alias: Option<&str>) -> Result<String> {
        if name.is_empty() {
            return Err(TrackrError::InvalidDefinition(
                "object name must not be empty".to_string(),
            ));
        }
        if is_system_name(name) {
            let expected = name.to_lowercase();
            return match alias {
                Some(a) if a != expected => Err(TrackrError::InvalidDefinition(format!(
                    "system collection '{name}' has fixed alias '{expected}'"
                ))),
                _ => Ok(expected),
            };
        }
        if name.starts_with('_') {
            return Err(TrackrError::InvalidDefinition(format!(
                "object name '{name}' is reserved: names starting with '_' belong to the system"
            )));
        }
        let alias = alias.ok_or_else(|| {
            TrackrError::InvalidDefinition(format!("object '{name}' needs an alias"))
        })?;
        validate_alias(alias)?;
        Ok(alias.to_string())
    }

    /// Hold `name` and `alias` until the returned reservation is completed or
    /// dropped, so two concurrent creates cannot both claim them.
    pub fn reserve(&self, name: &str, alias: Option<&str>) -> Result<Reservation<'_>> {
        let name = normalize_name(name);
        let alias = Self::resolve_alias(&name, alias)?;
        let mut state = self.state.lock();
        state.check_free(&name, &alias)?;
        state.reserved_names.insert(name.clone());
        state.reserved_aliases.insert(alias.clone());
        Ok(Reservation {
            registry: self,
            name,
            alias,
        })
    }

    /// Register an object whose table already exists in storage.
    pub fn register(
        &self,
        name: &str,
        definition: Definition,
        alias: Option<&str>,
    ) -> Result<Arc<DynamicObject>> {
        self.reserve(name, alias)?.complete(definition)
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<DynamicObject>> {
        let name = normalize_name(name);
        let mut state = self.state.lock();
        let object = state.objects.remove(&name)?;
        state.aliases.remove(object.alias());
        Some(object)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<DynamicObject>> {
        let name = normalize_name(name);
        self.state
            .lock()
            .objects
            .get(&name)
            .cloned()
            .ok_or(TrackrError::UnknownObject(name))
    }

    pub fn lookup_alias(&self, alias: &str) -> Result<Arc<DynamicObject>> {
        let state = self.state.lock();
        state
            .aliases
            .get(alias)
            .and_then(|name| state.objects.get(name))
            .cloned()
            .ok_or_else(|| TrackrError::UnknownObject(alias.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().objects.contains_key(&normalize_name(name))
    }

    pub fn list(&self) -> BTreeSet<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    /// Every registered object, in name order.
    pub fn objects(&self) -> Vec<Arc<DynamicObject>> {
        self.state.lock().objects.values().cloned().collect()
    }
}

/// Name and alias held for an in-flight create. Released on drop unless
/// [`Reservation::complete`] registered the object.
pub struct Reservation<'a> {
    registry: &'a Registry,
    name: String,
    alias: String,
}

impl Reservation<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Register the object under the reserved name. A reflected table gets an
    /// unknown row count and a deferred `update_count` task.
    pub fn complete(self, definition: Definition) -> Result<Arc<DynamicObject>> {
        let (schema, row_count) = match definition {
            Definition::New(schema) => (schema, RowCount::Known(0)),
            Definition::Existing(columns) => (Schema::from_columns(columns), RowCount::Unknown),
        };
        let object = Arc::new(DynamicObject::new(
            self.name.clone(),
            self.alias.clone(),
            schema,
            row_count,
        ));
        {
            let mut state = self.registry.state.lock();
            state.reserved_names.remove(&self.name);
            state.reserved_aliases.remove(&self.alias);
            state.objects.insert(self.name.clone(), Arc::clone(&object));
            state.aliases.insert(self.alias.clone(), self.name.clone());
        }
        tracing::debug!(object = %self.name, alias = %self.alias, "registered object");
        if row_count == RowCount::Unknown {
            self.registry.queue.push(Task::update_count(&self.name));
        }
        Ok(object)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut state = self.registry.state.lock();
        state.reserved_names.remove(&self.name);
        state.reserved_aliases.remove(&self.alias);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;

    fn registry() -> (Registry, Arc<TaskQueue>) {
        let queue = Arc::new(TaskQueue::new());
        (Registry::new(Arc::clone(&queue)), queue)
    }

    fn logins_schema() -> Schema {
        Schema::new(vec![FieldDef::new("status", FieldType::Text)]).unwrap()
    }

    #[test]
    fn new_object_starts_with_zero_rows() {
        let (reg, queue) = registry();
        let obj = reg
            .register("logins", Definition::New(logins_schema()), Some("logins"))
            .unwrap();
        assert_eq!(obj.name(), "Logins");
        assert_eq!(obj.row_count(), RowCount::Known(0));
        assert!(!obj.is_system());
        assert_eq!(queue.size(), 0);
        assert!(reg.contains("LOGINS"));
    }

    #[test]
    fn existing_table_defers_count() {
        let (reg, queue) = registry();
        let obj = reg
            .register("logins", Definition::Existing(vec![]), Some("logins"))
            .unwrap();
        assert_eq!(obj.row_count(), RowCount::Unknown);
        let pending = queue.snapshot();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind(), TaskKind::UpdateCount);
        assert_eq!(pending[0].target(), "Logins");
    }

    #[test]
    fn user_object_requires_valid_alias() {
        let (reg, _) = registry();
        let missing = reg.register("logins", Definition::New(logins_schema()), None);
        assert!(matches!(missing, Err(TrackrError::InvalidDefinition(_))));
        let bad = reg.register("logins", Definition::New(logins_schema()), Some("Bad Alias"));
        assert!(matches!(bad, Err(TrackrError::InvalidDefinition(_))));
    }

    #[test]
    fn system_collection_alias_is_lowercased_name() {
        let (reg, _) = registry();
        let obj = reg
            .register(ALERT_RULES, Definition::New(Schema::default()), None)
            .unwrap();
        assert_eq!(obj.alias(), "_alert_rules");
        assert!(obj.is_system());
        let wrong = Registry::resolve_alias(CATALOG, Some("catalog"));
        assert!(matches!(wrong, Err(TrackrError::InvalidDefinition(_))));
    }

    #[test]
    fn underscore_names_outside_the_system_set_are_refused() {
        assert!(is_system_name("_Alert_Finds"));
        assert!(!is_system_name("_Logs"));
        let (reg, _) = registry();
        let reserved = reg.register("_logs", Definition::New(logins_schema()), Some("logs"));
        assert!(matches!(reserved, Err(TrackrError::InvalidDefinition(_))));
        assert!(!reg.contains("_logs"));
    }

    #[test]
    fn duplicate_name_or_alias_is_rejected() {
        let (reg, _) = registry();
        reg.register("logins", Definition::New(logins_schema()), Some("logins"))
            .unwrap();
        let same_name = reg.register("Logins", Definition::New(logins_schema()), Some("other"));
        assert!(matches!(same_name, Err(TrackrError::DuplicateName(_))));
        let same_alias = reg.register("sessions", Definition::New(logins_schema()), Some("logins"));
        assert!(matches!(same_alias, Err(TrackrError::DuplicateName(_))));
    }

    #[test]
    fn reservation_blocks_concurrent_create_and_releases_on_drop() {
        let (reg, _) = registry();
        let held = reg.reserve("logins", Some("logins")).unwrap();
        assert!(matches!(
            reg.reserve("logins", Some("other")),
            Err(TrackrError::DuplicateName(_))
        ));
        drop(held);
        assert!(reg.reserve("logins", Some("logins")).is_ok());
    }

    #[test]
    fn unregister_frees_name_and_alias() {
        let (reg, _) = registry();
        reg.register("logins", Definition::New(logins_schema()), Some("logins"))
            .unwrap();
        assert!(reg.unregister("logins").is_some());
        assert!(matches!(reg.lookup("logins"), Err(TrackrError::UnknownObject(_))));
        assert!(reg.lookup_alias("logins").is_err());
        assert!(reg
            .register("logins", Definition::New(logins_schema()), Some("logins"))
            .is_ok());
    }

    #[test]
    fn applied_window_forgets_oldest() {
        let mut state = ObjectState::default();
        let first = Uuid::new_v4();
        state.record_applied(first);
        for _ in 0..APPLIED_WINDOW {
            state.record_applied(Uuid::new_v4());
        }
        assert!(!state.already_applied(first));
    }

    #[test]
    fn adjust_keeps_unknown_and_saturates() {
        let (reg, _) = registry();
        let obj = reg
            .register("logins", Definition::New(logins_schema()), Some("logins"))
            .unwrap();
        obj.adjust_row_count(2, 5);
        assert_eq!(obj.row_count(), RowCount::Known(0));
        obj.set_row_count(RowCount::Unknown);
        obj.adjust_row_count(1, 0);
        assert_eq!(obj.row_count(), RowCount::Unknown);
    }
}
