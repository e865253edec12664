use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use trackr_core::alert::AlertRule;
use trackr_core::config::{Config, PoolConfig, StorageBackend};
use trackr_core::registry::{ALERT_FINDS, ALERT_RULES};
use trackr_core::schema::{FieldDef, FieldType, Record};
use trackr_core::storage::{MemoryStorage, SortSpec, Storage, Window};
use trackr_core::task::{Query, Selection, Task};
use trackr_core::Engine;

const WAIT: Duration = Duration::from_secs(10);

fn config(workers: usize, stuck_timeout_ms: u64) -> Config {
    Config {
        storage: StorageBackend::Memory,
        pool: PoolConfig {
            workers,
            stuck_timeout_ms,
            idle_poll_ms: 10,
            busy_poll_ms: 5,
        },
        wait_timeout_ms: 10_000,
        ..Config::default()
    }
}

fn record(v: Value) -> Record {
    v.as_object().cloned().unwrap()
}

fn open(dir: &TempDir, storage: Arc<dyn Storage>, cfg: Config) -> Engine {
    Engine::open_with_storage(dir.path(), cfg, storage).unwrap()
}

fn logins_fields() -> Vec<FieldDef> {
    vec![
        FieldDef::new("username", FieldType::Text),
        FieldDef::new("status", FieldType::Text),
        FieldDef::new("seq", FieldType::Integer),
    ]
}

fn create(engine: &Engine, name: &str) {
    let alias = name.to_lowercase().replace(' ', "_");
    engine
        .execute_now(Task::create(name, logins_fields(), Some(&alias)))
        .unwrap();
}

fn select_all(engine: &Engine, name: &str, selection: Selection) -> Vec<Record> {
    engine
        .submit_and_wait(Task::select(name, selection))
        .unwrap()
}

fn ids(rows: &[Record]) -> Vec<u64> {
    rows.iter().map(|r| r["_id"].as_u64().unwrap()).collect()
}

/// Delegates to memory storage; the first insert into `slow_table` sleeps.
struct SlowStorage {
    inner: MemoryStorage,
    slow_table: String,
    delay: Duration,
    slowed: AtomicBool,
}

impl SlowStorage {
    fn new(slow_table: &str, delay: Duration) -> Self {
        Self {
            inner: MemoryStorage::new(),
            slow_table: slow_table.to_string(),
            delay,
            slowed: AtomicBool::new(false),
        }
    }
}

impl Storage for SlowStorage {
    fn create_table(&self, table: &str, columns: &[FieldDef]) -> trackr_core::Result<()> {
        self.inner.create_table(table, columns)
    }
    fn drop_table(&self, table: &str) -> trackr_core::Result<bool> {
        self.inner.drop_table(table)
    }
    fn list_tables(&self) -> trackr_core::Result<Vec<String>> {
        self.inner.list_tables()
    }
    fn columns(&self, table: &str) -> trackr_core::Result<Option<Vec<FieldDef>>> {
        self.inner.columns(table)
    }
    fn insert(&self, table: &str, row: Record) -> trackr_core::Result<u64> {
        if table == self.slow_table && !self.slowed.swap(true, Ordering::SeqCst) {
            std::thread::sleep(self.delay);
        }
        self.inner.insert(table, row)
    }
    fn select(
        &self,
        table: &str,
        filter: &Record,
        sort: &SortSpec,
        window: Window,
    ) -> trackr_core::Result<Vec<Record>> {
        self.inner.select(table, filter, sort, window)
    }
    fn delete(&self, table: &str, filter: &Record, window: Window) -> trackr_core::Result<u64> {
        self.inner.delete(table, filter, window)
    }
    fn update(
        &self,
        table: &str,
        filter: &Record,
        window: Window,
        changes: &Record,
        now: &Value,
    ) -> trackr_core::Result<u64> {
        self.inner.update(table, filter, window, changes, now)
    }
    fn count(&self, table: &str) -> trackr_core::Result<u64> {
        self.inner.count(table)
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn create_starts_empty_with_system_fields() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, Arc::new(MemoryStorage::new()), config(3, 3000));
    create(&engine, "logins");

    assert_eq!(engine.object_info("Logins").unwrap().row_count, Some(0));
    let fields = engine.object_schema("logins").unwrap();
    assert_eq!(fields.len(), logins_fields().len() + 3);
    assert!(engine.list_objects().contains("Logins"));
}

#[test]
fn insert_n_delete_m_leaves_difference() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, Arc::new(MemoryStorage::new()), config(3, 3000));
    create(&engine, "logins");

    for i in 0..10 {
        let status = if i < 4 { "failed" } else { "ok" };
        engine
            .submit(Task::insert("logins", record(json!({"seq": i, "status": status}))))
            .unwrap();
    }
    assert!(engine.wait_idle(WAIT));
    engine
        .submit(Task::delete("logins", Query::all().where_eq("status", "failed")))
        .unwrap();
    assert!(engine.wait_idle(WAIT));

    assert_eq!(engine.object_info("logins").unwrap().row_count, Some(6));
    assert_eq!(select_all(&engine, "logins", Selection::default()).len(), 6);
}

#[test]
fn default_select_is_ascending_id_and_descending_reverses() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, Arc::new(MemoryStorage::new()), config(1, 3000));
    create(&engine, "logins");
    let batch: Vec<Record> = (0..5).map(|i| record(json!({"seq": i}))).collect();
    engine.execute_now(Task::insert_many("logins", batch)).unwrap();

    let asc = ids(&select_all(&engine, "logins", Selection::default()));
    assert!(asc.windows(2).all(|w| w[0] < w[1]));

    let mut desc = ids(&select_all(
        &engine,
        "logins",
        Selection::default().sort_by("_id", true),
    ));
    desc.reverse();
    assert_eq!(desc, asc);
}

#[test]
fn drop_then_create_yields_fresh_object() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, Arc::new(MemoryStorage::new()), config(2, 3000));
    create(&engine, "logins");
    engine
        .execute_now(Task::insert("logins", record(json!({"seq": 1}))))
        .unwrap();
    engine.execute_now(Task::drop("logins")).unwrap();
    assert!(!engine.list_objects().contains("Logins"));

    create(&engine, "logins");
    assert_eq!(engine.object_info("logins").unwrap().row_count, Some(0));
    assert!(select_all(&engine, "logins", Selection::default()).is_empty());
}

#[test]
fn matching_rule_records_exactly_one_find() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, Arc::new(MemoryStorage::new()), config(3, 3000));
    create(&engine, "logins");
    let rule = AlertRule::new("failed logins", "Logins", "status", "failed");
    engine
        .execute_now(Task::insert(ALERT_RULES, rule.to_record()))
        .unwrap();

    engine
        .submit(Task::insert("logins", record(json!({"username": "amy", "status": "ok"}))))
        .unwrap();
    assert!(engine.wait_idle(WAIT));
    assert!(select_all(&engine, ALERT_FINDS, Selection::default()).is_empty());

    engine
        .submit(Task::insert("logins", record(json!({"username": "bob", "status": "failed"}))))
        .unwrap();
    assert!(engine.wait_idle(WAIT));

    let finds = select_all(&engine, ALERT_FINDS, Selection::default());
    assert_eq!(finds.len(), 1);
    let inserted = select_all(
        &engine,
        "logins",
        Selection::new(Query::all().where_eq("username", "bob")),
    );
    assert_eq!(finds[0]["found_id"], inserted[0]["_id"]);
    assert_eq!(finds[0]["rule_name"], json!("failed logins"));
}

#[test]
fn hundred_tasks_over_ten_objects_all_apply() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, Arc::new(MemoryStorage::new()), config(3, 3000));
    let names: Vec<String> = (0..10).map(|i| format!("object {i}")).collect();
    for name in &names {
        create(&engine, name);
    }

    // Per object: 7 inserts, 1 delete of one row, 2 updates.
    for name in &names {
        for i in 0..7 {
            engine
                .submit(Task::insert(name, record(json!({"seq": i}))))
                .unwrap();
        }
        engine
            .submit(Task::delete(name, Query::all().where_eq("seq", 0)))
            .unwrap();
        engine
            .submit(Task::update(name, Query::all(), record(json!({"status": "seen"}))))
            .unwrap();
        engine
            .submit(Task::update(name, Query::all().limit(1), record(json!({"username": "x"}))))
            .unwrap();
    }
    assert!(engine.wait_idle(WAIT));

    for name in &names {
        let info = engine.object_info(name).unwrap();
        let stored = select_all(&engine, name, Selection::default()).len() as u64;
        assert_eq!(info.row_count, Some(stored), "{name}");
        // The delete may run before or after the seq=0 insert lands.
        assert!(stored == 6 || stored == 7, "{name}: {stored}");
    }
    assert_eq!(engine.pool_stats().active, 3);
}

#[test]
fn stuck_worker_is_replaced_and_effect_applies_once() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(SlowStorage::new("Logins", Duration::from_millis(500)));
    let engine = open(&dir, storage, config(2, 100));
    create(&engine, "logins");

    engine
        .submit(Task::insert("logins", record(json!({"seq": 1}))))
        .unwrap();
    assert!(engine.wait_idle(WAIT));
    // The abandoned worker's insert finishes after the replacement gives up
    // waiting; let it settle before counting.
    std::thread::sleep(Duration::from_millis(600));

    assert!(engine.pool_stats().abandoned >= 1);
    assert_eq!(engine.object_info("logins").unwrap().row_count, Some(1));
    assert_eq!(select_all(&engine, "logins", Selection::default()).len(), 1);
}

#[test]
fn tasks_saved_at_shutdown_replay_in_order() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(SlowStorage::new("Logins", Duration::from_millis(300)));
    let engine = open(&dir, Arc::clone(&storage) as Arc<dyn Storage>, config(1, 5000));
    create(&engine, "logins");

    for i in 0..6 {
        engine
            .submit(Task::insert("logins", record(json!({"seq": i}))))
            .unwrap();
    }
    std::thread::sleep(Duration::from_millis(50));
    let saved = engine.shutdown().unwrap();
    assert!(saved > 0);
    assert_eq!(Engine::pending(dir.path()).unwrap().len(), saved);
    drop(engine);

    let engine = open(&dir, storage, config(1, 5000));
    assert!(Engine::pending(dir.path()).unwrap().is_empty());
    assert!(engine.wait_idle(WAIT));

    let rows = select_all(&engine, "logins", Selection::default());
    let seqs: Vec<i64> = rows.iter().map(|r| r["seq"].as_i64().unwrap()).collect();
    assert_eq!(seqs, (0..6).collect::<Vec<_>>());
}
