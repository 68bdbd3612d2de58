#![allow(dead_code)]

use graphload::query::{InsertQuery, MatchInsertQuery, ThingPattern, ValueType};
use graphload::store::{GraphStore, MemoryStore, Session, StoreError, StoreResult, WriteTransaction};
use graphload::LoaderConfig;
use serde_json::Value as Json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub const DATABASE: &str = "test";

pub const SCHEMA: &str = r#"
define

name sub attribute, value string;
phone-number sub attribute, value string;
twitter-username sub attribute, value string;
age sub attribute, value long;
duration sub attribute, value long;

person sub entity,
    owns phone-number @key,
    owns name,
    owns twitter-username,
    owns age,
    plays call:caller,
    plays call:callee;

call sub relation,
    relates caller,
    relates callee,
    owns duration;
"#;

pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("schema.gql"), SCHEMA).unwrap();
        Self { dir }
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn config(&self, mapping: &Json) -> LoaderConfig {
        let path = self.write("mapping.json", &serde_json::to_string_pretty(mapping).unwrap());
        LoaderConfig::from_path(&path).unwrap()
    }

    pub fn store(&self) -> MemoryStore {
        let store = MemoryStore::new();
        store.create_database(DATABASE).unwrap();
        store.define_schema(DATABASE, SCHEMA).unwrap();
        store
    }

    /// Contents of a per-row log, empty when it was never written
    pub fn row_log(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join("loader-logs").join(name)).unwrap_or_default()
    }
}

/// `phone,name,age` rows for people 1..=n
pub fn people_csv(n: usize) -> String {
    let mut out = String::from("phone,name,age\n");
    for i in 1..=n {
        out.push_str(&format!("+{},Person {},{}\n", i, i, 20 + i % 50));
    }
    out
}

/// Injected store failures, shared by every transaction of a [`FlakyStore`]
#[derive(Default)]
pub struct Faults {
    /// 1-based index of the insert / match-insert call that is rejected
    pub reject_write: Option<u64>,
    /// 1-based index of the write call that panics
    pub panic_write: Option<u64>,
    pub transient_writes: AtomicU64,
    pub transient_commits: AtomicU64,
    pub writes: AtomicU64,
}

impl Faults {
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

fn take(counter: &AtomicU64) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Wraps a [`MemoryStore`] and fails writes or commits on demand
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub faults: Arc<Faults>,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore, faults: Faults) -> Self {
        Self {
            inner,
            faults: Arc::new(faults),
        }
    }
}

impl GraphStore for FlakyStore {
    fn database_exists(&self, database: &str) -> StoreResult<bool> {
        self.inner.database_exists(database)
    }

    fn create_database(&self, database: &str) -> StoreResult<()> {
        self.inner.create_database(database)
    }

    fn delete_database(&self, database: &str) -> StoreResult<()> {
        self.inner.delete_database(database)
    }

    fn define_schema(&self, database: &str, schema: &str) -> StoreResult<()> {
        self.inner.define_schema(database, schema)
    }

    fn attribute_value_type(&self, database: &str, label: &str) -> StoreResult<Option<ValueType>> {
        self.inner.attribute_value_type(database, label)
    }

    fn session(&self, database: &str) -> StoreResult<Arc<dyn Session>> {
        Ok(Arc::new(FlakySession {
            inner: self.inner.session(database)?,
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct FlakySession {
    inner: Arc<dyn Session>,
    faults: Arc<Faults>,
}

impl Session for FlakySession {
    fn write_transaction(&self) -> StoreResult<Box<dyn WriteTransaction + '_>> {
        Ok(Box::new(FlakyTransaction {
            inner: self.inner.write_transaction()?,
            faults: &self.faults,
        }))
    }
}

struct FlakyTransaction<'a> {
    inner: Box<dyn WriteTransaction + 'a>,
    faults: &'a Faults,
}

impl FlakyTransaction<'_> {
    fn before_write(&self) -> StoreResult<()> {
        let n = self.faults.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.faults.panic_write == Some(n) {
            panic!("injected panic on write {}", n);
        }
        if self.faults.reject_write == Some(n) {
            return Err(StoreError::Rejected(format!("injected rejection of write {}", n)));
        }
        if take(&self.faults.transient_writes) {
            return Err(StoreError::Unavailable("injected write contention".into()));
        }
        Ok(())
    }
}

impl WriteTransaction for FlakyTransaction<'_> {
    fn insert(&mut self, query: &InsertQuery) -> StoreResult<usize> {
        self.before_write()?;
        self.inner.insert(query)
    }

    fn match_insert(&mut self, query: &MatchInsertQuery) -> StoreResult<usize> {
        self.before_write()?;
        self.inner.match_insert(query)
    }

    fn count_matches(&mut self, patterns: &[ThingPattern], limit: usize) -> StoreResult<usize> {
        self.inner.count_matches(patterns, limit)
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        if take(&self.faults.transient_commits) {
            return Err(StoreError::Unavailable("injected commit contention".into()));
        }
        self.inner.commit()
    }
}
