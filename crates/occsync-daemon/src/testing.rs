//! In-memory document store for the test suite and offline development.
//!
//! [`MemoryStore`] implements [`DocumentStore`] over plain maps, with
//! switchable failure modes so tests can exercise the partial-failure
//! paths: database creation refusal (a provisioning-time outage), a
//! per-database "unreachable" flag (a transport failure during the sweep),
//! and access-grant refusal.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use occsync_core::couch::{CouchError, DocumentStore};
use serde_json::Value;

#[derive(Default)]
struct MemoryDb {
    docs: BTreeMap<String, Value>,
    members: Vec<String>,
}

/// An in-memory [`DocumentStore`].
#[derive(Default)]
pub struct MemoryStore {
    databases: Mutex<HashMap<String, MemoryDb>>,
    unreachable: Mutex<HashSet<String>>,
    fail_creates: AtomicBool,
    fail_security: AtomicBool,
}

impl MemoryStore {
    /// Empty store with the standard `db` prefix.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `create_database` call fail until cleared.
    pub fn set_create_failure(&self, enabled: bool) {
        self.fail_creates.store(enabled, Ordering::SeqCst);
    }

    /// Make every `set_security` call fail until cleared.
    pub fn set_security_failure(&self, enabled: bool) {
        self.fail_security.store(enabled, Ordering::SeqCst);
    }

    /// Mark a database as unreachable: fetches fail with a transport error.
    pub fn set_unreachable(&self, database: &str) {
        self.unreachable.lock().unwrap().insert(database.to_string());
    }

    /// Whether the database has been created.
    #[must_use]
    pub fn database_exists(&self, database: &str) -> bool {
        self.databases.lock().unwrap().contains_key(database)
    }

    /// Member names currently granted on a database.
    #[must_use]
    pub fn members(&self, database: &str) -> Vec<String> {
        self.databases
            .lock()
            .unwrap()
            .get(database)
            .map(|db| db.members.clone())
            .unwrap_or_default()
    }

    /// Seed a document directly, creating the database if needed.
    pub fn insert_document(&self, database: &str, doc_id: &str, doc: Value) {
        self.databases
            .lock()
            .unwrap()
            .entry(database.to_string())
            .or_default()
            .docs
            .insert(doc_id.to_string(), doc);
    }

    /// Remove a database entirely (simulates a provisioning gap).
    pub fn drop_database(&self, database: &str) {
        self.databases.lock().unwrap().remove(database);
    }

    /// Number of documents in a database.
    #[must_use]
    pub fn document_count(&self, database: &str) -> usize {
        self.databases
            .lock()
            .unwrap()
            .get(database)
            .map_or(0, |db| db.docs.len())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn database_name(&self, workstation_id: i64) -> String {
        format!("db_ws_{workstation_id}")
    }

    async fn create_database(&self, name: &str) -> Result<(), CouchError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(CouchError::Transport("store offline".to_string()));
        }
        // Creating an existing database is success, as with the real store.
        self.databases
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn set_security(&self, name: &str, member_names: &[String]) -> Result<(), CouchError> {
        if self.fail_security.load(Ordering::SeqCst) {
            return Err(CouchError::UnexpectedStatus {
                operation: "set_security",
                status: 500,
            });
        }
        let mut databases = self.databases.lock().unwrap();
        let Some(db) = databases.get_mut(name) else {
            return Err(CouchError::DatabaseNotFound {
                database: name.to_string(),
            });
        };
        db.members = member_names.to_vec();
        Ok(())
    }

    async fn upsert_document(
        &self,
        database: &str,
        doc_id: &str,
        data: Value,
    ) -> Result<(), CouchError> {
        self.create_database(database).await?;
        self.databases
            .lock()
            .unwrap()
            .entry(database.to_string())
            .or_default()
            .docs
            .insert(doc_id.to_string(), data);
        Ok(())
    }

    async fn fetch_all_documents(&self, database: &str) -> Result<Vec<Value>, CouchError> {
        if self.unreachable.lock().unwrap().contains(database) {
            return Err(CouchError::Transport(format!("{database} unreachable")));
        }
        let databases = self.databases.lock().unwrap();
        match databases.get(database) {
            Some(db) => Ok(db.docs.values().cloned().collect()),
            None => Err(CouchError::DatabaseNotFound {
                database: database.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("databases", &self.databases.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}
