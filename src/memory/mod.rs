//! In-memory database that executes the AQL subset the compiler emits.
//!
//! Queries are parsed into a small syntax tree and interpreted against a
//! map of collections held behind a lock. Read-only queries share a read
//! lock; a query containing `INSERT` or `REMOVE` runs against a copy of the
//! store under the write lock, and the copy replaces the store only if the
//! whole query succeeds.

mod eval;
mod functions;
mod lexer;
mod parser;
mod value;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::executor::{Cursor, Database, VecCursor};
use eval::{Access, Evaluator};

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct Collection {
    /// insertion sequence -> document
    docs: BTreeMap<u64, Value>,
    keys: HashMap<String, u64>,
    next_seq: u64,
    next_key: u64,
}

impl Collection {
    fn generate_key(&mut self) -> String {
        loop {
            self.next_key += 1;
            let key = self.next_key.to_string();
            if !self.keys.contains_key(&key) {
                return key;
            }
        }
    }

    fn insert(&mut self, name: &str, mut doc: Value, revision: u64) -> Result<Value> {
        let supplied = match doc.get("_key") {
            None => None,
            Some(Value::String(k)) => Some(k.clone()),
            Some(other) => {
                return Err(Error::InvalidQuery(format!("_key must be a string, got {other}")));
            }
        };
        let key = match supplied {
            Some(key) => key,
            None => self.generate_key(),
        };
        if self.keys.contains_key(&key) {
            return Err(Error::UniqueViolation {
                field: "_key".to_string(),
            });
        }

        let obj = doc.as_object_mut().ok_or(Error::NotAnObject)?;
        obj.insert("_key".to_string(), Value::String(key.clone()));
        obj.insert("_id".to_string(), Value::String(format!("{name}/{key}")));
        obj.insert("_rev".to_string(), Value::String(format!("_{revision:x}")));

        let seq = self.next_seq;
        self.next_seq += 1;
        self.docs.insert(seq, doc.clone());
        self.keys.insert(key, seq);
        Ok(doc)
    }

    fn remove(&mut self, name: &str, key: &str) -> Result<Value> {
        self.keys
            .remove(key)
            .and_then(|seq| self.docs.remove(&seq))
            .ok_or_else(|| Error::DocumentNotFound(format!("{name}/{key}")))
    }
}

/// Every collection, plus the revision counter shared by all of them.
#[derive(Debug, Clone, Default)]
pub(crate) struct Store {
    collections: HashMap<String, Collection>,
    revision: u64,
}

impl Store {
    /// Documents of `name` in insertion order.
    pub(crate) fn documents(&self, name: &str) -> Result<Vec<Value>> {
        self.collections
            .get(name)
            .map(|c| c.docs.values().cloned().collect())
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    /// Insert into `name`, creating the collection if needed.
    pub(crate) fn insert(&mut self, name: &str, doc: Value) -> Result<Value> {
        if !doc.is_object() {
            return Err(Error::NotAnObject);
        }
        self.revision += 1;
        let revision = self.revision;
        self.collections
            .entry(name.to_string())
            .or_default()
            .insert(name, doc, revision)
    }

    pub(crate) fn remove(&mut self, name: &str, key: &str) -> Result<Value> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))?
            .remove(name, key)
    }
}

// ---------------------------------------------------------------------------
// MemoryDatabase
// ---------------------------------------------------------------------------

/// A [`Database`] that keeps everything in process memory.
///
/// Thread-safe: concurrent read-only queries proceed in parallel, modifying
/// queries are serialized.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    store: RwLock<Store>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty collection. Existing collections are left alone.
    pub fn create_collection(&self, name: &str) -> Result<()> {
        crate::validate::collection_name(name)?;
        self.store
            .write()
            .collections
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    /// Collection names, sorted.
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.store.read().collections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Insert documents directly, without going through a query. Nothing is
    /// inserted unless every document is accepted.
    pub fn load(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<Value>> {
        crate::validate::collection_name(collection)?;
        let mut store = self.store.write();
        let mut draft = store.clone();
        let stored = docs
            .into_iter()
            .map(|doc| draft.insert(collection, doc))
            .collect::<Result<Vec<Value>>>()?;
        *store = draft;
        Ok(stored)
    }

    /// Parse and run `query`, returning every row.
    pub fn execute(&self, query: &str) -> Result<Vec<Value>> {
        let statement = parser::parse(query)?;
        trace!(%query, modifies = statement.modifies, "memory query");

        let rows = if statement.modifies {
            let mut store = self.store.write();
            let mut draft = store.clone();
            let rows = Evaluator::new(Access::Write(&mut draft)).run(&statement.query)?;
            *store = draft;
            rows
        } else {
            let store = self.store.read();
            Evaluator::new(Access::Read(&store)).run(&statement.query)?
        };

        debug!(rows = rows.len(), modifies = statement.modifies, "memory query done");
        Ok(rows)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn query(&self, query: &str) -> Result<Box<dyn Cursor>> {
        let rows = self.execute(query)?;
        Ok(Box::new(VecCursor::new(rows)))
    }
}
