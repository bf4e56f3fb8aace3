use bson::{doc, oid::ObjectId, Bson, Document};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::pipeline::{self, project, sort_documents};
use super::{DocumentStore, Session, StoreError};
use crate::data::set_path;
use crate::query::matches;

const DEFAULT_BATCH_SIZE: usize = 101;
const HISTORY_LIMIT: usize = 1000;

/// Server-side cursor state
#[derive(Debug)]
struct OpenCursor {
    namespace: String,
    remaining: VecDeque<Document>,
}

/// In-memory document store speaking the command protocol
pub struct MemoryStore {
    database: String,
    /// Collections indexed by name
    collections: DashMap<String, Arc<RwLock<Vec<Document>>>>,
    /// Open cursors indexed by id
    cursors: DashMap<i64, OpenCursor>,
    next_cursor_id: AtomicI64,
    default_batch_size: usize,
    /// Most recent commands, as received
    history: Mutex<VecDeque<Document>>,
}

impl MemoryStore {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collections: DashMap::new(),
            cursors: DashMap::new(),
            next_cursor_id: AtomicI64::new(1),
            default_batch_size: DEFAULT_BATCH_SIZE,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// First-batch size used when a command does not ask for one
    pub fn with_default_batch_size(mut self, size: usize) -> Self {
        self.default_batch_size = size.max(1);
        self
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    fn namespace(&self, collection: &str) -> String {
        format!("{}.{}", self.database, collection)
    }

    fn collection(&self, name: &str) -> Arc<RwLock<Vec<Document>>> {
        if let Some(existing) = self.collections.get(name) {
            return Arc::clone(&existing);
        }
        Arc::clone(
            &self
                .collections
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(Vec::new()))),
        )
    }

    /// Insert documents directly, bypassing the command layer
    pub fn seed(&self, collection: &str, documents: Vec<Document>) -> usize {
        let target = self.collection(collection);
        let mut guard = target.write();
        let n = documents.len();
        guard.extend(documents.into_iter().map(with_object_id));
        n
    }

    /// Snapshot of a collection's documents in insertion order
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .get(collection)
            .map(|c| c.read().clone())
            .unwrap_or_default()
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.collections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn drop_collection(&self, name: &str) -> bool {
        self.collections.remove(name).is_some()
    }

    pub fn open_cursor_count(&self) -> usize {
        self.cursors.len()
    }

    /// Commands received so far, most recent last
    pub fn command_history(&self) -> Vec<Document> {
        self.history.lock().iter().cloned().collect()
    }

    fn record(&self, command: &Document) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(command.clone());
    }

    /// Split off a first batch and park the rest behind a new cursor id
    fn open_cursor(&self, collection: &str, mut results: Vec<Document>, batch_size: Option<usize>) -> Document {
        let size = batch_size.filter(|s| *s > 0).unwrap_or(self.default_batch_size);
        let namespace = self.namespace(collection);

        let id = if results.len() > size {
            let remaining: VecDeque<Document> = results.split_off(size).into();
            let id = self.next_cursor_id.fetch_add(1, Ordering::Relaxed);
            self.cursors.insert(
                id,
                OpenCursor {
                    namespace: namespace.clone(),
                    remaining,
                },
            );
            id
        } else {
            0
        };

        doc! {
            "cursor": { "id": id, "ns": namespace, "firstBatch": results },
            "ok": 1.0,
        }
    }

    fn find(&self, collection: &str, command: &Document) -> Result<Document, StoreError> {
        let filter = optional_document(command, "filter")?;
        let projection = optional_document(command, "projection")?;
        let sort = optional_document(command, "sort")?;
        let skip = optional_count(command, "skip")?.unwrap_or(0);
        let limit = optional_count(command, "limit")?.filter(|l| *l > 0);
        let batch_size = optional_count(command, "batchSize")?;

        let snapshot = self.documents(collection);
        let mut results = Vec::new();
        for doc in snapshot {
            if matches(&filter, &doc)? {
                results.push(doc);
            }
        }
        sort_documents(&mut results, &sort);

        let results: Vec<Document> = results
            .into_iter()
            .skip(skip)
            .take(limit.unwrap_or(usize::MAX))
            .map(|d| project(&d, &projection))
            .collect::<Result<_, _>>()?;

        Ok(self.open_cursor(collection, results, batch_size))
    }

    fn get_more_command(&self, command: &Document) -> Result<Document, StoreError> {
        let id = match command.get("getMore") {
            Some(Bson::Int64(v)) => *v,
            Some(Bson::Int32(v)) => *v as i64,
            _ => return Err(StoreError::InvalidCommand("getMore requires a cursor id".into())),
        };
        let batch_size = optional_count(command, "batchSize")?
            .filter(|s| *s > 0)
            .unwrap_or(self.default_batch_size);

        let (batch, namespace, exhausted) = {
            let mut cursor = self.cursors.get_mut(&id).ok_or(StoreError::CursorNotFound(id))?;
            let take = batch_size.min(cursor.remaining.len());
            let batch: Vec<Document> = cursor.remaining.drain(..take).collect();
            (batch, cursor.namespace.clone(), cursor.remaining.is_empty())
        };

        let reply_id = if exhausted {
            self.cursors.remove(&id);
            0
        } else {
            id
        };

        Ok(doc! {
            "cursor": { "id": reply_id, "ns": namespace, "nextBatch": batch },
            "ok": 1.0,
        })
    }

    fn kill_cursors(&self, command: &Document) -> Result<Document, StoreError> {
        let ids = command
            .get_array("cursors")
            .map_err(|_| StoreError::InvalidCommand("killCursors requires a cursors array".into()))?;

        let mut killed = Vec::new();
        let mut not_found = Vec::new();
        for id in ids {
            let id = match id {
                Bson::Int64(v) => *v,
                Bson::Int32(v) => *v as i64,
                _ => continue,
            };
            if self.cursors.remove(&id).is_some() {
                killed.push(id);
            } else {
                not_found.push(id);
            }
        }
        Ok(doc! { "cursorsKilled": killed, "cursorsNotFound": not_found, "ok": 1.0 })
    }

    fn insert(&self, collection: &str, command: &Document) -> Result<Document, StoreError> {
        let documents = command
            .get_array("documents")
            .map_err(|_| StoreError::InvalidCommand("insert requires a documents array".into()))?;
        let mut prepared = Vec::with_capacity(documents.len());
        for item in documents {
            match item {
                Bson::Document(d) => prepared.push(d.clone()),
                other => {
                    return Err(StoreError::InvalidCommand(format!(
                        "documents must be objects, got {}",
                        other
                    )))
                }
            }
        }
        let n = self.seed(collection, prepared);
        Ok(doc! { "n": n as i32, "ok": 1.0 })
    }

    fn update(&self, collection: &str, command: &Document) -> Result<Document, StoreError> {
        let updates = command
            .get_array("updates")
            .map_err(|_| StoreError::InvalidCommand("update requires an updates array".into()))?;

        let target = self.collection(collection);
        let mut guard = target.write();
        let mut matched = 0_i32;
        let mut modified = 0_i32;

        for entry in updates {
            let Bson::Document(entry) = entry else {
                return Err(StoreError::InvalidCommand("update entries must be objects".into()));
            };
            let query = optional_document(entry, "q")?;
            let change = entry
                .get_document("u")
                .map_err(|_| StoreError::InvalidCommand("update entry requires u".into()))?;
            let multi = entry.get_bool("multi").unwrap_or(false);

            for doc in guard.iter_mut() {
                if !matches(&query, doc)? {
                    continue;
                }
                matched += 1;
                let before = doc.clone();
                apply_update(doc, change)?;
                if *doc != before {
                    modified += 1;
                }
                if !multi {
                    break;
                }
            }
        }

        Ok(doc! { "n": matched, "nModified": modified, "ok": 1.0 })
    }

    fn delete(&self, collection: &str, command: &Document) -> Result<Document, StoreError> {
        let deletes = command
            .get_array("deletes")
            .map_err(|_| StoreError::InvalidCommand("delete requires a deletes array".into()))?;

        let target = self.collection(collection);
        let mut guard = target.write();
        let mut removed = 0_i32;

        for entry in deletes {
            let Bson::Document(entry) = entry else {
                return Err(StoreError::InvalidCommand("delete entries must be objects".into()));
            };
            let query = optional_document(entry, "q")?;
            let single = optional_count(entry, "limit")? == Some(1);

            let mut hits = Vec::new();
            for (i, doc) in guard.iter().enumerate() {
                if matches(&query, doc)? {
                    hits.push(i);
                    if single {
                        break;
                    }
                }
            }
            for i in hits.into_iter().rev() {
                guard.remove(i);
                removed += 1;
            }
        }

        Ok(doc! { "n": removed, "ok": 1.0 })
    }

    fn aggregate_command(&self, command: &Document) -> Result<Document, StoreError> {
        let collection = match command.get("aggregate") {
            Some(Bson::String(name)) => name.clone(),
            _ => {
                return Ok(doc! {
                    "ok": 0.0,
                    "code": 115,
                    "errmsg": "database-level aggregation is not supported by the in-memory store",
                })
            }
        };
        let pipeline = command
            .get_array("pipeline")
            .map_err(|_| StoreError::InvalidCommand("aggregate requires a pipeline array".into()))?
            .iter()
            .map(|stage| match stage {
                Bson::Document(d) => Ok(d.clone()),
                other => Err(StoreError::InvalidCommand(format!(
                    "pipeline stages must be objects, got {}",
                    other
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let batch_size = command
            .get_document("cursor")
            .ok()
            .map(|c| optional_count(c, "batchSize"))
            .transpose()?
            .flatten();

        let results = pipeline::run(self.documents(&collection), &pipeline)?;
        Ok(self.open_cursor(&collection, results, batch_size))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("test")
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("database", &self.database)
            .field("collections", &self.list_collections())
            .field("open_cursors", &self.cursors.len())
            .finish()
    }
}

impl DocumentStore for MemoryStore {
    fn run_command(&self, mut command: Document, session: Option<&Session>) -> Result<Document, StoreError> {
        if let Some(session) = session {
            session.attach(&mut command);
        }
        self.record(&command);

        let (name, target) = command
            .iter()
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
            .ok_or_else(|| StoreError::InvalidCommand("empty command".into()))?;
        tracing::trace!(command = %name, "memory store command");

        let collection = || match &target {
            Bson::String(name) => Ok(name.clone()),
            other => Err(StoreError::InvalidCommand(format!(
                "{} requires a collection name, got {}",
                name, other
            ))),
        };

        match name.as_str() {
            "find" => self.find(&collection()?, &command),
            "getMore" => self.get_more_command(&command),
            "killCursors" => self.kill_cursors(&command),
            "insert" => self.insert(&collection()?, &command),
            "update" => self.update(&collection()?, &command),
            "delete" => self.delete(&collection()?, &command),
            "aggregate" => self.aggregate_command(&command),
            "drop" => {
                let dropped = self.drop_collection(&collection()?);
                Ok(doc! { "dropped": dropped, "ok": 1.0 })
            }
            "ping" => Ok(doc! { "ok": 1.0 }),
            other => Err(StoreError::UnknownCommand(other.to_string())),
        }
    }
}

/// Copy with an ObjectId `_id` in front when the document has none
fn with_object_id(doc: Document) -> Document {
    if doc.contains_key("_id") {
        return doc;
    }
    let mut out = Document::new();
    out.insert("_id", ObjectId::new());
    for (key, value) in doc {
        out.insert(key, value);
    }
    out
}

/// `$set`/`$unset`, or whole-document replacement that keeps `_id`
fn apply_update(doc: &mut Document, change: &Document) -> Result<(), StoreError> {
    let operators = change.keys().any(|k| k.starts_with('$'));
    if !operators {
        let id = doc.get("_id").cloned();
        *doc = change.clone();
        if let Some(id) = id {
            *doc = with_object_id_value(id, std::mem::take(doc));
        }
        return Ok(());
    }

    for (op, fields) in change {
        let Bson::Document(fields) = fields else {
            return Err(StoreError::InvalidCommand(format!("{} requires an object", op)));
        };
        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(doc, path, value.clone());
                }
            }
            "$unset" => {
                for (path, _) in fields {
                    doc.remove(path);
                }
            }
            other => {
                return Err(StoreError::InvalidCommand(format!(
                    "unsupported update operator {}",
                    other
                )))
            }
        }
    }
    Ok(())
}

fn with_object_id_value(id: Bson, mut doc: Document) -> Document {
    doc.remove("_id");
    let mut out = Document::new();
    out.insert("_id", id);
    for (key, value) in doc {
        out.insert(key, value);
    }
    out
}

fn optional_document(command: &Document, key: &str) -> Result<Document, StoreError> {
    match command.get(key) {
        None | Some(Bson::Null) => Ok(Document::new()),
        Some(Bson::Document(d)) => Ok(d.clone()),
        Some(other) => Err(StoreError::InvalidCommand(format!(
            "{} must be an object, got {}",
            key, other
        ))),
    }
}

fn optional_count(command: &Document, key: &str) -> Result<Option<usize>, StoreError> {
    match command.get(key) {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::Int32(v)) => Ok(Some(v.unsigned_abs() as usize)),
        Some(Bson::Int64(v)) => Ok(Some(v.unsigned_abs() as usize)),
        Some(Bson::Double(v)) if v.fract() == 0.0 => Ok(Some(v.abs() as usize)),
        Some(other) => Err(StoreError::InvalidCommand(format!(
            "{} must be an integer, got {}",
            key, other
        ))),
    }
}
