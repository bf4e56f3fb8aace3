//! Document store contract.
//!
//! The store speaks the command protocol: every operation is a command
//! document (`{find: ..}`, `{getMore: ..}`, `{insert: ..}`) answered by a
//! reply document carrying `ok: 1` on success. Cursor-returning replies
//! embed `{cursor: {id, ns, firstBatch | nextBatch}}`; a cursor id of 0
//! means the result is complete.

pub mod engine;
pub mod pipeline;

pub use engine::MemoryStore;

use bson::{doc, Bson, Document};

use crate::query::MatchError;

/// Logical session handle; commands issued with one carry it as `lsid`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Session {
    id: String,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Attach this session to a command document
    pub fn attach(&self, command: &mut Document) {
        command.insert("lsid", doc! { "id": self.id.as_str() });
    }
}

/// External document database
pub trait DocumentStore: Send + Sync {
    /// Run one command and return its reply
    fn run_command(&self, command: Document, session: Option<&Session>) -> Result<Document, StoreError>;

    /// Fetch the next batch of an open cursor
    fn get_more(
        &self,
        namespace: &str,
        cursor_id: i64,
        batch_size: Option<u32>,
    ) -> Result<CursorBatch, StoreError> {
        let (_, collection) = split_namespace(namespace);
        let mut command = doc! { "getMore": cursor_id, "collection": collection };
        if let Some(size) = batch_size {
            command.insert("batchSize", size as i64);
        }
        let reply = check_reply(self.run_command(command, None)?)?;
        CursorBatch::from_reply(&reply)
    }

    /// Release an open cursor
    fn kill_cursor(&self, namespace: &str, cursor_id: i64) -> Result<(), StoreError> {
        let (_, collection) = split_namespace(namespace);
        let command = doc! { "killCursors": collection, "cursors": [cursor_id] };
        check_reply(self.run_command(command, None)?).map(|_| ())
    }

    /// Run an aggregation pipeline; `None` targets the whole database
    fn aggregate(
        &self,
        collection: Option<&str>,
        pipeline: Vec<Document>,
        options: Document,
        session: Option<&Session>,
    ) -> Result<Document, StoreError> {
        let target = match collection {
            Some(name) => Bson::String(name.to_string()),
            None => Bson::Int32(1),
        };
        let mut command = doc! { "aggregate": target, "pipeline": pipeline };
        if !options.contains_key("cursor") {
            command.insert("cursor", Document::new());
        }
        for (key, value) in options {
            command.insert(key, value);
        }
        check_reply(self.run_command(command, session)?)
    }
}

/// `db.collection` split into its parts; a bare name has an empty database
pub fn split_namespace(namespace: &str) -> (&str, &str) {
    namespace.split_once('.').unwrap_or(("", namespace))
}

/// Turn a reply without `ok: 1` into [`StoreError::CommandFailed`]
pub fn check_reply(reply: Document) -> Result<Document, StoreError> {
    let ok = match reply.get("ok") {
        Some(Bson::Double(v)) => *v == 1.0,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        Some(Bson::Boolean(v)) => *v,
        _ => false,
    };
    if ok {
        return Ok(reply);
    }
    Err(StoreError::CommandFailed {
        code: reply.get_i32("code").unwrap_or_default(),
        message: reply
            .get_str("errmsg")
            .unwrap_or("command failed")
            .to_string(),
    })
}

/// One batch of a server-side cursor
#[derive(Debug, Clone, PartialEq)]
pub struct CursorBatch {
    pub id: i64,
    pub namespace: String,
    pub documents: Vec<Document>,
}

impl CursorBatch {
    /// Decode `{cursor: {id, ns, firstBatch | nextBatch}}`
    pub fn from_reply(reply: &Document) -> Result<Self, StoreError> {
        let cursor = reply
            .get_document("cursor")
            .map_err(|_| StoreError::MalformedReply("missing cursor document".into()))?;

        let id = match cursor.get("id") {
            Some(Bson::Int64(v)) => *v,
            Some(Bson::Int32(v)) => *v as i64,
            _ => return Err(StoreError::MalformedReply("missing cursor id".into())),
        };
        let namespace = cursor.get_str("ns").unwrap_or_default().to_string();

        let batch = cursor
            .get_array("firstBatch")
            .or_else(|_| cursor.get_array("nextBatch"))
            .map_err(|_| StoreError::MalformedReply("missing cursor batch".into()))?;
        let documents = batch
            .iter()
            .map(|item| match item {
                Bson::Document(d) => Ok(d.clone()),
                other => Err(StoreError::MalformedReply(format!(
                    "batch entries must be documents, got {}",
                    other
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id,
            namespace,
            documents,
        })
    }

    pub fn is_exhausted(&self) -> bool {
        self.id == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Command failed ({code}): {message}")]
    CommandFailed { code: i32, message: String },

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Cursor {0} not found")]
    CursorNotFound(i64),

    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    #[error("Filter error: {0}")]
    Match(#[from] MatchError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_batch_from_reply() {
        let reply = doc! {
            "cursor": { "id": 7_i64, "ns": "db.users", "firstBatch": [ { "a": 1 } ] },
            "ok": 1,
        };
        let batch = CursorBatch::from_reply(&reply).unwrap();
        assert_eq!(batch.id, 7);
        assert_eq!(batch.namespace, "db.users");
        assert_eq!(batch.documents, vec![doc! { "a": 1 }]);
        assert!(!batch.is_exhausted());

        let next = doc! { "cursor": { "id": 0_i64, "ns": "db.users", "nextBatch": [] }, "ok": 1.0 };
        assert!(CursorBatch::from_reply(&next).unwrap().is_exhausted());
    }

    #[test]
    fn test_check_reply() {
        assert!(check_reply(doc! { "n": 1, "ok": 1.0 }).is_ok());
        let err = check_reply(doc! { "ok": 0, "code": 43, "errmsg": "cursor not found" }).unwrap_err();
        assert!(matches!(err, StoreError::CommandFailed { code: 43, .. }));
    }

    #[test]
    fn test_split_namespace() {
        assert_eq!(split_namespace("db.users"), ("db", "users"));
        assert_eq!(split_namespace("db.a.b"), ("db", "a.b"));
        assert_eq!(split_namespace("users"), ("", "users"));
    }

    #[test]
    fn test_session_attach() {
        let mut command = doc! { "find": "users" };
        Session::new("s-1").attach(&mut command);
        assert_eq!(command.get_document("lsid").unwrap(), &doc! { "id": "s-1" });
    }
}
