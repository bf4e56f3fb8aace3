//! Embedded relational engine used by the two-stage bridge.
//!
//! Documents cross into the engine as [`Cell`]s. Each column carries the
//! [`TypeTag`] observed on the document side, which picks the SQL column type
//! on the way in and drives [`recover`] on the way out.

pub mod sqlite;

pub use sqlite::SqliteEngine;

use bson::{oid::ObjectId, spec::BinarySubtype, Binary, Bson, DateTime, Timestamp};
use chrono::SecondsFormat;
use std::sync::Arc;

use crate::data::literal::int_to_bson;
use crate::data::TypeTag;

/// One relational value
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Column name plus the document-side type tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub tag: TypeTag,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, tag: TypeTag) -> Self {
        Self {
            name: name.into(),
            tag,
        }
    }
}

/// Result set of a relational query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationalRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

/// Embedded SQL engine holding a temporary table for one bridge execution
pub trait RelationalEngine {
    fn create_table(&mut self, name: &str, columns: &[ColumnDef]) -> Result<(), BridgeError>;

    /// Insert all rows in one transaction; returns the number inserted
    fn bulk_insert(
        &mut self,
        table: &str,
        columns: &[ColumnDef],
        rows: &[Vec<Cell>],
    ) -> Result<usize, BridgeError>;

    fn query(&mut self, sql: &str) -> Result<RelationalRows, BridgeError>;
}

/// Creates a fresh engine for each bridge execution
pub type EngineFactory =
    Arc<dyn Fn() -> Result<Box<dyn RelationalEngine>, BridgeError> + Send + Sync>;

/// In-memory SQLite factory
pub fn sqlite_factory() -> EngineFactory {
    Arc::new(|| Ok(Box::new(SqliteEngine::open_in_memory()?) as Box<dyn RelationalEngine>))
}

/// SQL column type for a document-side tag
pub fn sql_type(tag: TypeTag) -> &'static str {
    match tag {
        TypeTag::Int | TypeTag::Long | TypeTag::Bool | TypeTag::Timestamp => "INTEGER",
        TypeTag::Double => "REAL",
        TypeTag::Binary => "BLOB",
        _ => "TEXT",
    }
}

/// Double-quoted identifier with embedded quotes doubled
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Document value → relational cell
pub fn encode(value: &Bson) -> Cell {
    match value {
        Bson::Null | Bson::Undefined => Cell::Null,
        Bson::Boolean(b) => Cell::Integer(*b as i64),
        Bson::Int32(v) => Cell::Integer(*v as i64),
        Bson::Int64(v) => Cell::Integer(*v),
        Bson::Double(v) => Cell::Real(*v),
        Bson::String(s) | Bson::Symbol(s) => Cell::Text(s.clone()),
        Bson::DateTime(dt) => Cell::Text(dt.to_chrono().to_rfc3339_opts(SecondsFormat::Millis, true)),
        // time in the high 32 bits, increment in the low 32
        Bson::Timestamp(ts) => Cell::Integer(((ts.time as i64) << 32) | ts.increment as i64),
        Bson::ObjectId(oid) => Cell::Text(oid.to_hex()),
        Bson::Binary(bin) => Cell::Blob(bin.bytes.clone()),
        Bson::Document(_) | Bson::Array(_) => {
            Cell::Text(value.clone().into_relaxed_extjson().to_string())
        }
        other => Cell::Text(other.to_string()),
    }
}

/// Relational cell → document value, guided by the column's original tag.
/// Unknown tags, and cells that do not parse as their tag, convert generically.
pub fn recover(cell: Cell, tag: Option<TypeTag>) -> Bson {
    match (cell, tag) {
        (Cell::Null, _) => Bson::Null,
        (Cell::Integer(v), Some(TypeTag::Bool)) => Bson::Boolean(v != 0),
        (Cell::Integer(v), Some(TypeTag::Long)) => Bson::Int64(v),
        (Cell::Integer(v), Some(TypeTag::Double)) => Bson::Double(v as f64),
        (Cell::Integer(v), Some(TypeTag::Timestamp)) => Bson::Timestamp(Timestamp {
            time: (v >> 32) as u32,
            increment: (v & 0xFFFF_FFFF) as u32,
        }),
        (Cell::Text(s), Some(TypeTag::Date)) => match chrono::DateTime::parse_from_rfc3339(&s) {
            Ok(dt) => Bson::DateTime(DateTime::from_chrono(dt.with_timezone(&chrono::Utc))),
            Err(_) => Bson::String(s),
        },
        (Cell::Text(s), Some(TypeTag::ObjectId)) => match ObjectId::parse_str(&s) {
            Ok(oid) => Bson::ObjectId(oid),
            Err(_) => Bson::String(s),
        },
        (Cell::Text(s), Some(TypeTag::Document | TypeTag::Array)) => {
            match serde_json::from_str::<serde_json::Value>(&s)
                .ok()
                .and_then(|json| Bson::try_from(json).ok())
            {
                Some(value) => value,
                None => Bson::String(s),
            }
        }
        (Cell::Integer(v), Some(TypeTag::String)) => Bson::String(v.to_string()),
        (Cell::Real(v), Some(TypeTag::String)) => Bson::String(v.to_string()),
        (cell, _) => generic(cell),
    }
}

fn generic(cell: Cell) -> Bson {
    match cell {
        Cell::Null => Bson::Null,
        Cell::Integer(v) => int_to_bson(v),
        Cell::Real(v) => Bson::Double(v),
        Cell::Text(s) => Bson::String(s),
        Cell::Blob(bytes) => Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes,
        }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Relational engine error: {0}")]
    Engine(String),

    #[error("Inner query failed: {0}")]
    InnerQuery(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_sql_types() {
        assert_eq!(sql_type(TypeTag::Int), "INTEGER");
        assert_eq!(sql_type(TypeTag::Bool), "INTEGER");
        assert_eq!(sql_type(TypeTag::Double), "REAL");
        assert_eq!(sql_type(TypeTag::Binary), "BLOB");
        assert_eq!(sql_type(TypeTag::Date), "TEXT");
        assert_eq!(sql_type(TypeTag::Unknown), "TEXT");
    }

    #[test]
    fn test_type_fidelity() {
        let when = DateTime::from_millis(1_700_000_000_123);
        let oid = ObjectId::new();
        let values = vec![
            (Bson::Boolean(true), TypeTag::Bool),
            (Bson::Int64(5), TypeTag::Long),
            (Bson::Int32(7), TypeTag::Int),
            (Bson::Double(2.5), TypeTag::Double),
            (Bson::DateTime(when), TypeTag::Date),
            (Bson::Timestamp(Timestamp { time: 1_700_000_000, increment: 3 }), TypeTag::Timestamp),
            (Bson::ObjectId(oid), TypeTag::ObjectId),
            (Bson::Document(doc! { "a": 1, "b": [true, "x"] }), TypeTag::Document),
            (Bson::String("hi".into()), TypeTag::String),
        ];
        for (value, tag) in values {
            assert_eq!(TypeTag::of(&value), tag);
            assert_eq!(recover(encode(&value), Some(tag)), value, "tag {}", tag);
        }
    }

    #[test]
    fn test_unknown_tags_pass_through() {
        assert_eq!(recover(Cell::Integer(3), None), Bson::Int32(3));
        assert_eq!(recover(Cell::Real(1.5), Some(TypeTag::Unknown)), Bson::Double(1.5));
        assert_eq!(recover(Cell::Text("x".into()), None), Bson::String("x".into()));
        assert_eq!(recover(Cell::Null, Some(TypeTag::Date)), Bson::Null);
    }

    #[test]
    fn test_unparseable_tagged_text_stays_text() {
        assert_eq!(
            recover(Cell::Text("not a date".into()), Some(TypeTag::Date)),
            Bson::String("not a date".into())
        );
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("v"), "\"v\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }
}
