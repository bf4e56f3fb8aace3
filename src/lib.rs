//! docsql: SQL over schemaless document databases
//!
//! Compiles a practical SQL subset into native document-store commands and
//! runs them through a DB-API style cursor.
//!
//! # Features
//!
//! - **SELECT**: projection with aliases and nested fields, WHERE, ORDER BY, LIMIT/OFFSET
//! - **Filters**: comparisons, IN, BETWEEN, LIKE, IS NULL, AND/OR/NOT into native filter documents
//! - **Writes**: INSERT (VALUES or document literals), UPDATE ... SET, DELETE
//! - **Parameters**: `?` and `:name` placeholders bound at execution time
//! - **Subqueries**: FROM subqueries merged into one native query
//! - **Two-stage mode**: FROM subqueries run natively, the outer statement in in-memory SQLite
//! - **Aggregation**: `FROM collection.aggregate('<pipeline>', '<options>')`
//! - **Projection functions**: `DATE`, `NUMBER`, `UPPER`, `SUBSTR`, ... applied per row
//! - **Plan cache**: compiled plans cached by normalized SQL text
//!
//! # Example
//!
//! ```no_run
//! use docsql::{Connection, ConnectionConfig, MemoryStore, Parameters};
//! use bson::doc;
//! use std::sync::Arc;
//!
//! let store = MemoryStore::new("shop");
//! store.seed("orders", vec![doc! { "region": "east", "qty": 3 }]);
//!
//! let config = ConnectionConfig::from_uri("mongodb+superset://localhost/shop").unwrap();
//! let conn = Connection::new(Arc::new(store), config);
//!
//! let mut cursor = conn
//!     .execute(
//!         "SELECT region, SUM(qty) AS total FROM (SELECT region, qty FROM orders WHERE qty > ?) AS o GROUP BY region",
//!         &Parameters::positional([1]),
//!     )
//!     .unwrap();
//! for row in cursor.fetch_all().unwrap() {
//!     println!("{}", row);
//! }
//! ```

pub mod connection;
pub mod data;
pub mod error;
pub mod executor;
pub mod query;
pub mod relational;
pub mod result;
pub mod storage;

// Re-export commonly used types
pub use connection::{Connection, ConnectionConfig};
pub use data::TypeTag;
pub use error::{Error, Result};
pub use executor::{Dispatcher, ExecutionMode, ExecutionStrategy};
pub use query::{compile, Compiler, ExecutionPlan, Parameters};
pub use result::{ColumnDescription, ResultCursor};
pub use storage::{DocumentStore, MemoryStore, Session};
