//! Execution strategies and the dispatcher that picks one per statement.
//!
//! `supports` is a cheap textual check on the statement's leading keyword and
//! the declared [`ExecutionMode`]; anything deeper fails later, inside the
//! chosen strategy.

pub mod aggregate;
pub mod bridge;
pub mod dml;
pub mod find;

pub use aggregate::AggregateStrategy;
pub use bridge::TwoStageBridge;
pub use dml::{DeleteStrategy, InsertStrategy, UpdateStrategy};
pub use find::StandardFind;

use bson::Document;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

use crate::error::Result;
use crate::query::{matches, Compiler, ExecutionPlan, Parameters, QueryPlan};
use crate::relational::{sqlite_factory, EngineFactory};
use crate::result::RowShape;
use crate::storage::pipeline::sort_documents;
use crate::storage::{CursorBatch, DocumentStore, Session};

/// How SELECT statements with FROM subqueries are executed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Everything runs natively in the document store
    #[default]
    Standard,
    /// FROM subqueries run natively, the outer statement in the relational engine
    TwoStage,
}

impl ExecutionMode {
    /// Parse a mode name (`standard`, `twostage`, `two-stage`, `superset`)
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "standard" | "" => Some(ExecutionMode::Standard),
            "twostage" | "two-stage" | "two_stage" | "superset" => Some(ExecutionMode::TwoStage),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Standard => "standard",
            ExecutionMode::TwoStage => "twostage",
        }
    }
}

/// Per-statement execution inputs
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub query: &'a str,
    pub mode: ExecutionMode,
    pub session: Option<&'a Session>,
    /// First-batch size requested from the store
    pub batch_size: Option<u32>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(query: &'a str, mode: ExecutionMode) -> Self {
        Self {
            query,
            mode,
            session: None,
            batch_size: None,
        }
    }

    pub fn with_session(mut self, session: Option<&'a Session>) -> Self {
        self.session = session;
        self
    }

    pub fn with_batch_size(mut self, batch_size: Option<u32>) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Upper-cased first word of the statement
    pub fn leading_keyword(&self) -> String {
        self.query
            .trim_start()
            .trim_start_matches('(')
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase()
    }

    pub fn is_select(&self) -> bool {
        matches!(self.leading_keyword().as_str(), "SELECT" | "WITH")
    }
}

/// Raw outcome handed to the result cursor
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    /// A cursor reply (`{cursor: {id, ns, firstBatch}}`) and how to shape its rows
    Cursor { reply: Document, shape: RowShape },
    /// A write acknowledgement
    Write { reply: Document, affected: u64 },
}

pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, ctx: &ExecutionContext<'_>) -> bool;

    fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        plan: &ExecutionPlan,
        store: &Arc<dyn DocumentStore>,
        params: &Parameters,
    ) -> Result<RawResult>;
}

/// `[collection.]aggregate(` in a FROM clause
pub(crate) fn aggregate_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)\bFROM\s+(?:[\w"`]+\s*\.\s*)*aggregate\s*\("#)
            .expect("valid aggregate detection regex")
    })
}

/// Follow a cursor reply through `getMore` until the store reports it exhausted.
/// Returns the namespace and every document.
pub(crate) fn drain_reply(
    ctx: &ExecutionContext<'_>,
    store: &Arc<dyn DocumentStore>,
    reply: &Document,
) -> Result<(String, Vec<Document>)> {
    let mut batch = CursorBatch::from_reply(reply)?;
    let namespace = batch.namespace.clone();
    let mut documents = std::mem::take(&mut batch.documents);
    while !batch.is_exhausted() {
        batch = store.get_more(&namespace, batch.id, ctx.batch_size)?;
        documents.append(&mut batch.documents);
    }
    Ok((namespace, documents))
}

/// Apply a bound filter, then the plan's sort, skip and limit, in memory
pub(crate) fn apply_window(
    documents: Vec<Document>,
    filter: &Document,
    plan: &QueryPlan,
) -> Result<Vec<Document>> {
    let mut rows = Vec::with_capacity(documents.len());
    for document in documents {
        if filter.is_empty() || matches(filter, &document)? {
            rows.push(document);
        }
    }

    if !plan.sort().is_empty() {
        sort_documents(&mut rows, &plan.sort_document());
    }
    let skip = plan.skip().unwrap_or(0) as usize;
    Ok(match plan.limit() {
        Some(limit) => rows.into_iter().skip(skip).take(limit as usize).collect(),
        None => rows.into_iter().skip(skip).collect(),
    })
}

/// Ordered strategy list with a standard-find fallback
pub struct Dispatcher {
    strategies: Vec<Arc<dyn ExecutionStrategy>>,
    fallback: Arc<dyn ExecutionStrategy>,
}

impl Dispatcher {
    /// No strategies; every statement falls back to standard find
    pub fn empty() -> Self {
        Self {
            strategies: Vec::new(),
            fallback: Arc::new(StandardFind),
        }
    }

    /// Bridge, aggregate, find, insert, update, delete, in that order
    pub fn with_defaults(compiler: Arc<Compiler>) -> Self {
        Self::with_engine_factory(compiler, sqlite_factory())
    }

    pub fn with_engine_factory(compiler: Arc<Compiler>, factory: EngineFactory) -> Self {
        let mut dispatcher = Self::empty();
        dispatcher.register(Arc::new(TwoStageBridge::new(compiler, factory)));
        dispatcher.register(Arc::new(AggregateStrategy));
        dispatcher.register(Arc::new(StandardFind));
        dispatcher.register(Arc::new(InsertStrategy));
        dispatcher.register(Arc::new(UpdateStrategy));
        dispatcher.register(Arc::new(DeleteStrategy));
        dispatcher
    }

    /// Append a strategy; earlier registrations win
    pub fn register(&mut self, strategy: Arc<dyn ExecutionStrategy>) {
        tracing::debug!(strategy = strategy.name(), "registered execution strategy");
        self.strategies.push(strategy);
    }

    /// First strategy whose `supports` is true, else standard find
    pub fn select(&self, ctx: &ExecutionContext<'_>) -> Arc<dyn ExecutionStrategy> {
        self.strategies
            .iter()
            .find(|s| s.supports(ctx))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("strategies", &self.strategy_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> Dispatcher {
        Dispatcher::with_defaults(Arc::new(Compiler::default()))
    }

    fn pick(sql: &str, mode: ExecutionMode) -> &'static str {
        dispatcher().select(&ExecutionContext::new(sql, mode)).name()
    }

    #[test]
    fn test_default_order() {
        assert_eq!(
            dispatcher().strategy_names(),
            vec!["two_stage_bridge", "aggregate", "standard_find", "insert", "update", "delete"]
        );
    }

    #[test]
    fn test_selection() {
        use ExecutionMode::*;
        assert_eq!(pick("SELECT * FROM users", Standard), "standard_find");
        assert_eq!(pick("select * from users", TwoStage), "two_stage_bridge");
        assert_eq!(pick("SELECT * FROM users.aggregate('[]', '{}')", Standard), "aggregate");
        assert_eq!(pick("SELECT * FROM aggregate('[]', '{}')", Standard), "aggregate");
        assert_eq!(pick("INSERT INTO t VALUES (1)", Standard), "insert");
        assert_eq!(pick("  update t SET a = 1", Standard), "update");
        assert_eq!(pick("DELETE FROM t", TwoStage), "delete");
        assert_eq!(pick("WITH x AS (SELECT 1) SELECT * FROM x", Standard), "standard_find");
    }

    #[test]
    fn test_fallback_is_standard_find() {
        assert_eq!(pick("EXPLAIN SELECT 1", ExecutionMode::Standard), "standard_find");
        let empty = Dispatcher::empty();
        assert_eq!(
            empty.select(&ExecutionContext::new("INSERT INTO t VALUES (1)", ExecutionMode::Standard)).name(),
            "standard_find"
        );
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(ExecutionMode::parse("superset"), Some(ExecutionMode::TwoStage));
        assert_eq!(ExecutionMode::parse("Two-Stage"), Some(ExecutionMode::TwoStage));
        assert_eq!(ExecutionMode::parse("standard"), Some(ExecutionMode::Standard));
        assert_eq!(ExecutionMode::parse("turbo"), None);
    }
}
