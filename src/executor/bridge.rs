use bson::{doc, Document};
use sqlparser::ast::{Expr, FunctionArg, FunctionArgExpr, SelectItem, SetExpr, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::find::run_query_plan;
use super::{aggregate_call_re, ExecutionContext, ExecutionMode, ExecutionStrategy, RawResult, StandardFind};
use crate::error::Result;
use crate::query::subquery::detect_from_subquery;
use crate::query::{Compiler, ExecutionPlan, Parameters};
use crate::relational::{encode, quote_identifier, recover, BridgeError, Cell, ColumnDef, EngineFactory};
use crate::result::{ResultCursor, RowShape};
use crate::storage::DocumentStore;

/// Two-stage execution of `SELECT ... FROM (<inner>) alias ...`.
///
/// The inner SELECT runs natively in the document store. Its rows are loaded
/// into a table named after the alias in a fresh relational engine, and the
/// outer statement runs there with the subquery replaced by that table.
/// Values come back with their document-side types restored.
pub struct TwoStageBridge {
    compiler: Arc<Compiler>,
    factory: EngineFactory,
}

impl TwoStageBridge {
    pub fn new(compiler: Arc<Compiler>, factory: EngineFactory) -> Self {
        Self { compiler, factory }
    }
}

impl std::fmt::Debug for TwoStageBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoStageBridge").finish_non_exhaustive()
    }
}

impl ExecutionStrategy for TwoStageBridge {
    fn name(&self) -> &'static str {
        "two_stage_bridge"
    }

    fn supports(&self, ctx: &ExecutionContext<'_>) -> bool {
        ctx.mode == ExecutionMode::TwoStage
            && ctx.is_select()
            && !aggregate_call_re().is_match(ctx.query)
    }

    fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        plan: &ExecutionPlan,
        store: &Arc<dyn DocumentStore>,
        params: &Parameters,
    ) -> Result<RawResult> {
        let Some(wrapped) = detect_from_subquery(ctx.query) else {
            tracing::debug!("no FROM subquery, running natively");
            return StandardFind.execute(ctx, plan, store, params);
        };
        let table = wrapped.alias_or_default().to_string();

        // Stage 1: inner statement in the document store
        let inner_plan = match self.compiler.compile(&wrapped.inner)? {
            ExecutionPlan::Query(inner) => inner,
            other => {
                return Err(BridgeError::InnerQuery(format!(
                    "FROM subquery must be a SELECT, got {}",
                    other.kind()
                ))
                .into())
            }
        };
        info!(table = %table, collection = inner_plan.collection(), "bridge: running inner query");

        let inner_ctx = ExecutionContext::new(&wrapped.inner, ExecutionMode::Standard)
            .with_session(ctx.session)
            .with_batch_size(ctx.batch_size);
        let raw = run_query_plan(&inner_ctx, &inner_plan, store, params)?;

        let mut cursor = ResultCursor::new();
        cursor.bind(raw, Arc::clone(store))?;
        let rows = cursor.fetch_all()?;
        let columns: Vec<ColumnDef> = cursor
            .description()
            .unwrap_or_default()
            .into_iter()
            .map(|d| ColumnDef::new(d.name, d.type_code))
            .collect();
        cursor.close();
        info!(rows = rows.len(), columns = columns.len(), "bridge: inner rows collected");

        // Stage 2: load and query the relational copy
        let cells: Vec<Vec<Cell>> = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| row.get(&c.name).map(encode).unwrap_or(Cell::Null))
                    .collect()
            })
            .collect();

        let mut engine = (self.factory)()?;
        engine.create_table(&table, &columns)?;
        let loaded = engine.bulk_insert(&table, &columns, &cells)?;
        info!(table = %table, loaded, "bridge: table loaded");

        let outer_sql = wrapped.rewrite_outer(ctx.query, &quote_identifier(&table));
        info!(sql = %outer_sql, "bridge: running outer query");
        let result = engine.query(&outer_sql)?;
        drop(engine);

        let tags: HashMap<&str, _> = columns.iter().map(|c| (c.name.as_str(), c.tag)).collect();
        let sources = output_sources(&outer_sql);
        let output_tags: Vec<_> = result
            .columns
            .iter()
            .map(|name| match sources.get(name) {
                Some(Some(source)) => tags.get(source.as_str()).copied(),
                Some(None) => None,
                None => tags.get(name.as_str()).copied(),
            })
            .collect();
        let documents: Vec<Document> = result
            .rows
            .into_iter()
            .map(|cells| {
                let mut row = Document::new();
                for ((name, cell), tag) in result.columns.iter().zip(cells).zip(&output_tags) {
                    row.insert(name.clone(), recover(cell, *tag));
                }
                row
            })
            .collect();
        info!(rows = documents.len(), "bridge: outer query complete");

        let reply = doc! {
            "cursor": {
                "id": 0_i64,
                "ns": format!("bridge.{}", table),
                "firstBatch": documents,
            },
            "ok": 1.0,
        };
        Ok(RawResult::Cursor {
            reply,
            shape: RowShape::passthrough(),
        })
    }
}

/// Aliased outer SELECT items → the inner column they read, if any.
/// `MIN`/`MAX` of a column keep that column's type.
fn output_sources(sql: &str) -> HashMap<String, Option<String>> {
    let dialect = GenericDialect {};
    let statements = match Parser::parse_sql(&dialect, sql) {
        Ok(statements) => statements,
        Err(e) => {
            tracing::debug!(error = %e, "outer statement not analysed; recovering by column name");
            return HashMap::new();
        }
    };
    let Some(Statement::Query(query)) = statements.first() else {
        return HashMap::new();
    };
    let SetExpr::Select(select) = &*query.body else {
        return HashMap::new();
    };
    select
        .projection
        .iter()
        .filter_map(|item| match item {
            SelectItem::ExprWithAlias { expr, alias } => Some((alias.value.clone(), source_column(expr))),
            _ => None,
        })
        .collect()
}

fn source_column(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(idents) => idents.last().map(|i| i.value.clone()),
        Expr::Nested(inner) => source_column(inner),
        Expr::Function(function) => {
            let name = function.name.to_string().to_ascii_uppercase();
            match (name.as_str(), function.args.as_slice()) {
                ("MIN" | "MAX", [FunctionArg::Unnamed(FunctionArgExpr::Expr(arg))]) => source_column(arg),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::relational::{sqlite_factory, RelationalEngine, RelationalRows, SqliteEngine};
    use crate::storage::{CursorBatch, MemoryStore};
    use bson::{Bson, DateTime};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> Arc<dyn DocumentStore> {
        let store = MemoryStore::new("shop");
        store.seed(
            "orders",
            vec![
                doc! { "region": "east", "amount": 10, "placed": DateTime::from_millis(1_700_000_000_000) },
                doc! { "region": "west", "amount": 5, "placed": DateTime::from_millis(1_700_000_100_000) },
                doc! { "region": "east", "amount": 7, "placed": DateTime::from_millis(1_700_000_200_000) },
            ],
        );
        Arc::new(store)
    }

    fn bridge(factory: EngineFactory) -> TwoStageBridge {
        TwoStageBridge::new(Arc::new(Compiler::default()), factory)
    }

    fn run_with(factory: EngineFactory, sql: &str, params: &Parameters) -> Result<Vec<Document>> {
        let store = store();
        let ctx = ExecutionContext::new(sql, ExecutionMode::TwoStage);
        let plan = Compiler::default().compile(sql).unwrap();
        match bridge(factory).execute(&ctx, &plan, &store, params)? {
            RawResult::Cursor { reply, .. } => Ok(CursorBatch::from_reply(&reply).unwrap().documents),
            RawResult::Write { .. } => panic!("expected cursor"),
        }
    }

    fn run(sql: &str) -> Result<Vec<Document>> {
        run_with(sqlite_factory(), sql, &Parameters::None)
    }

    #[test]
    fn test_group_by_in_relational_engine() {
        let rows = run(
            "SELECT region, SUM(amount) AS total FROM (SELECT region, amount FROM orders) AS v GROUP BY region ORDER BY region",
        )
        .unwrap();
        assert_eq!(
            rows,
            vec![
                doc! { "region": "east", "total": 17 },
                doc! { "region": "west", "total": 5 },
            ]
        );
    }

    #[test]
    fn test_types_recovered() {
        let rows = run("SELECT placed FROM (SELECT placed, amount FROM orders WHERE amount > 6) v ORDER BY placed").unwrap();
        assert_eq!(
            rows,
            vec![
                doc! { "placed": DateTime::from_millis(1_700_000_000_000) },
                doc! { "placed": DateTime::from_millis(1_700_000_200_000) },
            ]
        );
    }

    #[test]
    fn test_aliased_columns_recover_source_type() {
        let rows = run("SELECT v.placed AS ts FROM (SELECT placed, amount FROM orders WHERE amount > 6) v ORDER BY ts").unwrap();
        assert_eq!(
            rows,
            vec![
                doc! { "ts": DateTime::from_millis(1_700_000_000_000) },
                doc! { "ts": DateTime::from_millis(1_700_000_200_000) },
            ]
        );

        let rows = run(
            "SELECT region, MAX(placed) AS latest, COUNT(*) AS n FROM (SELECT region, placed FROM orders) v GROUP BY region ORDER BY region",
        )
        .unwrap();
        assert_eq!(
            rows,
            vec![
                doc! { "region": "east", "latest": DateTime::from_millis(1_700_000_200_000), "n": 2 },
                doc! { "region": "west", "latest": DateTime::from_millis(1_700_000_100_000), "n": 1 },
            ]
        );
    }

    #[test]
    fn test_output_sources() {
        let sources = output_sources("SELECT a AS x, v.b AS y, MAX(c) AS z, SUM(d) AS w, e FROM \"v\"");
        assert_eq!(sources.get("x"), Some(&Some("a".to_string())));
        assert_eq!(sources.get("y"), Some(&Some("b".to_string())));
        assert_eq!(sources.get("z"), Some(&Some("c".to_string())));
        assert_eq!(sources.get("w"), Some(&None));
        assert_eq!(sources.get("e"), None);
        assert!(output_sources("not sql at all").is_empty());
    }

    #[test]
    fn test_default_table_name() {
        let rows = run("SELECT COUNT(*) AS n FROM (SELECT region FROM orders)").unwrap();
        assert_eq!(rows, vec![doc! { "n": 3 }]);
    }

    #[test]
    fn test_parameters_bind_inner_filter() {
        let rows = run_with(
            sqlite_factory(),
            "SELECT COUNT(*) AS n FROM (SELECT region FROM orders WHERE region = ?) v",
            &Parameters::positional(["east"]),
        )
        .unwrap();
        assert_eq!(rows, vec![doc! { "n": 2 }]);
    }

    #[test]
    fn test_empty_inner_result() {
        let rows = run("SELECT COUNT(*) AS n FROM (SELECT region FROM orders WHERE amount > 100) v").unwrap();
        assert_eq!(rows, vec![doc! { "n": 0 }]);
    }

    #[test]
    fn test_without_subquery_runs_natively() {
        let rows = run("SELECT region FROM orders WHERE amount = 5").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("region"), Some(&Bson::String("west".into())));
    }

    #[test]
    fn test_outer_sql_error_surfaces() {
        let err = run("SELECT nope FROM (SELECT region FROM orders) v").unwrap_err();
        assert!(matches!(err, Error::Bridge(BridgeError::Sqlite(_))));
    }

    struct Tracked {
        inner: SqliteEngine,
        live: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl RelationalEngine for Tracked {
        fn create_table(&mut self, name: &str, columns: &[ColumnDef]) -> std::result::Result<(), BridgeError> {
            self.inner.create_table(name, columns)
        }

        fn bulk_insert(
            &mut self,
            table: &str,
            columns: &[ColumnDef],
            rows: &[Vec<Cell>],
        ) -> std::result::Result<usize, BridgeError> {
            self.inner.bulk_insert(table, columns, rows)
        }

        fn query(&mut self, sql: &str) -> std::result::Result<RelationalRows, BridgeError> {
            self.inner.query(sql)
        }
    }

    #[test]
    fn test_engine_released_on_every_path() {
        let live = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));
        let factory: EngineFactory = {
            let live = Arc::clone(&live);
            let created = Arc::clone(&created);
            Arc::new(move || {
                live.fetch_add(1, Ordering::SeqCst);
                created.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(Tracked {
                    inner: SqliteEngine::open_in_memory()?,
                    live: Arc::clone(&live),
                }) as Box<dyn RelationalEngine>)
            })
        };

        run_with(factory.clone(), "SELECT COUNT(*) FROM (SELECT region FROM orders) v", &Parameters::None).unwrap();
        run_with(factory, "SELECT broken FROM (SELECT region FROM orders) v", &Parameters::None).unwrap_err();

        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_supports() {
        let bridge = bridge(sqlite_factory());
        assert!(bridge.supports(&ExecutionContext::new("SELECT 1", ExecutionMode::TwoStage)));
        assert!(!bridge.supports(&ExecutionContext::new("SELECT 1", ExecutionMode::Standard)));
        assert!(!bridge.supports(&ExecutionContext::new("DELETE FROM t", ExecutionMode::TwoStage)));
        assert!(!bridge.supports(&ExecutionContext::new(
            "SELECT * FROM t.aggregate('[]', '{}')",
            ExecutionMode::TwoStage
        )));
    }
}
