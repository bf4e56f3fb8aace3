use bson::{doc, Document};
use std::sync::Arc;

use super::{apply_window, drain_reply, AggregateStrategy, ExecutionContext, ExecutionStrategy, RawResult};
use crate::error::{Error, Result};
use crate::query::{ExecutionPlan, Parameters, QueryPlan, Substitution};
use crate::result::RowShape;
use crate::storage::{check_reply, DocumentStore};

/// Native `find` command for plain SELECT statements
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardFind;

/// Build the `find` command for a plan, with placeholders in the filter bound
pub(crate) fn find_command(
    plan: &QueryPlan,
    params: &Parameters,
    batch_size: Option<u32>,
) -> Result<Document> {
    let filter = Substitution::new(params).apply_document(plan.filter())?;
    Ok(bound_find_command(plan, filter, batch_size))
}

fn bound_find_command(plan: &QueryPlan, filter: Document, batch_size: Option<u32>) -> Document {
    let mut command = doc! {
        "find": plan.collection(),
        "filter": filter,
    };
    if !plan.projection().is_empty() {
        command.insert("projection", plan.projection().clone());
    }
    if !plan.sort().is_empty() {
        command.insert("sort", plan.sort_document());
    }
    if let Some(skip) = plan.skip() {
        command.insert("skip", skip as i64);
    }
    if let Some(limit) = plan.limit() {
        command.insert("limit", limit as i64);
    }
    if let Some(size) = batch_size {
        command.insert("batchSize", size as i64);
    }
    command
}

/// Run a query plan natively, routing aggregate plans to the aggregate strategy
pub(crate) fn run_query_plan(
    ctx: &ExecutionContext<'_>,
    plan: &QueryPlan,
    store: &Arc<dyn DocumentStore>,
    params: &Parameters,
) -> Result<RawResult> {
    if plan.is_aggregate() {
        return AggregateStrategy.run(ctx, plan, store, params);
    }
    if plan.staged_subquery().is_some() {
        return run_staged(ctx, plan, store, params);
    }

    let command = find_command(plan, params, ctx.batch_size)?;
    tracing::debug!(command = %command, "sending find");
    let reply = check_reply(store.run_command(command, ctx.session)?)?;
    Ok(RawResult::Cursor {
        reply,
        shape: RowShape::from_plan(plan),
    })
}

/// A FROM subquery with its own LIMIT/OFFSET runs first; the outer WHERE,
/// ORDER BY and window then apply to its shaped rows.
fn run_staged(
    ctx: &ExecutionContext<'_>,
    plan: &QueryPlan,
    store: &Arc<dyn DocumentStore>,
    params: &Parameters,
) -> Result<RawResult> {
    // inner placeholders precede outer ones in the statement text
    let mut substitution = Substitution::new(params);
    let (namespace, rows) = staged_rows(ctx, plan, store, &mut substitution)?;
    tracing::debug!(namespace = %namespace, rows = rows.len(), "staged subquery complete");

    let reply = doc! {
        "cursor": {
            "id": 0_i64,
            "ns": namespace,
            "firstBatch": rows,
        },
        "ok": 1.0,
    };
    Ok(RawResult::Cursor {
        reply,
        shape: RowShape::passthrough(),
    })
}

fn staged_rows(
    ctx: &ExecutionContext<'_>,
    plan: &QueryPlan,
    store: &Arc<dyn DocumentStore>,
    substitution: &mut Substitution<'_>,
) -> Result<(String, Vec<Document>)> {
    let (namespace, documents) = match plan.staged_subquery() {
        Some(inner) => {
            let (namespace, source) = staged_rows(ctx, inner, store, substitution)?;
            let filter = substitution.apply_document(plan.filter())?;
            (namespace, apply_window(source, &filter, plan)?)
        }
        None => {
            let filter = substitution.apply_document(plan.filter())?;
            let command = bound_find_command(plan, filter, ctx.batch_size);
            tracing::debug!(command = %command, "sending find for staged subquery");
            let reply = check_reply(store.run_command(command, ctx.session)?)?;
            drain_reply(ctx, store, &reply)?
        }
    };
    let shape = RowShape::from_plan(plan);
    Ok((namespace, documents.into_iter().map(|d| shape.apply(d)).collect()))
}

impl ExecutionStrategy for StandardFind {
    fn name(&self) -> &'static str {
        "standard_find"
    }

    fn supports(&self, ctx: &ExecutionContext<'_>) -> bool {
        ctx.is_select()
    }

    fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        plan: &ExecutionPlan,
        store: &Arc<dyn DocumentStore>,
        params: &Parameters,
    ) -> Result<RawResult> {
        match plan {
            ExecutionPlan::Query(plan) => run_query_plan(ctx, plan, store, params),
            other => Err(Error::Programming(format!(
                "find cannot execute a {} plan",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionMode;
    use crate::query::{compile, ParameterError};
    use crate::storage::{CursorBatch, MemoryStore, Session};
    use bson::Bson;

    fn store() -> Arc<dyn DocumentStore> {
        let store = MemoryStore::new("db");
        store.seed(
            "users",
            vec![
                doc! { "name": "ada", "age": 36 },
                doc! { "name": "bob", "age": 41 },
                doc! { "name": "cy", "age": 17 },
            ],
        );
        Arc::new(store)
    }

    fn query_plan(sql: &str) -> QueryPlan {
        match compile(sql).unwrap() {
            ExecutionPlan::Query(plan) => plan,
            other => panic!("expected query plan, got {}", other.kind()),
        }
    }

    #[test]
    fn test_find_command_shape() {
        let plan = query_plan("SELECT name FROM users WHERE age > 18 ORDER BY age DESC LIMIT 5 OFFSET 1");
        let command = find_command(&plan, &Parameters::None, Some(2)).unwrap();
        assert_eq!(
            command,
            doc! {
                "find": "users",
                "filter": { "age": { "$gt": 18 } },
                "projection": { "name": 1 },
                "sort": { "age": -1 },
                "skip": 1_i64,
                "limit": 5_i64,
                "batchSize": 2_i64,
            }
        );
    }

    #[test]
    fn test_find_command_omits_empty_parts() {
        let plan = query_plan("SELECT * FROM users");
        let command = find_command(&plan, &Parameters::None, None).unwrap();
        assert_eq!(command, doc! { "find": "users", "filter": {} });
    }

    #[test]
    fn test_execute_binds_parameters() {
        let store = store();
        let sql = "SELECT name FROM users WHERE age > ?";
        let plan = compile(sql).unwrap();
        let ctx = ExecutionContext::new(sql, ExecutionMode::Standard);
        let raw = StandardFind
            .execute(&ctx, &plan, &store, &Parameters::positional([30]))
            .unwrap();

        let RawResult::Cursor { reply, .. } = raw else {
            panic!("expected cursor");
        };
        let batch = CursorBatch::from_reply(&reply).unwrap();
        let names: Vec<_> = batch.documents.iter().map(|d| d.get("name").cloned()).collect();
        assert_eq!(
            names,
            vec![Some(Bson::String("ada".into())), Some(Bson::String("bob".into()))]
        );
    }

    #[test]
    fn test_missing_parameter() {
        let store = store();
        let sql = "SELECT * FROM users WHERE age > ?";
        let plan = compile(sql).unwrap();
        let ctx = ExecutionContext::new(sql, ExecutionMode::Standard);
        let err = StandardFind
            .execute(&ctx, &plan, &store, &Parameters::None)
            .unwrap_err();
        assert!(matches!(err, Error::Parameter(ParameterError::Count { .. })));
    }

    fn run_rows(store: &Arc<dyn DocumentStore>, sql: &str, params: &Parameters) -> Vec<Document> {
        let ctx = ExecutionContext::new(sql, ExecutionMode::Standard);
        let raw = StandardFind
            .execute(&ctx, &compile(sql).unwrap(), store, params)
            .unwrap();
        let RawResult::Cursor { reply, shape } = raw else {
            panic!("expected cursor");
        };
        CursorBatch::from_reply(&reply)
            .unwrap()
            .documents
            .into_iter()
            .map(|d| shape.apply(d))
            .collect()
    }

    #[test]
    fn test_quoted_marker_text_is_a_value() {
        let memory = MemoryStore::new("db");
        memory.seed("t", vec![doc! { "name": "ask", "q": "?" }, doc! { "name": "bind", "q": ":x" }]);
        let store: Arc<dyn DocumentStore> = Arc::new(memory);

        let rows = run_rows(&store, "SELECT name FROM t WHERE q = '?'", &Parameters::None);
        assert_eq!(rows, vec![doc! { "name": "ask" }]);
        let rows = run_rows(&store, "SELECT name FROM t WHERE q = ':x'", &Parameters::None);
        assert_eq!(rows, vec![doc! { "name": "bind" }]);
    }

    #[test]
    fn test_like_parameter_is_a_pattern() {
        let store = store();
        let rows = run_rows(&store, "SELECT name FROM users WHERE name LIKE ?", &Parameters::positional(["a%"]));
        assert_eq!(rows, vec![doc! { "name": "ada" }]);

        let rows = run_rows(
            &store,
            "SELECT name FROM users WHERE name NOT LIKE :p ORDER BY name",
            &Parameters::named([("p", "_o_")]),
        );
        assert_eq!(rows, vec![doc! { "name": "ada" }, doc! { "name": "cy" }]);
    }

    fn windowed_store() -> Arc<dyn DocumentStore> {
        let store = MemoryStore::new("db").with_default_batch_size(1);
        store.seed(
            "t",
            vec![
                doc! { "name": "ada", "qty": 3 },
                doc! { "name": "bob", "qty": 1 },
                doc! { "name": "cy", "qty": 8 },
            ],
        );
        Arc::new(store)
    }

    #[test]
    fn test_inner_limit_applies_before_outer_filter() {
        let store = windowed_store();
        let sql = "SELECT * FROM (SELECT name, qty FROM t LIMIT 2) v WHERE v.qty > 4";
        assert!(run_rows(&store, sql, &Parameters::None).is_empty());

        let sql = "SELECT * FROM (SELECT name, qty FROM t LIMIT 2) v WHERE v.qty > 2";
        assert_eq!(run_rows(&store, sql, &Parameters::None), vec![doc! { "name": "ada", "qty": 3 }]);
    }

    #[test]
    fn test_outer_sort_over_inner_window() {
        let store = windowed_store();
        let sql = "SELECT v.name FROM (SELECT name, qty FROM t ORDER BY qty LIMIT 2) v ORDER BY v.name DESC";
        assert_eq!(
            run_rows(&store, sql, &Parameters::None),
            vec![doc! { "name": "bob" }, doc! { "name": "ada" }]
        );
    }

    #[test]
    fn test_staged_parameters_bind_inner_first() {
        let store = windowed_store();
        let sql = "SELECT name FROM (SELECT name, qty FROM t WHERE qty < ? LIMIT 2) v WHERE v.name <> ?";
        let rows = run_rows(&store, sql, &Parameters::positional([Bson::Int32(9), Bson::from("ada")]));
        assert_eq!(rows, vec![doc! { "name": "bob" }]);
    }

    #[test]
    fn test_session_travels_with_command() {
        let memory = Arc::new(MemoryStore::new("db"));
        let store: Arc<dyn DocumentStore> = memory.clone();
        let session = Session::new("s-1");
        let sql = "SELECT * FROM users";
        let ctx = ExecutionContext::new(sql, ExecutionMode::Standard).with_session(Some(&session));
        StandardFind
            .execute(&ctx, &compile(sql).unwrap(), &store, &Parameters::None)
            .unwrap();

        let last = memory.command_history().pop().unwrap();
        assert_eq!(last.get_document("lsid").unwrap(), &doc! { "id": "s-1" });
    }

    #[test]
    fn test_rejects_write_plans() {
        let store = store();
        let sql = "DELETE FROM users";
        let ctx = ExecutionContext::new(sql, ExecutionMode::Standard);
        let err = StandardFind
            .execute(&ctx, &compile(sql).unwrap(), &store, &Parameters::None)
            .unwrap_err();
        assert!(matches!(err, Error::Programming(_)));
    }
}
