use bson::{doc, Bson, Document};
use std::sync::Arc;

use super::{aggregate_call_re, apply_window, drain_reply, ExecutionContext, ExecutionStrategy, RawResult};
use crate::error::{Error, Result};
use crate::query::{ExecutionPlan, Parameters, ParseError, QueryPlan, Substitution};
use crate::result::RowShape;
use crate::storage::DocumentStore;

/// `SELECT ... FROM [collection.]aggregate('<pipeline>', '<options>')`
///
/// The pipeline runs in the store. WHERE, ORDER BY, OFFSET and LIMIT of the
/// surrounding SELECT are applied to the materialized output.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateStrategy;

fn parse_json(text: &str, what: &str) -> Result<Bson> {
    let json: serde_json::Value = serde_json::from_str(text).map_err(|e| {
        Error::Parse(ParseError::InvalidAggregateCall(format!("{} is not valid JSON: {}", what, e)))
    })?;
    Bson::try_from(json).map_err(|e| {
        Error::Parse(ParseError::InvalidAggregateCall(format!("{}: {}", what, e)))
    })
}

/// Pipeline JSON: an array of stage objects
pub(crate) fn parse_pipeline(text: &str) -> Result<Vec<Document>> {
    match parse_json(text, "pipeline")? {
        Bson::Array(stages) => stages
            .into_iter()
            .map(|stage| match stage {
                Bson::Document(stage) => Ok(stage),
                other => Err(Error::Parse(ParseError::InvalidAggregateCall(format!(
                    "pipeline stage must be an object, got {}",
                    other
                )))),
            })
            .collect(),
        Bson::Document(stage) => Ok(vec![stage]),
        other => Err(Error::Parse(ParseError::InvalidAggregateCall(format!(
            "pipeline must be an array, got {}",
            other
        )))),
    }
}

/// Options JSON: an object, empty text meaning no options
pub(crate) fn parse_options(text: &str) -> Result<Document> {
    if text.trim().is_empty() {
        return Ok(Document::new());
    }
    match parse_json(text, "options")? {
        Bson::Document(options) => Ok(options),
        other => Err(Error::Parse(ParseError::InvalidAggregateCall(format!(
            "options must be an object, got {}",
            other
        )))),
    }
}

impl AggregateStrategy {
    pub(crate) fn run(
        &self,
        ctx: &ExecutionContext<'_>,
        plan: &QueryPlan,
        store: &Arc<dyn DocumentStore>,
        params: &Parameters,
    ) -> Result<RawResult> {
        let pipeline = parse_pipeline(plan.aggregate_pipeline().unwrap_or("[]"))?;
        let options = parse_options(plan.aggregate_options().unwrap_or("{}"))?;
        let collection = (!plan.collection().is_empty()).then_some(plan.collection());
        tracing::debug!(
            collection = collection.unwrap_or("<database>"),
            stages = pipeline.len(),
            "running aggregate"
        );

        let reply = store.aggregate(collection, pipeline, options, ctx.session)?;
        let (namespace, documents) = drain_reply(ctx, store, &reply)?;

        let filter = Substitution::new(params).apply_document(plan.filter())?;
        let rows = apply_window(documents, &filter, plan)?;

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
            shape: RowShape::from_plan(plan),
        })
    }
}

impl ExecutionStrategy for AggregateStrategy {
    fn name(&self) -> &'static str {
        "aggregate"
    }

    fn supports(&self, ctx: &ExecutionContext<'_>) -> bool {
        ctx.is_select() && aggregate_call_re().is_match(ctx.query)
    }

    fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        plan: &ExecutionPlan,
        store: &Arc<dyn DocumentStore>,
        params: &Parameters,
    ) -> Result<RawResult> {
        match plan {
            ExecutionPlan::Query(plan) if plan.is_aggregate() => self.run(ctx, plan, store, params),
            ExecutionPlan::Query(_) => Err(Error::Programming(
                "aggregate strategy needs an aggregate() FROM clause".to_string(),
            )),
            other => Err(Error::Programming(format!(
                "aggregate strategy cannot execute a {} plan",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionMode;
    use crate::query::{compile, MatchError};
    use crate::storage::{CursorBatch, MemoryStore, StoreError};

    fn store() -> Arc<dyn DocumentStore> {
        let store = MemoryStore::new("db").with_default_batch_size(2);
        store.seed(
            "orders",
            vec![
                doc! { "region": "east", "amount": 10 },
                doc! { "region": "west", "amount": 5 },
                doc! { "region": "east", "amount": 7 },
                doc! { "region": "north", "amount": 1 },
                doc! { "region": "west", "amount": 2 },
            ],
        );
        Arc::new(store)
    }

    fn run(sql: &str, params: &Parameters) -> Result<Vec<Document>> {
        let store = store();
        let ctx = ExecutionContext::new(sql, ExecutionMode::Standard);
        let plan = compile(sql).unwrap();
        match AggregateStrategy.execute(&ctx, &plan, &store, params)? {
            RawResult::Cursor { reply, .. } => Ok(CursorBatch::from_reply(&reply).unwrap().documents),
            RawResult::Write { .. } => panic!("expected cursor"),
        }
    }

    #[test]
    fn test_parse_pipeline() {
        let stages = parse_pipeline(r#"[{"$match": {"a": 1}}, {"$limit": 2}]"#).unwrap();
        assert_eq!(stages, vec![doc! { "$match": { "a": 1 } }, doc! { "$limit": 2 }]);
        assert!(parse_pipeline("[1]").is_err());
        assert!(matches!(
            parse_pipeline("not json"),
            Err(Error::Parse(ParseError::InvalidAggregateCall(_)))
        ));
        assert!(parse_options("").unwrap().is_empty());
        assert!(parse_options("[]").is_err());
    }

    #[test]
    fn test_group_then_sort_in_memory() {
        let sql = r#"SELECT * FROM orders.aggregate('[{"$group": {"_id": "$region", "total": {"$sum": "$amount"}}}]', '{}') ORDER BY total DESC"#;
        let rows = run(sql, &Parameters::None).unwrap();
        assert_eq!(
            rows,
            vec![
                doc! { "_id": "east", "total": 17 },
                doc! { "_id": "west", "total": 7 },
                doc! { "_id": "north", "total": 1 },
            ]
        );
    }

    #[test]
    fn test_residual_filter_and_window() {
        let sql = r#"SELECT * FROM orders.aggregate('[{"$project": {"_id": 0, "region": 1, "amount": 1}}]', '{}') WHERE amount > ? ORDER BY amount LIMIT 2 OFFSET 1"#;
        let rows = run(sql, &Parameters::positional([1])).unwrap();
        assert_eq!(
            rows,
            vec![
                doc! { "region": "west", "amount": 5 },
                doc! { "region": "east", "amount": 7 },
            ]
        );
    }

    #[test]
    fn test_unsupported_residual_operator() {
        let sql = r#"SELECT * FROM orders.aggregate('[]', '{}') WHERE amount = ?"#;
        let err = run(sql, &Parameters::positional([doc! { "$near": 1 }])).unwrap_err();
        assert!(matches!(
            err,
            Error::Match(MatchError::UnsupportedOperator(ref op)) if op == "$near"
        ));
    }

    #[test]
    fn test_drains_every_batch() {
        let sql = r#"SELECT * FROM orders.aggregate('[]', '{}')"#;
        assert_eq!(run(sql, &Parameters::None).unwrap().len(), 5);
    }

    #[test]
    fn test_database_level_aggregate_rejected_by_memory_store() {
        let sql = r#"SELECT * FROM aggregate('[{"$currentOp": {}}]', '{}')"#;
        let err = run(sql, &Parameters::None).unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::CommandFailed { code: 115, .. })
        ));
    }

    #[test]
    fn test_plain_select_is_a_programming_error() {
        let err = run("SELECT * FROM orders", &Parameters::None).unwrap_err();
        assert!(matches!(err, Error::Programming(_)));
    }
}
