use bson::{doc, Bson, Document};
use std::sync::Arc;

use super::{ExecutionContext, ExecutionStrategy, RawResult};
use crate::error::{Error, Result};
use crate::query::{DeletePlan, ExecutionPlan, InsertPlan, Parameters, Substitution, UpdatePlan};
use crate::storage::{check_reply, DocumentStore};

/// `n` from a write acknowledgement
fn affected_count(reply: &Document) -> u64 {
    match reply.get("n") {
        Some(Bson::Int32(n)) => (*n).max(0) as u64,
        Some(Bson::Int64(n)) => (*n).max(0) as u64,
        Some(Bson::Double(n)) if *n > 0.0 => *n as u64,
        _ => 0,
    }
}

fn send_write(
    ctx: &ExecutionContext<'_>,
    store: &Arc<dyn DocumentStore>,
    command: Document,
) -> Result<RawResult> {
    tracing::debug!(command = %command, "sending write");
    let reply = check_reply(store.run_command(command, ctx.session)?)?;
    let affected = affected_count(&reply);
    Ok(RawResult::Write { reply, affected })
}

fn wrong_plan(strategy: &str, plan: &ExecutionPlan) -> Error {
    Error::Programming(format!(
        "{} strategy cannot execute a {} plan",
        strategy,
        plan.kind()
    ))
}

pub(crate) fn insert_command(plan: &InsertPlan, params: &Parameters) -> Result<Document> {
    let mut substitution = Substitution::new(params);
    let documents = plan
        .documents()
        .iter()
        .map(|d| substitution.apply_document(d))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(doc! {
        "insert": plan.collection(),
        "documents": documents,
    })
}

pub(crate) fn update_command(plan: &UpdatePlan, params: &Parameters) -> Result<Document> {
    // SET placeholders come before WHERE placeholders in statement order
    let mut substitution = Substitution::new(params);
    let fields = substitution.apply_document(plan.update_fields())?;
    let filter = substitution.apply_document(plan.filter())?;
    Ok(doc! {
        "update": plan.collection(),
        "updates": [
            {
                "q": filter,
                "u": { "$set": fields },
                "multi": true,
                "upsert": false,
            }
        ],
    })
}

pub(crate) fn delete_command(plan: &DeletePlan, params: &Parameters) -> Result<Document> {
    let filter = Substitution::new(params).apply_document(plan.filter())?;
    Ok(doc! {
        "delete": plan.collection(),
        "deletes": [ { "q": filter, "limit": 0 } ],
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InsertStrategy;

impl ExecutionStrategy for InsertStrategy {
    fn name(&self) -> &'static str {
        "insert"
    }

    fn supports(&self, ctx: &ExecutionContext<'_>) -> bool {
        ctx.leading_keyword() == "INSERT"
    }

    fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        plan: &ExecutionPlan,
        store: &Arc<dyn DocumentStore>,
        params: &Parameters,
    ) -> Result<RawResult> {
        match plan {
            ExecutionPlan::Insert(insert) => send_write(ctx, store, insert_command(insert, params)?),
            other => Err(wrong_plan(self.name(), other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateStrategy;

impl ExecutionStrategy for UpdateStrategy {
    fn name(&self) -> &'static str {
        "update"
    }

    fn supports(&self, ctx: &ExecutionContext<'_>) -> bool {
        ctx.leading_keyword() == "UPDATE"
    }

    fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        plan: &ExecutionPlan,
        store: &Arc<dyn DocumentStore>,
        params: &Parameters,
    ) -> Result<RawResult> {
        match plan {
            ExecutionPlan::Update(update) => send_write(ctx, store, update_command(update, params)?),
            other => Err(wrong_plan(self.name(), other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteStrategy;

impl ExecutionStrategy for DeleteStrategy {
    fn name(&self) -> &'static str {
        "delete"
    }

    fn supports(&self, ctx: &ExecutionContext<'_>) -> bool {
        ctx.leading_keyword() == "DELETE"
    }

    fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        plan: &ExecutionPlan,
        store: &Arc<dyn DocumentStore>,
        params: &Parameters,
    ) -> Result<RawResult> {
        match plan {
            ExecutionPlan::Delete(delete) => send_write(ctx, store, delete_command(delete, params)?),
            other => Err(wrong_plan(self.name(), other)),
        }
    }
}
