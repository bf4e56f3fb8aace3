use bson::{doc, Bson, Document};
use serde::Serialize;
use std::collections::HashMap;

use super::functions::ProjectionCall;
use super::params::ParameterStyle;

/// Validated, immutable plan for one SQL statement
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionPlan {
    Query(QueryPlan),
    Insert(InsertPlan),
    Update(UpdatePlan),
    Delete(DeletePlan),
}

impl ExecutionPlan {
    pub fn collection(&self) -> &str {
        match self {
            ExecutionPlan::Query(p) => &p.collection,
            ExecutionPlan::Insert(p) => &p.collection,
            ExecutionPlan::Update(p) => &p.collection,
            ExecutionPlan::Delete(p) => &p.collection,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionPlan::Query(_) => "query",
            ExecutionPlan::Insert(_) => "insert",
            ExecutionPlan::Update(_) => "update",
            ExecutionPlan::Delete(_) => "delete",
        }
    }

    /// Document rendering for logging and explain output
    pub fn to_document(&self) -> Document {
        match self {
            ExecutionPlan::Query(p) => p.to_document(),
            ExecutionPlan::Insert(p) => doc! {
                "collection": p.collection.as_str(),
                "documents": p.documents.clone(),
                "parameter_style": p.parameter_style.map(|s| s.as_str()),
                "parameter_count": p.parameter_count as i64,
            },
            ExecutionPlan::Update(p) => doc! {
                "collection": p.collection.as_str(),
                "update_fields": p.update_fields.clone(),
                "filter": p.filter.clone(),
                "parameter_style": p.parameter_style.map(|s| s.as_str()),
            },
            ExecutionPlan::Delete(p) => doc! {
                "collection": p.collection.as_str(),
                "filter": p.filter.clone(),
            },
        }
    }
}

/// Sort key with direction 1 (ascending) or -1 (descending)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SortKey {
    pub field: String,
    pub direction: i32,
}

/// One SELECT-list column: the field it reads and the name it is returned under
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnAlias {
    pub field: String,
    pub alias: String,
}

impl ColumnAlias {
    pub fn new(field: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            alias: alias.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub(crate) collection: String,
    pub(crate) filter: Document,
    pub(crate) projection: Document,
    pub(crate) column_aliases: Vec<ColumnAlias>,
    pub(crate) projection_functions: HashMap<String, ProjectionCall>,
    pub(crate) sort: Vec<SortKey>,
    pub(crate) limit: Option<u64>,
    pub(crate) skip: Option<u64>,
    pub(crate) is_aggregate: bool,
    pub(crate) aggregate_pipeline: Option<String>,
    pub(crate) aggregate_options: Option<String>,
    pub(crate) subquery_plan: Option<Box<QueryPlan>>,
    pub(crate) subquery_alias: Option<String>,
    /// The subquery runs first and this plan's clauses apply to its rows
    pub(crate) staged_subquery: bool,
}

impl QueryPlan {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn filter(&self) -> &Document {
        &self.filter
    }

    /// Field → 1/0 inclusion map, in SELECT order. Empty means all fields.
    pub fn projection(&self) -> &Document {
        &self.projection
    }

    /// Output columns in SELECT order; a field may appear under several names
    pub fn column_aliases(&self) -> &[ColumnAlias] {
        &self.column_aliases
    }

    /// Output name of the first column reading `field`
    pub fn alias_of(&self, field: &str) -> Option<&str> {
        self.column_aliases
            .iter()
            .find(|c| c.field == field)
            .map(|c| c.alias.as_str())
    }

    /// Projection functions keyed by output column name
    pub fn projection_functions(&self) -> &HashMap<String, ProjectionCall> {
        &self.projection_functions
    }

    pub fn sort(&self) -> &[SortKey] {
        &self.sort
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn skip(&self) -> Option<u64> {
        self.skip
    }

    pub fn is_aggregate(&self) -> bool {
        self.is_aggregate
    }

    pub fn aggregate_pipeline(&self) -> Option<&str> {
        self.aggregate_pipeline.as_deref()
    }

    pub fn aggregate_options(&self) -> Option<&str> {
        self.aggregate_options.as_deref()
    }

    pub fn subquery_plan(&self) -> Option<&QueryPlan> {
        self.subquery_plan.as_deref()
    }

    pub fn subquery_alias(&self) -> Option<&str> {
        self.subquery_alias.as_deref()
    }

    /// Inner plan to run before this one, when the two could not be merged
    pub fn staged_subquery(&self) -> Option<&QueryPlan> {
        if self.staged_subquery {
            self.subquery_plan.as_deref()
        } else {
            None
        }
    }

    /// Sort as a native sort document
    pub fn sort_document(&self) -> Document {
        let mut sort = Document::new();
        for key in &self.sort {
            sort.insert(key.field.clone(), key.direction);
        }
        sort
    }

    /// Copy of this plan with a new filter, used after parameter substitution
    pub fn with_filter(&self, filter: Document) -> QueryPlan {
        QueryPlan {
            filter,
            ..self.clone()
        }
    }

    pub fn to_document(&self) -> Document {
        let aliases: Vec<Bson> = self
            .column_aliases
            .iter()
            .map(|c| Bson::Document(doc! { "field": c.field.as_str(), "alias": c.alias.as_str() }))
            .collect();
        doc! {
            "collection": self.collection.as_str(),
            "filter": self.filter.clone(),
            "projection": self.projection.clone(),
            "column_aliases": aliases,
            "sort": self.sort_document(),
            "limit": self.limit.map(|l| l as i64),
            "skip": self.skip.map(|s| s as i64),
            "is_aggregate": self.is_aggregate,
            "aggregate_pipeline": self.aggregate_pipeline.clone(),
            "aggregate_options": self.aggregate_options.clone(),
            "subquery_plan": self.subquery_plan.as_ref().map(|p| p.to_document()),
            "subquery_alias": self.subquery_alias.clone(),
            "staged_subquery": self.staged_subquery,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsertPlan {
    pub(crate) collection: String,
    pub(crate) documents: Vec<Document>,
    pub(crate) parameter_style: Option<ParameterStyle>,
    pub(crate) parameter_count: usize,
}

impl InsertPlan {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn parameter_style(&self) -> Option<ParameterStyle> {
        self.parameter_style
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdatePlan {
    pub(crate) collection: String,
    pub(crate) update_fields: Document,
    pub(crate) filter: Document,
    pub(crate) parameter_style: Option<ParameterStyle>,
}

impl UpdatePlan {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn update_fields(&self) -> &Document {
        &self.update_fields
    }

    pub fn filter(&self) -> &Document {
        &self.filter
    }

    pub fn parameter_style(&self) -> Option<ParameterStyle> {
        self.parameter_style
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletePlan {
    pub(crate) collection: String,
    pub(crate) filter: Document,
    pub(crate) parameter_style: Option<ParameterStyle>,
}

impl DeletePlan {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn filter(&self) -> &Document {
        &self.filter
    }

    pub fn parameter_style(&self) -> Option<ParameterStyle> {
        self.parameter_style
    }
}
