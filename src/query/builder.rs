//! Fluent plan builders.
//!
//! Setters never fail: they record validation errors and keep going, so a
//! caller sees every problem at once when [`QueryBuilder::build`] (or the
//! other builders' `build`) runs.

use bson::{Bson, Document};
use std::collections::HashMap;

use super::functions::ProjectionCall;
use super::params::ParameterStyle;
use super::plan::{ColumnAlias, DeletePlan, InsertPlan, QueryPlan, SortKey, UpdatePlan};

/// Input accepted by [`QueryBuilder::project`]
#[derive(Debug, Clone)]
pub enum ProjectionSpec {
    Fields(Vec<String>),
    Map(Document),
}

impl From<Vec<String>> for ProjectionSpec {
    fn from(fields: Vec<String>) -> Self {
        ProjectionSpec::Fields(fields)
    }
}

impl From<Vec<&str>> for ProjectionSpec {
    fn from(fields: Vec<&str>) -> Self {
        ProjectionSpec::Fields(fields.into_iter().map(String::from).collect())
    }
}

impl From<Document> for ProjectionSpec {
    fn from(map: Document) -> Self {
        ProjectionSpec::Map(map)
    }
}

fn validate_collection(name: &str, errors: &mut Vec<String>) -> Option<String> {
    if name.trim().is_empty() {
        errors.push("Collection name cannot be empty".to_string());
        None
    } else {
        Some(name.trim().to_string())
    }
}

fn as_integer(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(*v as i64),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i64),
        _ => None,
    }
}

/// Staging area for a [`QueryPlan`]
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    pub(crate) collection: Option<String>,
    pub(crate) filter: Document,
    pub(crate) projection: Document,
    pub(crate) column_aliases: Vec<ColumnAlias>,
    pub(crate) projection_functions: HashMap<String, ProjectionCall>,
    pub(crate) sort: Vec<SortKey>,
    pub(crate) limit: Option<u64>,
    pub(crate) skip: Option<u64>,
    pub(crate) is_aggregate: bool,
    aggregate_pipeline: Option<String>,
    aggregate_options: Option<String>,
    pub(crate) subquery_plan: Option<Box<QueryPlan>>,
    pub(crate) subquery_alias: Option<String>,
    pub(crate) staged_subquery: bool,
    errors: Vec<String>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(&mut self, name: &str) -> &mut Self {
        if let Some(name) = validate_collection(name, &mut self.errors) {
            self.collection = Some(name);
        }
        self
    }

    /// Merge top-level keys into the filter
    pub fn filter(&mut self, conditions: Document) -> &mut Self {
        for (key, value) in conditions {
            self.filter.insert(key, value);
        }
        self
    }

    pub fn project(&mut self, spec: impl Into<ProjectionSpec>) -> &mut Self {
        match spec.into() {
            ProjectionSpec::Fields(fields) => {
                for field in fields {
                    if field.trim().is_empty() {
                        self.errors.push("Projection field name cannot be empty".into());
                    } else {
                        self.projection.insert(field, 1);
                    }
                }
            }
            ProjectionSpec::Map(map) => {
                for (field, value) in map {
                    match as_integer(&value) {
                        Some(flag @ (0 | 1)) => {
                            self.projection.insert(field, flag as i32);
                        }
                        _ => self.errors.push(format!(
                            "Projection value for '{}' must be 1 or 0, got {}",
                            field, value
                        )),
                    }
                }
            }
        }
        self
    }

    /// Record output column `alias` reading `field`, in SELECT order
    pub fn alias(&mut self, field: &str, alias: &str) -> &mut Self {
        let column = ColumnAlias::new(field, alias);
        if !self.column_aliases.contains(&column) {
            self.column_aliases.push(column);
        }
        self
    }

    /// Record a projection function producing output column `output`
    pub fn projection_function(&mut self, output: &str, call: ProjectionCall) -> &mut Self {
        self.projection_functions.insert(output.to_string(), call);
        self
    }

    /// Append sort keys, each a single-key `{field: 1 | -1}` document
    pub fn sort(&mut self, entries: Vec<Document>) -> &mut Self {
        for entry in entries {
            if entry.len() != 1 {
                self.errors.push(format!(
                    "Sort specification must be a single-key document, got {} keys",
                    entry.len()
                ));
                continue;
            }
            for (field, direction) in entry {
                match as_integer(&direction) {
                    Some(d @ (1 | -1)) => self.sort.push(SortKey {
                        field,
                        direction: d as i32,
                    }),
                    _ => self.errors.push(format!(
                        "Sort direction for '{}' must be 1 or -1, got {}",
                        field, direction
                    )),
                }
            }
        }
        self
    }

    pub fn limit(&mut self, count: i64) -> &mut Self {
        match u64::try_from(count) {
            Ok(count) => self.limit = Some(count),
            Err(_) => self.errors.push(format!("Limit must be a non-negative integer, got {}", count)),
        }
        self
    }

    pub fn skip(&mut self, count: i64) -> &mut Self {
        match u64::try_from(count) {
            Ok(count) => self.skip = Some(count),
            Err(_) => self.errors.push(format!("Skip must be a non-negative integer, got {}", count)),
        }
        self
    }

    /// Mark as an aggregate call with JSON pipeline and options text
    pub fn aggregate(&mut self, pipeline: String, options: String) -> &mut Self {
        self.is_aggregate = true;
        self.aggregate_pipeline = Some(pipeline);
        self.aggregate_options = Some(options);
        self
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn validate(&self) -> bool {
        self.errors.is_empty() && (self.collection.is_some() || self.is_aggregate)
    }

    pub fn build(&self) -> Result<QueryPlan, BuildError> {
        let mut errors = self.errors.clone();
        if self.collection.is_none() && !self.is_aggregate {
            errors.push("Collection name is required".into());
        }
        if !errors.is_empty() {
            return Err(BuildError::Invalid(errors));
        }

        Ok(QueryPlan {
            collection: self.collection.clone().unwrap_or_default(),
            filter: self.filter.clone(),
            projection: self.projection.clone(),
            column_aliases: self.column_aliases.clone(),
            projection_functions: self.projection_functions.clone(),
            sort: self.sort.clone(),
            limit: self.limit,
            skip: self.skip,
            is_aggregate: self.is_aggregate,
            aggregate_pipeline: self.aggregate_pipeline.clone(),
            aggregate_options: self.aggregate_options.clone(),
            subquery_plan: self.subquery_plan.clone(),
            subquery_alias: self.subquery_alias.clone(),
            staged_subquery: self.staged_subquery,
        })
    }
}

/// Staging area for an [`InsertPlan`]
#[derive(Debug, Clone, Default)]
pub struct InsertBuilder {
    collection: Option<String>,
    documents: Vec<Document>,
    parameter_style: Option<ParameterStyle>,
    parameter_count: usize,
    errors: Vec<String>,
}

impl InsertBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(&mut self, name: &str) -> &mut Self {
        if let Some(name) = validate_collection(name, &mut self.errors) {
            self.collection = Some(name);
        }
        self
    }

    pub fn insert_documents(&mut self, documents: Vec<Document>) -> &mut Self {
        if documents.is_empty() {
            self.errors.push("At least one document must be provided".into());
        } else {
            self.documents.extend(documents);
        }
        self
    }

    pub fn parameter_style(&mut self, style: Option<ParameterStyle>, count: usize) -> &mut Self {
        self.parameter_style = style;
        self.parameter_count = count;
        self
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn build(&self) -> Result<InsertPlan, BuildError> {
        let mut errors = self.errors.clone();
        if self.collection.is_none() {
            errors.push("Collection name is required".into());
        }
        if self.documents.is_empty() && !errors.iter().any(|e| e.contains("document")) {
            errors.push("At least one document must be provided".into());
        }
        if !errors.is_empty() {
            return Err(BuildError::Invalid(errors));
        }

        Ok(InsertPlan {
            collection: self.collection.clone().unwrap_or_default(),
            documents: self.documents.clone(),
            parameter_style: self.parameter_style,
            parameter_count: self.parameter_count,
        })
    }
}

/// Staging area for an [`UpdatePlan`]
#[derive(Debug, Clone, Default)]
pub struct UpdateBuilder {
    collection: Option<String>,
    update_fields: Document,
    filter: Document,
    parameter_style: Option<ParameterStyle>,
    errors: Vec<String>,
}

impl UpdateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(&mut self, name: &str) -> &mut Self {
        if let Some(name) = validate_collection(name, &mut self.errors) {
            self.collection = Some(name);
        }
        self
    }

    pub fn update_fields(&mut self, fields: Document) -> &mut Self {
        for (key, value) in fields {
            if key.trim().is_empty() {
                self.errors.push("Update field name cannot be empty".into());
            } else {
                self.update_fields.insert(key, value);
            }
        }
        self
    }

    /// An empty filter is valid and matches every document
    pub fn filter_conditions(&mut self, conditions: Document) -> &mut Self {
        for (key, value) in conditions {
            self.filter.insert(key, value);
        }
        self
    }

    pub fn parameter_style(&mut self, style: Option<ParameterStyle>) -> &mut Self {
        self.parameter_style = style;
        self
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn build(&self) -> Result<UpdatePlan, BuildError> {
        let mut errors = self.errors.clone();
        if self.collection.is_none() {
            errors.push("Collection name is required".into());
        }
        if self.update_fields.is_empty() {
            errors.push("At least one field must be set".into());
        }
        if !errors.is_empty() {
            return Err(BuildError::Invalid(errors));
        }

        Ok(UpdatePlan {
            collection: self.collection.clone().unwrap_or_default(),
            update_fields: self.update_fields.clone(),
            filter: self.filter.clone(),
            parameter_style: self.parameter_style,
        })
    }
}

/// Staging area for a [`DeletePlan`]
#[derive(Debug, Clone, Default)]
pub struct DeleteBuilder {
    collection: Option<String>,
    filter: Document,
    parameter_style: Option<ParameterStyle>,
    errors: Vec<String>,
}

impl DeleteBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(&mut self, name: &str) -> &mut Self {
        if let Some(name) = validate_collection(name, &mut self.errors) {
            self.collection = Some(name);
        }
        self
    }

    /// An empty filter is valid and deletes every document
    pub fn filter_conditions(&mut self, conditions: Document) -> &mut Self {
        for (key, value) in conditions {
            self.filter.insert(key, value);
        }
        self
    }

    pub fn parameter_style(&mut self, style: Option<ParameterStyle>) -> &mut Self {
        self.parameter_style = style;
        self
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn build(&self) -> Result<DeletePlan, BuildError> {
        let mut errors = self.errors.clone();
        if self.collection.is_none() {
            errors.push("Collection name is required".into());
        }
        if !errors.is_empty() {
            return Err(BuildError::Invalid(errors));
        }

        Ok(DeletePlan {
            collection: self.collection.clone().unwrap_or_default(),
            filter: self.filter.clone(),
            parameter_style: self.parameter_style,
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("Invalid execution plan: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_query_builder() {
        let plan = QueryBuilder::new()
            .collection("users")
            .filter(doc! { "age": { "$gt": 18 } })
            .project(vec!["name", "email"])
            .sort(vec![doc! { "name": 1 }, doc! { "age": -1 }])
            .limit(10)
            .skip(5)
            .build()
            .unwrap();

        assert_eq!(plan.collection(), "users");
        assert_eq!(plan.projection(), &doc! { "name": 1, "email": 1 });
        assert_eq!(plan.sort_document(), doc! { "name": 1, "age": -1 });
        assert_eq!(plan.limit(), Some(10));
        assert_eq!(plan.skip(), Some(5));
    }

    #[test]
    fn test_aliases_keep_select_order() {
        let plan = QueryBuilder::new()
            .collection("users")
            .project(vec!["name"])
            .alias("name", "name")
            .alias("name", "shout")
            .alias("name", "shout")
            .build()
            .unwrap();
        assert_eq!(
            plan.column_aliases(),
            &[ColumnAlias::new("name", "name"), ColumnAlias::new("name", "shout")]
        );
        assert_eq!(plan.alias_of("name"), Some("name"));
    }

    #[test]
    fn test_filter_merges_keys() {
        let plan = QueryBuilder::new()
            .collection("users")
            .filter(doc! { "a": 1 })
            .filter(doc! { "b": 2 })
            .build()
            .unwrap();
        assert_eq!(plan.filter(), &doc! { "a": 1, "b": 2 });
    }

    #[test]
    fn test_errors_accumulate() {
        let mut builder = QueryBuilder::new();
        builder
            .collection("  ")
            .sort(vec![doc! { "a": 1, "b": 1 }, doc! { "c": 2 }])
            .limit(-1)
            .project(doc! { "x": 5 });
        assert_eq!(builder.errors().len(), 5);

        let err = builder.build().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cannot be empty"));
        assert!(message.contains("single-key document"));
        assert!(message.contains("must be 1 or -1"));
        assert!(message.contains("non-negative"));
        assert!(message.contains("Collection name is required"));
    }

    #[test]
    fn test_insert_builder() {
        let plan = InsertBuilder::new()
            .collection("users")
            .insert_documents(vec![doc! { "name": "ada" }])
            .build()
            .unwrap();
        assert_eq!(plan.documents().len(), 1);

        let err = InsertBuilder::new()
            .collection("users")
            .insert_documents(vec![])
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            BuildError::Invalid(vec!["At least one document must be provided".into()])
        );
    }

    #[test]
    fn test_update_requires_fields() {
        let err = UpdateBuilder::new().collection("users").build().unwrap_err();
        assert!(err.to_string().contains("At least one field"));

        let plan = UpdateBuilder::new()
            .collection("users")
            .update_fields(doc! { "name": "?" })
            .filter_conditions(doc! { "id": "?" })
            .build()
            .unwrap();
        assert_eq!(plan.update_fields(), &doc! { "name": "?" });
        assert_eq!(plan.filter(), &doc! { "id": "?" });
    }

    #[test]
    fn test_delete_without_collection_fails() {
        let err = DeleteBuilder::new()
            .filter_conditions(doc! { "id": 1 })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Collection name is required"));
    }

    #[test]
    fn test_delete_empty_filter_is_valid() {
        let plan = DeleteBuilder::new().collection("logs").build().unwrap();
        assert!(plan.filter().is_empty());
    }
}
