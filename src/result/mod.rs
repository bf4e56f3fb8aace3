//! Result delivery: row shaping, column descriptions and the paging cursor.

pub mod cursor;
pub mod description;

pub use cursor::{CursorState, ResultCursor, DEFAULT_ARRAYSIZE};
pub use description::ColumnDescription;

use bson::{Bson, Document};
use std::collections::HashMap;

use crate::data::{lookup_path, TypeTag};
use crate::query::{ColumnAlias, ProjectionCall, QueryPlan};

/// How raw documents become output rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowShape {
    /// Source field and output name per declared column, in SELECT order
    columns: Vec<ColumnAlias>,
    /// Output column → function applied to its source field
    functions: HashMap<String, ProjectionCall>,
}

impl RowShape {
    /// Rows pass through untouched
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn from_plan(plan: &QueryPlan) -> Self {
        let mut columns = plan.column_aliases().to_vec();
        // Projection entries without a SELECT-list column keep their own name
        let included = plan
            .projection()
            .iter()
            .filter(|(_, v)| !matches!(v, Bson::Int32(0) | Bson::Int64(0) | Bson::Boolean(false)))
            .map(|(k, _)| k);
        for field in included {
            if !plan.column_aliases().iter().any(|c| &c.field == field) {
                columns.push(ColumnAlias::new(field.as_str(), field.as_str()));
            }
        }
        Self {
            columns,
            functions: plan.projection_functions().clone(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.columns.is_empty() && self.functions.is_empty()
    }

    /// Output columns known before any row arrives, with fixed tags for
    /// function outputs
    pub fn declared_columns(&self) -> Vec<(String, Option<TypeTag>)> {
        let mut columns: Vec<(String, Option<TypeTag>)> = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            if !columns.iter().any(|(n, _)| n == &column.alias) {
                columns.push((column.alias.clone(), None));
            }
        }
        let mut outputs: Vec<_> = self.functions.iter().collect();
        outputs.sort_by(|a, b| a.0.cmp(b.0));
        for (output, call) in outputs {
            let tag = Some(call.function.type_tag());
            match columns.iter_mut().find(|(n, _)| n == output) {
                Some(column) => column.1 = tag,
                None => columns.push((output.clone(), tag)),
            }
        }
        columns
    }

    /// Map one raw document to an output row
    pub fn apply(&self, raw: Document) -> Document {
        if self.is_passthrough() {
            return raw;
        }

        let mut row = if self.columns.is_empty() {
            raw.clone()
        } else {
            let mut row = Document::new();
            for column in &self.columns {
                let value = lookup_path(&raw, &column.field).cloned().unwrap_or(Bson::Null);
                row.insert(column.alias.clone(), value);
            }
            row
        };

        for (output, call) in &self.functions {
            let source = lookup_path(&raw, &call.field).cloned().unwrap_or(Bson::Null);
            row.insert(output.clone(), call.function.apply(&source, &call.args));
        }
        row
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CursorError {
    #[error("Cursor is closed")]
    Closed,

    #[error("No result set: the statement did not produce rows")]
    NoResultSet,

    #[error("arraysize must be at least 1")]
    InvalidArraysize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{compile, ExecutionPlan};
    use bson::doc;

    fn shape(sql: &str) -> RowShape {
        match compile(sql).unwrap() {
            ExecutionPlan::Query(plan) => RowShape::from_plan(&plan),
            other => panic!("expected query plan, got {}", other.kind()),
        }
    }

    #[test]
    fn test_passthrough_for_star() {
        let shape = shape("SELECT * FROM t");
        assert!(shape.is_passthrough());
        let raw = doc! { "_id": 1, "a": 2 };
        assert_eq!(shape.apply(raw.clone()), raw);
    }

    #[test]
    fn test_aliases_and_missing_fields() {
        let shape = shape("SELECT name AS who, address.city, missing FROM t");
        let row = shape.apply(doc! { "_id": 7, "name": "ada", "address": { "city": "Oslo" } });
        assert_eq!(
            row,
            doc! { "who": "ada", "address.city": "Oslo", "missing": Bson::Null }
        );
    }

    #[test]
    fn test_declared_id_is_kept() {
        let shape = shape("SELECT _id, name FROM t");
        let row = shape.apply(doc! { "_id": 7, "name": "ada" });
        assert_eq!(row, doc! { "_id": 7, "name": "ada" });
    }

    #[test]
    fn test_same_field_under_two_names() {
        let both = shape("SELECT name, UPPER(name) AS shout FROM t");
        let row = both.apply(doc! { "_id": 1, "name": "ada" });
        assert_eq!(row, doc! { "name": "ada", "shout": "ADA" });
        assert_eq!(
            both.declared_columns(),
            vec![("name".to_string(), None), ("shout".to_string(), Some(TypeTag::String))]
        );

        let twice = shape("SELECT name AS a, name AS b FROM t");
        assert_eq!(twice.apply(doc! { "name": "ada" }), doc! { "a": "ada", "b": "ada" });
    }

    #[test]
    fn test_functions_run_after_mapping() {
        let shape = shape("SELECT UPPER(name) AS shout, age FROM t");
        let row = shape.apply(doc! { "name": "ada", "age": 36 });
        assert_eq!(row, doc! { "shout": "ADA", "age": 36 });
        assert_eq!(
            shape.declared_columns(),
            vec![("shout".to_string(), Some(TypeTag::String)), ("age".to_string(), None)]
        );
    }
}
