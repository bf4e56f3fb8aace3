//! SQL compilation: parsing, expression translation, plan building and
//! parameter handling.

pub mod builder;
pub mod cache;
pub mod functions;
pub mod matcher;
pub mod params;
pub mod parser;
pub mod plan;
pub mod subquery;
pub mod translator;

pub use builder::{BuildError, DeleteBuilder, InsertBuilder, QueryBuilder, UpdateBuilder};
pub use cache::{CacheStats, PlanCache};
pub use functions::{FunctionError, FunctionRegistry, ProjectionCall, ProjectionFunction};
pub use matcher::{matches, MatchError};
pub use params::{ParameterError, ParameterStyle, Parameters, Substitution};
pub use parser::{Compiler, ParseError};
pub use plan::{ColumnAlias, DeletePlan, ExecutionPlan, InsertPlan, QueryPlan, SortKey, UpdatePlan};
pub use translator::{ExpressionTranslator, TranslateError, Translation};

/// Convenience function to compile one statement with the built-in functions
pub fn compile(sql: &str) -> Result<ExecutionPlan, QueryError> {
    Compiler::default().compile(sql)
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),
}
