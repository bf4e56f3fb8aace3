use crate::connection::ConfigError;
use crate::query::{BuildError, MatchError, ParameterError, ParseError, QueryError};
use crate::relational::BridgeError;
use crate::result::CursorError;
use crate::storage::StoreError;

/// Crate-level error; every module error converts into it
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Filter error: {0}")]
    Match(#[from] MatchError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Cursor error: {0}")]
    Cursor(#[from] CursorError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Programming error: {0}")]
    Programming(String),
}

impl From<QueryError> for Error {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Parse(e) => Error::Parse(e),
            QueryError::Build(e) => Error::Build(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
