use thiserror::Error;

use crate::mapping_schema::errors::SchemaError;
use crate::sql::RenderError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BuildError {
    #[error("Unsupported expression shape: {0}")]
    UnsupportedExpressionShape(String),

    #[error("'{expression}' cannot be converted to SQL: member {member} not found")]
    InvalidMemberPath { expression: String, member: String },

    #[error("Expected exactly one field for '{expression}' but found {count}")]
    ExpectedSingleField { expression: String, count: usize },

    #[error("Unknown build context {0}")]
    UnknownContext(usize),

    #[error("Resolution nested deeper than {0} calls")]
    ResolutionDepthExceeded(u32),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

impl BuildError {
    pub(crate) fn unsupported(what: impl std::fmt::Display) -> Self {
        BuildError::UnsupportedExpressionShape(what.to_string())
    }
}

pub type BuildResult<T> = Result<T, BuildError>;
