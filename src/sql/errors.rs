use thiserror::Error;

use super::{QueryId, SourceId};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RenderError {
    #[error("Column references unknown table source {0}")]
    UnknownSource(SourceId),

    #[error("Column references query {0}, which is not a derived table in scope")]
    UnknownQuery(QueryId),

    #[error("Column index {index} is out of range for query {query}")]
    ColumnOutOfRange { query: QueryId, index: usize },
}
