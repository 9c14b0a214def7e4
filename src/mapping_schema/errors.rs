//! Errors raised while building or loading a mapping schema.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchemaError {
    #[error("Type `{0}` is registered twice")]
    DuplicateType(String),

    #[error("Type `{type_name}` references unknown type `{referenced}`")]
    UnknownType {
        type_name: String,
        referenced: String,
    },

    #[error("Entity `{entity}` has no column mapped for member `{member}`")]
    UnknownColumn { entity: String, member: String },

    #[error("Type `{0}` is not an entity")]
    NotAnEntity(String),

    #[error("Failed to read schema file: {0}")]
    Io(String),

    #[error("Failed to parse schema YAML: {0}")]
    Yaml(String),
}
