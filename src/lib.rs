//! ShapeSQL - query-shape to SQL compilation
//!
//! This crate turns typed query expressions into SQL SELECT statements through:
//! - A mapping schema describing entities, their tables and associations
//! - Build contexts for tables, projections and derived-table boundaries
//! - Scope resolution of member paths across nested projections
//! - Generic SQL rendering plus a row mapping for materializing results

pub mod builder;
pub mod config;
pub mod expression;
pub mod mapping_schema;
pub mod sql;

pub use builder::{BuildError, CompiledQuery, ExpressionBuilder, Mapping};
pub use config::BuilderConfig;
pub use expression::{Expr, ExprRef, Lambda, Member, Parameter, ShapeType};
pub use mapping_schema::MappingSchema;
