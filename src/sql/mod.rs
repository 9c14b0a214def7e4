//! Relational statement model.
//!
//! A [`SelectQuery`] is the in-progress statement every context of one scope
//! appends to: an ordered column list, the FROM tables and a predicate. It is
//! shared between contexts through [`SharedQuery`] and only ever grows.
//! [`SqlSelectStatement`] wraps the outermost query for rendering.

pub mod errors;
pub mod select_query;
pub mod statement;
pub mod to_sql;

use std::{cell::RefCell, fmt, rc::Rc};

use serde::{Deserialize, Serialize};

pub use errors::RenderError;
pub use select_query::{
    FromClause, SearchCondition, SelectClause, SelectQuery, SqlColumn, SqlExpr, TableSource,
    TableSourceKind,
};
pub use statement::SqlSelectStatement;
pub use to_sql::{render_query, RenderOptions, RenderScope, ToSql};

/// Identity of a `SelectQuery` within one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub u32);

/// Identity of a FROM source within one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub u32);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

pub type SharedQuery = Rc<RefCell<SelectQuery>>;

pub fn shared(query: SelectQuery) -> SharedQuery {
    Rc::new(RefCell::new(query))
}
