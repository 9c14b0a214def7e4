//! The scope-resolution protocol shared by every query-operator context.
//!
//! Every operation takes a `level`: the number of member-access hops between
//! the context's own row and the node of `expr` it is asked about. `None` as the
//! expression means "the context's whole value".

use std::{fmt, rc::Rc};

use crate::expression::{ExprRef, Member};
use crate::sql::{SharedQuery, SqlExpr, SqlSelectStatement};

use super::{errors::BuildResult, mapping::MappingRef, ExpressionBuilder};

/// Index of a context in the builder's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub usize);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// What a caller wants to know about a sub-expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestFor {
    /// Is the expression this context's own parameter?
    Root,
    /// Does this context open a subquery scope?
    SubQuery,
    Table,
    Association,
    Field,
    Object,
    Expression,
    GroupJoin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvertFlags {
    /// Exactly one value is expected.
    Field,
    /// Values usable as a grouping or ordering key.
    Key,
    /// Expand every member.
    All,
}

/// A resolved binding of a sub-expression.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlInfo {
    /// Members from the outermost projection inwards.
    pub members: Vec<Member>,
    pub sql: SqlExpr,
    /// Statement the `index` refers to.
    pub query: Option<SharedQuery>,
    pub index: Option<usize>,
}

impl SqlInfo {
    pub fn new(sql: SqlExpr) -> Self {
        Self {
            members: Vec::new(),
            sql,
            query: None,
            index: None,
        }
    }

    /// Tag with `member` unless it already heads the member chain.
    pub fn with_member(mut self, member: &Member) -> Self {
        if self.members.first() != Some(member) {
            self.members.insert(0, member.clone());
        }
        self
    }

    pub fn member(&self) -> Option<&Member> {
        self.members.first()
    }

    pub fn is_bound_to(&self, query: &SharedQuery) -> bool {
        self.query.as_ref().is_some_and(|q| Rc::ptr_eq(q, query))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IsExpressionResult {
    pub result: bool,
    /// The sub-expression the answer was derived from, when there is one.
    pub expression: Option<ExprRef>,
}

impl IsExpressionResult {
    pub const FALSE: IsExpressionResult = IsExpressionResult {
        result: false,
        expression: None,
    };

    pub fn new(result: bool) -> Self {
        Self {
            result,
            expression: None,
        }
    }
}

/// Who asks for a scope, and about what.
#[derive(Debug, Clone, Default)]
pub struct BuildInfo {
    pub parent: Option<ContextId>,
    pub expression: Option<ExprRef>,
}

pub trait BuildContext: fmt::Debug {
    fn id(&self) -> ContextId;

    fn parent(&self) -> Option<ContextId>;

    fn set_parent(&self, parent: Option<ContextId>);

    /// Child contexts, in lambda-parameter order.
    fn sequence(&self) -> &[ContextId];

    fn select_query(&self) -> &SharedQuery;

    /// Value-construction form of `expr` at `level`, or of the whole context.
    fn build_expression(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        enforce_server_side: bool,
    ) -> BuildResult<MappingRef>;

    fn convert_to_sql(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        flags: ConvertFlags,
    ) -> BuildResult<Vec<SqlInfo>>;

    /// Like [`BuildContext::convert_to_sql`], with every result bound to a
    /// column of this context's statement.
    fn convert_to_index(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        flags: ConvertFlags,
    ) -> BuildResult<Vec<SqlInfo>>;

    fn classify(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        request: RequestFor,
    ) -> BuildResult<IsExpressionResult>;

    /// The context responsible for interpreting `expr` at `level`.
    fn get_scope(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        info: &BuildInfo,
    ) -> BuildResult<ContextId>;

    /// Translate `index`, a column of `from`, into the coordinate space of the
    /// outermost statement of the chain.
    fn convert_to_parent_index(
        &self,
        b: &ExpressionBuilder,
        index: usize,
        from: &SharedQuery,
    ) -> BuildResult<usize> {
        let own = self.select_query();
        let index = if Rc::ptr_eq(from, own) {
            index
        } else {
            let column = SqlExpr::ColumnRef {
                query: from.borrow().id,
                index,
            };
            own.borrow_mut().select.add(column)
        };

        match self.parent() {
            Some(parent) => b
                .context(parent)?
                .convert_to_parent_index(b, index, own),
            None => Ok(index),
        }
    }

    fn set_alias(&self, b: &ExpressionBuilder, alias: &str);

    /// The statement for this chain, created on first use.
    fn result_statement(&self) -> Rc<SqlSelectStatement>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{ScalarType, ShapeType};
    use crate::sql::{shared, QueryId, SelectQuery, SourceId};

    #[test]
    fn test_with_member_prepends_once() {
        let a = Member::property("Anon", "A", ShapeType::Scalar(ScalarType::Int32));
        let b = Member::property("Outer", "B", ShapeType::named("Anon"));
        let info = SqlInfo::new(SqlExpr::field(SourceId(1), "x"))
            .with_member(&a)
            .with_member(&a)
            .with_member(&b);
        assert_eq!(info.members, vec![b.clone(), a]);
        assert_eq!(info.member(), Some(&b));
    }

    #[test]
    fn test_is_bound_to_uses_identity() {
        let q = shared(SelectQuery::new(QueryId(1)));
        let same_shape = shared(SelectQuery::new(QueryId(1)));
        let mut info = SqlInfo::new(SqlExpr::field(SourceId(1), "x"));
        assert!(!info.is_bound_to(&q));
        info.query = Some(q.clone());
        assert!(info.is_bound_to(&q));
        assert!(!info.is_bound_to(&same_shape));
    }
}
