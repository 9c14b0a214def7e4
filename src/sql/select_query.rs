use std::rc::Rc;

use crate::expression::{BinaryOp, Literal};

use super::{QueryId, SharedQuery, SourceId};

/// SQL scalar expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    /// A column of a FROM table.
    Field { source: SourceId, name: String },

    /// A column of another query's select list, reached through the derived
    /// table that query is mounted as (or the query itself).
    ColumnRef { query: QueryId, index: usize },

    Value(Literal),

    /// Arithmetic over two scalars.
    Binary {
        op: BinaryOp,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },

    Function { name: String, args: Vec<SqlExpr> },

    /// `func(arg)`, or `func(*)` without an argument.
    Aggregate {
        func: String,
        arg: Option<Box<SqlExpr>>,
    },

    /// A predicate in value position. Never left in a select list: projected
    /// conditions are wrapped in [`SqlExpr::Case`].
    Condition(Box<SearchCondition>),

    Case {
        condition: Box<SearchCondition>,
        when_true: Box<SqlExpr>,
        when_false: Box<SqlExpr>,
    },

    /// Correlated scalar subquery.
    SubQuery(Box<SelectQuery>),
}

impl SqlExpr {
    pub fn field(source: SourceId, name: impl Into<String>) -> Self {
        SqlExpr::Field {
            source,
            name: name.into(),
        }
    }

    pub fn is_condition(&self) -> bool {
        matches!(self, SqlExpr::Condition(_))
    }

    /// `CASE WHEN condition THEN 1 ELSE 0 END` for conditions, anything else
    /// unchanged.
    pub fn into_value(self) -> SqlExpr {
        match self {
            SqlExpr::Condition(condition) => SqlExpr::Case {
                condition,
                when_true: Box::new(SqlExpr::Value(Literal::Boolean(true))),
                when_false: Box::new(SqlExpr::Value(Literal::Boolean(false))),
            },
            other => other,
        }
    }

    /// The predicate form of a value: conditions unwrap, boolean values are
    /// compared against true.
    pub fn into_condition(self) -> SearchCondition {
        match self {
            SqlExpr::Condition(condition) => *condition,
            other => SearchCondition::Truth(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchCondition {
    Compare {
        op: BinaryOp,
        left: SqlExpr,
        right: SqlExpr,
    },
    IsNull {
        expr: SqlExpr,
        negated: bool,
    },
    Not(Box<SearchCondition>),
    And(Vec<SearchCondition>),
    Or(Vec<SearchCondition>),
    Exists(Box<SelectQuery>),
    /// A boolean value used as a predicate.
    Truth(SqlExpr),
}

impl SearchCondition {
    pub fn and(self, other: SearchCondition) -> SearchCondition {
        match self {
            SearchCondition::And(mut items) => {
                items.push(other);
                SearchCondition::And(items)
            }
            first => SearchCondition::And(vec![first, other]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlColumn {
    pub expression: SqlExpr,
    pub alias: Option<String>,
}

/// Ordered, append-only column list.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectClause {
    owner: QueryId,
    columns: Vec<SqlColumn>,
    pub distinct: bool,
}

impl SelectClause {
    pub fn new(owner: QueryId) -> Self {
        Self {
            owner,
            columns: Vec::new(),
            distinct: false,
        }
    }

    pub fn columns(&self) -> &[SqlColumn] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<&SqlColumn> {
        self.columns.get(index)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Index of `expression` in the column list, appending it when no column
    /// computes it yet. A reference to one of this clause's own columns
    /// resolves to that column. Issued indices never change.
    pub fn add(&mut self, expression: SqlExpr) -> usize {
        if let SqlExpr::ColumnRef { query, index } = &expression {
            if *query == self.owner && *index < self.columns.len() {
                return *index;
            }
        }

        if let Some(existing) = self
            .columns
            .iter()
            .position(|c| c.expression == expression)
        {
            log::trace!("SelectClause::add: reusing column {}", existing);
            return existing;
        }

        self.columns.push(SqlColumn {
            expression,
            alias: None,
        });
        let index = self.columns.len() - 1;
        log::debug!("SelectClause::add: {} appended column {}", self.owner, index);
        index
    }

    /// Name the column at `index`. The index itself is unaffected.
    pub fn set_alias(&mut self, index: usize, alias: impl Into<String>) {
        if let Some(column) = self.columns.get_mut(index) {
            column.alias = Some(alias.into());
        }
    }
}

#[derive(Debug, Clone)]
pub enum TableSourceKind {
    Table { name: String },
    /// Another query mounted as a derived table.
    Derived(SharedQuery),
}

impl PartialEq for TableSourceKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TableSourceKind::Table { name: a }, TableSourceKind::Table { name: b }) => a == b,
            (TableSourceKind::Derived(a), TableSourceKind::Derived(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSource {
    pub id: SourceId,
    pub kind: TableSourceKind,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FromClause {
    pub tables: Vec<TableSource>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub id: QueryId,
    pub select: SelectClause,
    pub from: FromClause,
    pub where_clause: Option<SearchCondition>,
}

impl SelectQuery {
    pub fn new(id: QueryId) -> Self {
        Self {
            id,
            select: SelectClause::new(id),
            from: FromClause::default(),
            where_clause: None,
        }
    }

    pub fn add_table(&mut self, id: SourceId, name: impl Into<String>) {
        self.from.tables.push(TableSource {
            id,
            kind: TableSourceKind::Table { name: name.into() },
            alias: None,
        });
    }

    pub fn add_derived(&mut self, id: SourceId, query: SharedQuery) {
        self.from.tables.push(TableSource {
            id,
            kind: TableSourceKind::Derived(query),
            alias: None,
        });
    }

    /// AND `condition` into the predicate.
    pub fn add_where(&mut self, condition: SearchCondition) {
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => existing.and(condition),
            None => condition,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> SelectQuery {
        let mut q = SelectQuery::new(QueryId(1));
        q.add_table(SourceId(1), "customers");
        q
    }

    #[test]
    fn test_add_appends_and_reuses() {
        let mut q = query();
        let id = q.select.add(SqlExpr::field(SourceId(1), "id"));
        let name = q.select.add(SqlExpr::field(SourceId(1), "name"));
        assert_eq!((id, name), (0, 1));

        assert_eq!(q.select.add(SqlExpr::field(SourceId(1), "id")), 0);
        assert_eq!(q.select.len(), 2);
    }

    #[test]
    fn test_add_own_column_reference_keeps_index() {
        let mut q = query();
        q.select.add(SqlExpr::field(SourceId(1), "id"));
        q.select.add(SqlExpr::field(SourceId(1), "name"));
        let index = q.select.add(SqlExpr::ColumnRef {
            query: QueryId(1),
            index: 1,
        });
        assert_eq!(index, 1);
        assert_eq!(q.select.len(), 2);
    }

    #[test]
    fn test_alias_does_not_move_index() {
        let mut q = query();
        let index = q.select.add(SqlExpr::field(SourceId(1), "id"));
        q.select.set_alias(index, "Id");
        q.select.set_alias(index, "Key");
        assert_eq!(q.select.add(SqlExpr::field(SourceId(1), "id")), index);
        assert_eq!(q.select.column(index).unwrap().alias.as_deref(), Some("Key"));
    }

    #[test]
    fn test_condition_becomes_case_in_value_position() {
        let condition = SqlExpr::Condition(Box::new(SearchCondition::IsNull {
            expr: SqlExpr::field(SourceId(1), "name"),
            negated: false,
        }));
        assert!(matches!(condition.into_value(), SqlExpr::Case { .. }));

        let plain = SqlExpr::field(SourceId(1), "name");
        assert_eq!(plain.clone().into_value(), plain);
    }

    #[test]
    fn test_add_where_combines_with_and() {
        let mut q = query();
        let truth = |name: &str| SearchCondition::Truth(SqlExpr::field(SourceId(1), name));
        q.add_where(truth("a"));
        q.add_where(truth("b"));
        q.add_where(truth("c"));
        assert_eq!(
            q.where_clause,
            Some(SearchCondition::And(vec![truth("a"), truth("b"), truth("c")]))
        );
    }
}
