//! Generic SQL text rendering.
//!
//! Table sources without an explicit alias are named `{table_alias_prefix}N`
//! in order of appearance; unaliased columns `{column_alias_prefix}N` by
//! position. Column references into derived tables render through the derived
//! table's alias and the referenced column's name.

use std::collections::{HashMap, HashSet};

use crate::expression::{BinaryOp, Literal};

use super::{
    errors::RenderError, QueryId, SearchCondition, SelectClause, SelectQuery, SourceId, SqlExpr,
    TableSourceKind,
};

#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    pub table_alias_prefix: String,
    pub column_alias_prefix: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            table_alias_prefix: "t".to_string(),
            column_alias_prefix: "c".to_string(),
        }
    }
}

/// Names in scope while rendering one statement.
pub struct RenderScope<'a> {
    options: &'a RenderOptions,
    sources: HashMap<SourceId, String>,
    derived: HashMap<QueryId, (String, Vec<String>)>,
    next_alias: usize,
}

impl<'a> RenderScope<'a> {
    pub fn new(options: &'a RenderOptions) -> Self {
        Self {
            options,
            sources: HashMap::new(),
            derived: HashMap::new(),
            next_alias: 0,
        }
    }

    fn register_sources(&mut self, query: &SelectQuery) {
        for table in &query.from.tables {
            if self.sources.contains_key(&table.id) {
                continue;
            }
            let alias = match &table.alias {
                Some(alias) => alias.clone(),
                None => {
                    self.next_alias += 1;
                    format!("{}{}", self.options.table_alias_prefix, self.next_alias)
                }
            };
            if let TableSourceKind::Derived(inner) = &table.kind {
                let inner = inner.borrow();
                let names = column_names(&inner.select, &self.options.column_alias_prefix);
                self.derived.insert(inner.id, (alias.clone(), names));
            }
            self.sources.insert(table.id, alias);
        }
    }

    pub fn source_alias(&self, id: SourceId) -> Result<&str, RenderError> {
        self.sources
            .get(&id)
            .map(String::as_str)
            .ok_or(RenderError::UnknownSource(id))
    }

    fn column_reference(&self, query: QueryId, index: usize) -> Result<String, RenderError> {
        let (alias, names) = self
            .derived
            .get(&query)
            .ok_or(RenderError::UnknownQuery(query))?;
        let name = names
            .get(index)
            .ok_or(RenderError::ColumnOutOfRange { query, index })?;
        Ok(format!("{}.{}", alias, name))
    }
}

/// Output names of a select list: the alias when set, else the positional
/// name; later duplicates get a numeric suffix.
pub fn column_names(select: &SelectClause, prefix: &str) -> Vec<String> {
    let mut used = HashSet::new();
    select
        .columns()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let base = column
                .alias
                .clone()
                .unwrap_or_else(|| format!("{}{}", prefix, i + 1));
            let mut name = base.clone();
            let mut suffix = 1;
            while !used.insert(name.clone()) {
                name = format!("{}_{}", base, suffix);
                suffix += 1;
            }
            name
        })
        .collect()
}

pub trait ToSql {
    fn to_sql(&self, scope: &mut RenderScope<'_>) -> Result<String, RenderError>;
}

fn literal_sql(value: &Literal) -> String {
    match value {
        Literal::Null => "NULL".to_string(),
        Literal::Boolean(true) => "1".to_string(),
        Literal::Boolean(false) => "0".to_string(),
        Literal::Integer(i) => i.to_string(),
        Literal::Float(f) => f.to_string(),
        Literal::String(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

fn operator_sql(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Equal => "=",
        BinaryOp::NotEqual => "<>",
        BinaryOp::Less => "<",
        BinaryOp::LessOrEqual => "<=",
        BinaryOp::Greater => ">",
        BinaryOp::GreaterOrEqual => ">=",
        BinaryOp::And => "AND",
        BinaryOp::Or => "OR",
        BinaryOp::Add => "+",
        BinaryOp::Subtract => "-",
        BinaryOp::Multiply => "*",
        BinaryOp::Divide => "/",
    }
}

impl ToSql for SqlExpr {
    fn to_sql(&self, scope: &mut RenderScope<'_>) -> Result<String, RenderError> {
        match self {
            SqlExpr::Field { source, name } => {
                Ok(format!("{}.{}", scope.source_alias(*source)?, name))
            }
            SqlExpr::ColumnRef { query, index } => scope.column_reference(*query, *index),
            SqlExpr::Value(value) => Ok(literal_sql(value)),
            SqlExpr::Binary { op, left, right } => Ok(format!(
                "({} {} {})",
                left.to_sql(scope)?,
                operator_sql(*op),
                right.to_sql(scope)?
            )),
            SqlExpr::Function { name, args } => {
                let args: Result<Vec<String>, _> = args.iter().map(|a| a.to_sql(scope)).collect();
                Ok(format!("{}({})", name, args?.join(", ")))
            }
            SqlExpr::Aggregate { func, arg } => match arg {
                Some(arg) => Ok(format!("{}({})", func, arg.to_sql(scope)?)),
                None => Ok(format!("{}(*)", func)),
            },
            SqlExpr::Condition(condition) => condition.to_sql(scope),
            SqlExpr::Case {
                condition,
                when_true,
                when_false,
            } => Ok(format!(
                "CASE WHEN {} THEN {} ELSE {} END",
                condition.to_sql(scope)?,
                when_true.to_sql(scope)?,
                when_false.to_sql(scope)?
            )),
            SqlExpr::SubQuery(query) => Ok(format!("({})", render_query(query, scope, false)?)),
        }
    }
}

fn junction(
    items: &[SearchCondition],
    separator: &str,
    scope: &mut RenderScope<'_>,
) -> Result<String, RenderError> {
    let parts: Result<Vec<String>, RenderError> = items
        .iter()
        .map(|item| {
            let sql = item.to_sql(scope)?;
            Ok(match item {
                SearchCondition::And(_) | SearchCondition::Or(_) => format!("({})", sql),
                _ => sql,
            })
        })
        .collect();
    Ok(parts?.join(separator))
}

impl ToSql for SearchCondition {
    fn to_sql(&self, scope: &mut RenderScope<'_>) -> Result<String, RenderError> {
        match self {
            SearchCondition::Compare { op, left, right } => Ok(format!(
                "{} {} {}",
                left.to_sql(scope)?,
                operator_sql(*op),
                right.to_sql(scope)?
            )),
            SearchCondition::IsNull { expr, negated } => Ok(format!(
                "{} IS {}NULL",
                expr.to_sql(scope)?,
                if *negated { "NOT " } else { "" }
            )),
            SearchCondition::Not(inner) => Ok(format!("NOT ({})", inner.to_sql(scope)?)),
            SearchCondition::And(items) => junction(items, " AND ", scope),
            SearchCondition::Or(items) => junction(items, " OR ", scope),
            SearchCondition::Exists(query) => {
                Ok(format!("EXISTS({})", render_query(query, scope, false)?))
            }
            SearchCondition::Truth(expr) => Ok(format!("{} = 1", expr.to_sql(scope)?)),
        }
    }
}

/// Render one SELECT. Select-list names are emitted only when `named` is set,
/// which is the case for the statement itself and for derived tables.
pub fn render_query(
    query: &SelectQuery,
    scope: &mut RenderScope<'_>,
    named: bool,
) -> Result<String, RenderError> {
    scope.register_sources(query);

    let mut sql = String::from("SELECT ");
    if query.select.distinct {
        sql.push_str("DISTINCT ");
    }

    if query.select.is_empty() {
        sql.push('*');
    } else {
        let names = column_names(&query.select, &scope.options.column_alias_prefix);
        let mut columns = Vec::with_capacity(names.len());
        for (column, name) in query.select.columns().iter().zip(names) {
            let expr = column.expression.to_sql(scope)?;
            if named {
                columns.push(format!("{} AS {}", expr, name));
            } else {
                columns.push(expr);
            }
        }
        sql.push_str(&columns.join(", "));
    }

    if !query.from.tables.is_empty() {
        let mut tables = Vec::with_capacity(query.from.tables.len());
        for table in &query.from.tables {
            let alias = scope.source_alias(table.id)?.to_string();
            match &table.kind {
                TableSourceKind::Table { name } => tables.push(format!("{} {}", name, alias)),
                TableSourceKind::Derived(inner) => {
                    let inner = render_query(&inner.borrow(), scope, true)?;
                    tables.push(format!("({}) {}", inner, alias));
                }
            }
        }
        sql.push_str(" FROM ");
        sql.push_str(&tables.join(", "));
    }

    if let Some(condition) = &query.where_clause {
        sql.push_str(" WHERE ");
        sql.push_str(&condition.to_sql(scope)?);
    }

    Ok(sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::shared;
    use test_case::test_case;

    #[test_case(Literal::Null, "NULL"; "null")]
    #[test_case(Literal::Boolean(true), "1"; "true as one")]
    #[test_case(Literal::Integer(-4), "-4"; "integer")]
    #[test_case(Literal::String("O'Hara".to_string()), "'O''Hara'"; "quote escaping")]
    fn test_literal_rendering(value: Literal, expected: &str) {
        assert_eq!(literal_sql(&value), expected);
    }

    #[test]
    fn test_render_simple_query() {
        let mut q = SelectQuery::new(QueryId(1));
        q.add_table(SourceId(1), "customers");
        let index = q.select.add(SqlExpr::field(SourceId(1), "name"));
        q.select.set_alias(index, "Name");
        q.select.add(SqlExpr::field(SourceId(1), "id"));
        q.add_where(SearchCondition::Compare {
            op: BinaryOp::Greater,
            left: SqlExpr::field(SourceId(1), "id"),
            right: SqlExpr::Value(Literal::Integer(10)),
        });

        let options = RenderOptions::default();
        let sql = render_query(&q, &mut RenderScope::new(&options), true).unwrap();
        assert_eq!(
            sql,
            "SELECT t1.name AS Name, t1.id AS c2 FROM customers t1 WHERE t1.id > 10"
        );
    }

    #[test]
    fn test_render_derived_table_reference() {
        let mut inner = SelectQuery::new(QueryId(2));
        inner.add_table(SourceId(2), "orders");
        let total = inner.select.add(SqlExpr::field(SourceId(2), "total"));
        inner.select.set_alias(total, "Total");
        let inner = shared(inner);

        let mut outer = SelectQuery::new(QueryId(1));
        outer.add_derived(SourceId(1), inner);
        outer.select.add(SqlExpr::ColumnRef {
            query: QueryId(2),
            index: total,
        });

        let options = RenderOptions::default();
        let sql = render_query(&outer, &mut RenderScope::new(&options), true).unwrap();
        assert_eq!(
            sql,
            "SELECT t1.Total AS c1 FROM (SELECT t2.total AS Total FROM orders t2) t1"
        );
    }

    #[test]
    fn test_unknown_query_reference_is_an_error() {
        let mut q = SelectQuery::new(QueryId(1));
        q.select.add(SqlExpr::ColumnRef {
            query: QueryId(9),
            index: 0,
        });
        let options = RenderOptions::default();
        assert_eq!(
            render_query(&q, &mut RenderScope::new(&options), true),
            Err(RenderError::UnknownQuery(QueryId(9)))
        );
    }

    #[test]
    fn test_duplicate_aliases_get_suffixes() {
        let mut q = SelectQuery::new(QueryId(1));
        q.add_table(SourceId(1), "customers");
        let a = q.select.add(SqlExpr::field(SourceId(1), "a"));
        let b = q.select.add(SqlExpr::field(SourceId(1), "b"));
        q.select.set_alias(a, "Name");
        q.select.set_alias(b, "Name");
        assert_eq!(column_names(&q.select, "c"), vec!["Name", "Name_1"]);
    }
}
