//! Scope boundary: an inner chain compiled into its own statement, mounted as
//! a derived table of a fresh outer statement.

use std::{
    cell::{Cell, OnceCell},
    rc::Rc,
};

use crate::expression::ExprRef;
use crate::sql::{SharedQuery, SourceId, SqlExpr, SqlSelectStatement};

use super::{
    context::{
        BuildContext, BuildInfo, ContextId, ConvertFlags, IsExpressionResult, RequestFor, SqlInfo,
    },
    errors::BuildResult,
    mapping::MappingRef,
    ExpressionBuilder,
};

#[derive(Debug)]
pub struct SubQueryContext {
    id: ContextId,
    parent: Cell<Option<ContextId>>,
    sequence: [ContextId; 1],
    source: SourceId,
    select_query: SharedQuery,
    statement: OnceCell<Rc<SqlSelectStatement>>,
}

impl SubQueryContext {
    pub fn new(id: ContextId, inner: ContextId, source: SourceId, select_query: SharedQuery) -> Self {
        Self {
            id,
            parent: Cell::new(None),
            sequence: [inner],
            source,
            select_query,
            statement: OnceCell::new(),
        }
    }

    fn inner(&self, b: &ExpressionBuilder) -> BuildResult<Rc<dyn BuildContext>> {
        b.context(self.sequence[0])
    }

    /// Index of an inner column in the outer statement. The column is added on
    /// first use and keeps the inner column's alias.
    fn bridge(&self, inner_query: &SharedQuery, index: usize) -> usize {
        let (query_id, alias) = {
            let inner = inner_query.borrow();
            let alias = inner.select.column(index).and_then(|c| c.alias.clone());
            (inner.id, alias)
        };

        let mut outer = self.select_query.borrow_mut();
        let outer_index = outer.select.add(SqlExpr::ColumnRef {
            query: query_id,
            index,
        });
        if let Some(alias) = alias {
            let unaliased = outer
                .select
                .column(outer_index)
                .is_some_and(|c| c.alias.is_none());
            if unaliased {
                outer.select.set_alias(outer_index, alias);
            }
        }
        outer_index
    }
}

impl BuildContext for SubQueryContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn parent(&self) -> Option<ContextId> {
        self.parent.get()
    }

    fn set_parent(&self, parent: Option<ContextId>) {
        self.parent.set(parent);
    }

    fn sequence(&self) -> &[ContextId] {
        &self.sequence
    }

    fn select_query(&self) -> &SharedQuery {
        &self.select_query
    }

    fn build_expression(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        enforce_server_side: bool,
    ) -> BuildResult<MappingRef> {
        let _guard = b.enter()?;
        self.inner(b)?
            .build_expression(b, expr, level, enforce_server_side)
    }

    /// Inner values as references to the inner statement's columns.
    fn convert_to_sql(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        flags: ConvertFlags,
    ) -> BuildResult<Vec<SqlInfo>> {
        let _guard = b.enter()?;
        let inner = self.inner(b)?;
        let inner_id = inner.select_query().borrow().id;
        let infos = inner.convert_to_index(b, expr, level, flags)?;
        Ok(infos
            .into_iter()
            .filter_map(|info| {
                let index = info.index?;
                Some(SqlInfo {
                    members: info.members,
                    sql: SqlExpr::ColumnRef {
                        query: inner_id,
                        index,
                    },
                    query: None,
                    index: None,
                })
            })
            .collect())
    }

    fn convert_to_index(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        flags: ConvertFlags,
    ) -> BuildResult<Vec<SqlInfo>> {
        let _guard = b.enter()?;
        let inner = self.inner(b)?;
        let inner_query = inner.select_query().clone();
        let infos = inner.convert_to_index(b, expr, level, flags)?;
        Ok(infos
            .into_iter()
            .filter_map(|info| {
                let index = self.bridge(&inner_query, info.index?);
                Some(SqlInfo {
                    members: info.members,
                    sql: SqlExpr::ColumnRef {
                        query: self.select_query.borrow().id,
                        index,
                    },
                    query: Some(self.select_query.clone()),
                    index: Some(index),
                })
            })
            .collect())
    }

    fn classify(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        request: RequestFor,
    ) -> BuildResult<IsExpressionResult> {
        if request == RequestFor::SubQuery {
            return Ok(IsExpressionResult::new(true));
        }
        self.inner(b)?.classify(b, expr, level, request)
    }

    fn get_scope(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        info: &BuildInfo,
    ) -> BuildResult<ContextId> {
        self.inner(b)?.get_scope(b, expr, level, info)
    }

    fn convert_to_parent_index(
        &self,
        b: &ExpressionBuilder,
        index: usize,
        from: &SharedQuery,
    ) -> BuildResult<usize> {
        let index = if Rc::ptr_eq(from, &self.select_query) {
            index
        } else {
            self.bridge(from, index)
        };
        match self.parent.get() {
            Some(parent) => b
                .context(parent)?
                .convert_to_parent_index(b, index, &self.select_query),
            None => Ok(index),
        }
    }

    fn set_alias(&self, b: &ExpressionBuilder, alias: &str) {
        if alias.is_empty() || b.config().is_synthetic_alias(alias) {
            return;
        }
        let mut query = self.select_query.borrow_mut();
        if let Some(table) = query.from.tables.iter_mut().find(|t| t.id == self.source) {
            table.alias = Some(alias.to_string());
        }
    }

    fn result_statement(&self) -> Rc<SqlSelectStatement> {
        self.statement
            .get_or_init(|| Rc::new(SqlSelectStatement::new(self.select_query.clone())))
            .clone()
    }
}
