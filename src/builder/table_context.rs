//! Leaf scope over one FROM table.
//!
//! The row of a table context sits one level above the requested node: at
//! `level` the expression names a mapped member (a column) of the entity, and
//! an expression that ends above `level` denotes the whole row.

use std::{
    cell::{Cell, OnceCell, RefCell},
    collections::HashMap,
    rc::Rc,
};

use crate::expression::{level_expression, Expr, ExprRef, Member};
use crate::mapping_schema::errors::SchemaError;
use crate::sql::{SharedQuery, SourceId, SqlExpr, SqlSelectStatement};

use super::{
    context::{
        BuildContext, BuildInfo, ContextId, ConvertFlags, IsExpressionResult, RequestFor, SqlInfo,
    },
    errors::{BuildError, BuildResult},
    mapping::{FieldMapping, Mapping, MappingRef},
    ExpressionBuilder,
};

type IndexKey = (Option<ExprRef>, usize, ConvertFlags);

/// What a (expression, level) pair denotes within the table.
enum Target {
    Row,
    Column(Member, String),
    Association(Member, bool),
}

#[derive(Debug)]
pub struct TableContext {
    id: ContextId,
    parent: Cell<Option<ContextId>>,
    entity_type: String,
    source: SourceId,
    select_query: SharedQuery,
    statement: OnceCell<Rc<SqlSelectStatement>>,
    root_mapping: RefCell<Option<MappingRef>>,
    index_cache: RefCell<HashMap<IndexKey, Vec<SqlInfo>>>,
}

impl TableContext {
    pub fn new(
        id: ContextId,
        entity_type: String,
        source: SourceId,
        select_query: SharedQuery,
    ) -> Self {
        Self {
            id,
            parent: Cell::new(None),
            entity_type,
            source,
            select_query,
            statement: OnceCell::new(),
            root_mapping: RefCell::new(None),
            index_cache: RefCell::new(HashMap::new()),
        }
    }

    fn target(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
    ) -> BuildResult<Target> {
        let Some(expr) = expr else {
            return Ok(Target::Row);
        };
        let node = level_expression(expr, level);
        let Expr::MemberAccess { member, .. } = node.as_ref() else {
            if node == *expr {
                if node.is_parameter() {
                    return Ok(Target::Row);
                }
                return Err(BuildError::unsupported(format!(
                    "'{}' is not a member of table {}",
                    expr, self.entity_type
                )));
            }
            return self.target(b, Some(expr), level + 1);
        };
        if node != *expr {
            return Err(BuildError::unsupported(format!(
                "'{}' navigates past member {} of table {}",
                expr, member, self.entity_type
            )));
        }

        let schema = b.schema();
        let entity = schema
            .entity(&self.entity_type)
            .ok_or_else(|| SchemaError::NotAnEntity(self.entity_type.clone()))?;

        let mut name = member.name.as_str();
        if entity.column(name).is_none() {
            if let Some(target) = entity.aliases.get(name) {
                log::debug!(
                    "TableContext::target: {}.{} resolved through alias to {}",
                    self.entity_type,
                    name,
                    target
                );
                name = target.as_str();
            }
        }

        if let Some(column) = entity.column(name) {
            let member = schema
                .member(&self.entity_type, name)
                .unwrap_or_else(|| member.clone());
            return Ok(Target::Column(member, column.column.clone()));
        }
        if let Some(association) = schema.association(&self.entity_type, name) {
            return Ok(Target::Association(member.clone(), association.many));
        }

        Err(BuildError::InvalidMemberPath {
            expression: expr.to_string(),
            member: member.to_string(),
        })
    }

    fn row_infos(&self, b: &ExpressionBuilder) -> Vec<SqlInfo> {
        b.schema()
            .entity_columns(&self.entity_type)
            .into_iter()
            .map(|(member, column)| {
                SqlInfo::new(SqlExpr::field(self.source, column)).with_member(&member)
            })
            .collect()
    }

    fn to_parent_index(&self, b: &ExpressionBuilder, index: usize) -> BuildResult<usize> {
        match self.parent.get() {
            Some(parent) => b
                .context(parent)?
                .convert_to_parent_index(b, index, &self.select_query),
            None => Ok(index),
        }
    }

    fn build_row(&self, b: &ExpressionBuilder) -> BuildResult<MappingRef> {
        if let Some(mapping) = self.root_mapping.borrow().clone() {
            return Ok(mapping);
        }
        let infos = self.convert_to_index(b, None, 0, ConvertFlags::All)?;
        let mut fields = Vec::with_capacity(infos.len());
        for info in infos {
            let (Some(member), Some(index)) = (info.member().cloned(), info.index) else {
                continue;
            };
            fields.push(FieldMapping {
                member: member.name,
                index: self.to_parent_index(b, index)?,
                value_type: member.member_type,
            });
        }
        let mapping = Rc::new(Mapping::Entity {
            entity_type: self.entity_type.clone(),
            fields,
        });
        Ok(self
            .root_mapping
            .borrow_mut()
            .get_or_insert(mapping)
            .clone())
    }
}

impl BuildContext for TableContext {
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
        &[]
    }

    fn select_query(&self) -> &SharedQuery {
        &self.select_query
    }

    fn build_expression(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        _enforce_server_side: bool,
    ) -> BuildResult<MappingRef> {
        let _guard = b.enter()?;
        match self.target(b, expr, level)? {
            Target::Row => self.build_row(b),
            Target::Column(member, _) => {
                let info = self
                    .convert_to_index(b, expr, level, ConvertFlags::Field)?
                    .into_iter()
                    .next()
                    .and_then(|i| i.index)
                    .ok_or_else(|| BuildError::ExpectedSingleField {
                        expression: member.to_string(),
                        count: 0,
                    })?;
                Ok(Mapping::column(
                    self.to_parent_index(b, info)?,
                    member.member_type,
                ))
            }
            Target::Association(member, _) => Err(BuildError::unsupported(format!(
                "association {} cannot be materialized",
                member
            ))),
        }
    }

    fn convert_to_sql(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        _flags: ConvertFlags,
    ) -> BuildResult<Vec<SqlInfo>> {
        let _guard = b.enter()?;
        match self.target(b, expr, level)? {
            Target::Row => Ok(self.row_infos(b)),
            Target::Column(member, column) => {
                Ok(vec![
                    SqlInfo::new(SqlExpr::field(self.source, column)).with_member(&member)
                ])
            }
            Target::Association(member, _) => Err(BuildError::unsupported(format!(
                "association {} is not a column; apply a sequence operator",
                member
            ))),
        }
    }

    fn convert_to_index(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        flags: ConvertFlags,
    ) -> BuildResult<Vec<SqlInfo>> {
        let key = (expr.cloned(), level, flags);
        if let Some(hit) = self.index_cache.borrow().get(&key) {
            return Ok(hit.clone());
        }

        let mut infos = self.convert_to_sql(b, expr, level, flags)?;
        {
            let mut query = self.select_query.borrow_mut();
            for info in &mut infos {
                let index = query.select.add(info.sql.clone());
                let unaliased = query
                    .select
                    .column(index)
                    .is_some_and(|c| c.alias.is_none());
                if unaliased {
                    if let Some(member) = info.member() {
                        query.select.set_alias(index, member.name.clone());
                    }
                }
                info.query = Some(self.select_query.clone());
                info.index = Some(index);
            }
        }

        Ok(self
            .index_cache
            .borrow_mut()
            .entry(key)
            .or_insert(infos)
            .clone())
    }

    fn classify(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        request: RequestFor,
    ) -> BuildResult<IsExpressionResult> {
        if matches!(
            request,
            RequestFor::Root | RequestFor::SubQuery | RequestFor::GroupJoin
        ) {
            return Ok(IsExpressionResult::FALSE);
        }

        let target = match self.target(b, expr, level) {
            Ok(target) => target,
            Err(BuildError::InvalidMemberPath { .. })
            | Err(BuildError::UnsupportedExpressionShape(_)) => {
                return Ok(IsExpressionResult::new(request == RequestFor::Expression))
            }
            Err(e) => return Err(e),
        };

        let result = match (target, request) {
            (Target::Row, RequestFor::Table | RequestFor::Object) => true,
            (Target::Column(..), RequestFor::Field) => true,
            (Target::Association(..), RequestFor::Association | RequestFor::Table) => true,
            (Target::Association(_, many), RequestFor::Object) => !many,
            _ => false,
        };
        Ok(IsExpressionResult::new(result))
    }

    fn get_scope(
        &self,
        _b: &ExpressionBuilder,
        _expr: Option<&ExprRef>,
        _level: usize,
        _info: &BuildInfo,
    ) -> BuildResult<ContextId> {
        Ok(self.id)
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
