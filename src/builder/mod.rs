//! Expression builder: owns the contexts of one query compilation and drives
//! them to a statement plus a row mapping.
//!
//! Contexts are registered bottom-up as the front-end applies operators:
//!
//! ```text
//! add_table("Customer")            -> TableContext      (FROM customers)
//! add_filter(t, c => c.Id > 10)    -> SelectContext     (WHERE ...)
//! add_select(c => new { c.Name })  -> SelectContext     (projection)
//! add_subquery(s)                  -> SubQueryContext   (derived table)
//! ```
//!
//! Each context lives in the builder's arena and refers to its children and
//! parent by [`ContextId`]; children are owned through the arena only, the
//! parent link is a lookup edge. [`ExpressionBuilder::build_query`] resolves
//! the outermost context and renders the accumulated statement.
//!
//! A builder is single-threaded (`!Send`) and used for exactly one compilation;
//! on error the partially filled statement is discarded with it.

pub mod context;
pub mod errors;
pub mod function_registry;
pub mod mapping;
pub mod member_table;
mod select_context;
mod sql_translator;
mod subquery_context;
mod table_context;

#[cfg(test)]
mod tests;

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::Arc,
};

use serde_json::json;

use crate::config::BuilderConfig;
use crate::expression::{root_object, Expr, ExprRef, Lambda, Parameter, ShapeType};
use crate::mapping_schema::{errors::SchemaError, MappingSchema};
use crate::sql::{shared, QueryId, SelectQuery, SharedQuery, SourceId, SqlSelectStatement};

pub use context::{
    BuildContext, BuildInfo, ContextId, ConvertFlags, IsExpressionResult, RequestFor, SqlInfo,
};
pub use errors::{BuildError, BuildResult};
pub use mapping::{FieldMapping, Mapping, MappingRef, MemberMapping};
pub use select_context::SelectContext;
pub use subquery_context::SubQueryContext;
pub use table_context::TableContext;

/// Result of compiling one query.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub statement: Rc<SqlSelectStatement>,
    pub mapping: MappingRef,
    pub sql: String,
    pub columns: Vec<String>,
}

impl CompiledQuery {
    /// JSON summary of the compiled query, for logging and inspection.
    pub fn explain(&self) -> serde_json::Value {
        json!({
            "sql": self.sql,
            "columns": self.columns,
            "mapping": self.mapping.as_ref(),
        })
    }
}

/// Decrements the resolution depth when a resolution call returns.
pub(crate) struct DepthGuard<'a> {
    depth: &'a Cell<u32>,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }
}

pub struct ExpressionBuilder {
    schema: Arc<MappingSchema>,
    config: BuilderConfig,
    contexts: RefCell<Vec<Rc<dyn BuildContext>>>,
    next_query: Cell<u32>,
    next_source: Cell<u32>,
    next_parameter: Cell<u32>,
    depth: Cell<u32>,
}

impl ExpressionBuilder {
    pub fn new(schema: Arc<MappingSchema>) -> Self {
        Self::with_config(schema, BuilderConfig::default())
    }

    pub fn with_config(schema: Arc<MappingSchema>, config: BuilderConfig) -> Self {
        Self {
            schema,
            config,
            contexts: RefCell::new(Vec::new()),
            next_query: Cell::new(0),
            next_source: Cell::new(0),
            next_parameter: Cell::new(0),
            depth: Cell::new(0),
        }
    }

    pub fn schema(&self) -> &MappingSchema {
        &self.schema
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn context(&self, id: ContextId) -> BuildResult<Rc<dyn BuildContext>> {
        self.contexts
            .borrow()
            .get(id.0)
            .cloned()
            .ok_or(BuildError::UnknownContext(id.0))
    }

    /// Register a context built by `create` under a fresh id. `create` must
    /// not register contexts itself.
    pub fn add_context<F>(&self, create: F) -> ContextId
    where
        F: FnOnce(ContextId) -> Rc<dyn BuildContext>,
    {
        let id = ContextId(self.contexts.borrow().len());
        let context = create(id);
        let mut contexts = self.contexts.borrow_mut();
        debug_assert_eq!(contexts.len(), id.0, "context registered while creating {}", id);
        contexts.push(context);
        log::debug!("ExpressionBuilder::add_context: registered {}", id);
        id
    }

    pub(crate) fn next_query_id(&self) -> QueryId {
        self.next_query.set(self.next_query.get() + 1);
        QueryId(self.next_query.get())
    }

    pub(crate) fn next_source_id(&self) -> SourceId {
        self.next_source.set(self.next_source.get() + 1);
        SourceId(self.next_source.get())
    }

    pub fn new_query(&self) -> SharedQuery {
        shared(SelectQuery::new(self.next_query_id()))
    }

    /// A lambda parameter with an id unique within this builder.
    pub fn new_parameter(&self, name: &str, param_type: ShapeType) -> Parameter {
        self.next_parameter.set(self.next_parameter.get() + 1);
        Parameter::new(self.next_parameter.get(), name, param_type)
    }

    pub(crate) fn enter(&self) -> BuildResult<DepthGuard<'_>> {
        let depth = self.depth.get() + 1;
        if depth > self.config.max_resolution_depth {
            return Err(BuildError::ResolutionDepthExceeded(
                self.config.max_resolution_depth,
            ));
        }
        self.depth.set(depth);
        Ok(DepthGuard { depth: &self.depth })
    }

    /// Leaf scope over a new statement selecting from `entity`'s table.
    pub fn add_table(&self, entity: &str) -> BuildResult<ContextId> {
        let query = self.new_query();
        self.add_table_source(entity, query)
    }

    /// Leaf scope adding `entity`'s table to the statement of `into`.
    pub fn add_joined_table(&self, entity: &str, into: ContextId) -> BuildResult<ContextId> {
        let query = self.context(into)?.select_query().clone();
        self.add_table_source(entity, query)
    }

    fn add_table_source(&self, entity: &str, query: SharedQuery) -> BuildResult<ContextId> {
        let descriptor = self
            .schema
            .entity(entity)
            .ok_or_else(|| SchemaError::NotAnEntity(entity.to_string()))?;
        let source = self.next_source_id();
        query.borrow_mut().add_table(source, descriptor.table.clone());
        Ok(self.add_context(|id| {
            Rc::new(TableContext::new(id, entity.to_string(), source, query))
        }))
    }

    /// Projection `lambda` over `sequence`, one child per lambda parameter.
    pub fn add_select(&self, lambda: Lambda, sequence: &[ContextId]) -> BuildResult<ContextId> {
        let first = sequence
            .first()
            .ok_or_else(|| BuildError::unsupported("projection without a source sequence"))?;
        let query = self.context(*first)?.select_query().clone();
        let children: Vec<Rc<dyn BuildContext>> = sequence
            .iter()
            .map(|id| self.context(*id))
            .collect::<BuildResult<_>>()?;

        let projection_parameter = self.new_parameter("p", lambda.body.ty());
        let id = self.add_context(|id| {
            Rc::new(SelectContext::new(
                id,
                lambda,
                sequence.to_vec(),
                query,
                projection_parameter,
            ))
        });
        for child in children {
            child.set_parent(Some(id));
        }
        Ok(id)
    }

    /// Restrict `source` with `predicate`, a single-parameter boolean lambda.
    pub fn add_filter(&self, source: ContextId, predicate: Lambda) -> BuildResult<ContextId> {
        let parameter = predicate
            .parameters
            .first()
            .cloned()
            .ok_or_else(|| BuildError::unsupported("predicate without a parameter"))?;
        let passthrough = Lambda::new(vec![parameter.clone()], parameter.to_expr());
        let id = self.add_select(passthrough, &[source])?;

        let condition = self.convert_predicate(id, &predicate.body)?;
        self.context(id)?
            .select_query()
            .borrow_mut()
            .add_where(condition);
        Ok(id)
    }

    /// Mount the statement of `inner` as a derived table of a new statement.
    pub fn add_subquery(&self, inner: ContextId) -> BuildResult<ContextId> {
        let inner_context = self.context(inner)?;
        let inner_query = inner_context.select_query().clone();
        let query = self.new_query();
        let source = self.next_source_id();
        query.borrow_mut().add_derived(source, inner_query);

        let id = self.add_context(|id| Rc::new(SubQueryContext::new(id, inner, source, query)));
        inner_context.set_parent(Some(id));
        Ok(id)
    }

    /// The nearest context, walking up from `start`, that owns the root object
    /// of `expr` as its parameter.
    pub fn find_root_context(
        &self,
        start: ContextId,
        expr: &ExprRef,
    ) -> BuildResult<Option<ContextId>> {
        let root = root_object(expr);
        let mut current = Some(start);
        while let Some(id) = current {
            let context = self.context(id)?;
            if context
                .classify(self, Some(&root), 0, RequestFor::Root)?
                .result
            {
                return Ok(Some(id));
            }
            current = context.parent();
        }
        Ok(None)
    }

    /// Value-construction form of `expr` as seen from `context`.
    pub fn build_mapping(
        &self,
        context: ContextId,
        expr: &ExprRef,
        enforce_server_side: bool,
    ) -> BuildResult<MappingRef> {
        log::trace!("ExpressionBuilder::build_mapping: {} in {}", expr, context);
        match expr.as_ref() {
            Expr::Parameter(_) | Expr::MemberAccess { .. } => {
                match self.find_root_context(context, expr)? {
                    Some(owner) => {
                        self.context(owner)?
                            .build_expression(self, Some(expr), 0, enforce_server_side)
                    }
                    None => self.build_sql(context, expr),
                }
            }
            Expr::New {
                object_type,
                members,
                args,
            } => {
                let args = args
                    .iter()
                    .map(|a| self.build_mapping(context, a, enforce_server_side))
                    .collect::<BuildResult<Vec<_>>>()?;
                Ok(Rc::new(Mapping::New {
                    object_type: object_type.clone(),
                    members: members.iter().map(|m| m.name.clone()).collect(),
                    args,
                }))
            }
            Expr::MemberInit {
                object_type,
                bindings,
            } => {
                let bindings = bindings
                    .iter()
                    .map(|(member, value)| {
                        Ok(MemberMapping {
                            member: member.name.clone(),
                            value: self.build_mapping(context, value, enforce_server_side)?,
                        })
                    })
                    .collect::<BuildResult<Vec<_>>>()?;
                Ok(Rc::new(Mapping::MemberInit {
                    object_type: object_type.clone(),
                    bindings,
                }))
            }
            Expr::Constant { value, value_type } if !enforce_server_side => {
                Ok(Mapping::constant(value.clone(), value_type.clone()))
            }
            Expr::Constant { .. } | Expr::MethodCall { .. } | Expr::Other(_) => {
                self.build_sql(context, expr)
            }
        }
    }

    /// Translate `expr`, add it to the statement of `context` and read it back
    /// from the outermost statement.
    pub fn build_sql(&self, context: ContextId, expr: &ExprRef) -> BuildResult<MappingRef> {
        let sql = self.convert_to_sql(context, expr)?.into_value();
        let context = self.context(context)?;
        let query = context.select_query();
        let index = query.borrow_mut().select.add(sql);
        let index = context.convert_to_parent_index(self, index, query)?;
        Ok(Mapping::column(index, expr.ty()))
    }

    /// SQL for every value `expr` carries: constructions are flattened into
    /// member-tagged entries, object-valued references are expanded by their
    /// owning context, anything else is a single translated scalar.
    pub fn convert_expressions(
        &self,
        context: ContextId,
        expr: &ExprRef,
        flags: ConvertFlags,
    ) -> BuildResult<Vec<SqlInfo>> {
        match expr.as_ref() {
            Expr::New { members, args, .. } => {
                let mut out = Vec::new();
                for (i, arg) in args.iter().enumerate() {
                    let converted = self.convert_expressions(context, arg, flags)?;
                    match members.get(i) {
                        Some(member) => {
                            out.extend(converted.into_iter().map(|s| s.with_member(member)))
                        }
                        None => out.extend(converted),
                    }
                }
                Ok(out)
            }
            Expr::MemberInit { bindings, .. } => {
                let mut out = Vec::new();
                for (member, value) in bindings {
                    let converted = self.convert_expressions(context, value, flags)?;
                    out.extend(converted.into_iter().map(|s| s.with_member(member)));
                }
                Ok(out)
            }
            _ => {
                if let Some(owner) = self.find_root_context(context, expr)? {
                    let owner = self.context(owner)?;
                    if owner
                        .classify(self, Some(expr), 0, RequestFor::Object)?
                        .result
                    {
                        return owner.convert_to_sql(self, Some(expr), 0, flags);
                    }
                }
                Ok(vec![SqlInfo::new(self.convert_to_sql(context, expr)?)])
            }
        }
    }

    /// Resolve `root` to its row mapping and render the accumulated statement.
    pub fn build_query(&self, root: ContextId) -> BuildResult<CompiledQuery> {
        let context = self.context(root)?;
        let mapping = context.build_expression(self, None, 0, false)?;
        let statement = context.result_statement();
        let options = self.config.render_options();
        let sql = statement.render(&options)?;
        let columns = statement.column_names(&options);
        log::debug!("ExpressionBuilder::build_query: {}", sql);
        Ok(CompiledQuery {
            statement,
            mapping,
            sql,
            columns,
        })
    }
}
