//! Projection scope.
//!
//! A select context maps a shape-transforming lambda onto the column list of
//! the statement it shares with its children. It comes in two flavours decided
//! once at construction:
//!
//! - **structured**: the body constructs an object with named members
//!   (`x => new { A = x.Name, B = x.Id }`). Each member's source expression is
//!   kept in a [`MemberTable`] and requests are routed member by member.
//! - **scalar**: anything else (`x => x`, `x => x.Name`, `x => Count(x.Orders)`).
//!   Requests are forwarded to the child owning the body's root.
//!
//! Every resolution is memoized per context: column indices, once issued for
//! an (expression, level, flags) triple, are returned unchanged on repeat.

use std::{
    cell::{Cell, OnceCell, RefCell},
    collections::HashMap,
    rc::Rc,
    sync::Arc,
};

use crate::expression::{
    level_expression, replace_node, root_object, Expr, ExprRef, Lambda, Member, NodeKind,
    Parameter, ShapeType,
};
use crate::sql::{SharedQuery, SqlExpr, SqlSelectStatement};

use super::{
    context::{
        BuildContext, BuildInfo, ContextId, ConvertFlags, IsExpressionResult, RequestFor, SqlInfo,
    },
    errors::{BuildError, BuildResult},
    mapping::{Mapping, MappingRef, MemberMapping},
    member_table::MemberTable,
    ExpressionBuilder,
};

type IndexKey = (Option<ExprRef>, usize, ConvertFlags);
type MemberIndexKey = (Option<Member>, ConvertFlags);

/// How a member access of a structured projection is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberRoute {
    /// The member is the child's own parameter: the whole child value.
    WholeChild,
    /// The member is a reference into a child; the rewritten expression goes
    /// to that child.
    Child,
    /// The member is a nested construction; the addressed member is resolved
    /// within it.
    Nested,
    /// Anything else, evaluated by this context.
    Local,
}

/// Same node: identical, or structurally equal.
fn same(a: &ExprRef, b: &ExprRef) -> bool {
    Arc::ptr_eq(a, b) || a == b
}

/// `expr` with `level_expr` swapped for `member_expr`; just `member_expr` when
/// `level_expr` is the whole of `expr`.
fn substitute(expr: &ExprRef, level_expr: &ExprRef, member_expr: &ExprRef) -> ExprRef {
    if same(level_expr, expr) {
        member_expr.clone()
    } else {
        replace_node(expr, level_expr, member_expr)
    }
}

fn single(mut infos: Vec<SqlInfo>, expr: &ExprRef) -> BuildResult<(SqlInfo, usize)> {
    if infos.len() != 1 {
        return Err(BuildError::ExpectedSingleField {
            expression: expr.to_string(),
            count: infos.len(),
        });
    }
    let info = infos.remove(0);
    let index = info.index.ok_or_else(|| BuildError::ExpectedSingleField {
        expression: expr.to_string(),
        count: 0,
    })?;
    Ok((info, index))
}

#[derive(Debug)]
pub struct SelectContext {
    id: ContextId,
    parent: Cell<Option<ContextId>>,
    sequence: Vec<ContextId>,
    lambda: Lambda,
    body: ExprRef,
    select_query: SharedQuery,
    statement: OnceCell<Rc<SqlSelectStatement>>,
    is_scalar: bool,
    members: RefCell<MemberTable>,
    root_mapping: RefCell<Option<MappingRef>>,
    sql_cache: RefCell<HashMap<Member, Vec<SqlInfo>>>,
    expression_index: RefCell<HashMap<IndexKey, Vec<SqlInfo>>>,
    member_index: RefCell<HashMap<MemberIndexKey, Vec<SqlInfo>>>,
    last_association: RefCell<Option<(Option<ExprRef>, usize)>>,
    /// Stand-in for the projected value when expanding all members.
    projection_parameter: Parameter,
}

impl SelectContext {
    pub fn new(
        id: ContextId,
        lambda: Lambda,
        sequence: Vec<ContextId>,
        select_query: SharedQuery,
        projection_parameter: Parameter,
    ) -> Self {
        let body = lambda.body.clone();
        let members = MemberTable::from_projection(&body);
        let is_scalar = members.is_none();
        log::debug!(
            "SelectContext::new: {} projects {} ({})",
            id,
            body,
            if is_scalar { "scalar" } else { "structured" }
        );

        Self {
            id,
            parent: Cell::new(None),
            sequence,
            lambda,
            body,
            select_query,
            statement: OnceCell::new(),
            is_scalar,
            members: RefCell::new(members.unwrap_or_default()),
            root_mapping: RefCell::new(None),
            sql_cache: RefCell::new(HashMap::new()),
            expression_index: RefCell::new(HashMap::new()),
            member_index: RefCell::new(HashMap::new()),
            last_association: RefCell::new(None),
            projection_parameter,
        }
    }

    fn body_type(&self) -> Option<String> {
        self.body.ty().type_name().map(str::to_string)
    }

    /// Type within which same-named members of related types are considered
    /// the same member. Scalar projections have none.
    fn component_type(&self) -> Option<String> {
        if self.is_scalar {
            None
        } else {
            self.body_type()
        }
    }

    fn parameter_for(&self, child: ContextId) -> Option<&Parameter> {
        let index = if self.sequence.is_empty() {
            0
        } else {
            self.sequence.iter().position(|c| *c == child)?
        };
        self.lambda.parameters.get(index)
    }

    fn is_parameter_of(&self, expr: &ExprRef, child: ContextId) -> bool {
        match (expr.as_parameter(), self.parameter_for(child)) {
            (Some(p), Some(q)) => p == q,
            _ => false,
        }
    }

    fn to_parent_index(&self, b: &ExpressionBuilder, index: usize) -> BuildResult<usize> {
        match self.parent.get() {
            Some(parent) => b
                .context(parent)?
                .convert_to_parent_index(b, index, &self.select_query),
            None => Ok(index),
        }
    }

    fn is_sub_query(&self, b: &ExpressionBuilder) -> BuildResult<bool> {
        let mut current = self.parent.get();
        while let Some(id) = current {
            let context = b.context(id)?;
            if context
                .classify(b, None, 0, RequestFor::SubQuery)?
                .result
            {
                return Ok(true);
            }
            current = context.parent();
        }
        Ok(false)
    }

    /// Member source lookup: exact, then same name within the component type,
    /// then interface member against its implementer.
    fn find_member_source(&self, b: &ExpressionBuilder, member: &Member) -> Option<ExprRef> {
        let members = self.members.borrow();
        if let Some(expr) = members.get(member) {
            return Some(expr);
        }
        let component = self.component_type();
        members
            .find_equivalent(b.schema(), member, component.as_deref())
            .or_else(|| members.find_interface_match(b.schema(), member, component.as_deref()))
    }

    fn member_source(
        &self,
        b: &ExpressionBuilder,
        member: &Member,
        expr: &ExprRef,
    ) -> BuildResult<ExprRef> {
        self.find_member_source(b, member)
            .ok_or_else(|| BuildError::InvalidMemberPath {
                expression: expr.to_string(),
                member: member.to_string(),
            })
    }

    /// The child context responsible for `expr` at `level`.
    fn get_sequence(
        &self,
        b: &ExpressionBuilder,
        expr: &ExprRef,
        level: usize,
    ) -> BuildResult<Option<ContextId>> {
        if let [only] = self.sequence.as_slice() {
            if b.context(*only)?.parent().is_none() {
                return Ok(Some(*only));
            }
        }

        let root = if self.is_scalar {
            Some(root_object(expr))
        } else {
            let level_expr = level_expression(expr, level);
            match level_expr.as_ref() {
                Expr::MemberAccess { member, .. } => {
                    let source = self.member_source(b, member, expr)?;
                    let root = root_object(&source);
                    if !root.is_parameter() {
                        return Ok(None);
                    }
                    Some(root)
                }
                Expr::Parameter(_) => Some(root_object(expr)),
                _ => None,
            }
        };

        let Some(root) = root else {
            return Ok(None);
        };

        for (i, parameter) in self.lambda.parameters.iter().enumerate() {
            if root.as_parameter() == Some(parameter) {
                return Ok(self.sequence.get(i).copied());
            }
        }

        for child in &self.sequence {
            if b.context(*child)?.parent().is_some() {
                if let Some(found) = b.find_root_context(*child, &root)? {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }

    fn require_sequence(
        &self,
        b: &ExpressionBuilder,
        expr: &ExprRef,
        level: usize,
    ) -> BuildResult<ContextId> {
        self.get_sequence(b, expr, level)?.ok_or_else(|| {
            BuildError::unsupported(format!("no source owns '{}' at level {}", expr, level))
        })
    }

    /// Routing for scalar projections.
    fn process_scalar<T>(
        &self,
        b: &ExpressionBuilder,
        expr: &ExprRef,
        level: usize,
        action: &mut dyn FnMut(ContextId, Option<&ExprRef>, usize) -> BuildResult<T>,
        default: &mut dyn FnMut() -> BuildResult<T>,
    ) -> BuildResult<T> {
        if level == 0 {
            if self.body.is_parameter() && self.lambda.parameters.len() == 1 {
                let sequence = self.require_sequence(b, &self.body, 0)?;
                return if same(expr, &self.body) {
                    action(sequence, None, 0)
                } else {
                    action(sequence, Some(expr), 1)
                };
            }

            let level_expr = level_expression(expr, 0);
            if !same(&level_expr, expr) {
                return match self.get_sequence(b, expr, level)? {
                    None => default(),
                    Some(context) => {
                        let next = if self.sequence.contains(&context) { 1 } else { 0 };
                        action(context, Some(expr), next)
                    }
                };
            }

            if expr.is_parameter() {
                if let Some(sequence) = self.get_sequence(b, expr, level)? {
                    if self.is_parameter_of(&level_expr, sequence) {
                        return action(sequence, None, 0);
                    }
                }
            }

            return match self.body.kind() {
                NodeKind::MemberAccess => {
                    let sequence = self.require_sequence(b, expr, level)?;
                    action(sequence, None, 0)
                }
                _ => default(),
            };
        }

        if root_object(&self.body).is_parameter() {
            let level_expr = level_expression(expr, level - 1);
            let rewritten = substitute(expr, &level_expr, &self.body);
            return action(self.id, Some(&rewritten), 0);
        }

        Err(BuildError::unsupported(format!(
            "'{}' at level {} over scalar projection '{}'",
            expr, level, self.body
        )))
    }

    /// Routing for a member access at `level` of a structured projection.
    /// `action` receives the [`MemberRoute`] that applied.
    fn process_member_access<T>(
        &self,
        b: &ExpressionBuilder,
        expr: &ExprRef,
        level_expr: &ExprRef,
        member: &Member,
        level: usize,
        action: &mut dyn FnMut(
            MemberRoute,
            ContextId,
            Option<&ExprRef>,
            usize,
            &ExprRef,
        ) -> BuildResult<T>,
    ) -> BuildResult<T> {
        let member_expr = self.member_source(b, member, expr)?;
        let rewritten = substitute(expr, level_expr, &member_expr);
        let sequence = self.get_sequence(b, expr, level)?;
        let mut next_level = 1;

        if let Some(sequence) = sequence {
            if self.sequence.is_empty() || self.sequence.contains(&sequence) {
                if self.is_parameter_of(&member_expr, sequence) && same(level_expr, expr) {
                    return action(MemberRoute::WholeChild, sequence, None, 0, &member_expr);
                }
            } else {
                next_level = 0;
            }
        }

        match member_expr.kind() {
            NodeKind::MemberAccess | NodeKind::Parameter => {
                if let Some(sequence) = sequence {
                    return action(
                        MemberRoute::Child,
                        sequence,
                        Some(&rewritten),
                        next_level,
                        &member_expr,
                    );
                }
            }
            NodeKind::New | NodeKind::MemberInit => {
                let nested = self.nested_member_expression(&member_expr, expr, level + 1)?;
                return action(MemberRoute::Nested, self.id, Some(&nested), 0, &member_expr);
            }
            _ => {}
        }

        action(MemberRoute::Local, self.id, None, 0, &member_expr)
    }

    /// Follow the member path of `expr` from `level` into the construction
    /// `construction`, returning the source of the addressed member.
    fn nested_member_expression(
        &self,
        construction: &ExprRef,
        expr: &ExprRef,
        level: usize,
    ) -> BuildResult<ExprRef> {
        if !construction.is_construction() {
            let outer = level_expression(expr, level.saturating_sub(1));
            return Ok(substitute(expr, &outer, construction));
        }

        let level_expr = level_expression(expr, level);
        let Expr::MemberAccess { member, .. } = level_expr.as_ref() else {
            return Err(BuildError::unsupported(format!(
                "'{}' does not select a member of '{}'",
                expr, construction
            )));
        };

        let found = match construction.as_ref() {
            Expr::New { members, args, .. } => {
                if members.is_empty() {
                    return Err(BuildError::unsupported(format!(
                        "positional construction '{}' has no members",
                        construction
                    )));
                }
                members
                    .iter()
                    .zip(args)
                    .find(|(m, _)| m.name == member.name && m.declaring_type == member.declaring_type)
                    .map(|(_, a)| a.clone())
            }
            Expr::MemberInit { bindings, .. } => bindings
                .iter()
                .find(|(m, _)| m.name == member.name)
                .map(|(_, a)| a.clone()),
            _ => None,
        };

        let source = found.ok_or_else(|| BuildError::InvalidMemberPath {
            expression: expr.to_string(),
            member: member.to_string(),
        })?;

        if same(&level_expr, expr) {
            Ok(source)
        } else {
            self.nested_member_expression(&source, expr, level + 1)
        }
    }

    /// Source expression of `member`, with name/type-compatible fallback,
    /// the entity alias map, and, when `add` is set, a default-valued constant
    /// synthesized for members of the projected type that were never assigned.
    fn get_member_expression(
        &self,
        b: &ExpressionBuilder,
        member: &Member,
        add: bool,
        member_type: &ShapeType,
        source: &ExprRef,
    ) -> BuildResult<ExprRef> {
        let schema = b.schema();
        let component = self.component_type();
        {
            let members = self.members.borrow();
            if let Some(expr) = members.get(member) {
                return Ok(expr);
            }
            if let Some(expr) = members.find_equivalent(schema, member, component.as_deref()) {
                return Ok(expr);
            }
        }

        let body_type = self.body_type();
        let declared_on_body = body_type
            .as_deref()
            .is_some_and(|t| schema.is_same_or_parent_of(&member.declaring_type, t));

        if declared_on_body {
            if let (Expr::MemberInit { .. }, Some(body_type)) =
                (self.body.as_ref(), body_type.as_deref())
            {
                if let Some(entity) = schema.entity(body_type) {
                    if let Some(target) = entity.aliases.get(&member.name) {
                        let aliased = schema.member(body_type, target).ok_or_else(|| {
                            BuildError::InvalidMemberPath {
                                expression: source.to_string(),
                                member: format!("{}.{}", body_type, target),
                            }
                        })?;
                        log::debug!(
                            "SelectContext::get_member_expression: alias {} -> {}",
                            member,
                            aliased
                        );
                        return self.get_member_expression(b, &aliased, add, member_type, source);
                    }

                    let aliased_by = entity
                        .aliases
                        .iter()
                        .find(|(_, target)| **target == member.name)
                        .map(|(alias, _)| alias.clone());
                    if let Some(alias) = aliased_by {
                        let members = self.members.borrow();
                        if let Some(expr) = members
                            .columns()
                            .into_iter()
                            .find(|(m, _)| m.name == alias)
                            .map(|(_, e)| e)
                        {
                            return Ok(expr);
                        }
                        log::debug!(
                            "SelectContext::get_member_expression: alias {} of {} not projected",
                            alias,
                            member
                        );
                    }
                }
            }

            if add {
                let value = schema.default_value(member_type);
                let constant = Expr::constant(value, member_type.clone());
                log::debug!(
                    "SelectContext::get_member_expression: {} defaults to {}",
                    member,
                    constant
                );
                self.members
                    .borrow_mut()
                    .insert(member.clone(), constant.clone());
                return Ok(constant);
            }
        }

        Err(BuildError::InvalidMemberPath {
            expression: source.to_string(),
            member: member.to_string(),
        })
    }

    /// Translate `expr` within this context, wrapping conditions so they can
    /// sit in a select list.
    fn convert_checked(
        &self,
        b: &ExpressionBuilder,
        expr: &ExprRef,
        flags: ConvertFlags,
    ) -> BuildResult<Vec<SqlInfo>> {
        Ok(b.convert_expressions(self.id, expr, flags)?
            .into_iter()
            .map(|mut info| {
                info.sql = info.sql.into_value();
                info
            })
            .collect())
    }

    fn convert_member(
        &self,
        b: &ExpressionBuilder,
        member: &Member,
        expr: &ExprRef,
        flags: ConvertFlags,
    ) -> BuildResult<Vec<SqlInfo>> {
        Ok(self
            .convert_checked(b, expr, flags)?
            .into_iter()
            .map(|info| info.with_member(member))
            .collect())
    }

    /// Bind `info` to a column of this context's statement. A column shared by
    /// several members keeps the name of the first one.
    fn set_info(&self, info: &mut SqlInfo, member: Option<&Member>) {
        let sql = info.sql.clone().into_value();
        let mut query = self.select_query.borrow_mut();
        let index = query.select.add(sql.clone());
        if let Some(member) = member {
            let unaliased = query
                .select
                .column(index)
                .is_some_and(|c| c.alias.is_none());
            if unaliased {
                query.select.set_alias(index, member.name.clone());
            }
        }
        info.sql = sql;
        info.query = Some(self.select_query.clone());
        info.index = Some(index);
    }

    /// Construction inside a subquery: every argument is read through the
    /// context owning it.
    fn build_construction(
        &self,
        b: &ExpressionBuilder,
        construction: &ExprRef,
        enforce_server_side: bool,
    ) -> BuildResult<MappingRef> {
        match construction.as_ref() {
            Expr::New {
                object_type,
                members,
                args,
            } => {
                let args = args
                    .iter()
                    .map(|a| self.build_construction_part(b, a, enforce_server_side))
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
                            value: self.build_construction_part(b, value, enforce_server_side)?,
                        })
                    })
                    .collect::<BuildResult<Vec<_>>>()?;
                Ok(Rc::new(Mapping::MemberInit {
                    object_type: object_type.clone(),
                    bindings,
                }))
            }
            _ => b.build_mapping(self.id, construction, enforce_server_side),
        }
    }

    fn build_construction_part(
        &self,
        b: &ExpressionBuilder,
        part: &ExprRef,
        enforce_server_side: bool,
    ) -> BuildResult<MappingRef> {
        match part.kind() {
            NodeKind::MemberAccess | NodeKind::Parameter => {
                let owner = self.get_sequence(b, part, 0)?.unwrap_or(self.id);
                b.build_mapping(owner, part, enforce_server_side)
            }
            NodeKind::New | NodeKind::MemberInit => {
                self.build_construction(b, part, enforce_server_side)
            }
            _ => b.build_mapping(self.id, part, enforce_server_side),
        }
    }

    fn classify_internal(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        request: RequestFor,
    ) -> BuildResult<IsExpressionResult> {
        match request {
            RequestFor::SubQuery => return Ok(IsExpressionResult::FALSE),
            RequestFor::Root => {
                let result = expr.and_then(|e| e.as_parameter()).is_some_and(|p| {
                    if self.sequence.len() == 1 {
                        self.lambda.parameters.first() == Some(p)
                    } else {
                        self.lambda.parameters.iter().any(|q| q == p)
                    }
                });
                return Ok(IsExpressionResult::new(result));
            }
            _ => {}
        }

        if self.is_scalar {
            let Some(expr) = expr else {
                let body = self.body.clone();
                return self.classify(b, Some(&body), 0, request);
            };
            return self.process_scalar(
                b,
                expr,
                level,
                &mut |ctx, ex, l| b.context(ctx)?.classify(b, ex, l, request),
                &mut || Ok(IsExpressionResult::new(request == RequestFor::Expression)),
            );
        }

        let Some(expr) = expr else {
            if request == RequestFor::Expression {
                let sources = self.members.borrow().values();
                for source in sources {
                    if self
                        .classify(b, Some(&source), 0, request)?
                        .result
                    {
                        return Ok(IsExpressionResult::new(true));
                    }
                }
                return Ok(IsExpressionResult::FALSE);
            }
            return Ok(IsExpressionResult::new(request == RequestFor::Object));
        };

        let level_expr = level_expression(expr, level);
        match level_expr.as_ref() {
            Expr::MemberAccess { member, .. } => {
                let Some(member_expr) = self.find_member_source(b, member) else {
                    return Ok(IsExpressionResult::new(request == RequestFor::Expression));
                };
                if same(&level_expr, expr) && member_expr.is_construction() {
                    return Ok(IsExpressionResult::new(request == RequestFor::Object));
                }
                self.process_member_access(
                    b,
                    expr,
                    &level_expr,
                    member,
                    level,
                    &mut |route, ctx, ex, l, source| {
                        if route == MemberRoute::Local {
                            Ok(IsExpressionResult {
                                result: request == RequestFor::Expression,
                                expression: Some(source.clone()),
                            })
                        } else {
                            b.context(ctx)?.classify(b, ex, l, request)
                        }
                    },
                )
            }
            Expr::Parameter(_) => {
                let sequence = self.require_sequence(b, expr, level)?;
                if same(&level_expr, expr) {
                    if self.is_parameter_of(&level_expr, sequence) {
                        return b.context(sequence)?.classify(b, None, 0, request);
                    }
                } else if level == 0 {
                    return b.context(sequence)?.classify(b, Some(expr), 1, request);
                }
                Err(BuildError::unsupported(format!(
                    "'{}' is not a parameter of this projection",
                    level_expr
                )))
            }
            Expr::New { .. } | Expr::MemberInit { .. } => {
                Ok(IsExpressionResult::new(request == RequestFor::Object))
            }
            _ => Ok(IsExpressionResult::new(request == RequestFor::Expression)),
        }
    }

    fn convert_to_index_internal(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        flags: ConvertFlags,
    ) -> BuildResult<Vec<SqlInfo>> {
        if self.is_scalar {
            if let Some(body) = self.body.as_parameter() {
                for (i, parameter) in self.lambda.parameters.iter().enumerate() {
                    if parameter == body {
                        if let Some(child) = self.sequence.get(i) {
                            return b.context(*child)?.convert_to_index(b, expr, level, flags);
                        }
                    }
                }
            }

            let Some(expr) = expr else {
                let key = (None, flags);
                if let Some(hit) = self.member_index.borrow().get(&key) {
                    return Ok(hit.clone());
                }
                let mut infos = self.convert_to_sql(b, None, 0, flags)?;
                for info in &mut infos {
                    self.set_info(info, None);
                }
                return Ok(self
                    .member_index
                    .borrow_mut()
                    .entry(key)
                    .or_insert(infos)
                    .clone());
            };

            return self.process_scalar(
                b,
                expr,
                level,
                &mut |ctx, ex, l| b.context(ctx)?.convert_to_index(b, ex, l, flags),
                &mut || {
                    let sequence = self.require_sequence(b, expr, level)?;
                    b.context(sequence)?
                        .convert_to_index(b, Some(expr), level + 1, flags)
                },
            );
        }

        let Some(expr) = expr else {
            let projected = self.projection_parameter.to_expr();
            let columns = self.members.borrow().columns();
            let mut out = Vec::new();
            for (member, _) in columns {
                let access = Expr::member(&projected, member.clone());
                for info in self.convert_to_index(b, Some(&access), 1, flags)? {
                    out.push(info.with_member(&member));
                }
            }
            return Ok(out);
        };

        if level == 0 {
            let mut infos = b.convert_expressions(self.id, expr, flags)?;
            for info in &mut infos {
                self.set_info(info, None);
            }
            return Ok(infos);
        }

        let level_expr = level_expression(expr, level);
        match level_expr.as_ref() {
            Expr::MemberAccess { member, .. } => {
                if same(&level_expr, expr) {
                    let key = (Some(member.clone()), flags);
                    if let Some(hit) = self.member_index.borrow().get(&key) {
                        return Ok(hit.clone());
                    }

                    let mut infos = self.convert_to_sql(b, Some(expr), level, flags)?;
                    if flags == ConvertFlags::Field && infos.len() != 1 {
                        return Err(BuildError::ExpectedSingleField {
                            expression: expr.to_string(),
                            count: infos.len(),
                        });
                    }
                    for info in &mut infos {
                        self.set_info(info, Some(member));
                    }
                    log::debug!(
                        "SelectContext::convert_to_index: {} bound {} to {:?}",
                        self.id,
                        member,
                        infos.iter().map(|i| i.index).collect::<Vec<_>>()
                    );
                    return Ok(self
                        .member_index
                        .borrow_mut()
                        .entry(key)
                        .or_insert(infos)
                        .clone());
                }

                self.process_member_access(
                    b,
                    expr,
                    &level_expr,
                    member,
                    level,
                    &mut |route, ctx, ex, l, _| {
                        if route == MemberRoute::Local {
                            let sequence = self.require_sequence(b, expr, level)?;
                            b.context(sequence)?
                                .convert_to_index(b, Some(expr), level + 1, flags)
                        } else {
                            b.context(ctx)?.convert_to_index(b, ex, l, flags)
                        }
                    },
                )
            }
            Expr::Parameter(_) if !same(&level_expr, expr) => {
                let sequence = self.require_sequence(b, expr, level)?;
                b.context(sequence)?
                    .convert_to_index(b, Some(expr), level + 1, flags)
            }
            _ => Err(BuildError::unsupported(format!(
                "'{}' at level {} cannot be indexed",
                expr, level
            ))),
        }
    }
}

impl BuildContext for SelectContext {
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
        log::trace!(
            "SelectContext::build_expression: {} {:?} level {}",
            self.id,
            expr.map(|e| e.to_string()),
            level
        );

        let key = (expr.cloned(), level, ConvertFlags::Field);
        let indexed = self
            .expression_index
            .borrow()
            .get(&key)
            .and_then(|infos| infos.first().and_then(|i| i.index));
        if let Some(index) = indexed {
            let value = expr.cloned().unwrap_or_else(|| self.body.clone());
            if self
                .classify(b, Some(&value), level, RequestFor::Object)?
                .result
            {
                return b.build_mapping(self.id, &value, enforce_server_side);
            }
            let index = self.to_parent_index(b, index)?;
            return Ok(Mapping::column(index, value.ty()));
        }

        let Some(expr) = expr else {
            if let Some(mapping) = self.root_mapping.borrow().clone() {
                return Ok(mapping);
            }
            let body = self.body.clone();
            let mapping = if self.is_scalar
                && matches!(body.kind(), NodeKind::MethodCall | NodeKind::Other)
            {
                // Same column as every other reference to the projected value.
                let infos = self.convert_to_index(b, None, 0, ConvertFlags::Field)?;
                let (_, index) = single(infos, &body)?;
                Mapping::column(self.to_parent_index(b, index)?, body.ty())
            } else {
                b.build_mapping(self.id, &body, enforce_server_side)?
            };
            return Ok(self
                .root_mapping
                .borrow_mut()
                .get_or_insert(mapping)
                .clone());
        };

        let level_expr = level_expression(expr, level);

        if self.is_scalar {
            if !self.body.is_parameter()
                && level == 0
                && same(&level_expr, expr)
                && self.is_sub_query(b)?
                && self
                    .classify(b, None, 0, RequestFor::Expression)?
                    .result
            {
                let infos = self.convert_to_index(b, Some(expr), level, ConvertFlags::Field)?;
                let (_, index) = single(infos, expr)?;
                let index = self.to_parent_index(b, index)?;
                return Ok(Mapping::column(index, expr.ty()));
            }

            return self.process_scalar(
                b,
                expr,
                level,
                &mut |ctx, ex, l| {
                    b.context(ctx)?
                        .build_expression(b, ex, l, enforce_server_side)
                },
                &mut || {
                    let sequence = self.require_sequence(b, expr, level)?;
                    b.context(sequence)?
                        .build_expression(b, None, 0, enforce_server_side)
                },
            );
        }

        if level == 0 {
            let sequence = self.require_sequence(b, expr, level)?;
            let sequence = b.context(sequence)?;
            return if same(&level_expr, expr) {
                sequence.build_expression(b, None, 0, enforce_server_side)
            } else {
                sequence.build_expression(b, Some(expr), level + 1, enforce_server_side)
            };
        }

        let Expr::MemberAccess { member, .. } = level_expr.as_ref() else {
            return Err(BuildError::unsupported(format!(
                "'{}' at level {} is not a member access",
                expr, level
            )));
        };

        let whole = same(&level_expr, expr);
        let member_expr =
            self.get_member_expression(b, member, whole, &level_expr.ty(), expr)?;

        if whole {
            if self.is_sub_query(b)? {
                if member_expr.is_construction() {
                    return self.build_construction(b, &member_expr, enforce_server_side);
                }

                let probe = if member_expr.is_parameter() {
                    None
                } else {
                    Some(&member_expr)
                };
                if !self.classify(b, probe, 0, RequestFor::Object)?.result
                    && !self.classify(b, probe, 0, RequestFor::Field)?.result
                {
                    let infos =
                        self.convert_to_index(b, Some(expr), level, ConvertFlags::Field)?;
                    let (_, index) = single(infos, expr)?;
                    let index = self.to_parent_index(b, index)?;
                    return Ok(Mapping::column(index, expr.ty()));
                }
            }
            return b.build_mapping(self.id, &member_expr, enforce_server_side);
        }

        let sequence = self.get_sequence(b, expr, level)?;
        match member_expr.kind() {
            NodeKind::Parameter => {
                if let Some(sequence) = sequence {
                    if self.is_parameter_of(&member_expr, sequence) {
                        return b.context(sequence)?.build_expression(
                            b,
                            Some(expr),
                            level + 1,
                            enforce_server_side,
                        );
                    }
                }
            }
            NodeKind::New | NodeKind::MemberInit => {
                let nested = self.nested_member_expression(&member_expr, expr, level + 1)?;
                return b.build_mapping(self.id, &nested, enforce_server_side);
            }
            _ => {}
        }

        let rewritten = replace_node(expr, &level_expr, &member_expr);
        match sequence {
            None => b.build_mapping(self.id, &rewritten, enforce_server_side),
            Some(sequence) => b.context(sequence)?.build_expression(
                b,
                Some(&rewritten),
                1,
                enforce_server_side,
            ),
        }
    }

    fn convert_to_sql(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        flags: ConvertFlags,
    ) -> BuildResult<Vec<SqlInfo>> {
        let _guard = b.enter()?;
        log::trace!(
            "SelectContext::convert_to_sql: {} {:?} level {} {:?}",
            self.id,
            expr.map(|e| e.to_string()),
            level,
            flags
        );

        if let Some(e) = expr {
            if level > 0 {
                if let Expr::MethodCall { method, .. } = e.as_ref() {
                    if method.is_subquery_trigger() {
                        return Ok(vec![SqlInfo::new(b.sub_query_to_sql(self.id, e)?)]);
                    }
                }
            }
        }

        if self.is_scalar {
            let Some(expr) = expr else {
                let body = self.body.clone();
                return b.convert_expressions(self.id, &body, flags);
            };

            let mut flags = flags;
            if !self.body.is_parameter() && level == 0 {
                let level_expr = level_expression(expr, level);
                if !same(&level_expr, expr)
                    && flags != ConvertFlags::Field
                    && self
                        .classify(b, Some(expr), level, RequestFor::Field)?
                        .result
                {
                    flags = ConvertFlags::Field;
                }
            }

            return self.process_scalar(
                b,
                expr,
                level,
                &mut |ctx, ex, l| b.context(ctx)?.convert_to_sql(b, ex, l, flags),
                &mut || Ok(vec![SqlInfo::new(b.convert_to_sql(self.id, expr)?)]),
            );
        }

        let Some(expr) = expr else {
            if flags == ConvertFlags::Field {
                return Err(BuildError::unsupported(format!(
                    "structured projection '{}' is not a single field",
                    self.body
                )));
            }
            let columns = self.members.borrow().columns();
            let mut out = Vec::new();
            for (member, source) in columns {
                out.extend(self.convert_member(b, &member, &source, flags)?);
            }
            return Ok(out);
        };

        let level_expr = level_expression(expr, level);
        match level_expr.as_ref() {
            Expr::MemberAccess { member, .. } => {
                if level != 0 && same(&level_expr, expr) {
                    if let Some(hit) = self.sql_cache.borrow().get(member) {
                        return Ok(hit.clone());
                    }
                    let member_expr =
                        self.get_member_expression(b, member, true, &level_expr.ty(), expr)?;
                    let sql = self.convert_member(b, member, &member_expr, flags)?;
                    return Ok(self
                        .sql_cache
                        .borrow_mut()
                        .entry(member.clone())
                        .or_insert(sql)
                        .clone());
                }

                self.process_member_access(
                    b,
                    expr,
                    &level_expr,
                    member,
                    level,
                    &mut |route, ctx, ex, l, source| {
                        if route == MemberRoute::Local {
                            let value = substitute(expr, &level_expr, source);
                            self.convert_checked(b, &value, flags)
                        } else {
                            b.context(ctx)?.convert_to_sql(b, ex, l, flags)
                        }
                    },
                )
            }
            Expr::Parameter(_) => {
                let sequence = self.require_sequence(b, expr, level)?;
                if !same(&level_expr, expr) {
                    return b
                        .context(sequence)?
                        .convert_to_sql(b, Some(expr), level + 1, flags);
                }
                if level == 0 {
                    return b.context(sequence)?.convert_to_sql(b, None, 0, flags);
                }
                Err(BuildError::unsupported(format!(
                    "parameter '{}' at level {}",
                    expr, level
                )))
            }
            _ if level == 0 => b.convert_expressions(self.id, expr, flags),
            _ => Err(BuildError::unsupported(format!(
                "'{}' at level {} cannot be converted",
                expr, level
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
        let _guard = b.enter()?;
        let key = (expr.cloned(), level, flags);
        if let Some(hit) = self.expression_index.borrow().get(&key) {
            return Ok(hit.clone());
        }

        let infos = self.convert_to_index_internal(b, expr, level, flags)?;
        let mut bound = Vec::with_capacity(infos.len());
        for info in infos {
            if info.is_bound_to(&self.select_query) {
                bound.push(info);
                continue;
            }
            let source = match (&info.query, info.index) {
                (Some(other), Some(index)) => Some(SqlExpr::ColumnRef {
                    query: other.borrow().id,
                    index,
                }),
                _ => None,
            };
            let Some(column) = source else {
                let mut info = info;
                self.set_info(&mut info, None);
                bound.push(info);
                continue;
            };
            let index = self.select_query.borrow_mut().select.add(column);
            bound.push(SqlInfo {
                members: info.members,
                sql: SqlExpr::ColumnRef {
                    query: self.select_query.borrow().id,
                    index,
                },
                query: Some(self.select_query.clone()),
                index: Some(index),
            });
        }

        Ok(self
            .expression_index
            .borrow_mut()
            .entry(key)
            .or_insert(bound)
            .clone())
    }

    /// Association requests carry a one-shot guard: a request identical to
    /// the one in progress answers false instead of recursing.
    fn classify(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        request: RequestFor,
    ) -> BuildResult<IsExpressionResult> {
        let _guard = b.enter()?;

        if request == RequestFor::Association {
            let key = (expr.cloned(), level);
            if self.last_association.borrow().as_ref() == Some(&key) {
                log::trace!(
                    "SelectContext::classify: {} association request re-entered",
                    self.id
                );
                return Ok(IsExpressionResult::FALSE);
            }
            *self.last_association.borrow_mut() = Some(key);
        }

        let result = self.classify_internal(b, expr, level, request);

        if request == RequestFor::Association {
            *self.last_association.borrow_mut() = None;
        }

        result
    }

    fn get_scope(
        &self,
        b: &ExpressionBuilder,
        expr: Option<&ExprRef>,
        level: usize,
        info: &BuildInfo,
    ) -> BuildResult<ContextId> {
        let _guard = b.enter()?;
        let Some(expr) = expr else {
            return Ok(self.id);
        };

        if self.is_scalar {
            return self.process_scalar(
                b,
                expr,
                level,
                &mut |ctx, ex, l| b.context(ctx)?.get_scope(b, ex, l, info),
                &mut || {
                    Err(BuildError::unsupported(format!(
                        "no scope owns '{}' in scalar projection '{}'",
                        expr, self.body
                    )))
                },
            );
        }

        let level_expr = level_expression(expr, level);
        match level_expr.as_ref() {
            Expr::MemberAccess { member, .. } => {
                if same(&level_expr, expr) && self.sequence.len() == 1 {
                    let member_expr =
                        self.get_member_expression(b, member, true, &level_expr.ty(), expr)?;
                    let nested = BuildInfo {
                        parent: Some(self.id),
                        expression: Some(member_expr.clone()),
                    };
                    return self.get_scope(b, Some(&member_expr), 0, &nested);
                }

                let found = self.process_member_access(
                    b,
                    expr,
                    &level_expr,
                    member,
                    level,
                    &mut |route, ctx, ex, l, _| {
                        if route == MemberRoute::Local {
                            Ok(None)
                        } else {
                            b.context(ctx)?.get_scope(b, ex, l, info).map(Some)
                        }
                    },
                )?;
                found.ok_or_else(|| {
                    BuildError::unsupported(format!("no scope owns '{}'", expr))
                })
            }
            Expr::Parameter(_) => {
                let sequence = self.require_sequence(b, expr, level)?;
                if same(&level_expr, expr) {
                    if self.is_parameter_of(&level_expr, sequence) {
                        return b.context(sequence)?.get_scope(b, None, 0, info);
                    }
                } else if level == 0 {
                    return b.context(sequence)?.get_scope(b, Some(expr), 1, info);
                }
                Err(BuildError::unsupported(format!(
                    "'{}' is not a parameter of this projection",
                    level_expr
                )))
            }
            _ if level == 0 => {
                let sequence = self.require_sequence(b, expr, level)?;
                b.context(sequence)?.get_scope(b, Some(expr), level + 1, info)
            }
            _ => Err(BuildError::unsupported(format!(
                "no scope owns '{}' at level {}",
                expr, level
            ))),
        }
    }

    /// Renames the sole FROM table; synthetic aliases are ignored.
    fn set_alias(&self, b: &ExpressionBuilder, alias: &str) {
        if alias.is_empty() || b.config().is_synthetic_alias(alias) {
            return;
        }
        let mut query = self.select_query.borrow_mut();
        if let [table] = query.from.tables.as_mut_slice() {
            table.alias = Some(alias.to_string());
        }
    }

    fn result_statement(&self) -> Rc<SqlSelectStatement> {
        self.statement
            .get_or_init(|| Rc::new(SqlSelectStatement::new(self.select_query.clone())))
            .clone()
    }
}
