//! Translation of leaf value expressions into SQL scalars and predicates.

use crate::expression::{BinaryOp, Expr, ExprRef, Literal, Operation};
use crate::mapping_schema::errors::SchemaError;
use crate::sql::{SearchCondition, SelectQuery, SqlExpr};

use super::{
    context::{ContextId, ConvertFlags},
    errors::{BuildError, BuildResult},
    function_registry::{get_function_mapping, get_sequence_operator, SequenceShape},
    ExpressionBuilder,
};

fn is_null_constant(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Constant {
            value: Literal::Null,
            ..
        }
    )
}

impl ExpressionBuilder {
    /// SQL scalar for `expr`, resolving member references through the context
    /// that owns their root parameter.
    pub fn convert_to_sql(&self, context: ContextId, expr: &ExprRef) -> BuildResult<SqlExpr> {
        let _guard = self.enter()?;
        log::trace!("ExpressionBuilder::convert_to_sql: {} in {}", expr, context);

        match expr.as_ref() {
            Expr::Constant { value, .. } => Ok(SqlExpr::Value(value.clone())),

            Expr::Parameter(_) | Expr::MemberAccess { .. } => {
                let owner = self.find_root_context(context, expr)?.ok_or_else(|| {
                    BuildError::unsupported(format!("'{}' is not rooted in a query scope", expr))
                })?;
                let mut infos =
                    self.context(owner)?
                        .convert_to_sql(self, Some(expr), 0, ConvertFlags::Field)?;
                if infos.len() != 1 {
                    return Err(BuildError::ExpectedSingleField {
                        expression: expr.to_string(),
                        count: infos.len(),
                    });
                }
                Ok(infos.remove(0).sql)
            }

            Expr::MethodCall { method, args } => {
                if method.is_subquery_trigger() {
                    return self.sub_query_to_sql(context, expr);
                }
                let mapping = get_function_mapping(&method.name).ok_or_else(|| {
                    BuildError::unsupported(format!("method '{}' has no SQL translation", method.name))
                })?;
                let mut sql_args = Vec::with_capacity(args.len());
                for arg in args {
                    sql_args.push(self.convert_to_sql(context, arg)?.into_value());
                }
                if let Some(transform) = mapping.arg_transform {
                    sql_args = transform(sql_args);
                }
                Ok(SqlExpr::Function {
                    name: mapping.sql_name.to_string(),
                    args: sql_args,
                })
            }

            Expr::Other(Operation::Binary { op, left, right }) if op.is_comparison() => {
                if matches!(op, BinaryOp::Equal | BinaryOp::NotEqual) {
                    let negated = *op == BinaryOp::NotEqual;
                    if is_null_constant(right) {
                        let expr = self.convert_to_sql(context, left)?.into_value();
                        return Ok(SqlExpr::Condition(Box::new(SearchCondition::IsNull {
                            expr,
                            negated,
                        })));
                    }
                    if is_null_constant(left) {
                        let expr = self.convert_to_sql(context, right)?.into_value();
                        return Ok(SqlExpr::Condition(Box::new(SearchCondition::IsNull {
                            expr,
                            negated,
                        })));
                    }
                }
                let left = self.convert_to_sql(context, left)?.into_value();
                let right = self.convert_to_sql(context, right)?.into_value();
                Ok(SqlExpr::Condition(Box::new(SearchCondition::Compare {
                    op: *op,
                    left,
                    right,
                })))
            }

            Expr::Other(Operation::Binary { op, left, right }) if op.is_logical() => {
                let left = self.convert_to_sql(context, left)?.into_condition();
                let right = self.convert_to_sql(context, right)?.into_condition();
                let condition = match op {
                    BinaryOp::And => SearchCondition::And(vec![left, right]),
                    _ => SearchCondition::Or(vec![left, right]),
                };
                Ok(SqlExpr::Condition(Box::new(condition)))
            }

            Expr::Other(Operation::Binary { op, left, right }) => Ok(SqlExpr::Binary {
                op: *op,
                left: Box::new(self.convert_to_sql(context, left)?.into_value()),
                right: Box::new(self.convert_to_sql(context, right)?.into_value()),
            }),

            Expr::Other(Operation::Not(operand)) => {
                let condition = self.convert_to_sql(context, operand)?.into_condition();
                Ok(SqlExpr::Condition(Box::new(SearchCondition::Not(
                    Box::new(condition),
                ))))
            }

            Expr::Other(Operation::Conditional { .. }) => Err(BuildError::unsupported(format!(
                "conditional expression '{}' cannot be translated",
                expr
            ))),

            Expr::New { .. } | Expr::MemberInit { .. } => Err(BuildError::unsupported(format!(
                "construction '{}' is not a scalar value",
                expr
            ))),
        }
    }

    /// Predicate form of a boolean expression.
    pub fn convert_predicate(
        &self,
        context: ContextId,
        expr: &ExprRef,
    ) -> BuildResult<SearchCondition> {
        Ok(self.convert_to_sql(context, expr)?.into_condition())
    }

    /// Correlated subquery for a sequence operator applied to an association:
    /// `Count(c.Orders)` becomes
    /// `(SELECT COUNT(*) FROM orders t2 WHERE t2.customer_id = t1.id)`.
    pub fn sub_query_to_sql(&self, context: ContextId, call: &ExprRef) -> BuildResult<SqlExpr> {
        let Expr::MethodCall { method, args } = call.as_ref() else {
            return Err(BuildError::unsupported(call));
        };
        let operator = get_sequence_operator(&method.name).ok_or_else(|| {
            BuildError::unsupported(format!("'{}' is not a sequence operator", method.name))
        })?;

        let source = args
            .first()
            .ok_or_else(|| BuildError::unsupported(format!("'{}' has no source", call)))?;
        let Expr::MemberAccess { object, member } = source.as_ref() else {
            return Err(BuildError::unsupported(format!(
                "'{}' must be applied to an association",
                call
            )));
        };
        let invalid_member = |name: &str| BuildError::InvalidMemberPath {
            expression: call.to_string(),
            member: name.to_string(),
        };

        let owner_type = object.ty();
        let owner_type = owner_type
            .type_name()
            .ok_or_else(|| invalid_member(&member.name))?;
        let association = self
            .schema
            .association(owner_type, &member.name)
            .ok_or_else(|| invalid_member(&member.name))?
            .clone();
        let key_member = self
            .schema
            .member(owner_type, &association.this_key)
            .ok_or_else(|| invalid_member(&association.this_key))?;
        let outer_key = self
            .convert_to_sql(context, &Expr::member(object, key_member))?
            .into_value();

        let target = self
            .schema
            .entity(&association.target)
            .ok_or_else(|| SchemaError::NotAnEntity(association.target.clone()))?;
        let other_key = target
            .column(&association.other_key)
            .ok_or_else(|| SchemaError::UnknownColumn {
                entity: association.target.clone(),
                member: association.other_key.clone(),
            })?
            .column
            .clone();

        let mut inner = SelectQuery::new(self.next_query_id());
        let source_id = self.next_source_id();
        inner.add_table(source_id, target.table.clone());
        inner.add_where(SearchCondition::Compare {
            op: BinaryOp::Equal,
            left: SqlExpr::field(source_id, other_key),
            right: outer_key,
        });

        log::debug!(
            "ExpressionBuilder::sub_query_to_sql: {} over {} -> {}",
            operator.sql_name,
            association.target,
            target.table
        );

        match operator.shape {
            SequenceShape::Exists => {
                inner.select.add(SqlExpr::Value(Literal::Integer(1)));
                Ok(SqlExpr::Condition(Box::new(SearchCondition::Exists(
                    Box::new(inner),
                ))))
            }
            SequenceShape::Count => {
                inner.select.add(SqlExpr::Aggregate {
                    func: operator.sql_name.to_string(),
                    arg: None,
                });
                Ok(SqlExpr::SubQuery(Box::new(inner)))
            }
            SequenceShape::Aggregate => {
                let selected = match args.get(1).map(|a| a.as_ref()) {
                    Some(Expr::MemberAccess { member, .. }) => member.name.clone(),
                    _ => {
                        return Err(BuildError::unsupported(format!(
                            "'{}' needs a member selector",
                            call
                        )))
                    }
                };
                let column = target
                    .column(&selected)
                    .ok_or_else(|| invalid_member(&selected))?
                    .column
                    .clone();
                inner.select.add(SqlExpr::Aggregate {
                    func: operator.sql_name.to_string(),
                    arg: Some(Box::new(SqlExpr::field(source_id, column))),
                });
                Ok(SqlExpr::SubQuery(Box::new(inner)))
            }
        }
    }
}
