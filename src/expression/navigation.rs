//! Tree navigation used by every build context.
//!
//! A *level* counts member-access hops from the root object of an expression:
//! for `p.A.B`, level 0 is `p`, level 1 is `p.A` and level 2 is `p.A.B`.
//! Returned sub-expressions are the very nodes of the input tree, so callers
//! compare them with [`Arc::ptr_eq`] to test "is this the whole expression".

use std::sync::Arc;

use super::{Expr, ExprRef, Operation};

/// The member-access chain from the root object down to `expr`, inclusive.
pub fn member_chain(expr: &ExprRef) -> Vec<ExprRef> {
    let mut chain = vec![expr.clone()];
    let mut current = expr.clone();
    while let Expr::MemberAccess { object, .. } = current.as_ref() {
        let next = object.clone();
        chain.push(next.clone());
        current = next;
    }
    chain.reverse();
    chain
}

/// Number of member-access hops between the root object and `expr`.
pub fn member_depth(expr: &ExprRef) -> usize {
    member_chain(expr).len() - 1
}

/// The sub-expression found `level` hops below the root object. Levels past
/// the end of the chain yield `expr` itself.
pub fn level_expression(expr: &ExprRef, level: usize) -> ExprRef {
    member_chain(expr)
        .get(level)
        .cloned()
        .unwrap_or_else(|| expr.clone())
}

/// The object at the bottom of a member-access chain.
pub fn root_object(expr: &ExprRef) -> ExprRef {
    let mut current = expr.clone();
    while let Expr::MemberAccess { object, .. } = current.as_ref() {
        let next = object.clone();
        current = next;
    }
    current
}

/// Rebuild `expr` with every node identical (by pointer) to `target` swapped
/// for `replacement`. Untouched subtrees are shared, and an expression without
/// any occurrence of `target` comes back as the same `Arc`.
pub fn replace_node(expr: &ExprRef, target: &ExprRef, replacement: &ExprRef) -> ExprRef {
    transform(expr, &mut |node| {
        if Arc::ptr_eq(node, target) {
            Some(replacement.clone())
        } else {
            None
        }
    })
}

/// Pre-order rewrite: `f` may replace a node (its children are then not
/// visited); otherwise children are rewritten and the node rebuilt only if one
/// of them changed.
pub fn transform(expr: &ExprRef, f: &mut dyn FnMut(&ExprRef) -> Option<ExprRef>) -> ExprRef {
    if let Some(replaced) = f(expr) {
        return replaced;
    }

    match expr.as_ref() {
        Expr::Parameter(_) | Expr::Constant { .. } => expr.clone(),
        Expr::MemberAccess { object, member } => {
            let new_object = transform(object, f);
            if Arc::ptr_eq(&new_object, object) {
                expr.clone()
            } else {
                Arc::new(Expr::MemberAccess {
                    object: new_object,
                    member: member.clone(),
                })
            }
        }
        Expr::New {
            object_type,
            members,
            args,
        } => match transform_all(args, f) {
            Some(args) => Arc::new(Expr::New {
                object_type: object_type.clone(),
                members: members.clone(),
                args,
            }),
            None => expr.clone(),
        },
        Expr::MemberInit {
            object_type,
            bindings,
        } => {
            let values: Vec<ExprRef> = bindings.iter().map(|(_, e)| e.clone()).collect();
            match transform_all(&values, f) {
                Some(values) => Arc::new(Expr::MemberInit {
                    object_type: object_type.clone(),
                    bindings: bindings
                        .iter()
                        .map(|(m, _)| m.clone())
                        .zip(values)
                        .collect(),
                }),
                None => expr.clone(),
            }
        }
        Expr::MethodCall { method, args } => match transform_all(args, f) {
            Some(args) => Arc::new(Expr::MethodCall {
                method: method.clone(),
                args,
            }),
            None => expr.clone(),
        },
        Expr::Other(Operation::Binary { op, left, right }) => {
            let l = transform(left, f);
            let r = transform(right, f);
            if Arc::ptr_eq(&l, left) && Arc::ptr_eq(&r, right) {
                expr.clone()
            } else {
                Arc::new(Expr::Other(Operation::Binary {
                    op: *op,
                    left: l,
                    right: r,
                }))
            }
        }
        Expr::Other(Operation::Not(operand)) => {
            let o = transform(operand, f);
            if Arc::ptr_eq(&o, operand) {
                expr.clone()
            } else {
                Arc::new(Expr::Other(Operation::Not(o)))
            }
        }
        Expr::Other(Operation::Conditional {
            test,
            if_true,
            if_false,
        }) => {
            let t = transform(test, f);
            let a = transform(if_true, f);
            let b = transform(if_false, f);
            if Arc::ptr_eq(&t, test) && Arc::ptr_eq(&a, if_true) && Arc::ptr_eq(&b, if_false) {
                expr.clone()
            } else {
                Arc::new(Expr::Other(Operation::Conditional {
                    test: t,
                    if_true: a,
                    if_false: b,
                }))
            }
        }
    }
}

fn transform_all(
    exprs: &[ExprRef],
    f: &mut dyn FnMut(&ExprRef) -> Option<ExprRef>,
) -> Option<Vec<ExprRef>> {
    let rewritten: Vec<ExprRef> = exprs.iter().map(|e| transform(e, f)).collect();
    let changed = rewritten
        .iter()
        .zip(exprs)
        .any(|(new, old)| !Arc::ptr_eq(new, old));
    changed.then_some(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{Literal, Member, Parameter, ScalarType, ShapeType};

    fn chain() -> (ExprRef, ExprRef, ExprRef) {
        let p = Parameter::new(7, "p", ShapeType::named("Anon")).to_expr();
        let a = Expr::member(&p, Member::property("Anon", "A", ShapeType::named("Inner")));
        let b = Expr::member(
            &a,
            Member::property("Inner", "B", ShapeType::Scalar(ScalarType::Int32)),
        );
        (p, a, b)
    }

    #[test]
    fn test_level_expression_walks_from_root() {
        let (p, a, b) = chain();
        assert!(Arc::ptr_eq(&level_expression(&b, 0), &p));
        assert!(Arc::ptr_eq(&level_expression(&b, 1), &a));
        assert!(Arc::ptr_eq(&level_expression(&b, 2), &b));
        assert!(Arc::ptr_eq(&level_expression(&b, 5), &b));
        assert_eq!(member_depth(&b), 2);
    }

    #[test]
    fn test_root_object_of_non_member_is_itself() {
        let (p, _, b) = chain();
        assert!(Arc::ptr_eq(&root_object(&b), &p));
        let c = Expr::constant(Literal::Integer(3), ShapeType::Scalar(ScalarType::Int32));
        assert!(Arc::ptr_eq(&root_object(&c), &c));
    }

    #[test]
    fn test_replace_node_substitutes_level_expression() {
        let (_, a, b) = chain();
        let x = Parameter::new(9, "x", ShapeType::named("Inner")).to_expr();
        let replaced = replace_node(&b, &a, &x);
        assert_eq!(replaced.to_string(), "x.B");
        assert!(Arc::ptr_eq(&level_expression(&replaced, 0), &x));
    }

    #[test]
    fn test_replace_node_without_match_keeps_identity() {
        let (p, _, b) = chain();
        let unrelated = Parameter::new(10, "q", ShapeType::named("Anon")).to_expr();
        let same = replace_node(&b, &unrelated, &p);
        assert!(Arc::ptr_eq(&same, &b));
    }
}
