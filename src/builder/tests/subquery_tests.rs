//! Derived-table boundaries and correlated subqueries over associations.

use test_case::test_case;

use super::*;
use crate::builder::{BuildInfo, ContextId, ConvertFlags, Mapping, RequestFor};
use crate::expression::{BinaryOp, Lambda, Literal, Method};

/// `from x in (from c in Customer select new Anon { A = c.Name, B = c.Id })`
fn nested(b: &ExpressionBuilder) -> (ContextId, ContextId, Parameter) {
    let t = b.add_table("Customer").unwrap();
    let c = customer(b, "c");
    let body = anon_projection(b, &c.to_expr());
    let inner = b.add_select(Lambda::new(vec![c], body), &[t]).unwrap();
    let sq = b.add_subquery(inner).unwrap();
    let x = b.new_parameter("x", ShapeType::named("Anon"));
    (t, sq, x)
}

#[test]
fn test_passthrough_over_subquery_bridges_every_column() {
    let b = builder();
    let (_, sq, x) = nested(&b);
    let s = b
        .add_select(Lambda::new(vec![x.clone()], x.to_expr()), &[sq])
        .unwrap();

    let compiled = b.build_query(s).unwrap();
    assert_eq!(
        compiled.sql,
        "SELECT t1.Name AS Name, t1.Id AS Id \
         FROM (SELECT t2.name AS Name, t2.id AS Id FROM customers t2) t1"
    );
    let Mapping::New { args, .. } = compiled.mapping.as_ref() else {
        panic!("expected a construction mapping, got {:?}", compiled.mapping);
    };
    assert_eq!(args[0].column_indices(), vec![0]);
    assert_eq!(args[1].column_indices(), vec![1]);
}

#[test]
fn test_member_over_subquery_reads_inner_column() {
    let b = builder();
    let (t, sq, x) = nested(&b);
    let a = Expr::member(&x.to_expr(), member(&b, "Anon", "A"));
    let s = b.add_select(Lambda::new(vec![x], a.clone()), &[sq]).unwrap();

    let compiled = b.build_query(s).unwrap();
    assert_eq!(
        compiled.sql,
        "SELECT t1.Name AS Name FROM (SELECT t2.name AS Name FROM customers t2) t1"
    );
    assert_eq!(*compiled.mapping, *Mapping::column(0, string()));

    let scope = b
        .context(s)
        .unwrap()
        .get_scope(&b, Some(&a), 0, &BuildInfo::default())
        .unwrap();
    assert_eq!(scope, t);
}

#[test]
fn test_subquery_index_is_stable() {
    let b = builder();
    let (_, sq, x) = nested(&b);
    let subquery = b.context(sq).unwrap();
    let b_member = Expr::member(&x.to_expr(), member(&b, "Anon", "B"));

    let first = subquery
        .convert_to_index(&b, Some(&b_member), 1, ConvertFlags::Field)
        .unwrap();
    let second = subquery
        .convert_to_index(&b, Some(&b_member), 1, ConvertFlags::Field)
        .unwrap();
    assert_eq!(first[0].index, Some(0));
    assert_eq!(first[0].index, second[0].index);
    assert_eq!(subquery.select_query().borrow().select.len(), 1);
    assert!(subquery
        .classify(&b, None, 0, RequestFor::SubQuery)
        .unwrap()
        .result);
}

#[test]
fn test_scalar_subquery_body_is_translated_once() {
    let b = builder();
    let t = b.add_table("Customer").unwrap();
    let c = customer(&b, "c");
    let count = Expr::call(
        Method::sequence_operator("Count", int()),
        vec![access(&b, &c.to_expr(), "Orders")],
    );
    let inner = b.add_select(Lambda::new(vec![c], count), &[t]).unwrap();
    let sq = b.add_subquery(inner).unwrap();

    // Both the value itself and a condition over it read the inner column.
    let n = b.new_parameter("n", int());
    let row = n.to_expr();
    let ten = Expr::constant(Literal::Integer(10), int());
    let body = Expr::new_object(
        ShapeType::named("Anon"),
        vec![
            (member(&b, "Anon", "B"), row.clone()),
            (
                member(&b, "Anon", "A"),
                Expr::binary(BinaryOp::Greater, &row, &ten),
            ),
        ],
    );
    let s = b.add_select(Lambda::new(vec![n], body), &[sq]).unwrap();

    let compiled = b.build_query(s).unwrap();
    let inner_query = b.context(inner).unwrap().select_query().clone();
    assert_eq!(inner_query.borrow().select.len(), 1);
    assert_eq!(
        compiled.sql,
        "SELECT t1.c1 AS c1, CASE WHEN t1.c1 > 10 THEN 1 ELSE 0 END AS c2 \
         FROM (SELECT (SELECT COUNT(*) FROM orders t3 WHERE t3.customer_id = t2.id) AS c1 \
         FROM customers t2) t1"
    );
    assert_eq!(compiled.mapping.column_indices(), vec![0, 1]);
}

#[test]
fn test_count_over_association() {
    let b = builder();
    let t = b.add_table("Customer").unwrap();
    let c = customer(&b, "c");
    let row = c.to_expr();
    let count = Expr::call(
        Method::sequence_operator("Count", int()),
        vec![access(&b, &row, "Orders")],
    );
    let body = Expr::new_object(
        ShapeType::named("Counted"),
        vec![
            (member(&b, "Counted", "Name"), access(&b, &row, "Name")),
            (member(&b, "Counted", "OrderCount"), count),
        ],
    );
    let s = b.add_select(Lambda::new(vec![c], body), &[t]).unwrap();

    let compiled = b.build_query(s).unwrap();
    assert_eq!(
        compiled.sql,
        "SELECT t1.name AS Name, \
         (SELECT COUNT(*) FROM orders t2 WHERE t2.customer_id = t1.id) AS c2 \
         FROM customers t1"
    );
}

#[test_case("Sum", "SUM"; "sum")]
#[test_case("Max", "MAX"; "max")]
#[test_case("Average", "AVG"; "average")]
fn test_aggregate_over_association(operator: &str, sql: &str) {
    let b = builder();
    let t = b.add_table("Customer").unwrap();
    let c = customer(&b, "c");
    let o = b.new_parameter("o", ShapeType::named("Order"));
    let total = access(&b, &o.to_expr(), "Total");
    let body = Expr::call(
        Method::sequence_operator(operator, total.ty()),
        vec![access(&b, &c.to_expr(), "Orders"), total],
    );
    let s = b.add_select(Lambda::new(vec![c], body), &[t]).unwrap();

    let compiled = b.build_query(s).unwrap();
    assert_eq!(
        compiled.sql,
        format!(
            "SELECT (SELECT {}(t2.total) FROM orders t2 WHERE t2.customer_id = t1.id) AS c1 \
             FROM customers t1",
            sql
        )
    );
}

#[test]
fn test_any_in_filter_becomes_exists() {
    let b = builder();
    let t = b.add_table("Customer").unwrap();
    let c = customer(&b, "c");
    let any = Expr::call(
        Method::sequence_operator("Any", ShapeType::Scalar(ScalarType::Boolean)),
        vec![access(&b, &c.to_expr(), "Orders")],
    );
    let f = b.add_filter(t, Lambda::new(vec![c], any)).unwrap();

    let compiled = b.build_query(f).unwrap();
    assert_eq!(
        compiled.sql,
        "SELECT t1.id AS Id, t1.name AS Name, t1.city AS City FROM customers t1 \
         WHERE EXISTS(SELECT 1 FROM orders t2 WHERE t2.customer_id = t1.id)"
    );
}
