//! Full compilations: schema loaded from YAML, operators registered through
//! the builder, SQL and row mapping checked.

use shapesql::builder::BuildError;
use shapesql::expression::{BinaryOp, Lambda, Literal, Method, ScalarType, ShapeType};
use shapesql::mapping_schema::errors::SchemaError;
use shapesql::{Expr, ExpressionBuilder, Mapping, Member};

use super::common::{access, init_logging, member, named, shop_schema};

fn builder() -> ExpressionBuilder {
    init_logging();
    ExpressionBuilder::new(shop_schema())
}

fn text(value: &str) -> shapesql::ExprRef {
    Expr::constant(
        Literal::String(value.to_string()),
        ShapeType::Scalar(ScalarType::String),
    )
}

#[test]
fn test_filtered_projection_with_order_count() {
    let b = builder();
    let t = b.add_table("Customer").unwrap();
    let c = b.new_parameter("c", named("Customer"));
    let predicate = Expr::binary(BinaryOp::Equal, &access(&b, &c.to_expr(), "City"), &text("Oslo"));
    let f = b.add_filter(t, Lambda::new(vec![c], predicate)).unwrap();

    let d = b.new_parameter("d", named("Customer"));
    let row = d.to_expr();
    let count = Expr::call(
        Method::sequence_operator("Count", ShapeType::Scalar(ScalarType::Int32)),
        vec![access(&b, &row, "Orders")],
    );
    let body = Expr::new_object(
        named("CustomerSummary"),
        vec![
            (member(&b, "CustomerSummary", "Name"), access(&b, &row, "Name")),
            (member(&b, "CustomerSummary", "Orders"), count),
        ],
    );
    let s = b.add_select(Lambda::new(vec![d], body), &[f]).unwrap();

    let compiled = b.build_query(s).unwrap();
    assert_eq!(
        compiled.sql,
        "SELECT t1.full_name AS Name, \
         (SELECT COUNT(*) FROM orders t2 WHERE t2.customer_id = t1.id) AS c2 \
         FROM customers t1 WHERE t1.city = 'Oslo'"
    );
    assert_eq!(compiled.columns, vec!["Name", "c2"]);
    assert_eq!(compiled.mapping.member("Name").unwrap().column_indices(), vec![0]);
    assert_eq!(compiled.mapping.member("Orders").unwrap().column_indices(), vec![1]);

    let explained = compiled.explain();
    assert_eq!(explained["sql"], compiled.sql.as_str());
    assert_eq!(explained["mapping"]["kind"], "new");
}

#[test]
fn test_aliased_member_reads_mapped_column() {
    let b = builder();
    let t = b.add_table("Customer").unwrap();
    let c = b.new_parameter("c", named("Customer"));
    let display_name = Expr::member(
        &c.to_expr(),
        Member::property("Customer", "DisplayName", ShapeType::Scalar(ScalarType::String)),
    );
    let s = b.add_select(Lambda::new(vec![c], display_name), &[t]).unwrap();

    let compiled = b.build_query(s).unwrap();
    assert_eq!(compiled.sql, "SELECT t1.full_name AS Name FROM customers t1");
    assert!(matches!(
        compiled.mapping.as_ref(),
        Mapping::Column { index: 0, .. }
    ));
}

#[test]
fn test_filter_over_derived_table() {
    let b = builder();
    let t = b.add_table("Customer").unwrap();
    let c = b.new_parameter("c", named("Customer"));
    let row = c.to_expr();
    let count = Expr::call(
        Method::sequence_operator("Count", ShapeType::Scalar(ScalarType::Int32)),
        vec![access(&b, &row, "Orders")],
    );
    let body = Expr::new_object(
        named("CustomerSummary"),
        vec![
            (member(&b, "CustomerSummary", "Name"), access(&b, &row, "Name")),
            (member(&b, "CustomerSummary", "Orders"), count),
        ],
    );
    let inner = b.add_select(Lambda::new(vec![c], body), &[t]).unwrap();
    let sq = b.add_subquery(inner).unwrap();

    let x = b.new_parameter("x", named("CustomerSummary"));
    let predicate = Expr::binary(BinaryOp::Equal, &access(&b, &x.to_expr(), "Name"), &text("Oslo"));
    let f = b.add_filter(sq, Lambda::new(vec![x], predicate)).unwrap();

    let compiled = b.build_query(f).unwrap();
    assert_eq!(
        compiled.sql,
        "SELECT t1.Name AS Name, t1.c2 AS c2 FROM \
         (SELECT t2.full_name AS Name, \
         (SELECT COUNT(*) FROM orders t3 WHERE t3.customer_id = t2.id) AS c2 \
         FROM customers t2) t1 \
         WHERE t1.Name = 'Oslo'"
    );
    assert_eq!(compiled.mapping.column_indices(), vec![0, 1]);
}

#[test]
fn test_unknown_entity_is_a_schema_error() {
    let b = builder();
    assert_eq!(
        b.add_table("Invoice").unwrap_err(),
        BuildError::Schema(SchemaError::NotAnEntity("Invoice".to_string()))
    );
}

#[test]
fn test_unmapped_member_is_an_invalid_path() {
    let b = builder();
    let t = b.add_table("Customer").unwrap();
    let c = b.new_parameter("c", named("Customer"));
    let missing = Expr::member(
        &c.to_expr(),
        Member::property("Customer", "Email", ShapeType::Scalar(ScalarType::String)),
    );
    let s = b.add_select(Lambda::new(vec![c], missing), &[t]).unwrap();

    assert!(matches!(
        b.build_query(s),
        Err(BuildError::InvalidMemberPath { .. })
    ));
}
