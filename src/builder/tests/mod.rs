//! Builder tests over a small customer/order schema.

use std::sync::Arc;

use crate::expression::{Expr, ExprRef, Member, Parameter, ScalarType, ShapeType};
use crate::mapping_schema::{MappingSchema, TypeDescriptor};

use super::ExpressionBuilder;

mod subquery_tests;

pub(super) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(super) fn string() -> ShapeType {
    ShapeType::Scalar(ScalarType::String)
}

pub(super) fn int() -> ShapeType {
    ShapeType::Scalar(ScalarType::Int32)
}

pub(super) fn schema() -> Arc<MappingSchema> {
    Arc::new(
        MappingSchema::from_descriptors(vec![
            TypeDescriptor::interface("IHasName").member("Name", string()),
            TypeDescriptor::entity("Customer", "customers")
                .implements("IHasName")
                .column("Id", ScalarType::Int32, "id")
                .column("Name", ScalarType::String, "name")
                .column("City", ScalarType::String, "city")
                .alias("FullName", "Name")
                .association("Orders", "Order", "Id", "CustomerId", true),
            TypeDescriptor::entity("Order", "orders")
                .column("Id", ScalarType::Int32, "id")
                .column("CustomerId", ScalarType::Int32, "customer_id")
                .column("Total", ScalarType::Float64, "total"),
            TypeDescriptor::anonymous("Anon")
                .member("A", string())
                .member("B", int()),
            TypeDescriptor::anonymous("Counted")
                .member("Name", string())
                .member("OrderCount", int()),
            TypeDescriptor::class("Summary")
                .implements("IHasName")
                .member("Name", string())
                .member("City", string())
                .member("Rating", int()),
        ])
        .unwrap(),
    )
}

pub(super) fn builder() -> ExpressionBuilder {
    init_logging();
    ExpressionBuilder::new(schema())
}

/// A mapped member of `type_name`, as the schema resolves it.
pub(super) fn member(b: &ExpressionBuilder, type_name: &str, name: &str) -> Member {
    b.schema().member(type_name, name).unwrap()
}

pub(super) fn customer(b: &ExpressionBuilder, name: &str) -> Parameter {
    b.new_parameter(name, ShapeType::named("Customer"))
}

/// `c.<name>` for a customer-typed expression.
pub(super) fn access(b: &ExpressionBuilder, object: &ExprRef, name: &str) -> ExprRef {
    let type_name = object.ty().type_name().unwrap().to_string();
    Expr::member(object, member(b, &type_name, name))
}

/// `new Anon { A = c.Name, B = c.Id }`
pub(super) fn anon_projection(b: &ExpressionBuilder, c: &ExprRef) -> ExprRef {
    Expr::new_object(
        ShapeType::named("Anon"),
        vec![
            (member(b, "Anon", "A"), access(b, c, "Name")),
            (member(b, "Anon", "B"), access(b, c, "Id")),
        ],
    )
}
