use std::io::Write;
use std::sync::Arc;

use shapesql::expression::{Expr, ExprRef, ShapeType};
use shapesql::{ExpressionBuilder, MappingSchema, Member};
use tempfile::NamedTempFile;

pub const SHOP_SCHEMA: &str = r#"
types:
  - name: INamed
    kind: interface
    members:
      - { name: Name, type: String }
  - name: Customer
    kind: entity
    interfaces: [INamed]
    entity:
      table: customers
      columns:
        - { member: Id, column: id, type: Int32 }
        - { member: Name, column: full_name, type: String }
        - { member: City, column: city, type: String }
      aliases:
        DisplayName: Name
      associations:
        - { member: Orders, target: Order, this_key: Id, other_key: CustomerId, many: true }
  - name: Order
    kind: entity
    entity:
      table: orders
      columns:
        - { member: Id, column: id, type: Int32 }
        - { member: CustomerId, column: customer_id, type: Int32 }
        - { member: Total, column: total, type: Float64 }
  - name: CustomerSummary
    kind: anonymous
    members:
      - { name: Name, type: String }
      - { name: Orders, type: Int32 }
"#;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Write `content` to a temporary file that lives as long as the handle.
pub fn temp_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp file");
    file.write_all(content.as_bytes()).expect("write temp file");
    file
}

pub fn shop_schema() -> Arc<MappingSchema> {
    let file = temp_file(SHOP_SCHEMA);
    Arc::new(MappingSchema::from_yaml_file(file.path()).expect("load schema"))
}

pub fn member(b: &ExpressionBuilder, type_name: &str, name: &str) -> Member {
    b.schema()
        .member(type_name, name)
        .unwrap_or_else(|| panic!("{}.{} is not declared", type_name, name))
}

pub fn access(b: &ExpressionBuilder, object: &ExprRef, name: &str) -> ExprRef {
    let owner = object.ty();
    let type_name = owner.type_name().expect("named object type");
    Expr::member(object, member(b, type_name, name))
}

pub fn named(name: &str) -> ShapeType {
    ShapeType::named(name)
}
