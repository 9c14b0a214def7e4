//! Builder configuration loaded from files and applied to rendering.

use serial_test::serial;
use shapesql::config::ConfigError;
use shapesql::expression::{BinaryOp, Lambda, Literal, ScalarType, ShapeType};
use shapesql::{BuilderConfig, Expr, ExpressionBuilder};

use super::common::{access, init_logging, named, shop_schema, temp_file};

#[test]
fn test_prefixes_from_yaml_config() {
    init_logging();
    let file = temp_file("table_alias_prefix: src\ncolumn_alias_prefix: col\n");
    let config = BuilderConfig::from_yaml_file(file.path()).unwrap();
    assert_eq!(config.max_resolution_depth, 256);

    let b = ExpressionBuilder::with_config(shop_schema(), config);
    let t = b.add_table("Customer").unwrap();
    let c = b.new_parameter("c", named("Customer"));
    let body = Expr::binary(
        BinaryOp::Greater,
        &access(&b, &c.to_expr(), "Id"),
        &Expr::constant(Literal::Integer(10), ShapeType::Scalar(ScalarType::Int32)),
    );
    let s = b.add_select(Lambda::new(vec![c], body), &[t]).unwrap();

    assert_eq!(
        b.build_query(s).unwrap().sql,
        "SELECT CASE WHEN src1.id > 10 THEN 1 ELSE 0 END AS col1 FROM customers src1"
    );
}

#[test]
fn test_invalid_prefix_is_rejected() {
    let file = temp_file("table_alias_prefix: 1t\n");
    assert!(matches!(
        BuilderConfig::from_yaml_file(file.path()),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
#[serial]
fn test_env_depth_limit_applies() {
    init_logging();
    std::env::set_var("SHAPESQL_MAX_RESOLUTION_DEPTH", "3");
    let config = BuilderConfig::from_env();
    std::env::remove_var("SHAPESQL_MAX_RESOLUTION_DEPTH");
    let config = config.unwrap();
    assert_eq!(config.max_resolution_depth, 3);

    let b = ExpressionBuilder::with_config(shop_schema(), config);
    let t = b.add_table("Customer").unwrap();
    let c = b.new_parameter("c", named("Customer"));
    let s = b
        .add_select(Lambda::new(vec![c.clone()], c.to_expr()), &[t])
        .unwrap();
    assert!(b.build_query(s).is_err());
}
