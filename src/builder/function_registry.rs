/// Method to SQL Function Registry
///
/// Maps method names found in query trees to SQL functions, with optional
/// argument transformations, and lists the sequence operators that compile to
/// correlated subqueries.
use std::collections::HashMap;

use crate::expression::Literal;
use crate::sql::SqlExpr;

/// Function mapping entry
#[derive(Clone)]
pub struct FunctionMapping {
    /// Method name (lowercase for lookup)
    #[allow(dead_code)]
    pub method_name: &'static str,
    /// SQL function name
    pub sql_name: &'static str,
    /// Optional argument transformation function
    pub arg_transform: Option<fn(Vec<SqlExpr>) -> Vec<SqlExpr>>,
}

/// How a sequence operator over an association is compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceShape {
    /// `EXISTS(SELECT 1 ...)`
    Exists,
    /// `(SELECT COUNT(*) ...)`
    Count,
    /// `(SELECT FUNC(column) ...)` over a selected member of the target
    Aggregate,
}

#[derive(Debug, Clone)]
pub struct SequenceOperator {
    #[allow(dead_code)]
    pub method_name: &'static str,
    pub sql_name: &'static str,
    pub shape: SequenceShape,
}

/// Get function mapping for a scalar method name
pub fn get_function_mapping(method: &str) -> Option<FunctionMapping> {
    let fn_lower = method.to_lowercase();
    FUNCTION_MAPPINGS.get(fn_lower.as_str()).cloned()
}

/// Get the sequence operator for a method name
pub fn get_sequence_operator(method: &str) -> Option<SequenceOperator> {
    let fn_lower = method.to_lowercase();
    SEQUENCE_OPERATORS.get(fn_lower.as_str()).cloned()
}

// Static function mapping tables
lazy_static::lazy_static! {
    static ref FUNCTION_MAPPINGS: HashMap<&'static str, FunctionMapping> = {
        let mut m = HashMap::new();

        // ===== STRING FUNCTIONS =====

        m.insert("toupper", FunctionMapping {
            method_name: "toupper",
            sql_name: "UPPER",
            arg_transform: None,
        });

        m.insert("tolower", FunctionMapping {
            method_name: "tolower",
            sql_name: "LOWER",
            arg_transform: None,
        });

        m.insert("trim", FunctionMapping {
            method_name: "trim",
            sql_name: "TRIM",
            arg_transform: None,
        });

        m.insert("length", FunctionMapping {
            method_name: "length",
            sql_name: "LENGTH",
            arg_transform: None,
        });

        // Substring(s, start, len): 0-based start -> SUBSTRING(s, start + 1, len)
        m.insert("substring", FunctionMapping {
            method_name: "substring",
            sql_name: "SUBSTRING",
            arg_transform: Some(|args| {
                let mut args = args.into_iter();
                let mut out = Vec::new();
                if let Some(s) = args.next() {
                    out.push(s);
                }
                if let Some(start) = args.next() {
                    out.push(match start {
                        SqlExpr::Value(Literal::Integer(i)) => SqlExpr::Value(Literal::Integer(i + 1)),
                        other => SqlExpr::Binary {
                            op: crate::expression::BinaryOp::Add,
                            left: Box::new(other),
                            right: Box::new(SqlExpr::Value(Literal::Integer(1))),
                        },
                    });
                }
                out.extend(args);
                out
            }),
        });

        // ===== MATH FUNCTIONS =====

        m.insert("abs", FunctionMapping {
            method_name: "abs",
            sql_name: "ABS",
            arg_transform: None,
        });

        m.insert("round", FunctionMapping {
            method_name: "round",
            sql_name: "ROUND",
            arg_transform: None,
        });

        m.insert("floor", FunctionMapping {
            method_name: "floor",
            sql_name: "FLOOR",
            arg_transform: None,
        });

        m.insert("ceiling", FunctionMapping {
            method_name: "ceiling",
            sql_name: "CEILING",
            arg_transform: None,
        });

        // ===== NULL HANDLING =====

        m.insert("coalesce", FunctionMapping {
            method_name: "coalesce",
            sql_name: "COALESCE",
            arg_transform: None,
        });

        m
    };

    static ref SEQUENCE_OPERATORS: HashMap<&'static str, SequenceOperator> = {
        let mut m = HashMap::new();
        m.insert("any", SequenceOperator { method_name: "any", sql_name: "EXISTS", shape: SequenceShape::Exists });
        m.insert("count", SequenceOperator { method_name: "count", sql_name: "COUNT", shape: SequenceShape::Count });
        m.insert("sum", SequenceOperator { method_name: "sum", sql_name: "SUM", shape: SequenceShape::Aggregate });
        m.insert("min", SequenceOperator { method_name: "min", sql_name: "MIN", shape: SequenceShape::Aggregate });
        m.insert("max", SequenceOperator { method_name: "max", sql_name: "MAX", shape: SequenceShape::Aggregate });
        m.insert("average", SequenceOperator { method_name: "average", sql_name: "AVG", shape: SequenceShape::Aggregate });
        m
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("ToUpper", "UPPER")]
    #[test_case("tolower", "LOWER")]
    #[test_case("Coalesce", "COALESCE")]
    fn test_function_lookup_is_case_insensitive(method: &str, sql: &str) {
        assert_eq!(get_function_mapping(method).unwrap().sql_name, sql);
    }

    #[test]
    fn test_substring_start_becomes_one_based() {
        let mapping = get_function_mapping("Substring").unwrap();
        let transform = mapping.arg_transform.unwrap();
        let args = transform(vec![
            SqlExpr::Value(Literal::String("abc".to_string())),
            SqlExpr::Value(Literal::Integer(0)),
            SqlExpr::Value(Literal::Integer(2)),
        ]);
        assert_eq!(args[1], SqlExpr::Value(Literal::Integer(1)));
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn test_sequence_operators() {
        assert_eq!(get_sequence_operator("Any").unwrap().shape, SequenceShape::Exists);
        assert_eq!(get_sequence_operator("Count").unwrap().shape, SequenceShape::Count);
        assert_eq!(get_sequence_operator("Average").unwrap().sql_name, "AVG");
        assert!(get_sequence_operator("ToUpper").is_none());
    }
}
