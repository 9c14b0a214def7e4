//! Query expression trees.
//!
//! [`Expr`] is the closed node grammar handed over by the query front-end:
//! parameters, member access, object/tuple construction, method calls,
//! constants and a handful of value operations. Trees are immutable and shared
//! through [`ExprRef`]; the builder never mutates a node, it only derives new
//! trees with [`navigation::replace_node`].
//!
//! Equality and hashing are structural. Two parameters are the same parameter
//! only when their ids match, so structurally equal trees always denote the
//! same value within one compilation.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
};

pub mod navigation;

pub use navigation::{level_expression, member_chain, member_depth, replace_node, root_object};

pub type ExprRef = Arc<Expr>;

/// Scalar value types understood by the SQL layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    Boolean,
    Int32,
    Int64,
    Float64,
    Decimal,
    String,
    DateTime,
}

impl ScalarType {
    fn name(&self) -> &'static str {
        match self {
            ScalarType::Boolean => "Boolean",
            ScalarType::Int32 => "Int32",
            ScalarType::Int64 => "Int64",
            ScalarType::Float64 => "Float64",
            ScalarType::Decimal => "Decimal",
            ScalarType::String => "String",
            ScalarType::DateTime => "DateTime",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "Boolean" => ScalarType::Boolean,
            "Int32" => ScalarType::Int32,
            "Int64" => ScalarType::Int64,
            "Float64" => ScalarType::Float64,
            "Decimal" => ScalarType::Decimal,
            "String" => ScalarType::String,
            "DateTime" => ScalarType::DateTime,
            _ => return None,
        })
    }
}

/// Static type of an expression.
///
/// Serialized as a compact string: `Int32`, `Int32?` (nullable), `[Order]`
/// (sequence of `Order`), or any other identifier for a named type described in
/// the mapping schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ShapeType {
    Scalar(ScalarType),
    Nullable(ScalarType),
    Named(String),
    Sequence(Box<ShapeType>),
}

impl ShapeType {
    pub fn named(name: impl Into<String>) -> Self {
        ShapeType::Named(name.into())
    }

    pub fn sequence_of(element: ShapeType) -> Self {
        ShapeType::Sequence(Box::new(element))
    }

    /// Name of the schema type, for named types only.
    pub fn type_name(&self) -> Option<&str> {
        match self {
            ShapeType::Named(name) => Some(name),
            _ => None,
        }
    }

    pub fn element_type(&self) -> Option<&ShapeType> {
        match self {
            ShapeType::Sequence(element) => Some(element),
            _ => None,
        }
    }

    pub fn is_boolean(&self) -> bool {
        matches!(
            self,
            ShapeType::Scalar(ScalarType::Boolean) | ShapeType::Nullable(ScalarType::Boolean)
        )
    }
}

impl fmt::Display for ShapeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeType::Scalar(s) => write!(f, "{}", s.name()),
            ShapeType::Nullable(s) => write!(f, "{}?", s.name()),
            ShapeType::Named(name) => write!(f, "{}", name),
            ShapeType::Sequence(element) => write!(f, "[{}]", element),
        }
    }
}

impl FromStr for ShapeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty type name".to_string());
        }
        if let Some(inner) = s.strip_prefix('[') {
            let inner = inner
                .strip_suffix(']')
                .ok_or_else(|| format!("unterminated sequence type '{}'", s))?;
            return Ok(ShapeType::sequence_of(inner.parse()?));
        }
        if let Some(inner) = s.strip_suffix('?') {
            return ScalarType::parse(inner)
                .map(ShapeType::Nullable)
                .ok_or_else(|| format!("only scalar types can be nullable: '{}'", s));
        }
        Ok(ScalarType::parse(s)
            .map(ShapeType::Scalar)
            .unwrap_or_else(|| ShapeType::Named(s.to_string())))
    }
}

impl TryFrom<String> for ShapeType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ShapeType> for String {
    fn from(value: ShapeType) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberKind {
    Field,
    Property,
    /// Accessor methods exposed as members; never projected as columns.
    Method,
}

/// A structural member of a named type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub declaring_type: String,
    pub member_type: ShapeType,
    pub kind: MemberKind,
}

impl Member {
    pub fn property(
        declaring_type: impl Into<String>,
        name: impl Into<String>,
        member_type: ShapeType,
    ) -> Self {
        Self {
            name: name.into(),
            declaring_type: declaring_type.into(),
            member_type,
            kind: MemberKind::Property,
        }
    }

    pub fn method(
        declaring_type: impl Into<String>,
        name: impl Into<String>,
        member_type: ShapeType,
    ) -> Self {
        Self {
            name: name.into(),
            declaring_type: declaring_type.into(),
            member_type,
            kind: MemberKind::Method,
        }
    }

    pub fn is_method(&self) -> bool {
        self.kind == MemberKind::Method
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.declaring_type, self.name)
    }
}

/// A lambda parameter. Identity is the `id`; the name is for display only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameter {
    pub id: u32,
    pub name: String,
    pub param_type: ShapeType,
}

impl Parameter {
    pub fn new(id: u32, name: impl Into<String>, param_type: ShapeType) -> Self {
        Self {
            id,
            name: name.into(),
            param_type,
        }
    }

    pub fn to_expr(&self) -> ExprRef {
        Arc::new(Expr::Parameter(self.clone()))
    }
}

/// Constant values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::Null, Literal::Null) => true,
            (Literal::Boolean(a), Literal::Boolean(b)) => a == b,
            (Literal::Integer(a), Literal::Integer(b)) => a == b,
            (Literal::Float(a), Literal::Float(b)) => a.to_bits() == b.to_bits(),
            (Literal::String(a), Literal::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Literal {}

impl Hash for Literal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Literal::Null => {}
            Literal::Boolean(b) => b.hash(state),
            Literal::Integer(i) => i.hash(state),
            Literal::Float(f) => f.to_bits().hash(state),
            Literal::String(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "null"),
            Literal::Boolean(b) => write!(f, "{}", b),
            Literal::Integer(i) => write!(f, "{}", i),
            Literal::Float(x) => write!(f, "{}", x),
            Literal::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodKind {
    /// Operators over a sequence (`Count`, `Any`, `Sum`...). Used on an
    /// association they trigger a correlated subquery.
    SequenceOperator,
    /// Scalar functions translated through the method registry.
    ScalarFunction,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    pub kind: MethodKind,
    pub return_type: ShapeType,
}

impl Method {
    pub fn sequence_operator(name: impl Into<String>, return_type: ShapeType) -> Self {
        Self {
            name: name.into(),
            kind: MethodKind::SequenceOperator,
            return_type,
        }
    }

    pub fn scalar(name: impl Into<String>, return_type: ShapeType) -> Self {
        Self {
            name: name.into(),
            kind: MethodKind::ScalarFunction,
            return_type,
        }
    }

    pub fn is_subquery_trigger(&self) -> bool {
        self.kind == MethodKind::SequenceOperator
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    And,
    Or,
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Less
                | BinaryOp::LessOrEqual
                | BinaryOp::Greater
                | BinaryOp::GreaterOrEqual
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessOrEqual => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterOrEqual => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
        }
    }
}

/// Value operations that are neither member access nor construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Binary {
        op: BinaryOp,
        left: ExprRef,
        right: ExprRef,
    },
    Not(ExprRef),
    /// `test ? if_true : if_false`. Present in the grammar but never
    /// decomposable nor translatable.
    Conditional {
        test: ExprRef,
        if_true: ExprRef,
        if_false: ExprRef,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    Parameter(Parameter),

    MemberAccess {
        object: ExprRef,
        member: Member,
    },

    /// Object or tuple construction. `members` is empty for positional
    /// constructors, which cannot be decomposed into named members.
    New {
        object_type: ShapeType,
        members: Vec<Member>,
        args: Vec<ExprRef>,
    },

    MemberInit {
        object_type: ShapeType,
        bindings: Vec<(Member, ExprRef)>,
    },

    MethodCall {
        method: Method,
        args: Vec<ExprRef>,
    },

    Constant {
        value: Literal,
        value_type: ShapeType,
    },

    Other(Operation),
}

/// Node kind names used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Parameter,
    MemberAccess,
    New,
    MemberInit,
    MethodCall,
    Constant,
    Other,
}

impl Expr {
    pub fn member(object: &ExprRef, member: Member) -> ExprRef {
        Arc::new(Expr::MemberAccess {
            object: object.clone(),
            member,
        })
    }

    /// Named-member construction (`new { A = .., B = .. }`).
    pub fn new_object(object_type: ShapeType, members: Vec<(Member, ExprRef)>) -> ExprRef {
        let (members, args) = members.into_iter().unzip();
        Arc::new(Expr::New {
            object_type,
            members,
            args,
        })
    }

    /// Positional construction without member mapping.
    pub fn construct(object_type: ShapeType, args: Vec<ExprRef>) -> ExprRef {
        Arc::new(Expr::New {
            object_type,
            members: Vec::new(),
            args,
        })
    }

    pub fn member_init(object_type: ShapeType, bindings: Vec<(Member, ExprRef)>) -> ExprRef {
        Arc::new(Expr::MemberInit {
            object_type,
            bindings,
        })
    }

    pub fn call(method: Method, args: Vec<ExprRef>) -> ExprRef {
        Arc::new(Expr::MethodCall { method, args })
    }

    pub fn constant(value: Literal, value_type: ShapeType) -> ExprRef {
        Arc::new(Expr::Constant { value, value_type })
    }

    pub fn binary(op: BinaryOp, left: &ExprRef, right: &ExprRef) -> ExprRef {
        Arc::new(Expr::Other(Operation::Binary {
            op,
            left: left.clone(),
            right: right.clone(),
        }))
    }

    pub fn not(operand: &ExprRef) -> ExprRef {
        Arc::new(Expr::Other(Operation::Not(operand.clone())))
    }

    pub fn conditional(test: &ExprRef, if_true: &ExprRef, if_false: &ExprRef) -> ExprRef {
        Arc::new(Expr::Other(Operation::Conditional {
            test: test.clone(),
            if_true: if_true.clone(),
            if_false: if_false.clone(),
        }))
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Expr::Parameter(_) => NodeKind::Parameter,
            Expr::MemberAccess { .. } => NodeKind::MemberAccess,
            Expr::New { .. } => NodeKind::New,
            Expr::MemberInit { .. } => NodeKind::MemberInit,
            Expr::MethodCall { .. } => NodeKind::MethodCall,
            Expr::Constant { .. } => NodeKind::Constant,
            Expr::Other(_) => NodeKind::Other,
        }
    }

    pub fn is_parameter(&self) -> bool {
        matches!(self, Expr::Parameter(_))
    }

    /// True for `New` and `MemberInit` nodes.
    pub fn is_construction(&self) -> bool {
        matches!(self, Expr::New { .. } | Expr::MemberInit { .. })
    }

    pub fn as_parameter(&self) -> Option<&Parameter> {
        match self {
            Expr::Parameter(p) => Some(p),
            _ => None,
        }
    }

    pub fn ty(&self) -> ShapeType {
        match self {
            Expr::Parameter(p) => p.param_type.clone(),
            Expr::MemberAccess { member, .. } => member.member_type.clone(),
            Expr::New { object_type, .. } | Expr::MemberInit { object_type, .. } => {
                object_type.clone()
            }
            Expr::MethodCall { method, .. } => method.return_type.clone(),
            Expr::Constant { value_type, .. } => value_type.clone(),
            Expr::Other(Operation::Binary { op, left, .. }) => {
                if op.is_comparison() || op.is_logical() {
                    ShapeType::Scalar(ScalarType::Boolean)
                } else {
                    left.ty()
                }
            }
            Expr::Other(Operation::Not(_)) => ShapeType::Scalar(ScalarType::Boolean),
            Expr::Other(Operation::Conditional { if_true, .. }) => if_true.ty(),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Parameter(p) => write!(f, "{}", p.name),
            Expr::MemberAccess { object, member } => write!(f, "{}.{}", object, member.name),
            Expr::New {
                object_type,
                members,
                args,
            } => {
                if members.is_empty() {
                    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                    write!(f, "new {}({})", object_type, args.join(", "))
                } else {
                    let parts: Vec<String> = members
                        .iter()
                        .zip(args)
                        .map(|(m, a)| format!("{} = {}", m.name, a))
                        .collect();
                    write!(f, "new {} {{ {} }}", object_type, parts.join(", "))
                }
            }
            Expr::MemberInit {
                object_type,
                bindings,
            } => {
                let parts: Vec<String> = bindings
                    .iter()
                    .map(|(m, a)| format!("{} = {}", m.name, a))
                    .collect();
                write!(f, "new {} {{ {} }}", object_type, parts.join(", "))
            }
            Expr::MethodCall { method, args } => {
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", method.name, args.join(", "))
            }
            Expr::Constant { value, .. } => write!(f, "{}", value),
            Expr::Other(Operation::Binary { op, left, right }) => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            Expr::Other(Operation::Not(operand)) => write!(f, "!({})", operand),
            Expr::Other(Operation::Conditional {
                test,
                if_true,
                if_false,
            }) => write!(f, "({} ? {} : {})", test, if_true, if_false),
        }
    }
}

/// Projection or predicate lambda: `(p0, p1, ..) => body`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lambda {
    pub parameters: Vec<Parameter>,
    pub body: ExprRef,
}

impl Lambda {
    pub fn new(parameters: Vec<Parameter>, body: ExprRef) -> Self {
        Self { parameters, body }
    }

    /// True when `expr` is one of this lambda's parameters.
    pub fn is_parameter(&self, expr: &Expr) -> bool {
        expr.as_parameter()
            .is_some_and(|p| self.parameters.iter().any(|q| q == p))
    }
}
