use std::fmt;

use crate::attr::Attribute;

/// Scalar literal carried by join conditions.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    /// 64-bit integer.
    Int64(i64),
    /// UTF-8 string.
    Utf8(String),
    /// Boolean.
    Boolean(bool),
}

/// Binary operators usable in join conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `AND`
    And,
    /// `OR`
    Or,
}

/// Residual join-condition expression.
///
/// Rewriters carry conditions through untouched; evaluation belongs to the
/// operator library.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column reference.
    Column(Attribute),
    /// Literal value.
    Literal(LiteralValue),
    /// Binary operation.
    BinaryOp {
        /// Left operand.
        left: Box<Expr>,
        /// Operator.
        op: BinaryOp,
        /// Right operand.
        right: Box<Expr>,
    },
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(a) => write!(f, "{}{}", a.name, a.id),
            Expr::Literal(LiteralValue::Int64(v)) => write!(f, "{v}"),
            Expr::Literal(LiteralValue::Utf8(v)) => write!(f, "'{v}'"),
            Expr::Literal(LiteralValue::Boolean(v)) => write!(f, "{v}"),
            Expr::BinaryOp { left, op, right } => write!(f, "({left} {op:?} {right})"),
        }
    }
}
