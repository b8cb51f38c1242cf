//! Scalar expressions over one or two source tuples
//!
//! ## Evaluation Rules
//!
//! - A NULL operand makes arithmetic and comparison yield NULL
//! - `Int op Int` stays integer; overflow is an error, not a wrap
//! - Mixing `Int` and `Float` promotes to `Float`
//! - Comparison across unrelated types is an error

use super::ProjectionError;
use std::cmp::Ordering;
use std::fmt;
use tessera_core::{Tuple, Value};

/// Arithmetic operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    /// `+`
    Add,
    /// `-`
    Subtract,
    /// `*`
    Multiply,
    /// `/`
    Divide,
    /// `%`, integers only
    Modulo,
}

impl ArithmeticOp {
    fn symbol(&self) -> &'static str {
        match self {
            ArithmeticOp::Add => "+",
            ArithmeticOp::Subtract => "-",
            ArithmeticOp::Multiply => "*",
            ArithmeticOp::Divide => "/",
            ArithmeticOp::Modulo => "%",
        }
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Equal,
    /// `<>`
    NotEqual,
    /// `<`
    Less,
    /// `<=`
    LessOrEqual,
    /// `>`
    Greater,
    /// `>=`
    GreaterOrEqual,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Equal => "=",
            CompareOp::NotEqual => "<>",
            CompareOp::Less => "<",
            CompareOp::LessOrEqual => "<=",
            CompareOp::Greater => ">",
            CompareOp::GreaterOrEqual => ">=",
        }
    }

    fn holds(&self, ord: Ordering) -> bool {
        match self {
            CompareOp::Equal => ord == Ordering::Equal,
            CompareOp::NotEqual => ord != Ordering::Equal,
            CompareOp::Less => ord == Ordering::Less,
            CompareOp::LessOrEqual => ord != Ordering::Greater,
            CompareOp::Greater => ord == Ordering::Greater,
            CompareOp::GreaterOrEqual => ord != Ordering::Less,
        }
    }
}

/// Expression tree evaluated against a pair of source tuples
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// A literal value
    Constant(Value),
    /// A column of source tuple `tuple_index` (0 or 1)
    Column {
        /// Which source tuple
        tuple_index: usize,
        /// Column within it
        column: usize,
    },
    /// `left op right`
    Arithmetic {
        /// Operator
        op: ArithmeticOp,
        /// Left operand
        left: Box<Expression>,
        /// Right operand
        right: Box<Expression>,
    },
    /// `left op right`, yielding a boolean
    Comparison {
        /// Operator
        op: CompareOp,
        /// Left operand
        left: Box<Expression>,
        /// Right operand
        right: Box<Expression>,
    },
}

impl Expression {
    /// Literal
    pub fn constant(value: impl Into<Value>) -> Self {
        Expression::Constant(value.into())
    }

    /// Column reference
    pub fn column(tuple_index: usize, column: usize) -> Self {
        Expression::Column {
            tuple_index,
            column,
        }
    }

    /// Arithmetic node
    pub fn arithmetic(op: ArithmeticOp, left: Expression, right: Expression) -> Self {
        Expression::Arithmetic {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Comparison node
    pub fn compare(op: CompareOp, left: Expression, right: Expression) -> Self {
        Expression::Comparison {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Highest source tuple index referenced anywhere in the tree
    pub fn max_tuple_index(&self) -> Option<usize> {
        match self {
            Expression::Constant(_) => None,
            Expression::Column { tuple_index, .. } => Some(*tuple_index),
            Expression::Arithmetic { left, right, .. }
            | Expression::Comparison { left, right, .. } => {
                match (left.max_tuple_index(), right.max_tuple_index()) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                }
            }
        }
    }

    /// Evaluate against `tuple1` and an optional `tuple2`
    pub fn evaluate(&self, tuple1: &Tuple, tuple2: Option<&Tuple>) -> Result<Value, ProjectionError> {
        match self {
            Expression::Constant(v) => Ok(v.clone()),
            Expression::Column {
                tuple_index,
                column,
            } => source_value(*tuple_index, *column, tuple1, tuple2).cloned(),
            Expression::Arithmetic { op, left, right } => {
                let l = left.evaluate(tuple1, tuple2)?;
                let r = right.evaluate(tuple1, tuple2)?;
                arithmetic(*op, &l, &r)
            }
            Expression::Comparison { op, left, right } => {
                let l = left.evaluate(tuple1, tuple2)?;
                let r = right.evaluate(tuple1, tuple2)?;
                compare(*op, &l, &r)
            }
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Constant(v) => write!(f, "{}", v),
            Expression::Column {
                tuple_index,
                column,
            } => write!(f, "${}.{}", tuple_index, column),
            Expression::Arithmetic { op, left, right } => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            Expression::Comparison { op, left, right } => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
        }
    }
}

/// Look up a column of source tuple `tuple_index`
pub(crate) fn source_value<'t>(
    tuple_index: usize,
    column: usize,
    tuple1: &'t Tuple,
    tuple2: Option<&'t Tuple>,
) -> Result<&'t Value, ProjectionError> {
    let tuple = match tuple_index {
        0 => tuple1,
        1 => tuple2.ok_or(ProjectionError::MissingSourceTuple)?,
        other => return Err(ProjectionError::InvalidTupleIndex(other)),
    };
    tuple.get(column).ok_or(ProjectionError::SourceColumnOutOfRange {
        tuple_index,
        column,
        width: tuple.column_count(),
    })
}

fn arithmetic(op: ArithmeticOp, left: &Value, right: &Value) -> Result<Value, ProjectionError> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    match (left, right) {
        (Value::Int(l), Value::Int(r)) => {
            let (l, r) = (*l, *r);
            if r == 0 && matches!(op, ArithmeticOp::Divide | ArithmeticOp::Modulo) {
                return Err(ProjectionError::DivisionByZero);
            }
            let result = match op {
                ArithmeticOp::Add => l.checked_add(r),
                ArithmeticOp::Subtract => l.checked_sub(r),
                ArithmeticOp::Multiply => l.checked_mul(r),
                ArithmeticOp::Divide => l.checked_div(r),
                ArithmeticOp::Modulo => l.checked_rem(r),
            };
            result
                .map(Value::Int)
                .ok_or(ProjectionError::IntegerOverflow {
                    op: op.symbol(),
                    left: l,
                    right: r,
                })
        }
        _ => {
            let (l, r) = match (numeric(left), numeric(right)) {
                (Some(l), Some(r)) if op != ArithmeticOp::Modulo => (l, r),
                _ => {
                    return Err(ProjectionError::TypeMismatch {
                        op: op.symbol(),
                        left: left.type_name(),
                        right: right.type_name(),
                    })
                }
            };
            if r == 0.0 && op == ArithmeticOp::Divide {
                return Err(ProjectionError::DivisionByZero);
            }
            Ok(Value::Float(match op {
                ArithmeticOp::Add => l + r,
                ArithmeticOp::Subtract => l - r,
                ArithmeticOp::Multiply => l * r,
                _ => l / r,
            }))
        }
    }
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<Value, ProjectionError> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    let ord = match (left, right) {
        (Value::Int(l), Value::Int(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bytes(l), Value::Bytes(r)) => Some(l.cmp(r)),
        _ => match (numeric(left), numeric(right)) {
            // NaN compares as unordered: every operator but <> is false
            (Some(l), Some(r)) => match l.partial_cmp(&r) {
                Some(ord) => Some(ord),
                None => return Ok(Value::Bool(op == CompareOp::NotEqual)),
            },
            _ => None,
        },
    };
    match ord {
        Some(ord) => Ok(Value::Bool(op.holds(ord))),
        None => Err(ProjectionError::TypeMismatch {
            op: op.symbol(),
            left: left.type_name(),
            right: right.type_name(),
        }),
    }
}
