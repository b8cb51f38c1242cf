//! Tuple projection for executor output
//!
//! A `ProjectInfo` fills destination columns from one or two source tuples
//! in two passes: the target list evaluates an expression per column, then
//! the direct map copies source columns unchanged. A destination column
//! belongs to exactly one of the two lists.

pub mod expression;

pub use expression::{ArithmeticOp, CompareOp, Expression};

use expression::source_value;
use rustc_hash::FxHashSet;
use std::fmt;
use tessera_core::Tuple;
use thiserror::Error;

/// Destination column index
pub type ColumnId = usize;

/// Errors from building or evaluating a projection
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProjectionError {
    /// A destination column appears more than once across both lists
    #[error("destination column {0} is assigned more than once")]
    OverlappingColumn(ColumnId),

    /// A source tuple index other than 0 or 1
    #[error("source tuple index {0} is not 0 or 1")]
    InvalidTupleIndex(usize),

    /// A reference to the second tuple when only one was given
    #[error("projection reads a second source tuple but none was given")]
    MissingSourceTuple,

    /// A source column past the end of its tuple
    #[error("source column {column} out of range for tuple {tuple_index} with {width} columns")]
    SourceColumnOutOfRange {
        /// Source tuple index
        tuple_index: usize,
        /// Requested column
        column: usize,
        /// Columns the tuple has
        width: usize,
    },

    /// A destination column past the end of the destination tuple
    #[error("destination column {column} out of range for tuple with {width} columns")]
    DestinationColumnOutOfRange {
        /// Requested column
        column: ColumnId,
        /// Columns the destination has
        width: usize,
    },

    /// Operand types the operator does not accept
    #[error("cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        /// Operator symbol
        op: &'static str,
        /// Left operand type
        left: &'static str,
        /// Right operand type
        right: &'static str,
    },

    /// Integer result out of range
    #[error("integer overflow in {left} {op} {right}")]
    IntegerOverflow {
        /// Operator symbol
        op: &'static str,
        /// Left operand
        left: i64,
        /// Right operand
        right: i64,
    },

    /// Division or modulo by zero
    #[error("division by zero")]
    DivisionByZero,
}

/// Projection from source tuples into a destination tuple
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectInfo {
    target_list: Vec<(ColumnId, Expression)>,
    direct_map_list: Vec<(ColumnId, (usize, usize))>,
}

impl ProjectInfo {
    /// Build a projection
    ///
    /// `direct_map_list` entries are `(dest_col, (tuple_index, src_col))`.
    ///
    /// # Errors
    ///
    /// - `OverlappingColumn` if a destination column is listed twice
    /// - `InvalidTupleIndex` if a direct map or expression names a tuple
    ///   other than 0 or 1
    pub fn new(
        target_list: Vec<(ColumnId, Expression)>,
        direct_map_list: Vec<(ColumnId, (usize, usize))>,
    ) -> Result<Self, ProjectionError> {
        let mut seen = FxHashSet::default();
        let dests = target_list
            .iter()
            .map(|(col, _)| *col)
            .chain(direct_map_list.iter().map(|(col, _)| *col));
        for col in dests {
            if !seen.insert(col) {
                return Err(ProjectionError::OverlappingColumn(col));
            }
        }

        let sources = target_list
            .iter()
            .filter_map(|(_, expr)| expr.max_tuple_index())
            .chain(direct_map_list.iter().map(|(_, (idx, _))| *idx));
        for idx in sources {
            if idx > 1 {
                return Err(ProjectionError::InvalidTupleIndex(idx));
            }
        }

        Ok(Self {
            target_list,
            direct_map_list,
        })
    }

    /// Projection that only copies columns
    pub fn direct(direct_map_list: Vec<(ColumnId, (usize, usize))>) -> Result<Self, ProjectionError> {
        Self::new(Vec::new(), direct_map_list)
    }

    /// Expression-driven destination columns
    pub fn target_list(&self) -> &[(ColumnId, Expression)] {
        &self.target_list
    }

    /// Copied destination columns
    pub fn direct_map_list(&self) -> &[(ColumnId, (usize, usize))] {
        &self.direct_map_list
    }

    /// Whether any column reads the second source tuple
    pub fn needs_second_tuple(&self) -> bool {
        self.target_list
            .iter()
            .any(|(_, expr)| expr.max_tuple_index() == Some(1))
            || self.direct_map_list.iter().any(|(_, (idx, _))| *idx == 1)
    }

    /// Fill `dest` from `tuple1` and an optional `tuple2`
    ///
    /// `dest` must already have every destination column. Columns not
    /// named by either list are left untouched. On error `dest` may be
    /// partially written.
    pub fn evaluate(
        &self,
        dest: &mut Tuple,
        tuple1: &Tuple,
        tuple2: Option<&Tuple>,
    ) -> Result<(), ProjectionError> {
        for (col, expr) in &self.target_list {
            let value = expr.evaluate(tuple1, tuple2)?;
            set_column(dest, *col, value)?;
        }
        for (col, (tuple_index, src_col)) in &self.direct_map_list {
            let value = source_value(*tuple_index, *src_col, tuple1, tuple2)?.clone();
            set_column(dest, *col, value)?;
        }
        Ok(())
    }

    /// Evaluate into a fresh tuple of `width` columns
    pub fn project(
        &self,
        width: usize,
        tuple1: &Tuple,
        tuple2: Option<&Tuple>,
    ) -> Result<Tuple, ProjectionError> {
        let mut dest = Tuple::with_columns(width);
        self.evaluate(&mut dest, tuple1, tuple2)?;
        Ok(dest)
    }
}

fn set_column(
    dest: &mut Tuple,
    column: ColumnId,
    value: tessera_core::Value,
) -> Result<(), ProjectionError> {
    let width = dest.column_count();
    if dest.set(column, value) {
        Ok(())
    } else {
        Err(ProjectionError::DestinationColumnOutOfRange { column, width })
    }
}

impl fmt::Display for ProjectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Target List: <dest_col, expression>")?;
        for (col, expr) in &self.target_list {
            writeln!(f, "  {} <- {}", col, expr)?;
        }
        writeln!(f, "Direct Map: <dest_col, <tuple_index, src_col>>")?;
        for (col, (idx, src)) in &self.direct_map_list {
            writeln!(f, "  {} <- <{}, {}>", col, idx, src)?;
        }
        Ok(())
    }
}
