//! Projection over transactional reads
//!
//! Source tuples come from the transaction manager's read path, the way an
//! executor feeds a join or update.

use proptest::prelude::*;
use tessera_core::{Tuple, Value};
use tessera_engine::{
    ArithmeticOp, CompareOp, Database, Expression, ProjectInfo, ProjectionError,
};

// ============================================================================
// Executor-shaped projections
// ============================================================================

#[test]
fn test_join_projection_from_two_reads() {
    let db = Database::cache().unwrap();
    let (order, customer) = db
        .transaction(|txn| {
            let order = txn.insert_new(Tuple::new(vec![
                Value::Int(7),
                Value::Int(3),
                Value::Float(2.5),
            ]))?;
            let customer = txn.insert_new(Tuple::new(vec![
                Value::Int(7),
                Value::from("ada"),
            ]))?;
            Ok((order, customer))
        })
        .unwrap();

    // [name, qty * price, qty > 2]
    let info = ProjectInfo::new(
        vec![
            (
                1,
                Expression::arithmetic(
                    ArithmeticOp::Multiply,
                    Expression::column(0, 1),
                    Expression::column(0, 2),
                ),
            ),
            (
                2,
                Expression::compare(
                    CompareOp::Greater,
                    Expression::column(0, 1),
                    Expression::constant(2i64),
                ),
            ),
        ],
        vec![(0, (1, 1))],
    )
    .unwrap();
    assert!(info.needs_second_tuple());

    let out = db
        .transaction(|txn| {
            let left = txn.read(order)?.ok_or(tessera_core::Error::TupleNotFound(order))?;
            let right = txn
                .read(customer)?
                .ok_or(tessera_core::Error::TupleNotFound(customer))?;
            Ok(info.project(3, &left, Some(&right)))
        })
        .unwrap()
        .unwrap();

    assert_eq!(
        out,
        Tuple::new(vec![Value::from("ada"), Value::Float(7.5), Value::Bool(true)])
    );
}

#[test]
fn test_update_projection_feeds_write() {
    let db = Database::cache().unwrap();
    let slot = db
        .transaction(|txn| txn.insert_new(Tuple::new(vec![Value::Int(1), Value::Int(100)])))
        .unwrap();

    // SET col1 = col1 + 10, col0 unchanged
    let info = ProjectInfo::new(
        vec![(
            1,
            Expression::arithmetic(
                ArithmeticOp::Add,
                Expression::column(0, 1),
                Expression::constant(10i64),
            ),
        )],
        vec![(0, (0, 0))],
    )
    .unwrap();

    for _ in 0..3 {
        db.transaction(|txn| {
            let current = txn.read(slot)?.ok_or(tessera_core::Error::TupleNotFound(slot))?;
            let mut next = Tuple::with_columns(2);
            info.evaluate(&mut next, &current, None)
                .map_err(|e| tessera_core::Error::InvalidConfig(e.to_string()))?;
            txn.update(slot, next)
        })
        .unwrap();
    }

    assert_eq!(
        db.transaction(|txn| txn.read(slot)).unwrap(),
        Some(Tuple::new(vec![Value::Int(1), Value::Int(130)]))
    );
}

#[test]
fn test_direct_map_to_missing_second_tuple() {
    let info = ProjectInfo::direct(vec![(0, (0, 0)), (1, (1, 0))]).unwrap();
    let mut dest = Tuple::with_columns(2);
    let err = info
        .evaluate(&mut dest, &Tuple::new(vec![Value::Int(1)]), None)
        .unwrap_err();
    assert_eq!(err, ProjectionError::MissingSourceTuple);
}

#[test]
fn test_source_column_out_of_range() {
    let info = ProjectInfo::direct(vec![(0, (0, 4))]).unwrap();
    let err = info
        .project(1, &Tuple::new(vec![Value::Int(1)]), None)
        .unwrap_err();
    assert_eq!(
        err,
        ProjectionError::SourceColumnOutOfRange {
            tuple_index: 0,
            column: 4,
            width: 1
        }
    );
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// A direct map that permutes columns places every source value at
    /// its mapped destination.
    #[test]
    fn prop_direct_map_permutation(
        values in prop::collection::vec(any::<i64>(), 1..12),
        seed in any::<u64>(),
    ) {
        let width = values.len();
        let mut order: Vec<usize> = (0..width).collect();
        // deterministic shuffle from the seed
        let mut s = seed;
        for i in (1..width).rev() {
            s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            order.swap(i, (s >> 33) as usize % (i + 1));
        }

        let map = order.iter().enumerate().map(|(dest, src)| (dest, (0, *src))).collect();
        let info = ProjectInfo::direct(map).unwrap();
        let source = Tuple::new(values.iter().copied().map(Value::Int).collect());
        let out = info.project(width, &source, None).unwrap();

        for (dest, src) in order.iter().enumerate() {
            prop_assert_eq!(out.get(dest), Some(&Value::Int(values[*src])));
        }
    }

    /// Any destination column listed twice is rejected.
    #[test]
    fn prop_duplicate_destination_rejected(
        dests in prop::collection::vec(0usize..6, 2..8),
    ) {
        let mut sorted = dests.clone();
        sorted.sort_unstable();
        sorted.dedup();
        let has_duplicate = sorted.len() < dests.len();

        let (targets, direct) = dests.split_at(dests.len() / 2);
        let result = ProjectInfo::new(
            targets.iter().map(|c| (*c, Expression::constant(0i64))).collect(),
            direct.iter().map(|c| (*c, (0, 0))).collect(),
        );
        prop_assert_eq!(result.is_err(), has_duplicate);
    }
}
