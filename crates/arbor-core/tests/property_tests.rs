//! # Property-Based Tests
//!
//! Invariants checked with proptest: identity stability, cancellation
//! completeness, transaction coalescing and edge bookkeeping.

use arbor_core::{
    CancelKey, Child, ChildSlot, Detached, EdgePath, Field, FieldPath, State, Store,
};
use parking_lot::Mutex;
use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq)]
struct Cell {
    value: i64,
}

impl State for Cell {}

const VALUE: Field<Cell, i64> = Field::new(FieldPath::new(0, "value"), |c| &c.value, |c| &mut c.value);

#[derive(Clone, Debug, Default)]
struct Row {
    cells: Vec<Child<Cell>>,
}

impl State for Row {
    fn children(&mut self) -> Vec<(EdgePath, &mut dyn ChildSlot)> {
        self.cells
            .iter_mut()
            .enumerate()
            .map(|(i, cell)| (EdgePath::element(CELLS.path(), i as u64), cell as &mut dyn ChildSlot))
            .collect()
    }
}

const CELLS: Field<Row, Vec<Child<Cell>>> =
    Field::new(FieldPath::new(0, "cells"), |r| &r.cells, |r| &mut r.cells);

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// Writes never change a node's identity.
    #[test]
    fn identity_stable_across_writes(values in vec(any::<i64>(), 1..30)) {
        let store = Store::default();
        let detached = Detached::new(Cell::default());
        let id = detached.id();
        let model = store.anchor(detached).expect("anchored");

        for value in &values {
            prop_assert!(model.set(&VALUE, *value));
            prop_assert_eq!(model.id(), id);
        }
        prop_assert_eq!(model.get(&VALUE), *values.last().expect("non-empty"));
        prop_assert_eq!(model.modification_count(), values.len() as u64);
    }

    /// Cancelling a key fires exactly the units tagged with it, once each.
    #[test]
    fn cancellation_by_key_is_complete(tags in vec(0u8..4, 1..40), target in 0u8..4) {
        let store = Store::default();
        let model = store.anchor(Detached::new(Cell::default())).expect("anchored");
        let fired = Arc::new(Mutex::new(Vec::new()));

        for (index, tag) in tags.iter().enumerate() {
            let fired = Arc::clone(&fired);
            model.register_cancellable(
                format!("unit-{index}"),
                [CancelKey::new(format!("k{tag}"))],
                move || fired.lock().push(index),
            );
        }

        let expected: Vec<usize> = tags
            .iter()
            .enumerate()
            .filter(|(_, tag)| **tag == target)
            .map(|(index, _)| index)
            .collect();

        let cancelled = store.cancel_all_for_key(&CancelKey::new(format!("k{target}")));
        prop_assert_eq!(cancelled, expected.len());

        let mut got = fired.lock().clone();
        got.sort_unstable();
        prop_assert_eq!(got, expected.clone());
        prop_assert_eq!(store.tasks().len(), tags.len() - expected.len());

        store.teardown();
        prop_assert_eq!(fired.lock().len(), tags.len());
    }

    /// Any number of writes in one transaction notify a subscriber once.
    #[test]
    fn transaction_notifies_once(values in vec(any::<i64>(), 1..20)) {
        let store = Store::default();
        let model = store.anchor(Detached::new(Cell::default())).expect("anchored");
        let calls = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&calls);
        model.subscribe([VALUE.path()], move || *sink.lock() += 1);

        store.transaction(|| {
            for value in &values {
                model.set(&VALUE, *value);
            }
        });
        prop_assert_eq!(*calls.lock(), 1);
    }

    /// Keeping a subset of children destructs exactly the dropped ones.
    #[test]
    fn dropped_children_are_destructed(size in 1usize..12, keep in vec(any::<bool>(), 12)) {
        let store = Store::default();
        let row = store.anchor(Detached::new(Row::default())).expect("anchored");
        row.write(&CELLS, |cells| {
            cells.extend((0..size).map(|_| Child::new(Detached::new(Cell::default()))));
        });
        let before = row.children_in(&CELLS);
        prop_assert_eq!(store.node_count(), size + 1);

        row.write(&CELLS, |cells| {
            let mut index = 0;
            cells.retain(|_| {
                let kept = keep[index];
                index += 1;
                kept
            });
        });

        let kept: BTreeSet<_> = row.children_in(&CELLS).iter().map(|cell| cell.id()).collect();
        for cell in &before {
            prop_assert_eq!(cell.lifetime().is_live(), kept.contains(&cell.id()));
        }
        prop_assert_eq!(store.node_count(), kept.len() + 1);
    }
}
