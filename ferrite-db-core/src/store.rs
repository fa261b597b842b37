//! The tuple store interface and an in-memory implementation.
//!
//! The reasoner consumes storage exclusively through [`TupleStore`]:
//! add-if-absent insertion, index/status lookup, conditional status
//! transitions, and iteration parameterized by which argument positions are
//! bound. [`MemoryTupleTable`] backs tests and in-process embedders with an
//! append-only tuple vector plus hash indices on the subject, predicate,
//! and object positions.

use crate::error::Result;
use crate::rid::Rid;
use crate::tuple::{
    Tuple, TupleIndex, TuplePattern, TupleStatus, TUPLE_STATUS_EDB_DEL, TUPLE_STATUS_EDB_INS,
};
use hashbrown::HashMap;
use parking_lot::RwLock;

/// The narrow storage contract the reasoner evaluates against.
///
/// Implementations must be safe to share across evaluation workers; all
/// methods take `&self`. Duplicate-derivation races are resolved by
/// `add_tuple`'s add-if-absent semantics.
pub trait TupleStore: Send + Sync {
    /// Add a tuple if absent, and transition its status bits: bits in
    /// `remove_status` are cleared and bits in `add_status` are set. A tuple
    /// created by this call starts with status `add_status`.
    ///
    /// Returns whether anything changed (the tuple was created, or its
    /// status actually transitioned) together with the tuple's index.
    fn add_tuple(
        &self,
        tuple: Tuple,
        remove_status: TupleStatus,
        add_status: TupleStatus,
    ) -> Result<(bool, TupleIndex)>;

    /// Look up the index of a stored tuple.
    fn tuple_index(&self, tuple: &Tuple) -> Option<TupleIndex>;

    /// The tuple at an index. The index must have been obtained from this
    /// store.
    fn tuple(&self, index: TupleIndex) -> Tuple;

    /// The status bits of a stored tuple.
    fn tuple_status(&self, index: TupleIndex) -> TupleStatus;

    /// Conditional status transition: if `(status & expected_mask) ==
    /// expected`, clear `remove` and set `add`. Returns whether the stored
    /// status actually changed.
    fn update_status(
        &self,
        index: TupleIndex,
        expected_mask: TupleStatus,
        expected: TupleStatus,
        remove: TupleStatus,
        add: TupleStatus,
    ) -> bool;

    /// Number of tuples ever stored. Indexes `0..tuple_count()` are valid.
    fn tuple_count(&self) -> usize;

    /// All tuples matching a pattern, with their indexes and statuses.
    ///
    /// The result is a snapshot; tuples added concurrently may or may not
    /// be included.
    fn matches(&self, pattern: &TuplePattern) -> Vec<(TupleIndex, Tuple, TupleStatus)>;

    /// Schedule an asserted tuple for deletion in the next incremental
    /// update. Returns whether the tuple existed and was newly scheduled.
    fn schedule_delete(&self, tuple: Tuple) -> bool;

    /// Schedule a tuple for insertion in the next incremental update.
    fn schedule_insert(&self, tuple: Tuple) -> Result<TupleIndex>;

    /// Tuples currently scheduled for deletion.
    fn scheduled_deletions(&self) -> Vec<TupleIndex>;

    /// Tuples currently scheduled for insertion.
    fn scheduled_insertions(&self) -> Vec<TupleIndex>;

    /// Wipe both scheduled-change queues after an update completes.
    fn clear_scheduled(&self);
}

#[derive(Default)]
struct TableInner {
    tuples: Vec<Tuple>,
    statuses: Vec<TupleStatus>,
    index: HashMap<Tuple, TupleIndex>,
    by_subject: HashMap<Rid, Vec<TupleIndex>>,
    by_predicate: HashMap<Rid, Vec<TupleIndex>>,
    by_object: HashMap<Rid, Vec<TupleIndex>>,
    scheduled_deletions: Vec<TupleIndex>,
    scheduled_insertions: Vec<TupleIndex>,
}

impl TableInner {
    fn insert(&mut self, tuple: Tuple, status: TupleStatus) -> TupleIndex {
        let index = TupleIndex(self.tuples.len() as u64);
        self.tuples.push(tuple);
        self.statuses.push(status);
        self.index.insert(tuple, index);
        self.by_subject.entry(tuple[0]).or_default().push(index);
        self.by_predicate.entry(tuple[1]).or_default().push(index);
        self.by_object.entry(tuple[2]).or_default().push(index);
        index
    }

    fn candidates(&self, pattern: &TuplePattern) -> Option<&[TupleIndex]> {
        // Prefer the smallest candidate list among the bound positions.
        let mut best: Option<&Vec<TupleIndex>> = None;
        let lists = [
            pattern.subject.map(|s| self.by_subject.get(&s)),
            pattern.predicate.map(|p| self.by_predicate.get(&p)),
            pattern.object.map(|o| self.by_object.get(&o)),
        ];
        for entry in lists.into_iter().flatten() {
            match entry {
                None => return Some(&[]),
                Some(list) => {
                    if best.map_or(true, |b| list.len() < b.len()) {
                        best = Some(list);
                    }
                }
            }
        }
        best.map(|list| list.as_slice())
    }
}

/// In-memory tuple table with hash indices on all three positions.
#[derive(Default)]
pub struct MemoryTupleTable {
    inner: RwLock<TableInner>,
}

impl MemoryTupleTable {
    /// Create an empty table.
    pub fn new() -> Self {
        MemoryTupleTable::default()
    }

    /// Add an asserted fact with the given status bits, bypassing the
    /// scheduled-change queues. Used to load an initial fact set.
    pub fn assert_fact(&self, tuple: Tuple, status: TupleStatus) -> TupleIndex {
        let mut inner = self.inner.write();
        if let Some(&index) = inner.index.get(&tuple) {
            inner.statuses[index.as_usize()] |= status;
            index
        } else {
            inner.insert(tuple, status)
        }
    }
}

impl TupleStore for MemoryTupleTable {
    fn add_tuple(
        &self,
        tuple: Tuple,
        remove_status: TupleStatus,
        add_status: TupleStatus,
    ) -> Result<(bool, TupleIndex)> {
        let mut inner = self.inner.write();
        if let Some(&index) = inner.index.get(&tuple) {
            let status = inner.statuses[index.as_usize()];
            let new_status = (status & !remove_status) | add_status;
            inner.statuses[index.as_usize()] = new_status;
            Ok((new_status != status, index))
        } else {
            let index = inner.insert(tuple, add_status);
            Ok((true, index))
        }
    }

    fn tuple_index(&self, tuple: &Tuple) -> Option<TupleIndex> {
        self.inner.read().index.get(tuple).copied()
    }

    fn tuple(&self, index: TupleIndex) -> Tuple {
        self.inner.read().tuples[index.as_usize()]
    }

    fn tuple_status(&self, index: TupleIndex) -> TupleStatus {
        self.inner.read().statuses[index.as_usize()]
    }

    fn update_status(
        &self,
        index: TupleIndex,
        expected_mask: TupleStatus,
        expected: TupleStatus,
        remove: TupleStatus,
        add: TupleStatus,
    ) -> bool {
        let mut inner = self.inner.write();
        let status = inner.statuses[index.as_usize()];
        if (status & expected_mask) != expected {
            return false;
        }
        let new_status = (status & !remove) | add;
        inner.statuses[index.as_usize()] = new_status;
        new_status != status
    }

    fn tuple_count(&self) -> usize {
        self.inner.read().tuples.len()
    }

    fn matches(&self, pattern: &TuplePattern) -> Vec<(TupleIndex, Tuple, TupleStatus)> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        match inner.candidates(pattern) {
            Some(candidates) => {
                for &index in candidates {
                    let tuple = inner.tuples[index.as_usize()];
                    if pattern.matches(&tuple) {
                        out.push((index, tuple, inner.statuses[index.as_usize()]));
                    }
                }
            }
            None => {
                for (position, tuple) in inner.tuples.iter().enumerate() {
                    out.push((
                        TupleIndex(position as u64),
                        *tuple,
                        inner.statuses[position],
                    ));
                }
            }
        }
        out
    }

    fn schedule_delete(&self, tuple: Tuple) -> bool {
        let mut inner = self.inner.write();
        let Some(&index) = inner.index.get(&tuple) else {
            return false;
        };
        let status = inner.statuses[index.as_usize()];
        if status & TUPLE_STATUS_EDB_DEL != 0 {
            return false;
        }
        inner.statuses[index.as_usize()] = status | TUPLE_STATUS_EDB_DEL;
        inner.scheduled_deletions.push(index);
        true
    }

    fn schedule_insert(&self, tuple: Tuple) -> Result<TupleIndex> {
        let mut inner = self.inner.write();
        let index = if let Some(&index) = inner.index.get(&tuple) {
            let status = inner.statuses[index.as_usize()];
            if status & TUPLE_STATUS_EDB_INS != 0 {
                return Ok(index);
            }
            inner.statuses[index.as_usize()] = status | TUPLE_STATUS_EDB_INS;
            index
        } else {
            inner.insert(tuple, TUPLE_STATUS_EDB_INS)
        };
        inner.scheduled_insertions.push(index);
        Ok(index)
    }

    fn scheduled_deletions(&self) -> Vec<TupleIndex> {
        self.inner.read().scheduled_deletions.clone()
    }

    fn scheduled_insertions(&self) -> Vec<TupleIndex> {
        self.inner.read().scheduled_insertions.clone()
    }

    fn clear_scheduled(&self) {
        let mut inner = self.inner.write();
        inner.scheduled_deletions.clear();
        inner.scheduled_insertions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{TUPLE_STATUS_EDB, TUPLE_STATUS_IDB};

    fn t(s: u64, p: u64, o: u64) -> Tuple {
        [Rid(s), Rid(p), Rid(o)]
    }

    #[test]
    fn test_add_if_absent() {
        let table = MemoryTupleTable::new();
        let (new1, i1) = table.add_tuple(t(1, 2, 3), 0, TUPLE_STATUS_IDB).unwrap();
        let (new2, i2) = table.add_tuple(t(1, 2, 3), 0, TUPLE_STATUS_IDB).unwrap();
        assert!(new1);
        assert!(!new2);
        assert_eq!(i1, i2);
        assert_eq!(table.tuple_count(), 1);
    }

    #[test]
    fn test_status_transition_on_existing() {
        let table = MemoryTupleTable::new();
        let (_, index) = table.add_tuple(t(1, 2, 3), 0, TUPLE_STATUS_EDB).unwrap();
        let (changed, _) = table.add_tuple(t(1, 2, 3), 0, TUPLE_STATUS_IDB).unwrap();
        assert!(changed);
        assert_eq!(
            table.tuple_status(index),
            TUPLE_STATUS_EDB | TUPLE_STATUS_IDB
        );
    }

    #[test]
    fn test_update_status_conditional() {
        let table = MemoryTupleTable::new();
        let (_, index) = table.add_tuple(t(1, 2, 3), 0, TUPLE_STATUS_IDB).unwrap();
        // Expectation fails: nothing happens.
        assert!(!table.update_status(
            index,
            TUPLE_STATUS_EDB,
            TUPLE_STATUS_EDB,
            TUPLE_STATUS_IDB,
            0
        ));
        assert_eq!(table.tuple_status(index), TUPLE_STATUS_IDB);
        // Unconditional removal.
        assert!(table.update_status(index, 0, 0, TUPLE_STATUS_IDB, 0));
        assert_eq!(table.tuple_status(index), 0);
    }

    #[test]
    fn test_pattern_matching_uses_indices() {
        let table = MemoryTupleTable::new();
        table.add_tuple(t(1, 2, 3), 0, TUPLE_STATUS_IDB).unwrap();
        table.add_tuple(t(1, 2, 4), 0, TUPLE_STATUS_IDB).unwrap();
        table.add_tuple(t(5, 2, 3), 0, TUPLE_STATUS_IDB).unwrap();

        let by_subject = table.matches(&TuplePattern::new(Some(Rid(1)), None, None));
        assert_eq!(by_subject.len(), 2);

        let by_so = table.matches(&TuplePattern::new(Some(Rid(1)), None, Some(Rid(3))));
        assert_eq!(by_so.len(), 1);
        assert_eq!(by_so[0].1, t(1, 2, 3));

        let all = table.matches(&TuplePattern::any());
        assert_eq!(all.len(), 3);

        let none = table.matches(&TuplePattern::new(Some(Rid(9)), None, None));
        assert!(none.is_empty());
    }

    #[test]
    fn test_scheduled_queues() {
        let table = MemoryTupleTable::new();
        table.assert_fact(t(1, 2, 3), TUPLE_STATUS_EDB | TUPLE_STATUS_IDB);
        assert!(table.schedule_delete(t(1, 2, 3)));
        assert!(!table.schedule_delete(t(1, 2, 3)));
        assert!(!table.schedule_delete(t(9, 9, 9)));
        table.schedule_insert(t(4, 5, 6)).unwrap();
        assert_eq!(table.scheduled_deletions().len(), 1);
        assert_eq!(table.scheduled_insertions().len(), 1);
        table.clear_scheduled();
        assert!(table.scheduled_deletions().is_empty());
        assert!(table.scheduled_insertions().is_empty());
    }
}
