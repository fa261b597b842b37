//! Shared state of one incremental maintenance run.
//!
//! Tuples are tracked through the run by a growable flag vector and two
//! shared work lists: the delete list and the added list. Work lists are
//! append-only with an atomic dequeue cursor, so any number of workers can
//! drain them concurrently; per-level end positions let later phases
//! revisit exactly the entries of one level.

use ferrite_db_core::TupleIndex;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// The tuple was newly scheduled for over-deletion.
pub const GF_DELETED_NEW: u8 = 0x01;
/// The tuple's over-deletion has been propagated.
pub const GF_DELETED: u8 = 0x02;
/// The tuple was newly scheduled for insertion/re-derivation.
pub const GF_ADDED_NEW: u8 = 0x04;
/// The tuple's insertion has been propagated.
pub const GF_ADDED: u8 = 0x08;
/// The tuple was merged away while being added.
pub const GF_ADDED_MERGED: u8 = 0x10;

/// Growable vector of per-tuple flag bytes with first-set-wins bit OR.
#[derive(Debug, Default)]
pub struct FlagVector {
    flags: RwLock<Vec<AtomicU8>>,
}

impl FlagVector {
    pub fn new() -> Self {
        FlagVector::default()
    }

    /// Current flags of a tuple; zero when never flagged.
    pub fn get(&self, index: TupleIndex) -> u8 {
        let flags = self.flags.read();
        match flags.get(index.as_usize()) {
            Some(byte) => byte.load(Ordering::Acquire),
            None => 0,
        }
    }

    /// OR flags into a tuple's byte. Returns whether any bit was newly set.
    pub fn add(&self, index: TupleIndex, bits: u8) -> bool {
        {
            let flags = self.flags.read();
            if let Some(byte) = flags.get(index.as_usize()) {
                return byte.fetch_or(bits, Ordering::AcqRel) & bits != bits;
            }
        }
        let mut flags = self.flags.write();
        while flags.len() <= index.as_usize() {
            flags.push(AtomicU8::new(0));
        }
        flags[index.as_usize()].fetch_or(bits, Ordering::AcqRel) & bits != bits
    }

    /// Reset every byte to zero.
    pub fn clear(&self) {
        self.flags.write().clear();
    }
}

/// Append-only multi-producer work list with an atomic dequeue cursor.
#[derive(Debug)]
pub struct WorkQueue<T> {
    items: RwLock<Vec<T>>,
    dequeue: AtomicUsize,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        WorkQueue {
            items: RwLock::new(Vec::new()),
            dequeue: AtomicUsize::new(0),
        }
    }
}

impl<T: Copy> WorkQueue<T> {
    pub fn new() -> Self {
        WorkQueue {
            items: RwLock::new(Vec::new()),
            dequeue: AtomicUsize::new(0),
        }
    }

    pub fn enqueue(&self, item: T) {
        self.items.write().push(item);
    }

    /// Claim the next item strictly before `limit`, if any.
    pub fn dequeue_up_to(&self, limit: usize) -> Option<T> {
        let items = self.items.read();
        let end = limit.min(items.len());
        loop {
            let position = self.dequeue.load(Ordering::Acquire);
            if position >= end {
                return None;
            }
            if self
                .dequeue
                .compare_exchange(position, position + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(items[position]);
            }
        }
    }

    /// Claim the next item, if any.
    pub fn dequeue(&self) -> Option<T> {
        self.dequeue_up_to(usize::MAX)
    }

    /// Move the dequeue cursor, e.g. back to the start of a level window.
    pub fn reset_dequeue_position(&self, position: usize) {
        self.dequeue.store(position, Ordering::Release);
    }

    /// Position one past the last appended item.
    pub fn first_free_position(&self) -> usize {
        self.items.read().len()
    }

    /// Whether entries at or past the dequeue cursor remain.
    pub fn has_pending(&self) -> bool {
        self.dequeue.load(Ordering::Acquire) < self.items.read().len()
    }

    /// Append every item of another queue.
    pub fn append_from(&self, other: &WorkQueue<T>) {
        let source = other.items.read();
        self.items.write().extend_from_slice(&source);
    }

    pub fn clear(&self) {
        self.items.write().clear();
        self.dequeue.store(0, Ordering::Release);
    }
}

/// State shared by all phases of one incremental maintenance run.
#[derive(Debug, Default)]
pub struct IncrementalReasoningState {
    global_flags: FlagVector,
    initially_deleted_by_level: Vec<WorkQueue<TupleIndex>>,
    initially_added_by_level: Vec<WorkQueue<TupleIndex>>,
    delete_list: WorkQueue<TupleIndex>,
    delete_list_end_by_level: RwLock<Vec<usize>>,
    added_list: WorkQueue<TupleIndex>,
    added_list_end_by_level: RwLock<Vec<usize>>,
}

impl IncrementalReasoningState {
    pub fn new() -> Self {
        IncrementalReasoningState::default()
    }

    /// Reset the whole-run state for `max_component_level + 1` levels.
    pub fn initialize_global(&mut self, max_component_level: usize) {
        let levels = max_component_level + 1;
        self.global_flags.clear();
        self.initially_deleted_by_level = (0..levels).map(|_| WorkQueue::new()).collect();
        self.initially_added_by_level = (0..levels).map(|_| WorkQueue::new()).collect();
        self.delete_list.clear();
        *self.delete_list_end_by_level.write() = vec![0; levels];
        self.added_list.clear();
        *self.added_list_end_by_level.write() = vec![0; levels];
    }

    pub fn max_component_level(&self) -> usize {
        self.initially_deleted_by_level.len().saturating_sub(1)
    }

    pub fn global_flags(&self, index: TupleIndex) -> u8 {
        self.global_flags.get(index)
    }

    pub fn add_global_flags(&self, index: TupleIndex, bits: u8) -> bool {
        self.global_flags.add(index, bits)
    }

    pub fn initially_deleted(&self, component_level: usize) -> &WorkQueue<TupleIndex> {
        &self.initially_deleted_by_level[component_level]
    }

    pub fn initially_added(&self, component_level: usize) -> &WorkQueue<TupleIndex> {
        &self.initially_added_by_level[component_level]
    }

    pub fn delete_list(&self) -> &WorkQueue<TupleIndex> {
        &self.delete_list
    }

    pub fn added_list(&self) -> &WorkQueue<TupleIndex> {
        &self.added_list
    }

    pub fn delete_list_end(&self, component_level: usize) -> usize {
        self.delete_list_end_by_level.read()[component_level]
    }

    pub fn added_list_end(&self, component_level: usize) -> usize {
        self.added_list_end_by_level.read()[component_level]
    }

    /// Record the list positions at the end of a level, delimiting the
    /// level's windows for later phases.
    pub fn record_level_ends(&self, component_level: usize) {
        self.delete_list_end_by_level.write()[component_level] =
            self.delete_list.first_free_position();
        self.added_list_end_by_level.write()[component_level] =
            self.added_list.first_free_position();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_vector_first_set_wins() {
        let flags = FlagVector::new();
        assert!(flags.add(TupleIndex(5), GF_DELETED_NEW));
        assert!(!flags.add(TupleIndex(5), GF_DELETED_NEW));
        assert!(flags.add(TupleIndex(5), GF_DELETED));
        assert_eq!(flags.get(TupleIndex(5)), GF_DELETED_NEW | GF_DELETED);
        assert_eq!(flags.get(TupleIndex(99)), 0);
    }

    #[test]
    fn test_work_queue_windows() {
        let queue: WorkQueue<TupleIndex> = WorkQueue::new();
        for index in 0..5 {
            queue.enqueue(TupleIndex(index));
        }
        assert_eq!(queue.dequeue_up_to(2), Some(TupleIndex(0)));
        assert_eq!(queue.dequeue_up_to(2), Some(TupleIndex(1)));
        assert_eq!(queue.dequeue_up_to(2), None);
        assert_eq!(queue.dequeue(), Some(TupleIndex(2)));
        queue.reset_dequeue_position(0);
        assert_eq!(queue.dequeue(), Some(TupleIndex(0)));
        assert_eq!(queue.first_free_position(), 5);
        assert!(queue.has_pending());
    }

    #[test]
    fn test_state_level_bookkeeping() {
        let mut state = IncrementalReasoningState::new();
        state.initialize_global(2);
        assert_eq!(state.max_component_level(), 2);
        state.delete_list().enqueue(TupleIndex(1));
        state.record_level_ends(0);
        state.delete_list().enqueue(TupleIndex(2));
        state.record_level_ends(1);
        assert_eq!(state.delete_list_end(0), 1);
        assert_eq!(state.delete_list_end(1), 2);
        assert_eq!(state.added_list_end(1), 0);
    }
}
