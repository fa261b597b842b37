//! Observer interfaces for materialization and incremental maintenance.
//!
//! Monitors are pure observers: every method has a no-op default body,
//! callbacks are infallible, and nothing the engine does depends on what a
//! monitor returns. [`NoopMonitor`] is the zero-overhead implementation
//! used when no observation is wanted.

use crate::logic::Rule;
use ferrite_db_core::Tuple;

/// Lifecycle events of a full materialization run.
///
/// Every event names the worker that produced it; derivation events carry
/// a success flag stating whether the store actually changed.
pub trait MaterializationMonitor: Send + Sync {
    fn task_started(&self, _max_component_level: usize) {}

    fn task_finished(&self) {}

    /// `None` marks the single pseudo-level of a no-levels run.
    fn component_level_started(&self, _component_level: Option<usize>) {}

    fn component_level_finished(&self, _component_level: Option<usize>) {}

    fn current_tuple_extracted(&self, _worker_index: usize, _tuple: &Tuple) {}

    fn current_tuple_processed(&self, _worker_index: usize) {}

    fn pivotless_rule_evaluation_started(&self, _worker_index: usize, _rule: &Rule) {}

    fn pivotless_rule_evaluation_finished(&self, _worker_index: usize) {}

    fn rule_matched_started(&self, _worker_index: usize, _rule: &Rule) {}

    fn rule_matched_finished(&self, _worker_index: usize) {}

    fn tuple_derived(&self, _worker_index: usize, _tuple: &Tuple, _was_added: bool) {}
}

/// Lifecycle events of an incremental maintenance run; a superset of the
/// materialization events covering deletion propagation, provability
/// checking, saturation, insertion, and change propagation.
pub trait IncrementalMonitor: MaterializationMonitor {
    fn deleted_rule_evaluation_started(&self, _worker_index: usize, _rule: &Rule) {}

    fn deleted_rule_evaluation_finished(&self, _worker_index: usize) {}

    fn added_rule_evaluation_started(&self, _worker_index: usize, _rule: &Rule) {}

    fn added_rule_evaluation_finished(&self, _worker_index: usize) {}

    fn tuple_deletion_previous_levels_started(&self, _worker_index: usize) {}

    fn tuple_deletion_recursive_started(&self, _worker_index: usize) {}

    fn tuple_deletion_finished(&self, _worker_index: usize) {}

    fn possibly_deleted_tuple_extracted(&self, _worker_index: usize, _tuple: &Tuple) {}

    fn possibly_deleted_tuple_processed(&self, _worker_index: usize, _proved: bool) {}

    fn deletion_propagation_started(
        &self,
        _worker_index: usize,
        _tuple: &Tuple,
        _from_previous_level: bool,
    ) {
    }

    fn deletion_propagation_finished(&self, _worker_index: usize) {}

    fn checking_provability_started(&self, _worker_index: usize, _tuple: &Tuple) {}

    fn checking_provability_finished(&self, _worker_index: usize) {}

    fn backward_nonrecursive_rule_started(&self, _worker_index: usize, _rule: &Rule) {}

    fn backward_nonrecursive_rule_finished(&self, _worker_index: usize) {}

    fn backward_recursive_rule_started(&self, _worker_index: usize, _rule: &Rule) {}

    fn backward_recursive_rule_finished(&self, _worker_index: usize) {}

    fn checked_tuple_proved(&self, _worker_index: usize, _tuple: &Tuple, _from_edb: bool) {}

    fn checked_tuple_disproved(&self, _worker_index: usize, _tuple: &Tuple) {}

    fn insertion_previous_levels_started(&self, _worker_index: usize) {}

    fn insertion_recursive_started(&self, _worker_index: usize) {}

    fn inserted_tuple_added_to_idb(&self, _worker_index: usize, _tuple: &Tuple, _was_added: bool) {}

    fn insertion_finished(&self, _worker_index: usize) {}

    fn propagate_deleted_proved_started(&self, _worker_index: usize, _component_level: Option<usize>) {
    }

    fn propagate_deleted_proved_finished(&self, _worker_index: usize) {}

    fn tuple_deleted(&self, _worker_index: usize, _tuple: &Tuple, _was_deleted: bool) {}

    fn tuple_added(&self, _worker_index: usize, _tuple: &Tuple, _was_added: bool) {}

    fn update_equality_manager_started(&self, _worker_index: usize) {}

    fn update_equality_manager_finished(&self, _worker_index: usize) {}
}

/// View of an incremental monitor through the materialization interface,
/// used where the rule index expects the narrower contract.
pub(crate) struct MaterializationView<'a>(pub(crate) &'a dyn IncrementalMonitor);

impl MaterializationMonitor for MaterializationView<'_> {
    fn task_started(&self, max_component_level: usize) {
        self.0.task_started(max_component_level)
    }

    fn task_finished(&self) {
        self.0.task_finished()
    }

    fn component_level_started(&self, component_level: Option<usize>) {
        self.0.component_level_started(component_level)
    }

    fn component_level_finished(&self, component_level: Option<usize>) {
        self.0.component_level_finished(component_level)
    }

    fn current_tuple_extracted(&self, worker_index: usize, tuple: &Tuple) {
        self.0.current_tuple_extracted(worker_index, tuple)
    }

    fn current_tuple_processed(&self, worker_index: usize) {
        self.0.current_tuple_processed(worker_index)
    }

    fn pivotless_rule_evaluation_started(&self, worker_index: usize, rule: &Rule) {
        self.0.pivotless_rule_evaluation_started(worker_index, rule)
    }

    fn pivotless_rule_evaluation_finished(&self, worker_index: usize) {
        self.0.pivotless_rule_evaluation_finished(worker_index)
    }

    fn rule_matched_started(&self, worker_index: usize, rule: &Rule) {
        self.0.rule_matched_started(worker_index, rule)
    }

    fn rule_matched_finished(&self, worker_index: usize) {
        self.0.rule_matched_finished(worker_index)
    }

    fn tuple_derived(&self, worker_index: usize, tuple: &Tuple, was_added: bool) {
        self.0.tuple_derived(worker_index, tuple, was_added)
    }
}

/// Monitor that observes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl MaterializationMonitor for NoopMonitor {}

impl IncrementalMonitor for NoopMonitor {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_monitor_is_a_legal_monitor() {
        let monitor: &dyn IncrementalMonitor = &NoopMonitor;
        monitor.task_started(3);
        monitor.tuple_derived(0, &[Default::default(); 3], true);
        monitor.task_finished();
    }
}
