//! Full seminaive materialization by component levels.
//!
//! Every level is one task over the worker pool: workers claim tuples
//! from the store in insertion order through a shared cursor, apply the
//! plans whose pivot is evaluated at the level, and append derivations
//! back to the store, where they become claimable in turn. Pivotless
//! rules are drained from a rule queue before tuple extraction. A level
//! completes only when every worker is idle and nothing claimable
//! remains; the next level starts after the pool joins.

use crate::engine::{DatalogEngine, WorkerPhase};
use crate::error::{ReasonerError, Result};
use crate::monitor::MaterializationMonitor;
use crate::rule_index::{
    ComponentLevelFilter, HeadAtomInfo, RuleIndex, TupleFilters,
};
use crate::state::WorkQueue;
use ferrite_db_core::{
    Tuple, TupleIndex, TupleStatus, TupleStore, TUPLE_STATUS_IDB, TUPLE_STATUS_IDB_MERGED,
};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Whether a tuple is part of the current materialization.
pub(crate) fn is_idb(status: TupleStatus) -> bool {
    status & (TUPLE_STATUS_IDB | TUPLE_STATUS_IDB_MERGED) == TUPLE_STATUS_IDB
}

pub(crate) fn not_stratified_error(index: &RuleIndex) -> ReasonerError {
    ReasonerError::NotStratified {
        rules: index
            .unstratified_rules()
            .iter()
            .map(|rule| rule.to_string())
            .collect(),
    }
}

/// Claim the next position below `limit` from a shared cursor.
pub(crate) fn claim(cursor: &AtomicUsize, limit: usize) -> Option<usize> {
    loop {
        let position = cursor.load(Ordering::Acquire);
        if position >= limit {
            return None;
        }
        if cursor
            .compare_exchange(position, position + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Some(position);
        }
    }
}

pub(crate) fn run<S: TupleStore>(
    engine: &DatalogEngine<S>,
    monitor: &dyn MaterializationMonitor,
) -> Result<()> {
    {
        let mut index = engine.rule_index().write();
        index.propagate_deletions();
        index.propagate_insertions();
    }
    let index = engine.rule_index().read();
    engine.prepare_workers(&index);
    if !index.is_stratified() {
        return Err(not_stratified_error(&index));
    }
    monitor.task_started(index.max_component_level());
    if let Some(first_level) = index.first_rule_component_level() {
        for component_level in first_level..=index.max_component_level() {
            tracing::debug!(component_level, "materializing component level");
            monitor.component_level_started(Some(component_level));
            run_level(engine, &index, component_level, monitor)?;
            monitor.component_level_finished(Some(component_level));
        }
    }
    monitor.task_finished();
    Ok(())
}

fn run_level<S: TupleStore>(
    engine: &DatalogEngine<S>,
    index: &RuleIndex,
    component_level: usize,
    monitor: &dyn MaterializationMonitor,
) -> Result<()> {
    let store: &dyn TupleStore = engine.store();
    let cursor = AtomicUsize::new(0);
    let pivotless: WorkQueue<_> = WorkQueue::new();
    for rule_id in index.pivotless_rule_ids_at(Some(component_level)) {
        pivotless.enqueue(rule_id);
    }
    let phase = WorkerPhase::new(engine.thread_count());
    engine.run_workers(|worker_index, context| {
        let filter = |_: TupleIndex, status: TupleStatus| is_idb(status);
        let filters = TupleFilters::uniform(&filter);
        let has_work =
            || pivotless.has_pending() || cursor.load(Ordering::Acquire) < store.tuple_count();
        let mut do_work = || -> Result<bool> {
            if let Some(rule_id) = pivotless.dequeue() {
                monitor.pivotless_rule_evaluation_started(worker_index, index.rule(rule_id).rule());
                let mut consumer = |_: &HeadAtomInfo, tuple: Tuple| {
                    let (was_added, _) = store.add_tuple(tuple, 0, TUPLE_STATUS_IDB)?;
                    monitor.tuple_derived(worker_index, &tuple, was_added);
                    Ok(())
                };
                index.evaluate_rule(
                    context,
                    store,
                    rule_id,
                    Some(component_level),
                    &filters,
                    monitor,
                    worker_index,
                    &mut consumer,
                )?;
                monitor.pivotless_rule_evaluation_finished(worker_index);
                return Ok(true);
            }
            let Some(position) = claim(&cursor, store.tuple_count()) else {
                return Ok(false);
            };
            let tuple_index = TupleIndex(position as u64);
            if is_idb(store.tuple_status(tuple_index)) {
                let tuple = store.tuple(tuple_index);
                monitor.current_tuple_extracted(worker_index, &tuple);
                let mut consumer = |_: &HeadAtomInfo, derived: Tuple| {
                    let (was_added, _) = store.add_tuple(derived, 0, TUPLE_STATUS_IDB)?;
                    monitor.tuple_derived(worker_index, &derived, was_added);
                    Ok(())
                };
                index.apply_rules_to_positive_literal_main(
                    context,
                    store,
                    &tuple,
                    Some(component_level),
                    ComponentLevelFilter::WithPivotInComponent,
                    &filters,
                    monitor,
                    worker_index,
                    &mut consumer,
                )?;
                monitor.current_tuple_processed(worker_index);
            }
            Ok(true)
        };
        phase.drive(has_work, &mut do_work)
    })
}
