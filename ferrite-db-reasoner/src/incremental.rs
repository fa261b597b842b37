//! Incremental maintenance: delete-and-rederive with a backward-chaining
//! provability check, strictly ordered by component level.
//!
//! One run per update batch:
//!
//! 1. Rules staged for removal are evaluated once more so their
//!    consequences seed the over-deletion lists, then dropped.
//! 2. The scheduled EDB changes initialize the per-level deleted/added
//!    lists.
//! 3. Per level: over-deletion propagates through the rules; every
//!    possibly-deleted tuple is then checked for an alternative proof
//!    (EDB status, or a rule instance whose body holds among surviving
//!    facts, bounded by the tuple's own level); proved tuples re-enter
//!    through the added list, which the insertion phase saturates by
//!    forward application.
//! 4. Accumulated changes are flushed into the store's status bits.
//! 5. Rules staged for addition are activated and the level loop repeats
//!    with their consequences.
//!
//! A level fully completes before the next starts; this ordering is what
//! makes the result equal to re-materializing from scratch.

use crate::engine::{DatalogEngine, WorkerPhase};
use crate::error::{ReasonerError, Result};
use crate::materialize::{is_idb, not_stratified_error};
use crate::monitor::{IncrementalMonitor, MaterializationView};
use crate::rule_index::{
    ComponentLevelFilter, HeadAtomInfo, RuleId, RuleIndex, ThreadContext, TupleFilters,
};
use crate::state::{
    IncrementalReasoningState, WorkQueue, GF_ADDED, GF_ADDED_MERGED, GF_ADDED_NEW, GF_DELETED,
    GF_DELETED_NEW,
};
use ferrite_db_core::{
    Tuple, TupleIndex, TupleStatus, TupleStore, TUPLE_STATUS_EDB, TUPLE_STATUS_EDB_DEL,
    TUPLE_STATUS_EDB_INS, TUPLE_STATUS_IDB, TUPLE_STATUS_IDB_MERGED,
};

pub(crate) fn run<S: TupleStore>(
    engine: &DatalogEngine<S>,
    monitor: &dyn IncrementalMonitor,
) -> Result<()> {
    let mut state = IncrementalReasoningState::new();
    let deleted_rules;
    {
        let mut index = engine.rule_index().write();
        index.update_components();
    }
    {
        let index = engine.rule_index().read();
        engine.prepare_workers(&index);
        if !index.is_stratified() {
            return Err(not_stratified_error(&index));
        }
        if index.has_rules_with_aggregation(None) {
            return Err(ReasonerError::unsupported(
                "incremental reasoning over rules with aggregation",
            ));
        }
        monitor.task_started(index.max_component_level());
        state.initialize_global(index.max_component_level());
        deleted_rules = index.just_deleted_rule_ids();
        if !deleted_rules.is_empty() {
            evaluate_deleted_rules(engine, &index, &state, &deleted_rules, monitor)?;
        }
    }
    if !deleted_rules.is_empty() {
        engine.rule_index().write().propagate_deletions();
    }
    let added_rules;
    {
        let index = engine.rule_index().read();
        initialize_deleted(engine, &index, &state)?;
        initialize_inserted(engine, &index, &state)?;
        for component_level in 0..=state.max_component_level() {
            apply_to_level(engine, &index, &state, component_level, None, monitor)?;
        }
        propagate_changes(engine, &state, monitor)?;
        added_rules = index.just_added_rule_ids();
    }
    if added_rules.is_empty() {
        // Rule deletions may still have changed the dependency graph.
        engine.rule_index().write().propagate_insertions();
    } else {
        engine.rule_index().write().propagate_insertions();
        let index = engine.rule_index().read();
        engine.prepare_workers(&index);
        if !index.is_stratified() {
            return Err(not_stratified_error(&index));
        }
        state.initialize_global(index.max_component_level());
        for component_level in 0..=state.max_component_level() {
            apply_to_level(
                engine,
                &index,
                &state,
                component_level,
                Some(&added_rules),
                monitor,
            )?;
        }
        propagate_changes(engine, &state, monitor)?;
    }
    engine.store().clear_scheduled();
    monitor.task_finished();
    Ok(())
}

/// Evaluate the rules staged for removal: everything they currently
/// derive becomes a candidate for over-deletion.
fn evaluate_deleted_rules<S: TupleStore>(
    engine: &DatalogEngine<S>,
    index: &RuleIndex,
    state: &IncrementalReasoningState,
    deleted_rules: &[RuleId],
    monitor: &dyn IncrementalMonitor,
) -> Result<()> {
    let store: &dyn TupleStore = engine.store();
    let queue: WorkQueue<RuleId> = WorkQueue::new();
    for &rule_id in deleted_rules {
        queue.enqueue(rule_id);
    }
    let view = MaterializationView(monitor);
    engine.run_workers(|worker_index, context| {
        let filter = |_: TupleIndex, status: TupleStatus| is_idb(status);
        let filters = TupleFilters::uniform(&filter);
        while let Some(rule_id) = queue.dequeue() {
            monitor.deleted_rule_evaluation_started(worker_index, index.rule(rule_id).rule());
            let mut consumer = |_: &HeadAtomInfo, tuple: Tuple| {
                let Some(tuple_index) = store.tuple_index(&tuple) else {
                    return Err(ReasonerError::data_mismatch(format!(
                        "derived tuple {tuple:?} is not stored"
                    )));
                };
                if state.add_global_flags(tuple_index, GF_DELETED_NEW) {
                    let component_level = index.component_level(&tuple);
                    state.initially_deleted(component_level).enqueue(tuple_index);
                    monitor.tuple_derived(worker_index, &tuple, true);
                } else {
                    monitor.tuple_derived(worker_index, &tuple, false);
                }
                Ok(())
            };
            index.evaluate_rule(
                context,
                store,
                rule_id,
                None,
                &filters,
                &view,
                worker_index,
                &mut consumer,
            )?;
            monitor.deleted_rule_evaluation_finished(worker_index);
        }
        Ok(())
    })
}

/// Drain the store's scheduled deletions into the per-level lists.
fn initialize_deleted<S: TupleStore>(
    engine: &DatalogEngine<S>,
    index: &RuleIndex,
    state: &IncrementalReasoningState,
) -> Result<()> {
    let store: &dyn TupleStore = engine.store();
    let queue: WorkQueue<TupleIndex> = WorkQueue::new();
    for tuple_index in store.scheduled_deletions() {
        queue.enqueue(tuple_index);
    }
    engine.run_workers(|_worker_index, _context| {
        while let Some(tuple_index) = queue.dequeue() {
            let status = store.tuple_status(tuple_index);
            if status & TUPLE_STATUS_EDB_DEL == 0 {
                continue;
            }
            store.update_status(tuple_index, 0, 0, TUPLE_STATUS_EDB_DEL | TUPLE_STATUS_EDB, 0);
            if status & TUPLE_STATUS_EDB != 0
                && state.add_global_flags(tuple_index, GF_DELETED_NEW)
            {
                let tuple = store.tuple(tuple_index);
                let component_level = index.component_level(&tuple);
                state.initially_deleted(component_level).enqueue(tuple_index);
            }
        }
        Ok(())
    })
}

/// Drain the store's scheduled insertions into the per-level lists.
fn initialize_inserted<S: TupleStore>(
    engine: &DatalogEngine<S>,
    index: &RuleIndex,
    state: &IncrementalReasoningState,
) -> Result<()> {
    let store: &dyn TupleStore = engine.store();
    let queue: WorkQueue<TupleIndex> = WorkQueue::new();
    for tuple_index in store.scheduled_insertions() {
        queue.enqueue(tuple_index);
    }
    engine.run_workers(|_worker_index, _context| {
        while let Some(tuple_index) = queue.dequeue() {
            let status = store.tuple_status(tuple_index);
            if status & TUPLE_STATUS_EDB_INS == 0 {
                continue;
            }
            store.update_status(tuple_index, 0, 0, TUPLE_STATUS_EDB_INS, TUPLE_STATUS_EDB);
            if status & TUPLE_STATUS_IDB == 0 && state.add_global_flags(tuple_index, GF_ADDED_NEW)
            {
                let tuple = store.tuple(tuple_index);
                let component_level = index.component_level(&tuple);
                state.initially_added(component_level).enqueue(tuple_index);
            }
        }
        Ok(())
    })
}

fn apply_to_level<S: TupleStore>(
    engine: &DatalogEngine<S>,
    index: &RuleIndex,
    state: &IncrementalReasoningState,
    component_level: usize,
    inserted_rules: Option<&[RuleId]>,
    monitor: &dyn IncrementalMonitor,
) -> Result<()> {
    tracing::debug!(component_level, "incremental maintenance of component level");
    monitor.component_level_started(Some(component_level));
    if let Some(rules) = inserted_rules {
        evaluate_inserted_rules(engine, index, state, rules, component_level, monitor)?;
    }
    deletion_task(engine, index, state, component_level, monitor)?;
    if engine.equality().has_merges() {
        monitor.update_equality_manager_started(0);
        engine.equality().begin_generation();
        monitor.update_equality_manager_finished(0);
    }
    rederivation_task(engine, index, state, component_level, monitor)?;
    insertion_task(engine, index, state, component_level, monitor)?;
    state.record_level_ends(component_level);
    monitor.component_level_finished(Some(component_level));
    Ok(())
}

/// Evaluate rules staged for addition against the already-propagated
/// store; their conclusions at this level feed the insertion phase.
fn evaluate_inserted_rules<S: TupleStore>(
    engine: &DatalogEngine<S>,
    index: &RuleIndex,
    state: &IncrementalReasoningState,
    inserted_rules: &[RuleId],
    component_level: usize,
    monitor: &dyn IncrementalMonitor,
) -> Result<()> {
    let store: &dyn TupleStore = engine.store();
    let queue: WorkQueue<RuleId> = WorkQueue::new();
    for &rule_id in inserted_rules {
        queue.enqueue(rule_id);
    }
    let view = MaterializationView(monitor);
    engine.run_workers(|worker_index, context| {
        let in_ida = |tuple_index: TupleIndex, status: TupleStatus| {
            in_ida_filter(state, tuple_index, status)
        };
        let filters = TupleFilters::uniform(&in_ida);
        while let Some(rule_id) = queue.dequeue() {
            if !index.rule(rule_id).in_level_filter(component_level) {
                continue;
            }
            monitor.added_rule_evaluation_started(worker_index, index.rule(rule_id).rule());
            let mut consumer = |_: &HeadAtomInfo, tuple: Tuple| {
                derive_insertion(store, state, monitor, worker_index, tuple)
            };
            index.evaluate_rule(
                context,
                store,
                rule_id,
                Some(component_level),
                &filters,
                &view,
                worker_index,
                &mut consumer,
            )?;
            monitor.added_rule_evaluation_finished(worker_index);
        }
        Ok(())
    })
}

/// (I \ D) + A: the fact set evaluation converges towards.
fn in_ida_filter(
    state: &IncrementalReasoningState,
    tuple_index: TupleIndex,
    status: TupleStatus,
) -> bool {
    let flags = state.global_flags(tuple_index);
    (is_idb(status) && flags & (GF_DELETED | GF_ADDED_MERGED) == 0)
        || flags & (GF_ADDED | GF_ADDED_MERGED) == GF_ADDED
}

/// Over-deletion: rules fire against tuples deleted (positive pivots) or
/// added (negation pivots) at previous levels, then the recursive phase
/// propagates from each possibly-deleted tuple of this level.
fn deletion_task<S: TupleStore>(
    engine: &DatalogEngine<S>,
    index: &RuleIndex,
    state: &IncrementalReasoningState,
    component_level: usize,
    monitor: &dyn IncrementalMonitor,
) -> Result<()> {
    let store: &dyn TupleStore = engine.store();
    state
        .delete_list()
        .append_from(state.initially_deleted(component_level));
    let previous_end = if component_level == 0 {
        0
    } else {
        state.delete_list_end(component_level - 1)
    };
    state.delete_list().reset_dequeue_position(0);
    state.added_list().reset_dequeue_position(0);
    let phase = WorkerPhase::new(engine.thread_count());
    let view = MaterializationView(monitor);
    engine.run_workers(|worker_index, context| {
        monitor.tuple_deletion_previous_levels_started(worker_index);
        if component_level > 0 && index.has_rules(Some(component_level)) {
            previous_level_deletions_positive(
                store,
                index,
                state,
                component_level,
                previous_end,
                &view,
                monitor,
                worker_index,
                context,
            )?;
            if index.has_rules_with_negation(Some(component_level)) {
                previous_level_deletions_negative(
                    store,
                    index,
                    state,
                    component_level,
                    &view,
                    monitor,
                    worker_index,
                    context,
                )?;
            }
        }
        monitor.tuple_deletion_recursive_started(worker_index);
        let has_work = || state.delete_list().has_pending();
        let mut do_work = || -> Result<bool> {
            let Some(tuple_index) = state.delete_list().dequeue() else {
                return Ok(false);
            };
            if state.global_flags(tuple_index) & (GF_DELETED | GF_DELETED_NEW) != GF_DELETED_NEW {
                return Ok(true);
            }
            let tuple = store.tuple(tuple_index);
            monitor.possibly_deleted_tuple_extracted(worker_index, &tuple);
            monitor.deletion_propagation_started(worker_index, &tuple, false);
            let positive_before = |candidate: TupleIndex, status: TupleStatus| {
                candidate != tuple_index
                    && is_idb(status)
                    && state.global_flags(candidate) & (GF_DELETED | GF_ADDED) != GF_DELETED
            };
            let positive_after = |candidate: TupleIndex, status: TupleStatus| {
                is_idb(status)
                    && state.global_flags(candidate) & (GF_DELETED | GF_ADDED) != GF_DELETED
            };
            let negative = |candidate: TupleIndex, status: TupleStatus| {
                is_idb(status)
                    || state.global_flags(candidate) & (GF_ADDED | GF_ADDED_MERGED) == GF_ADDED
            };
            let filters = TupleFilters {
                positive_before_pivot: &positive_before,
                positive_after_pivot: &positive_after,
                negative: &negative,
                underlying_before_pivot: &positive_before,
                underlying_after_pivot: &positive_after,
            };
            let mut consumer = |_: &HeadAtomInfo, derived: Tuple| {
                derive_deletion(store, state, monitor, worker_index, derived)
            };
            index.apply_rules_to_positive_literal_main(
                context,
                store,
                &tuple,
                Some(component_level),
                ComponentLevelFilter::AllInComponent,
                &filters,
                &view,
                worker_index,
                &mut consumer,
            )?;
            state.add_global_flags(tuple_index, GF_DELETED);
            monitor.deletion_propagation_finished(worker_index);
            monitor.possibly_deleted_tuple_processed(worker_index, false);
            Ok(true)
        };
        let result = phase.drive(has_work, &mut do_work);
        monitor.tuple_deletion_finished(worker_index);
        result
    })
}

#[allow(clippy::too_many_arguments)]
fn previous_level_deletions_positive(
    store: &dyn TupleStore,
    index: &RuleIndex,
    state: &IncrementalReasoningState,
    component_level: usize,
    previous_end: usize,
    view: &MaterializationView<'_>,
    monitor: &dyn IncrementalMonitor,
    worker_index: usize,
    context: &mut ThreadContext,
) -> Result<()> {
    let positive_before = |candidate: TupleIndex, status: TupleStatus| {
        is_idb(status) && state.global_flags(candidate) & (GF_DELETED | GF_ADDED) != GF_DELETED
    };
    let positive_after = |_: TupleIndex, status: TupleStatus| is_idb(status);
    let negative = |_: TupleIndex, status: TupleStatus| is_idb(status);
    let filters = TupleFilters {
        positive_before_pivot: &positive_before,
        positive_after_pivot: &positive_after,
        negative: &negative,
        underlying_before_pivot: &positive_before,
        underlying_after_pivot: &positive_after,
    };
    while let Some(tuple_index) = state.delete_list().dequeue_up_to(previous_end) {
        if state.global_flags(tuple_index) & (GF_DELETED | GF_ADDED) != GF_DELETED {
            continue;
        }
        let tuple = store.tuple(tuple_index);
        monitor.deletion_propagation_started(worker_index, &tuple, true);
        let mut consumer = |_: &HeadAtomInfo, derived: Tuple| {
            derive_deletion(store, state, monitor, worker_index, derived)
        };
        index.apply_rules_to_positive_literal_main(
            context,
            store,
            &tuple,
            Some(component_level),
            ComponentLevelFilter::AllInComponent,
            &filters,
            view,
            worker_index,
            &mut consumer,
        )?;
        monitor.deletion_propagation_finished(worker_index);
    }
    Ok(())
}

/// Tuples added at previous levels can turn a negation false; rules at
/// this level whose negation covers them over-delete their conclusions.
#[allow(clippy::too_many_arguments)]
fn previous_level_deletions_negative(
    store: &dyn TupleStore,
    index: &RuleIndex,
    state: &IncrementalReasoningState,
    component_level: usize,
    view: &MaterializationView<'_>,
    monitor: &dyn IncrementalMonitor,
    worker_index: usize,
    context: &mut ThreadContext,
) -> Result<()> {
    let positive_before = |candidate: TupleIndex, status: TupleStatus| {
        is_idb(status) && state.global_flags(candidate) & (GF_DELETED | GF_ADDED) != GF_DELETED
    };
    // The negation check runs against the old fact set: the body must
    // have held before this addition for there to be anything to delete.
    let negative = |_: TupleIndex, status: TupleStatus| is_idb(status);
    let underlying_before = |candidate: TupleIndex, status: TupleStatus| {
        is_idb(status) && state.global_flags(candidate) & (GF_DELETED | GF_ADDED) != GF_DELETED
    };
    let underlying_after = |candidate: TupleIndex, status: TupleStatus| {
        let flags = state.global_flags(candidate);
        (is_idb(status) && flags & (GF_DELETED | GF_ADDED_MERGED) == 0)
            || flags & (GF_ADDED | GF_ADDED_MERGED) == GF_ADDED
    };
    let filters = TupleFilters {
        positive_before_pivot: &positive_before,
        positive_after_pivot: &positive_before,
        negative: &negative,
        underlying_before_pivot: &underlying_before,
        underlying_after_pivot: &underlying_after,
    };
    while let Some(tuple_index) = state.added_list().dequeue() {
        if state.global_flags(tuple_index) & (GF_DELETED | GF_ADDED) != GF_ADDED {
            continue;
        }
        let tuple = store.tuple(tuple_index);
        monitor.deletion_propagation_started(worker_index, &tuple, true);
        let mut consumer = |_: &HeadAtomInfo, derived: Tuple| {
            derive_deletion(store, state, monitor, worker_index, derived)
        };
        index.apply_rules_to_underlying_negation_literal_main(
            context,
            store,
            &tuple,
            Some(component_level),
            ComponentLevelFilter::AllInComponent,
            &filters,
            view,
            worker_index,
            &mut consumer,
        )?;
        monitor.deletion_propagation_finished(worker_index);
    }
    Ok(())
}

fn derive_deletion(
    store: &dyn TupleStore,
    state: &IncrementalReasoningState,
    monitor: &dyn IncrementalMonitor,
    worker_index: usize,
    tuple: Tuple,
) -> Result<()> {
    let Some(tuple_index) = store.tuple_index(&tuple) else {
        return Err(ReasonerError::data_mismatch(format!(
            "derived tuple {tuple:?} is not stored"
        )));
    };
    if state.add_global_flags(tuple_index, GF_DELETED_NEW) {
        state.delete_list().enqueue(tuple_index);
        monitor.tuple_derived(worker_index, &tuple, true);
    } else {
        monitor.tuple_derived(worker_index, &tuple, false);
    }
    Ok(())
}

fn derive_insertion(
    store: &dyn TupleStore,
    state: &IncrementalReasoningState,
    monitor: &dyn IncrementalMonitor,
    worker_index: usize,
    tuple: Tuple,
) -> Result<()> {
    let (_, tuple_index) = store.add_tuple(tuple, 0, 0)?;
    if state.add_global_flags(tuple_index, GF_ADDED_NEW) {
        state.added_list().enqueue(tuple_index);
        monitor.tuple_derived(worker_index, &tuple, true);
    } else {
        monitor.tuple_derived(worker_index, &tuple, false);
    }
    Ok(())
}

/// Backward chaining over this level's possibly-deleted tuples: a tuple
/// survives if it is EDB or some rule instance still supports it among
/// surviving facts. Proofs never use facts over-deleted at this level
/// and not re-added, which bounds the search to settled material.
fn rederivation_task<S: TupleStore>(
    engine: &DatalogEngine<S>,
    index: &RuleIndex,
    state: &IncrementalReasoningState,
    component_level: usize,
    monitor: &dyn IncrementalMonitor,
) -> Result<()> {
    let store: &dyn TupleStore = engine.store();
    let start = if component_level == 0 {
        0
    } else {
        state.delete_list_end(component_level - 1)
    };
    state.delete_list().reset_dequeue_position(start);
    engine.run_workers(|worker_index, _context| {
        let supporting_positive = |candidate: TupleIndex, status: TupleStatus| {
            is_idb(status) && state.global_flags(candidate) & (GF_DELETED | GF_ADDED) != GF_DELETED
        };
        let supporting_negative = |candidate: TupleIndex, status: TupleStatus| {
            is_idb(status)
                || state.global_flags(candidate) & (GF_ADDED | GF_ADDED_MERGED) == GF_ADDED
        };
        let filters = TupleFilters {
            positive_before_pivot: &supporting_positive,
            positive_after_pivot: &supporting_positive,
            negative: &supporting_negative,
            underlying_before_pivot: &supporting_positive,
            underlying_after_pivot: &supporting_positive,
        };
        while let Some(tuple_index) = state.delete_list().dequeue() {
            let tuple = store.tuple(tuple_index);
            monitor.checking_provability_started(worker_index, &tuple);
            let from_edb = store.tuple_status(tuple_index) & TUPLE_STATUS_EDB != 0;
            let proved = from_edb
                || is_rederivable(
                    index,
                    store,
                    &tuple,
                    component_level,
                    &filters,
                    monitor,
                    worker_index,
                );
            if proved {
                if state.add_global_flags(tuple_index, GF_ADDED_NEW) {
                    state.added_list().enqueue(tuple_index);
                }
                monitor.checked_tuple_proved(worker_index, &tuple, from_edb);
            } else {
                // Disproof needs no flag of its own: the tuple stays
                // deleted unless something re-adds it later.
                monitor.checked_tuple_disproved(worker_index, &tuple);
            }
            monitor.checking_provability_finished(worker_index);
        }
        Ok(())
    })
}

#[allow(clippy::too_many_arguments)]
fn is_rederivable(
    index: &RuleIndex,
    store: &dyn TupleStore,
    tuple: &Tuple,
    component_level: usize,
    filters: &TupleFilters<'_>,
    monitor: &dyn IncrementalMonitor,
    worker_index: usize,
) -> bool {
    for head_id in index.matching_head_atom_infos(tuple) {
        let head = index.head_atom(head_id);
        // Never chase support through a level above the tuple's own.
        if head.component_level() > component_level {
            continue;
        }
        let rule = index.rule(head.rule_id()).rule();
        let recursive = head.is_recursive();
        if recursive {
            monitor.backward_recursive_rule_started(worker_index, rule);
        } else {
            monitor.backward_nonrecursive_rule_started(worker_index, rule);
        }
        let mut arguments = Vec::new();
        let supported = index.bind_head_atom(head_id, tuple, &mut arguments)
            && index.exists_body_match(store, head.rule_id(), &mut arguments, filters);
        if recursive {
            monitor.backward_recursive_rule_finished(worker_index);
        } else {
            monitor.backward_nonrecursive_rule_finished(worker_index);
        }
        if supported {
            return true;
        }
    }
    false
}

/// Insertion: rules fire forward from tuples inserted or re-proved,
/// previous levels first, then saturating this level's additions.
fn insertion_task<S: TupleStore>(
    engine: &DatalogEngine<S>,
    index: &RuleIndex,
    state: &IncrementalReasoningState,
    component_level: usize,
    monitor: &dyn IncrementalMonitor,
) -> Result<()> {
    let store: &dyn TupleStore = engine.store();
    state
        .added_list()
        .append_from(state.initially_added(component_level));
    let previous_end = if component_level == 0 {
        0
    } else {
        state.added_list_end(component_level - 1)
    };
    state.added_list().reset_dequeue_position(0);
    if index.has_rules_with_negation(Some(component_level)) {
        state.delete_list().reset_dequeue_position(0);
    }
    let phase = WorkerPhase::new(engine.thread_count());
    let view = MaterializationView(monitor);
    engine.run_workers(|worker_index, context| {
        monitor.insertion_previous_levels_started(worker_index);
        if component_level > 0 && index.has_rules(Some(component_level)) {
            previous_level_insertions_positive(
                store,
                index,
                state,
                component_level,
                previous_end,
                &view,
                monitor,
                worker_index,
                context,
            )?;
            if index.has_rules_with_negation(Some(component_level)) {
                previous_level_insertions_negative(
                    store,
                    index,
                    state,
                    component_level,
                    &view,
                    monitor,
                    worker_index,
                    context,
                )?;
            }
        }
        monitor.insertion_recursive_started(worker_index);
        let has_work = || state.added_list().has_pending();
        let mut do_work = || -> Result<bool> {
            let Some(tuple_index) = state.added_list().dequeue() else {
                return Ok(false);
            };
            if state.global_flags(tuple_index) & GF_ADDED != 0 {
                return Ok(true);
            }
            let tuple = store.tuple(tuple_index);
            monitor.current_tuple_extracted(worker_index, &tuple);
            let positive_before = |candidate: TupleIndex, status: TupleStatus| {
                candidate != tuple_index && in_ida_filter(state, candidate, status)
            };
            let positive_after = |candidate: TupleIndex, status: TupleStatus| {
                in_ida_filter(state, candidate, status)
            };
            let filters = TupleFilters {
                positive_before_pivot: &positive_before,
                positive_after_pivot: &positive_after,
                negative: &positive_after,
                underlying_before_pivot: &positive_before,
                underlying_after_pivot: &positive_after,
            };
            let mut consumer = |_: &HeadAtomInfo, derived: Tuple| {
                derive_insertion(store, state, monitor, worker_index, derived)
            };
            index.apply_rules_to_positive_literal_main(
                context,
                store,
                &tuple,
                Some(component_level),
                ComponentLevelFilter::AllInComponent,
                &filters,
                &view,
                worker_index,
                &mut consumer,
            )?;
            state.add_global_flags(tuple_index, GF_ADDED);
            monitor.inserted_tuple_added_to_idb(worker_index, &tuple, true);
            monitor.current_tuple_processed(worker_index);
            Ok(true)
        };
        let result = phase.drive(has_work, &mut do_work);
        monitor.insertion_finished(worker_index);
        result
    })
}

#[allow(clippy::too_many_arguments)]
fn previous_level_insertions_positive(
    store: &dyn TupleStore,
    index: &RuleIndex,
    state: &IncrementalReasoningState,
    component_level: usize,
    previous_end: usize,
    view: &MaterializationView<'_>,
    monitor: &dyn IncrementalMonitor,
    worker_index: usize,
    context: &mut ThreadContext,
) -> Result<()> {
    let positive_before = |candidate: TupleIndex, status: TupleStatus| {
        is_idb(status) && state.global_flags(candidate) & (GF_DELETED | GF_ADDED) != GF_DELETED
    };
    let in_ida =
        |candidate: TupleIndex, status: TupleStatus| in_ida_filter(state, candidate, status);
    let filters = TupleFilters {
        positive_before_pivot: &positive_before,
        positive_after_pivot: &in_ida,
        negative: &in_ida,
        underlying_before_pivot: &positive_before,
        underlying_after_pivot: &in_ida,
    };
    while let Some(tuple_index) = state.added_list().dequeue_up_to(previous_end) {
        if state.global_flags(tuple_index) & (GF_ADDED | GF_ADDED_MERGED | GF_DELETED) != GF_ADDED
        {
            continue;
        }
        let tuple = store.tuple(tuple_index);
        monitor.current_tuple_extracted(worker_index, &tuple);
        let mut consumer = |_: &HeadAtomInfo, derived: Tuple| {
            derive_insertion(store, state, monitor, worker_index, derived)
        };
        index.apply_rules_to_positive_literal_main(
            context,
            store,
            &tuple,
            Some(component_level),
            ComponentLevelFilter::AllInComponent,
            &filters,
            view,
            worker_index,
            &mut consumer,
        )?;
        monitor.current_tuple_processed(worker_index);
    }
    Ok(())
}

/// Tuples deleted at previous levels can turn a negation true; rules at
/// this level whose negation covers them derive new conclusions.
#[allow(clippy::too_many_arguments)]
fn previous_level_insertions_negative(
    store: &dyn TupleStore,
    index: &RuleIndex,
    state: &IncrementalReasoningState,
    component_level: usize,
    view: &MaterializationView<'_>,
    monitor: &dyn IncrementalMonitor,
    worker_index: usize,
    context: &mut ThreadContext,
) -> Result<()> {
    let positive_before = |candidate: TupleIndex, status: TupleStatus| {
        is_idb(status) && state.global_flags(candidate) & (GF_DELETED | GF_ADDED) != GF_DELETED
    };
    let in_ida =
        |candidate: TupleIndex, status: TupleStatus| in_ida_filter(state, candidate, status);
    // The deleted pivot instance held in the old fact set; the negation
    // itself is checked against the new one.
    let underlying_before = positive_before;
    let underlying_after = |_: TupleIndex, status: TupleStatus| is_idb(status);
    let filters = TupleFilters {
        positive_before_pivot: &positive_before,
        positive_after_pivot: &in_ida,
        negative: &in_ida,
        underlying_before_pivot: &underlying_before,
        underlying_after_pivot: &underlying_after,
    };
    while let Some(tuple_index) = state.delete_list().dequeue() {
        if state.global_flags(tuple_index) & (GF_ADDED | GF_ADDED_MERGED | GF_DELETED)
            != GF_DELETED
        {
            continue;
        }
        let tuple = store.tuple(tuple_index);
        monitor.current_tuple_extracted(worker_index, &tuple);
        let mut consumer = |_: &HeadAtomInfo, derived: Tuple| {
            derive_insertion(store, state, monitor, worker_index, derived)
        };
        index.apply_rules_to_underlying_negation_literal_main(
            context,
            store,
            &tuple,
            Some(component_level),
            ComponentLevelFilter::AllInComponent,
            &filters,
            view,
            worker_index,
            &mut consumer,
        )?;
        monitor.current_tuple_processed(worker_index);
    }
    Ok(())
}

/// Flush the run's accumulated flags into the store's status bits,
/// level window by level window.
fn propagate_changes<S: TupleStore>(
    engine: &DatalogEngine<S>,
    state: &IncrementalReasoningState,
    monitor: &dyn IncrementalMonitor,
) -> Result<()> {
    let store: &dyn TupleStore = engine.store();
    state.delete_list().reset_dequeue_position(0);
    state.added_list().reset_dequeue_position(0);
    engine.run_workers(|worker_index, _context| {
        for component_level in 0..=state.max_component_level() {
            monitor.propagate_deleted_proved_started(worker_index, Some(component_level));
            let delete_end = state.delete_list_end(component_level);
            while let Some(tuple_index) = state.delete_list().dequeue_up_to(delete_end) {
                if state.global_flags(tuple_index) & (GF_DELETED | GF_ADDED) == GF_DELETED {
                    let was_deleted = store.update_status(
                        tuple_index,
                        0,
                        0,
                        TUPLE_STATUS_IDB | TUPLE_STATUS_IDB_MERGED,
                        0,
                    );
                    let tuple = store.tuple(tuple_index);
                    monitor.tuple_deleted(worker_index, &tuple, was_deleted);
                }
            }
            let added_end = state.added_list_end(component_level);
            while let Some(tuple_index) = state.added_list().dequeue_up_to(added_end) {
                if state.global_flags(tuple_index) & (GF_DELETED | GF_ADDED | GF_ADDED_MERGED)
                    == GF_ADDED
                {
                    let was_added = store.update_status(
                        tuple_index,
                        0,
                        0,
                        TUPLE_STATUS_IDB_MERGED,
                        TUPLE_STATUS_IDB,
                    );
                    let tuple = store.tuple(tuple_index);
                    monitor.tuple_added(worker_index, &tuple, was_added);
                }
            }
            monitor.propagate_deleted_proved_finished(worker_index);
        }
        Ok(())
    })
}
