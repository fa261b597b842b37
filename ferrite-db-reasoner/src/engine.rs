//! The datalog engine: worker pool, rule administration, and the entry
//! points for full and incremental materialization.
//!
//! Rule mutation and evaluation are temporally disjoint: mutation goes
//! through the rule index's write lock while no task runs, and tasks take
//! the read lock for their whole duration, so evaluation workers see a
//! frozen index and need no locking on the hot path.
//!
//! A task runs by handing the same closure to every worker thread;
//! [`DatalogEngine::run_workers`] joins them all before returning, which
//! is the barrier between phases and between component levels.

use crate::equality::{EqualityManager, IdentityEquality};
use crate::error::{ReasonerError, Result};
use crate::logic::{Rule, RuleRef};
use crate::monitor::{IncrementalMonitor, MaterializationMonitor};
use crate::rule_index::{RuleIndex, ThreadContext};
use crate::snapshot;
use ferrite_db_core::{Tuple, TupleStore};
use parking_lot::{Mutex, RwLock};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Termination protocol for one producer/consumer task phase: a worker
/// goes idle when it finds no work, and the phase ends once every worker
/// is idle and no claimable work remains.
pub(crate) struct WorkerPhase {
    idle: AtomicUsize,
    aborted: AtomicBool,
    workers: usize,
}

impl WorkerPhase {
    pub fn new(workers: usize) -> Self {
        WorkerPhase {
            idle: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            workers,
        }
    }

    /// Drive one worker: `do_work` claims and processes one unit,
    /// returning whether it found any; `has_work` probes without
    /// claiming. An error on any worker aborts the phase for all.
    pub fn drive(
        &self,
        has_work: impl Fn() -> bool,
        mut do_work: impl FnMut() -> Result<bool>,
    ) -> Result<()> {
        loop {
            match do_work() {
                Ok(true) => continue,
                Ok(false) => {}
                Err(error) => {
                    self.aborted.store(true, Ordering::SeqCst);
                    return Err(error);
                }
            }
            self.idle.fetch_add(1, Ordering::SeqCst);
            loop {
                if self.aborted.load(Ordering::SeqCst) {
                    return Ok(());
                }
                if has_work() {
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                    break;
                }
                if self.idle.load(Ordering::SeqCst) == self.workers && !has_work() {
                    return Ok(());
                }
                std::thread::yield_now();
            }
        }
    }
}

/// The materialization engine over a tuple store.
pub struct DatalogEngine<S: TupleStore> {
    store: Arc<S>,
    rule_index: RwLock<RuleIndex>,
    equality: Arc<dyn EqualityManager>,
    thread_count: usize,
    contexts: Vec<Mutex<ThreadContext>>,
}

impl<S: TupleStore> DatalogEngine<S> {
    /// Engine with the identity equality manager.
    pub fn new(store: Arc<S>) -> Self {
        DatalogEngine::with_equality(store, Arc::new(IdentityEquality))
    }

    pub fn with_equality(store: Arc<S>, equality: Arc<dyn EqualityManager>) -> Self {
        DatalogEngine {
            store,
            rule_index: RwLock::new(RuleIndex::new()),
            equality,
            thread_count: 1,
            contexts: vec![Mutex::new(ThreadContext::new())],
        }
    }

    /// Fix the worker-pool size and pre-allocate per-worker buffers.
    pub fn set_thread_count(&mut self, thread_count: usize) {
        let thread_count = thread_count.max(1);
        while self.contexts.len() < thread_count {
            self.contexts.push(Mutex::new(ThreadContext::new()));
        }
        self.contexts.truncate(thread_count);
        self.thread_count = thread_count;
        let index = self.rule_index.read();
        self.prepare_workers(&index);
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn equality(&self) -> &dyn EqualityManager {
        self.equality.as_ref()
    }

    pub(crate) fn rule_index(&self) -> &RwLock<RuleIndex> {
        &self.rule_index
    }

    /// Size every worker's argument buffer for the index's current terms.
    pub(crate) fn prepare_workers(&self, index: &RuleIndex) {
        for slot in &self.contexts {
            slot.lock().ensure_capacity(index.term_count());
        }
    }

    /// Stage a rule for addition. The rule participates in reasoning from
    /// the next materialization or incremental update.
    pub fn add_rule(&self, rule: Rule) -> Result<bool> {
        self.rule_index.write().add_rule(rule)
    }

    pub fn add_rules(&self, rules: impl IntoIterator<Item = Rule>) -> Result<bool> {
        let mut index = self.rule_index.write();
        let mut changed = false;
        for rule in rules {
            changed |= index.add_rule(rule)?;
        }
        Ok(changed)
    }

    /// Stage a rule for removal.
    pub fn remove_rule(&self, rule: &Rule) -> bool {
        self.rule_index.write().remove_rule(rule)
    }

    pub fn remove_rules<'a>(&self, rules: impl IntoIterator<Item = &'a Rule>) -> bool {
        let mut index = self.rule_index.write();
        let mut changed = false;
        for rule in rules {
            changed |= index.remove_rule(rule);
        }
        changed
    }

    /// All currently compiled rules.
    pub fn rules(&self) -> Vec<RuleRef> {
        self.rule_index.read().rules()
    }

    /// Rebuild all evaluation plans, preserving rule identity.
    pub fn recompile_rules(&self) -> Result<()> {
        self.rule_index.write().recompile_rules()
    }

    /// Whether the active rules are stratified. Staged rules join the
    /// graph when their insertion is propagated.
    pub fn is_stratified(&self) -> bool {
        let mut index = self.rule_index.write();
        index.update_components();
        index.is_stratified()
    }

    /// Component level of the literal pattern covering a tuple.
    pub fn component_level(&self, tuple: &Tuple) -> usize {
        self.rule_index.read().component_level(tuple)
    }

    /// Full seminaive materialization by component levels.
    pub fn materialize(&self, monitor: &dyn MaterializationMonitor) -> Result<()> {
        crate::materialize::run(self, monitor)
    }

    /// One incremental maintenance run over the scheduled EDB changes and
    /// staged rule changes.
    pub fn update_incrementally(&self, monitor: &dyn IncrementalMonitor) -> Result<()> {
        crate::incremental::run(self, monitor)
    }

    /// Serialize the rule index into a versioned snapshot.
    pub fn save<W: Write>(&self, writer: W) -> Result<()> {
        snapshot::save(&self.rule_index.read(), writer)
    }

    /// Replace the rule index with a snapshot, rebuilding all derived
    /// structures by replaying rule registration.
    pub fn load<R: Read>(&self, reader: R) -> Result<()> {
        let index = snapshot::load(reader)?;
        self.prepare_workers(&index);
        *self.rule_index.write() = index;
        Ok(())
    }

    /// Run one task: the closure is executed once per worker, and all
    /// workers are joined before this returns. Worker errors abort the
    /// whole call and are reported together.
    pub(crate) fn run_workers<F>(&self, task: F) -> Result<()>
    where
        F: Fn(usize, &mut ThreadContext) -> Result<()> + Sync,
    {
        if self.thread_count <= 1 {
            let mut context = self.contexts[0].lock();
            return task(0, &mut context);
        }
        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.thread_count);
            for worker_index in 0..self.thread_count {
                let task = &task;
                let slot = &self.contexts[worker_index];
                handles.push(scope.spawn(move || {
                    let mut context = slot.lock();
                    task(worker_index, &mut context)
                }));
            }
            let mut causes = Vec::new();
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => causes.push(error.to_string()),
                    Err(_) => causes.push("worker thread panicked".to_string()),
                }
            }
            if causes.is_empty() {
                Ok(())
            } else {
                Err(ReasonerError::Worker { causes })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::{Atom, Literal, Term};
    use crate::monitor::NoopMonitor;
    use ferrite_db_core::{MemoryTupleTable, Rid};

    #[test]
    fn test_add_and_remove_rule_round_trip() {
        let engine = DatalogEngine::new(Arc::new(MemoryTupleTable::new()));
        let rule = Rule::new(
            vec![Atom::new(
                Term::var("X"),
                Term::constant(Rid(10)),
                Term::var("Y"),
            )],
            vec![Literal::Atom(Atom::new(
                Term::var("X"),
                Term::constant(Rid(11)),
                Term::var("Y"),
            ))],
        );
        assert!(engine.add_rule(rule.clone()).unwrap());
        assert!(!engine.add_rule(rule.clone()).unwrap());
        assert_eq!(engine.rules().len(), 1);
        assert!(engine.remove_rule(&rule));
        assert!(!engine.remove_rule(&rule));
        assert!(engine.rules().is_empty());
    }

    #[test]
    fn test_malformed_rule_is_rejected_without_mutation() {
        let engine = DatalogEngine::new(Arc::new(MemoryTupleTable::new()));
        let malformed = Rule::new(
            vec![Atom::new(
                Term::var("X"),
                Term::constant(Rid(10)),
                Term::var("Z"),
            )],
            vec![Literal::Atom(Atom::new(
                Term::var("X"),
                Term::constant(Rid(11)),
                Term::var("Y"),
            ))],
        );
        assert!(matches!(
            engine.add_rule(malformed),
            Err(ReasonerError::RuleCompilation { .. })
        ));
        assert!(engine.rules().is_empty());
        // The engine stays usable.
        engine.materialize(&NoopMonitor).unwrap();
    }

    #[test]
    fn test_worker_phase_terminates_single_worker() {
        let phase = WorkerPhase::new(1);
        let mut remaining = 3;
        phase
            .drive(
                || false,
                || {
                    if remaining > 0 {
                        remaining -= 1;
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                },
            )
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
