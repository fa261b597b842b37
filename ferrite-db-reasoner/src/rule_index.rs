//! The rule index: compiled rules, pivoted evaluation plans, and literal
//! dispatch.
//!
//! Every rule is compiled into one [`RuleInfo`]: one pivot-positive
//! evaluation plan per positive body literal (the first doubles as the
//! main-materialization plan) and one pivot-negation plan per
//! negation/aggregate literal. Plans are chains of hash-consed
//! [`BodyLiteralInfo`] nodes, so rules sharing a literal pattern share the
//! same compiled node under a reference count.
//!
//! Pivot literals are indexed by their constant pattern under all eight
//! subject/predicate/object binding patterns, separately for main
//! materialization and incremental evaluation; head atoms are indexed the
//! same way for the reverse lookup used by backward chaining.
//!
//! Structural mutation (`add_rule`/`remove_rule`, activation) requires
//! `&mut self` and happens while no evaluation runs; the application entry
//! points take `&self` and are safe to call from any number of workers.

use crate::dependency::DependencyGraph;
use crate::error::Result;
use crate::logic::{Literal, Rule, RuleRef, Term, TermArray};
use crate::monitor::MaterializationMonitor;
use crate::pattern_index::LiteralPatternIndex;
use ferrite_db_core::{Rid, Tuple, TupleIndex, TuplePattern, TupleStatus, TupleStore};
use hashbrown::{HashMap, HashSet};
use smallvec::SmallVec;
use std::sync::Arc;

/// Handle of a compiled body literal in the rule index's slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LiteralId(u32);

impl LiteralId {
    #[cfg(test)]
    pub(crate) fn new(value: u32) -> Self {
        LiteralId(value)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle of a compiled head atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeadAtomId(u32);

impl HeadAtomId {
    #[cfg(test)]
    pub(crate) fn new(value: u32) -> Self {
        HeadAtomId(value)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle of a compiled rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleId(u32);

impl RuleId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which component levels a plan reacts to when a tuple arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentLevelFilter {
    /// Plans of rules whose head lives in the current component level.
    AllInComponent,
    /// Plans evaluated at the current level: recursive pivots of the
    /// level, plus the designated non-recursive plan of each
    /// non-recursive head at the level.
    WithPivotInComponent,
    /// Every plan, regardless of levels.
    AllComponents,
}

/// Position of a literal within a plan relative to the pivot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiteralPosition {
    BeforePivot,
    Pivot,
    AfterPivot,
}

/// Bitset over component levels.
#[derive(Debug, Default, Clone)]
struct LevelBitset {
    words: Vec<u64>,
}

impl LevelBitset {
    fn clear(&mut self) {
        self.words.clear();
    }

    fn insert(&mut self, level: usize) {
        let word = level / 64;
        while self.words.len() <= word {
            self.words.push(0);
        }
        self.words[word] |= 1 << (level % 64);
    }

    fn contains(&self, level: usize) -> bool {
        self.words
            .get(level / 64)
            .map_or(false, |word| word & (1 << (level % 64)) != 0)
    }
}

/// A compiled body literal, shared across the rules and plans that use it.
#[derive(Debug)]
pub(crate) struct BodyLiteralInfo {
    literal: Literal,
    atom_argument_indexes: SmallVec<[[usize; 3]; 1]>,
    parent: Option<LiteralId>,
    position: LiteralPosition,
    ref_count: usize,
    component_level: usize,
    all_in_component: LevelBitset,
    with_pivot_in_component: LevelBitset,
}

/// A compiled head atom.
#[derive(Debug)]
pub struct HeadAtomInfo {
    rule: RuleId,
    head_index: usize,
    argument_indexes: [usize; 3],
    pattern: [Rid; 3],
    component_level: usize,
    recursive: bool,
}

impl HeadAtomInfo {
    /// The rule this head atom belongs to.
    pub(crate) fn rule_id(&self) -> RuleId {
        self.rule
    }

    /// Index of this atom within the rule's head.
    pub fn head_index(&self) -> usize {
        self.head_index
    }

    /// Component level of the head pattern.
    pub fn component_level(&self) -> usize {
        self.component_level
    }

    /// Whether some plan's pivot shares this head's component level.
    pub fn is_recursive(&self) -> bool {
        self.recursive
    }
}

/// One pivoted evaluation plan: the pivot literal first, then the
/// remaining body literals in join order. For negation pivots,
/// `exported_positions` lists the argument slots of negation variables
/// that also occur outside the negation.
#[derive(Debug, Clone)]
pub(crate) struct EvaluationPlan {
    pub literals: Vec<LiteralId>,
    pub exported_positions: Vec<usize>,
}

/// One rule's compiled state.
#[derive(Debug)]
pub struct RuleInfo {
    rule: RuleRef,
    active: bool,
    just_added: bool,
    just_deleted: bool,
    pivotless: bool,
    has_negation: bool,
    has_aggregation: bool,
    pivot_positive_plans: Vec<EvaluationPlan>,
    pivot_negation_plans: Vec<EvaluationPlan>,
    head_atoms: Vec<HeadAtomId>,
    level_filter: LevelBitset,
    acquired_literals: Vec<LiteralId>,
}

impl RuleInfo {
    pub fn rule(&self) -> &RuleRef {
        &self.rule
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_just_added(&self) -> bool {
        self.just_added
    }

    pub fn is_just_deleted(&self) -> bool {
        self.just_deleted
    }

    pub fn is_pivotless(&self) -> bool {
        self.pivotless
    }

    pub(crate) fn in_level_filter(&self, level: usize) -> bool {
        self.level_filter.contains(level)
    }
}

/// Reference to one pivot-positive plan, stored in the pattern indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlanRef {
    rule: RuleId,
    plan: u32,
}

/// Reference to one underlying atom of one pivot-negation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UnderlyingRef {
    rule: RuleId,
    plan: u32,
    atom: u32,
}

/// Which facts a literal position may read during evaluation. All filters
/// receive the candidate tuple's index and status; returning `false`
/// excludes the fact.
pub struct TupleFilters<'a> {
    pub positive_before_pivot: &'a dyn Fn(TupleIndex, TupleStatus) -> bool,
    pub positive_after_pivot: &'a dyn Fn(TupleIndex, TupleStatus) -> bool,
    pub negative: &'a dyn Fn(TupleIndex, TupleStatus) -> bool,
    pub underlying_before_pivot: &'a dyn Fn(TupleIndex, TupleStatus) -> bool,
    pub underlying_after_pivot: &'a dyn Fn(TupleIndex, TupleStatus) -> bool,
}

impl<'a> TupleFilters<'a> {
    /// The same filter at every position.
    pub fn uniform(filter: &'a dyn Fn(TupleIndex, TupleStatus) -> bool) -> Self {
        TupleFilters {
            positive_before_pivot: filter,
            positive_after_pivot: filter,
            negative: filter,
            underlying_before_pivot: filter,
            underlying_after_pivot: filter,
        }
    }
}

/// Per-worker evaluation scratch space, pre-sized by the engine so the
/// join hot path performs no allocation.
#[derive(Debug, Default)]
pub struct ThreadContext {
    arguments: Vec<Rid>,
}

impl ThreadContext {
    pub fn new() -> Self {
        ThreadContext::default()
    }

    /// Reserve room for the index's current term count.
    pub fn ensure_capacity(&mut self, term_count: usize) {
        if self.arguments.capacity() < term_count {
            self.arguments.reserve(term_count - self.arguments.capacity());
        }
    }

    fn reset_from(&mut self, defaults: &[Rid]) {
        self.arguments.clear();
        self.arguments.extend_from_slice(defaults);
    }
}

/// Head-derivation consumer invoked once per rule instance match.
pub type DerivationConsumer<'a> = &'a mut dyn FnMut(&HeadAtomInfo, Tuple) -> Result<()>;

/// How the pivot literal of the main-materialization plan is chosen.
///
/// The choice affects performance only, never results; see the
/// full-vs-incremental equivalence tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PivotPolicy {
    /// Pivot on the first positive literal of the body.
    #[default]
    FirstPositive,
}

/// Per-level summary of the active rules.
#[derive(Debug, Default, Clone)]
struct ComponentLevelInfo {
    has_rules_with_negation: bool,
    has_rules_with_aggregation: bool,
    has_pivotless_rules: bool,
    has_nonrecursive_rules: bool,
    has_recursive_rules: bool,
}

type BodyLiteralKey = (Option<LiteralId>, Literal, LiteralPosition);

/// The rule index.
pub struct RuleIndex {
    terms: TermArray,
    graph: DependencyGraph,
    body_literals: Vec<Option<BodyLiteralInfo>>,
    free_body_literals: Vec<u32>,
    body_literal_index: HashMap<BodyLiteralKey, LiteralId>,
    head_atoms: Vec<Option<HeadAtomInfo>>,
    free_head_atoms: Vec<u32>,
    rules: Vec<Option<RuleInfo>>,
    free_rules: Vec<u32>,
    rule_ids_by_rule: HashMap<RuleRef, RuleId>,
    head_atom_index_main: LiteralPatternIndex<HeadAtomId>,
    pivot_positive_index_main: LiteralPatternIndex<PlanRef>,
    pivot_positive_index_incremental: LiteralPatternIndex<PlanRef>,
    pivot_underlying_negation_index_main: LiteralPatternIndex<UnderlyingRef>,
    component_level_infos: Vec<ComponentLevelInfo>,
    filters_dirty: bool,
    pivotless_rule_count: usize,
    rules_with_negation_count: usize,
    rules_with_aggregation_count: usize,
    just_added_rule_count: usize,
    just_deleted_rule_count: usize,
    pivot_policy: PivotPolicy,
}

impl Default for RuleIndex {
    fn default() -> Self {
        RuleIndex::new()
    }
}

impl RuleIndex {
    pub fn new() -> Self {
        RuleIndex::with_pivot_policy(PivotPolicy::default())
    }

    pub fn with_pivot_policy(pivot_policy: PivotPolicy) -> Self {
        RuleIndex {
            terms: TermArray::new(),
            graph: DependencyGraph::new(),
            body_literals: Vec::new(),
            free_body_literals: Vec::new(),
            body_literal_index: HashMap::new(),
            head_atoms: Vec::new(),
            free_head_atoms: Vec::new(),
            rules: Vec::new(),
            free_rules: Vec::new(),
            rule_ids_by_rule: HashMap::new(),
            head_atom_index_main: LiteralPatternIndex::new(),
            pivot_positive_index_main: LiteralPatternIndex::new(),
            pivot_positive_index_incremental: LiteralPatternIndex::new(),
            pivot_underlying_negation_index_main: LiteralPatternIndex::new(),
            component_level_infos: Vec::new(),
            filters_dirty: false,
            pivotless_rule_count: 0,
            rules_with_negation_count: 0,
            rules_with_aggregation_count: 0,
            just_added_rule_count: 0,
            just_deleted_rule_count: 0,
            pivot_policy,
        }
    }

    // --- slab accessors ---

    fn body_literal(&self, id: LiteralId) -> &BodyLiteralInfo {
        match &self.body_literals[id.index()] {
            Some(info) => info,
            None => unreachable!("dangling body-literal handle"),
        }
    }

    fn body_literal_mut(&mut self, id: LiteralId) -> &mut BodyLiteralInfo {
        match &mut self.body_literals[id.index()] {
            Some(info) => info,
            None => unreachable!("dangling body-literal handle"),
        }
    }

    /// The compiled head atom behind a handle.
    pub fn head_atom(&self, id: HeadAtomId) -> &HeadAtomInfo {
        match &self.head_atoms[id.index()] {
            Some(info) => info,
            None => unreachable!("dangling head-atom handle"),
        }
    }

    fn head_atom_mut(&mut self, id: HeadAtomId) -> &mut HeadAtomInfo {
        match &mut self.head_atoms[id.index()] {
            Some(info) => info,
            None => unreachable!("dangling head-atom handle"),
        }
    }

    /// The compiled rule behind a handle.
    pub fn rule(&self, id: RuleId) -> &RuleInfo {
        match &self.rules[id.index()] {
            Some(info) => info,
            None => unreachable!("dangling rule handle"),
        }
    }

    fn rule_mut(&mut self, id: RuleId) -> &mut RuleInfo {
        match &mut self.rules[id.index()] {
            Some(info) => info,
            None => unreachable!("dangling rule handle"),
        }
    }

    fn live_rule_ids(&self) -> Vec<RuleId> {
        (0..self.rules.len() as u32)
            .map(RuleId)
            .filter(|id| self.rules[id.index()].is_some())
            .collect()
    }

    // --- public queries ---

    /// Number of interned terms; sizes per-worker argument buffers.
    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    /// The dependency graph built from the active rules.
    pub fn dependency_graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn is_stratified(&self) -> bool {
        self.graph.is_stratified()
    }

    /// Rules participating in unstratified components.
    pub fn unstratified_rules(&self) -> Vec<RuleRef> {
        let mut seen: HashSet<RuleId> = HashSet::new();
        let mut rules = Vec::new();
        for component in self.graph.unstratified_head_atoms() {
            for head_id in component {
                let rule_id = self.head_atom(head_id).rule;
                if seen.insert(rule_id) {
                    rules.push(self.rule(rule_id).rule.clone());
                }
            }
        }
        rules
    }

    pub fn first_rule_component_level(&self) -> Option<usize> {
        self.graph.first_rule_component_level()
    }

    pub fn max_component_level(&self) -> usize {
        self.graph.max_component_level()
    }

    /// Component level of the literal pattern covering a ground tuple;
    /// level 0 when no rule mentions a covering pattern.
    pub fn component_level(&self, tuple: &Tuple) -> usize {
        self.graph.component_level(tuple)
    }

    pub fn has_rules(&self, component_level: Option<usize>) -> bool {
        self.has_nonrecursive_rules(component_level) || self.has_recursive_rules(component_level)
    }

    pub fn has_rules_with_negation(&self, component_level: Option<usize>) -> bool {
        match component_level {
            None => self.rules_with_negation_count > 0,
            Some(level) => self
                .component_level_infos
                .get(level)
                .map_or(false, |info| info.has_rules_with_negation),
        }
    }

    pub fn has_rules_with_aggregation(&self, component_level: Option<usize>) -> bool {
        match component_level {
            None => self.rules_with_aggregation_count > 0,
            Some(level) => self
                .component_level_infos
                .get(level)
                .map_or(false, |info| info.has_rules_with_aggregation),
        }
    }

    pub fn has_pivotless_rules(&self, component_level: Option<usize>) -> bool {
        match component_level {
            None => self.pivotless_rule_count > 0,
            Some(level) => self
                .component_level_infos
                .get(level)
                .map_or(false, |info| info.has_pivotless_rules),
        }
    }

    pub fn has_nonrecursive_rules(&self, component_level: Option<usize>) -> bool {
        match component_level {
            None => self.pivotless_rule_count > 0,
            Some(level) => self
                .component_level_infos
                .get(level)
                .map_or(false, |info| info.has_nonrecursive_rules),
        }
    }

    pub fn has_recursive_rules(&self, component_level: Option<usize>) -> bool {
        match component_level {
            None => !self.rule_ids_by_rule.is_empty(),
            Some(level) => self
                .component_level_infos
                .get(level)
                .map_or(false, |info| info.has_recursive_rules),
        }
    }

    pub fn has_just_added_rules(&self) -> bool {
        self.just_added_rule_count > 0
    }

    pub fn has_just_deleted_rules(&self) -> bool {
        self.just_deleted_rule_count > 0
    }

    /// All compiled rules, in slab order.
    pub fn rules(&self) -> Vec<RuleRef> {
        self.rules
            .iter()
            .flatten()
            .map(|info| info.rule.clone())
            .collect()
    }

    pub fn rule_count(&self) -> usize {
        self.rule_ids_by_rule.len()
    }

    /// Every compiled rule with its lifecycle flags
    /// `(active, just_added, just_deleted)`, in slab order.
    pub fn rule_states(&self) -> Vec<(RuleRef, bool, bool, bool)> {
        self.rules
            .iter()
            .flatten()
            .map(|info| {
                (
                    info.rule.clone(),
                    info.active,
                    info.just_added,
                    info.just_deleted,
                )
            })
            .collect()
    }

    pub(crate) fn just_added_rule_ids(&self) -> Vec<RuleId> {
        self.live_rule_ids()
            .into_iter()
            .filter(|&id| self.rule(id).just_added)
            .collect()
    }

    pub(crate) fn just_deleted_rule_ids(&self) -> Vec<RuleId> {
        self.live_rule_ids()
            .into_iter()
            .filter(|&id| self.rule(id).just_deleted)
            .collect()
    }

    /// Active pivotless rules relevant at a level.
    pub(crate) fn pivotless_rule_ids_at(&self, component_level: Option<usize>) -> Vec<RuleId> {
        self.live_rule_ids()
            .into_iter()
            .filter(|&id| {
                let info = self.rule(id);
                info.active
                    && info.pivotless
                    && component_level.map_or(true, |level| info.level_filter.contains(level))
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn body_literal_count(&self) -> usize {
        self.body_literals.iter().filter(|slot| slot.is_some()).count()
    }

    // --- compilation ---

    fn pattern_of(&self, indexes: &[usize; 3]) -> [Rid; 3] {
        let defaults = self.terms.default_arguments();
        [
            defaults[indexes[0]],
            defaults[indexes[1]],
            defaults[indexes[2]],
        ]
    }

    fn get_literal_info(
        &mut self,
        parent: Option<LiteralId>,
        literal: &Literal,
        position: LiteralPosition,
        atom_argument_indexes: SmallVec<[[usize; 3]; 1]>,
    ) -> LiteralId {
        let key = (parent, literal.clone(), position);
        if let Some(&id) = self.body_literal_index.get(&key) {
            self.body_literal_mut(id).ref_count += 1;
            return id;
        }
        let info = BodyLiteralInfo {
            literal: literal.clone(),
            atom_argument_indexes,
            parent,
            position,
            ref_count: 1,
            component_level: 0,
            all_in_component: LevelBitset::default(),
            with_pivot_in_component: LevelBitset::default(),
        };
        let id = match self.free_body_literals.pop() {
            Some(slot) => {
                self.body_literals[slot as usize] = Some(info);
                LiteralId(slot)
            }
            None => {
                self.body_literals.push(Some(info));
                LiteralId((self.body_literals.len() - 1) as u32)
            }
        };
        self.body_literal_index.insert(key, id);
        id
    }

    fn release_literal(&mut self, id: LiteralId) {
        let remaining = {
            let info = self.body_literal_mut(id);
            info.ref_count -= 1;
            info.ref_count
        };
        if remaining == 0 {
            let key = {
                let info = self.body_literal(id);
                (info.parent, info.literal.clone(), info.position)
            };
            self.body_literal_index.remove(&key);
            self.body_literals[id.index()] = None;
            self.free_body_literals.push(id.0);
        }
    }

    /// Argument slots of negation variables that also occur outside the
    /// negation; these carry bindings from the underlying-confirmation
    /// join into the rest of the plan.
    fn exported_positions(&self, rule: &Rule, negation_index: usize) -> Vec<usize> {
        let negation_vars: HashSet<&Arc<str>> =
            rule.body[negation_index].atoms().iter().flat_map(|atom| atom.variables()).collect();
        let mut outside: HashSet<&Arc<str>> = HashSet::new();
        for atom in &rule.head {
            outside.extend(atom.variables());
        }
        for (index, literal) in rule.body.iter().enumerate() {
            if index != negation_index {
                for atom in literal.atoms() {
                    outside.extend(atom.variables());
                }
            }
        }
        let mut positions: Vec<usize> = negation_vars
            .intersection(&outside)
            .map(|name| self.terms.position(&Term::Variable((*name).clone())))
            .collect();
        positions.sort_unstable();
        positions.dedup();
        positions
    }

    fn compile_rule(&mut self, rule: RuleRef) -> Result<RuleId> {
        rule.validate()?;
        let mut body_indexes: Vec<SmallVec<[[usize; 3]; 1]>> = Vec::with_capacity(rule.body.len());
        for literal in &rule.body {
            let per_atom = literal
                .atoms()
                .iter()
                .map(|atom| self.terms.intern_atom(atom))
                .collect();
            body_indexes.push(per_atom);
        }
        let positive: Vec<usize> = (0..rule.body.len())
            .filter(|&index| rule.body[index].is_positive())
            .collect();
        let negative: Vec<usize> = (0..rule.body.len())
            .filter(|&index| !rule.body[index].is_positive())
            .collect();

        let mut acquired: Vec<LiteralId> = Vec::new();
        // PivotPolicy::FirstPositive: plans are built in body order, so
        // plan 0 pivots on the first positive literal.
        let PivotPolicy::FirstPositive = self.pivot_policy;
        let mut pivot_positive_plans = Vec::with_capacity(positive.len());
        for &pivot_index in &positive {
            let mut literals = Vec::with_capacity(rule.body.len());
            let pivot = self.get_literal_info(
                None,
                &rule.body[pivot_index],
                LiteralPosition::Pivot,
                body_indexes[pivot_index].clone(),
            );
            acquired.push(pivot);
            literals.push(pivot);
            let mut parent = pivot;
            for &other in &positive {
                if other == pivot_index {
                    continue;
                }
                let position = if other < pivot_index {
                    LiteralPosition::BeforePivot
                } else {
                    LiteralPosition::AfterPivot
                };
                let id = self.get_literal_info(
                    Some(parent),
                    &rule.body[other],
                    position,
                    body_indexes[other].clone(),
                );
                acquired.push(id);
                literals.push(id);
                parent = id;
            }
            // All negative literals join after all positive ones.
            for &other in &negative {
                let id = self.get_literal_info(
                    Some(parent),
                    &rule.body[other],
                    LiteralPosition::AfterPivot,
                    body_indexes[other].clone(),
                );
                acquired.push(id);
                literals.push(id);
                parent = id;
            }
            pivot_positive_plans.push(EvaluationPlan {
                literals,
                exported_positions: Vec::new(),
            });
        }

        let mut pivot_negation_plans = Vec::with_capacity(negative.len());
        for &pivot_index in &negative {
            let mut literals = Vec::with_capacity(rule.body.len());
            let pivot = self.get_literal_info(
                None,
                &rule.body[pivot_index],
                LiteralPosition::Pivot,
                body_indexes[pivot_index].clone(),
            );
            acquired.push(pivot);
            literals.push(pivot);
            let mut parent = pivot;
            for &other in &positive {
                let id = self.get_literal_info(
                    Some(parent),
                    &rule.body[other],
                    LiteralPosition::BeforePivot,
                    body_indexes[other].clone(),
                );
                acquired.push(id);
                literals.push(id);
                parent = id;
            }
            for &other in &negative {
                if other == pivot_index {
                    continue;
                }
                let position = if other < pivot_index {
                    LiteralPosition::BeforePivot
                } else {
                    LiteralPosition::AfterPivot
                };
                let id = self.get_literal_info(
                    Some(parent),
                    &rule.body[other],
                    position,
                    body_indexes[other].clone(),
                );
                acquired.push(id);
                literals.push(id);
                parent = id;
            }
            pivot_negation_plans.push(EvaluationPlan {
                literals,
                exported_positions: self.exported_positions(&rule, pivot_index),
            });
        }

        let rule_id = match self.free_rules.pop() {
            Some(slot) => RuleId(slot),
            None => {
                self.rules.push(None);
                RuleId((self.rules.len() - 1) as u32)
            }
        };
        let mut head_atoms = Vec::with_capacity(rule.head.len());
        for (head_index, atom) in rule.head.iter().enumerate() {
            let argument_indexes = self.terms.intern_atom(atom);
            let pattern = self.pattern_of(&argument_indexes);
            let info = HeadAtomInfo {
                rule: rule_id,
                head_index,
                argument_indexes,
                pattern,
                component_level: 0,
                recursive: false,
            };
            let head_id = match self.free_head_atoms.pop() {
                Some(slot) => {
                    self.head_atoms[slot as usize] = Some(info);
                    HeadAtomId(slot)
                }
                None => {
                    self.head_atoms.push(Some(info));
                    HeadAtomId((self.head_atoms.len() - 1) as u32)
                }
            };
            head_atoms.push(head_id);
        }

        let info = RuleInfo {
            pivotless: rule.is_pivotless(),
            has_negation: rule.has_negation(),
            has_aggregation: rule.has_aggregation(),
            rule: rule.clone(),
            active: false,
            just_added: false,
            just_deleted: false,
            pivot_positive_plans,
            pivot_negation_plans,
            head_atoms,
            level_filter: LevelBitset::default(),
            acquired_literals: acquired,
        };
        self.pivotless_rule_count += info.pivotless as usize;
        self.rules_with_negation_count += info.has_negation as usize;
        self.rules_with_aggregation_count += info.has_aggregation as usize;
        self.rules[rule_id.index()] = Some(info);
        self.rule_ids_by_rule.insert(rule, rule_id);
        Ok(rule_id)
    }

    fn register_literal_in_graph(
        &mut self,
        add_edges: bool,
        head_node: crate::dependency::NodeId,
        literal_id: LiteralId,
    ) {
        let (positive, patterns) = {
            let info = self.body_literal(literal_id);
            let positive = info.literal.is_positive();
            let patterns: SmallVec<[[Rid; 3]; 1]> = info
                .atom_argument_indexes
                .iter()
                .map(|indexes| self.pattern_of(indexes))
                .collect();
            (positive, patterns)
        };
        for pattern in patterns {
            let node = self.graph.intern_node(pattern);
            self.graph.add_body_occurrence(node, literal_id);
            if add_edges {
                self.graph.add_edge(positive, node, head_node);
            }
        }
    }

    fn unregister_literal_in_graph(
        &mut self,
        remove_edges: bool,
        head_node: crate::dependency::NodeId,
        literal_id: LiteralId,
    ) {
        let (positive, patterns) = {
            let info = self.body_literal(literal_id);
            let positive = info.literal.is_positive();
            let patterns: SmallVec<[[Rid; 3]; 1]> = info
                .atom_argument_indexes
                .iter()
                .map(|indexes| self.pattern_of(indexes))
                .collect();
            (positive, patterns)
        };
        for pattern in patterns.iter().rev() {
            let node = self.graph.intern_node(*pattern);
            self.graph.remove_body_occurrence(node, literal_id);
            if remove_edges {
                self.graph.remove_edge(positive, node, head_node);
            }
        }
    }

    fn ensure_active(&mut self, rule_id: RuleId) {
        if self.rule(rule_id).active {
            return;
        }
        let head_ids = self.rule(rule_id).head_atoms.clone();
        let pos_plans: Vec<Vec<LiteralId>> = self
            .rule(rule_id)
            .pivot_positive_plans
            .iter()
            .map(|plan| plan.literals.clone())
            .collect();
        let neg_plans: Vec<Vec<LiteralId>> = self
            .rule(rule_id)
            .pivot_negation_plans
            .iter()
            .map(|plan| plan.literals.clone())
            .collect();
        for &head_id in &head_ids {
            let pattern = self.head_atom(head_id).pattern;
            let head_node = self.graph.intern_node(pattern);
            self.graph.add_head_occurrence(head_node, head_id);
            // Only the first plan contributes dependency edges; the others
            // merely register their literal occurrences.
            let mut add_edges = true;
            for literals in &pos_plans {
                for &literal_id in literals {
                    self.register_literal_in_graph(add_edges, head_node, literal_id);
                }
                add_edges = false;
            }
            let mut add_edges = pos_plans.is_empty();
            for literals in &neg_plans {
                for &literal_id in literals {
                    self.register_literal_in_graph(add_edges, head_node, literal_id);
                }
                add_edges = false;
            }
        }
        for (plan_number, literals) in pos_plans.iter().enumerate() {
            let pattern = {
                let pivot = self.body_literal(literals[0]);
                self.pattern_of(&pivot.atom_argument_indexes[0])
            };
            let reference = PlanRef {
                rule: rule_id,
                plan: plan_number as u32,
            };
            self.pivot_positive_index_main.add(pattern, reference);
            self.pivot_positive_index_incremental.add(pattern, reference);
        }
        for (plan_number, literals) in neg_plans.iter().enumerate() {
            let patterns: SmallVec<[[Rid; 3]; 1]> = {
                let pivot = self.body_literal(literals[0]);
                pivot
                    .atom_argument_indexes
                    .iter()
                    .map(|indexes| self.pattern_of(indexes))
                    .collect()
            };
            for (atom_number, pattern) in patterns.into_iter().enumerate() {
                self.pivot_underlying_negation_index_main.add(
                    pattern,
                    UnderlyingRef {
                        rule: rule_id,
                        plan: plan_number as u32,
                        atom: atom_number as u32,
                    },
                );
            }
        }
        for &head_id in &head_ids {
            let pattern = self.head_atom(head_id).pattern;
            self.head_atom_index_main.add(pattern, head_id);
        }
        self.rule_mut(rule_id).active = true;
        self.filters_dirty = true;
    }

    fn ensure_inactive(&mut self, rule_id: RuleId) {
        if !self.rule(rule_id).active {
            return;
        }
        let head_ids = self.rule(rule_id).head_atoms.clone();
        let pos_plans: Vec<Vec<LiteralId>> = self
            .rule(rule_id)
            .pivot_positive_plans
            .iter()
            .map(|plan| plan.literals.clone())
            .collect();
        let neg_plans: Vec<Vec<LiteralId>> = self
            .rule(rule_id)
            .pivot_negation_plans
            .iter()
            .map(|plan| plan.literals.clone())
            .collect();
        for &head_id in head_ids.iter().rev() {
            let pattern = self.head_atom(head_id).pattern;
            self.head_atom_index_main.remove(pattern, head_id);
        }
        for (plan_number, literals) in neg_plans.iter().enumerate().rev() {
            let patterns: SmallVec<[[Rid; 3]; 1]> = {
                let pivot = self.body_literal(literals[0]);
                pivot
                    .atom_argument_indexes
                    .iter()
                    .map(|indexes| self.pattern_of(indexes))
                    .collect()
            };
            for (atom_number, pattern) in patterns.into_iter().enumerate() {
                self.pivot_underlying_negation_index_main.remove(
                    pattern,
                    UnderlyingRef {
                        rule: rule_id,
                        plan: plan_number as u32,
                        atom: atom_number as u32,
                    },
                );
            }
        }
        for (plan_number, literals) in pos_plans.iter().enumerate().rev() {
            let pattern = {
                let pivot = self.body_literal(literals[0]);
                self.pattern_of(&pivot.atom_argument_indexes[0])
            };
            let reference = PlanRef {
                rule: rule_id,
                plan: plan_number as u32,
            };
            self.pivot_positive_index_incremental.remove(pattern, reference);
            self.pivot_positive_index_main.remove(pattern, reference);
        }
        for &head_id in &head_ids {
            let pattern = self.head_atom(head_id).pattern;
            let head_node = self.graph.intern_node(pattern);
            // Undo registration in the opposite order: the edge-carrying
            // plan is processed last so the nodes it shares with the other
            // plans have already lost their occurrences.
            let mut remaining = neg_plans.len();
            for literals in neg_plans.iter().rev() {
                remaining -= 1;
                let remove_edges = pos_plans.is_empty() && remaining == 0;
                for &literal_id in literals.iter().rev() {
                    self.unregister_literal_in_graph(remove_edges, head_node, literal_id);
                }
            }
            let mut remaining = pos_plans.len();
            for literals in pos_plans.iter().rev() {
                remaining -= 1;
                let remove_edges = remaining == 0;
                for &literal_id in literals.iter().rev() {
                    self.unregister_literal_in_graph(remove_edges, head_node, literal_id);
                }
            }
            self.graph.remove_head_occurrence(head_node, head_id);
            self.graph.release_node_if_unused(head_node);
        }
        self.rule_mut(rule_id).active = false;
        self.filters_dirty = true;
    }

    fn drop_rule(&mut self, rule_id: RuleId) {
        self.ensure_inactive(rule_id);
        let info = match self.rules[rule_id.index()].take() {
            Some(info) => info,
            None => unreachable!("dangling rule handle"),
        };
        self.rule_ids_by_rule.remove(&info.rule);
        for &literal_id in info.acquired_literals.iter().rev() {
            self.release_literal(literal_id);
        }
        for &head_id in &info.head_atoms {
            self.head_atoms[head_id.index()] = None;
            self.free_head_atoms.push(head_id.0);
        }
        self.free_rules.push(rule_id.0);
        self.pivotless_rule_count -= info.pivotless as usize;
        self.rules_with_negation_count -= info.has_negation as usize;
        self.rules_with_aggregation_count -= info.has_aggregation as usize;
        self.just_added_rule_count -= info.just_added as usize;
        self.just_deleted_rule_count -= info.just_deleted as usize;
    }

    /// Compile and stage a rule. The rule stays inactive (`just_added`)
    /// until insertions are propagated. Returns whether anything changed.
    pub fn add_rule(&mut self, rule: Rule) -> Result<bool> {
        let rule: RuleRef = Arc::new(rule);
        if let Some(&existing) = self.rule_ids_by_rule.get(&rule) {
            let info = self.rule_mut(existing);
            if info.just_deleted {
                info.just_deleted = false;
                self.just_deleted_rule_count -= 1;
                return Ok(true);
            }
            return Ok(false);
        }
        let rule_id = self.compile_rule(rule)?;
        self.rule_mut(rule_id).just_added = true;
        self.just_added_rule_count += 1;
        Ok(true)
    }

    /// Stage a rule for removal (`just_deleted`); it remains evaluable
    /// until deletions are propagated. A rule that was only staged for
    /// addition is discarded outright. Returns whether anything changed.
    pub fn remove_rule(&mut self, rule: &Rule) -> bool {
        let Some(&rule_id) = self.rule_ids_by_rule.get(rule) else {
            return false;
        };
        let (just_added, just_deleted) = {
            let info = self.rule(rule_id);
            (info.just_added, info.just_deleted)
        };
        if just_deleted {
            return false;
        }
        if just_added {
            self.drop_rule(rule_id);
        } else {
            self.rule_mut(rule_id).just_deleted = true;
            self.just_deleted_rule_count += 1;
        }
        true
    }

    /// Activate all `just_added` rules and recompute components.
    pub fn propagate_insertions(&mut self) {
        for rule_id in self.just_added_rule_ids() {
            self.ensure_active(rule_id);
            self.rule_mut(rule_id).just_added = false;
            self.just_added_rule_count -= 1;
        }
        self.update_components();
    }

    /// Drop all `just_deleted` rules and recompute components.
    pub fn propagate_deletions(&mut self) {
        for rule_id in self.just_deleted_rule_ids() {
            self.drop_rule(rule_id);
        }
        self.update_components();
    }

    /// Rebuild every compiled plan from scratch, preserving rule identity
    /// and lifecycle flags.
    pub fn recompile_rules(&mut self) -> Result<()> {
        let snapshot: Vec<(RuleRef, bool, bool, bool)> = self
            .rules
            .iter()
            .flatten()
            .map(|info| (info.rule.clone(), info.active, info.just_added, info.just_deleted))
            .collect();
        *self = RuleIndex::with_pivot_policy(self.pivot_policy);
        for (rule, active, just_added, just_deleted) in snapshot {
            self.add_rule_with_state((*rule).clone(), active, just_added, just_deleted)?;
        }
        Ok(())
    }

    /// Compile a rule directly into a given lifecycle state; used by
    /// recompilation and snapshot loading.
    pub(crate) fn add_rule_with_state(
        &mut self,
        rule: Rule,
        active: bool,
        just_added: bool,
        just_deleted: bool,
    ) -> Result<()> {
        let rule_id = self.compile_rule(Arc::new(rule))?;
        if active {
            self.ensure_active(rule_id);
        }
        {
            let info = self.rule_mut(rule_id);
            info.just_added = just_added;
            info.just_deleted = just_deleted;
        }
        self.just_added_rule_count += just_added as usize;
        self.just_deleted_rule_count += just_deleted as usize;
        self.update_components();
        Ok(())
    }

    /// Recompute component levels and the derived per-literal and
    /// per-rule filters when the dependency graph or the active rule set
    /// changed.
    pub fn update_components(&mut self) {
        let recomputed = self.graph.update_components();
        if !recomputed && !self.filters_dirty {
            return;
        }
        self.filters_dirty = false;
        let mut body_levels: Vec<(LiteralId, usize)> = Vec::new();
        self.graph
            .for_each_body_occurrence_level(|literal_id, level| body_levels.push((literal_id, level)));
        for (literal_id, level) in body_levels {
            self.body_literal_mut(literal_id).component_level = level;
        }
        let mut head_levels: Vec<(HeadAtomId, usize)> = Vec::new();
        self.graph
            .for_each_head_occurrence_level(|head_id, level| head_levels.push((head_id, level)));
        for (head_id, level) in head_levels {
            self.head_atom_mut(head_id).component_level = level;
        }
        self.component_level_infos =
            vec![ComponentLevelInfo::default(); self.graph.max_component_level() + 1];
        for slot in self.body_literals.iter_mut().flatten() {
            slot.all_in_component.clear();
            slot.with_pivot_in_component.clear();
        }
        for rule_id in self.live_rule_ids() {
            if self.rule(rule_id).active {
                self.update_rule_component_levels(rule_id);
            }
        }
    }

    fn update_rule_component_levels(&mut self, rule_id: RuleId) {
        let (head_ids, pos_plans, neg_plans, pivotless, has_negation, has_aggregation) = {
            let info = self.rule(rule_id);
            (
                info.head_atoms.clone(),
                info.pivot_positive_plans
                    .iter()
                    .map(|plan| plan.literals.clone())
                    .collect::<Vec<_>>(),
                info.pivot_negation_plans
                    .iter()
                    .map(|plan| plan.literals.clone())
                    .collect::<Vec<_>>(),
                info.pivotless,
                info.has_negation,
                info.has_aggregation,
            )
        };
        self.rule_mut(rule_id).level_filter.clear();
        for &head_id in &head_ids {
            let head_level = self.head_atom(head_id).component_level;
            self.rule_mut(rule_id).level_filter.insert(head_level);
            // A head atom is recursive if some plan's pivot shares its
            // level; a non-recursive head is instead assigned one plan,
            // evaluated when its own level is processed.
            let mut recursive = false;
            let mut nonrecursive_plan: Option<usize> = None;
            for (plan_number, literals) in pos_plans.iter().enumerate() {
                let pivot_recursive =
                    self.body_literal(literals[0]).component_level == head_level;
                if pivot_recursive {
                    recursive = true;
                } else if nonrecursive_plan.is_none() {
                    nonrecursive_plan = Some(plan_number);
                }
                for &literal_id in literals {
                    let info = self.body_literal_mut(literal_id);
                    info.all_in_component.insert(head_level);
                    if pivot_recursive {
                        info.with_pivot_in_component.insert(head_level);
                    }
                }
            }
            if !recursive {
                if let Some(plan_number) = nonrecursive_plan {
                    for &literal_id in &pos_plans[plan_number] {
                        self.body_literal_mut(literal_id)
                            .with_pivot_in_component
                            .insert(head_level);
                    }
                }
            }
            for literals in &neg_plans {
                for &literal_id in literals {
                    self.body_literal_mut(literal_id)
                        .all_in_component
                        .insert(head_level);
                }
            }
            self.head_atom_mut(head_id).recursive = recursive;
            let info = &mut self.component_level_infos[head_level];
            if recursive {
                info.has_recursive_rules = true;
            } else {
                info.has_nonrecursive_rules = true;
            }
            if pivotless {
                info.has_pivotless_rules = true;
            }
            if has_negation {
                info.has_rules_with_negation = true;
            }
            if has_aggregation {
                info.has_rules_with_aggregation = true;
            }
        }
    }

    // --- evaluation ---

    fn pattern_from_arguments(arguments: &[Rid], indexes: &[usize; 3]) -> TuplePattern {
        fn bound(value: Rid) -> Option<Rid> {
            value.is_valid().then_some(value)
        }
        TuplePattern::new(
            bound(arguments[indexes[0]]),
            bound(arguments[indexes[1]]),
            bound(arguments[indexes[2]]),
        )
    }

    /// Bind an atom's arguments from a tuple, recording newly written
    /// slots. Fails on a constant or already-bound variable mismatch; the
    /// caller restores `saved` either way.
    fn bind_atom(
        arguments: &mut [Rid],
        indexes: &[usize; 3],
        tuple: &Tuple,
        saved: &mut SmallVec<[(usize, Rid); 3]>,
    ) -> bool {
        for position in 0..3 {
            let index = indexes[position];
            let current = arguments[index];
            if current.is_valid() {
                if current != tuple[position] {
                    return false;
                }
            } else {
                saved.push((index, current));
                arguments[index] = tuple[position];
            }
        }
        true
    }

    fn restore(arguments: &mut [Rid], saved: &SmallVec<[(usize, Rid); 3]>) {
        for &(index, value) in saved.iter().rev() {
            arguments[index] = value;
        }
    }

    /// Whether the conjunction has a match under `filter`, with currently
    /// bound slots constrained and everything else existential. The
    /// search runs on a scratch copy so no bindings escape.
    fn exists_conjunction(
        &self,
        store: &dyn TupleStore,
        filter: &dyn Fn(TupleIndex, TupleStatus) -> bool,
        arguments: &[Rid],
        atom_indexes: &[[usize; 3]],
    ) -> bool {
        let mut scratch: Vec<Rid> = arguments.to_vec();
        Self::exists_conjunction_from(store, filter, &mut scratch, atom_indexes)
    }

    fn exists_conjunction_from(
        store: &dyn TupleStore,
        filter: &dyn Fn(TupleIndex, TupleStatus) -> bool,
        arguments: &mut [Rid],
        atom_indexes: &[[usize; 3]],
    ) -> bool {
        let Some((first, rest)) = atom_indexes.split_first() else {
            return true;
        };
        for (tuple_index, tuple, status) in
            store.matches(&Self::pattern_from_arguments(arguments, first))
        {
            if !filter(tuple_index, status) {
                continue;
            }
            let mut saved = SmallVec::new();
            let bound = Self::bind_atom(arguments, first, &tuple, &mut saved);
            let found =
                bound && Self::exists_conjunction_from(store, filter, arguments, rest);
            Self::restore(arguments, &saved);
            if found {
                return true;
            }
        }
        false
    }

    /// Join the remaining plan literals; `on_match` fires once per full
    /// body assignment.
    fn match_chain(
        &self,
        store: &dyn TupleStore,
        filters: &TupleFilters<'_>,
        arguments: &mut Vec<Rid>,
        steps: &[LiteralId],
        on_match: &mut dyn FnMut(&[Rid]) -> Result<()>,
    ) -> Result<()> {
        let Some((&step, rest)) = steps.split_first() else {
            return on_match(arguments);
        };
        let info = self.body_literal(step);
        match &info.literal {
            Literal::Atom(_) => {
                let indexes = info.atom_argument_indexes[0];
                let filter = match info.position {
                    LiteralPosition::BeforePivot => filters.positive_before_pivot,
                    _ => filters.positive_after_pivot,
                };
                for (tuple_index, tuple, status) in
                    store.matches(&Self::pattern_from_arguments(arguments, &indexes))
                {
                    if !filter(tuple_index, status) {
                        continue;
                    }
                    let mut saved = SmallVec::new();
                    if Self::bind_atom(arguments, &indexes, &tuple, &mut saved) {
                        self.match_chain(store, filters, arguments, rest, on_match)?;
                    }
                    Self::restore(arguments, &saved);
                }
                Ok(())
            }
            Literal::Negation(_) => {
                if !self.exists_conjunction(
                    store,
                    filters.negative,
                    arguments,
                    &info.atom_argument_indexes,
                ) {
                    self.match_chain(store, filters, arguments, rest, on_match)?;
                }
                Ok(())
            }
            Literal::Aggregate(_) => {
                if self.exists_conjunction(
                    store,
                    filters.negative,
                    arguments,
                    &info.atom_argument_indexes,
                ) {
                    self.match_chain(store, filters, arguments, rest, on_match)?;
                }
                Ok(())
            }
        }
    }

    fn emit_heads(
        &self,
        rule_info: &RuleInfo,
        arguments: &[Rid],
        head_level_filter: Option<usize>,
        monitor: &dyn MaterializationMonitor,
        worker_index: usize,
        consumer: DerivationConsumer<'_>,
    ) -> Result<()> {
        for &head_id in &rule_info.head_atoms {
            let head = self.head_atom(head_id);
            if let Some(level) = head_level_filter {
                if head.component_level != level {
                    continue;
                }
            }
            let tuple = [
                arguments[head.argument_indexes[0]],
                arguments[head.argument_indexes[1]],
                arguments[head.argument_indexes[2]],
            ];
            debug_assert!(tuple.iter().all(|value| value.is_valid()));
            monitor.rule_matched_started(worker_index, &rule_info.rule);
            consumer(head, tuple)?;
            monitor.rule_matched_finished(worker_index);
        }
        Ok(())
    }

    fn apply_positive(
        &self,
        pattern_index: &LiteralPatternIndex<PlanRef>,
        context: &mut ThreadContext,
        store: &dyn TupleStore,
        tuple: &Tuple,
        component_level: Option<usize>,
        level_filter: ComponentLevelFilter,
        filters: &TupleFilters<'_>,
        monitor: &dyn MaterializationMonitor,
        worker_index: usize,
        consumer: DerivationConsumer<'_>,
    ) -> Result<()> {
        let mut plan_refs: SmallVec<[PlanRef; 8]> = SmallVec::new();
        pattern_index.for_each_matching(tuple, |reference| plan_refs.push(reference));
        for reference in plan_refs {
            let rule_info = self.rule(reference.rule);
            let plan = &rule_info.pivot_positive_plans[reference.plan as usize];
            let pivot = self.body_literal(plan.literals[0]);
            let passes = match (level_filter, component_level) {
                (ComponentLevelFilter::AllComponents, _) => true,
                (ComponentLevelFilter::AllInComponent, Some(level)) => {
                    pivot.all_in_component.contains(level)
                }
                (ComponentLevelFilter::WithPivotInComponent, Some(level)) => {
                    pivot.with_pivot_in_component.contains(level)
                }
                (_, None) => true,
            };
            if !passes {
                continue;
            }
            context.reset_from(self.terms.default_arguments());
            let mut saved = SmallVec::new();
            if !Self::bind_atom(
                &mut context.arguments,
                &pivot.atom_argument_indexes[0],
                tuple,
                &mut saved,
            ) {
                continue;
            }
            let head_level_filter = match level_filter {
                ComponentLevelFilter::AllComponents => None,
                _ => component_level,
            };
            let consumer = &mut *consumer;
            let mut on_match = |arguments: &[Rid]| {
                self.emit_heads(
                    rule_info,
                    arguments,
                    head_level_filter,
                    monitor,
                    worker_index,
                    &mut *consumer,
                )
            };
            self.match_chain(
                store,
                filters,
                &mut context.arguments,
                &plan.literals[1..],
                &mut on_match,
            )?;
        }
        Ok(())
    }

    /// Apply all rules whose main-materialization pivot covers a tuple.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_rules_to_positive_literal_main(
        &self,
        context: &mut ThreadContext,
        store: &dyn TupleStore,
        tuple: &Tuple,
        component_level: Option<usize>,
        level_filter: ComponentLevelFilter,
        filters: &TupleFilters<'_>,
        monitor: &dyn MaterializationMonitor,
        worker_index: usize,
        consumer: DerivationConsumer<'_>,
    ) -> Result<()> {
        self.apply_positive(
            &self.pivot_positive_index_main,
            context,
            store,
            tuple,
            component_level,
            level_filter,
            filters,
            monitor,
            worker_index,
            consumer,
        )
    }

    /// Apply all rules whose incremental pivot covers a tuple.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_rules_to_positive_literal_incremental(
        &self,
        context: &mut ThreadContext,
        store: &dyn TupleStore,
        tuple: &Tuple,
        component_level: Option<usize>,
        level_filter: ComponentLevelFilter,
        filters: &TupleFilters<'_>,
        monitor: &dyn MaterializationMonitor,
        worker_index: usize,
        consumer: DerivationConsumer<'_>,
    ) -> Result<()> {
        self.apply_positive(
            &self.pivot_positive_index_incremental,
            context,
            store,
            tuple,
            component_level,
            level_filter,
            filters,
            monitor,
            worker_index,
            consumer,
        )
    }

    /// Re-check negation/aggregate literals when a tuple matching one of
    /// their underlying atoms changes.
    ///
    /// The triggering tuple seeds the changed underlying atom; the other
    /// underlying atoms are confirmed under the underlying filters, the
    /// confirmation's shared variables are exported, the negation itself
    /// must fail under the negative filter, and the rest of the body is
    /// then joined as usual.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_rules_to_underlying_negation_literal_main(
        &self,
        context: &mut ThreadContext,
        store: &dyn TupleStore,
        tuple: &Tuple,
        component_level: Option<usize>,
        level_filter: ComponentLevelFilter,
        filters: &TupleFilters<'_>,
        monitor: &dyn MaterializationMonitor,
        worker_index: usize,
        consumer: DerivationConsumer<'_>,
    ) -> Result<()> {
        let mut references: SmallVec<[UnderlyingRef; 4]> = SmallVec::new();
        self.pivot_underlying_negation_index_main
            .for_each_matching(tuple, |reference| references.push(reference));
        for reference in references {
            let rule_info = self.rule(reference.rule);
            let plan = &rule_info.pivot_negation_plans[reference.plan as usize];
            let pivot = self.body_literal(plan.literals[0]);
            let passes = match (level_filter, component_level) {
                (ComponentLevelFilter::AllComponents, _) => true,
                (_, Some(level)) => pivot.all_in_component.contains(level),
                (_, None) => true,
            };
            if !passes {
                continue;
            }
            let pivot_atom = reference.atom as usize;
            let mut scratch: Vec<Rid> = self.terms.default_arguments().to_vec();
            let mut saved = SmallVec::new();
            if !Self::bind_atom(
                &mut scratch,
                &pivot.atom_argument_indexes[pivot_atom],
                tuple,
                &mut saved,
            ) {
                continue;
            }
            let head_level_filter = match level_filter {
                ComponentLevelFilter::AllComponents => None,
                _ => component_level,
            };
            let consumer = &mut *consumer;
            let context = &mut *context;
            let mut on_confirmation = |confirmed: &[Rid]| -> Result<()> {
                context.reset_from(self.terms.default_arguments());
                for &position in &plan.exported_positions {
                    context.arguments[position] = confirmed[position];
                }
                // The negation itself must currently fail for the body to
                // hold; internal variables stay existential.
                if self.exists_conjunction(
                    store,
                    filters.negative,
                    &context.arguments,
                    &pivot.atom_argument_indexes,
                ) {
                    return Ok(());
                }
                let consumer = &mut *consumer;
                let mut on_match = |arguments: &[Rid]| {
                    self.emit_heads(
                        rule_info,
                        arguments,
                        head_level_filter,
                        monitor,
                        worker_index,
                        &mut *consumer,
                    )
                };
                self.match_chain(
                    store,
                    filters,
                    &mut context.arguments,
                    &plan.literals[1..],
                    &mut on_match,
                )
            };
            self.match_underlying(
                store,
                filters,
                &mut scratch,
                &pivot.atom_argument_indexes,
                pivot_atom,
                0,
                &mut on_confirmation,
            )?;
        }
        Ok(())
    }

    /// Join the underlying atoms of a negation other than the triggering
    /// one, firing `on_match` per confirmation assignment.
    #[allow(clippy::too_many_arguments)]
    fn match_underlying(
        &self,
        store: &dyn TupleStore,
        filters: &TupleFilters<'_>,
        arguments: &mut Vec<Rid>,
        atom_indexes: &[[usize; 3]],
        pivot_atom: usize,
        next: usize,
        on_match: &mut dyn FnMut(&[Rid]) -> Result<()>,
    ) -> Result<()> {
        let mut current = next;
        if current == pivot_atom {
            current += 1;
        }
        if current >= atom_indexes.len() {
            return on_match(arguments);
        }
        let indexes = atom_indexes[current];
        let filter = if current < pivot_atom {
            filters.underlying_before_pivot
        } else {
            filters.underlying_after_pivot
        };
        for (tuple_index, tuple, status) in
            store.matches(&Self::pattern_from_arguments(arguments, &indexes))
        {
            if !filter(tuple_index, status) {
                continue;
            }
            let mut saved = SmallVec::new();
            if Self::bind_atom(arguments, &indexes, &tuple, &mut saved) {
                self.match_underlying(
                    store,
                    filters,
                    arguments,
                    atom_indexes,
                    pivot_atom,
                    current + 1,
                    on_match,
                )?;
            }
            Self::restore(arguments, &saved);
        }
        Ok(())
    }

    /// The literal order used when a rule is evaluated in full: the main
    /// plan when a positive pivot exists, the first negation plan for
    /// pivotless rules, and nothing for fact rules.
    fn full_evaluation_steps(&self, rule_id: RuleId) -> Vec<LiteralId> {
        let info = self.rule(rule_id);
        if let Some(plan) = info.pivot_positive_plans.first() {
            plan.literals.clone()
        } else if let Some(plan) = info.pivot_negation_plans.first() {
            plan.literals.clone()
        } else {
            Vec::new()
        }
    }

    /// Evaluate a whole rule by joining its body from scratch; used for
    /// pivotless rules and for rules staged for addition or removal.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn evaluate_rule(
        &self,
        context: &mut ThreadContext,
        store: &dyn TupleStore,
        rule_id: RuleId,
        component_level: Option<usize>,
        filters: &TupleFilters<'_>,
        monitor: &dyn MaterializationMonitor,
        worker_index: usize,
        consumer: DerivationConsumer<'_>,
    ) -> Result<()> {
        let rule_info = self.rule(rule_id);
        if let Some(level) = component_level {
            if !rule_info.level_filter.contains(level) {
                return Ok(());
            }
        }
        let steps = self.full_evaluation_steps(rule_id);
        context.reset_from(self.terms.default_arguments());
        let consumer = &mut *consumer;
        let mut on_match = |arguments: &[Rid]| {
            self.emit_heads(
                rule_info,
                arguments,
                component_level,
                monitor,
                worker_index,
                &mut *consumer,
            )
        };
        self.match_chain(store, filters, &mut context.arguments, &steps, &mut on_match)
    }

    /// Head atoms whose pattern covers a ground tuple; the reverse lookup
    /// used by backward chaining.
    pub fn matching_head_atom_infos(&self, tuple: &Tuple) -> SmallVec<[HeadAtomId; 4]> {
        let mut heads: SmallVec<[HeadAtomId; 4]> = SmallVec::new();
        self.head_atom_index_main
            .for_each_matching(tuple, |head_id| heads.push(head_id));
        heads
    }

    /// Seed an arguments buffer from a head atom matched against a ground
    /// tuple. Fails when a head constant disagrees with the tuple.
    pub(crate) fn bind_head_atom(
        &self,
        head_id: HeadAtomId,
        tuple: &Tuple,
        arguments: &mut Vec<Rid>,
    ) -> bool {
        arguments.clear();
        arguments.extend_from_slice(self.terms.default_arguments());
        let head = self.head_atom(head_id);
        let mut saved = SmallVec::new();
        Self::bind_atom(arguments, &head.argument_indexes, tuple, &mut saved)
    }

    /// Whether a rule's body has any match with the given seed bindings;
    /// the supporting-facts check of backward chaining.
    pub(crate) fn exists_body_match(
        &self,
        store: &dyn TupleStore,
        rule_id: RuleId,
        arguments: &mut Vec<Rid>,
        filters: &TupleFilters<'_>,
    ) -> bool {
        let steps = self.full_evaluation_steps(rule_id);
        self.exists_steps(store, filters, arguments, &steps)
    }

    fn exists_steps(
        &self,
        store: &dyn TupleStore,
        filters: &TupleFilters<'_>,
        arguments: &mut Vec<Rid>,
        steps: &[LiteralId],
    ) -> bool {
        let Some((&step, rest)) = steps.split_first() else {
            return true;
        };
        let info = self.body_literal(step);
        match &info.literal {
            Literal::Atom(_) => {
                let indexes = info.atom_argument_indexes[0];
                let filter = match info.position {
                    LiteralPosition::BeforePivot => filters.positive_before_pivot,
                    _ => filters.positive_after_pivot,
                };
                for (tuple_index, tuple, status) in
                    store.matches(&Self::pattern_from_arguments(arguments, &indexes))
                {
                    if !filter(tuple_index, status) {
                        continue;
                    }
                    let mut saved = SmallVec::new();
                    let bound = Self::bind_atom(arguments, &indexes, &tuple, &mut saved);
                    let found = bound && self.exists_steps(store, filters, arguments, rest);
                    Self::restore(arguments, &saved);
                    if found {
                        return true;
                    }
                }
                false
            }
            Literal::Negation(_) => {
                !self.exists_conjunction(
                    store,
                    filters.negative,
                    arguments,
                    &info.atom_argument_indexes,
                ) && self.exists_steps(store, filters, arguments, rest)
            }
            Literal::Aggregate(_) => {
                self.exists_conjunction(
                    store,
                    filters.negative,
                    arguments,
                    &info.atom_argument_indexes,
                ) && self.exists_steps(store, filters, arguments, rest)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::Atom;
    use crate::monitor::NoopMonitor;
    use ferrite_db_core::{
        MemoryTupleTable, TUPLE_STATUS_EDB, TUPLE_STATUS_IDB, TUPLE_STATUS_IDB_MERGED,
    };

    fn var(name: &str) -> Term {
        Term::var(name)
    }

    fn constant(value: u64) -> Term {
        Term::constant(Rid(value))
    }

    fn atom(s: Term, p: u64, o: Term) -> Atom {
        Atom::new(s, constant(p), o)
    }

    /// p(X, Z) :- q(X, Y), r(Y, Z).
    fn join_rule() -> Rule {
        Rule::new(
            vec![atom(var("X"), 10, var("Z"))],
            vec![
                Literal::Atom(atom(var("X"), 11, var("Y"))),
                Literal::Atom(atom(var("Y"), 12, var("Z"))),
            ],
        )
    }

    fn idb_filter(_: TupleIndex, status: TupleStatus) -> bool {
        status & (TUPLE_STATUS_IDB | TUPLE_STATUS_IDB_MERGED) == TUPLE_STATUS_IDB
    }

    #[test]
    fn test_compile_builds_one_plan_per_pivot() {
        let mut index = RuleIndex::new();
        let rule = Rule::new(
            vec![atom(var("X"), 10, var("Y"))],
            vec![
                Literal::Atom(atom(var("X"), 11, var("Y"))),
                Literal::Atom(atom(var("Y"), 12, var("X"))),
                Literal::Negation(vec![atom(var("X"), 13, var("Y"))]),
            ],
        );
        assert!(index.add_rule(rule.clone()).unwrap());
        assert!(!index.add_rule(rule.clone()).unwrap());
        index.propagate_insertions();
        let rule_id = *index.rule_ids_by_rule.values().next().unwrap();
        let info = index.rule(rule_id);
        assert_eq!(info.pivot_positive_plans.len(), 2);
        assert_eq!(info.pivot_negation_plans.len(), 1);
        for plan in &info.pivot_positive_plans {
            assert_eq!(plan.literals.len(), 3);
        }
        assert!(info.has_negation);
        assert!(!info.is_pivotless());
    }

    #[test]
    fn test_identical_bodies_share_compiled_literals() {
        let mut index = RuleIndex::new();
        let first = Rule::new(
            vec![atom(var("X"), 20, var("Y"))],
            vec![Literal::Atom(atom(var("X"), 11, var("Y")))],
        );
        let second = Rule::new(
            vec![atom(var("X"), 21, var("Y"))],
            vec![Literal::Atom(atom(var("X"), 11, var("Y")))],
        );
        index.add_rule(first).unwrap();
        let after_first = index.body_literal_count();
        index.add_rule(second).unwrap();
        // The single-literal body compiles to the same pivot node.
        assert_eq!(index.body_literal_count(), after_first);
    }

    #[test]
    fn test_add_remove_rule_is_exact_inverse() {
        let mut index = RuleIndex::new();
        let rule = join_rule();
        index.add_rule(rule.clone()).unwrap();
        index.propagate_insertions();
        assert!(index.dependency_graph().node_count() > 0);
        assert!(index.dependency_graph().edge_count() > 0);
        assert_eq!(index.rule_count(), 1);

        assert!(index.remove_rule(&rule));
        index.propagate_deletions();
        assert_eq!(index.dependency_graph().node_count(), 0);
        assert_eq!(index.dependency_graph().edge_count(), 0);
        assert_eq!(index.body_literal_count(), 0);
        assert_eq!(index.rule_count(), 0);
        assert!(index.pivot_positive_index_main.is_empty());
        assert!(index.pivot_positive_index_incremental.is_empty());
        assert!(index.head_atom_index_main.is_empty());
    }

    #[test]
    fn test_remove_just_added_rule_discards_it() {
        let mut index = RuleIndex::new();
        let rule = join_rule();
        index.add_rule(rule.clone()).unwrap();
        assert!(index.has_just_added_rules());
        assert!(index.remove_rule(&rule));
        assert!(!index.has_just_added_rules());
        assert_eq!(index.rule_count(), 0);
    }

    #[test]
    fn test_apply_main_derives_join_result() {
        let mut index = RuleIndex::new();
        index.add_rule(join_rule()).unwrap();
        index.propagate_insertions();

        let store = MemoryTupleTable::new();
        let loaded = TUPLE_STATUS_EDB | TUPLE_STATUS_IDB;
        store.assert_fact([Rid(1), Rid(11), Rid(2)], loaded);
        store.assert_fact([Rid(2), Rid(12), Rid(3)], loaded);

        let mut context = ThreadContext::new();
        let filter = idb_filter;
        let filters = TupleFilters::uniform(&filter);
        let mut derived = Vec::new();
        let mut consumer = |_: &HeadAtomInfo, tuple: Tuple| {
            derived.push(tuple);
            Ok(())
        };
        index
            .apply_rules_to_positive_literal_main(
                &mut context,
                &store,
                &[Rid(1), Rid(11), Rid(2)],
                None,
                ComponentLevelFilter::AllComponents,
                &filters,
                &NoopMonitor,
                0,
                &mut consumer,
            )
            .unwrap();
        assert_eq!(derived, vec![[Rid(1), Rid(10), Rid(3)]]);

        // The second positive literal also pivots in the incremental index.
        derived.clear();
        let mut consumer = |_: &HeadAtomInfo, tuple: Tuple| {
            derived.push(tuple);
            Ok(())
        };
        index
            .apply_rules_to_positive_literal_incremental(
                &mut context,
                &store,
                &[Rid(2), Rid(12), Rid(3)],
                None,
                ComponentLevelFilter::AllComponents,
                &filters,
                &NoopMonitor,
                0,
                &mut consumer,
            )
            .unwrap();
        assert_eq!(derived, vec![[Rid(1), Rid(10), Rid(3)]]);
    }

    #[test]
    fn test_repeated_variable_requires_equal_bindings() {
        let mut index = RuleIndex::new();
        // loop(X) :- e(X, X).
        index
            .add_rule(Rule::new(
                vec![atom(var("X"), 10, var("X"))],
                vec![Literal::Atom(atom(var("X"), 11, var("X")))],
            ))
            .unwrap();
        index.propagate_insertions();

        let store = MemoryTupleTable::new();
        store.assert_fact([Rid(1), Rid(11), Rid(2)], TUPLE_STATUS_IDB);
        store.assert_fact([Rid(3), Rid(11), Rid(3)], TUPLE_STATUS_IDB);

        let mut context = ThreadContext::new();
        let filter = idb_filter;
        let filters = TupleFilters::uniform(&filter);
        let mut derived = Vec::new();
        let mut consumer = |_: &HeadAtomInfo, tuple: Tuple| {
            derived.push(tuple);
            Ok(())
        };
        for tuple in [[Rid(1), Rid(11), Rid(2)], [Rid(3), Rid(11), Rid(3)]] {
            index
                .apply_rules_to_positive_literal_main(
                    &mut context,
                    &store,
                    &tuple,
                    None,
                    ComponentLevelFilter::AllComponents,
                    &filters,
                    &NoopMonitor,
                    0,
                    &mut consumer,
                )
                .unwrap();
        }
        assert_eq!(derived, vec![[Rid(3), Rid(10), Rid(3)]]);
    }

    #[test]
    fn test_negation_blocks_derivation() {
        let mut index = RuleIndex::new();
        // p(X, Y) :- q(X, Y), NOT r(X, Y).
        index
            .add_rule(Rule::new(
                vec![atom(var("X"), 10, var("Y"))],
                vec![
                    Literal::Atom(atom(var("X"), 11, var("Y"))),
                    Literal::Negation(vec![atom(var("X"), 12, var("Y"))]),
                ],
            ))
            .unwrap();
        index.propagate_insertions();

        let store = MemoryTupleTable::new();
        store.assert_fact([Rid(1), Rid(11), Rid(2)], TUPLE_STATUS_IDB);
        store.assert_fact([Rid(3), Rid(11), Rid(4)], TUPLE_STATUS_IDB);
        store.assert_fact([Rid(3), Rid(12), Rid(4)], TUPLE_STATUS_IDB);

        let mut context = ThreadContext::new();
        let filter = idb_filter;
        let filters = TupleFilters::uniform(&filter);
        let mut derived = Vec::new();
        let mut consumer = |_: &HeadAtomInfo, tuple: Tuple| {
            derived.push(tuple);
            Ok(())
        };
        for tuple in [[Rid(1), Rid(11), Rid(2)], [Rid(3), Rid(11), Rid(4)]] {
            index
                .apply_rules_to_positive_literal_main(
                    &mut context,
                    &store,
                    &tuple,
                    None,
                    ComponentLevelFilter::AllComponents,
                    &filters,
                    &NoopMonitor,
                    0,
                    &mut consumer,
                )
                .unwrap();
        }
        assert_eq!(derived, vec![[Rid(1), Rid(10), Rid(2)]]);
    }

    #[test]
    fn test_matching_head_atom_infos_reverse_lookup() {
        let mut index = RuleIndex::new();
        index.add_rule(join_rule()).unwrap();
        index.propagate_insertions();
        let heads = index.matching_head_atom_infos(&[Rid(1), Rid(10), Rid(3)]);
        assert_eq!(heads.len(), 1);
        assert_eq!(index.head_atom(heads[0]).head_index(), 0);
        assert!(index
            .matching_head_atom_infos(&[Rid(1), Rid(11), Rid(3)])
            .is_empty());
    }

    #[test]
    fn test_component_levels_and_recursion_flags() {
        let mut index = RuleIndex::new();
        // path(X, Y) :- edge(X, Y).
        // path(X, Z) :- path(X, Y), edge(Y, Z).
        index
            .add_rule(Rule::new(
                vec![atom(var("X"), 10, var("Y"))],
                vec![Literal::Atom(atom(var("X"), 11, var("Y")))],
            ))
            .unwrap();
        index
            .add_rule(Rule::new(
                vec![atom(var("X"), 10, var("Z"))],
                vec![
                    Literal::Atom(atom(var("X"), 10, var("Y"))),
                    Literal::Atom(atom(var("Y"), 11, var("Z"))),
                ],
            ))
            .unwrap();
        index.propagate_insertions();

        assert!(index.is_stratified());
        let path_level = index.component_level(&[Rid(1), Rid(10), Rid(2)]);
        let edge_level = index.component_level(&[Rid(1), Rid(11), Rid(2)]);
        assert!(edge_level < path_level);
        assert!(index.has_recursive_rules(Some(path_level)));
        assert!(index.has_nonrecursive_rules(Some(path_level)));
        assert_eq!(index.first_rule_component_level(), Some(path_level));
        assert_eq!(index.max_component_level(), path_level);
    }

    #[test]
    fn test_unstratified_rule_reported() {
        let mut index = RuleIndex::new();
        // p(X) :- q(X), NOT p(X).
        let rule = Rule::new(
            vec![atom(var("X"), 10, constant(1))],
            vec![
                Literal::Atom(atom(var("X"), 11, constant(1))),
                Literal::Negation(vec![atom(var("X"), 10, constant(1))]),
            ],
        );
        index.add_rule(rule.clone()).unwrap();
        index.propagate_insertions();
        assert!(!index.is_stratified());
        let reported = index.unstratified_rules();
        assert_eq!(reported.len(), 1);
        assert_eq!(*reported[0], rule);
    }

    #[test]
    fn test_recompile_preserves_rules_and_levels() {
        let mut index = RuleIndex::new();
        index.add_rule(join_rule()).unwrap();
        index.propagate_insertions();
        let level_before = index.component_level(&[Rid(1), Rid(10), Rid(2)]);
        index.recompile_rules().unwrap();
        assert_eq!(index.rule_count(), 1);
        assert_eq!(index.component_level(&[Rid(1), Rid(10), Rid(2)]), level_before);
    }
}
