//! The dependency graph over literal constant patterns.
//!
//! One node exists per distinct constant pattern referenced by any active
//! rule (hash-consed); one directed edge per (polarity, body node, head
//! node) triple, reference-counted by the number of rules inducing it.
//! Strongly connected components are computed with an iterative Tarjan
//! variant, and each component is assigned a topological *level* that is
//! non-decreasing along edges. A component containing a negative
//! intra-component edge is unstratified.
//!
//! Nodes and edges live in slab arenas addressed by stable integer
//! handles; adjacency is kept as handle vectors. A node with no edges and
//! no head occurrences is unused and deleted immediately.

use crate::rule_index::{HeadAtomId, LiteralId};
use ferrite_db_core::{Rid, Tuple};
use hashbrown::HashMap;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// Stable handle of a dependency-graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Stable handle of a dependency-graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(u32);

impl EdgeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct Node {
    pattern: [Rid; 3],
    indexed_position: Option<usize>,
    outgoing: Vec<EdgeId>,
    incoming: Vec<EdgeId>,
    unifies_with: Vec<NodeId>,
    body_occurrences: FxHashMap<LiteralId, usize>,
    head_atoms: Vec<HeadAtomId>,
    component_index: usize,
    component_level: usize,
    dfs_index: usize,
    dfs_lowlink: usize,
    dfs_on_stack: bool,
}

impl Node {
    fn new(pattern: [Rid; 3]) -> Self {
        Node {
            pattern,
            indexed_position: indexed_position_for(&pattern),
            outgoing: Vec::new(),
            incoming: Vec::new(),
            unifies_with: Vec::new(),
            body_occurrences: FxHashMap::default(),
            head_atoms: Vec::new(),
            component_index: 0,
            component_level: 0,
            dfs_index: 0,
            dfs_lowlink: 0,
            dfs_on_stack: false,
        }
    }

    /// Whether the node's pattern can match the same ground tuples as
    /// another pattern: no position where both carry different constants.
    fn unifies_with_pattern(&self, other: &[Rid; 3]) -> bool {
        self.pattern.iter().zip(other.iter()).all(|(left, right)| {
            !left.is_valid() || !right.is_valid() || left == right
        })
    }

    /// Whether the node's pattern covers a ground tuple.
    fn covers(&self, tuple: &Tuple) -> bool {
        self.pattern
            .iter()
            .zip(tuple.iter())
            .all(|(position, value)| !position.is_valid() || position == value)
    }

    fn is_unused(&self) -> bool {
        self.outgoing.is_empty() && self.incoming.is_empty() && self.head_atoms.is_empty()
    }
}

/// The argument slot used for node lookup by constant: the object position
/// for `rdf:type` patterns with a bound object, otherwise the predicate
/// position when bound, otherwise the last bound position.
fn indexed_position_for(pattern: &[Rid; 3]) -> Option<usize> {
    if pattern[1] == Rid::RDF_TYPE && pattern[2].is_valid() {
        Some(2)
    } else if pattern[1].is_valid() {
        Some(1)
    } else {
        pattern.iter().rposition(|position| position.is_valid())
    }
}

#[derive(Debug)]
struct Edge {
    positive: bool,
    from: NodeId,
    to: NodeId,
    rule_count: usize,
}

/// Per-frame resumption state for the iterative Tarjan traversal.
#[derive(Debug, Clone, Copy)]
enum FrameResume {
    None,
    Edge,
    Unify,
}

#[derive(Debug)]
struct DfsFrame {
    node: NodeId,
    edge_cursor: usize,
    unify_cursor: usize,
    resume: FrameResume,
}

/// Dependency graph over literal patterns.
#[derive(Debug)]
pub struct DependencyGraph {
    nodes: Vec<Option<Node>>,
    free_nodes: Vec<u32>,
    node_by_pattern: HashMap<[Rid; 3], NodeId>,
    edges: Vec<Option<Edge>>,
    free_edges: Vec<u32>,
    edge_by_key: HashMap<(bool, NodeId, NodeId), EdgeId>,
    indexed_nodes: [HashMap<Rid, Vec<NodeId>>; 3],
    first_rule_component_level: Option<usize>,
    max_component_level: usize,
    unstratified: Vec<Vec<NodeId>>,
    was_updated: bool,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        DependencyGraph::new()
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        DependencyGraph {
            nodes: Vec::new(),
            free_nodes: Vec::new(),
            node_by_pattern: HashMap::new(),
            edges: Vec::new(),
            free_edges: Vec::new(),
            edge_by_key: HashMap::new(),
            indexed_nodes: [HashMap::new(), HashMap::new(), HashMap::new()],
            first_rule_component_level: None,
            max_component_level: 0,
            unstratified: Vec::new(),
            was_updated: false,
        }
    }

    fn node(&self, id: NodeId) -> &Node {
        match &self.nodes[id.index()] {
            Some(node) => node,
            None => unreachable!("dangling dependency-graph node handle"),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match &mut self.nodes[id.index()] {
            Some(node) => node,
            None => unreachable!("dangling dependency-graph node handle"),
        }
    }

    fn edge(&self, id: EdgeId) -> &Edge {
        match &self.edges[id.index()] {
            Some(edge) => edge,
            None => unreachable!("dangling dependency-graph edge handle"),
        }
    }

    fn live_nodes(&self) -> Vec<NodeId> {
        (0..self.nodes.len() as u32)
            .map(NodeId)
            .filter(|id| self.nodes[id.index()].is_some())
            .collect()
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.is_some()).count()
    }

    /// Number of live edges.
    pub fn edge_count(&self) -> usize {
        self.edges.iter().filter(|slot| slot.is_some()).count()
    }

    /// Hash-cons a node for a constant pattern.
    pub fn intern_node(&mut self, pattern: [Rid; 3]) -> NodeId {
        if let Some(&id) = self.node_by_pattern.get(&pattern) {
            return id;
        }
        let node = Node::new(pattern);
        let peers: Vec<NodeId> = self
            .live_nodes()
            .into_iter()
            .filter(|&peer| self.node(peer).unifies_with_pattern(&pattern))
            .collect();
        let id = match self.free_nodes.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId((self.nodes.len() - 1) as u32)
            }
        };
        for &peer in &peers {
            self.node_mut(peer).unifies_with.push(id);
        }
        self.node_mut(id).unifies_with = peers;
        if let Some(position) = self.node(id).indexed_position {
            self.indexed_nodes[position]
                .entry(pattern[position])
                .or_default()
                .push(id);
        }
        self.node_by_pattern.insert(pattern, id);
        id
    }

    fn delete_node(&mut self, id: NodeId) {
        let peers = std::mem::take(&mut self.node_mut(id).unifies_with);
        for peer in peers {
            self.node_mut(peer).unifies_with.retain(|&other| other != id);
        }
        let (pattern, indexed_position) = {
            let node = self.node(id);
            (node.pattern, node.indexed_position)
        };
        if let Some(position) = indexed_position {
            if let Some(list) = self.indexed_nodes[position].get_mut(&pattern[position]) {
                list.retain(|&other| other != id);
                if list.is_empty() {
                    self.indexed_nodes[position].remove(&pattern[position]);
                }
            }
        }
        self.node_by_pattern.remove(&pattern);
        self.nodes[id.index()] = None;
        self.free_nodes.push(id.0);
        self.was_updated = true;
    }

    /// Delete a node if it has no edges and no head occurrences.
    pub fn release_node_if_unused(&mut self, id: NodeId) {
        if self.node(id).is_unused() {
            self.delete_node(id);
        }
    }

    /// Register one more head-atom occurrence on a node.
    pub fn add_head_occurrence(&mut self, node: NodeId, head_atom: HeadAtomId) {
        if self.node(node).head_atoms.is_empty() {
            self.was_updated = true;
        }
        self.node_mut(node).head_atoms.push(head_atom);
    }

    /// Remove one head-atom occurrence from a node.
    pub fn remove_head_occurrence(&mut self, node: NodeId, head_atom: HeadAtomId) {
        let atoms = &mut self.node_mut(node).head_atoms;
        if let Some(position) = atoms.iter().position(|&existing| existing == head_atom) {
            atoms.remove(position);
        }
    }

    /// Register one more body occurrence of a compiled literal on a node.
    pub fn add_body_occurrence(&mut self, node: NodeId, literal: LiteralId) {
        *self
            .node_mut(node)
            .body_occurrences
            .entry(literal)
            .or_insert(0) += 1;
    }

    /// Remove one body occurrence of a compiled literal from a node.
    pub fn remove_body_occurrence(&mut self, node: NodeId, literal: LiteralId) {
        let occurrences = &mut self.node_mut(node).body_occurrences;
        if let Some(count) = occurrences.get_mut(&literal) {
            *count -= 1;
            if *count == 0 {
                occurrences.remove(&literal);
            }
        }
    }

    /// Add one rule's contribution to an edge, creating it if needed.
    pub fn add_edge(&mut self, positive: bool, from: NodeId, to: NodeId) {
        let key = (positive, from, to);
        let id = match self.edge_by_key.get(&key) {
            Some(&id) => id,
            None => {
                let edge = Edge {
                    positive,
                    from,
                    to,
                    rule_count: 0,
                };
                let id = match self.free_edges.pop() {
                    Some(slot) => {
                        self.edges[slot as usize] = Some(edge);
                        EdgeId(slot)
                    }
                    None => {
                        self.edges.push(Some(edge));
                        EdgeId((self.edges.len() - 1) as u32)
                    }
                };
                self.node_mut(from).outgoing.push(id);
                self.node_mut(to).incoming.push(id);
                self.edge_by_key.insert(key, id);
                id
            }
        };
        let edge = match &mut self.edges[id.index()] {
            Some(edge) => edge,
            None => unreachable!("dangling dependency-graph edge handle"),
        };
        edge.rule_count += 1;
        if edge.rule_count == 1 {
            self.was_updated = true;
        }
    }

    /// Remove one rule's contribution from an edge; the edge dies at count
    /// zero, and the body node is deleted when it becomes unused.
    pub fn remove_edge(&mut self, positive: bool, from: NodeId, to: NodeId) {
        let key = (positive, from, to);
        let id = self.edge_by_key[&key];
        let remaining = {
            let edge = match &mut self.edges[id.index()] {
                Some(edge) => edge,
                None => unreachable!("dangling dependency-graph edge handle"),
            };
            edge.rule_count -= 1;
            edge.rule_count
        };
        if remaining == 0 {
            self.was_updated = true;
            self.node_mut(from).outgoing.retain(|&other| other != id);
            self.node_mut(to).incoming.retain(|&other| other != id);
            self.edge_by_key.remove(&key);
            self.edges[id.index()] = None;
            self.free_edges.push(id.0);
            if from != to {
                self.release_node_if_unused(from);
            }
        }
    }

    /// Whether the last computation found no negative intra-component edge.
    pub fn is_stratified(&self) -> bool {
        self.unstratified.is_empty()
    }

    /// Head atoms of every unstratified component.
    pub fn unstratified_head_atoms(&self) -> Vec<Vec<HeadAtomId>> {
        self.unstratified
            .iter()
            .map(|component| {
                component
                    .iter()
                    .flat_map(|&node| self.node(node).head_atoms.iter().copied())
                    .collect()
            })
            .collect()
    }

    /// Lowest level containing a rule head, if any rules exist.
    pub fn first_rule_component_level(&self) -> Option<usize> {
        self.first_rule_component_level
    }

    /// Highest level assigned to any node.
    pub fn max_component_level(&self) -> usize {
        self.max_component_level
    }

    /// Level of a node after the last `update_components` call.
    pub fn node_level(&self, id: NodeId) -> usize {
        self.node(id).component_level
    }

    /// Component index of a node after the last `update_components` call.
    pub fn node_component(&self, id: NodeId) -> usize {
        self.node(id).component_index
    }

    /// Invoke `consumer` with the level of every compiled body literal
    /// occurrence.
    pub fn for_each_body_occurrence_level(&self, mut consumer: impl FnMut(LiteralId, usize)) {
        for slot in self.nodes.iter().flatten() {
            for &literal in slot.body_occurrences.keys() {
                consumer(literal, slot.component_level);
            }
        }
    }

    /// Invoke `consumer` with the level of every head-atom occurrence.
    pub fn for_each_head_occurrence_level(&self, mut consumer: impl FnMut(HeadAtomId, usize)) {
        for slot in self.nodes.iter().flatten() {
            for &head_atom in &slot.head_atoms {
                consumer(head_atom, slot.component_level);
            }
        }
    }

    /// Level of the node whose pattern covers a ground tuple, via the
    /// indexed-position structure; 0 when no node matches.
    pub fn component_level(&self, tuple: &Tuple) -> usize {
        for position in 0..3 {
            if let Some(candidates) = self.indexed_nodes[position].get(&tuple[position]) {
                for &id in candidates {
                    if self.node(id).covers(tuple) {
                        return self.node(id).component_level;
                    }
                }
            }
        }
        0
    }

    fn push_dfs_frame(
        &mut self,
        dfs_stack: &mut Vec<DfsFrame>,
        exploration: &mut Vec<NodeId>,
        next_dfs_index: &mut usize,
        node: NodeId,
    ) {
        {
            let entry = self.node_mut(node);
            entry.dfs_index = *next_dfs_index;
            entry.dfs_lowlink = *next_dfs_index;
            entry.dfs_on_stack = true;
        }
        *next_dfs_index += 1;
        exploration.push(node);
        dfs_stack.push(DfsFrame {
            node,
            edge_cursor: 0,
            unify_cursor: 0,
            resume: FrameResume::None,
        });
    }

    /// Recompute components and levels if the topology changed since the
    /// last computation. Returns whether any work was done.
    pub fn update_components(&mut self) -> bool {
        if !self.was_updated {
            return false;
        }
        // Tarjan's algorithm with an explicit stack of resumption frames:
        // a recursive version would overflow the call stack on large rule
        // sets.
        let live = self.live_nodes();
        for &id in &live {
            let node = self.node_mut(id);
            node.component_index = 0;
            node.dfs_index = 0;
            node.dfs_lowlink = 0;
            node.dfs_on_stack = false;
        }
        let mut next_component = 0usize;
        let mut next_dfs_index = 1usize;
        let mut dfs_stack: Vec<DfsFrame> = Vec::new();
        let mut exploration: Vec<NodeId> = Vec::new();
        let mut sorted: Vec<NodeId> = Vec::with_capacity(live.len());
        for &root in &live {
            if self.node(root).dfs_index != 0 {
                continue;
            }
            self.push_dfs_frame(&mut dfs_stack, &mut exploration, &mut next_dfs_index, root);
            while let Some(frame_index) = dfs_stack.len().checked_sub(1) {
                let current = dfs_stack[frame_index].node;
                let mut descend: Option<NodeId> = None;
                // Regular dependency edges.
                while descend.is_none() {
                    let cursor = dfs_stack[frame_index].edge_cursor;
                    let Some(edge_id) = self.node(current).outgoing.get(cursor).copied() else {
                        break;
                    };
                    let to = self.edge(edge_id).to;
                    let (to_index, to_on_stack) = {
                        let target = self.node(to);
                        (target.dfs_index, target.dfs_on_stack)
                    };
                    if to_index == 0 {
                        dfs_stack[frame_index].resume = FrameResume::Edge;
                        descend = Some(to);
                    } else {
                        if to_on_stack {
                            let node = self.node_mut(current);
                            node.dfs_lowlink = node.dfs_lowlink.min(to_index);
                        }
                        dfs_stack[frame_index].edge_cursor += 1;
                    }
                }
                // Unifies-with peers: same-component membership, not true
                // dependencies, so they are traversed here but ignored by
                // the level assignment below.
                while descend.is_none() {
                    let cursor = dfs_stack[frame_index].unify_cursor;
                    let Some(peer) = self.node(current).unifies_with.get(cursor).copied() else {
                        break;
                    };
                    let (peer_index, peer_on_stack) = {
                        let target = self.node(peer);
                        (target.dfs_index, target.dfs_on_stack)
                    };
                    if peer_index == 0 {
                        dfs_stack[frame_index].resume = FrameResume::Unify;
                        descend = Some(peer);
                    } else {
                        if peer_on_stack {
                            let node = self.node_mut(current);
                            node.dfs_lowlink = node.dfs_lowlink.min(peer_index);
                        }
                        dfs_stack[frame_index].unify_cursor += 1;
                    }
                }
                if let Some(child) = descend {
                    self.push_dfs_frame(
                        &mut dfs_stack,
                        &mut exploration,
                        &mut next_dfs_index,
                        child,
                    );
                    continue;
                }
                // All successors explored: emit an SCC if this is its root.
                let (dfs_index, dfs_lowlink) = {
                    let node = self.node(current);
                    (node.dfs_index, node.dfs_lowlink)
                };
                if dfs_index == dfs_lowlink {
                    while let Some(member) = exploration.pop() {
                        {
                            let node = self.node_mut(member);
                            node.dfs_on_stack = false;
                            node.component_index = next_component;
                        }
                        sorted.push(member);
                        if member == current {
                            break;
                        }
                    }
                    next_component += 1;
                }
                dfs_stack.pop();
                if let Some(parent_index) = dfs_stack.len().checked_sub(1) {
                    let parent = dfs_stack[parent_index].node;
                    let child_lowlink = self.node(current).dfs_lowlink;
                    {
                        let node = self.node_mut(parent);
                        node.dfs_lowlink = node.dfs_lowlink.min(child_lowlink);
                    }
                    match dfs_stack[parent_index].resume {
                        FrameResume::Edge => dfs_stack[parent_index].edge_cursor += 1,
                        FrameResume::Unify => dfs_stack[parent_index].unify_cursor += 1,
                        FrameResume::None => {}
                    }
                }
            }
        }
        // Assign levels by walking nodes in reverse finish order and
        // pushing `level + 1` across component-crossing edges; a negative
        // intra-component edge makes that component unstratified.
        self.max_component_level = 0;
        let mut unstratified_indexes: BTreeSet<usize> = BTreeSet::new();
        let mut levels_by_component = vec![0usize; next_component];
        for &from_id in sorted.iter().rev() {
            let from_component = self.node(from_id).component_index;
            let from_level = levels_by_component[from_component];
            self.node_mut(from_id).component_level = from_level;
            let outgoing = self.node(from_id).outgoing.clone();
            for edge_id in outgoing {
                let (positive, to) = {
                    let edge = self.edge(edge_id);
                    (edge.positive, edge.to)
                };
                let to_component = self.node(to).component_index;
                if from_component > to_component {
                    levels_by_component[to_component] =
                        levels_by_component[to_component].max(from_level + 1);
                }
                if !positive && from_component == to_component {
                    unstratified_indexes.insert(from_component);
                }
            }
            // Unifies-with peers share the component, so no level push is
            // needed for them.
            if from_level > self.max_component_level {
                self.max_component_level = from_level;
            }
        }
        self.first_rule_component_level = None;
        for &id in &sorted {
            let node = self.node(id);
            if !node.head_atoms.is_empty() {
                let level = node.component_level;
                self.first_rule_component_level =
                    Some(self.first_rule_component_level.map_or(level, |first| first.min(level)));
            }
        }
        self.unstratified.clear();
        if !unstratified_indexes.is_empty() {
            let mut by_component: FxHashMap<usize, Vec<NodeId>> = FxHashMap::default();
            for &id in sorted.iter().rev() {
                by_component
                    .entry(self.node(id).component_index)
                    .or_default()
                    .push(id);
            }
            for component in unstratified_indexes {
                self.unstratified
                    .push(by_component.remove(&component).unwrap_or_default());
            }
        }
        tracing::debug!(
            components = next_component,
            max_level = self.max_component_level,
            unstratified = self.unstratified.len(),
            "recomputed dependency-graph components"
        );
        self.was_updated = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule_index::{HeadAtomId, LiteralId};

    fn pattern(p: u64) -> [Rid; 3] {
        [Rid::INVALID, Rid(p), Rid::INVALID]
    }

    #[test]
    fn test_intern_is_hash_consed() {
        let mut graph = DependencyGraph::new();
        let a = graph.intern_node(pattern(1));
        let b = graph.intern_node(pattern(1));
        assert_eq!(a, b);
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_mutual_recursion_shares_component_and_level() {
        // s :- t and t :- s.
        let mut graph = DependencyGraph::new();
        let s = graph.intern_node(pattern(1));
        let t = graph.intern_node(pattern(2));
        graph.add_head_occurrence(s, HeadAtomId::new(0));
        graph.add_head_occurrence(t, HeadAtomId::new(1));
        graph.add_edge(true, t, s);
        graph.add_edge(true, s, t);
        assert!(graph.update_components());
        assert!(!graph.update_components());
        assert_eq!(graph.node_component(s), graph.node_component(t));
        assert_eq!(graph.node_level(s), graph.node_level(t));
        assert!(graph.is_stratified());
    }

    #[test]
    fn test_level_monotone_along_edges() {
        // p :- q and r :- p: q at level 0, p above it, r above p.
        let mut graph = DependencyGraph::new();
        let q = graph.intern_node(pattern(1));
        let p = graph.intern_node(pattern(2));
        let r = graph.intern_node(pattern(3));
        graph.add_head_occurrence(p, HeadAtomId::new(0));
        graph.add_head_occurrence(r, HeadAtomId::new(1));
        graph.add_edge(true, q, p);
        graph.add_edge(true, p, r);
        graph.update_components();
        assert!(graph.node_level(q) < graph.node_level(p));
        assert!(graph.node_level(p) < graph.node_level(r));
        assert_eq!(graph.node_level(q), 0);
        assert_eq!(graph.max_component_level(), graph.node_level(r));
        assert_eq!(
            graph.first_rule_component_level(),
            Some(graph.node_level(p))
        );
    }

    #[test]
    fn test_negative_self_loop_is_unstratified() {
        // p :- NOT p.
        let mut graph = DependencyGraph::new();
        let p = graph.intern_node(pattern(1));
        graph.add_head_occurrence(p, HeadAtomId::new(0));
        graph.add_edge(false, p, p);
        graph.update_components();
        assert!(!graph.is_stratified());
        assert_eq!(graph.unstratified_head_atoms().len(), 1);
        assert_eq!(graph.unstratified_head_atoms()[0], vec![HeadAtomId::new(0)]);
    }

    #[test]
    fn test_negation_across_components_is_stratified() {
        // p :- NOT q with no cycle.
        let mut graph = DependencyGraph::new();
        let q = graph.intern_node(pattern(1));
        let p = graph.intern_node(pattern(2));
        graph.add_head_occurrence(p, HeadAtomId::new(0));
        graph.add_edge(false, q, p);
        graph.update_components();
        assert!(graph.is_stratified());
        assert!(graph.node_level(q) < graph.node_level(p));
    }

    #[test]
    fn test_unifying_patterns_share_component() {
        // A bound-object pattern and an open-object pattern over the same
        // predicate can produce/consume the same ground facts.
        let mut graph = DependencyGraph::new();
        let open = graph.intern_node([Rid::INVALID, Rid(5), Rid::INVALID]);
        let bound = graph.intern_node([Rid::INVALID, Rid(5), Rid(9)]);
        let other = graph.intern_node(pattern(6));
        graph.add_head_occurrence(open, HeadAtomId::new(0));
        graph.add_edge(true, other, open);
        graph.update_components();
        assert_eq!(graph.node_component(open), graph.node_component(bound));
        assert_ne!(graph.node_component(open), graph.node_component(other));
    }

    #[test]
    fn test_add_remove_edge_restores_graph() {
        let mut graph = DependencyGraph::new();
        let q = graph.intern_node(pattern(1));
        let p = graph.intern_node(pattern(2));
        graph.add_head_occurrence(p, HeadAtomId::new(0));
        graph.add_edge(true, q, p);
        graph.add_body_occurrence(q, LiteralId::new(0));
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);

        graph.remove_body_occurrence(q, LiteralId::new(0));
        graph.remove_edge(true, q, p);
        assert_eq!(graph.edge_count(), 0);
        // The body node became unused and was deleted with its last edge.
        assert_eq!(graph.node_count(), 1);
        graph.remove_head_occurrence(p, HeadAtomId::new(0));
        graph.release_node_if_unused(p);
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn test_component_level_lookup_by_tuple() {
        let mut graph = DependencyGraph::new();
        let q = graph.intern_node(pattern(1));
        let p = graph.intern_node(pattern(2));
        graph.add_head_occurrence(p, HeadAtomId::new(0));
        graph.add_edge(true, q, p);
        graph.update_components();
        let p_level = graph.node_level(p);
        assert_eq!(graph.component_level(&[Rid(7), Rid(2), Rid(8)]), p_level);
        assert_eq!(graph.component_level(&[Rid(7), Rid(1), Rid(8)]), 0);
        // Predicates never mentioned by any rule have no level constraint.
        assert_eq!(graph.component_level(&[Rid(7), Rid(99), Rid(8)]), 0);
    }
}
