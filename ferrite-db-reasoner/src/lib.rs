//! # Ferrite DB Reasoner
//!
//! Incremental Datalog materialization engine for Ferrite DB.
//!
//! This crate provides:
//! - The rule and literal model with structural sharing
//! - A dependency graph over literal patterns: SCCs, component levels,
//!   and stratification analysis
//! - A rule index compiling rules into pivoted evaluation plans, indexed
//!   by literal binding pattern for both full and incremental evaluation
//! - The datalog engine: parallel seminaive materialization by component
//!   levels, and delete-and-rederive incremental maintenance with a
//!   backward-chaining provability check
//! - Pluggable monitors for observing every phase
//!
//! ## Key Types
//!
//! - [`DatalogEngine`]: worker pool, rule administration, entry points
//! - [`Rule`], [`Literal`], [`Term`]: the immutable rule model
//! - [`RuleIndex`]: compiled rules, plans, and dispatch indices
//! - [`MaterializationMonitor`] / [`IncrementalMonitor`]: observers
//!
//! ## Example
//!
//! ```ignore
//! use ferrite_db_core::MemoryTupleTable;
//! use ferrite_db_reasoner::{DatalogEngine, NoopMonitor, Rule};
//!
//! let engine = DatalogEngine::new(store);
//! engine.add_rule(rule)?;
//! engine.materialize(&NoopMonitor)?;
//!
//! // Later: schedule EDB changes on the store, then maintain.
//! engine.update_incrementally(&NoopMonitor)?;
//! ```

pub mod dependency;
pub mod engine;
pub mod equality;
pub mod error;
pub mod incremental;
pub mod logic;
pub mod materialize;
pub mod monitor;
pub mod pattern_index;
pub mod rule_index;
pub mod snapshot;
pub mod state;

// Re-exports for convenience
pub use dependency::DependencyGraph;
pub use engine::DatalogEngine;
pub use equality::{EqualityManager, IdentityEquality};
pub use error::{ReasonerError, Result};
pub use logic::{Atom, Literal, Rule, RuleRef, Term, TermArray};
pub use monitor::{IncrementalMonitor, MaterializationMonitor, NoopMonitor};
pub use rule_index::{
    ComponentLevelFilter, HeadAtomId, HeadAtomInfo, LiteralPosition, PivotPolicy, RuleIndex,
    ThreadContext, TupleFilters,
};
pub use snapshot::{RuleIndexSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use state::IncrementalReasoningState;
