//! # Ferrite DB Core
//!
//! Collaborator-side types consumed by the Ferrite DB reasoner.
//!
//! This crate provides:
//! - `Rid`: dictionary-interned resource identifiers
//! - `Tuple`, `TupleIndex`, `TupleStatus`: facts and their status bits
//! - `TupleStore`: the narrow storage interface the reasoner evaluates against
//! - `MemoryTupleTable`: a hash-indexed in-memory tuple table
//!
//! ## Design Principles
//!
//! 1. **Narrow seam**: the reasoner only ever sees this crate's traits; it
//!    never owns tuple storage or interprets lexical forms.
//! 2. **Idempotent insertion**: `add_tuple` has add-if-absent semantics, so
//!    concurrent duplicate derivations resolve here, not in the reasoner.
//! 3. **Shared references**: the table uses interior locking so evaluation
//!    workers can share a plain `&` reference.

pub mod error;
pub mod rid;
pub mod store;
pub mod tuple;

pub use error::{Error, Result};
pub use rid::Rid;
pub use store::{MemoryTupleTable, TupleStore};
pub use tuple::{
    Tuple, TupleIndex, TuplePattern, TupleStatus, TUPLE_STATUS_COMPLETE, TUPLE_STATUS_EDB,
    TUPLE_STATUS_EDB_DEL, TUPLE_STATUS_EDB_INS, TUPLE_STATUS_IDB, TUPLE_STATUS_IDB_MERGED,
    TUPLE_STATUS_INVALID,
};
