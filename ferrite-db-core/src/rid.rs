//! Dictionary-interned resource identifiers.
//!
//! The reasoner works exclusively on integer identifiers produced by an
//! external dictionary; lexical forms (IRIs, literals) never cross this
//! boundary. Identifier `0` is reserved as the invalid/wildcard marker.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A dictionary-interned resource identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Rid(pub u64);

impl Rid {
    /// The invalid resource, also used as the wildcard marker in patterns.
    pub const INVALID: Rid = Rid(0);

    /// The identifier conventionally assigned to `rdf:type` by the
    /// dictionary. Patterns with this predicate get object-position
    /// indexing preference in the dependency graph.
    pub const RDF_TYPE: Rid = Rid(1);

    /// Whether this is a real resource (not the invalid marker).
    pub fn is_valid(self) -> bool {
        self != Rid::INVALID
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "r{}", self.0)
        } else {
            write!(f, "?")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_is_not_valid() {
        assert!(!Rid::INVALID.is_valid());
        assert!(Rid(7).is_valid());
    }

    #[test]
    fn test_display() {
        assert_eq!(Rid(42).to_string(), "r42");
        assert_eq!(Rid::INVALID.to_string(), "?");
    }
}
