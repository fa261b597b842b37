//! The rule and literal model.
//!
//! Rules are immutable once constructed and shared by reference
//! ([`RuleRef`]); equality is structural. A rule's head is an ordered list
//! of atoms; its body is an ordered list of literals: positive atoms,
//! negated conjunctions, and aggregates over an underlying conjunction.
//!
//! The model is pure data. Compilation into evaluation plans lives in the
//! rule index; this module only supplies the structural validation that
//! runs before any index mutation.

use crate::error::{ReasonerError, Result};
use ferrite_db_core::Rid;
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A term in an atom: a named variable or an interned constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Term {
    Variable(Arc<str>),
    Constant(Rid),
}

impl Term {
    /// Create a variable term
    pub fn var(name: &str) -> Self {
        Term::Variable(Arc::from(name))
    }

    /// Create a constant term
    pub fn constant(rid: Rid) -> Self {
        Term::Constant(rid)
    }

    /// Whether this term is a variable
    pub fn is_variable(&self) -> bool {
        matches!(self, Term::Variable(_))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Variable(name) => write!(f, "?{name}"),
            Term::Constant(rid) => write!(f, "{rid}"),
        }
    }
}

/// A triple pattern: subject, predicate, object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Atom {
    pub terms: [Term; 3],
}

impl Atom {
    pub fn new(subject: Term, predicate: Term, object: Term) -> Self {
        Atom {
            terms: [subject, predicate, object],
        }
    }

    /// Variables of this atom, in position order, with duplicates.
    pub fn variables(&self) -> impl Iterator<Item = &Arc<str>> {
        self.terms.iter().filter_map(|term| match term {
            Term::Variable(name) => Some(name),
            Term::Constant(_) => None,
        })
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.terms[0], self.terms[1], self.terms[2])
    }
}

/// A body literal: a positive atom, a negated conjunction, or an aggregate
/// over an underlying conjunction.
///
/// Aggregates are modeled only to the extent the rule machinery needs:
/// they contribute negative dependency edges and stratification
/// constraints, and evaluate as existence of the underlying conjunction.
/// Aggregate functions themselves belong to the query engine, not to this
/// subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    Atom(Atom),
    Negation(Vec<Atom>),
    Aggregate(Vec<Atom>),
}

impl Literal {
    /// The atoms underlying this literal.
    pub fn atoms(&self) -> &[Atom] {
        match self {
            Literal::Atom(atom) => std::slice::from_ref(atom),
            Literal::Negation(atoms) | Literal::Aggregate(atoms) => atoms,
        }
    }

    /// Whether this literal is a positive atom.
    pub fn is_positive(&self) -> bool {
        matches!(self, Literal::Atom(_))
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Atom(atom) => write!(f, "{atom}"),
            Literal::Negation(atoms) => {
                write!(f, "NOT {{")?;
                for (index, atom) in atoms.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{atom}")?;
                }
                write!(f, "}}")
            }
            Literal::Aggregate(atoms) => {
                write!(f, "AGGREGATE {{")?;
                for (index, atom) in atoms.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{atom}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// A rule: `head1, ..., headM :- body1, ..., bodyN .`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub head: Vec<Atom>,
    pub body: Vec<Literal>,
}

/// Shared, immutable rule handle.
pub type RuleRef = Arc<Rule>;

impl Rule {
    pub fn new(head: Vec<Atom>, body: Vec<Literal>) -> Self {
        Rule { head, body }
    }

    /// Structural validation, performed at `add_rule` time before any
    /// graph or index mutation.
    ///
    /// A rule must have at least one head atom, and every head variable
    /// must be bound by a positive body atom. Variables occurring only
    /// inside a negation or aggregate are existential and need no outside
    /// binding.
    pub fn validate(&self) -> Result<()> {
        if self.head.is_empty() {
            return Err(ReasonerError::rule_compilation(
                self.to_string(),
                "the head is empty",
            ));
        }
        let mut bound: HashSet<&Arc<str>> = HashSet::new();
        for literal in &self.body {
            if let Literal::Atom(atom) = literal {
                bound.extend(atom.variables());
            }
        }
        for atom in &self.head {
            for variable in atom.variables() {
                if !bound.contains(variable) {
                    return Err(ReasonerError::rule_compilation(
                        self.to_string(),
                        format!("head variable ?{variable} is not bound by a positive body atom"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Whether the body contains a negation literal.
    pub fn has_negation(&self) -> bool {
        self.body
            .iter()
            .any(|literal| matches!(literal, Literal::Negation(_)))
    }

    /// Whether the body contains an aggregate literal.
    pub fn has_aggregation(&self) -> bool {
        self.body
            .iter()
            .any(|literal| matches!(literal, Literal::Aggregate(_)))
    }

    /// Whether the body has no positive atom to pivot on.
    pub fn is_pivotless(&self) -> bool {
        !self.body.iter().any(Literal::is_positive)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, atom) in self.head.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{atom}")?;
        }
        write!(f, " :- ")?;
        for (index, literal) in self.body.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{literal}")?;
        }
        write!(f, " .")
    }
}

/// Maps each distinct term of the rule set to a stable index in a shared
/// arguments buffer.
///
/// The buffer's *default* contents hold each constant at its index and the
/// invalid resource at variable indexes; evaluation clones the default
/// buffer and fills variable slots as literals bind.
#[derive(Debug, Default)]
pub struct TermArray {
    positions: HashMap<Term, usize>,
    default_arguments: Vec<Rid>,
}

impl TermArray {
    pub fn new() -> Self {
        TermArray::default()
    }

    /// Intern a term, returning its argument-buffer index.
    pub fn intern(&mut self, term: &Term) -> usize {
        if let Some(&position) = self.positions.get(term) {
            return position;
        }
        let position = self.default_arguments.len();
        self.positions.insert(term.clone(), position);
        self.default_arguments.push(match term {
            Term::Variable(_) => Rid::INVALID,
            Term::Constant(rid) => *rid,
        });
        position
    }

    /// Intern all three terms of an atom.
    pub fn intern_atom(&mut self, atom: &Atom) -> [usize; 3] {
        [
            self.intern(&atom.terms[0]),
            self.intern(&atom.terms[1]),
            self.intern(&atom.terms[2]),
        ]
    }

    /// The index of an already-interned term.
    pub fn position(&self, term: &Term) -> usize {
        self.positions[term]
    }

    /// The default arguments buffer: constants at their indexes, invalid
    /// markers at variable indexes.
    pub fn default_arguments(&self) -> &[Rid] {
        &self.default_arguments
    }

    /// Number of interned terms.
    pub fn len(&self) -> usize {
        self.default_arguments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.default_arguments.is_empty()
    }
}
