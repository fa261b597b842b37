//! Error types for ferrite-db-reasoner

use thiserror::Error;

/// Result type alias using our ReasonerError
pub type Result<T> = std::result::Result<T, ReasonerError>;

/// Reasoner error type
#[derive(Error, Debug)]
pub enum ReasonerError {
    /// A rule is structurally invalid; raised before any index mutation
    #[error("Cannot compile rule `{rule}`: {reason}")]
    RuleCompilation { rule: String, reason: String },

    /// A hash table or buffer cannot grow any further
    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    /// The program contains a cycle through negation or aggregation
    #[error("The program is not stratified; these rules participate in cycles through negation or aggregation: {}", rules.join("; "))]
    NotStratified { rules: Vec<String> },

    /// The rules derived a fact the store does not contain; the EDB was
    /// mutated outside the scheduled-change queues
    #[error("Error in incremental reasoning: the rules do not seem to match the current data ({0})")]
    DataMismatch(String),

    /// The requested operation is not available for this rule set
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// One or more worker threads failed
    #[error("Error(s) were encountered on worker thread(s): {}", causes.join("; "))]
    Worker { causes: Vec<String> },

    /// Snapshot serialization or deserialization failed
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// An error surfaced by the tuple store
    #[error(transparent)]
    Store(#[from] ferrite_db_core::Error),
}

impl ReasonerError {
    /// Create a rule-compilation error
    pub fn rule_compilation(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        ReasonerError::RuleCompilation {
            rule: rule.into(),
            reason: reason.into(),
        }
    }

    /// Create a capacity error
    pub fn capacity(msg: impl Into<String>) -> Self {
        ReasonerError::Capacity(msg.into())
    }

    /// Create a data-mismatch error
    pub fn data_mismatch(msg: impl Into<String>) -> Self {
        ReasonerError::DataMismatch(msg.into())
    }

    /// Create an unsupported-operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        ReasonerError::Unsupported(msg.into())
    }
}
