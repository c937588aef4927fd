//! Error types for policy model operations.
//!
//! Every variant is a request-level failure: it is reported back to the
//! caller and never leaves a model partially mutated.

use thiserror::Error;

/// Result type for policy operations.
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Errors produced while parsing, mutating or evaluating a policy model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// The model text could not be parsed.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// A command referenced a section/type pair the model does not define.
    #[error("model has no assertion {ptype} in section {sec}")]
    AssertionNotFound {
        /// Section key (`p`, `g`, ...).
        sec: String,
        /// Rule type within the section (`p`, `g2`, ...).
        ptype: String,
    },

    /// A rule to update was not present.
    #[error("rule {0:?} does not exist")]
    RuleNotFound(Vec<String>),

    /// An update would leave two identical rows in one assertion.
    #[error("rule {0:?} already exists")]
    DuplicateRule(Vec<String>),

    /// Old and new rule lists of an update differ in length.
    #[error("update has {old} old rules but {new} new rules")]
    UpdateLengthMismatch {
        /// Number of rules to replace.
        old: usize,
        /// Number of replacement rules.
        new: usize,
    },

    /// A grouping row has fewer fields than the role definition requires.
    #[error("malformed grouping row {row:?}: role definition needs {expected} fields")]
    MalformedGroupingRow {
        /// The offending row.
        row: Vec<String>,
        /// Operand count of the role definition.
        expected: usize,
    },

    /// Request parameters do not match the request definition.
    #[error("request has {actual} values but the request definition has {expected}")]
    RequestArity {
        /// Tokens in the request definition.
        expected: usize,
        /// Parameters supplied.
        actual: usize,
    },

    /// A policy row does not match the policy definition.
    #[error("policy row {row:?} does not match the {expected} fields of the policy definition")]
    PolicyArity {
        /// The offending row.
        row: Vec<String>,
        /// Tokens in the policy definition.
        expected: usize,
    },

    /// The policy effect expression is not supported.
    #[error("unsupported policy effect: {0}")]
    UnsupportedEffect(String),

    /// The matcher expression could not be parsed or evaluated.
    #[error("matcher error: {0}")]
    Matcher(String),
}
