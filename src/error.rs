//! Errors produced while locating and applying patches

use thiserror::Error;

/// Result type used throughout the patching engine
pub type Result<T, E = PatchError> = std::result::Result<T, E>;

/// Failure at a single patch site. None of these are retried, they all mean
/// the loaded binary does not look the way the patch site expects.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    /// Signature text could not be compiled
    #[error("Malformed signature token {token:?}: {reason}")]
    MalformedSignature { token: String, reason: &'static str },

    /// Required pattern was not present in the search range
    #[error("Pattern {signature} was not found")]
    NoMatch { signature: String },

    /// Pattern expected to be unique matched more than once
    #[error("Pattern {signature} matched {count} times but was expected to be unique")]
    AmbiguousMatch { signature: String, count: usize },

    /// Pattern matched a different number of times than the call site expects
    #[error("Pattern {signature} matched {found} times, expected {expected}")]
    WrongMatchCount {
        signature: String,
        expected: usize,
        found: usize,
    },

    /// Relative jump/call target cannot be encoded in a rel32 operand
    #[error("Redirect from {address:#x} to {target:#x} does not fit a rel32 displacement")]
    DisplacementOutOfRange { address: usize, target: usize },

    /// The OS refused to query or change memory protection
    #[error("Failed to change protection of {length} bytes @ {address:#x} (error: {code:#x})")]
    ProtectionChangeFailed {
        address: usize,
        length: usize,
        code: u32,
    },

    /// The loaded module header could not be parsed
    #[error("Invalid module image: {0}")]
    InvalidImage(String),

    /// A search range with no bytes in it
    #[error("Search range is empty")]
    EmptyRange,
}
