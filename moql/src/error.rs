use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    /// The spec used an operator this crate does not evaluate. Matching with
    /// an unknown operator would silently change the query's meaning, so this
    /// is an error rather than a non-match.
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("malformed {op} condition: {reason}")]
    Malformed { op: &'static str, reason: &'static str },
}
