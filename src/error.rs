// Crate-wide error type. Mirrors the shape of a typical small-store error
// enum: one variant per recovery boundary, not per call site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Truncate a byte slice to its first 100 characters for log snippets,
/// per the parse-error policy in the spec (lossy on invalid utf8).
pub fn snippet(input: &[u8]) -> String {
    let s = String::from_utf8_lossy(input);
    s.chars().take(100).collect()
}
