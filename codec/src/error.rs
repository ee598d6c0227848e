//! Error types for codec operations

use thiserror::Error;

/// Error type for codec operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("token overflow: {len} bytes at offset {offset} exceed capacity {capacity}")]
    Overflow {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("offset out of bounds: {0}")]
    OutOfBounds(usize),
    #[error("unterminated token at offset {0}")]
    Unterminated(usize),
    #[error("empty token")]
    EmptyToken,
    #[error("invalid digit: {0:#04x}")]
    InvalidDigit(u8),
    #[error("number out of range")]
    NumberOutOfRange,
    #[error("invalid token")]
    InvalidToken,
    #[error("invalid length: expected {expected}, found {found}")]
    InvalidLength { expected: usize, found: usize },
}
