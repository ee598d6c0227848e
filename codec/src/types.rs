//! Codec implementations for common types.

pub mod primitives;
pub mod string;
