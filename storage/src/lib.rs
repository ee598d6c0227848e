//! Persist a spatially-indexed trail of position fixes on a raw block device.
//!
//! # Status
//!
//! `quadtrail-storage` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

pub mod fix;
pub mod trace;
