//! Byte-level storage: engine trait, in-memory engine, order-preserving
//! key encoding, and the versioned snapshot layer.

pub mod engine;
pub mod keycode;
pub mod memory;
pub mod mvcc;
