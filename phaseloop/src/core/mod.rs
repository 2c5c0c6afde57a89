//! Deterministic, pure logic of the loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod code_blocks;
pub mod invariants;
pub mod session;
pub mod status;
pub mod types;
