//! Deterministic, pure logic for coordination and review aggregation.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod aggregate;
pub mod finding;
pub mod heuristics;
pub mod normalize;
pub mod registry;
pub mod similarity;
pub mod types;
