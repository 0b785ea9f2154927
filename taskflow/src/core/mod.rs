//! Deterministic, pure logic shared by the phase engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod context;
pub mod contract;
pub mod result_parser;
pub mod types;
pub mod verdict;
