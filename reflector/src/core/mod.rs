//! Deterministic, pure logic shared by the reflector.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod batch;
pub mod behavior_spec;
pub mod locator;
pub mod marker;
pub mod types;
