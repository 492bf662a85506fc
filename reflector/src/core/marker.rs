//! Completion marker classification.
//!
//! The benchmark engine writes the verifier's return code to the marker. The
//! configured sentinel (by convention `0`) means the tests ran and failed,
//! which is the case worth feeding back. The polarity is the engine's contract
//! and is not reinterpreted here.

use crate::core::types::TaskStatus;

/// Default failure sentinel.
pub const DEFAULT_FAILURE_SENTINEL: i64 = 0;

/// Classify raw marker contents.
///
/// - sentinel value: `Failure`
/// - any other integer: `Success`
/// - empty or non-numeric (e.g. a partial write in progress): `Incomplete`
pub fn classify_marker(raw: &str, failure_sentinel: i64) -> TaskStatus {
    match raw.trim().parse::<i64>() {
        Ok(code) if code == failure_sentinel => TaskStatus::Failure,
        Ok(_) => TaskStatus::Success,
        Err(_) => TaskStatus::Incomplete,
    }
}
