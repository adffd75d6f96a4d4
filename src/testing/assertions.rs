//! Custom assertions for loop outcomes and guard decisions.

use crate::guard::{PendingOperation, Severity};
use crate::r#loop::LoopSummary;

/// Assert that a run ended with a reason starting with `expected`.
///
/// # Panics
///
/// Panics with the full summary if the reason does not match.
///
/// # Example
///
/// ```rust,ignore
/// let summary = machine.run("fix it").await;
/// assert_exit_reason(&summary, "Deadlock Detected");
/// ```
pub fn assert_exit_reason(summary: &LoopSummary, expected: &str) {
    assert!(
        summary.exit_reason.starts_with(expected),
        "Expected exit reason starting with {:?}, got {:?}.\nSummary: {:#?}",
        expected,
        summary.exit_reason,
        summary
    );
}

/// Assert that a run completed its plan.
///
/// # Panics
///
/// Panics if the run did not succeed.
pub fn assert_succeeded(summary: &LoopSummary) {
    assert!(
        summary.succeeded(),
        "Expected the run to succeed, but it ended with {:?}.\nLast errors: {:?}",
        summary.exit_reason,
        summary.last_errors
    );
}

/// Assert that the guard withheld an operation at `severity`.
///
/// # Panics
///
/// Panics if nothing was withheld or the severity differs.
pub fn assert_gated(pending: Option<&PendingOperation>, severity: Severity) {
    let Some(pending) = pending else {
        panic!("Expected the operation to be gated at {severity}, but it was auto-approved");
    };
    assert_eq!(
        pending.severity, severity,
        "Expected severity {} but got {} for {}",
        severity, pending.severity, pending.description
    );
}

/// Assert that the guard auto-approved an operation.
///
/// # Panics
///
/// Panics if the operation was gated.
pub fn assert_auto_approved(pending: Option<&PendingOperation>) {
    if let Some(pending) = pending {
        panic!(
            "Expected auto-approval, but {} was gated as {} ({})",
            pending.description, pending.operation_type, pending.severity
        );
    }
}
