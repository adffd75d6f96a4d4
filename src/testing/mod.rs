//! Testing infrastructure for autopatch.
//!
//! The loop talks to the outside world only through the traits in
//! [`traits`]. Production implementations live in
//! [`crate::r#loop::operations`]; this module provides scripted doubles so
//! the state machine can be driven deterministically.
//!
//! - **Traits**: `LanguageModel`, `Verifier`, `PlanTracker`, `ErrorLearner`
//! - **Mocks**: Scripted implementations with call inspection
//! - **Fixtures**: Temporary projects, with or without git (test-only)
//! - **Assertions**: Checks on loop summaries and guard decisions
//!
//! # Example
//!
//! ```rust,ignore
//! use autopatch::testing::{Generation, MockBackend, MockVerifier};
//!
//! let backend = MockBackend::new()
//!     .with_error("connection reset")
//!     .repeating(Generation::text_only("done"));
//! let verifier = MockVerifier::failing("SyntaxError line 4");
//! ```

pub mod assertions;
#[cfg(test)]
pub mod fixtures;
pub mod mocks;
pub mod traits;

// Re-export commonly used types
pub use assertions::*;
#[cfg(test)]
pub use fixtures::*;
pub use mocks::*;
pub use traits::*;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::guard::Severity;
    use crate::operation::Operation;
    use crate::r#loop::LoopContext;

    // =========================================================================
    // Fixture Tests
    // =========================================================================

    #[test]
    fn test_plain_project_is_not_a_repo() {
        let fixture = TestFixture::plain_project();
        assert!(fixture.exists("a.py"));
        assert!(!fixture.exists(".git"));
    }

    #[test]
    fn test_git_project_is_clean() {
        let fixture = TestFixture::git_project();
        assert!(fixture.exists(".git"));
        assert_eq!(fixture.git(&["status", "--porcelain"]), "");
        assert_eq!(fixture.git(&["log", "--format=%s"]), "Initial commit");
    }

    #[test]
    fn test_fixture_write_creates_parents() {
        let fixture = TestFixture::plain_project();
        fixture.write("pkg/mod.py", "x = 1\n");
        assert_eq!(fixture.read("pkg/mod.py"), "x = 1\n");
    }

    #[test]
    fn test_fixture_env_is_fast() {
        let fixture = TestFixture::plain_project();
        let env = fixture.env(
            std::sync::Arc::new(MockBackend::new()),
            std::sync::Arc::new(MockVerifier::passing()),
            std::sync::Arc::new(MockPlan::new()),
        );
        assert_eq!(env.config.backoff_base_ms, 1);
        assert!(env.guard.pending().unwrap().is_empty());
    }

    // =========================================================================
    // Assertion Tests
    // =========================================================================

    fn summary(reason: &str) -> crate::r#loop::LoopSummary {
        let mut ctx = LoopContext::new("task", 3);
        ctx.request_exit(reason);
        ctx.into_summary()
    }

    #[test]
    fn test_assert_exit_reason_matches_prefix() {
        assert_exit_reason(
            &summary("Deadlock Detected: same errors in 3 consecutive loops"),
            "Deadlock Detected",
        );
    }

    #[test]
    #[should_panic(expected = "Expected exit reason")]
    fn test_assert_exit_reason_rejects_other_reason() {
        assert_exit_reason(&summary("Task timed out"), "Deadlock Detected");
    }

    #[test]
    #[should_panic(expected = "Expected the run to succeed")]
    fn test_assert_succeeded_rejects_failure() {
        assert_succeeded(&summary("Maximum retries exceeded (3)"));
    }

    #[test]
    fn test_guard_assertions() {
        let fixture = TestFixture::plain_project();
        let guard = fixture.memory_guard();

        let edit = Operation::new("write_file", json!({"path": "a.py", "content": "x"}));
        assert_auto_approved(guard.check_operation(&edit).as_ref());

        let delete = Operation::new("delete_file", json!({"path": "a.py"}));
        assert_gated(guard.check_operation(&delete).as_ref(), Severity::High);
    }
}
