//! autopatch - execution core for an autonomous code-modification agent
//!
//! A language model proposes file edits and shell commands; autopatch
//! applies them under a policy guard, inside a reversible git checkpoint,
//! verifies the result, and recovers or escalates on failure.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`r#loop`] - The Thinking/Patching/Verifying/Recovery state machine
//! - [`guard`] - Shadow-mode risk classification and the approval queue
//! - [`checkpoint`] - Git-backed transactions around each patch batch
//! - [`circuit`] - Circuit breaker and hourly call budget for the backend
//! - [`worker`] - Bounded pool for auxiliary jobs
//! - [`operation`] - The operations a backend may propose
//! - [`audit`] - Hash-chained audit log
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Testing infrastructure (traits, mocks, fixtures)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use autopatch::config::AutopatchConfig;
//! use autopatch::guard::ShadowModeGuard;
//! use autopatch::r#loop::operations::{CommandBackend, CommandVerifier};
//! use autopatch::r#loop::{LoopEnv, StateMachine};
//!
//! let config = AutopatchConfig::load(&project)?;
//! let backend = CommandBackend::from_config(&config.backend, &project)?;
//! let verifier = CommandVerifier::new(&project, config.verifier.clone());
//! let guard = ShadowModeGuard::open(&project, &config.guard)?;
//!
//! let env = LoopEnv::new(&project, &config, Arc::new(backend), Arc::new(verifier), Arc::new(guard));
//! let summary = StateMachine::new(env).run("fix the failing test").await;
//! println!("{}", summary.exit_reason);
//! ```

pub mod audit;
pub mod checkpoint;
pub mod circuit;
pub mod config;
pub mod error;
pub mod guard;
pub mod r#loop;
pub mod operation;
pub mod persist;
pub mod testing;
pub mod worker;

// Re-export commonly used types
pub use error::{AutopatchError, Result};

// Re-export config types
pub use config::{AutopatchConfig, CircuitConfig, GuardConfig, LoopConfig, VerifyLevel};

// Re-export guard types
pub use guard::{GuardMode, OperationType, PendingOperation, Severity, ShadowModeGuard};

// Re-export checkpoint types
pub use checkpoint::{CheckpointManager, CheckpointStatus, TransactionOutcome};

// Re-export loop types
pub use r#loop::{LoopEnv, LoopSummary, StateMachine};

pub use audit::{AuditEventType, AuditLogger};
pub use circuit::{CircuitBreaker, CircuitState};
pub use operation::{Operation, OperationKind, RawOperation};
pub use worker::{JobStatus, WorkerPool};

// Re-export testing types for convenience
pub use testing::{
    ErrorLearner, Generation, LanguageModel, MockBackend, MockPlan, MockVerifier, PlanTracker,
    Verification, Verifier,
};

// TestFixture is only available in test builds
#[cfg(test)]
pub use testing::TestFixture;
