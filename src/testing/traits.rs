//! Trait definitions for the loop's external collaborators.
//!
//! The state machine only talks to the model backend, the verifier, the
//! plan tracker and the error learner through these traits, so the loop can
//! be driven in tests by the mocks in [`super::mocks`] and in production by
//! the command-backed implementations in `r#loop::operations`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::VerifyLevel;
use crate::operation::RawOperation;

/// Structured context sent to the backend alongside the prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelContext {
    pub task: String,
    pub loop_count: u32,
    pub retry_count: u32,
    /// Errors recorded during the previous loop, oldest first.
    pub previous_errors: Vec<String>,
    pub verification_error: Option<String>,
    /// Ids and descriptions of operations waiting for human approval.
    pub blocked_operations: Vec<String>,
    pub files_modified: Vec<String>,
    pub files_created: Vec<String>,
}

/// What the backend produced for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    /// Free-text output.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub operations: Vec<RawOperation>,
    #[serde(default = "default_true")]
    pub success: bool,
    /// The session was handed over to an interactive operator.
    #[serde(default)]
    pub delegated: bool,
}

fn default_true() -> bool {
    true
}

impl Generation {
    /// A successful generation with the given operations.
    #[must_use]
    pub fn with_operations(operations: Vec<RawOperation>) -> Self {
        Self {
            text: String::new(),
            operations,
            success: true,
            delegated: false,
        }
    }

    /// A successful, text-only generation.
    #[must_use]
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            operations: Vec::new(),
            success: true,
            delegated: false,
        }
    }

    /// A generation the backend itself reported as failed.
    #[must_use]
    pub fn failed(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            operations: Vec::new(),
            success: false,
            delegated: false,
        }
    }
}

/// Abstraction for the language-model backend.
///
/// # Example
///
/// ```rust,ignore
/// use autopatch::testing::{LanguageModel, ModelContext};
///
/// async fn ask(model: &dyn LanguageModel) -> anyhow::Result<usize> {
///     let generation = model.generate("fix the build", &ModelContext::default()).await?;
///     Ok(generation.operations.len())
/// }
/// ```
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Ask the backend for the next batch of operations.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or its output cannot
    /// be read.
    async fn generate(&self, prompt: &str, context: &ModelContext) -> Result<Generation>;
}

/// Result of verifying the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub passed: bool,
    pub message: String,
}

impl Verification {
    #[must_use]
    pub fn pass() -> Self {
        Self {
            passed: true,
            message: String::new(),
        }
    }

    #[must_use]
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

/// Abstraction for project verification (syntax checks, linters, tests).
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Verify the project at the given depth.
    ///
    /// # Errors
    ///
    /// Returns an error if the verifier itself could not run. A project
    /// that fails verification is an `Ok` with `passed == false`.
    async fn verify_project(&self, level: VerifyLevel) -> Result<Verification>;
}

/// Abstraction for the external task plan.
pub trait PlanTracker: Send + Sync {
    /// Whether every item in the plan is done.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan cannot be read.
    fn is_complete(&self) -> Result<bool>;
}

/// Sink for recurring failure patterns.
pub trait ErrorLearner: Send + Sync {
    /// Record a verification failure under a stable signature.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern cannot be stored.
    fn record_failure(&self, signature: &str, message: &str) -> Result<()>;
}
