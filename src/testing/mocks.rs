//! Mock implementations of the collaborator traits.
//!
//! Each mock replays a script of responses and records what it was asked,
//! so tests can drive the state machine deterministically and then inspect
//! the prompts and contexts it produced.

use super::traits::{
    ErrorLearner, Generation, LanguageModel, ModelContext, PlanTracker, Verification, Verifier,
};
use crate::config::VerifyLevel;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted language-model backend.
///
/// Responses are consumed in order. Once the script runs out, the fallback
/// response (if any) is repeated; otherwise the call fails.
///
/// # Example
///
/// ```rust,ignore
/// let backend = MockBackend::new()
///     .with_response(Generation::with_operations(vec![write_op]))
///     .repeating(Generation::text_only("nothing to do"));
///
/// backend.generate("prompt", &ctx).await?;
/// assert_eq!(backend.call_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MockBackend {
    script: Mutex<VecDeque<std::result::Result<Generation, String>>>,
    fallback: Option<Generation>,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
    contexts: Mutex<Vec<ModelContext>>,
    call_count: AtomicU32,
}

impl MockBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a generation.
    #[must_use]
    pub fn with_response(self, generation: Generation) -> Self {
        lock(&self.script).push_back(Ok(generation));
        self
    }

    /// Queue a backend failure.
    #[must_use]
    pub fn with_error(self, error: &str) -> Self {
        lock(&self.script).push_back(Err(error.to_string()));
        self
    }

    /// Response returned once the script is exhausted.
    #[must_use]
    pub fn repeating(mut self, generation: Generation) -> Self {
        self.fallback = Some(generation);
        self
    }

    /// Sleep before answering, to exercise timeouts and cancellation.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times `generate` was called.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every prompt received, in order.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    /// Every context received, in order.
    pub fn contexts(&self) -> Vec<ModelContext> {
        lock(&self.contexts).clone()
    }
}

#[async_trait]
impl LanguageModel for MockBackend {
    async fn generate(&self, prompt: &str, context: &ModelContext) -> Result<Generation> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        lock(&self.prompts).push(prompt.to_string());
        lock(&self.contexts).push(context.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = lock(&self.script).pop_front();
        match next {
            Some(Ok(generation)) => Ok(generation),
            Some(Err(error)) => bail!("{}", error),
            None => match &self.fallback {
                Some(generation) => Ok(generation.clone()),
                None => bail!("MockBackend script exhausted"),
            },
        }
    }
}

/// Scripted verifier. Passes once the script is exhausted unless a
/// fallback failure is set.
#[derive(Debug, Default)]
pub struct MockVerifier {
    script: Mutex<VecDeque<Verification>>,
    fallback: Option<Verification>,
    levels: Mutex<Vec<VerifyLevel>>,
    call_count: AtomicU32,
}

impl MockVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifier that always passes.
    #[must_use]
    pub fn passing() -> Self {
        Self::default()
    }

    /// Verifier that always fails with `message`.
    #[must_use]
    pub fn failing(message: &str) -> Self {
        Self::default().repeating(Verification::fail(message))
    }

    #[must_use]
    pub fn with_result(self, verification: Verification) -> Self {
        lock(&self.script).push_back(verification);
        self
    }

    #[must_use]
    pub fn repeating(mut self, verification: Verification) -> Self {
        self.fallback = Some(verification);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Levels requested, in order.
    pub fn levels(&self) -> Vec<VerifyLevel> {
        lock(&self.levels).clone()
    }
}

#[async_trait]
impl Verifier for MockVerifier {
    async fn verify_project(&self, level: VerifyLevel) -> Result<Verification> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        lock(&self.levels).push(level);

        let next = lock(&self.script).pop_front();
        Ok(next
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(Verification::pass))
    }
}

/// Plan that reports completion after a number of checks.
#[derive(Debug, Default)]
pub struct MockPlan {
    complete: AtomicBool,
    complete_after: Option<u32>,
    checks: AtomicU32,
}

impl MockPlan {
    /// A plan that is never complete.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A plan that is already complete.
    #[must_use]
    pub fn complete() -> Self {
        let plan = Self::default();
        plan.complete.store(true, Ordering::SeqCst);
        plan
    }

    /// A plan that becomes complete on the `n`th check.
    #[must_use]
    pub fn complete_after(n: u32) -> Self {
        Self {
            complete_after: Some(n),
            ..Self::default()
        }
    }

    pub fn set_complete(&self, complete: bool) {
        self.complete.store(complete, Ordering::SeqCst);
    }

    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }
}

impl PlanTracker for MockPlan {
    fn is_complete(&self) -> Result<bool> {
        let n = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        if self.complete_after.is_some_and(|after| n >= after) {
            return Ok(true);
        }
        Ok(self.complete.load(Ordering::SeqCst))
    }
}

/// Learner that keeps recorded failures in memory.
#[derive(Debug, Default)]
pub struct MockLearner {
    failures: Mutex<Vec<(String, String)>>,
}

impl MockLearner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `(signature, message)` pairs, in order.
    pub fn failures(&self) -> Vec<(String, String)> {
        lock(&self.failures).clone()
    }
}

impl ErrorLearner for MockLearner {
    fn record_failure(&self, signature: &str, message: &str) -> Result<()> {
        lock(&self.failures).push((signature.to_string(), message.to_string()));
        Ok(())
    }
}
