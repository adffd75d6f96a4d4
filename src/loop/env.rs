//! Collaborators and shared handles the states work against.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::audit::AuditLogger;
use crate::checkpoint::CheckpointManager;
use crate::circuit::CircuitBreaker;
use crate::config::{AutopatchConfig, LoopConfig};
use crate::guard::ShadowModeGuard;
use crate::testing::{ErrorLearner, LanguageModel, PlanTracker, Verifier};

use super::operations::{AuditLearner, MarkdownPlan};

/// Everything a state needs besides the [`LoopContext`](super::LoopContext).
pub struct LoopEnv {
    pub project_dir: PathBuf,
    pub config: LoopConfig,
    /// Timeout for `run_command` operations.
    pub command_timeout: Duration,
    pub backend: Arc<dyn LanguageModel>,
    pub verifier: Arc<dyn Verifier>,
    pub plan: Arc<dyn PlanTracker>,
    pub learner: Arc<dyn ErrorLearner>,
    pub guard: Arc<ShadowModeGuard>,
    pub checkpoints: CheckpointManager,
    pub circuit: CircuitBreaker,
    pub audit: Option<Arc<AuditLogger>>,
    /// Operator stop. States check it between steps and race it against
    /// every blocking call.
    pub cancel: CancellationToken,
    pub session_id: String,
    custom_learner: bool,
}

impl fmt::Debug for LoopEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopEnv")
            .field("project_dir", &self.project_dir)
            .field("config", &self.config)
            .field("session_id", &self.session_id)
            .field("circuit", &self.circuit.state())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl LoopEnv {
    /// Environment for a project with the default plan tracker, learner,
    /// checkpoint manager and a persisted circuit breaker.
    #[must_use]
    pub fn new(
        project_dir: impl AsRef<Path>,
        config: &AutopatchConfig,
        backend: Arc<dyn LanguageModel>,
        verifier: Arc<dyn Verifier>,
        guard: Arc<ShadowModeGuard>,
    ) -> Self {
        let project_dir = project_dir.as_ref().to_path_buf();
        let session_id = uuid::Uuid::new_v4().to_string();
        Self {
            plan: Arc::new(MarkdownPlan::new(
                project_dir.join(&config.loop_config.plan_file),
            )),
            learner: Arc::new(AuditLearner::new(None, session_id.clone())),
            checkpoints: CheckpointManager::new(&project_dir),
            circuit: CircuitBreaker::load(&project_dir, config.circuit.clone()),
            config: config.loop_config.clone(),
            command_timeout: Duration::from_secs(config.commands.timeout_secs),
            project_dir,
            backend,
            verifier,
            guard,
            audit: None,
            cancel: CancellationToken::new(),
            session_id,
            custom_learner: false,
        }
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        if !self.custom_learner {
            self.learner = Arc::new(AuditLearner::new(self.audit.clone(), self.session_id.clone()));
        }
        self
    }

    /// Attach an audit log. Checkpoints, the circuit breaker and the
    /// default learner write to it too.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.checkpoints = self
            .checkpoints
            .with_audit(Arc::clone(&audit), self.session_id.clone());
        self.circuit = self
            .circuit
            .with_audit(Arc::clone(&audit), self.session_id.clone());
        if !self.custom_learner {
            self.learner = Arc::new(AuditLearner::new(
                Some(Arc::clone(&audit)),
                self.session_id.clone(),
            ));
        }
        self.audit = Some(audit);
        self
    }

    #[must_use]
    pub fn with_plan(mut self, plan: Arc<dyn PlanTracker>) -> Self {
        self.plan = plan;
        self
    }

    #[must_use]
    pub fn with_learner(mut self, learner: Arc<dyn ErrorLearner>) -> Self {
        self.learner = learner;
        self.custom_learner = true;
        self
    }

    #[must_use]
    pub fn with_circuit(mut self, circuit: CircuitBreaker) -> Self {
        self.circuit = circuit;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_loop_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Backoff before retry `attempt` (1-based) of a backend failure.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        super::retry::calculate_backoff(
            attempt,
            self.config.backoff_base_ms,
            self.config.backoff_max_ms,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBackend, MockPlan, MockVerifier, TestFixture};

    #[tokio::test]
    async fn test_with_cancel_shares_parent_token() {
        let fixture = TestFixture::plain_project();
        let parent = CancellationToken::new();
        let env = fixture
            .env(
                Arc::new(MockBackend::new()),
                Arc::new(MockVerifier::passing()),
                Arc::new(MockPlan::new()),
            )
            .with_cancel(parent.child_token());
        assert!(!env.cancel.is_cancelled());

        parent.cancel();
        assert!(env.cancel.is_cancelled());
        env.cancel.cancelled().await;
    }

    #[test]
    fn test_backoff_is_capped() {
        let fixture = TestFixture::plain_project();
        let env = fixture.env(
            Arc::new(MockBackend::new()),
            Arc::new(MockVerifier::passing()),
            Arc::new(MockPlan::new()),
        );
        assert!(env.backoff(30) <= Duration::from_millis(5));
    }
}
