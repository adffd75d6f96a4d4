//! Verifying: check the patched project and decide whether the task is done.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{RecoveryState, ThinkingState};
use crate::r#loop::context::{ErrorKind, LoopContext, EXIT_CANCELLED, EXIT_PLAN_COMPLETE};
use crate::r#loop::env::LoopEnv;
use crate::r#loop::state::{State, StateKind, StateResult};
use crate::testing::Verification;

#[derive(Debug, Default)]
pub struct VerifyingState;

impl VerifyingState {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl State for VerifyingState {
    fn kind(&self) -> StateKind {
        StateKind::Verifying
    }

    async fn handle(&mut self, ctx: &mut LoopContext, env: &mut LoopEnv) -> StateResult {
        let level = env.config.verify_level;
        let verified = tokio::select! {
            result = env.verifier.verify_project(level) => result,
            () = env.cancel.cancelled() => {
                ctx.request_exit(EXIT_CANCELLED);
                return StateResult::Exit;
            }
        };
        let verification =
            verified.unwrap_or_else(|e| Verification::fail(format!("Verifier error: {e:#}")));

        ctx.verification_passed = verification.passed;
        if !verification.passed {
            warn!("Verification ({}) failed", level);
            ctx.verification_error = Some(verification.message.clone());
            ctx.record_error(ErrorKind::Verification, verification.message.clone());
            let signature = ctx.error_signature().unwrap_or_default();
            if let Err(e) = env.learner.record_failure(&signature, &verification.message) {
                warn!("Failed to record error pattern: {:#}", e);
            }
            return StateResult::Failure;
        }

        info!("Verification ({}) passed", level);
        ctx.record_success();
        env.circuit.record_success();

        if ctx.transaction_id.take().is_some() {
            let outcome = env.checkpoints.commit();
            if !outcome.is_ok() {
                warn!("Checkpoint commit: {}", outcome);
            }
        }

        match env.plan.is_complete() {
            Ok(true) => {
                info!("Plan complete");
                ctx.request_exit(EXIT_PLAN_COMPLETE);
            }
            Ok(false) => {}
            Err(e) => warn!("Could not read plan: {:#}", e),
        }
        StateResult::Success
    }

    fn next_state(&self, ctx: &LoopContext, result: StateResult) -> Option<Box<dyn State>> {
        match result {
            StateResult::Success if ctx.should_exit => None,
            StateResult::Success => Some(Box::new(ThinkingState::new())),
            StateResult::Exit => None,
            _ => Some(Box::new(RecoveryState::new())),
        }
    }
}
