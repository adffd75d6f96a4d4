//! Recovery: undo the failed loop and decide whether to try again.

use async_trait::async_trait;
use tracing::{info, warn};

use super::ThinkingState;
use crate::checkpoint::OutcomeStatus;
use crate::r#loop::context::{
    ErrorKind, LoopContext, EXIT_CANCELLED, EXIT_DEADLOCK, EXIT_RETRIES_EXHAUSTED, EXIT_TIMEOUT,
};
use crate::r#loop::env::LoopEnv;
use crate::r#loop::prompts;
use crate::r#loop::state::{State, StateKind, StateResult};

#[derive(Debug, Default)]
pub struct RecoveryState;

impl RecoveryState {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl State for RecoveryState {
    fn kind(&self) -> StateKind {
        StateKind::Recovery
    }

    async fn on_enter(&mut self, ctx: &mut LoopContext, env: &mut LoopEnv) {
        if ctx.transaction_id.take().is_none() {
            return;
        }
        let outcome = env.checkpoints.rollback();
        match outcome.status {
            OutcomeStatus::Ok => info!("Rolled back loop {}", ctx.loop_count),
            OutcomeStatus::Partial => {
                warn!("Partial rollback: {}", outcome.message);
                ctx.request_exit(format!("Transaction error: {}", outcome.message));
            }
            OutcomeStatus::Error => warn!("Rollback failed: {}", outcome.message),
        }
    }

    async fn handle(&mut self, ctx: &mut LoopContext, env: &mut LoopEnv) -> StateResult {
        if ctx.model_called {
            let summary = ctx
                .errors_this_loop
                .first()
                .map_or_else(|| "loop failed".to_string(), ToString::to_string);
            env.circuit.record_failure(&summary);
        }

        if ctx.should_exit {
            return StateResult::Exit;
        }
        if ctx.deadline_passed() {
            ctx.request_exit(EXIT_TIMEOUT);
            return StateResult::Exit;
        }

        let signature = ctx
            .error_signature()
            .unwrap_or_else(|| "no-errors".to_string());
        let threshold = env.config.deadlock_threshold;
        if ctx.push_error_signature(signature, threshold) {
            warn!("Same errors in {} consecutive loops", threshold);
            ctx.request_exit(format!(
                "{EXIT_DEADLOCK}: same errors in {threshold} consecutive loops"
            ));
            return StateResult::Exit;
        }

        if ctx.retry_count >= ctx.max_retries {
            ctx.request_exit(format!("{EXIT_RETRIES_EXHAUSTED} ({})", ctx.max_retries));
            return StateResult::Exit;
        }
        ctx.retry_count += 1;

        let kind = ctx.dominant_error_kind().unwrap_or(ErrorKind::Format);
        let message = ctx.messages_of(kind);
        ctx.recovery_prompt = Some(prompts::recovery_prompt(kind, &message));
        info!(
            "Retry {}/{} after {} error",
            ctx.retry_count, ctx.max_retries, kind
        );

        if kind == ErrorKind::Backend {
            let mut delay = env.backoff(ctx.retry_count);
            if let Some(remaining) = ctx.remaining() {
                delay = delay.min(remaining);
            }
            info!("Backing off {}ms before retrying the backend", delay.as_millis());
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = env.cancel.cancelled() => {
                    ctx.request_exit(EXIT_CANCELLED);
                    return StateResult::Exit;
                }
            }
        }
        StateResult::Retry
    }

    fn next_state(&self, _ctx: &LoopContext, result: StateResult) -> Option<Box<dyn State>> {
        match result {
            StateResult::Retry => Some(Box::new(ThinkingState::new())),
            _ => None,
        }
    }
}
