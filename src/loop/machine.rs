//! The loop driver.
//!
//! Runs one task through the states until a state ends the run, the
//! iteration ceiling is hit, or the operator cancels. Every `handle` except
//! Recovery's runs under the remaining task budget; when the budget runs
//! out mid-state the run is routed into Recovery, which then exits.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::{
    ErrorKind, LoopContext, LoopSummary, EXIT_CANCELLED, EXIT_MAX_LOOPS, EXIT_TIMEOUT,
};
use super::env::LoopEnv;
use super::state::{State, StateKind, StateResult};
use super::states::{RecoveryState, ThinkingState};
use crate::audit::AuditEventType;

/// Drives one task at a time over a [`LoopEnv`].
#[derive(Debug)]
pub struct StateMachine {
    env: LoopEnv,
}

impl StateMachine {
    #[must_use]
    pub fn new(env: LoopEnv) -> Self {
        Self { env }
    }

    /// Handle for cancelling a run from another task or a signal handler.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.env.cancel.clone()
    }

    #[must_use]
    pub fn env(&self) -> &LoopEnv {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut LoopEnv {
        &mut self.env
    }

    /// Run `task` to completion, failure or escalation.
    pub async fn run(&mut self, task: &str) -> LoopSummary {
        let timeout = Duration::from_secs(self.env.config.task_timeout_secs);
        let mut ctx = LoopContext::new(task, self.env.config.max_retries).with_timeout(timeout);
        self.audit(
            AuditEventType::LoopStart,
            serde_json::json!({ "task": task, "timeout_secs": timeout.as_secs() }),
        );
        info!("Starting task: {}", task);

        let mut state: Box<dyn State> = Box::new(ThinkingState::new());
        loop {
            if self.env.cancel.is_cancelled() {
                ctx.request_exit(EXIT_CANCELLED);
                break;
            }
            if state.kind() == StateKind::Thinking && ctx.loop_count >= self.env.config.max_loops {
                ctx.request_exit(EXIT_MAX_LOOPS);
                break;
            }

            ctx.enter_state(state.kind());
            debug!("Entering {}", state.name());
            state.on_enter(&mut ctx, &mut self.env).await;

            let next = match self.handle(state.as_mut(), &mut ctx).await {
                Some(result) => {
                    debug!("{} -> {}", state.name(), result);
                    state.next_state(&ctx, result)
                }
                None => {
                    debug!("{} -> deadline", state.name());
                    Some(Box::new(RecoveryState::new()) as Box<dyn State>)
                }
            };
            match next {
                Some(next) => state = next,
                None => break,
            }
        }

        self.env.circuit.release_trial();
        if ctx.transaction_id.is_some() {
            warn!("Run ended with checkpoint still open; use `autopatch checkpoint` to resolve it");
        }

        let summary = ctx.into_summary();
        info!(
            "Task finished after {} loop(s): {}",
            summary.loops, summary.exit_reason
        );
        self.audit(
            AuditEventType::LoopExit,
            serde_json::json!({
                "reason": summary.exit_reason,
                "loops": summary.loops,
                "files_changed": summary.files_changed,
            }),
        );
        summary
    }

    /// Run one `handle`. Returns `None` when the task budget expired.
    async fn handle(&mut self, state: &mut dyn State, ctx: &mut LoopContext) -> Option<StateResult> {
        if state.kind() == StateKind::Recovery {
            return Some(state.handle(ctx, &mut self.env).await);
        }

        let Some(remaining) = ctx.remaining() else {
            return Some(state.handle(ctx, &mut self.env).await);
        };
        if remaining.is_zero() {
            ctx.record_error(ErrorKind::Timeout, EXIT_TIMEOUT);
            return None;
        }
        match tokio::time::timeout(remaining, state.handle(ctx, &mut self.env)).await {
            Ok(result) => Some(result),
            Err(_) => {
                warn!("{} exceeded the task deadline", state.name());
                ctx.record_error(ErrorKind::Timeout, EXIT_TIMEOUT);
                None
            }
        }
    }

    fn audit(&self, event_type: AuditEventType, data: serde_json::Value) {
        if let Some(audit) = &self.env.audit {
            if let Err(e) = audit.log_event(event_type, &self.env.session_id, "loop", data) {
                warn!("Failed to write audit entry: {}", e);
            }
        }
    }
}
