//! Thinking: ask the backend for the next batch of operations.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{PatchingState, RecoveryState};
use crate::error::AutopatchError;
use crate::operation::Operation;
use crate::r#loop::context::{ErrorKind, LoopContext, EXIT_CANCELLED, EXIT_DELEGATED};
use crate::r#loop::env::LoopEnv;
use crate::r#loop::prompts;
use crate::r#loop::state::{State, StateKind, StateResult};

/// Free text shorter than this (after trimming) is not a usable answer.
const MIN_USEFUL_TEXT: usize = 1;

#[derive(Debug, Default)]
pub struct ThinkingState;

impl ThinkingState {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl State for ThinkingState {
    fn kind(&self) -> StateKind {
        StateKind::Thinking
    }

    async fn on_enter(&mut self, ctx: &mut LoopContext, _env: &mut LoopEnv) {
        ctx.begin_loop();
        info!("Loop {} started", ctx.loop_count);
    }

    async fn handle(&mut self, ctx: &mut LoopContext, env: &mut LoopEnv) -> StateResult {
        if let Err(e) = env.circuit.check() {
            warn!("{}", e);
            ctx.record_error(ErrorKind::Backend, e.to_string());
            return StateResult::Failure;
        }
        ctx.model_called = true;

        let blocked: Vec<String> = env
            .guard
            .pending()
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.approved.is_none())
            .map(|p| format!("{} {}", p.id, p.description))
            .collect();
        let recovery = ctx.recovery_prompt.take();
        let prompt = prompts::task_prompt(&ctx.task, recovery.as_deref(), &blocked);
        let mut context = ctx.model_context();
        context.blocked_operations.clone_from(&blocked);

        debug!("Requesting operations ({} prompt chars)", prompt.len());
        let generated = tokio::select! {
            result = env.backend.generate(&prompt, &context) => result,
            () = env.cancel.cancelled() => {
                ctx.request_exit(EXIT_CANCELLED);
                return StateResult::Exit;
            }
        };

        let generation = match generated {
            Ok(generation) if generation.success => generation,
            Ok(generation) => {
                let error = AutopatchError::backend(format!(
                    "reported failure: {}",
                    generation.text.trim()
                ));
                ctx.record_error(ErrorKind::Backend, error.to_string());
                return StateResult::Failure;
            }
            Err(e) => {
                let error = AutopatchError::backend(format!("{e:#}"));
                warn!("{}", error);
                ctx.record_error(ErrorKind::Backend, error.to_string());
                return StateResult::Failure;
            }
        };

        let text = generation.text.trim().to_string();
        if !text.is_empty() {
            ctx.last_output = Some(text.clone());
        }

        if generation.delegated {
            info!("Backend delegated the session to an operator");
            ctx.request_exit(EXIT_DELEGATED);
            return StateResult::Exit;
        }

        let mut format_errors = 0;
        for raw in generation.operations {
            let op = Operation::from_raw(raw);
            match op.validate() {
                Ok(()) => ctx.proposed_operations.push(op),
                Err(message) => {
                    format_errors += 1;
                    ctx.record_error(ErrorKind::Format, message);
                }
            }
        }

        if !ctx.proposed_operations.is_empty() {
            info!("Backend proposed {} operation(s)", ctx.proposed_operations.len());
            return StateResult::Success;
        }
        if format_errors > 0 {
            return StateResult::Failure;
        }
        if text.chars().count() < MIN_USEFUL_TEXT {
            ctx.record_error(ErrorKind::Backend, "Backend returned no usable content");
            return StateResult::Failure;
        }

        // Prose without operations: routed to Recovery as a soft failure.
        let excerpt: String = text.chars().take(200).collect();
        ctx.record_error(
            ErrorKind::Format,
            format!("No operations proposed. Response began: {excerpt}"),
        );
        StateResult::Success
    }

    fn next_state(&self, ctx: &LoopContext, result: StateResult) -> Option<Box<dyn State>> {
        match result {
            StateResult::Exit => None,
            StateResult::Success if !ctx.proposed_operations.is_empty() => {
                Some(Box::new(PatchingState::new()))
            }
            _ => Some(Box::new(RecoveryState::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Generation, MockBackend, MockPlan, MockVerifier, TestFixture};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_only_undecided_entries_are_listed_as_awaiting() {
        let fixture = TestFixture::plain_project();
        let backend = Arc::new(MockBackend::new().with_response(Generation::text_only("thinking")));
        let mut env = fixture.env(
            backend.clone(),
            Arc::new(MockVerifier::passing()),
            Arc::new(MockPlan::new()),
        );
        let approved = env
            .guard
            .check_operation(&Operation::new("delete_file", json!({"path": "a.py"})))
            .unwrap();
        let waiting = env
            .guard
            .check_operation(&Operation::new("delete_file", json!({"path": "b.py"})))
            .unwrap();
        assert!(env.guard.approve_operation(&approved.id, None).unwrap());

        let mut ctx = LoopContext::new("clean up", 3);
        ThinkingState::new().handle(&mut ctx, &mut env).await;

        let blocked = &backend.contexts()[0].blocked_operations;
        assert_eq!(blocked.len(), 1);
        assert!(blocked[0].starts_with(&waiting.id));
        let prompt = &backend.prompts()[0];
        assert!(prompt.contains(&waiting.id));
        assert!(!prompt.contains(&approved.id));
    }

    #[tokio::test]
    async fn test_open_circuit_skips_the_backend() {
        let fixture = TestFixture::plain_project();
        let backend = Arc::new(MockBackend::new());
        let mut env = fixture.env(
            backend.clone(),
            Arc::new(MockVerifier::passing()),
            Arc::new(MockPlan::new()),
        );
        for _ in 0..env.circuit.status().failure_threshold {
            env.circuit.record_failure("boom");
        }

        let mut ctx = LoopContext::new("fix", 3);
        let result = ThinkingState::new().handle(&mut ctx, &mut env).await;

        assert_eq!(result, StateResult::Failure);
        assert_eq!(backend.call_count(), 0);
        assert!(!ctx.model_called);
        assert!(ctx.errors_this_loop[0].to_string().contains("Model calls blocked"));
    }
}
