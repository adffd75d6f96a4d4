//! Patching: vet each proposed operation and apply it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{RecoveryState, VerifyingState};
use crate::error::{AutopatchError, Result};
use crate::operation::{resolve_target, stays_within, Operation, OperationKind};
use crate::r#loop::context::{ErrorKind, LoopContext, EXIT_CANCELLED};
use crate::r#loop::env::LoopEnv;
use crate::r#loop::operations::run_shell;
use crate::r#loop::state::{State, StateKind, StateResult};

#[derive(Debug, Default)]
pub struct PatchingState {
    checkpoint_attempted: bool,
}

impl PatchingState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a checkpoint for this run unless one is already open.
    fn ensure_checkpoint(&mut self, ctx: &mut LoopContext, env: &LoopEnv) {
        if ctx.transaction_id.is_some() || self.checkpoint_attempted {
            return;
        }
        self.checkpoint_attempted = true;
        let outcome = env
            .checkpoints
            .start(&format!("autopatch loop {}", ctx.loop_count));
        if outcome.is_ok() {
            ctx.transaction_id = outcome.transaction_id;
        } else {
            warn!("Proceeding without checkpoint: {}", outcome.message);
        }
    }

    async fn apply(
        &self,
        op: &Operation,
        path: Option<&Path>,
        ctx: &mut LoopContext,
        env: &LoopEnv,
    ) -> Result<()> {
        let display = op.target_path().unwrap_or_default().to_string();
        let failed = |message: String| AutopatchError::patch(&display, message);
        match op.kind() {
            OperationKind::WriteFile => {
                let path = path.ok_or_else(|| failed("no path given".to_string()))?;
                let existed = path.exists();
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| failed(format!("cannot create {}: {e}", parent.display())))?;
                }
                tokio::fs::write(path, op.content().unwrap_or_default())
                    .await
                    .map_err(|e| failed(format!("cannot write: {e}")))?;
                if existed {
                    ctx.files_modified.insert(display);
                } else {
                    ctx.files_created.insert(display);
                }
            }
            OperationKind::ReplaceInFile => {
                let path = path.ok_or_else(|| failed("no path given".to_string()))?;
                let content = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| failed(format!("cannot read: {e}")))?;
                let search = op.search().unwrap_or_default();
                if search.is_empty() || !content.contains(search) {
                    return Err(failed("search text not found".to_string()));
                }
                let updated = content.replacen(search, op.replacement().unwrap_or_default(), 1);
                tokio::fs::write(path, updated)
                    .await
                    .map_err(|e| failed(format!("cannot write: {e}")))?;
                ctx.files_modified.insert(display);
            }
            OperationKind::DeleteFile => {
                let path = path.ok_or_else(|| failed("no path given".to_string()))?;
                tokio::fs::remove_file(path)
                    .await
                    .map_err(|e| failed(format!("cannot delete: {e}")))?;
                ctx.files_modified.insert(display);
            }
            OperationKind::RunCommand => {
                let command = op.command().unwrap_or_default();
                let target = format!("`{command}`");
                let output = run_shell(command, &env.project_dir, env.command_timeout)
                    .await
                    .map_err(|e| AutopatchError::patch(&target, format!("{e:#}")))?;
                if let Some(audit) = &env.audit {
                    let combined = output.combined();
                    if let Err(e) = audit.log_command(
                        &env.session_id,
                        command,
                        output.code.unwrap_or(-1),
                        Some(combined.as_str()),
                    ) {
                        warn!("Failed to write audit entry: {}", e);
                    }
                }
                if !output.success() {
                    let status = if output.timed_out {
                        "timed out".to_string()
                    } else {
                        format!("exit {}", output.code.unwrap_or(-1))
                    };
                    return Err(AutopatchError::patch(
                        target,
                        format!("{status}: {}", output.combined()),
                    ));
                }
            }
            OperationKind::ReportStatus => {
                let message = op.message().unwrap_or_default().to_string();
                info!("Status: {}", message);
                ctx.status_reports.push(message);
            }
            OperationKind::Other => {
                return Err(AutopatchError::patch(op.name(), "unknown operation"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl State for PatchingState {
    fn kind(&self) -> StateKind {
        StateKind::Patching
    }

    async fn handle(&mut self, ctx: &mut LoopContext, env: &mut LoopEnv) -> StateResult {
        let operations = ctx.proposed_operations.clone();

        for op in &operations {
            if env.cancel.is_cancelled() {
                ctx.request_exit(EXIT_CANCELLED);
                return StateResult::Exit;
            }

            let path: Option<PathBuf> = match op.target_path() {
                Some(target) if op.kind().mutates_files() => {
                    let resolved = resolve_target(&env.project_dir, target);
                    if !stays_within(&env.project_dir, &resolved) {
                        let message = AutopatchError::PathOutsideRoot {
                            path: target.to_string(),
                        }
                        .to_string();
                        warn!("{}", message);
                        ctx.patch_errors.push(message.clone());
                        ctx.record_error(ErrorKind::Patch, message);
                        continue;
                    }
                    Some(resolved)
                }
                _ => None,
            };

            if op.kind() != OperationKind::ReportStatus {
                self.ensure_checkpoint(ctx, env);
            }

            if let Some(pending) = env.guard.check_operation(op) {
                info!(
                    "Withheld {} ({}, {}): pending approval {}",
                    op.describe(),
                    pending.operation_type,
                    pending.severity,
                    pending.id
                );
                ctx.blocked_operations.push(pending);
                continue;
            }

            debug!("Applying {}", op.describe());
            if let Err(e) = self.apply(op, path.as_deref(), ctx, env).await {
                warn!("{}", e);
                let message = e.to_string();
                ctx.patch_errors.push(message.clone());
                ctx.record_error(ErrorKind::Patch, message);
            }
        }

        let touched = ctx.files_modified.len() + ctx.files_created.len();
        if touched == 0 {
            if !ctx.blocked_operations.is_empty() {
                let ids: Vec<&str> = ctx
                    .blocked_operations
                    .iter()
                    .map(|p| p.id.as_str())
                    .collect();
                let blocked = AutopatchError::PolicyBlocked {
                    ids: ids.join(", "),
                };
                ctx.record_error(ErrorKind::Patch, blocked.to_string());
            } else if ctx.patch_errors.is_empty() {
                ctx.record_error(ErrorKind::Patch, "No files were modified or created");
            }
            return StateResult::Failure;
        }

        info!(
            "Patched {} file(s), {} withheld, {} error(s)",
            touched,
            ctx.blocked_operations.len(),
            ctx.patch_errors.len()
        );
        StateResult::Success
    }

    fn next_state(&self, _ctx: &LoopContext, result: StateResult) -> Option<Box<dyn State>> {
        match result {
            StateResult::Success => Some(Box::new(VerifyingState::new())),
            StateResult::Exit => None,
            _ => Some(Box::new(RecoveryState::new())),
        }
    }
}
