//! The checkpoint manager: one open transaction per project.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::git::Git;
use super::{CheckpointRecord, CheckpointStatus, ReferenceKind, TransactionOutcome};
use crate::audit::{AuditEventType, AuditLogger};
use crate::config::AutopatchConfig;
use crate::persist::{read_json, with_lock, write_json};

/// Open-transaction record file inside the state directory.
pub const TRANSACTION_FILE: &str = "transaction.json";

const LOCK_FILE: &str = "transaction.lock";

/// Manages reversible snapshots of a git working tree.
///
/// All state lives in `.autopatch/transaction.json`, so a new manager for
/// the same project picks up a transaction left open by a previous process.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    project_dir: PathBuf,
    git: Git,
    audit: Option<Arc<AuditLogger>>,
    session_id: String,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        let project_dir = project_dir.as_ref().to_path_buf();
        Self {
            git: Git::new(&project_dir),
            project_dir,
            audit: None,
            session_id: "cli".to_string(),
        }
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLogger>, session_id: impl Into<String>) -> Self {
        self.audit = Some(audit);
        self.session_id = session_id.into();
        self
    }

    fn record_path(&self) -> PathBuf {
        AutopatchConfig::state_dir(&self.project_dir).join(TRANSACTION_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        AutopatchConfig::state_dir(&self.project_dir).join(LOCK_FILE)
    }

    /// The open transaction, if any.
    #[must_use]
    pub fn active(&self) -> Option<CheckpointRecord> {
        read_json(&self.record_path())
    }

    fn clear_record(&self) -> std::io::Result<()> {
        match std::fs::remove_file(self.record_path()) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Open a transaction.
    ///
    /// Fails if git is unavailable, the project is not a work tree, the
    /// repository has no commits, or a transaction is already open.
    pub fn start(&self, description: &str) -> TransactionOutcome {
        if let Err(e) = Git::ensure_available() {
            return TransactionOutcome::error(e.to_string());
        }
        if !self.git.is_repo() {
            return TransactionOutcome::error(format!(
                "{} is not a git repository",
                self.project_dir.display()
            ));
        }

        let result = with_lock(&self.lock_path(), || {
            if let Some(open) = self.active() {
                return Ok(TransactionOutcome::error(format!(
                    "Transaction {} already in progress",
                    open.transaction_id
                )));
            }

            let head = self.git.head()?;
            let files_at_start = self.git.files()?;
            let transaction_id = uuid::Uuid::new_v4().to_string();

            let (reference, kind) = if self.git.changes()?.is_empty() {
                (head.clone(), ReferenceKind::Revision)
            } else {
                let message = format!("autopatch checkpoint {transaction_id}");
                (self.git.snapshot_to_stash(&message)?, ReferenceKind::Stash)
            };

            let record = CheckpointRecord {
                transaction_id: transaction_id.clone(),
                created_at: Utc::now(),
                reference,
                kind,
                head,
                description: description.to_string(),
                files_at_start,
            };
            write_json(&self.record_path(), &record)?;

            info!(
                "Opened transaction {} at {} {}",
                transaction_id,
                record.kind,
                record.short_reference()
            );
            self.audit(
                AuditEventType::TransactionStart,
                &transaction_id,
                &format!("{} {}", record.kind, record.reference),
            );
            Ok(TransactionOutcome::ok(
                format!("Transaction started ({})", record.kind),
                Some(transaction_id),
            ))
        });

        result.unwrap_or_else(|e| TransactionOutcome::error(e.to_string()))
    }

    /// Close the open transaction and keep the working tree as it is.
    pub fn commit(&self) -> TransactionOutcome {
        let Some(record) = self.active() else {
            return TransactionOutcome::error("No active transaction");
        };

        if record.kind == ReferenceKind::Stash {
            match self.git.find_stash(&record.reference) {
                Ok(Some(stash_ref)) => {
                    if let Err(e) = self.git.stash_drop(&stash_ref) {
                        warn!("Could not drop snapshot stash {}: {}", stash_ref, e);
                    }
                }
                Ok(None) => warn!(
                    "Snapshot stash {} no longer exists",
                    record.short_reference()
                ),
                Err(e) => warn!("Could not list stashes: {}", e),
            }
        }

        if let Err(e) = self.clear_record() {
            return TransactionOutcome::error(format!("Failed to clear transaction record: {e}"));
        }

        info!("Committed transaction {}", record.transaction_id);
        self.audit(
            AuditEventType::TransactionCommit,
            &record.transaction_id,
            &record.description,
        );
        TransactionOutcome::ok("Transaction committed", Some(record.transaction_id))
    }

    /// Restore the working tree to the snapshot and close the transaction.
    ///
    /// Returns a partial outcome when the tree was reset but a stashed
    /// snapshot could not be re-applied; the record is kept so an operator
    /// can inspect it.
    pub fn rollback(&self) -> TransactionOutcome {
        let Some(record) = self.active() else {
            return TransactionOutcome::error("No active transaction");
        };
        let id = Some(record.transaction_id.clone());

        if let Err(e) = self.git.reset_hard(&record.head) {
            return TransactionOutcome::error(format!("Rollback failed: {e}"));
        }
        if let Err(e) = self.git.clean() {
            return TransactionOutcome::partial(
                format!("Reset to {} but clean failed: {e}", record.short_reference()),
                id,
            );
        }

        if record.kind == ReferenceKind::Stash {
            let restored = match self.git.find_stash(&record.reference) {
                Ok(Some(stash_ref)) => self.git.stash_pop(&stash_ref).map_err(|e| e.to_string()),
                Ok(None) => Err(format!(
                    "snapshot stash {} not found",
                    record.short_reference()
                )),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = restored {
                warn!("Partial rollback of {}: {}", record.transaction_id, e);
                self.audit(
                    AuditEventType::TransactionRollback,
                    &record.transaction_id,
                    &format!("partial: {e}"),
                );
                return TransactionOutcome::partial(
                    format!(
                        "Working tree reset to {} but pre-existing changes were not restored: {e}",
                        record.short_reference()
                    ),
                    id,
                );
            }
        }

        if let Err(e) = self.clear_record() {
            return TransactionOutcome::error(format!("Failed to clear transaction record: {e}"));
        }

        info!(
            "Rolled back transaction {} to {}",
            record.transaction_id,
            record.short_reference()
        );
        self.audit(
            AuditEventType::TransactionRollback,
            &record.transaction_id,
            "ok",
        );
        TransactionOutcome::ok("Transaction rolled back", id)
    }

    /// Idle, or the open transaction plus the changes made since it opened.
    #[must_use]
    pub fn status(&self) -> CheckpointStatus {
        match self.active() {
            None => CheckpointStatus::Idle,
            Some(record) => {
                let current_changes = self.git.changes().unwrap_or_else(|e| {
                    debug!("git status failed: {}", e);
                    Vec::new()
                });
                CheckpointStatus::Active {
                    record,
                    current_changes,
                }
            }
        }
    }

    fn audit(&self, event_type: AuditEventType, transaction_id: &str, detail: &str) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_transaction(event_type, &self.session_id, transaction_id, detail)
            {
                warn!("Failed to write audit entry: {}", e);
            }
        }
    }
}
