//! Transactional checkpoints around patch batches.
//!
//! A transaction snapshots the working tree before the loop writes anything
//! and is later either committed (the snapshot is discarded) or rolled back
//! (the tree is restored to the snapshot).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐     ┌─────────────────┐
//! │ CheckpointMgr   │────>│ CheckpointRecord │────>│ Git             │
//! │ start/commit    │     │ transaction.json │     │ stash / reset   │
//! │ rollback/status │     │ revision | stash │     │ clean / status  │
//! └─────────────────┘     └──────────────────┘     └─────────────────┘
//! ```
//!
//! A clean tree is snapshotted by recording `HEAD`. A dirty tree is stashed
//! (untracked files included) and immediately re-applied, so the stash
//! holds the snapshot while the working tree is left as it was.
//!
//! # Example
//!
//! ```rust,ignore
//! use autopatch::checkpoint::CheckpointManager;
//!
//! let manager = CheckpointManager::new(project_dir);
//! let started = manager.start("before loop 3");
//! // ... apply operations ...
//! if verified {
//!     manager.commit();
//! } else {
//!     manager.rollback();
//! }
//! ```

pub mod git;
pub mod manager;

pub use git::Git;
pub use manager::CheckpointManager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AutopatchError;

// ============================================================================
// Checkpoint Record
// ============================================================================

/// What [`CheckpointRecord::reference`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    /// A commit hash; the tree was clean at start.
    Revision,
    /// A stash commit hash; the tree was dirty at start.
    Stash,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Revision => write!(f, "revision"),
            Self::Stash => write!(f, "stash"),
        }
    }
}

/// The open transaction, persisted while it is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub transaction_id: String,
    pub created_at: DateTime<Utc>,
    pub reference: String,
    pub kind: ReferenceKind,
    /// `HEAD` when the transaction opened.
    pub head: String,
    pub description: String,
    /// Tracked and untracked (non-ignored) files at start.
    pub files_at_start: Vec<String>,
}

impl CheckpointRecord {
    /// First eight characters of the reference, for display.
    #[must_use]
    pub fn short_reference(&self) -> &str {
        &self.reference[..8.min(self.reference.len())]
    }
}

// ============================================================================
// Transaction Outcome
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Ok,
    Error,
    /// The tree was reset but the snapshot could not be fully restored.
    Partial,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error => write!(f, "error"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

/// Result of a transaction operation.
///
/// Contract violations (a second `start`, `commit` with nothing open) are
/// reported here as [`OutcomeStatus::Error`], not as `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionOutcome {
    pub status: OutcomeStatus,
    pub message: String,
    pub transaction_id: Option<String>,
}

impl TransactionOutcome {
    #[must_use]
    pub fn ok(message: impl Into<String>, transaction_id: Option<String>) -> Self {
        Self {
            status: OutcomeStatus::Ok,
            message: message.into(),
            transaction_id,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Error,
            message: message.into(),
            transaction_id: None,
        }
    }

    #[must_use]
    pub fn partial(message: impl Into<String>, transaction_id: Option<String>) -> Self {
        Self {
            status: OutcomeStatus::Partial,
            message: message.into(),
            transaction_id,
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == OutcomeStatus::Ok
    }

    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.status == OutcomeStatus::Partial
    }

    /// Convert a non-ok outcome into a transaction error.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::Transaction`] unless the status is ok.
    pub fn into_result(self) -> Result<Self, AutopatchError> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(AutopatchError::transaction(format!(
                "{}: {}",
                self.status, self.message
            )))
        }
    }
}

impl fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.status, self.message)
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointStatus {
    Idle,
    Active {
        record: CheckpointRecord,
        /// `git status --porcelain` lines since the snapshot's `HEAD`.
        current_changes: Vec<String>,
    },
}

impl CheckpointStatus {
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }
}
