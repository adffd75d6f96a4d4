//! Hash-chained audit trail under `.autopatch/audit.jsonl`.
//!
//! Guard decisions, operator verdicts, checkpoint transactions, executed
//! commands and loop boundaries are appended one JSON object per line. Each
//! line carries the SHA-256 of its predecessor, so editing or dropping a
//! line breaks [`AuditLogger::verify`] from that point on.
//!
//! Appends hold an exclusive `audit.lock` for the read-tail-then-append
//! step; two processes writing the same project interleave whole entries.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::AutopatchConfig;
use crate::error::Result;
use crate::persist::with_lock;

/// Audit log file name inside the state directory.
pub const AUDIT_FILE: &str = "audit.jsonl";

const LOCK_FILE: &str = "audit.lock";

/// Seed for the `previous_hash` of entry 0.
const CHAIN_SEED: &str = "autopatch-audit-genesis-v1";

/// The type of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// The guard let an operation through without review.
    GuardAutoApproved,
    /// The guard held an operation for review.
    GuardQueued,
    /// An operation arrived with arguments the guard could not fully read.
    GuardMalformed,
    /// A queued operation was approved.
    Approved,
    /// A queued operation was rejected.
    Rejected,
    /// The pending queue was cleared.
    QueueCleared,
    /// A trust rule was revoked.
    TrustRevoked,
    /// The guard mode changed.
    ModeChange,
    /// A checkpoint transaction was opened.
    TransactionStart,
    /// A checkpoint transaction was committed.
    TransactionCommit,
    /// A checkpoint transaction was rolled back.
    TransactionRollback,
    /// Verification failed and the error pattern was recorded.
    ErrorPattern,
    /// A command proposed by the model was executed.
    CommandExecution,
    /// The circuit breaker or call budget was reset.
    CircuitReset,
    /// A task run started.
    LoopStart,
    /// A task run ended.
    LoopExit,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::GuardAutoApproved => "guard_auto_approved",
            Self::GuardQueued => "guard_queued",
            Self::GuardMalformed => "guard_malformed",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::QueueCleared => "queue_cleared",
            Self::TrustRevoked => "trust_revoked",
            Self::ModeChange => "mode_change",
            Self::TransactionStart => "transaction_start",
            Self::TransactionCommit => "transaction_commit",
            Self::TransactionRollback => "transaction_rollback",
            Self::ErrorPattern => "error_pattern",
            Self::CommandExecution => "command_execution",
            Self::CircuitReset => "circuit_reset",
            Self::LoopStart => "loop_start",
            Self::LoopExit => "loop_exit",
        };
        write!(f, "{}", s)
    }
}

/// One line of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    /// Run id, or `cli` for operator commands.
    pub session_id: String,
    /// Component that wrote the entry (`guard`, `checkpoint`, `operator`, ...).
    pub actor: String,
    pub data: serde_json::Value,
    /// Hash of the entry before this one (the chain seed for entry 0).
    pub previous_hash: String,
    /// Hex SHA-256 over every other field.
    pub hash: String,
}

impl AuditEntry {
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sequence.to_le_bytes());
        for field in [
            self.timestamp.to_rfc3339(),
            self.event_type.to_string(),
            self.session_id.clone(),
            self.actor.clone(),
            self.data.to_string(),
            self.previous_hash.clone(),
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// The stored hash still matches the entry's content.
    #[must_use]
    pub fn is_untampered(&self) -> bool {
        self.hash == self.digest()
    }
}

/// Where and why a chain stops checking out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    /// Zero-based line index of the offending entry.
    pub index: u64,
    pub reason: String,
}

/// Outcome of [`AuditLogger::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    /// Entries that checked out before the break (or all of them).
    pub verified: u64,
    pub broken: Option<ChainBreak>,
}

impl ChainReport {
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.broken.is_none()
    }
}

/// Appends to and reads back a project's audit trail.
///
/// Share one logger behind an `Arc` within a process.
#[derive(Debug)]
pub struct AuditLogger {
    path: PathBuf,
    lock_path: PathBuf,
    append: Mutex<()>,
}

impl AuditLogger {
    /// # Errors
    ///
    /// Returns an error if the state directory cannot be created.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let dir = AutopatchConfig::state_dir(&project_dir);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join(AUDIT_FILE),
            lock_path: dir.join(LOCK_FILE),
            append: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn audit_file(&self) -> &Path {
        &self.path
    }

    // ------------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------------

    /// Append one entry chained onto the current last line.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be locked, read or appended to.
    pub fn log_event(
        &self,
        event_type: AuditEventType,
        session_id: &str,
        actor: &str,
        data: serde_json::Value,
    ) -> Result<AuditEntry> {
        let _held = self
            .append
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        with_lock(&self.lock_path, || {
            let last = self.read_entries()?.pop();
            let mut entry = AuditEntry {
                sequence: last.as_ref().map_or(0, |e| e.sequence + 1),
                timestamp: Utc::now(),
                event_type,
                session_id: session_id.to_string(),
                actor: actor.to_string(),
                data,
                previous_hash: last.map_or_else(chain_seed, |e| e.hash),
                hash: String::new(),
            };
            entry.hash = entry.digest();

            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            writeln!(file, "{}", serde_json::to_string(&entry)?)?;
            Ok(entry)
        })
    }

    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    pub fn log_guard_decision(
        &self,
        event_type: AuditEventType,
        session_id: &str,
        fingerprint: &str,
        operation_type: &str,
        severity: &str,
        description: &str,
    ) -> Result<AuditEntry> {
        let data = serde_json::json!({
            "fingerprint": fingerprint,
            "operation_type": operation_type,
            "severity": severity,
            "description": description,
        });
        self.log_event(event_type, session_id, "guard", data)
    }

    /// Record an approve/reject verdict on a queued operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    pub fn log_verdict(
        &self,
        session_id: &str,
        approved: bool,
        pending_id: &str,
        note: Option<&str>,
    ) -> Result<AuditEntry> {
        let event_type = if approved {
            AuditEventType::Approved
        } else {
            AuditEventType::Rejected
        };
        let data = serde_json::json!({ "id": pending_id, "note": note });
        self.log_event(event_type, session_id, "operator", data)
    }

    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    pub fn log_transaction(
        &self,
        event_type: AuditEventType,
        session_id: &str,
        transaction_id: &str,
        detail: &str,
    ) -> Result<AuditEntry> {
        let data = serde_json::json!({ "transaction_id": transaction_id, "detail": detail });
        self.log_event(event_type, session_id, "checkpoint", data)
    }

    /// Record a shell command run for the model, with its exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    pub fn log_command(
        &self,
        session_id: &str,
        command: &str,
        exit_code: i32,
        output: Option<&str>,
    ) -> Result<AuditEntry> {
        let data = serde_json::json!({
            "command": command,
            "exit_code": exit_code,
            "output": output,
        });
        self.log_event(AuditEventType::CommandExecution, session_id, "system", data)
    }

    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    pub fn log_error_pattern(
        &self,
        session_id: &str,
        signature: &str,
        message: &str,
    ) -> Result<AuditEntry> {
        let data = serde_json::json!({ "signature": signature, "message": message });
        self.log_event(AuditEventType::ErrorPattern, session_id, "verifier", data)
    }

    // ------------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------------

    /// Every entry in file order. A missing log reads as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a line does not parse.
    pub fn read_entries(&self) -> Result<Vec<AuditEntry>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Ok(serde_json::from_str::<AuditEntry>(line)?))
            .collect()
    }

    /// The last `limit` entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub fn tail(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let mut entries = self.read_entries()?;
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }

    /// Walk the chain: sequence numbers count up from zero, every stored
    /// hash matches its entry, and every `previous_hash` matches the line
    /// before it.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub fn verify(&self) -> Result<ChainReport> {
        let entries = self.read_entries()?;
        let mut expected_previous = chain_seed();

        for (index, entry) in (0u64..).zip(&entries) {
            let reason = if entry.sequence != index {
                Some(format!("sequence {} where {} was expected", entry.sequence, index))
            } else if !entry.is_untampered() {
                Some("entry hash does not match its content".to_string())
            } else if entry.previous_hash != expected_previous {
                Some("previous_hash does not match the preceding entry".to_string())
            } else {
                None
            };
            if let Some(reason) = reason {
                return Ok(ChainReport {
                    verified: index,
                    broken: Some(ChainBreak { index, reason }),
                });
            }
            expected_previous.clone_from(&entry.hash);
        }

        Ok(ChainReport {
            verified: entries.len() as u64,
            broken: None,
        })
    }
}

fn chain_seed() -> String {
    hex::encode(Sha256::digest(CHAIN_SEED.as_bytes()))
}
