//! Shadow-mode policy guard.
//!
//! Every operation the model proposes passes through
//! [`ShadowModeGuard::check_operation`] before it touches disk. The guard
//! classifies the operation's risk, then either lets it through or returns a
//! [`PendingOperation`] that an operator must approve.
//!
//! A decision is made in this order:
//!
//! 1. An operator-approved queue entry with the same fingerprint is consumed
//!    and the operation passes. This is the only way past the always-gated
//!    types ([`OperationType::ProtectedPath`], [`OperationType::SensitiveChange`]).
//! 2. Otherwise always-gated types are held in every mode.
//! 3. The [`GuardMode`] lets through the severities it permits.
//! 4. A trust rule for the fingerprint lets the operation through.
//! 5. An identical undecided entry already in the queue is returned as is.
//! 6. A new entry goes to [`ShadowModeGuard::request_approval`].
//!
//! # Example
//!
//! ```rust,ignore
//! use autopatch::guard::ShadowModeGuard;
//!
//! let guard = ShadowModeGuard::open(project_dir, &config.guard)?;
//! if let Some(pending) = guard.check_operation(&op) {
//!     println!("held for review: {}", pending.id);
//! }
//! ```

pub mod classify;
pub mod redact;
pub mod store;

pub use classify::{Classification, RiskClassifier};
pub use redact::{Redactor, REDACTION_MARKER};
pub use store::{FileGuardStore, GuardStore, MemoryGuardStore};

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AuditEventType, AuditLogger};
use crate::config::{AutopatchConfig, GuardConfig};
use crate::error::Result;
use crate::operation::Operation;

// ============================================================================
// Types
// ============================================================================

/// How much the guard lets through without review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardMode {
    /// Everything except always-gated types passes.
    Disabled,
    /// Only low-severity operations pass.
    #[default]
    Enabled,
    /// Nothing passes.
    Strict,
}

impl GuardMode {
    /// Whether this mode lets an operation of `severity` through unreviewed.
    #[must_use]
    pub fn permits(&self, severity: Severity) -> bool {
        match self {
            Self::Disabled => true,
            Self::Enabled => severity == Severity::Low,
            Self::Strict => false,
        }
    }
}

impl std::fmt::Display for GuardMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "DISABLED"),
            Self::Enabled => write!(f, "ENABLED"),
            Self::Strict => write!(f, "STRICT"),
        }
    }
}

impl FromStr for GuardMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DISABLED" => Ok(Self::Disabled),
            "ENABLED" => Ok(Self::Enabled),
            "STRICT" => Ok(Self::Strict),
            other => Err(format!(
                "unknown guard mode '{other}' (expected disabled, enabled or strict)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Write,
    Delete,
    ConfigChange,
    SensitiveChange,
    ShellCommand,
    LargeEdit,
    ProtectedPath,
}

impl OperationType {
    /// Types that never pass on mode or trust alone.
    #[must_use]
    pub fn always_gated(&self) -> bool {
        matches!(self, Self::ProtectedPath | Self::SensitiveChange)
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Write => "WRITE",
            Self::Delete => "DELETE",
            Self::ConfigChange => "CONFIG_CHANGE",
            Self::SensitiveChange => "SENSITIVE_CHANGE",
            Self::ShellCommand => "SHELL_COMMAND",
            Self::LargeEdit => "LARGE_EDIT",
            Self::ProtectedPath => "PROTECTED_PATH",
        };
        write!(f, "{s}")
    }
}

/// An operation held for operator review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: String,
    pub operation_type: OperationType,
    pub severity: Severity,
    pub file_path: String,
    pub description: String,
    pub redacted_preview: String,
    /// `None` until an operator decides.
    pub approved: Option<bool>,
    pub approver_note: Option<String>,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// An approved fingerprint; identical operations pass without review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRule {
    pub fingerprint: String,
    pub operation_type: OperationType,
    pub description: String,
    pub approved_at: DateTime<Utc>,
    pub note: Option<String>,
}

/// Synchronous approval hook. Returns the operator's verdict.
pub type ApprovalCallback = Box<dyn Fn(&PendingOperation) -> bool + Send + Sync>;

// ============================================================================
// Guard
// ============================================================================

pub struct ShadowModeGuard {
    classifier: RiskClassifier,
    redactor: Redactor,
    store: Arc<dyn GuardStore>,
    callback: Option<ApprovalCallback>,
    audit: Option<Arc<AuditLogger>>,
    session_id: String,
}

impl std::fmt::Debug for ShadowModeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowModeGuard")
            .field("root", &self.classifier.root())
            .field("store", &self.store)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl ShadowModeGuard {
    /// Build a guard over an explicit store.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured glob does not compile.
    pub fn new(
        root: impl Into<PathBuf>,
        config: &GuardConfig,
        store: Arc<dyn GuardStore>,
    ) -> Result<Self> {
        Ok(Self {
            classifier: RiskClassifier::new(root, config)?,
            redactor: Redactor::new(),
            store,
            callback: None,
            audit: None,
            session_id: "cli".to_string(),
        })
    }

    /// Build a guard persisting to the project's state directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured glob does not compile.
    pub fn open(project_dir: impl Into<PathBuf>, config: &GuardConfig) -> Result<Self> {
        let root = project_dir.into();
        let store = Arc::new(FileGuardStore::new(AutopatchConfig::state_dir(&root)));
        Self::new(root, config, store)
    }

    #[must_use]
    pub fn with_callback(mut self, callback: ApprovalCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLogger>, session_id: impl Into<String>) -> Self {
        self.audit = Some(audit);
        self.session_id = session_id.into();
        self
    }

    #[must_use]
    pub fn classifier(&self) -> &RiskClassifier {
        &self.classifier
    }

    // ------------------------------------------------------------------------
    // Mode
    // ------------------------------------------------------------------------

    /// Current mode, read from the store. Falls back to
    /// [`GuardMode::Enabled`] when nothing usable is stored.
    #[must_use]
    pub fn mode(&self) -> GuardMode {
        match self.store.load_mode() {
            Ok(Some(mode)) => mode,
            Ok(None) => GuardMode::default(),
            Err(e) => {
                warn!("Failed to load guard mode, using ENABLED: {}", e);
                GuardMode::default()
            }
        }
    }

    /// Persist a new mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the mode cannot be written.
    pub fn set_mode(&self, mode: GuardMode) -> Result<()> {
        let previous = self.mode();
        self.store.save_mode(mode)?;
        info!("Guard mode {} -> {}", previous, mode);
        self.audit_event(
            AuditEventType::ModeChange,
            "operator",
            serde_json::json!({"from": previous.to_string(), "to": mode.to_string()}),
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Decisions
    // ------------------------------------------------------------------------

    /// Decide whether `op` may be applied now.
    ///
    /// Returns `None` when it may. Otherwise returns the queue entry holding
    /// it; `approved` is `Some(false)` if a configured callback denied it.
    /// Store failures leave the operation gated.
    pub fn check_operation(&self, op: &Operation) -> Option<PendingOperation> {
        let class = self.classifier.classify(op);
        let fingerprint = op.fingerprint();

        if class.malformed {
            warn!("Malformed operation classified LOW: {}", class.reason);
            self.audit_decision(AuditEventType::GuardMalformed, &fingerprint, &class, op);
        }

        match self.take_approved(&fingerprint) {
            Ok(Some(approved)) => {
                debug!("Consumed approval {} for {}", approved.id, op.describe());
                return None;
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to read pending queue: {}", e),
        }

        let gated = class.operation_type.always_gated();
        if !gated {
            let mode = self.mode();
            if mode.permits(class.severity) {
                debug!("{} auto-approved in {} mode", op.describe(), mode);
                self.audit_decision(AuditEventType::GuardAutoApproved, &fingerprint, &class, op);
                return None;
            }
            if self.is_trusted(&fingerprint) {
                debug!("{} matches a trust rule", op.describe());
                self.audit_decision(AuditEventType::GuardAutoApproved, &fingerprint, &class, op);
                return None;
            }
        }

        match self.store.load_queue() {
            Ok(queue) => {
                if let Some(existing) = queue
                    .into_iter()
                    .find(|p| p.fingerprint == fingerprint && p.approved.is_none())
                {
                    return Some(existing);
                }
            }
            Err(e) => warn!("Failed to read pending queue: {}", e),
        }

        let mut pending = self.build_pending(op, &class, fingerprint);
        info!(
            "Holding {} ({} {}) as {}",
            pending.description, pending.operation_type, pending.severity, pending.id
        );
        self.audit_decision(AuditEventType::GuardQueued, &pending.fingerprint, &class, op);

        if self.request_approval(&pending) {
            return None;
        }
        if self.callback.is_some() {
            pending.approved = Some(false);
        }
        Some(pending)
    }

    /// Ask for a verdict on `pending`.
    ///
    /// With a callback configured, returns its verdict and queues nothing.
    /// Without one, persists `pending` to the queue and returns `false`.
    pub fn request_approval(&self, pending: &PendingOperation) -> bool {
        if let Some(callback) = &self.callback {
            let approved = callback(pending);
            if approved && !pending.operation_type.always_gated() {
                if let Err(e) = self.add_trust(pending, None) {
                    warn!("Failed to record trust rule: {}", e);
                }
            }
            self.audit_verdict(approved, &pending.id, None);
            return approved;
        }

        let entry = pending.clone();
        if let Err(e) = self.store.modify_queue(&mut |queue| queue.push(entry.clone())) {
            warn!("Failed to persist pending operation {}: {}", pending.id, e);
        }
        false
    }

    /// Mark a queued operation approved. Non-critical types also gain a
    /// trust rule so identical operations pass from now on.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be persisted.
    pub fn approve_operation(&self, id: &str, note: Option<&str>) -> Result<bool> {
        let mut found: Option<PendingOperation> = None;
        self.store.modify_queue(&mut |queue| {
            if let Some(entry) = queue.iter_mut().find(|p| p.id == id) {
                entry.approved = Some(true);
                entry.approver_note = note.map(str::to_string);
                found = Some(entry.clone());
            }
        })?;

        let Some(entry) = found else {
            return Ok(false);
        };
        if !entry.operation_type.always_gated() {
            self.add_trust(&entry, note)?;
        }
        info!("Approved {} ({})", id, entry.description);
        self.audit_verdict(true, id, note);
        Ok(true)
    }

    /// Reject and remove a queued operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be persisted.
    pub fn reject_operation(&self, id: &str, note: Option<&str>) -> Result<bool> {
        let mut removed = false;
        self.store.modify_queue(&mut |queue| {
            let before = queue.len();
            queue.retain(|p| p.id != id);
            removed = queue.len() != before;
        })?;

        if removed {
            info!("Rejected {}", id);
            self.audit_verdict(false, id, note);
        }
        Ok(removed)
    }

    /// Remove and return an approved entry with `fingerprint`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be persisted.
    pub fn take_approved(&self, fingerprint: &str) -> Result<Option<PendingOperation>> {
        let has_match = self
            .store
            .load_queue()?
            .iter()
            .any(|p| p.fingerprint == fingerprint && p.approved == Some(true));
        if !has_match {
            return Ok(None);
        }

        let mut taken = None;
        self.store.modify_queue(&mut |queue| {
            if let Some(pos) = queue
                .iter()
                .position(|p| p.fingerprint == fingerprint && p.approved == Some(true))
            {
                taken = Some(queue.remove(pos));
            }
        })?;
        Ok(taken)
    }

    // ------------------------------------------------------------------------
    // Queue and trust management
    // ------------------------------------------------------------------------

    /// Everything currently queued, decided or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn pending(&self) -> Result<Vec<PendingOperation>> {
        self.store.load_queue()
    }

    /// Empty the queue. Returns how many entries were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be persisted.
    pub fn clear_pending(&self) -> Result<usize> {
        let mut cleared = 0;
        self.store.modify_queue(&mut |queue| {
            cleared = queue.len();
            queue.clear();
        })?;
        if cleared > 0 {
            info!("Cleared {} pending operation(s)", cleared);
            self.audit_event(
                AuditEventType::QueueCleared,
                "operator",
                serde_json::json!({"count": cleared}),
            );
        }
        Ok(cleared)
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn trust_rules(&self) -> Result<Vec<TrustRule>> {
        self.store.load_trust()
    }

    /// Drop the trust rule for `fingerprint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the rules cannot be persisted.
    pub fn revoke_trust(&self, fingerprint: &str) -> Result<bool> {
        let mut removed = false;
        self.store.modify_trust(&mut |rules| {
            let before = rules.len();
            rules.retain(|r| r.fingerprint != fingerprint);
            removed = rules.len() != before;
        })?;
        if removed {
            self.audit_event(
                AuditEventType::TrustRevoked,
                "operator",
                serde_json::json!({"fingerprint": fingerprint}),
            );
        }
        Ok(removed)
    }

    fn is_trusted(&self, fingerprint: &str) -> bool {
        match self.store.load_trust() {
            Ok(rules) => rules.iter().any(|r| r.fingerprint == fingerprint),
            Err(e) => {
                warn!("Failed to read trust rules: {}", e);
                false
            }
        }
    }

    fn add_trust(&self, pending: &PendingOperation, note: Option<&str>) -> Result<()> {
        let rule = TrustRule {
            fingerprint: pending.fingerprint.clone(),
            operation_type: pending.operation_type,
            description: pending.description.clone(),
            approved_at: Utc::now(),
            note: note.map(str::to_string),
        };
        self.store.modify_trust(&mut |rules| {
            if !rules.iter().any(|r| r.fingerprint == rule.fingerprint) {
                rules.push(rule.clone());
            }
        })
    }

    fn build_pending(
        &self,
        op: &Operation,
        class: &Classification,
        fingerprint: String,
    ) -> PendingOperation {
        let sensitive = class.operation_type == OperationType::SensitiveChange;
        PendingOperation {
            id: uuid::Uuid::new_v4().to_string(),
            operation_type: class.operation_type,
            severity: class.severity,
            file_path: class.file_path.clone(),
            description: self
                .redactor
                .redact_summary(&format!("{} [{}]", op.describe(), class.reason)),
            redacted_preview: self.redactor.redact(&op.preview_source(), sensitive),
            approved: None,
            approver_note: None,
            fingerprint,
            created_at: Utc::now(),
        }
    }

    // ------------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------------

    fn audit_event(&self, event_type: AuditEventType, actor: &str, data: serde_json::Value) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_event(event_type, &self.session_id, actor, data) {
                warn!("Failed to write audit entry: {}", e);
            }
        }
    }

    fn audit_decision(
        &self,
        event_type: AuditEventType,
        fingerprint: &str,
        class: &Classification,
        op: &Operation,
    ) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_guard_decision(
                event_type,
                &self.session_id,
                fingerprint,
                &class.operation_type.to_string(),
                &class.severity.to_string(),
                &op.describe(),
            ) {
                warn!("Failed to write audit entry: {}", e);
            }
        }
    }

    fn audit_verdict(&self, approved: bool, id: &str, note: Option<&str>) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_verdict(&self.session_id, approved, id, note) {
                warn!("Failed to write audit entry: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn memory_guard(mode: GuardMode) -> ShadowModeGuard {
        let guard = ShadowModeGuard::new(
            "/work/project",
            &GuardConfig::default(),
            Arc::new(MemoryGuardStore::new()),
        )
        .unwrap();
        guard.set_mode(mode).unwrap();
        guard
    }

    fn sample_ops() -> Vec<Operation> {
        vec![
            Operation::new("write_file", json!({"path": "src/a.py", "content": "x = 1"})),
            Operation::new("delete_file", json!({"path": "a.py"})),
            Operation::new("run_command", json!({"command": "pytest"})),
            Operation::new("write_file", json!({"path": "setup.cfg", "content": "[x]"})),
            Operation::new("write_file", json!({"path": "big.py", "content": "x".repeat(5000)})),
        ]
    }

    fn critical_ops() -> Vec<Operation> {
        vec![
            Operation::new("write_file", json!({"path": ".env", "content": "KEY=abc"})),
            Operation::new("write_file", json!({"path": "/etc/hosts", "content": "1.2.3.4 x"})),
            Operation::new("delete_file", json!({"path": "certs/server.key"})),
        ]
    }

    // ========================================================================
    // Mode semantics
    // ========================================================================

    #[test]
    fn test_always_gated_in_every_mode() {
        for mode in [GuardMode::Disabled, GuardMode::Enabled, GuardMode::Strict] {
            let guard = memory_guard(mode);
            for op in critical_ops() {
                let pending = guard.check_operation(&op);
                assert!(pending.is_some(), "{mode}: {}", op.describe());
                assert_eq!(pending.unwrap().severity, Severity::Critical);
            }
        }
    }

    #[test]
    fn test_disabled_passes_everything_else() {
        let guard = memory_guard(GuardMode::Disabled);
        for op in sample_ops() {
            assert!(guard.check_operation(&op).is_none(), "{}", op.describe());
        }
        assert!(guard.pending().unwrap().is_empty());
    }

    #[test]
    fn test_strict_gates_everything() {
        let guard = memory_guard(GuardMode::Strict);
        for op in sample_ops() {
            assert!(guard.check_operation(&op).is_some(), "{}", op.describe());
        }
        assert_eq!(guard.pending().unwrap().len(), sample_ops().len());
    }

    #[test]
    fn test_enabled_passes_only_low() {
        let guard = memory_guard(GuardMode::Enabled);
        let ops = sample_ops();
        assert!(guard.check_operation(&ops[0]).is_none());
        for op in &ops[1..] {
            assert!(guard.check_operation(op).is_some(), "{}", op.describe());
        }
    }

    #[test]
    fn test_mode_persists_across_instances() {
        let temp = TempDir::new().unwrap();
        let config = GuardConfig::default();

        let first = ShadowModeGuard::open(temp.path(), &config).unwrap();
        assert_eq!(first.mode(), GuardMode::Enabled);
        first.set_mode(GuardMode::Strict).unwrap();

        let second = ShadowModeGuard::open(temp.path(), &config).unwrap();
        assert_eq!(second.mode(), GuardMode::Strict);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("strict".parse::<GuardMode>().unwrap(), GuardMode::Strict);
        assert_eq!(" Disabled\n".parse::<GuardMode>().unwrap(), GuardMode::Disabled);
        assert!("loose".parse::<GuardMode>().is_err());
    }

    // ========================================================================
    // Approval flow
    // ========================================================================

    #[test]
    fn test_delete_approval_scenario() {
        let temp = TempDir::new().unwrap();
        let guard = ShadowModeGuard::open(temp.path(), &GuardConfig::default()).unwrap();
        let op = Operation::new("delete_file", json!({"path": "a.py"}));

        let pending = guard.check_operation(&op).unwrap();
        assert_eq!(pending.severity, Severity::High);
        assert_eq!(pending.operation_type, OperationType::Delete);
        assert_eq!(pending.approved, None);

        assert!(guard.approve_operation(&pending.id, Some("fine")).unwrap());
        let queued = guard.pending().unwrap();
        assert_eq!(queued[0].approved, Some(true));
        assert_eq!(queued[0].approver_note.as_deref(), Some("fine"));

        assert!(guard.check_operation(&op).is_none());
        assert!(guard.pending().unwrap().is_empty());
        // The trust rule keeps later identical deletes flowing.
        assert!(guard.check_operation(&op).is_none());
        assert_eq!(guard.trust_rules().unwrap().len(), 1);
    }

    #[test]
    fn test_identical_check_does_not_duplicate_queue() {
        let guard = memory_guard(GuardMode::Enabled);
        let op = Operation::new("delete_file", json!({"path": "a.py"}));

        let first = guard.check_operation(&op).unwrap();
        let second = guard.check_operation(&op).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(guard.pending().unwrap().len(), 1);
    }

    #[test]
    fn test_sensitive_approval_is_one_shot() {
        let guard = memory_guard(GuardMode::Enabled);
        let op = Operation::new("write_file", json!({"path": ".env", "content": "KEY=abc"}));

        let pending = guard.check_operation(&op).unwrap();
        guard.approve_operation(&pending.id, None).unwrap();
        assert!(guard.trust_rules().unwrap().is_empty());

        assert!(guard.check_operation(&op).is_none());
        assert!(guard.check_operation(&op).is_some());
    }

    #[test]
    fn test_reject_removes_entry() {
        let guard = memory_guard(GuardMode::Strict);
        let op = Operation::new("write_file", json!({"path": "a.py", "content": "x"}));
        let pending = guard.check_operation(&op).unwrap();

        assert!(guard.reject_operation(&pending.id, Some("no")).unwrap());
        assert!(guard.pending().unwrap().is_empty());
        assert!(!guard.reject_operation(&pending.id, None).unwrap());
        assert!(!guard.approve_operation("missing", None).unwrap());
    }

    #[test]
    fn test_sensitive_preview_is_redacted() {
        for mode in [GuardMode::Disabled, GuardMode::Enabled, GuardMode::Strict] {
            let guard = memory_guard(mode);
            let op = Operation::new("write_file", json!({"path": ".env", "content": "KEY=abc"}));
            let pending = guard.check_operation(&op).unwrap();

            assert_eq!(pending.severity, Severity::Critical);
            assert!(pending.redacted_preview.contains(REDACTION_MARKER));
            assert!(!pending.redacted_preview.contains("abc"));
            assert!(!pending.description.contains("abc"));
        }
    }

    #[test]
    fn test_command_secrets_never_reach_the_queue_file() {
        let temp = TempDir::new().unwrap();
        let guard = ShadowModeGuard::open(temp.path(), &GuardConfig::default()).unwrap();
        let op = Operation::new(
            "run_command",
            json!({"command": "API_KEY=sk-live-SECRET123 ./deploy.sh"}),
        );

        let pending = guard.check_operation(&op).unwrap();
        assert!(!pending.description.contains("sk-live-SECRET123"));
        assert!(pending.description.contains("API_KEY=[REDACTED]"));
        assert!(!pending.redacted_preview.contains("sk-live-SECRET123"));

        let on_disk = std::fs::read_to_string(
            AutopatchConfig::state_dir(temp.path()).join(store::QUEUE_FILE),
        )
        .unwrap();
        assert!(on_disk.contains(&pending.id));
        assert!(!on_disk.contains("sk-live-SECRET123"));
    }

    #[test]
    fn test_callback_verdict_is_not_queued() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let guard = memory_guard(GuardMode::Enabled).with_callback(Box::new(move |p| {
            counter.fetch_add(1, Ordering::SeqCst);
            p.operation_type != OperationType::ShellCommand
        }));

        let delete = Operation::new("delete_file", json!({"path": "a.py"}));
        assert!(guard.check_operation(&delete).is_none());

        let shell = Operation::new("run_command", json!({"command": "make"}));
        let denied = guard.check_operation(&shell).unwrap();
        assert_eq!(denied.approved, Some(false));

        assert!(guard.pending().unwrap().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Approved delete left a trust rule; the callback is not asked again.
        assert!(guard.check_operation(&delete).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clear_pending_is_idempotent() {
        let guard = memory_guard(GuardMode::Strict);
        for op in sample_ops() {
            guard.check_operation(&op);
        }
        assert_eq!(guard.clear_pending().unwrap(), sample_ops().len());
        assert_eq!(guard.clear_pending().unwrap(), 0);
    }

    #[test]
    fn test_revoke_trust() {
        let guard = memory_guard(GuardMode::Enabled);
        let op = Operation::new("delete_file", json!({"path": "a.py"}));
        let pending = guard.check_operation(&op).unwrap();
        guard.approve_operation(&pending.id, None).unwrap();
        guard.check_operation(&op);

        assert!(guard.revoke_trust(&op.fingerprint()).unwrap());
        assert!(guard.check_operation(&op).is_some());
    }

    #[test]
    fn test_malformed_operation_is_low_and_audited() {
        let temp = TempDir::new().unwrap();
        let audit = Arc::new(AuditLogger::new(temp.path().to_path_buf()).unwrap());
        let guard = ShadowModeGuard::open(temp.path(), &GuardConfig::default())
            .unwrap()
            .with_audit(Arc::clone(&audit), "run-1");

        let op = Operation::new("delete_file", json!({"file": 7}));
        assert!(guard.check_operation(&op).is_none());

        let malformed: Vec<_> = audit
            .read_entries()
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == AuditEventType::GuardMalformed)
            .collect();
        assert_eq!(malformed.len(), 1);
        assert_eq!(malformed[0].data["severity"], "LOW");
    }

    #[test]
    fn test_corrupt_queue_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let state = AutopatchConfig::state_dir(temp.path());
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join(store::QUEUE_FILE), "[{broken").unwrap();

        let guard = ShadowModeGuard::open(temp.path(), &GuardConfig::default()).unwrap();
        assert!(guard.pending().unwrap().is_empty());
        assert_eq!(guard.clear_pending().unwrap(), 0);
    }
}
