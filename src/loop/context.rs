//! Per-run loop state.
//!
//! A [`LoopContext`] is created when a task starts, is mutated only by the
//! active state's `handle`, and is consumed into a [`LoopSummary`] when the
//! loop terminates.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::state::StateKind;
use crate::guard::PendingOperation;
use crate::operation::Operation;
use crate::testing::ModelContext;

// ============================================================================
// Exit reasons
// ============================================================================

pub const EXIT_PLAN_COMPLETE: &str = "plan complete";
pub const EXIT_DEADLOCK: &str = "Deadlock Detected";
pub const EXIT_MAX_LOOPS: &str = "Maximum loops reached";
pub const EXIT_TIMEOUT: &str = "Task timed out";
pub const EXIT_CANCELLED: &str = "Cancelled by operator";
pub const EXIT_RETRIES_EXHAUSTED: &str = "Maximum retries exceeded";
pub const EXIT_DELEGATED: &str = "Delegated to interactive session";

// ============================================================================
// Errors
// ============================================================================

/// Class of an error recorded during a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Backend output could not be turned into operations.
    Format,
    /// Backend unreachable, failed, or blocked by the circuit breaker.
    Backend,
    /// An operation could not be applied.
    Patch,
    /// The project failed verification.
    Verification,
    /// The task deadline passed mid-state.
    Timeout,
}

impl ErrorKind {
    /// Tie-break order when two kinds are equally frequent.
    fn priority(self) -> u8 {
        match self {
            Self::Verification => 0,
            Self::Patch => 1,
            Self::Format => 2,
            Self::Timeout => 3,
            Self::Backend => 4,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Format => "format",
            Self::Backend => "backend",
            Self::Patch => "patch",
            Self::Verification => "verification",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopError {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

// ============================================================================
// Loop Context
// ============================================================================

/// Mutable state for one task run.
#[derive(Debug)]
pub struct LoopContext {
    pub task: String,
    pub loop_count: u32,
    /// Recovery retries since the last successful verification.
    pub retry_count: u32,
    pub max_retries: u32,

    pub current_state: Option<StateKind>,
    state_started: Option<Instant>,
    pub state_durations: BTreeMap<StateKind, Duration>,

    pub proposed_operations: Vec<Operation>,
    /// Files this loop modified or deleted.
    pub files_modified: BTreeSet<String>,
    /// Files this loop created.
    pub files_created: BTreeSet<String>,
    /// Files changed by loops that passed verification.
    pub files_kept: BTreeSet<String>,
    pub patch_errors: Vec<String>,
    /// Operations the guard withheld this loop.
    pub blocked_operations: Vec<PendingOperation>,
    /// `report_status` messages, across the whole run.
    pub status_reports: Vec<String>,

    pub errors_this_loop: Vec<LoopError>,
    /// What `errors_this_loop` held when the current loop began.
    pub previous_errors: Vec<LoopError>,
    pub verification_passed: bool,
    pub verification_error: Option<String>,

    /// Injected into the next Thinking prompt, then cleared.
    pub recovery_prompt: Option<String>,
    pub last_output: Option<String>,
    /// Open checkpoint started by this run.
    pub transaction_id: Option<String>,
    /// The circuit breaker admitted a model call this loop.
    pub model_called: bool,
    /// Error signatures of recent failed loops, newest last.
    pub error_history: VecDeque<String>,

    pub should_exit: bool,
    pub exit_reason: Option<String>,

    started_at: Instant,
    deadline: Option<Instant>,
}

impl LoopContext {
    #[must_use]
    pub fn new(task: impl Into<String>, max_retries: u32) -> Self {
        Self {
            task: task.into(),
            loop_count: 0,
            retry_count: 0,
            max_retries,
            current_state: None,
            state_started: None,
            state_durations: BTreeMap::new(),
            proposed_operations: Vec::new(),
            files_modified: BTreeSet::new(),
            files_created: BTreeSet::new(),
            files_kept: BTreeSet::new(),
            patch_errors: Vec::new(),
            blocked_operations: Vec::new(),
            status_reports: Vec::new(),
            errors_this_loop: Vec::new(),
            previous_errors: Vec::new(),
            verification_passed: false,
            verification_error: None,
            recovery_prompt: None,
            last_output: None,
            transaction_id: None,
            model_called: false,
            error_history: VecDeque::new(),
            should_exit: false,
            exit_reason: None,
            started_at: Instant::now(),
            deadline: None,
        }
    }

    /// Set the wall-clock budget, measured from creation.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(self.started_at + timeout);
        self
    }

    /// Time left before the deadline. `None` when there is no deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    #[must_use]
    pub fn deadline_passed(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Start a new iteration: bump the counter and clear per-loop state.
    pub fn begin_loop(&mut self) {
        self.loop_count += 1;
        self.previous_errors = std::mem::take(&mut self.errors_this_loop);
        self.proposed_operations.clear();
        self.files_modified.clear();
        self.files_created.clear();
        self.patch_errors.clear();
        self.blocked_operations.clear();
        self.verification_passed = false;
        self.model_called = false;
    }

    /// Record a transition into `state`, closing the previous state's timer.
    pub fn enter_state(&mut self, state: StateKind) {
        self.finish_state();
        self.current_state = Some(state);
        self.state_started = Some(Instant::now());
    }

    /// Close the current state's timer.
    pub fn finish_state(&mut self) {
        if let (Some(state), Some(started)) = (self.current_state, self.state_started.take()) {
            *self.state_durations.entry(state).or_default() += started.elapsed();
        }
    }

    pub fn record_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.errors_this_loop.push(LoopError {
            kind,
            message: message.into(),
        });
    }

    /// Mark the run for termination. The first reason wins.
    pub fn request_exit(&mut self, reason: impl Into<String>) {
        self.should_exit = true;
        if self.exit_reason.is_none() {
            self.exit_reason = Some(reason.into());
        }
    }

    /// Most frequent error kind this loop, ties broken by severity.
    #[must_use]
    pub fn dominant_error_kind(&self) -> Option<ErrorKind> {
        let mut counts: BTreeMap<ErrorKind, usize> = BTreeMap::new();
        for error in &self.errors_this_loop {
            *counts.entry(error.kind).or_default() += 1;
        }
        counts
            .into_iter()
            .max_by(|(ka, ca), (kb, cb)| ca.cmp(cb).then(kb.priority().cmp(&ka.priority())))
            .map(|(kind, _)| kind)
    }

    /// Messages of the given kind recorded this loop, newline-joined.
    #[must_use]
    pub fn messages_of(&self, kind: ErrorKind) -> String {
        self.errors_this_loop
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Stable digest of this loop's error set. Order and duplicates do not
    /// matter; surrounding whitespace is ignored.
    #[must_use]
    pub fn error_signature(&self) -> Option<String> {
        if self.errors_this_loop.is_empty() {
            return None;
        }
        let set: BTreeSet<String> = self
            .errors_this_loop
            .iter()
            .map(|e| {
                let normalized = e.message.split_whitespace().collect::<Vec<_>>().join(" ");
                format!("{}:{}", e.kind, normalized)
            })
            .collect();
        let mut hasher = Sha256::new();
        for entry in &set {
            hasher.update(entry.as_bytes());
            hasher.update([0u8]);
        }
        Some(hex::encode(&hasher.finalize()[..8]))
    }

    /// Push a failed loop's signature. Returns true once the last
    /// `threshold` signatures are identical.
    pub fn push_error_signature(&mut self, signature: String, threshold: u32) -> bool {
        let threshold = threshold.max(1) as usize;
        self.error_history.push_back(signature);
        while self.error_history.len() > threshold {
            self.error_history.pop_front();
        }
        self.error_history.len() == threshold
            && self
                .error_history
                .iter()
                .all(|s| Some(s) == self.error_history.back())
    }

    /// A verification passed: retries and the deadlock window start over.
    pub fn record_success(&mut self) {
        self.files_kept.extend(self.files_modified.iter().cloned());
        self.files_kept.extend(self.files_created.iter().cloned());
        self.retry_count = 0;
        self.error_history.clear();
        self.verification_passed = true;
        self.verification_error = None;
    }

    /// Context handed to the backend for the next request.
    #[must_use]
    pub fn model_context(&self) -> ModelContext {
        ModelContext {
            task: self.task.clone(),
            loop_count: self.loop_count,
            retry_count: self.retry_count,
            previous_errors: self.previous_errors.iter().map(ToString::to_string).collect(),
            verification_error: self.verification_error.clone(),
            blocked_operations: self
                .blocked_operations
                .iter()
                .map(|p| format!("{} {}", p.id, p.description))
                .collect(),
            files_modified: self.files_modified.iter().cloned().collect(),
            files_created: self.files_created.iter().cloned().collect(),
        }
    }

    /// Consume into a summary.
    #[must_use]
    pub fn into_summary(mut self) -> LoopSummary {
        self.finish_state();
        let elapsed = self.elapsed();
        LoopSummary {
            task: self.task,
            exit_reason: self
                .exit_reason
                .unwrap_or_else(|| "Loop terminated".to_string()),
            loops: self.loop_count,
            retries: self.retry_count,
            files_changed: self.files_kept.into_iter().collect(),
            last_errors: self
                .errors_this_loop
                .iter()
                .map(ToString::to_string)
                .collect(),
            status_reports: self.status_reports,
            state_durations_ms: self
                .state_durations
                .into_iter()
                .map(|(k, d)| (k.to_string(), u64::try_from(d.as_millis()).unwrap_or(u64::MAX)))
                .collect(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

// ============================================================================
// Summary
// ============================================================================

/// Outcome of one task run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopSummary {
    pub task: String,
    pub exit_reason: String,
    pub loops: u32,
    pub retries: u32,
    /// Files changed by loops that passed verification.
    pub files_changed: Vec<String>,
    /// Errors recorded during the final loop.
    pub last_errors: Vec<String>,
    pub status_reports: Vec<String>,
    pub state_durations_ms: BTreeMap<String, u64>,
    pub elapsed_ms: u64,
}

impl LoopSummary {
    /// Whether the run ended because the work is done.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_reason == EXIT_PLAN_COMPLETE || self.exit_reason == EXIT_DELEGATED
    }

    /// Process exit code for this outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else if self.exit_reason.starts_with(EXIT_DEADLOCK) {
            3
        } else if self.exit_reason.starts_with("Transaction") {
            4
        } else if self.exit_reason == EXIT_CANCELLED {
            130
        } else {
            1
        }
    }
}
