//! Circuit breaker and hourly call budget for model requests.
//!
//! The breaker counts consecutive failed loops in which a model call was
//! made; a loop counts as a success only once its verification passes.
//! Once the count reaches the configured threshold it opens and blocks
//! calls until the cooldown has passed, then lets exactly one trial through
//! (half-open). A trial that is never resolved (cancelled, or lost with a
//! crashed process) expires after another cooldown and a fresh trial is
//! admitted. A successful trial closes the breaker; a failed one re-opens it.
//!
//! Independently, a per-clock-hour counter blocks calls once the quota is
//! spent and resets when the hour rolls over.
//!
//! Both halves persist under the state directory so that a restarted run
//! does not immediately hammer a backend that was failing a minute ago.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AuditEventType, AuditLogger};
use crate::config::{AutopatchConfig, CircuitConfig};
use crate::error::{AutopatchError, Result};
use crate::persist::{read_json, with_lock, write_json};

/// Breaker state file inside the state directory.
pub const CIRCUIT_FILE: &str = "circuit.json";
/// Hourly call counter file inside the state directory.
pub const CALL_COUNT_FILE: &str = "call_count.json";

const LOCK_FILE: &str = "circuit.lock";

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<DateTime<Utc>>,
    last_error: Option<String>,
    opened_at: Option<DateTime<Utc>>,
    /// Set while the single half-open trial is outstanding.
    trial_in_flight: bool,
    trial_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CallCount {
    hour_start: DateTime<Utc>,
    count: u32,
}

impl CallCount {
    fn starting(now: DateTime<Utc>) -> Self {
        Self {
            hour_start: hour_start(now),
            count: 0,
        }
    }
}

fn hour_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::hours(1)).unwrap_or(now)
}

/// Snapshot of breaker and budget, for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Seconds until an open circuit allows a trial.
    pub cooldown_remaining_secs: Option<i64>,
    pub calls_this_hour: u32,
    pub hourly_quota: u32,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Gate for model calls, owned by the loop driver.
///
/// Mutating methods persist immediately when the breaker was created with
/// [`CircuitBreaker::load`]. An in-memory breaker never touches disk.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    state_dir: Option<PathBuf>,
    breaker: BreakerState,
    calls: CallCount,
    audit: Option<Arc<AuditLogger>>,
    session_id: String,
}

impl CircuitBreaker {
    /// Breaker that lives only in memory.
    #[must_use]
    pub fn in_memory(config: CircuitConfig) -> Self {
        Self {
            config,
            state_dir: None,
            breaker: BreakerState::default(),
            calls: CallCount::starting(Utc::now()),
            audit: None,
            session_id: "cli".to_string(),
        }
    }

    /// Load persisted state for a project. Missing or corrupt files start
    /// fresh.
    #[must_use]
    pub fn load(project_dir: &Path, config: CircuitConfig) -> Self {
        let state_dir = AutopatchConfig::state_dir(project_dir);
        let breaker = read_json(&state_dir.join(CIRCUIT_FILE)).unwrap_or_default();
        let calls = read_json(&state_dir.join(CALL_COUNT_FILE))
            .unwrap_or_else(|| CallCount::starting(Utc::now()));
        Self {
            config,
            state_dir: Some(state_dir),
            breaker,
            calls,
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

    /// Persist both files.
    ///
    /// # Errors
    ///
    /// Returns an error if the state files cannot be written.
    pub fn save(&self) -> Result<()> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        with_lock(&dir.join(LOCK_FILE), || {
            write_json(&dir.join(CIRCUIT_FILE), &self.breaker)?;
            write_json(&dir.join(CALL_COUNT_FILE), &self.calls)
        })
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            warn!("Failed to persist circuit state: {}", e);
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.breaker.state
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.breaker.consecutive_failures
    }

    /// Whether a call would be allowed right now, without reserving it.
    #[must_use]
    pub fn can_execute(&self) -> bool {
        self.blocked_reason(Utc::now()).is_none()
    }

    /// Reserve one model call.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::CircuitOpen`] with the reason the call is
    /// blocked: an open circuit, an outstanding half-open trial, or a spent
    /// hourly quota.
    pub fn check(&mut self) -> Result<()> {
        self.check_at(Utc::now())
    }

    /// [`check`](Self::check) against an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`check`](Self::check).
    pub fn check_at(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.roll_hour(now);
        if let Some(reason) = self.blocked_reason(now) {
            debug!("Model call blocked: {}", reason);
            return Err(AutopatchError::CircuitOpen { reason });
        }

        if self.breaker.state == CircuitState::Open {
            info!("Circuit half-open: allowing one trial call");
            self.breaker.state = CircuitState::HalfOpen;
        } else if self.breaker.state == CircuitState::HalfOpen && self.breaker.trial_in_flight {
            warn!("Previous trial call never resolved; allowing a new one");
        }
        if self.breaker.state == CircuitState::HalfOpen {
            self.breaker.trial_in_flight = true;
            self.breaker.trial_started_at = Some(now);
        }
        self.calls.count += 1;
        self.persist();
        Ok(())
    }

    /// Give back an unresolved half-open trial, so the next call may try
    /// again. A no-op in any other state.
    pub fn release_trial(&mut self) {
        if self.breaker.state == CircuitState::HalfOpen && self.breaker.trial_in_flight {
            debug!("Releasing unresolved trial call");
            self.breaker.trial_in_flight = false;
            self.breaker.trial_started_at = None;
            self.persist();
        }
    }

    fn blocked_reason(&self, now: DateTime<Utc>) -> Option<String> {
        match self.breaker.state {
            CircuitState::Open => {
                let remaining = self.cooldown_remaining(now).unwrap_or(0);
                if remaining > 0 {
                    return Some(format!(
                        "Circuit open after {} consecutive failures; retry in {}s",
                        self.breaker.consecutive_failures, remaining
                    ));
                }
            }
            CircuitState::HalfOpen if self.trial_outstanding(now) => {
                return Some("Circuit half-open: trial call already in flight".to_string());
            }
            _ => {}
        }

        let count = if hour_start(now) > self.calls.hour_start {
            0
        } else {
            self.calls.count
        };
        if count >= self.config.hourly_quota {
            let resets = self.calls.hour_start + Duration::hours(1);
            return Some(format!(
                "Hourly call quota of {} reached; resets at {}",
                self.config.hourly_quota,
                resets.format("%H:%M UTC")
            ));
        }
        None
    }

    /// A trial is outstanding until it resolves or one cooldown passes.
    fn trial_outstanding(&self, now: DateTime<Utc>) -> bool {
        if !self.breaker.trial_in_flight {
            return false;
        }
        let Some(started) = self.breaker.trial_started_at else {
            return false;
        };
        let cooldown = i64::try_from(self.config.cooldown_secs).unwrap_or(i64::MAX);
        (now - started).num_seconds() < cooldown
    }

    fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.breaker.state != CircuitState::Open {
            return None;
        }
        let opened = self.breaker.opened_at?;
        let cooldown = i64::try_from(self.config.cooldown_secs).unwrap_or(i64::MAX);
        let elapsed = (now - opened).num_seconds();
        Some((cooldown - elapsed).max(0))
    }

    fn roll_hour(&mut self, now: DateTime<Utc>) {
        let current = hour_start(now);
        if current > self.calls.hour_start {
            debug!("Call budget rolled over to {}", current);
            self.calls = CallCount::starting(now);
        }
    }

    /// A loop succeeded: clear the failure count and close.
    pub fn record_success(&mut self) {
        if self.breaker.state != CircuitState::Closed {
            info!("Circuit closed after successful call");
        }
        self.breaker.state = CircuitState::Closed;
        self.breaker.consecutive_failures = 0;
        self.breaker.opened_at = None;
        self.breaker.trial_in_flight = false;
        self.breaker.trial_started_at = None;
        self.persist();
    }

    /// A loop that made a model call failed.
    pub fn record_failure(&mut self, error: &str) {
        self.record_failure_at(error, Utc::now());
    }

    /// [`record_failure`](Self::record_failure) against an explicit clock.
    pub fn record_failure_at(&mut self, error: &str, now: DateTime<Utc>) {
        self.breaker.consecutive_failures += 1;
        self.breaker.last_failure = Some(now);
        self.breaker.last_error = Some(error.to_string());
        self.breaker.trial_in_flight = false;
        self.breaker.trial_started_at = None;

        let reopen = self.breaker.state == CircuitState::HalfOpen;
        let trip = self.breaker.state == CircuitState::Closed
            && self.breaker.consecutive_failures >= self.config.failure_threshold;
        if reopen || trip {
            warn!(
                "Circuit opened after {} consecutive failures: {}",
                self.breaker.consecutive_failures, error
            );
            self.breaker.state = CircuitState::Open;
            self.breaker.opened_at = Some(now);
        }
        self.persist();
    }

    /// Close the breaker and forget failures.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be persisted.
    pub fn reset(&mut self) -> Result<()> {
        self.breaker = BreakerState::default();
        self.audit_reset("breaker");
        self.save()
    }

    /// Zero the hourly call counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be persisted.
    pub fn reset_budget(&mut self) -> Result<()> {
        self.calls = CallCount::starting(Utc::now());
        self.audit_reset("budget");
        self.save()
    }

    fn audit_reset(&self, what: &str) {
        if let Some(audit) = &self.audit {
            let data = serde_json::json!({ "reset": what });
            if let Err(e) =
                audit.log_event(AuditEventType::CircuitReset, &self.session_id, "operator", data)
            {
                warn!("Failed to write audit entry: {}", e);
            }
        }
    }

    #[must_use]
    pub fn status(&self) -> CircuitStatus {
        self.status_at(Utc::now())
    }

    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>) -> CircuitStatus {
        let calls_this_hour = if hour_start(now) > self.calls.hour_start {
            0
        } else {
            self.calls.count
        };
        CircuitStatus {
            state: self.breaker.state,
            consecutive_failures: self.breaker.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            last_failure: self.breaker.last_failure,
            last_error: self.breaker.last_error.clone(),
            cooldown_remaining_secs: self.cooldown_remaining(now),
            calls_this_hour,
            hourly_quota: self.config.hourly_quota,
        }
    }
}
