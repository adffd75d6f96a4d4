//! State trait and transition results for the orchestration loop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::context::LoopContext;
use super::env::LoopEnv;

/// Which state the machine is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Thinking,
    Patching,
    Verifying,
    Recovery,
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateKind::Thinking => write!(f, "thinking"),
            StateKind::Patching => write!(f, "patching"),
            StateKind::Verifying => write!(f, "verifying"),
            StateKind::Recovery => write!(f, "recovery"),
        }
    }
}

/// Outcome of one `handle` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateResult {
    Success,
    Failure,
    Retry,
    Exit,
}

impl std::fmt::Display for StateResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateResult::Success => write!(f, "SUCCESS"),
            StateResult::Failure => write!(f, "FAILURE"),
            StateResult::Retry => write!(f, "RETRY"),
            StateResult::Exit => write!(f, "EXIT"),
        }
    }
}

/// One state of the loop.
///
/// The driver calls `on_enter` once, then `handle`, then asks `next_state`
/// where to go. Returning `None` from `next_state` terminates the run.
#[async_trait]
pub trait State: Send + Sync {
    fn kind(&self) -> StateKind;

    fn name(&self) -> String {
        self.kind().to_string()
    }

    async fn on_enter(&mut self, _ctx: &mut LoopContext, _env: &mut LoopEnv) {}

    async fn handle(&mut self, ctx: &mut LoopContext, env: &mut LoopEnv) -> StateResult;

    fn next_state(&self, ctx: &LoopContext, result: StateResult) -> Option<Box<dyn State>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_kind_display_matches_serde() {
        for kind in [
            StateKind::Thinking,
            StateKind::Patching,
            StateKind::Verifying,
            StateKind::Recovery,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json.trim_matches('"'), kind.to_string());
        }
    }

    #[test]
    fn test_state_result_display() {
        assert_eq!(StateResult::Retry.to_string(), "RETRY");
        assert_eq!(
            serde_json::to_string(&StateResult::Exit).unwrap(),
            "\"EXIT\""
        );
    }
}
