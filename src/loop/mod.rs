//! The orchestration loop.
//!
//! This module contains the finite-state machine that drives one task:
//!
//! - [`machine`] - The driver: timeouts, cancellation, iteration ceiling
//! - [`state`] - The `State` trait and transition results
//! - [`states`] - Thinking, Patching, Verifying and Recovery
//! - [`context`] - Per-run mutable state and the exit summary
//! - [`env`] - Collaborators and the cancel flag shared by all states
//! - [`operations`] - Command-backed backend, verifier, plan and learner
//! - [`prompts`] - Pure prompt builders
//! - [`retry`] - Backoff calculation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │StateMachine │────>│ LoopContext  │     │ LoopEnv     │
//! │ run(task)   │     │ per-run state│     │ backend     │
//! └─────────────┘     └──────────────┘     │ verifier    │
//!       │                                  │ guard       │
//!       v                                  │ checkpoints │
//! ┌─────────────────────────────────────┐  │ circuit     │
//! │ Thinking → Patching → Verifying     │─>│ plan/learner│
//! │     ↑          │           │        │  └─────────────┘
//! │     └──── Recovery <───────┘        │
//! └─────────────────────────────────────┘
//! ```

pub mod context;
pub mod env;
pub mod machine;
pub mod operations;
pub mod prompts;
pub mod retry;
pub mod state;
pub mod states;

// Re-exports for convenience
pub use context::{ErrorKind, LoopContext, LoopError, LoopSummary};
pub use env::LoopEnv;
pub use machine::StateMachine;
pub use state::{State, StateKind, StateResult};
