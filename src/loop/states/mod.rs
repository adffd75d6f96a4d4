//! The four loop states.
//!
//! | From | Result | To |
//! |---|---|---|
//! | Thinking | SUCCESS + ops | Patching |
//! | Thinking | SUCCESS, no ops / FAILURE | Recovery |
//! | Patching | SUCCESS | Verifying |
//! | Patching | FAILURE | Recovery |
//! | Verifying | SUCCESS | Thinking, or terminal once the plan is complete |
//! | Verifying | FAILURE | Recovery |
//! | Recovery | RETRY | Thinking |
//! | any | EXIT | terminal |

mod patching;
mod recovery;
mod thinking;
mod verifying;

pub use patching::PatchingState;
pub use recovery::RecoveryState;
pub use thinking::ThinkingState;
pub use verifying::VerifyingState;
