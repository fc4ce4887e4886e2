//! Behavioral drift and stuck-loop guard for agent tool loops.
//!
//! [`hook::HookRuntime`] is the entry point: it takes one [`types::HookContext`]
//! and returns one [`types::HookResult`].

pub mod config;
pub mod error;
pub mod guard;
pub mod hook;
pub mod memory;
pub mod persist;
pub mod recorder;
pub mod tension;
pub mod types;

pub use config::DriftCfg;
pub use error::{GuardError, GuardResult};
pub use hook::HookRuntime;
pub use types::{HookContext, HookEvent, HookResult, ReasoningDirection, SemanticNode, Zone};
