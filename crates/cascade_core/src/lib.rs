//! Hierarchical cancellation and parameter propagation.
//!
//! Nodes carry an intent and derive children whose deadlines only tighten.
//! Any holder of a node can cancel or re-parameterize one node, its
//! subtree, or the whole tree, and wait on completion with join/race
//! helpers. Policy engines plug in through the capability traits in
//! [`policy`].

pub mod logging;
pub mod node;
pub mod policy;
pub mod registry;
pub mod scope;
pub mod signal;
mod timer;
pub mod wait;

pub use logging::{default_log_level, init_logging, logging_status, LoggingConfig, LoggingError};
pub use node::{
    clamp_constraints, AbortReason, Constraints, DeriveError, Intent, Node, NodeId, NodeSnapshot,
    NodeState, Params, Release,
};
pub use policy::{
    enforce_policies, evaluate_policies, AdjustFn, Decision, DecisionAction, Enforcer, NodeView,
    PolicyEngine,
};
pub use registry::{ReapError, Registry};
pub use scope::Scope;
pub use signal::{CancelCause, Completion, Signal, Subscription};
pub use wait::{wait_all, when_any, WaitError};

/// Returns the crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
