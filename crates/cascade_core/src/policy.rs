//! Capability boundary toward an external policy engine.
//!
//! # Responsibility
//! - Expose nodes to policy code through a read-only view.
//! - Let policy decisions act on nodes only through an enforcer.
//!
//! # Invariants
//! - The core knows nothing about which rules exist, their priority or
//!   their matching logic; it only evaluates and applies decisions.
//! - Enforcer actions delegate unchanged to the scoped node operations.

use crate::node::{AbortReason, Node, NodeId, Params};
use crate::scope::Scope;
use log::warn;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Parameter mutation carried by an adjust decision.
pub type AdjustFn = Arc<dyn Fn(&mut Params) + Send + Sync>;

/// Read-only view of one node handed to policy code.
pub trait NodeView {
    fn id(&self) -> NodeId;
    /// Intent name.
    fn name(&self) -> String;
    /// Snapshot of the current intent params.
    fn params(&self) -> Params;
    /// Same-shaped view of the parent; `None` for roots.
    fn parent(&self) -> Option<Box<dyn NodeView>>;
    /// Same-shaped view of the root ancestor.
    fn root(&self) -> Box<dyn NodeView>;
}

/// Write-only capability through which decisions act on a node.
pub trait Enforcer {
    fn adjust(&self, scope: Scope, adjust: &dyn Fn(&mut Params));
    fn cancel(&self, scope: Scope, reason: AbortReason);
    /// Advisory hook for non-fatal findings. No-op by default.
    fn warn(&self, _message: &str, _error: Option<&AbortReason>) {}
}

/// What a decision does to its target.
#[derive(Clone)]
pub enum DecisionAction {
    Adjust(AdjustFn),
    Cancel,
}

impl Debug for DecisionAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adjust(_) => f.write_str("Adjust(..)"),
            Self::Cancel => f.write_str("Cancel"),
        }
    }
}

/// One instruction produced by the policy engine.
#[derive(Debug, Clone)]
pub struct Decision {
    pub policy_id: String,
    pub scope: Scope,
    pub action: DecisionAction,
    /// Abort reason for cancels; explanation for adjusts.
    pub reason: AbortReason,
    /// Skip the remaining decisions once this one is applied.
    pub stop: bool,
}

impl Decision {
    pub fn cancel(
        policy_id: impl Into<String>,
        scope: Scope,
        reason: impl Into<AbortReason>,
    ) -> Self {
        Self {
            policy_id: policy_id.into(),
            scope,
            action: DecisionAction::Cancel,
            reason: reason.into(),
            stop: false,
        }
    }

    pub fn adjust(
        policy_id: impl Into<String>,
        scope: Scope,
        reason: impl Into<AbortReason>,
        adjust: impl Fn(&mut Params) + Send + Sync + 'static,
    ) -> Self {
        Self {
            policy_id: policy_id.into(),
            scope,
            action: DecisionAction::Adjust(Arc::new(adjust)),
            reason: reason.into(),
            stop: false,
        }
    }

    pub fn stopping(mut self) -> Self {
        self.stop = true;
        self
    }
}

/// External rule evaluator.
pub trait PolicyEngine {
    /// Evaluates registered rules against `node`.
    fn evaluate(&self, node: &dyn NodeView) -> Vec<Decision>;

    /// Applies `decisions` in order, stopping after the first one marked
    /// `stop`.
    fn enforce(&self, enforcer: &dyn Enforcer, decisions: &[Decision]) {
        for decision in decisions {
            match &decision.action {
                DecisionAction::Adjust(adjust) => enforcer.adjust(decision.scope, &**adjust),
                DecisionAction::Cancel => enforcer.cancel(decision.scope, decision.reason.clone()),
            }
            if decision.stop {
                break;
            }
        }
    }
}

struct PolicyNode {
    node: Arc<Node>,
}

impl NodeView for PolicyNode {
    fn id(&self) -> NodeId {
        self.node.id()
    }

    fn name(&self) -> String {
        self.node.intent().name
    }

    fn params(&self) -> Params {
        self.node.intent().params
    }

    fn parent(&self) -> Option<Box<dyn NodeView>> {
        self.node
            .parent()
            .map(|node| Box::new(PolicyNode { node }) as Box<dyn NodeView>)
    }

    fn root(&self) -> Box<dyn NodeView> {
        Box::new(PolicyNode {
            node: self.node.root(),
        })
    }
}

struct PolicyEnforcer<'a> {
    node: &'a Node,
}

impl Enforcer for PolicyEnforcer<'_> {
    fn adjust(&self, scope: Scope, adjust: &dyn Fn(&mut Params)) {
        self.node.send_adjust(scope, adjust);
    }

    fn cancel(&self, scope: Scope, reason: AbortReason) {
        self.node.send_cancel(scope, reason);
    }

    fn warn(&self, message: &str, error: Option<&AbortReason>) {
        match error {
            Some(error) => warn!(
                "event=policy_warn module=policy status=warn node_id={} message={} error={}",
                self.node.id(),
                message,
                error
            ),
            None => warn!(
                "event=policy_warn module=policy status=warn node_id={} message={}",
                self.node.id(),
                message
            ),
        }
    }
}

/// Asks `engine` for decisions about `node`.
pub fn evaluate_policies<E: PolicyEngine + ?Sized>(engine: &E, node: &Arc<Node>) -> Vec<Decision> {
    engine.evaluate(&PolicyNode {
        node: Arc::clone(node),
    })
}

/// Applies `decisions` onto `node` through `engine`.
pub fn enforce_policies<E: PolicyEngine + ?Sized>(
    engine: &E,
    node: &Node,
    decisions: &[Decision],
) {
    engine.enforce(&PolicyEnforcer { node }, decisions);
}
