//! Scoped cancel and adjust propagation.
//!
//! # Responsibility
//! - Apply cancellation or parameter mutation to one node, a subtree, or
//!   the whole tree from its root.
//!
//! # Invariants
//! - Each node is touched inside its own critical section only; no lock
//!   spans more than one node.
//! - Subtree traversal snapshots a node's children when it visits that
//!   node. A child derived concurrently mid-traversal may be missed; the
//!   operation is best-effort, not linearizable.
//! - Cancel never changes an already-terminal node.
//! - Concurrent adjusts on overlapping keys resolve last-writer-wins.

use crate::node::{AbortReason, Node, Params};
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Breadth of a cancel/adjust operation.
///
/// The variant set and order are part of the public contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// This node only.
    Node,
    /// This node and all current descendants.
    Subtree,
    /// The whole tree, starting from the root ancestor.
    Root,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Subtree => "subtree",
            Self::Root => "root",
        }
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Node {
    /// Aborts nodes in `scope` with `reason`.
    ///
    /// Every aborted node stores the same shared reason.
    pub fn send_cancel(&self, scope: Scope, reason: impl Into<AbortReason>) {
        let reason = reason.into();
        let visited = self.for_each_in_scope(scope, |node| {
            node.abort(reason.clone());
        });
        info!(
            "event=scoped_cancel module=scope status=ok node_id={} scope={} visited={}",
            self.id(),
            scope.as_str(),
            visited
        );
    }

    /// Applies `adjust` to the params of every node in `scope`.
    ///
    /// `adjust` runs under each target node's lock and must not call back
    /// into the node it is mutating.
    pub fn send_adjust(&self, scope: Scope, adjust: impl Fn(&mut Params)) {
        let visited = self.for_each_in_scope(scope, |node| node.apply_adjust(&adjust));
        info!(
            "event=scoped_adjust module=scope status=ok node_id={} scope={} visited={}",
            self.id(),
            scope.as_str(),
            visited
        );
    }

    fn for_each_in_scope(&self, scope: Scope, mut visit: impl FnMut(&Node)) -> usize {
        match scope {
            Scope::Node => {
                visit(self);
                1
            }
            Scope::Subtree => walk_subtree(self, visit),
            Scope::Root => match self.root_ancestor() {
                Some(root) => walk_subtree(&root, visit),
                None => walk_subtree(self, visit),
            },
        }
    }
}

/// Depth-first walk from `start`; returns the number of visited nodes.
fn walk_subtree(start: &Node, mut visit: impl FnMut(&Node)) -> usize {
    visit(start);
    let mut visited = 1;
    let mut pending: Vec<Arc<Node>> = start.children();
    while let Some(node) = pending.pop() {
        visit(&node);
        visited += 1;
        pending.extend(node.children());
    }
    visited
}
