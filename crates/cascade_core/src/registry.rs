//! Lineage registry: concurrent id -> node lookup.
//!
//! # Responsibility
//! - Resolve parent/child/root links, which nodes hold only as ids.
//! - Offer a process-wide default instance plus injectable instances.
//!
//! # Invariants
//! - A node is registered exactly once, before it is returned to a caller.
//! - Nodes are never removed implicitly; only [`Registry::reap`] removes them.
//! - No registry lock is held while a node lock is taken.

use crate::node::{Constraints, Intent, Node, NodeId, NodeState};
use crate::signal::Signal;
use dashmap::DashMap;
use log::info;
use once_cell::sync::Lazy;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Weak};

static GLOBAL_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

#[derive(Default)]
struct RegistryInner {
    nodes: DashMap<NodeId, Arc<Node>>,
}

/// Shared handle to one lineage registry.
///
/// Cloning the handle shares the same table. Nodes keep only a weak link
/// back, so dropping every handle of a non-global registry frees it.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

/// Non-owning link from a node back to its registry.
pub(crate) struct WeakRegistry(Weak<RegistryInner>);

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<Registry> {
        self.0.upgrade().map(|inner| Registry { inner })
    }
}

/// Registry reclamation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapError {
    /// The node to reap is not registered here.
    NotRegistered(NodeId),
    /// A node in the subtree is still active.
    SubtreeActive(NodeId),
}

impl Display for ReapError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRegistered(id) => write!(f, "node is not registered: {id}"),
            Self::SubtreeActive(id) => write!(f, "subtree still has an active node: {id}"),
        }
    }
}

impl Error for ReapError {}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry used by [`Node::background`] and [`Node::todo`].
    pub fn global() -> &'static Registry {
        &GLOBAL_REGISTRY
    }

    /// Creates a root node with a fresh cancellation signal.
    pub fn root(&self) -> Arc<Node> {
        self.root_with_signal(&Signal::new())
    }

    /// Creates a root node whose underlying signal derives from `signal`.
    ///
    /// Firing `signal` aborts the root and cascades to the whole tree.
    pub fn root_with_signal(&self, signal: &Signal) -> Arc<Node> {
        let root = Node::create(
            self,
            None,
            Intent::default(),
            Constraints {
                deadline: signal.deadline(),
            },
            signal.child(),
        );
        info!(
            "event=root_create module=registry status=ok node_id={}",
            root.id()
        );
        root
    }

    pub(crate) fn register(&self, node: Arc<Node>) {
        self.inner.nodes.insert(node.id(), node);
    }

    pub fn lookup(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.inner
            .nodes
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.inner.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.nodes.is_empty()
    }

    /// Returns whether both handles share one table.
    pub fn ptr_eq(&self, other: &Registry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Removes `node` and its registered descendants once all are terminal.
    ///
    /// Returns the number of removed nodes. Reaped ids stay in their
    /// parents' child lists and are skipped by [`Node::children`].
    ///
    /// Best-effort: a child derived concurrently after the subtree was
    /// checked stays registered without a resolvable parent.
    ///
    /// # Errors
    /// - [`ReapError::NotRegistered`] when `node` is not in this registry.
    /// - [`ReapError::SubtreeActive`] naming the first active node found;
    ///   nothing is removed in that case.
    pub fn reap(&self, node: &Node) -> Result<usize, ReapError> {
        if !self.contains(&node.id()) {
            return Err(ReapError::NotRegistered(node.id()));
        }
        if node.state() == NodeState::Active {
            return Err(ReapError::SubtreeActive(node.id()));
        }

        let mut doomed = vec![node.id()];
        let mut pending = node.children();
        while let Some(current) = pending.pop() {
            if current.state() == NodeState::Active {
                return Err(ReapError::SubtreeActive(current.id()));
            }
            doomed.push(current.id());
            pending.extend(current.children());
        }

        for id in &doomed {
            self.inner.nodes.remove(id);
        }
        info!(
            "event=registry_reap module=registry status=ok node_id={} removed={}",
            node.id(),
            doomed.len()
        );
        Ok(doomed.len())
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("nodes", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{ReapError, Registry};
    use crate::node::{Constraints, DeriveError, Intent, Node, NodeState};
    use crate::signal::Signal;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn isolated_registries_do_not_share_nodes() {
        let first = Registry::new();
        let second = Registry::new();
        let root = first.root();

        assert!(first.contains(&root.id()));
        assert!(!second.contains(&root.id()));
        assert!(second.is_empty());
        assert!(root.registry().expect("registry").ptr_eq(&first));
    }

    #[test]
    fn global_roots_are_registered_globally() {
        let background = Node::background();
        let todo = Node::todo();

        assert!(Registry::global().contains(&background.id()));
        assert!(Registry::global().contains(&todo.id()));
        assert_eq!(background.state(), NodeState::Active);
        assert_eq!(todo.state(), NodeState::Active);
        assert!(background.is_root() && todo.is_root());
    }

    #[test]
    fn derived_nodes_are_resolvable_by_id() {
        let registry = Registry::new();
        let root = registry.root();
        let (child, _) =
            Node::derive(&root, Intent::new("child"), Constraints::default()).expect("derive");

        let found = registry.lookup(&child.id()).expect("child registered");
        assert!(Arc::ptr_eq(&found, &child));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn derive_fails_fast_when_registry_is_gone() {
        let registry = Registry::new();
        let root = registry.root();
        drop(registry);

        let err = Node::derive(&root, Intent::new("orphan"), Constraints::default())
            .expect_err("derive without registry must fail");
        assert_eq!(err, DeriveError::RegistryUnavailable(root.id()));
        assert!(root.children().is_empty());
    }

    #[test]
    fn concurrent_derivations_all_land_in_parent() {
        let registry = Registry::new();
        let root = registry.root();

        let handles: Vec<_> = (0..8)
            .map(|index| {
                let root = Arc::clone(&root);
                thread::spawn(move || {
                    let (child, _) = Node::derive(
                        &root,
                        Intent::new(format!("worker-{index}")),
                        Constraints::default(),
                    )
                    .expect("derive");
                    child.id()
                })
            })
            .collect();
        let ids: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().expect("worker thread"))
            .collect();

        let children = root.child_ids();
        assert_eq!(children.len(), 8);
        for id in ids {
            assert!(children.contains(&id));
            assert!(registry.contains(&id));
        }
    }

    #[test]
    fn reap_rejects_active_subtree_without_removing() {
        let registry = Registry::new();
        let root = registry.root();
        let (child, _) =
            Node::derive(&root, Intent::new("child"), Constraints::default()).expect("derive");
        root.fulfill();

        let err = registry.reap(&root).expect_err("active child blocks reap");
        assert_eq!(err, ReapError::SubtreeActive(child.id()));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn reap_removes_terminal_subtree_and_children_skip_missing_ids() {
        let registry = Registry::new();
        let root = registry.root();
        let (a, _) = Node::derive(&root, Intent::new("a"), Constraints::default()).expect("a");
        let (b, _) = Node::derive(&a, Intent::new("b"), Constraints::default()).expect("b");
        a.fulfill();
        b.abort("done with it");

        assert_eq!(registry.reap(&a), Ok(2));
        assert!(!registry.contains(&a.id()));
        assert!(!registry.contains(&b.id()));
        assert_eq!(root.child_ids(), vec![a.id()]);
        assert!(root.children().is_empty());
        assert!(b.parent().is_none());
    }

    #[test]
    fn reap_rejects_foreign_node() {
        let registry = Registry::new();
        let other = Registry::new();
        let root = other.root();
        root.fulfill();

        assert_eq!(
            registry.reap(&root),
            Err(ReapError::NotRegistered(root.id()))
        );
    }

    #[test]
    fn root_with_signal_follows_external_signal() {
        let registry = Registry::new();
        let external = Signal::new();
        let root = registry.root_with_signal(&external);
        let (child, _) =
            Node::derive(&root, Intent::new("child"), Constraints::default()).expect("derive");

        external.cancel();

        assert_eq!(root.state(), NodeState::Aborted);
        assert_eq!(child.state(), NodeState::Aborted);
    }
}
