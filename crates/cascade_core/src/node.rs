//! Intent-carrying nodes of the cancellation tree.
//!
//! # Responsibility
//! - Own one node's lifecycle state machine, intent and child-id list.
//! - Derive child nodes with clamped deadlines and cascading signals.
//! - Resolve lineage (parent, root, children) through the registry by id.
//!
//! # Invariants
//! - `state` leaves `Active` at most once; the first terminal call wins.
//! - The completion signal fires exactly once, after the terminal transition.
//! - `children` only grows; ids are never removed.
//! - A fired underlying signal always leaves the node terminal.
//! - Constraints are fixed at creation, after clamping.

use crate::registry::{Registry, WeakRegistry};
use crate::signal::{CancelCause, Completion, Signal, Subscription};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Process-unique node identifier (random v4 UUID).
pub type NodeId = Uuid;

/// Mutable intent parameters keyed by namespaced string keys.
pub type Params = BTreeMap<String, Value>;

/// Named purpose of a node plus its parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// Stable identifier of the operation's purpose.
    pub name: String,
    #[serde(default)]
    pub params: Params,
}

impl Intent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Params::new(),
        }
    }

    /// Adds one parameter, replacing any previous value for `key`.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Domain-neutral limits attached to a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Constraints {
    /// Absolute deadline; `None` means unbounded.
    pub deadline: Option<Instant>,
}

impl Constraints {
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    /// Deadline `timeout` from now. Saturates to unbounded on overflow.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
        }
    }
}

/// Tightens `requested` so its deadline never exceeds the parent's.
pub fn clamp_constraints(parent: &Constraints, requested: Constraints) -> Constraints {
    let mut effective = requested;
    if let Some(parent_deadline) = parent.deadline {
        let later = effective
            .deadline
            .map_or(true, |deadline| deadline > parent_deadline);
        if later {
            effective.deadline = Some(parent_deadline);
        }
    }
    effective
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Work may still be in progress.
    Active,
    /// Fulfilled successfully.
    Done,
    /// Aborted with a reason.
    Aborted,
}

impl NodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl Display for NodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied abort error, shared as-is by every reader.
///
/// The core never wraps the error: [`AbortReason::downcast_ref`] and
/// [`AbortReason::ptr_eq`] reach the exact value that was supplied.
#[derive(Clone)]
pub struct AbortReason(Arc<dyn Error + Send + Sync + 'static>);

impl AbortReason {
    pub fn new(error: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        Self(Arc::from(error.into()))
    }

    pub fn get_ref(&self) -> &(dyn Error + Send + Sync + 'static) {
        self.0.as_ref()
    }

    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    /// Returns whether both handles share the same supplied error.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Debug for AbortReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

impl Display for AbortReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&*self.0, f)
    }
}

impl Error for AbortReason {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.0.source()
    }
}

impl From<&str> for AbortReason {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AbortReason {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<CancelCause> for AbortReason {
    fn from(value: CancelCause) -> Self {
        Self::new(value)
    }
}

impl From<Box<dyn Error + Send + Sync + 'static>> for AbortReason {
    fn from(value: Box<dyn Error + Send + Sync + 'static>) -> Self {
        Self::new(value)
    }
}

/// Node derivation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeriveError {
    /// The registry the parent was created in no longer exists.
    RegistryUnavailable(NodeId),
    /// The deadline timer for the derived signal could not be started.
    DeadlineTimer(String),
}

impl Display for DeriveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RegistryUnavailable(id) => {
                write!(f, "registry of parent node {id} is no longer available")
            }
            Self::DeadlineTimer(message) => {
                write!(f, "failed to start deadline timer: {message}")
            }
        }
    }
}

impl Error for DeriveError {}

/// Releases resources tied to a derived node's signal.
///
/// Releasing stops the deadline timer and unlinks the signal from its
/// parent's cascade; it never fires the signal nor changes node state.
/// A released node is cut off from ancestor cancellation: it and its
/// subtree no longer abort when an ancestor is cancelled or expires, and
/// must be finished explicitly.
///
/// Dropping the handle without calling [`Release::release`] keeps the
/// signal linked.
pub struct Release {
    signal: Signal,
}

impl Release {
    pub fn release(self) {
        self.signal.release();
    }
}

impl Debug for Release {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Release")
            .field("released", &self.signal.is_released())
            .finish()
    }
}

/// Serializable point-in-time view of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub intent: Intent,
    pub state: NodeState,
    /// Display text of the abort reason, if aborted.
    pub error: Option<String>,
    pub children: Vec<NodeId>,
}

struct NodeInner {
    state: NodeState,
    error: Option<AbortReason>,
    intent: Intent,
    children: Vec<NodeId>,
}

/// One vertex of the cancellation tree.
///
/// Nodes reference their parent and children by id only; lookups go
/// through the [`Registry`] the node was created in.
pub struct Node {
    id: NodeId,
    parent_id: Option<NodeId>,
    constraints: Constraints,
    registry: WeakRegistry,
    signal: Signal,
    done: Completion,
    inner: RwLock<NodeInner>,
    _signal_hook: Subscription,
}

impl Node {
    /// Creates a root node in the process-wide registry.
    pub fn background() -> Arc<Node> {
        Registry::global().root()
    }

    /// Creates a placeholder root node in the process-wide registry.
    ///
    /// Equivalent to [`Node::background`]; use it where the real parent is
    /// not wired yet.
    pub fn todo() -> Arc<Node> {
        Registry::global().root()
    }

    /// Derives a child of `parent` carrying `intent`.
    ///
    /// The requested deadline is clamped to the parent's, the child signal
    /// is derived from the parent's signal, and the child is registered
    /// before its id is appended to the parent's children.
    ///
    /// # Errors
    /// - [`DeriveError::RegistryUnavailable`] when the parent's registry was dropped.
    /// - [`DeriveError::DeadlineTimer`] when the deadline timer cannot start.
    pub fn derive(
        parent: &Node,
        intent: Intent,
        constraints: Constraints,
    ) -> Result<(Arc<Node>, Release), DeriveError> {
        let registry = parent
            .registry()
            .ok_or(DeriveError::RegistryUnavailable(parent.id))?;
        let constraints = clamp_constraints(&parent.constraints, constraints);
        let signal = match constraints.deadline {
            None => parent.signal.child(),
            Some(deadline) => parent
                .signal
                .child_with_deadline(deadline)
                .map_err(|err| DeriveError::DeadlineTimer(err.to_string()))?,
        };

        let child = Node::create(
            &registry,
            Some(parent.id),
            intent,
            constraints,
            signal.clone(),
        );
        parent.write().children.push(child.id);
        debug!(
            "event=node_derive module=node status=ok node_id={} parent_id={} deadline={}",
            child.id,
            parent.id,
            constraints.deadline.is_some()
        );
        Ok((child, Release { signal }))
    }

    pub(crate) fn create(
        registry: &Registry,
        parent_id: Option<NodeId>,
        intent: Intent,
        constraints: Constraints,
        signal: Signal,
    ) -> Arc<Node> {
        let node = Arc::new_cyclic(|weak: &Weak<Node>| {
            let weak = weak.clone();
            let hook = signal.subscribe(move |cause| {
                if let Some(node) = weak.upgrade() {
                    node.abort_from_signal(cause);
                }
            });
            Node {
                id: Uuid::new_v4(),
                parent_id,
                constraints,
                registry: registry.downgrade(),
                signal,
                done: Completion::new(),
                inner: RwLock::new(NodeInner {
                    state: NodeState::Active,
                    error: None,
                    intent,
                    children: Vec::new(),
                }),
                _signal_hook: hook,
            }
        });
        // The hook cannot reach a node that is still under construction.
        if let Some(cause) = node.signal.cause() {
            node.abort_from_signal(cause);
        }
        registry.register(Arc::clone(&node));
        node
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Parent id; `None` exactly for roots.
    pub fn parent_id(&self) -> Option<NodeId> {
        self.parent_id
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Returns a snapshot of the intent.
    pub fn intent(&self) -> Intent {
        self.read().intent.clone()
    }

    pub fn constraints(&self) -> Constraints {
        self.constraints
    }

    pub fn state(&self) -> NodeState {
        self.read().state
    }

    /// Completion signal; fires once the node is fulfilled or aborted.
    pub fn done(&self) -> &Completion {
        &self.done
    }

    /// Underlying cancellation signal derived from the parent's.
    ///
    /// Cancelling it aborts this node and, by cascade, every descendant.
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Abort reason when aborted, `None` otherwise.
    pub fn err_state(&self) -> Option<AbortReason> {
        self.read().error.clone()
    }

    /// Marks the node done. No-op when already terminal.
    ///
    /// Returns whether this call performed the transition.
    pub fn fulfill(&self) -> bool {
        self.finish(NodeState::Done, None)
    }

    /// Marks the node aborted with `reason`. No-op when already terminal.
    ///
    /// Returns whether this call performed the transition.
    pub fn abort(&self, reason: impl Into<AbortReason>) -> bool {
        self.finish(NodeState::Aborted, Some(reason.into()))
    }

    /// Registry this node was created in, if it still exists.
    pub fn registry(&self) -> Option<Registry> {
        self.registry.upgrade()
    }

    /// Parent node, or `None` for roots and unresolvable parents.
    pub fn parent(&self) -> Option<Arc<Node>> {
        let parent_id = self.parent_id?;
        self.registry()?.lookup(&parent_id)
    }

    /// Root ancestor; `self` when this node is a root.
    ///
    /// The walk stops at the highest ancestor still resolvable.
    pub fn root(self: &Arc<Self>) -> Arc<Node> {
        self.root_ancestor().unwrap_or_else(|| Arc::clone(self))
    }

    /// Snapshot of direct child ids in creation order.
    pub fn child_ids(&self) -> Vec<NodeId> {
        self.read().children.clone()
    }

    /// Direct children, skipping ids the registry cannot resolve.
    pub fn children(&self) -> Vec<Arc<Node>> {
        let ids = self.child_ids();
        let Some(registry) = self.registry() else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| registry.lookup(id)).collect()
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let inner = self.read();
        NodeSnapshot {
            id: self.id,
            parent_id: self.parent_id,
            intent: inner.intent.clone(),
            state: inner.state,
            error: inner.error.as_ref().map(ToString::to_string),
            children: inner.children.clone(),
        }
    }

    /// Highest resolvable ancestor, or `None` when this node is a root.
    pub(crate) fn root_ancestor(&self) -> Option<Arc<Node>> {
        let mut current = self.parent()?;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        Some(current)
    }

    /// Runs `adjust` on the params under this node's write lock.
    ///
    /// `adjust` must not call back into this node.
    pub(crate) fn apply_adjust(&self, adjust: &impl Fn(&mut Params)) {
        let mut inner = self.write();
        adjust(&mut inner.intent.params);
    }

    fn abort_from_signal(&self, cause: CancelCause) {
        if self.abort(cause) {
            debug!(
                "event=node_signal_abort module=node status=ok node_id={} cause={}",
                self.id,
                cause.as_str()
            );
        }
    }

    fn finish(&self, state: NodeState, error: Option<AbortReason>) -> bool {
        {
            let mut inner = self.write();
            if inner.state.is_terminal() {
                return false;
            }
            inner.state = state;
            inner.error = error;
        }
        self.done.fire();
        debug!(
            "event=node_finish module=node status=ok node_id={} state={}",
            self.id,
            state.as_str()
        );
        true
    }

    fn read(&self) -> RwLockReadGuard<'_, NodeInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, NodeInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("intent", &inner.intent.name)
            .field("state", &inner.state)
            .field("children", &inner.children.len())
            .finish()
    }
}
