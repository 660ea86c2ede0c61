//! Join and race helpers over node completion signals.
//!
//! Both helpers block the calling thread until the relevant completion
//! signal or the caller's own signal fires, whichever is observed first.

use crate::node::{AbortReason, Node};
use crate::signal::{CancelCause, Signal};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::mpsc;
use std::sync::Arc;

/// Why a wait ended without every node succeeding.
#[derive(Debug, Clone)]
pub enum WaitError {
    /// A waited node aborted; carries its reason unchanged.
    Aborted(AbortReason),
    /// The caller's own signal fired first.
    Signal(CancelCause),
}

impl Display for WaitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aborted(reason) => write!(f, "{reason}"),
            Self::Signal(cause) => write!(f, "{cause}"),
        }
    }
}

impl Error for WaitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Aborted(reason) => Some(reason),
            Self::Signal(cause) => Some(cause),
        }
    }
}

enum Announcement {
    Finished(usize),
    Signal(CancelCause),
}

/// Waits for `nodes` in order.
///
/// Returns the first abort reason met, or the caller signal's cause if it
/// fires before the node being waited on completes. Nodes after the one
/// that ended the wait are neither waited on nor touched.
pub fn wait_all(signal: &Signal, nodes: &[Arc<Node>]) -> Result<(), WaitError> {
    for node in nodes {
        match race(signal, std::slice::from_ref(node)) {
            Announcement::Finished(_) => {
                if let Some(reason) = node.err_state() {
                    return Err(WaitError::Aborted(reason));
                }
            }
            Announcement::Signal(cause) => return Err(WaitError::Signal(cause)),
        }
    }
    Ok(())
}

/// Returns the first node in `nodes` to complete, with its abort reason.
///
/// Returns the caller signal's cause if it fires first. With an empty
/// `nodes` slice this blocks until the caller signal fires.
pub fn when_any(
    signal: &Signal,
    nodes: &[Arc<Node>],
) -> Result<(Arc<Node>, Option<AbortReason>), CancelCause> {
    match race(signal, nodes) {
        Announcement::Finished(index) => {
            let node = Arc::clone(&nodes[index]);
            let reason = node.err_state();
            Ok((node, reason))
        }
        Announcement::Signal(cause) => Err(cause),
    }
}

/// Blocks until one of `nodes` completes or `signal` fires.
///
/// Each waiter announces over a channel sized to fit every announcement, so
/// late announcements never block the thread that fires them. Waiters are
/// unsubscribed when the race is decided.
fn race(signal: &Signal, nodes: &[Arc<Node>]) -> Announcement {
    let (sender, receiver) = mpsc::sync_channel(nodes.len() + 1);
    let mut waiters = Vec::with_capacity(nodes.len() + 1);
    for (index, node) in nodes.iter().enumerate() {
        let sender = sender.clone();
        waiters.push(node.done().subscribe(move || {
            let _ = sender.try_send(Announcement::Finished(index));
        }));
    }
    {
        let sender = sender.clone();
        waiters.push(signal.subscribe(move |cause| {
            let _ = sender.try_send(Announcement::Signal(cause));
        }));
    }

    // `sender` is held past `recv`, so the channel never disconnects and
    // `recv` only returns once a waiter has announced.
    let announcement = match receiver.recv() {
        Ok(announcement) => announcement,
        Err(_) => Announcement::Signal(signal.wait()),
    };
    drop(waiters);
    drop(sender);
    announcement
}

#[cfg(test)]
mod tests {
    use super::{wait_all, when_any, WaitError};
    use crate::node::{Constraints, Intent, Node, NodeState};
    use crate::registry::Registry;
    use crate::signal::{CancelCause, Signal};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn leaves(registry: &Registry, count: usize) -> Vec<Arc<Node>> {
        let root = registry.root();
        (0..count)
            .map(|index| {
                Node::derive(&root, Intent::new(format!("N{index}")), Constraints::default())
                    .expect("derive")
                    .0
            })
            .collect()
    }

    fn fulfill_after(node: &Arc<Node>, millis: u64) {
        let node = Arc::clone(node);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(millis));
            node.fulfill();
        });
    }

    #[test]
    fn wait_all_returns_ok_when_every_node_succeeds() {
        let registry = Registry::new();
        let nodes = leaves(&registry, 3);
        for (index, node) in nodes.iter().enumerate() {
            fulfill_after(node, 5 * (index as u64 + 1));
        }

        wait_all(&Signal::new(), &nodes).expect("all nodes fulfilled");
    }

    #[test]
    fn wait_all_stops_at_first_abort_in_list_order() {
        let registry = Registry::new();
        let nodes = leaves(&registry, 3);
        nodes[0].fulfill();
        nodes[1].abort("second failed");

        let err = wait_all(&Signal::new(), &nodes).expect_err("abort must surface");
        match err {
            WaitError::Aborted(reason) => assert_eq!(reason.to_string(), "second failed"),
            other => panic!("unexpected wait error: {other:?}"),
        }
        assert_eq!(nodes[2].state(), NodeState::Active);
    }

    #[test]
    fn wait_all_returns_caller_cause_when_caller_fires_first() {
        let registry = Registry::new();
        let nodes = leaves(&registry, 1);
        let caller = Signal::with_timeout(Duration::from_millis(20)).expect("caller signal");

        let err = wait_all(&caller, &nodes).expect_err("caller deadline must surface");
        assert!(matches!(
            err,
            WaitError::Signal(CancelCause::DeadlineExceeded)
        ));
        assert!(!nodes[0].done().is_fired());
    }

    #[test]
    fn when_any_returns_first_finisher() {
        let registry = Registry::new();
        let nodes = leaves(&registry, 2);
        fulfill_after(&nodes[0], 20);
        fulfill_after(&nodes[1], 40);

        let (first, reason) = when_any(&Signal::new(), &nodes).expect("a node finishes");
        assert!(Arc::ptr_eq(&first, &nodes[0]));
        assert!(reason.is_none());

        wait_all(&Signal::new(), &nodes).expect("both nodes fulfilled");
    }

    #[test]
    fn when_any_reports_abort_reason_of_winner() {
        let registry = Registry::new();
        let nodes = leaves(&registry, 2);
        nodes[1].abort("lost");

        let (winner, reason) = when_any(&Signal::new(), &nodes).expect("a node finishes");
        assert!(Arc::ptr_eq(&winner, &nodes[1]));
        assert_eq!(reason.expect("abort reason").to_string(), "lost");
    }

    #[test]
    fn when_any_returns_caller_cause_on_cancel() {
        let registry = Registry::new();
        let nodes = leaves(&registry, 2);
        let caller = Signal::new();
        {
            let caller = caller.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                caller.cancel();
            });
        }

        let err = when_any(&caller, &nodes).expect_err("caller cancel must win");
        assert_eq!(err, CancelCause::Canceled);
    }

    #[test]
    fn when_any_with_no_nodes_waits_for_caller() {
        let caller = Signal::with_timeout(Duration::from_millis(10)).expect("caller signal");
        assert_eq!(
            when_any(&caller, &[]).expect_err("only the caller can end the race"),
            CancelCause::DeadlineExceeded
        );
    }
}
