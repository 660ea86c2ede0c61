use cascade_core::{
    enforce_policies, evaluate_policies, Constraints, Decision, Intent, Node, NodeState,
    NodeView, PolicyEngine, Registry, Scope,
};
use serde_json::json;
use std::time::Duration;

/// Cancels the whole tree when `safety.block` is true.
struct SafetyStop;

/// Caps `transcode.targetQuality` at 1080 for transcode nodes.
struct QualityCap;

trait Rule: Send + Sync {
    fn matches(&self, node: &dyn NodeView) -> bool;
    fn check(&self, node: &dyn NodeView) -> Vec<Decision>;
}

impl Rule for SafetyStop {
    fn matches(&self, _node: &dyn NodeView) -> bool {
        true
    }

    fn check(&self, node: &dyn NodeView) -> Vec<Decision> {
        if node.params().get("safety.block") == Some(&json!(true)) {
            return vec![Decision::cancel("safety_stop", Scope::Root, "blocked").stopping()];
        }
        vec![]
    }
}

impl Rule for QualityCap {
    fn matches(&self, node: &dyn NodeView) -> bool {
        node.name() == "Transcode"
    }

    fn check(&self, node: &dyn NodeView) -> Vec<Decision> {
        let quality = node
            .params()
            .get("transcode.targetQuality")
            .and_then(|value| value.as_i64())
            .unwrap_or_default();
        if quality > 1080 {
            return vec![Decision::adjust(
                "cap_quality",
                Scope::Subtree,
                "cap 1080",
                |params| {
                    params.insert("transcode.targetQuality".to_string(), json!(1080));
                },
            )];
        }
        vec![]
    }
}

struct RuleBook {
    rules: Vec<Box<dyn Rule>>,
}

impl RuleBook {
    fn standard() -> Self {
        Self {
            rules: vec![Box::new(SafetyStop), Box::new(QualityCap)],
        }
    }
}

impl PolicyEngine for RuleBook {
    fn evaluate(&self, node: &dyn NodeView) -> Vec<Decision> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(node))
            .flat_map(|rule| rule.check(node))
            .collect()
    }
}

#[test]
fn quality_cap_adjusts_subtree() {
    let engine = RuleBook::standard();
    let registry = Registry::new();
    let root = registry.root();
    let (transcode, _) = Node::derive(
        &root,
        Intent::new("Transcode").with_param("transcode.targetQuality", 1440),
        Constraints::default(),
    )
    .expect("transcode");
    let (segment, _) =
        Node::derive(&transcode, Intent::new("Segment"), Constraints::default())
            .expect("segment");

    let decisions = evaluate_policies(&engine, &transcode);
    assert_eq!(decisions.len(), 1);
    enforce_policies(&engine, &transcode, &decisions);

    assert_eq!(
        transcode.intent().params["transcode.targetQuality"],
        json!(1080)
    );
    assert_eq!(
        segment.intent().params["transcode.targetQuality"],
        json!(1080)
    );
    assert_eq!(transcode.state(), NodeState::Active);
}

#[test]
fn safety_stop_cancels_root_through_enforcer() {
    let engine = RuleBook::standard();
    let registry = Registry::new();
    let root = registry.root();
    let (node, _) = Node::derive(
        &root,
        Intent::new("Anything").with_param("safety.block", true),
        Constraints::default(),
    )
    .expect("node");

    let decisions = evaluate_policies(&engine, &node);
    enforce_policies(&engine, &node, &decisions);

    assert!(root.done().wait_timeout(Duration::from_millis(100)));
    assert_eq!(root.state(), NodeState::Aborted);
    assert_eq!(node.state(), NodeState::Aborted);
    assert_eq!(root.err_state().expect("reason").to_string(), "blocked");
}

#[test]
fn no_decisions_leave_tree_untouched() {
    let engine = RuleBook::standard();
    let registry = Registry::new();
    let root = registry.root();
    let (node, _) = Node::derive(
        &root,
        Intent::new("Transcode").with_param("transcode.targetQuality", 720),
        Constraints::default(),
    )
    .expect("node");

    let decisions = evaluate_policies(&engine, &node);
    assert!(decisions.is_empty());
    enforce_policies(&engine, &node, &decisions);

    assert_eq!(node.intent().params["transcode.targetQuality"], json!(720));
    assert_eq!(root.state(), NodeState::Active);
}
