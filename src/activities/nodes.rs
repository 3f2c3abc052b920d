//! Suspended-node detection for the `only-on-suspended-nodes` filter.
//!
//! Fail-open: any error reading the pod or node reports "not suspended" so
//! an API outage cannot block a restart run.

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Api;
use tracing::{debug, warn};

use crate::error::ActivityError;

const SUSPENDED_TAINT_KEYS: &[&str] = &[
    "node.kubernetes.io/unschedulable",
    "node.kubernetes.io/not-ready",
    "node.kubernetes.io/unreachable",
    "aws.amazon.com/spot-instance-terminating",
    "cluster-autoscaler.kubernetes.io/scale-down-disabled",
    "node.kubernetes.io/suspend",
];

const SUSPENDED_ANNOTATION_KEYS: &[&str] = &[
    "cluster-autoscaler.kubernetes.io/scale-down-disabled",
    "node.kubernetes.io/suspend",
    "node.kubernetes.io/suspended",
];

/// Whether the node is marked unwilling to host new work: the
/// unschedulable flag, a known taint, or a known annotation.
pub fn node_is_suspended(node: &Node) -> bool {
    if let Some(spec) = &node.spec {
        if spec.unschedulable == Some(true) {
            return true;
        }
        if let Some(taints) = &spec.taints {
            if taints
                .iter()
                .any(|taint| SUSPENDED_TAINT_KEYS.contains(&taint.key.as_str()))
            {
                return true;
            }
        }
    }

    if let Some(annotations) = &node.metadata.annotations {
        if SUSPENDED_ANNOTATION_KEYS
            .iter()
            .any(|key| annotations.contains_key(*key))
        {
            return true;
        }
    }

    false
}

pub async fn is_pod_on_suspended_node(
    client: &kube::Client,
    pod_name: &str,
    namespace: &str,
) -> Result<bool, ActivityError> {
    let pods = Api::<Pod>::namespaced(client.clone(), namespace);
    let pod = match pods.get(pod_name).await {
        Ok(pod) => pod,
        Err(err) => {
            warn!(pod = pod_name, error = %err, "could not read pod; treating node as not suspended");
            return Ok(false);
        }
    };

    let Some(node_name) = pod.spec.as_ref().and_then(|spec| spec.node_name.clone()) else {
        debug!(pod = pod_name, "pod not scheduled on any node");
        return Ok(false);
    };

    let nodes = Api::<Node>::all(client.clone());
    match nodes.get(&node_name).await {
        Ok(node) => {
            let suspended = node_is_suspended(&node);
            debug!(pod = pod_name, node = %node_name, suspended, "node suspension check");
            Ok(suspended)
        }
        Err(err) => {
            warn!(node = %node_name, error = %err, "could not read node; treating as not suspended");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeSpec, Taint};
    use std::collections::BTreeMap;

    fn bare_node() -> Node {
        Node::default()
    }

    fn node_with_taint(key: &str) -> Node {
        Node {
            spec: Some(NodeSpec {
                taints: Some(vec![Taint {
                    key: key.to_string(),
                    effect: "NoSchedule".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node_with_annotation(key: &str) -> Node {
        let mut node = Node::default();
        let mut annotations = BTreeMap::new();
        annotations.insert(key.to_string(), "true".to_string());
        node.metadata.annotations = Some(annotations);
        node
    }

    #[test]
    fn plain_node_is_not_suspended() {
        assert!(!node_is_suspended(&bare_node()));
    }

    #[test]
    fn unschedulable_flag_suspends() {
        let node = Node {
            spec: Some(NodeSpec {
                unschedulable: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(node_is_suspended(&node));
    }

    #[test]
    fn known_taints_suspend() {
        for key in SUSPENDED_TAINT_KEYS {
            assert!(node_is_suspended(&node_with_taint(key)), "taint {key}");
        }
        assert!(!node_is_suspended(&node_with_taint("example.com/custom")));
    }

    #[test]
    fn known_annotations_suspend() {
        for key in SUSPENDED_ANNOTATION_KEYS {
            assert!(
                node_is_suspended(&node_with_annotation(key)),
                "annotation {key}"
            );
        }
        assert!(!node_is_suspended(&node_with_annotation("example.com/note")));
    }
}
