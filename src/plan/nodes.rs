//! Pick which nodes get an upgrade job next.

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use crate::labels::{ContentHash, NodeName, plan_hash_label};

/// Jobs a plan may have outstanding at once. Unset or non-positive means 1.
pub fn concurrency_limit(concurrency: Option<i64>) -> usize {
    concurrency
        .filter(|c| *c > 0)
        .and_then(|c| usize::try_from(c).ok())
        .unwrap_or(1)
}

/// Whether `node` still lacks `hash` for `plan_name`.
pub fn needs_upgrade(node: &Node, plan_name: &str, hash: &ContentHash) -> bool {
    node.labels().get(&plan_hash_label(plan_name)).map(String::as_str) != Some(hash.as_str())
}

/// Choose up to `limit` nodes to upgrade.
///
/// Nodes already applying stay selected so their jobs are carried through;
/// remaining slots go to other outdated nodes in name order.
pub fn select_nodes(
    plan_name: &str,
    hash: &ContentHash,
    nodes: &[Node],
    applying: &[String],
    limit: usize,
) -> Vec<NodeName> {
    let mut outdated: Vec<NodeName> = nodes
        .iter()
        .filter(|n| n.metadata.deletion_timestamp.is_none())
        .filter(|n| needs_upgrade(n, plan_name, hash))
        .map(|n| NodeName::new(n.name_any()))
        .collect();
    outdated.sort();

    let (mut selected, rest): (Vec<_>, Vec<_>) = outdated
        .into_iter()
        .partition(|n| applying.iter().any(|a| a == n.as_str()));
    selected.extend(rest);
    selected.truncate(limit);
    selected
}
