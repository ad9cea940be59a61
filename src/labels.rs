//! Label keys and typed identifiers shared by plans, nodes and jobs.
//!
//! Labels are the only link between a `Plan`, the `Node` it targets and the
//! `Job` that carries it out. Inside the controller those links are typed;
//! the string form only exists at the object boundary.

use std::collections::BTreeMap;
use std::fmt;

/// Name of the controller that created the job.
pub const LABEL_CONTROLLER: &str = "upgrade.cattle.io/controller";

/// Node being upgraded.
pub const LABEL_NODE: &str = "upgrade.cattle.io/node";

/// Plan being applied.
pub const LABEL_PLAN: &str = "upgrade.cattle.io/plan";

/// Version of the plan being applied.
pub const LABEL_VERSION: &str = "upgrade.cattle.io/version";

/// Hash of the plan being applied.
pub const LABEL_HASH: &str = "upgrade.cattle.io/hash";

/// "true" when the plan cordons (bare cordon or drain).
pub const LABEL_CORDON: &str = "upgrade.cattle.io/cordon";

/// Prefix for per-plan labels written onto nodes.
pub const LABEL_PLAN_PREFIX: &str = "plan.upgrade.cattle.io";

/// Node label recording the hash of `plan_name` last applied to it.
pub fn plan_hash_label(plan_name: &str) -> String {
    format!("{LABEL_PLAN_PREFIX}/{plan_name}")
}

/// Name of a node targeted by a plan.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content fingerprint of a plan spec.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identifying labels stamped on a job (and its pod template) at creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobLabels {
    pub controller: String,
    pub node: NodeName,
    pub plan: String,
    pub version: String,
    pub hash: ContentHash,
    pub cordon: bool,
}

impl JobLabels {
    /// Wire form of the labels.
    pub fn to_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_CONTROLLER.to_string(), self.controller.clone()),
            (LABEL_NODE.to_string(), self.node.to_string()),
            (LABEL_PLAN.to_string(), self.plan.clone()),
            (LABEL_VERSION.to_string(), self.version.clone()),
            (LABEL_HASH.to_string(), self.hash.to_string()),
            (LABEL_CORDON.to_string(), self.cordon.to_string()),
        ])
    }
}

/// What the completion handler can learn about a job from its labels.
///
/// Every field is optional: jobs created by older controllers, or by hand,
/// may carry only part of the set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObservedJobLabels {
    pub plan: Option<String>,
    pub node: Option<NodeName>,
    pub hash: Option<ContentHash>,
    pub cordon: bool,
}

impl ObservedJobLabels {
    pub fn parse(labels: Option<&BTreeMap<String, String>>) -> Self {
        let Some(labels) = labels else {
            return Self::default();
        };
        Self {
            plan: labels.get(LABEL_PLAN).cloned(),
            node: labels.get(LABEL_NODE).map(NodeName::new),
            hash: labels.get(LABEL_HASH).map(ContentHash::new),
            cordon: labels.get(LABEL_CORDON).is_some_and(|v| v == "true"),
        }
    }
}
