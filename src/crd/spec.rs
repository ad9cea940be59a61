//! `Plan` spec types.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::PlanStatus;
use super::types::{ContainerSpec, DrainSpec, NodeSelectorSpec, SecretSpec};

/// `Plan` spec describes an upgrade to roll out across the selected nodes.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "upgrade.cattle.io",
    version = "v1",
    kind = "Plan",
    namespaced,
    status = "PlanStatus",
    printcolumn = r#"{"name":"IMAGE","type":"string","jsonPath":".spec.upgrade.image"}"#,
    printcolumn = r#"{"name":"CHANNEL","type":"string","jsonPath":".spec.channel"}"#,
    printcolumn = r#"{"name":"VERSION","type":"string","jsonPath":".status.latestVersion"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlanSpec {
    /// Maximum number of nodes upgrading at the same time (default: 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<i64>,

    /// Nodes this plan applies to. An empty selector matches every node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<NodeSelectorSpec>,

    /// Service account the upgrade job runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Explicit target version. Takes precedence over `channel`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// URL that redirects to the latest release; the last path segment of the
    /// redirect target is used as the version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Secrets mounted into every step of the job.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretSpec>,

    /// Optional step run before cordon/drain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare: Option<ContainerSpec>,

    /// The upgrade payload. Required for a plan to produce jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<ContainerSpec>,

    /// Cordon the node before upgrading. Ignored when `drain` is set.
    #[serde(default)]
    pub cordon: bool,

    /// Drain the node before upgrading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain: Option<DrainSpec>,
}

impl PlanSpec {
    /// Whether jobs for this plan mark the node unschedulable.
    pub const fn cordons(&self) -> bool {
        self.cordon || self.drain.is_some()
    }
}
