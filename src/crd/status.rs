//! `Plan` status types.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition on the `Plan` resource.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanCondition {
    pub r#type: String,
    pub status: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

/// `Plan` status defines the observed state of the rollout.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    /// Version resolved from `spec.version` or `spec.channel`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub latest_version: String,

    /// Fingerprint of the spec and resolved version. Versions job names.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub latest_hash: String,

    /// Nodes with an outstanding job for the latest hash.
    /// NOTE: No `skip_serializing_if`: an empty list must serialize so that
    /// JSON Merge Patch clears it.
    #[serde(default)]
    pub applying: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PlanCondition>,
}
