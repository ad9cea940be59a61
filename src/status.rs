//! Plan status patching, conditions, and event recording.

use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Api;
use kube::Resource;
use kube::api::{Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::{debug, warn};

use crate::crd::{Plan, PlanCondition, PlanStatus};
use crate::error::SucError;

pub const CONDITION_APPLYING: &str = "Applying";
pub const CONDITION_LATEST_RESOLVED: &str = "LatestResolved";

pub const REASON_JOB_CREATED: &str = "JobCreated";
pub const REASON_JOB_REPLACED: &str = "JobReplaced";
pub const REASON_DEADLINE_MISCONFIGURED: &str = "DeadlineMisconfigured";

/// Patch the status subresource of a `Plan`.
pub async fn patch_status(api: &Api<Plan>, name: &str, status: &PlanStatus) -> Result<Plan, SucError> {
    debug!(
        plan = name,
        hash = %status.latest_hash,
        applying = status.applying.len(),
        "Patching plan status"
    );

    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply("suc"), &Patch::Merge(&patch))
        .await
        .map_err(|e| SucError::kube("status::patch_status", e))
}

/// Set a condition on the status.
///
/// The transition time only moves when the condition status flips.
pub fn set_condition(
    status: &mut PlanStatus,
    condition_type: &str,
    condition_status: &str,
    reason: &str,
    message: Option<String>,
) {
    let last_transition_time = status
        .conditions
        .iter()
        .find(|c| c.r#type == condition_type && c.status == condition_status)
        .map_or_else(Utc::now, |c| c.last_transition_time);

    status.conditions.retain(|c| c.r#type != condition_type);
    status.conditions.push(PlanCondition {
        r#type: condition_type.to_string(),
        status: condition_status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time,
    });
}

/// Whether a status change needs to be written, ignoring condition timestamps.
pub fn status_changed(old: &PlanStatus, new: &PlanStatus) -> bool {
    let strip = |s: &PlanStatus| {
        let mut s = s.clone();
        for c in &mut s.conditions {
            c.last_transition_time = chrono::DateTime::<Utc>::UNIX_EPOCH;
        }
        s.conditions.sort_by(|a, b| a.r#type.cmp(&b.r#type));
        s
    };
    strip(old) != strip(new)
}

/// Event recorder bundled with its target `Plan` reference.
pub struct EventRecorder {
    recorder: Recorder,
    obj_ref: ObjectReference,
}

impl EventRecorder {
    pub fn new(client: kube::Client, controller: &str, plan: &Plan) -> Self {
        let reporter = Reporter {
            controller: controller.into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
            obj_ref: plan.object_ref(&()),
        }
    }

    pub async fn publish(&self, reason: &str, message: &str) {
        self.emit(EventType::Normal, reason, message).await;
    }

    pub async fn publish_warning(&self, reason: &str, message: &str) {
        self.emit(EventType::Warning, reason, message).await;
    }

    async fn emit(&self, type_: EventType, reason: &str, message: &str) {
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(message.into()),
            action: reason.into(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &self.obj_ref).await {
            warn!(reason, "Failed to publish event: {}", e);
        }
    }
}
