//! Decide whether an existing upgrade job has to be replaced.
//!
//! Jobs are never patched in place. A job is left alone unless it failed or
//! its pod template no longer matches what the builder would produce now.
//! Labels, backoff limit and deadline are not compared.

use std::fmt;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::api::DynamicObject;
use serde_json::Value;

use crate::error::SucError;

/// Outcome of comparing a live job with the desired one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Leave the running or finished job untouched.
    NoOp,
    /// Delete the job and create the desired one.
    Replace(ReplaceReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceReason {
    /// Retries and deadline are exhausted.
    Failed,
    /// The payload changed.
    TemplateChanged,
}

impl fmt::Display for ReplaceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => write!(f, "Failed"),
            Self::TemplateChanged => write!(f, "TemplateChanged"),
        }
    }
}

/// The two things the decision needs to know about a job.
pub trait JobView {
    fn is_failed(&self) -> bool;
    fn pod_template(&self) -> Option<&PodTemplateSpec>;
}

impl JobView for Job {
    fn is_failed(&self) -> bool {
        super::is_failed(self)
    }

    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
}

/// Decide what to do with `existing` given the `desired` job.
pub fn decide(existing: &impl JobView, desired: &impl JobView) -> Result<Decision, SucError> {
    if existing.is_failed() {
        return Ok(Decision::Replace(ReplaceReason::Failed));
    }
    if !templates_match(existing.pod_template(), desired.pod_template())? {
        return Ok(Decision::Replace(ReplaceReason::TemplateChanged));
    }
    Ok(Decision::NoOp)
}

/// [`decide`] for jobs that arrive as untyped objects.
///
/// Both sides are converted to `Job` first; a conversion failure aborts the
/// decision.
pub fn decide_dynamic(
    existing: &DynamicObject,
    desired: &DynamicObject,
) -> Result<Decision, SucError> {
    let existing = job_from_dynamic(existing)?;
    let desired = job_from_dynamic(desired)?;
    decide(&existing, &desired)
}

/// Convert an untyped object into a `Job`.
pub fn job_from_dynamic(obj: &DynamicObject) -> Result<Job, SucError> {
    if let Some(types) = &obj.types
        && (types.kind != "Job" || types.api_version != "batch/v1")
    {
        return Err(SucError::Conversion(format!(
            "expected batch/v1 Job but got {} {}",
            types.api_version, types.kind
        )));
    }
    let value = serde_json::to_value(obj)?;
    serde_json::from_value(value).map_err(|e| SucError::Conversion(e.to_string()))
}

/// Fields the API server or the job controller fill in on a live pod
/// template. They are ignored when the desired template leaves them unset.
const SERVER_DEFAULTED: &[&str] = &[
    // pod template metadata
    "creationTimestamp",
    "controller-uid",
    "job-name",
    "batch.kubernetes.io/controller-uid",
    "batch.kubernetes.io/job-name",
    // pod spec
    "dnsPolicy",
    "schedulerName",
    "terminationGracePeriodSeconds",
    "enableServiceLinks",
    "serviceAccount",
    // containers
    "terminationMessagePath",
    "terminationMessagePolicy",
    "imagePullPolicy",
    // volumes and field references
    "defaultMode",
    "apiVersion",
];

/// Compare pod templates in both directions.
///
/// Server-populated fields from [`SERVER_DEFAULTED`] are dropped from the
/// live template first; anything else set on only one side is a change.
fn templates_match(
    existing: Option<&PodTemplateSpec>,
    desired: Option<&PodTemplateSpec>,
) -> Result<bool, SucError> {
    let (Some(existing), Some(desired)) = (existing, desired) else {
        return Ok(existing.is_none() && desired.is_none());
    };
    let mut existing = serde_json::to_value(existing)?;
    let desired = serde_json::to_value(desired)?;
    strip_server_defaults(&mut existing, &desired);
    Ok(semantic_eq(&existing, &desired))
}

fn strip_server_defaults(actual: &mut Value, desired: &Value) {
    match (actual, desired) {
        (Value::Object(have), Value::Object(want)) => {
            have.retain(|k, _| {
                !SERVER_DEFAULTED.contains(&k.as_str()) || want.get(k).is_some_and(|v| !v.is_null())
            });
            for (k, v) in have.iter_mut() {
                if let Some(w) = want.get(k) {
                    strip_server_defaults(v, w);
                }
            }
        }
        (Value::Array(have), Value::Array(want)) => {
            for (h, w) in have.iter_mut().zip(want) {
                strip_server_defaults(h, w);
            }
        }
        (Value::Object(have), Value::Null) => {
            have.retain(|k, _| !SERVER_DEFAULTED.contains(&k.as_str()));
            for v in have.values_mut() {
                strip_server_defaults(v, &Value::Null);
            }
        }
        _ => {}
    }
}

/// Deep equality where null, `{}` and `[]` are all "unset".
fn semantic_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => x
            .keys()
            .chain(y.keys())
            .all(|k| semantic_eq(x.get(k).unwrap_or(&Value::Null), y.get(k).unwrap_or(&Value::Null))),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| semantic_eq(l, r))
        }
        _ if is_empty(a) || is_empty(b) => is_empty(a) && is_empty(b),
        _ => a == b,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.values().all(is_empty),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSecurityContext, ResourceRequirements};

    use crate::config::JobConfig;
    use crate::crd::{ContainerSpec, Plan, PlanSpec, PlanStatus};
    use crate::job::JobBuilder;
    use crate::job::testing::with_condition;
    use crate::labels::NodeName;

    fn desired_with(spec: PlanSpec, config: JobConfig) -> Job {
        let mut plan = Plan::new("k3s-latest", spec);
        plan.metadata.namespace = Some("system-upgrade".to_string());
        plan.status = Some(PlanStatus {
            latest_version: "v1.31.1-k3s1".to_string(),
            latest_hash: "abc123".to_string(),
            ..Default::default()
        });
        JobBuilder::new(config)
            .build(&plan, &NodeName::new("node-a"), "system-upgrade-controller")
            .unwrap()
    }

    fn upgrade_spec() -> PlanSpec {
        PlanSpec {
            upgrade: Some(ContainerSpec {
                image: "rancher/k3s-upgrade".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn desired() -> Job {
        desired_with(upgrade_spec(), JobConfig::default())
    }

    /// Simulate API server defaulting on the live object.
    fn as_live(mut job: Job) -> Job {
        let template = &mut job.spec.as_mut().unwrap().template;
        let template_labels = template
            .metadata
            .as_mut()
            .unwrap()
            .labels
            .as_mut()
            .unwrap();
        template_labels.insert("batch.kubernetes.io/controller-uid".to_string(), "6f1c2e0a".to_string());
        template_labels.insert("batch.kubernetes.io/job-name".to_string(), "apply-x".to_string());

        let pod = template.spec.as_mut().unwrap();
        pod.dns_policy = Some("ClusterFirst".to_string());
        pod.scheduler_name = Some("default-scheduler".to_string());
        pod.termination_grace_period_seconds = Some(30);
        pod.enable_service_links = Some(true);
        pod.security_context = Some(PodSecurityContext::default());
        for container in pod.containers.iter_mut().chain(pod.init_containers.iter_mut().flatten()) {
            container.termination_message_path = Some("/dev/termination-log".to_string());
            container.termination_message_policy = Some("File".to_string());
            container.resources = Some(ResourceRequirements::default());
            for env in container.env.iter_mut().flatten() {
                if let Some(field_ref) = env.value_from.as_mut().and_then(|v| v.field_ref.as_mut()) {
                    field_ref.api_version = Some("v1".to_string());
                }
            }
        }
        for volume in pod.volumes.iter_mut().flatten() {
            if let Some(downward) = volume.downward_api.as_mut() {
                downward.default_mode = Some(420);
            }
        }
        job.metadata.uid = Some("6f1c2e0a".to_string());
        job
    }

    fn with_upgrade_command(mut job: Job, command: &[&str]) -> Job {
        let pod = job.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        pod.containers[0].command = Some(command.iter().map(ToString::to_string).collect());
        job
    }

    #[test]
    fn test_noop_when_equal_and_not_failed() {
        assert_eq!(decide(&desired(), &desired()).unwrap(), Decision::NoOp);
    }

    #[test]
    fn test_noop_ignores_server_defaults() {
        assert_eq!(decide(&as_live(desired()), &desired()).unwrap(), Decision::NoOp);
    }

    #[test]
    fn test_noop_ignores_server_defaults_with_cordon() {
        let spec = PlanSpec {
            cordon: true,
            ..upgrade_spec()
        };
        let live = as_live(desired_with(spec.clone(), JobConfig::default()));
        assert_eq!(
            decide(&live, &desired_with(spec, JobConfig::default())).unwrap(),
            Decision::NoOp
        );
    }

    #[test]
    fn test_replace_when_live_template_has_extra_field() {
        let existing = as_live(with_upgrade_command(desired(), &["sh", "-c"]));
        assert_eq!(
            decide(&existing, &desired()).unwrap(),
            Decision::Replace(ReplaceReason::TemplateChanged)
        );
    }

    #[test]
    fn test_replace_when_desired_template_has_extra_field() {
        let desired_job = with_upgrade_command(desired(), &["sh", "-c"]);
        assert_eq!(
            decide(&as_live(desired()), &desired_job).unwrap(),
            Decision::Replace(ReplaceReason::TemplateChanged)
        );
    }

    #[test]
    fn test_replace_when_live_has_unlisted_pod_field() {
        let mut existing = as_live(desired());
        let pod = existing.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        pod.service_account_name = Some("upgrader".to_string());
        assert!(matches!(
            decide(&existing, &desired()).unwrap(),
            Decision::Replace(ReplaceReason::TemplateChanged)
        ));
    }

    #[test]
    fn test_noop_when_complete() {
        let existing = with_condition(desired(), "Complete", "True");
        assert_eq!(decide(&existing, &desired()).unwrap(), Decision::NoOp);
    }

    #[test]
    fn test_replace_on_failure_with_identical_template() {
        let existing = with_condition(desired(), "Failed", "True");
        assert_eq!(
            decide(&existing, &desired()).unwrap(),
            Decision::Replace(ReplaceReason::Failed)
        );
    }

    #[test]
    fn test_failed_false_is_not_failure() {
        let existing = with_condition(desired(), "Failed", "False");
        assert_eq!(decide(&existing, &desired()).unwrap(), Decision::NoOp);
    }

    #[test]
    fn test_replace_on_template_change() {
        let existing = desired();
        let changed = desired_with(
            upgrade_spec(),
            JobConfig {
                privileged: false,
                ..JobConfig::default()
            },
        );
        assert_eq!(
            decide(&existing, &changed).unwrap(),
            Decision::Replace(ReplaceReason::TemplateChanged)
        );
    }

    #[test]
    fn test_replace_when_step_removed() {
        let existing = desired_with(
            PlanSpec {
                cordon: true,
                ..upgrade_spec()
            },
            JobConfig::default(),
        );
        let decision = decide(&existing, &desired()).unwrap();
        assert!(matches!(decision, Decision::Replace(_)));
    }

    #[test]
    fn test_replace_when_image_changed() {
        let existing = desired();
        let mut spec = upgrade_spec();
        spec.upgrade.as_mut().unwrap().image = "rancher/rke2-upgrade".to_string();
        let changed = desired_with(spec, JobConfig::default());
        assert!(matches!(
            decide(&existing, &changed).unwrap(),
            Decision::Replace(ReplaceReason::TemplateChanged)
        ));
    }

    /// Drift outside the pod template (labels, backoff limit, deadline) is
    /// not picked up; the job keeps running until it completes or fails.
    #[test]
    fn test_non_template_drift_is_ignored() {
        let existing = desired();
        let mut changed = desired_with(
            upgrade_spec(),
            JobConfig {
                active_deadline_seconds: 60,
                backoff_limit: 9,
                ..JobConfig::default()
            },
        );
        changed
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("extra".to_string(), "label".to_string());
        assert_eq!(decide(&existing, &changed).unwrap(), Decision::NoOp);
    }

    #[test]
    fn test_dynamic_conversion() {
        let job = desired();
        let dynamic: DynamicObject =
            serde_json::from_value(serde_json::to_value(&job).unwrap()).unwrap();
        let failed: DynamicObject = serde_json::from_value(
            serde_json::to_value(with_condition(job, "Failed", "True")).unwrap(),
        )
        .unwrap();
        assert_eq!(decide_dynamic(&dynamic, &dynamic).unwrap(), Decision::NoOp);
        assert_eq!(
            decide_dynamic(&failed, &dynamic).unwrap(),
            Decision::Replace(ReplaceReason::Failed)
        );
    }

    #[test]
    fn test_dynamic_conversion_rejects_other_kinds() {
        let dynamic: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "not-a-job"},
            "data": {"a": "b"}
        }))
        .unwrap();
        let err = job_from_dynamic(&dynamic).unwrap_err();
        assert!(matches!(err, SucError::Conversion(_)));
    }

    #[test]
    fn test_dynamic_conversion_rejects_malformed_job() {
        let dynamic: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "broken"},
            "spec": {"backoffLimit": "two"}
        }))
        .unwrap();
        assert!(matches!(
            job_from_dynamic(&dynamic),
            Err(SucError::Conversion(_))
        ));
    }

    #[test]
    fn test_semantic_eq() {
        let a = serde_json::json!({"a": 1, "b": null, "c": [], "d": {"e": null}});
        assert!(semantic_eq(&a, &serde_json::json!({"a": 1})));
        assert!(!semantic_eq(&a, &serde_json::json!({"a": 1, "z": 2})));
        assert!(!semantic_eq(&serde_json::json!({"a": 2}), &serde_json::json!({"a": 1})));
        assert!(!semantic_eq(&serde_json::json!([1]), &serde_json::json!([1, 2])));
    }

    #[test]
    fn test_strip_server_defaults_only_drops_listed_fields() {
        let mut actual = serde_json::json!({
            "dnsPolicy": "ClusterFirst",
            "hostname": "node-a",
            "containers": [{"name": "upgrade", "terminationMessagePath": "/dev/termination-log"}]
        });
        let desired = serde_json::json!({"containers": [{"name": "upgrade"}]});
        strip_server_defaults(&mut actual, &desired);
        assert_eq!(
            actual,
            serde_json::json!({"hostname": "node-a", "containers": [{"name": "upgrade"}]})
        );
    }

    #[test]
    fn test_strip_server_defaults_keeps_fields_the_builder_sets() {
        let mut actual = serde_json::json!({"dnsPolicy": "Default"});
        let desired = serde_json::json!({"dnsPolicy": "ClusterFirstWithHostNet"});
        strip_server_defaults(&mut actual, &desired);
        assert!(!semantic_eq(&actual, &desired));
    }
}
