//! Translate a `Plan` and a target node into an upgrade `Job`.

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, DownwardAPIVolumeFile, DownwardAPIVolumeSource, HostPathVolumeSource,
    NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, ObjectFieldSelector,
    PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec, SecretVolumeSource, Toleration,
    Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use kube::ResourceExt;
use tracing::warn;

use crate::config::JobConfig;
use crate::crd::{DrainSpec, Plan};
use crate::error::SucError;
use crate::labels::{ContentHash, JobLabels, LABEL_PLAN, NodeName};

use super::container::{
    ContainerStep, PlanEnvironment, VOLUME_HOST_ROOT, VOLUME_POD_INFO, secret_volume_name,
};
use super::safe_concat_name;

const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";
const TAINT_NODE_UNSCHEDULABLE: &str = "node.kubernetes.io/unschedulable";

/// Deterministic job name for applying `plan_name` at `hash` on `node`.
pub fn job_name(plan_name: &str, node: &NodeName, hash: &ContentHash) -> String {
    safe_concat_name(&[
        "apply",
        plan_name,
        "on",
        node.as_str(),
        "with",
        hash.as_str(),
    ])
}

/// Whether a drain could still be running when the job deadline kills it.
///
/// A killed drain leaves the node cordoned with no completion to uncordon it.
pub fn drain_exceeds_deadline(drain: &DrainSpec, active_deadline_seconds: i64) -> bool {
    match drain.timeout {
        Some(timeout) if active_deadline_seconds > 0 => {
            i64::try_from(timeout).map_or(true, |t| t > active_deadline_seconds)
        }
        _ => false,
    }
}

/// Builds upgrade jobs with a fixed job configuration.
#[derive(Debug, Clone)]
pub struct JobBuilder {
    config: JobConfig,
}

impl JobBuilder {
    pub const fn new(config: JobConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Build the job applying `plan` on `node`.
    ///
    /// Same plan status, node and controller always yield the same job.
    /// Fails only when the plan has no upgrade container.
    pub fn build(&self, plan: &Plan, node: &NodeName, controller: &str) -> Result<Job, SucError> {
        let plan_name = plan.name_any();
        let namespace = plan.namespace().unwrap_or_default();
        let spec = &plan.spec;
        let status = plan.status.clone().unwrap_or_default();
        let hash = ContentHash::new(status.latest_hash.clone());

        let upgrade = spec.upgrade.as_ref().ok_or_else(|| {
            SucError::InvalidPlan(
                format!("{namespace}/{plan_name}"),
                "spec.upgrade is required".to_string(),
            )
        })?;

        let labels = JobLabels {
            controller: controller.to_string(),
            node: node.clone(),
            plan: plan_name.clone(),
            version: status.latest_version.clone(),
            hash: hash.clone(),
            cordon: spec.cordons(),
        }
        .to_labels();

        let environment = PlanEnvironment {
            plan_name: plan_name.clone(),
            namespace: namespace.clone(),
            latest_version: status.latest_version.clone(),
            latest_hash: status.latest_hash.clone(),
        };
        let finish = |step: ContainerStep| -> Container {
            step.with_secrets(&spec.secrets)
                .with_plan_environment(&environment)
                .with_image_pull_policy(&self.config.image_pull_policy)
                .build()
        };

        // Prepare, then at most one of drain or cordon
        let mut init_containers = Vec::new();
        if let Some(prepare) = &spec.prepare {
            init_containers.push(finish(ContainerStep::prepare(prepare)));
        }
        if let Some(drain) = &spec.drain {
            init_containers.push(finish(ContainerStep::drain(
                &self.config.kubectl_image,
                node.as_str(),
                drain,
            )));
        } else if spec.cordon {
            init_containers.push(finish(ContainerStep::cordon(
                &self.config.kubectl_image,
                node.as_str(),
            )));
        }

        let upgrade_container = finish(ContainerStep::upgrade(
            upgrade,
            &status.latest_version,
            self.config.privileged,
        ));

        let mut volumes = base_volumes();
        volumes.extend(spec.secrets.iter().map(|secret| Volume {
            name: secret_volume_name(&secret.name),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }));

        let active_deadline_seconds = if self.config.active_deadline_seconds > 0 {
            if let Some(drain) = &spec.drain
                && drain_exceeds_deadline(drain, self.config.active_deadline_seconds)
            {
                warn!(
                    plan = %plan_name,
                    node = %node,
                    drain_timeout_seconds = drain.timeout,
                    active_deadline_seconds = self.config.active_deadline_seconds,
                    "Drain timeout exceeds job active deadline"
                );
            }
            Some(self.config.active_deadline_seconds)
        } else {
            None
        };

        Ok(Job {
            metadata: ObjectMeta {
                name: Some(job_name(&plan_name, node, &hash)),
                namespace: Some(namespace),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(self.config.backoff_limit),
                active_deadline_seconds,
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        host_ipc: Some(true),
                        host_pid: Some(true),
                        host_network: Some(true),
                        service_account_name: spec.service_account_name.clone(),
                        affinity: Some(affinity(&plan_name, node)),
                        tolerations: Some(vec![Toleration {
                            key: Some(TAINT_NODE_UNSCHEDULABLE.to_string()),
                            operator: Some("Exists".to_string()),
                            effect: Some("NoSchedule".to_string()),
                            ..Default::default()
                        }]),
                        restart_policy: Some("Never".to_string()),
                        init_containers: if init_containers.is_empty() {
                            None
                        } else {
                            Some(init_containers)
                        },
                        containers: vec![upgrade_container],
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        })
    }
}

/// Pin the pod to `node` and keep two pods of the same plan off one node.
fn affinity(plan_name: &str, node: &NodeName) -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: LABEL_HOSTNAME.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![node.to_string()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: LABEL_PLAN.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![plan_name.to_string()]),
                    }]),
                    ..Default::default()
                }),
                topology_key: LABEL_HOSTNAME.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn base_volumes() -> Vec<Volume> {
    vec![
        Volume {
            name: VOLUME_HOST_ROOT.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: "/".to_string(),
                type_: Some("Directory".to_string()),
            }),
            ..Default::default()
        },
        Volume {
            name: VOLUME_POD_INFO.to_string(),
            downward_api: Some(DownwardAPIVolumeSource {
                items: Some(vec![
                    DownwardAPIVolumeFile {
                        path: "labels".to_string(),
                        field_ref: Some(ObjectFieldSelector {
                            field_path: "metadata.labels".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    DownwardAPIVolumeFile {
                        path: "annotations".to_string(),
                        field_ref: Some(ObjectFieldSelector {
                            field_path: "metadata.annotations".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ContainerSpec, PlanSpec, PlanStatus, SecretSpec};
    use crate::job::container::{STEP_CORDON, STEP_DRAIN, STEP_PREPARE, STEP_UPGRADE};
    use crate::labels::{LABEL_CONTROLLER, LABEL_CORDON, LABEL_HASH, LABEL_NODE, LABEL_VERSION};

    fn plan(spec: PlanSpec, hash: &str) -> Plan {
        let mut plan = Plan::new("k3s-latest", spec);
        plan.metadata.namespace = Some("system-upgrade".to_string());
        plan.status = Some(PlanStatus {
            latest_version: "v1.31.1-k3s1".to_string(),
            latest_hash: hash.to_string(),
            ..Default::default()
        });
        plan
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

    fn build(plan: &Plan) -> Job {
        JobBuilder::new(JobConfig::default())
            .build(plan, &NodeName::new("node-a"), "system-upgrade-controller")
            .unwrap()
    }

    fn step_names(job: &Job) -> Vec<String> {
        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        pod.init_containers
            .iter()
            .flatten()
            .chain(pod.containers.iter())
            .map(|c| c.name.clone())
            .collect()
    }

    fn labels(job: &Job) -> &std::collections::BTreeMap<String, String> {
        job.metadata.labels.as_ref().unwrap()
    }

    #[test]
    fn test_cordon_plan_example() {
        let spec = PlanSpec {
            cordon: true,
            ..upgrade_spec()
        };
        let job = build(&plan(spec, "abc123"));
        assert_eq!(
            job.metadata.name.as_deref(),
            Some("apply-k3s-latest-on-node-a-with-abc123")
        );
        assert_eq!(labels(&job)[LABEL_CORDON], "true");
        assert_eq!(step_names(&job), vec![STEP_CORDON, STEP_UPGRADE]);
    }

    #[test]
    fn test_drain_plan_example() {
        let spec = PlanSpec {
            drain: Some(DrainSpec::default()),
            ..upgrade_spec()
        };
        let job = build(&plan(spec, "abc123"));
        assert_eq!(labels(&job)[LABEL_CORDON], "true");
        assert_eq!(step_names(&job), vec![STEP_DRAIN, STEP_UPGRADE]);
    }

    #[test]
    fn test_drain_takes_precedence_over_cordon() {
        let spec = PlanSpec {
            cordon: true,
            drain: Some(DrainSpec::default()),
            ..upgrade_spec()
        };
        let job = build(&plan(spec, "abc123"));
        assert_eq!(labels(&job)[LABEL_CORDON], "true");
        assert_eq!(step_names(&job), vec![STEP_DRAIN, STEP_UPGRADE]);
    }

    #[test]
    fn test_no_cordon_no_drain() {
        let job = build(&plan(upgrade_spec(), "abc123"));
        assert_eq!(labels(&job)[LABEL_CORDON], "false");
        assert_eq!(step_names(&job), vec![STEP_UPGRADE]);
        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert!(pod.init_containers.is_none());
    }

    #[test]
    fn test_prepare_runs_first() {
        let spec = PlanSpec {
            prepare: Some(ContainerSpec {
                image: "busybox".to_string(),
                ..Default::default()
            }),
            drain: Some(DrainSpec::default()),
            ..upgrade_spec()
        };
        let job = build(&plan(spec, "abc123"));
        assert_eq!(step_names(&job), vec![STEP_PREPARE, STEP_DRAIN, STEP_UPGRADE]);
    }

    #[test]
    fn test_idempotent_naming() {
        let plan = plan(upgrade_spec(), "abc123");
        let first = build(&plan);
        let second = build(&plan);
        assert_eq!(first.metadata.name, second.metadata.name);
        assert_eq!(first, second);
    }

    #[test]
    fn test_hash_sensitivity() {
        let first = build(&plan(upgrade_spec(), "abc123"));
        let mut changed = plan(upgrade_spec(), "def456");
        changed.status.as_mut().unwrap().latest_version = "v1.31.2-k3s1".to_string();
        let second = build(&changed);

        assert_ne!(first.metadata.name, second.metadata.name);
        assert_ne!(labels(&first)[LABEL_HASH], labels(&second)[LABEL_HASH]);
        assert_ne!(labels(&first)[LABEL_VERSION], labels(&second)[LABEL_VERSION]);
        assert_eq!(labels(&first)[LABEL_NODE], labels(&second)[LABEL_NODE]);
        assert_eq!(labels(&first)[LABEL_PLAN], labels(&second)[LABEL_PLAN]);
    }

    #[test]
    fn test_labels_on_job_and_template() {
        let job = build(&plan(upgrade_spec(), "abc123"));
        let template_labels = job
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .as_ref()
            .unwrap();
        assert_eq!(template_labels, labels(&job));
        assert_eq!(labels(&job)[LABEL_CONTROLLER], "system-upgrade-controller");
        assert_eq!(labels(&job)[LABEL_VERSION], "v1.31.1-k3s1");
    }

    #[test]
    fn test_scheduling_constraints() {
        let job = build(&plan(upgrade_spec(), "abc123"));
        let job_spec = job.spec.as_ref().unwrap();
        assert_eq!(job_spec.backoff_limit, Some(2));
        assert_eq!(job_spec.active_deadline_seconds, Some(600));

        let pod = job_spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));

        let affinity = pod.affinity.as_ref().unwrap();
        let node_term = &affinity
            .node_affinity
            .as_ref()
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap()
            .node_selector_terms[0];
        let req = &node_term.match_expressions.as_ref().unwrap()[0];
        assert_eq!(req.key, "kubernetes.io/hostname");
        assert_eq!(req.values, Some(vec!["node-a".to_string()]));

        let anti = &affinity
            .pod_anti_affinity
            .as_ref()
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap()[0];
        assert_eq!(anti.topology_key, "kubernetes.io/hostname");
        let anti_req = &anti
            .label_selector
            .as_ref()
            .unwrap()
            .match_expressions
            .as_ref()
            .unwrap()[0];
        assert_eq!(anti_req.key, LABEL_PLAN);
        assert_eq!(anti_req.values, Some(vec!["k3s-latest".to_string()]));

        let toleration = &pod.tolerations.as_ref().unwrap()[0];
        assert_eq!(
            toleration.key.as_deref(),
            Some("node.kubernetes.io/unschedulable")
        );
        assert_eq!(toleration.operator.as_deref(), Some("Exists"));
        assert_eq!(toleration.effect.as_deref(), Some("NoSchedule"));
    }

    #[test]
    fn test_deadline_disabled() {
        let config = JobConfig {
            active_deadline_seconds: 0,
            ..JobConfig::default()
        };
        let job = JobBuilder::new(config)
            .build(&plan(upgrade_spec(), "abc123"), &NodeName::new("node-a"), "suc")
            .unwrap();
        assert_eq!(job.spec.unwrap().active_deadline_seconds, None);
    }

    #[test]
    fn test_secret_volumes() {
        let spec = PlanSpec {
            secrets: vec![
                SecretSpec {
                    name: "registry".to_string(),
                    path: None,
                },
                SecretSpec {
                    name: "tls".to_string(),
                    path: Some("/etc/tls".to_string()),
                },
            ],
            ..upgrade_spec()
        };
        let job = build(&plan(spec, "abc123"));
        let volumes = job
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .volumes
            .unwrap();
        let names: Vec<&str> = volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["host-root", "pod-info", "secret-registry", "secret-tls"]);
        assert_eq!(
            volumes[3].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("tls")
        );
    }

    #[test]
    fn test_only_upgrade_step_is_privileged() {
        let spec = PlanSpec {
            prepare: Some(ContainerSpec {
                image: "busybox".to_string(),
                ..Default::default()
            }),
            cordon: true,
            ..upgrade_spec()
        };
        let job = build(&plan(spec, "abc123"));
        let pod = job.spec.unwrap().template.spec.unwrap();
        for init in pod.init_containers.unwrap() {
            assert!(init.security_context.is_none(), "{}", init.name);
        }
        let upgrade = &pod.containers[0];
        assert_eq!(upgrade.image.as_deref(), Some("rancher/k3s-upgrade:v1.31.1-k3s1"));
        assert_eq!(
            upgrade.security_context.as_ref().unwrap().privileged,
            Some(true)
        );
    }

    #[test]
    fn test_missing_upgrade_is_invalid() {
        let result = JobBuilder::new(JobConfig::default()).build(
            &plan(PlanSpec::default(), "abc123"),
            &NodeName::new("node-a"),
            "suc",
        );
        assert!(matches!(result, Err(SucError::InvalidPlan(_, _))));
    }

    #[test]
    fn test_drain_exceeds_deadline() {
        let drain = DrainSpec {
            timeout: Some(900),
            ..Default::default()
        };
        assert!(drain_exceeds_deadline(&drain, 600));
        assert!(!drain_exceeds_deadline(&drain, 900));
        assert!(!drain_exceeds_deadline(&drain, 0));
        assert!(!drain_exceeds_deadline(&DrainSpec::default(), 600));
    }

    #[test]
    fn test_misconfigured_drain_still_builds() {
        let spec = PlanSpec {
            drain: Some(DrainSpec {
                timeout: Some(3600),
                ..Default::default()
            }),
            ..upgrade_spec()
        };
        let job = build(&plan(spec, "abc123"));
        assert_eq!(job.spec.unwrap().active_deadline_seconds, Some(600));
    }

    /// `(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?`, at most 63 characters.
    fn is_label_value(value: &str) -> bool {
        let alnum = |c: char| c.is_ascii_alphanumeric();
        value.len() <= 63
            && (value.is_empty()
                || (value.starts_with(alnum)
                    && value.ends_with(alnum)
                    && value
                        .chars()
                        .all(|c| alnum(c) || matches!(c, '-' | '_' | '.'))))
    }

    #[test]
    fn test_channel_release_builds_valid_labels_and_tag() {
        let base = reqwest::Url::parse("https://update.k3s.io/v1-release/channels/stable").unwrap();
        let released = crate::plan::version::latest_from_location(
            &base,
            "https://github.com/k3s-io/k3s/releases/tag/v1.31.1%2Bk3s1",
        )
        .unwrap();
        let version = crate::plan::version::munge_version(&released);
        let hash = crate::plan::version::compute_hash(&upgrade_spec(), &version).unwrap();

        let mut plan = plan(upgrade_spec(), hash.as_str());
        plan.status.as_mut().unwrap().latest_version = version;
        let job = build(&plan);

        for (key, value) in labels(&job) {
            assert!(is_label_value(value), "{key}={value:?} is not a valid label value");
        }
        assert_eq!(labels(&job)[LABEL_VERSION], "v1.31.1-k3s1");
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            pod.containers[0].image.as_deref(),
            Some("rancher/k3s-upgrade:v1.31.1-k3s1")
        );
    }
}
