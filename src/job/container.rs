//! Container steps of an upgrade job.
//!
//! Each step (prepare, cordon, drain, upgrade) is a container built from a
//! template plus options that apply across steps. Only the upgrade step can
//! override the image tag or run with elevated privileges.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, ObjectFieldSelector, ResourceRequirements,
    SecurityContext, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::crd::{ContainerSpec, DrainSpec, SecretSpec};
use crate::labels::LABEL_CONTROLLER;

use super::safe_concat_name;

pub const STEP_PREPARE: &str = "prepare";
pub const STEP_CORDON: &str = "cordon";
pub const STEP_DRAIN: &str = "drain";
pub const STEP_UPGRADE: &str = "upgrade";

pub const VOLUME_HOST_ROOT: &str = "host-root";
pub const VOLUME_POD_INFO: &str = "pod-info";
const HOST_ROOT_MOUNT_PATH: &str = "/host";
const POD_INFO_MOUNT_PATH: &str = "/run/system-upgrade/pod";

/// Capability that lets the upgrade payload reboot the host.
const CAP_SYS_BOOT: &str = "CAP_SYS_BOOT";

/// Plan identity exposed to every step through the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEnvironment {
    pub plan_name: String,
    pub namespace: String,
    pub latest_version: String,
    pub latest_hash: String,
}

impl PlanEnvironment {
    fn env_vars(&self) -> Vec<EnvVar> {
        vec![
            field_env("SYSTEM_UPGRADE_NODE_NAME", "spec.nodeName"),
            field_env("SYSTEM_UPGRADE_POD_NAME", "metadata.name"),
            value_env("SYSTEM_UPGRADE_PLAN_NAME", &self.plan_name),
            value_env("SYSTEM_UPGRADE_PLAN_NAMESPACE", &self.namespace),
            value_env("SYSTEM_UPGRADE_PLAN_LATEST_VERSION", &self.latest_version),
            value_env("SYSTEM_UPGRADE_PLAN_LATEST_HASH", &self.latest_hash),
        ]
    }
}

fn value_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One step of the job pipeline, under construction.
#[derive(Debug, Clone)]
pub struct ContainerStep {
    name: String,
    template: ContainerSpec,
    secrets: Vec<SecretSpec>,
    environment: Option<PlanEnvironment>,
    image_pull_policy: Option<String>,
    security_context: Option<SecurityContext>,
}

impl ContainerStep {
    fn new(name: &str, template: ContainerSpec) -> Self {
        Self {
            name: name.to_string(),
            template,
            secrets: Vec::new(),
            environment: None,
            image_pull_policy: None,
            security_context: None,
        }
    }

    /// Run the plan's prepare template.
    pub fn prepare(template: &ContainerSpec) -> Self {
        Self::new(STEP_PREPARE, template.clone())
    }

    /// Cordon `node` with kubectl.
    pub fn cordon(kubectl_image: &str, node: &str) -> Self {
        Self::new(
            STEP_CORDON,
            ContainerSpec {
                image: kubectl_image.to_string(),
                args: vec!["cordon".to_string(), node.to_string()],
                ..Default::default()
            },
        )
    }

    /// Drain `node` with kubectl.
    pub fn drain(kubectl_image: &str, node: &str, drain: &DrainSpec) -> Self {
        Self::new(
            STEP_DRAIN,
            ContainerSpec {
                image: kubectl_image.to_string(),
                args: drain_args(node, drain),
                ..Default::default()
            },
        )
    }

    /// Run the plan's upgrade template at `version`, optionally privileged.
    ///
    /// The image tag is replaced by `version` and the container may reboot
    /// the host.
    pub fn upgrade(template: &ContainerSpec, version: &str, privileged: bool) -> Self {
        let mut template = template.clone();
        if !version.is_empty() {
            template.image = with_image_tag(&template.image, version);
        }
        let mut step = Self::new(STEP_UPGRADE, template);
        step.security_context = Some(SecurityContext {
            privileged: Some(privileged),
            capabilities: Some(Capabilities {
                add: Some(vec![CAP_SYS_BOOT.to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        });
        step
    }

    #[must_use]
    pub fn with_secrets(mut self, secrets: &[SecretSpec]) -> Self {
        self.secrets = secrets.to_vec();
        self
    }

    #[must_use]
    pub fn with_plan_environment(mut self, environment: &PlanEnvironment) -> Self {
        self.environment = Some(environment.clone());
        self
    }

    #[must_use]
    pub fn with_image_pull_policy(mut self, policy: &str) -> Self {
        self.image_pull_policy = Some(policy.to_string());
        self
    }

    pub fn build(self) -> Container {
        let mut env = self
            .environment
            .as_ref()
            .map(PlanEnvironment::env_vars)
            .unwrap_or_default();
        env.extend(self.template.env.iter().map(|e| value_env(&e.name, &e.value)));

        let mut volume_mounts = vec![
            VolumeMount {
                name: VOLUME_HOST_ROOT.to_string(),
                mount_path: HOST_ROOT_MOUNT_PATH.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: VOLUME_POD_INFO.to_string(),
                mount_path: POD_INFO_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ];
        volume_mounts.extend(self.secrets.iter().map(|secret| VolumeMount {
            name: secret_volume_name(&secret.name),
            mount_path: secret.mount_path(),
            read_only: Some(true),
            ..Default::default()
        }));

        Container {
            name: self.name,
            image: Some(self.template.image),
            command: non_empty(self.template.command),
            args: non_empty(self.template.args),
            env: non_empty(env),
            resources: self.template.resources.map(|r| ResourceRequirements {
                limits: quantities(r.limits),
                requests: quantities(r.requests),
                ..Default::default()
            }),
            volume_mounts: Some(volume_mounts),
            image_pull_policy: self.image_pull_policy,
            security_context: self.security_context,
            ..Default::default()
        }
    }
}

/// Volume name for a plan secret.
pub fn secret_volume_name(secret_name: &str) -> String {
    safe_concat_name(&["secret", secret_name])
}

/// Translate drain options into `kubectl drain` arguments.
///
/// The controller's own pods are always excluded so the drain never evicts
/// the job running it.
pub fn drain_args(node: &str, drain: &DrainSpec) -> Vec<String> {
    let mut args = vec![
        "drain".to_string(),
        node.to_string(),
        "--pod-selector".to_string(),
        format!("!{LABEL_CONTROLLER}"),
    ];
    if drain.ignore_daemon_sets.unwrap_or(true) {
        args.push("--ignore-daemonsets".to_string());
    }
    if drain.delete_local_data.unwrap_or(true) {
        args.push("--delete-emptydir-data".to_string());
    }
    if drain.force {
        args.push("--force".to_string());
    }
    if let Some(timeout) = drain.timeout {
        args.push("--timeout".to_string());
        args.push(format!("{timeout}s"));
    }
    if let Some(grace_period) = drain.grace_period {
        args.push("--grace-period".to_string());
        args.push(grace_period.to_string());
    }
    args
}

/// Replace (or add) the tag of an image reference.
///
/// Handles registry ports (`host:5000/img`) and strips any digest.
pub fn with_image_tag(image: &str, tag: &str) -> String {
    let image = image.split('@').next().unwrap_or(image);
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    let repository = match image[name_start..].rfind(':') {
        Some(colon) => &image[..name_start + colon],
        None => image,
    };
    format!("{repository}:{tag}")
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() { None } else { Some(items) }
}

fn quantities(map: BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if map.is_empty() {
        return None;
    }
    Some(map.into_iter().map(|(k, v)| (k, Quantity(v))).collect())
}
