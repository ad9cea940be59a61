//! Process configuration from flags and environment.

use clap::{ArgAction, Parser, Subcommand};

pub const DEFAULT_ACTIVE_DEADLINE_SECONDS: i64 = 600;
pub const DEFAULT_BACKOFF_LIMIT: i32 = 2;
pub const DEFAULT_KUBECTL_IMAGE: &str = "rancher/kubectl:v1.31.0";
pub const DEFAULT_IMAGE_PULL_POLICY: &str = "IfNotPresent";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "suc",
    version,
    about = "Rolls out upgrade Plans across Kubernetes nodes"
)]
pub struct Config {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Name stamped on every job this controller creates
    #[arg(
        long,
        env = "SYSTEM_UPGRADE_CONTROLLER_NAME",
        default_value = "system-upgrade-controller"
    )]
    pub controller_name: String,

    /// Only watch plans in this namespace (all namespaces when unset)
    #[arg(long, env = "SYSTEM_UPGRADE_CONTROLLER_NAMESPACE")]
    pub namespace: Option<String>,

    /// Job activeDeadlineSeconds; 0 or less leaves the deadline unset
    #[arg(long, env = "SYSTEM_UPGRADE_JOB_ACTIVE_DEADLINE_SECONDS", default_value_t = DEFAULT_ACTIVE_DEADLINE_SECONDS)]
    pub job_active_deadline_seconds: i64,

    /// Job backoffLimit
    #[arg(long, env = "SYSTEM_UPGRADE_JOB_BACKOFF_LIMIT", default_value_t = DEFAULT_BACKOFF_LIMIT)]
    pub job_backoff_limit: i32,

    /// Image used for the cordon and drain steps
    #[arg(long, env = "SYSTEM_UPGRADE_JOB_KUBECTL_IMAGE", default_value = DEFAULT_KUBECTL_IMAGE)]
    pub job_kubectl_image: String,

    /// Run the upgrade step privileged
    #[arg(long, env = "SYSTEM_UPGRADE_JOB_PRIVILEGED", default_value_t = true, action = ArgAction::Set)]
    pub job_privileged: bool,

    /// Image pull policy for every step
    #[arg(
        long,
        env = "SYSTEM_UPGRADE_JOB_IMAGE_PULL_POLICY",
        default_value = DEFAULT_IMAGE_PULL_POLICY,
        value_parser = ["Always", "IfNotPresent", "Never"]
    )]
    pub job_image_pull_policy: String,

    /// Port for /healthz and /readyz
    #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
    pub health_port: u16,

    /// Port for /metrics
    #[arg(long, env = "METRICS_PORT", default_value_t = 8081)]
    pub metrics_port: u16,

    /// Log format: json or pretty
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the Plan CustomResourceDefinition as YAML and exit
    Crd,
}

/// Job-shaping settings handed to the job builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub active_deadline_seconds: i64,
    pub backoff_limit: i32,
    pub kubectl_image: String,
    pub privileged: bool,
    pub image_pull_policy: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            active_deadline_seconds: DEFAULT_ACTIVE_DEADLINE_SECONDS,
            backoff_limit: DEFAULT_BACKOFF_LIMIT,
            kubectl_image: DEFAULT_KUBECTL_IMAGE.to_string(),
            privileged: true,
            image_pull_policy: DEFAULT_IMAGE_PULL_POLICY.to_string(),
        }
    }
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn job_config(&self) -> JobConfig {
        JobConfig {
            active_deadline_seconds: self.job_active_deadline_seconds,
            backoff_limit: self.job_backoff_limit,
            kubectl_image: self.job_kubectl_image.clone(),
            privileged: self.job_privileged,
            image_pull_policy: self.job_image_pull_policy.clone(),
        }
    }

    pub fn display(&self) {
        tracing::info!(
            controller_name = %self.controller_name,
            namespace = self.namespace.as_deref().unwrap_or("<all>"),
            job_active_deadline_seconds = self.job_active_deadline_seconds,
            job_backoff_limit = self.job_backoff_limit,
            job_kubectl_image = %self.job_kubectl_image,
            job_privileged = self.job_privileged,
            job_image_pull_policy = %self.job_image_pull_policy,
            "Configuration initialized"
        );

        if self.job_active_deadline_seconds <= 0 {
            tracing::warn!("Job active deadline disabled; upgrade jobs may run indefinitely");
        }
    }
}
