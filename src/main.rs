//! suc - system upgrade controller.
//!
//! Watches `Plan` resources and rolls each plan out node by node: one upgrade
//! `Job` per selected node, and a node label recording the plan hash once the
//! job succeeds.

mod completion;
mod config;
mod crd;
mod error;
mod job;
mod labels;
mod plan;
mod status;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::{Controller, watcher};
use kube::{Api, CustomResourceExt};
use tracing::{error, info};

use config::{Command, Config};
use crd::Plan;
use labels::LABEL_PLAN;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

#[tokio::main]
async fn main() {
    let config = Config::from_args();

    if config.command == Some(Command::Crd) {
        match serde_yaml::to_string(&Plan::crd()) {
            Ok(yaml) => print!("{yaml}"),
            Err(e) => {
                eprintln!("Failed to render CRD: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = init_tracing(&config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(
        "Starting suc v{} (commit: {}, build: {})",
        VERSION, COMMIT, BUILD_DATE
    );
    config.display();

    if let Err(e) = run(config).await {
        error!("Controller failed: {:#}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber. `RUST_LOG` overrides `--log-level`.
fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {e}"))?;

    let builder = fmt().with_env_filter(filter).with_target(true);
    if config.log_format == "pretty" {
        builder.pretty().init();
    } else {
        builder.json().init();
    }

    Ok(())
}

/// Run both controllers until shutdown.
async fn run(config: Config) -> Result<()> {
    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(telemetry::metrics::Metrics::new(&mut registry));
    let registry = Arc::new(registry);

    let health_state = telemetry::health::HealthState::new();
    let health_state_clone = health_state.clone();
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = telemetry::health::serve(health_port, health_state_clone).await {
            error!("Health server failed: {}", e);
        }
    });

    let registry_clone = registry.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = telemetry::metrics::serve(metrics_port, registry_clone).await {
            error!("Metrics server failed: {}", e);
        }
    });

    let (plans, jobs): (Api<Plan>, Api<Job>) = match &config.namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    // Completed jobs push their plan back onto the plan controller's queue
    let (trigger_tx, trigger_rx) = futures::channel::mpsc::unbounded();

    let plan_ctx = Arc::new(plan::Context {
        client: client.clone(),
        builder: job::JobBuilder::new(config.job_config()),
        controller_name: config.controller_name.clone(),
        http: plan::version::channel_client().context("Failed to build channel HTTP client")?,
        metrics: metrics.clone(),
    });
    let job_ctx = Arc::new(completion::Context {
        handler: completion::CompletionHandler::new(
            completion::KubeNodeStore::new(client.clone()),
            completion::PlanTrigger::new(trigger_tx),
        ),
        metrics,
    });

    info!("Starting Plan and Job controllers");
    let plan_controller = Controller::new(plans, watcher::Config::default())
        .reconcile_on(trigger_rx)
        .shutdown_on_signal()
        .run(plan::reconcile, plan::error_policy, plan_ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => info!(plan = %obj, "Reconciled plan"),
                Err(e) => error!("Plan reconcile failed: {:?}", e),
            }
        });

    let job_controller = Controller::new(jobs, watcher::Config::default().labels(LABEL_PLAN))
        .shutdown_on_signal()
        .run(completion::reconcile, completion::error_policy, job_ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                error!("Job reconcile failed: {:?}", e);
            }
        });

    health_state.set_ready(true);
    futures::join!(plan_controller, job_controller);
    info!("Controllers stopped");

    Ok(())
}
