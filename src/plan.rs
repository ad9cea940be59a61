//! Plan controller: resolve the target version, pick nodes, apply their jobs
//! and record progress on the plan status.

pub mod apply;
pub mod nodes;
pub mod version;

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{error, info, warn};

use crate::crd::{NodeSelectorSpec, Plan, PlanStatus};
use crate::error::SucError;
use crate::job::JobBuilder;
use crate::job::builder::drain_exceeds_deadline;
use crate::labels::NodeName;
use crate::status::{
    self, CONDITION_APPLYING, CONDITION_LATEST_RESOLVED, EventRecorder,
    REASON_DEADLINE_MISCONFIGURED, REASON_JOB_CREATED, REASON_JOB_REPLACED,
};
use crate::telemetry::metrics::Metrics;

use apply::{ApplyAction, KubeJobStore};

const CONTROLLER: &str = "plan";

/// Periodic resync so channel updates are noticed without a plan edit.
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);
const REQUEUE_SOON: Duration = Duration::from_secs(5);

/// Shared context for the plan controller.
pub struct Context {
    pub client: kube::Client,
    pub builder: JobBuilder,
    pub controller_name: String,
    pub http: reqwest::Client,
    pub metrics: Arc<Metrics>,
}

/// Reconcile a `Plan`.
pub async fn reconcile(obj: Arc<Plan>, ctx: Arc<Context>) -> Result<Action, SucError> {
    let started = Instant::now();
    let result = reconcile_plan(&obj, &ctx).await;
    ctx.metrics.observe_reconcile(CONTROLLER, started.elapsed());
    ctx.metrics.record_reconcile(
        CONTROLLER,
        if result.is_ok() { "success" } else { "error" },
    );
    result
}

async fn reconcile_plan(plan: &Plan, ctx: &Context) -> Result<Action, SucError> {
    let name = plan.name_any();
    let namespace = plan.namespace().unwrap_or_default();
    let key = format!("{namespace}/{name}");
    let plans: Api<Plan> = Api::namespaced(ctx.client.clone(), &namespace);

    let current = plan.status.clone().unwrap_or_default();
    let mut new_status = current.clone();

    let latest_version = match version::resolve_version(&key, &plan.spec, &ctx.http).await {
        Ok(v) => v,
        Err(e) => {
            status::set_condition(
                &mut new_status,
                CONDITION_LATEST_RESOLVED,
                "False",
                "ResolveFailed",
                Some(e.to_string()),
            );
            write_status(&plans, &name, &current, &new_status).await;
            return Err(e);
        }
    };
    let hash = version::compute_hash(&plan.spec, &latest_version)?;
    let resolved_from = if plan.spec.version.as_deref().is_some_and(|v| !v.is_empty()) {
        "Version"
    } else {
        "Channel"
    };
    status::set_condition(
        &mut new_status,
        CONDITION_LATEST_RESOLVED,
        "True",
        resolved_from,
        Some(latest_version.clone()),
    );
    new_status.latest_version = latest_version;
    new_status.latest_hash = hash.to_string();

    let selector = plan
        .spec
        .node_selector
        .as_ref()
        .map(NodeSelectorSpec::to_query)
        .transpose()
        .map_err(|e| SucError::InvalidPlan(key.clone(), e))?
        .unwrap_or_default();
    let mut params = ListParams::default();
    if !selector.is_empty() {
        params = params.labels(&selector);
    }
    let node_list = Api::<Node>::all(ctx.client.clone())
        .list(&params)
        .await
        .map_err(|e| SucError::kube("plan::list_nodes", e))?;

    let limit = nodes::concurrency_limit(plan.spec.concurrency);
    let selected = nodes::select_nodes(&name, &hash, &node_list.items, &current.applying, limit);

    let recorder = EventRecorder::new(ctx.client.clone(), &ctx.controller_name, plan);
    let deadline = ctx.builder.config().active_deadline_seconds;
    if !selected.is_empty()
        && let Some(drain) = &plan.spec.drain
        && drain_exceeds_deadline(drain, deadline)
    {
        recorder
            .publish_warning(
                REASON_DEADLINE_MISCONFIGURED,
                &format!(
                    "Drain timeout {}s exceeds job deadline {deadline}s; a node may stay cordoned",
                    drain.timeout.unwrap_or_default()
                ),
            )
            .await;
    }

    // Jobs are built against the freshly resolved version and hash
    let mut resolved = plan.clone();
    resolved.status = Some(new_status.clone());
    let store = KubeJobStore::new(ctx.client.clone(), &namespace);
    let mut requeue_soon = false;

    for node in &selected {
        let job = ctx.builder.build(&resolved, node, &ctx.controller_name)?;
        let action = apply::apply_job(&store, &job).await?;
        ctx.metrics.record_job_applied(&name, action.as_str());
        requeue_soon |= action.needs_requeue();
        announce(&recorder, &job.name_any(), node, action).await;
    }

    new_status.applying = selected.iter().map(|n| n.to_string()).collect();
    set_applying_condition(&mut new_status, selected.len());
    write_status(&plans, &name, &current, &new_status).await;

    info!(
        plan = %key,
        version = %new_status.latest_version,
        hash = %hash,
        applying = selected.len(),
        "Reconciled plan"
    );

    Ok(Action::requeue(if requeue_soon {
        REQUEUE_SOON
    } else {
        RESYNC_INTERVAL
    }))
}

async fn announce(recorder: &EventRecorder, job_name: &str, node: &NodeName, action: ApplyAction) {
    match action {
        ApplyAction::Created => {
            recorder
                .publish(
                    REASON_JOB_CREATED,
                    &format!("Created job {job_name} on node {node}"),
                )
                .await;
        }
        ApplyAction::Replaced(reason) => {
            recorder
                .publish(
                    REASON_JOB_REPLACED,
                    &format!("Deleted job {job_name} on node {node} ({reason})"),
                )
                .await;
        }
        ApplyAction::Unchanged | ApplyAction::Deleting => {}
    }
}

fn set_applying_condition(status: &mut PlanStatus, applying: usize) {
    if applying == 0 {
        status::set_condition(
            status,
            CONDITION_APPLYING,
            "False",
            "Complete",
            Some("All selected nodes carry the latest hash".to_string()),
        );
    } else {
        status::set_condition(
            status,
            CONDITION_APPLYING,
            "True",
            "JobsApplied",
            Some(format!("{applying} node(s) upgrading")),
        );
    }
}

/// Patch the status when it changed. Failures are logged; the next
/// reconcile writes it again.
async fn write_status(api: &Api<Plan>, name: &str, current: &PlanStatus, new: &PlanStatus) {
    if !status::status_changed(current, new) {
        return;
    }
    if let Err(e) = status::patch_status(api, name, new).await {
        warn!(plan = name, "Failed to patch status: {}", e);
    }
}

/// Error policy for the plan controller.
pub fn error_policy(obj: Arc<Plan>, err: &SucError, _ctx: Arc<Context>) -> Action {
    error!(plan = %obj.name_any(), "Plan reconcile failed: {}", err);
    if err.is_transient() {
        Action::requeue(Duration::from_secs(10))
    } else {
        // Fixing a broken plan means editing it, which triggers a reconcile
        Action::requeue(RESYNC_INTERVAL)
    }
}
