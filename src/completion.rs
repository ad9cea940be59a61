//! Job completion handling.
//!
//! When an upgrade job completes, the node it ran on is labeled with the
//! plan hash it now carries and, if the job cordoned it, made schedulable
//! again. The owning plan is re-queued so the rollout can move on to the
//! next node.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::mpsc::UnboundedSender;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Node;
use kube::api::PostParams;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::crd::Plan;
use crate::error::SucError;
use crate::job;
use crate::labels::{ContentHash, NodeName, ObservedJobLabels, plan_hash_label};
use crate::telemetry::metrics::Metrics;

/// Attempts at the node write before a conflict is handed back to the caller.
pub const MAX_UPDATE_ATTEMPTS: u32 = 5;

/// Read and write access to nodes.
pub trait NodeStore: Send + Sync {
    fn get(&self, name: &NodeName) -> impl Future<Output = Result<Node, SucError>> + Send;

    /// Write `node` back. Must fail with [`SucError::Conflict`] when the node
    /// changed since it was read.
    fn update(&self, node: &Node) -> impl Future<Output = Result<Node, SucError>> + Send;
}

/// Schedules a plan for another reconcile.
pub trait PlanQueue: Send + Sync {
    fn enqueue(&self, namespace: &str, name: &str);
}

/// What handling a job event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Not a completed plan job.
    Ignored,
    /// Plan re-queued; the job carries no node/hash to record.
    Enqueued { plan: String },
    /// Node already carried the hash and needed no uncordon.
    NodeUpToDate { plan: String, node: NodeName },
    /// Node labeled (and uncordoned when `uncordoned`).
    NodeUpdated {
        plan: String,
        node: NodeName,
        uncordoned: bool,
        attempts: u32,
    },
}

/// Propagates job completion onto nodes.
pub struct CompletionHandler<N, Q> {
    nodes: N,
    plans: Q,
}

impl<N: NodeStore, Q: PlanQueue> CompletionHandler<N, Q> {
    pub const fn new(nodes: N, plans: Q) -> Self {
        Self { nodes, plans }
    }

    /// Handle one change event for `job`.
    pub async fn handle(&self, job: &Job) -> Result<Outcome, SucError> {
        let labels = ObservedJobLabels::parse(job.metadata.labels.as_ref());
        let Some(plan) = labels.plan else {
            return Ok(Outcome::Ignored);
        };
        if !job::is_complete(job) {
            return Ok(Outcome::Ignored);
        }

        let namespace = job.namespace().unwrap_or_default();
        self.plans.enqueue(&namespace, &plan);

        let (Some(hash), Some(node)) = (labels.hash, labels.node) else {
            debug!(job = %job.name_any(), plan = %plan, "Completed job has no node/hash labels");
            return Ok(Outcome::Enqueued { plan });
        };

        self.record_on_node(plan, node, &hash, labels.cordon).await
    }

    /// Read-modify-write the node, re-reading on conflict.
    async fn record_on_node(
        &self,
        plan: String,
        node_name: NodeName,
        hash: &ContentHash,
        uncordon: bool,
    ) -> Result<Outcome, SucError> {
        let label_key = plan_hash_label(&plan);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let mut node = self.nodes.get(&node_name).await?;

            let labels = node.metadata.labels.get_or_insert_with(Default::default);
            let labeled = labels.get(&label_key).map(String::as_str) == Some(hash.as_str());
            let cordoned = node
                .spec
                .as_ref()
                .and_then(|s| s.unschedulable)
                .unwrap_or(false);
            if labeled && !(uncordon && cordoned) {
                return Ok(Outcome::NodeUpToDate {
                    plan,
                    node: node_name,
                });
            }

            labels.insert(label_key.clone(), hash.to_string());
            if uncordon && let Some(spec) = node.spec.as_mut() {
                spec.unschedulable = Some(false);
            }

            match self.nodes.update(&node).await {
                Ok(_) => {
                    info!(
                        plan = %plan,
                        node = %node_name,
                        hash = %hash,
                        uncordoned = uncordon,
                        attempts,
                        "Recorded upgrade on node"
                    );
                    return Ok(Outcome::NodeUpdated {
                        plan,
                        node: node_name,
                        uncordoned: uncordon,
                        attempts,
                    });
                }
                Err(e) if e.is_conflict() && attempts < MAX_UPDATE_ATTEMPTS => {
                    debug!(node = %node_name, attempts, "Node changed underneath us, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Node access through the API server.
#[derive(Clone)]
pub struct KubeNodeStore {
    api: Api<Node>,
}

impl KubeNodeStore {
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

impl NodeStore for KubeNodeStore {
    async fn get(&self, name: &NodeName) -> Result<Node, SucError> {
        self.api
            .get(name.as_str())
            .await
            .map_err(|e| SucError::kube("completion::get_node", e))
    }

    async fn update(&self, node: &Node) -> Result<Node, SucError> {
        // replace carries the resourceVersion we read, so a concurrent write is a 409
        self.api
            .replace(&node.name_any(), &PostParams::default(), node)
            .await
            .map_err(|e| SucError::kube("completion::update_node", e))
    }
}

/// Feeds plan keys into the plan controller's trigger stream.
#[derive(Clone)]
pub struct PlanTrigger {
    tx: UnboundedSender<ObjectRef<Plan>>,
}

impl PlanTrigger {
    pub const fn new(tx: UnboundedSender<ObjectRef<Plan>>) -> Self {
        Self { tx }
    }
}

impl PlanQueue for PlanTrigger {
    fn enqueue(&self, namespace: &str, name: &str) {
        let obj_ref = ObjectRef::new(name).within(namespace);
        if let Err(e) = self.tx.unbounded_send(obj_ref) {
            warn!(plan = %name, namespace = %namespace, "Failed to enqueue plan: {}", e);
        }
    }
}

/// Shared context for the job controller.
pub struct Context {
    pub handler: CompletionHandler<KubeNodeStore, PlanTrigger>,
    pub metrics: Arc<Metrics>,
}

const CONTROLLER: &str = "job";

/// Reconcile a plan job.
pub async fn reconcile(obj: Arc<Job>, ctx: Arc<Context>) -> Result<Action, SucError> {
    let started = Instant::now();
    let result = ctx.handler.handle(&obj).await;
    ctx.metrics.observe_reconcile(CONTROLLER, started.elapsed());

    match result {
        Ok(outcome) => {
            ctx.metrics.record_reconcile(CONTROLLER, "success");
            if let Outcome::NodeUpdated { plan, attempts, .. } = &outcome {
                ctx.metrics.record_node_upgrade(plan, attempts - 1);
            }
            Ok(Action::await_change())
        }
        Err(e) => {
            ctx.metrics.record_reconcile(CONTROLLER, "error");
            if e.is_conflict() {
                ctx.metrics.record_node_update_conflicts(MAX_UPDATE_ATTEMPTS);
            }
            Err(e)
        }
    }
}

/// Error policy for the job controller. The node write must not be lost, so
/// every error requeues.
pub fn error_policy(obj: Arc<Job>, err: &SucError, _ctx: Arc<Context>) -> Action {
    error!(job = %obj.name_any(), "Job completion handling failed: {}", err);
    if err.is_transient() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}
