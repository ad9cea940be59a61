//! Bring the live job for a node in line with the desired one.

use std::fmt;
use std::future::Future;

use k8s_openapi::api::batch::v1::Job;
use kube::api::{ApiResource, DeleteParams, DynamicObject, PostParams};
use kube::{Api, ResourceExt};
use tracing::{debug, info};

use crate::error::SucError;
use crate::job::reconcile::{Decision, ReplaceReason, decide_dynamic};

/// What applying a desired job did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    Created,
    Unchanged,
    /// The old job was deleted; its successor is created on a later pass.
    Replaced(ReplaceReason),
    /// The old job is still being deleted.
    Deleting,
}

impl ApplyAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Unchanged => "unchanged",
            Self::Replaced(_) => "replaced",
            Self::Deleting => "deleting",
        }
    }

    /// The plan should look again soon rather than on the next resync.
    pub const fn needs_requeue(self) -> bool {
        matches!(self, Self::Replaced(_) | Self::Deleting)
    }
}

impl fmt::Display for ApplyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job access for the apply layer. Live jobs are read untyped.
pub trait JobStore: Send + Sync {
    fn get(&self, name: &str)
    -> impl Future<Output = Result<Option<DynamicObject>, SucError>> + Send;
    fn create(&self, job: &Job) -> impl Future<Output = Result<Job, SucError>> + Send;
    /// Delete with background propagation. A missing job is not an error.
    fn delete(&self, name: &str) -> impl Future<Output = Result<(), SucError>> + Send;
}

/// Create, keep or replace the job named like `desired`.
pub async fn apply_job(store: &impl JobStore, desired: &Job) -> Result<ApplyAction, SucError> {
    let name = desired.name_any();

    let Some(existing) = store.get(&name).await? else {
        return match store.create(desired).await {
            Ok(_) => {
                info!(job = %name, "Created upgrade job");
                Ok(ApplyAction::Created)
            }
            Err(e) if e.is_already_exists() => {
                debug!(job = %name, "Job appeared concurrently");
                Ok(ApplyAction::Unchanged)
            }
            Err(e) => Err(e),
        };
    };

    if existing.metadata.deletion_timestamp.is_some() {
        return Ok(ApplyAction::Deleting);
    }

    let desired_obj: DynamicObject = serde_json::from_value(serde_json::to_value(desired)?)?;
    match decide_dynamic(&existing, &desired_obj)? {
        Decision::NoOp => Ok(ApplyAction::Unchanged),
        Decision::Replace(reason) => {
            info!(job = %name, reason = %reason, "Replacing upgrade job");
            store.delete(&name).await?;
            Ok(ApplyAction::Replaced(reason))
        }
    }
}

/// Jobs in one namespace through the API server.
#[derive(Clone)]
pub struct KubeJobStore {
    api: Api<Job>,
    dynamic: Api<DynamicObject>,
}

impl KubeJobStore {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client.clone(), namespace),
            dynamic: Api::namespaced_with(client, namespace, &ApiResource::erase::<Job>(&())),
        }
    }
}

impl JobStore for KubeJobStore {
    async fn get(&self, name: &str) -> Result<Option<DynamicObject>, SucError> {
        self.dynamic
            .get_opt(name)
            .await
            .map_err(|e| SucError::kube("apply::get_job", e))
    }

    async fn create(&self, job: &Job) -> Result<Job, SucError> {
        self.api
            .create(&PostParams::default(), job)
            .await
            .map_err(|e| SucError::kube("apply::create_job", e))
    }

    async fn delete(&self, name: &str) -> Result<(), SucError> {
        match self.api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) => match SucError::kube("apply::delete_job", e) {
                e if e.is_not_found() => Ok(()),
                e => Err(e),
            },
        }
    }
}
