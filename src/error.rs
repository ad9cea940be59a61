//! Custom error types for suc.

use thiserror::Error;

/// Errors that can occur while rolling out upgrade plans.
#[derive(Error, Debug)]
pub enum SucError {
    #[error("[{0}] Kubernetes API error: {1}")]
    KubernetesApi(String, String),

    #[error("[{0}] conflict: {1}")]
    Conflict(String, String),

    #[error("[{0}] not found: {1}")]
    NotFound(String, String),

    #[error("[{0}] already exists: {1}")]
    AlreadyExists(String, String),

    #[error("Object conversion failed: {0}")]
    Conversion(String),

    #[error("Invalid plan {0}: {1}")]
    InvalidPlan(String, String),

    #[error("Channel resolution failed for {0}: {1}")]
    ChannelResolution(String, String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SucError {
    /// Classify a kube client error by HTTP status.
    ///
    /// 404 maps to `NotFound`, 409 maps to `AlreadyExists` when the API server
    /// says so and to `Conflict` otherwise (stale resourceVersion).
    pub fn kube(component: &str, err: kube::Error) -> Self {
        let component = component.to_string();
        if let kube::Error::Api(resp) = &err {
            match resp.code {
                404 => return Self::NotFound(component, resp.message.clone()),
                409 if resp.reason == "AlreadyExists" => {
                    return Self::AlreadyExists(component, resp.message.clone());
                }
                409 => return Self::Conflict(component, resp.message.clone()),
                _ => {}
            }
        }
        Self::KubernetesApi(component, err.to_string())
    }

    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_, _))
    }

    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_, _))
    }

    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_, _))
    }

    /// Returns true if this error is transient and should be retried soon.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::KubernetesApi(_, _)
                | Self::Conflict(_, _)
                | Self::NotFound(_, _)
                | Self::ChannelResolution(_, _)
        )
    }
}
