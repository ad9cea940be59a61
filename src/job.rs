//! Upgrade jobs: naming, condition helpers and the builder/reconciler pair.

pub mod builder;
pub mod container;
pub mod reconcile;

use k8s_openapi::api::batch::v1::Job;
use sha2::{Digest, Sha256};

pub use builder::JobBuilder;

/// Kubernetes limit on label values and most object names.
const MAX_NAME_LEN: usize = 63;

/// Join `parts` with `-`, shortening names that would exceed 63 characters.
///
/// Long names are cut and suffixed with a digest of the full name, so the
/// result stays deterministic and distinct inputs rarely collide.
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.len() <= MAX_NAME_LEN {
        return full;
    }

    let digest = hex::encode(Sha256::digest(full.as_bytes()));
    let bytes = full.as_bytes();
    // The cut must not leave a trailing `-` or `.`
    if bytes[56].is_ascii_lowercase() || bytes[56].is_ascii_digit() {
        format!("{}-{}", &full[..57], &digest[..5])
    } else {
        format!("{}-{}", &full[..56], &digest[..6])
    }
}

fn condition_is_true(job: &Job, condition_type: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == condition_type && c.status == "True")
        })
}

/// The job ran to completion.
pub fn is_complete(job: &Job) -> bool {
    condition_is_true(job, "Complete")
}

/// The job exhausted its backoff limit or deadline.
pub fn is_failed(job: &Job) -> bool {
    condition_is_true(job, "Failed")
}
