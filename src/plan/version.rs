//! Resolve the version a plan targets and fingerprint it.

use std::time::Duration;

use reqwest::Url;
use reqwest::redirect::Policy;
use sha2::{Digest, Sha224};
use tracing::debug;

use crate::crd::PlanSpec;
use crate::error::SucError;
use crate::labels::ContentHash;

/// HTTP client for channel lookups. Redirects are not followed; the
/// `Location` header is the answer.
pub fn channel_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(Policy::none())
        .timeout(Duration::from_secs(15))
        .connect_timeout(Duration::from_secs(5))
        .build()
}

/// Hex SHA-224 of the serialized spec followed by the resolved version.
pub fn compute_hash(spec: &PlanSpec, version: &str) -> Result<ContentHash, SucError> {
    let mut hasher = Sha224::new();
    hasher.update(serde_json::to_vec(spec)?);
    hasher.update(version.as_bytes());
    Ok(ContentHash::new(hex::encode(hasher.finalize())))
}

/// Make a release version usable as a label value and an image tag.
///
/// Build metadata separators (`v1.31.1+k3s1`) become `-` (`v1.31.1-k3s1`).
pub fn munge_version(version: &str) -> String {
    version.replace('+', "-")
}

/// Explicit `spec.version` wins; otherwise ask `spec.channel`. The result is
/// always passed through [`munge_version`].
pub async fn resolve_version(
    plan_key: &str,
    spec: &PlanSpec,
    http: &reqwest::Client,
) -> Result<String, SucError> {
    if let Some(version) = spec.version.as_deref().filter(|v| !v.is_empty()) {
        return Ok(munge_version(version));
    }
    let Some(channel) = spec.channel.as_deref().filter(|c| !c.is_empty()) else {
        return Err(SucError::InvalidPlan(
            plan_key.to_string(),
            "one of spec.version or spec.channel is required".to_string(),
        ));
    };

    let fail = |msg: String| SucError::ChannelResolution(channel.to_string(), msg);
    let url = Url::parse(channel).map_err(|e| fail(e.to_string()))?;
    let response = http
        .get(url.clone())
        .send()
        .await
        .map_err(|e| fail(e.to_string()))?;

    let status = response.status();
    if !status.is_redirection() {
        return Err(fail(format!("expected a redirect, got HTTP {status}")));
    }
    let location = response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| fail("redirect without a Location header".to_string()))?;

    let version = latest_from_location(&url, location)
        .ok_or_else(|| fail(format!("no version in Location {location}")))?;
    debug!(plan = plan_key, channel, version = %version, "Resolved channel");
    Ok(munge_version(&version))
}

/// Last non-empty path segment of `location`, resolved against `base`.
pub fn latest_from_location(base: &Url, location: &str) -> Option<String> {
    let url = base.join(location).ok()?;
    let segment = url.path_segments()?.rev().find(|s| !s.is_empty())?;
    // Release tags carry build metadata (`v1.31.1+k3s1`)
    Some(segment.replace("%2B", "+").replace("%2b", "+"))
}
