// relayscope/src/models.rs
//
// Remote model listing and the built-in model lists.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::ssrf;

/// Models probed by a full scan when the caller supplies none.
pub const DEFAULT_SCAN_MODELS: &[&str] = &[
    "claude-opus-4-6-thinking",
    "claude-opus-4-6-20250918",
    "claude-sonnet-4-5-20250929",
    "claude-haiku-4-5-20251001",
    "claude-3-5-sonnet-20241022",
    "claude-3-haiku-20240307",
];

/// Candidates for finding a usable model. No Opus here: availability
/// probing should not burn expensive quota.
pub const WORKING_MODEL_PROBES: &[&str] = &[
    "claude-sonnet-4-5-20250929",
    "claude-haiku-4-5-20251001",
    "claude-3-5-sonnet-20241022",
    "claude-3-haiku-20240307",
];

const MODEL_LIST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    #[serde(default)]
    id: String,
}

/// Fetch `<base>/v1/models` and return the Claude-family model ids.
pub async fn fetch_remote_models(
    base_url: &str,
    api_key: &str,
    skip_ssrf_check: bool,
) -> Result<Vec<String>> {
    if !skip_ssrf_check {
        ssrf::ensure_public_host(base_url)?;
    }
    let client = ssrf::client_for(MODEL_LIST_TIMEOUT, skip_ssrf_check)?;

    let models_url = format!("{}/v1/models", base_url.trim_end_matches('/'));
    let resp = client
        .get(&models_url)
        .bearer_auth(api_key)
        .send()
        .await
        .context("request failed")?;

    let status = resp.status();
    if status.as_u16() != 200 {
        bail!("unexpected status code: {}", status.as_u16());
    }

    let list: ModelList = resp.json().await.context("failed to parse response")?;

    Ok(list
        .data
        .into_iter()
        .map(|m| m.id)
        .filter(|id| id.to_lowercase().contains("claude"))
        .collect())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
