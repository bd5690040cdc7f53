// relayscope/src/request.rs
//
// Detect-request binding rules: clamps, target-URL validation, and the
// admin/non-admin base-url policy. Input errors fail fast here — no probe
// is ever issued for a malformed request.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub const MAX_SCAN_MODELS: usize = 6;
pub const DEFAULT_ROUNDS: usize = 2;
pub const MAX_ROUNDS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectRequest {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub rounds: usize,
    #[serde(default)]
    pub verify_ratelimit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListModelsRequest {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

impl DetectRequest {
    /// Apply the binding rules: key and model list required, model list
    /// truncated to six entries, rounds defaulted to 2 and clamped to [1,3].
    /// `verify_ratelimit` only ever takes effect on single-model requests;
    /// the dispatcher enforces that structurally.
    pub fn normalize(&mut self) -> Result<()> {
        if self.api_key.is_empty() {
            bail!("API Key 不能为空");
        }
        if self.models.is_empty() {
            bail!("请选择要检测的模型");
        }
        self.models.truncate(MAX_SCAN_MODELS);
        if self.rounds == 0 {
            self.rounds = DEFAULT_ROUNDS;
        }
        if self.rounds > MAX_ROUNDS {
            self.rounds = MAX_ROUNDS;
        }
        Ok(())
    }
}

impl ListModelsRequest {
    pub fn normalize(&self) -> Result<()> {
        if self.api_key.is_empty() {
            bail!("API Key 不能为空");
        }
        Ok(())
    }
}

/// http/https scheme and a non-empty host, nothing else.
pub fn validate_target_url(raw: &str) -> Result<()> {
    let parsed = match url::Url::parse(raw) {
        Ok(p) => p,
        Err(_) => bail!("invalid URL format"),
    };
    match parsed.scheme() {
        "http" | "https" => {}
        _ => bail!("only http/https URLs are allowed"),
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        bail!("URL must have a hostname");
    }
    Ok(())
}

/// Resolve the detection target. Non-admin callers always probe the
/// configured default server, whatever they asked for; admins may point the
/// detector anywhere that validates. An empty request falls back to the
/// default server for admins too.
pub fn resolve_base_url(requested: &str, is_admin: bool, default_server: &str) -> Result<String> {
    let base = if !is_admin || requested.is_empty() {
        default_server
    } else {
        requested
    };
    if validate_target_url(base).is_err() {
        bail!("无效的目标地址");
    }
    Ok(base.to_string())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
