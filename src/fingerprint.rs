// relayscope/src/fingerprint.rs
//
// Fingerprint extraction — headers and body of one probe response.
//
// Each upstream leaks identity through identifiers it cannot (or does not
// bother to) rewrite:
//   tool_use id   toolu_ (Anthropic) / tooluse_ (Bedrock) / tool_N (Vertex)
//   message id    msg_<base62> (Anthropic) / msg_<uuid> (Antigravity)
//                 / req_vrtx_ (Vertex)
//   thinking sig  claude#-prefixed on Vertex, 200+ chars when genuine
//   usage casing  inputTokens (Bedrock) vs input_tokens (Anthropic)
//   headers       x-amzn-*/x-amz-*/bedrock vs anthropic-ratelimit-*
//
// Extraction is deliberately loose: the body is walked as serde_json::Value
// with typed lookups, and unknown branches are skipped rather than failed.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::types::{
    Fingerprint, ModelSource, MsgIdFormat, MsgIdSource, ThinkingSigClass, ToolIdSource, UsageStyle,
};

const ANTHROPIC_TOOL_PREFIX: &str = "toolu_";
const BEDROCK_TOOL_PREFIX: &str = "tooluse_";
const ANTHROPIC_MSG_PREFIX: &str = "msg_";
const VERTEX_MSG_PREFIX: &str = "req_vrtx_";
const KIRO_MODEL_PREFIX: &str = "kiro-";
const BEDROCK_MODEL_PREFIX: &str = "anthropic.";

const THINKING_SIG_SHORT_THRESHOLD: usize = 100;

const AWS_HEADER_KEYWORDS: &[&str] = &["x-amzn", "x-amz-", "bedrock"];
const ANTHROPIC_HEADER_KEYWORDS: &[&str] = &["anthropic-ratelimit", "x-ratelimit", "retry-after"];

static MSG_ID_UUID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^msg_[0-9a-f]{8}-[0-9a-f]{4}-").unwrap());
static TOOL_N_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^tool_\d+$").unwrap());
static UUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
});

// ── Classification ────────────────────────────────────────────────────────────

pub fn classify_tool_id(tool_id: &str) -> ToolIdSource {
    if tool_id.is_empty() {
        ToolIdSource::Empty
    } else if tool_id.starts_with(BEDROCK_TOOL_PREFIX) {
        ToolIdSource::Bedrock
    } else if tool_id.starts_with(ANTHROPIC_TOOL_PREFIX) {
        ToolIdSource::Anthropic
    } else if TOOL_N_PATTERN.is_match(tool_id) {
        ToolIdSource::Vertex
    } else {
        ToolIdSource::Rewritten
    }
}

pub fn classify_msg_id(msg_id: &str) -> (MsgIdSource, MsgIdFormat) {
    if msg_id.is_empty() {
        return (MsgIdSource::Unknown, MsgIdFormat::Empty);
    }
    if msg_id.starts_with(VERTEX_MSG_PREFIX) {
        return (MsgIdSource::Vertex, MsgIdFormat::ReqVrtx);
    }
    if msg_id.starts_with(ANTHROPIC_MSG_PREFIX) {
        if MSG_ID_UUID_PATTERN.is_match(msg_id) {
            return (MsgIdSource::Antigravity, MsgIdFormat::MsgUuid);
        }
        return (MsgIdSource::Anthropic, MsgIdFormat::Base62);
    }
    if UUID_PATTERN.is_match(msg_id) {
        return (MsgIdSource::Rewritten, MsgIdFormat::Uuid);
    }
    (MsgIdSource::Rewritten, MsgIdFormat::Other)
}

/// The claude# prefix marks a Vertex signature even when the relay truncated
/// it below the short threshold.
pub fn classify_thinking_sig(sig: &str) -> ThinkingSigClass {
    if sig.is_empty() {
        ThinkingSigClass::None
    } else if sig.starts_with("claude#") {
        ThinkingSigClass::Vertex
    } else if sig.len() < THINKING_SIG_SHORT_THRESHOLD {
        ThinkingSigClass::Short
    } else {
        ThinkingSigClass::Normal
    }
}

pub fn classify_model(model: &str) -> ModelSource {
    if model.starts_with(KIRO_MODEL_PREFIX) {
        ModelSource::Kiro
    } else if model.starts_with(BEDROCK_MODEL_PREFIX) {
        ModelSource::Bedrock
    } else if !model.is_empty() {
        ModelSource::Anthropic
    } else {
        ModelSource::Empty
    }
}

// ── Header extraction ─────────────────────────────────────────────────────────

/// Keyword scans plus the ratelimit header triplet.
pub fn scan_headers(headers: &HeaderMap, fp: &mut Fingerprint) {
    for name in headers.keys() {
        let key = name.as_str(); // HeaderName is already lowercase
        if AWS_HEADER_KEYWORDS.iter().any(|kw| key.contains(kw)) {
            fp.has_aws_headers = true;
        }
        if ANTHROPIC_HEADER_KEYWORDS.iter().any(|kw| key.contains(kw)) {
            fp.has_anthropic_headers = true;
        }
    }

    let (platform, clues) = detect_proxy_platform(headers);
    fp.proxy_platform = platform;
    fp.platform_clues = clues;

    fp.ratelimit_input_limit = header_u64(headers, "anthropic-ratelimit-input-tokens-limit");
    fp.ratelimit_input_remaining = header_u64(headers, "anthropic-ratelimit-input-tokens-remaining");
    fp.ratelimit_input_reset = header_str(headers, "anthropic-ratelimit-input-tokens-reset");
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

/// Relay platform signatures from response headers. CF-Ray never sets the
/// platform, it only records a clue.
pub fn detect_proxy_platform(headers: &HeaderMap) -> (String, Vec<String>) {
    let mut platform = String::new();
    let mut clues: Vec<String> = Vec::new();

    for name in headers.keys() {
        let key = name.as_str();
        if key.contains("aidistri") {
            platform = "Aidistri".to_string();
            clues.push("X-Aidistri-Request-Id".to_string());
        }
        if key.contains("one-api") || key.contains("new-api") {
            platform = "OneAPI/NewAPI".to_string();
            clues.push("OneAPI header detected".to_string());
        }
    }

    if let Some(cors) = header_str(headers, "access-control-allow-headers") {
        if cors.to_lowercase().contains("accounthub") {
            if platform.is_empty() {
                platform = "AccountHub".to_string();
            }
            for part in cors.split(',') {
                let part = part.trim();
                let pl = part.to_lowercase();
                if pl.contains("accounthub") || pl.contains("pool") {
                    clues.push(part.to_string());
                    if clues.len() >= 5 {
                        break;
                    }
                }
            }
        }
    }

    for (name, value) in headers.iter() {
        let key = name.as_str();
        let val = value.to_str().unwrap_or_default();
        if key.contains("openrouter") || val.to_lowercase().contains("openrouter") {
            platform = "OpenRouter".to_string();
            clues.push("OpenRouter header detected".to_string());
        }
    }

    if header_str(headers, "server")
        .map(|s| s.to_lowercase() == "cloudflare")
        .unwrap_or(false)
    {
        if let Some(ray) = header_str(headers, "cf-ray") {
            if !ray.is_empty() {
                clues.push(format!("CF-Ray: {ray}"));
            }
        }
    }

    (platform, clues)
}

// ── Body extraction ───────────────────────────────────────────────────────────

/// Walk the parsed /v1/messages body and fill the content-derived
/// dimensions: tool_use id, thinking signature, message id, returned model,
/// usage markers, stop_reason.
pub fn extract_body(body: &Value, fp: &mut Fingerprint) {
    if let Some(content) = body.get("content").and_then(|c| c.as_array()) {
        for block in content {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("tool_use") => {
                    fp.tool_id = block
                        .get("id")
                        .and_then(|i| i.as_str())
                        .unwrap_or_default()
                        .to_string();
                    fp.tool_id_source = classify_tool_id(&fp.tool_id);
                }
                Some("thinking") => {
                    let sig = block
                        .get("signature")
                        .and_then(|s| s.as_str())
                        .unwrap_or_default();
                    fp.thinking_sig_len = sig.len();
                    fp.thinking_sig_class = classify_thinking_sig(sig);
                }
                _ => {}
            }
        }
    }

    fp.msg_id = body
        .get("id")
        .and_then(|i| i.as_str())
        .unwrap_or_default()
        .to_string();
    let (source, format) = classify_msg_id(&fp.msg_id);
    fp.msg_id_source = source;
    fp.msg_id_format = format;

    fp.model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();
    fp.model_source = classify_model(&fp.model);

    if let Some(usage) = body.get("usage").and_then(|u| u.as_object()) {
        if usage.contains_key("inputTokens") {
            fp.usage_style = UsageStyle::CamelCase;
        } else if usage.contains_key("input_tokens") {
            fp.usage_style = UsageStyle::SnakeCase;
        }
        if let Some(tier) = usage.get("service_tier") {
            fp.has_service_tier = true;
            fp.service_tier = loose_string(tier);
        }
        if let Some(geo) = usage.get("inference_geo") {
            fp.has_inference_geo = true;
            fp.inference_geo = loose_string(geo);
        }
        // A scalar cache_creation is the legacy shape any relay can echo;
        // only the nested object counts.
        if let Some(cc) = usage.get("cache_creation") {
            if cc.is_object() {
                fp.has_cache_creation_obj = true;
            }
        }
    }

    fp.stop_reason = body
        .get("stop_reason")
        .and_then(|s| s.as_str())
        .unwrap_or_default()
        .to_string();
}

fn loose_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
