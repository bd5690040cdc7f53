// relayscope/src/probe.rs
//
// Probe payloads and execution against /v1/messages.
//
// Three probe shapes, each surfacing a different fingerprint dimension:
//   tool      forces a tool_use block so the tool-id prefix leaks
//   thinking  elicits a thinking block and its signature
//   simple    minimal-cost probe for availability checks and ratelimit shots
//
// Every probe carries both x-api-key and Authorization: Bearer — relays are
// split on which one they honor.

use std::time::Instant;

use serde_json::{json, Value};

use crate::fingerprint;
use crate::types::{Fingerprint, ProbeKind};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const ERROR_BODY_SNIPPET_BYTES: usize = 200;

pub fn messages_url(base_url: &str) -> String {
    format!("{}/v1/messages", base_url.trim_end_matches('/'))
}

// ── Payloads ──────────────────────────────────────────────────────────────────

pub fn build_payload(kind: ProbeKind, model: &str) -> Value {
    match kind {
        ProbeKind::Tool => json!({
            "model": model,
            "max_tokens": 50,
            "tools": [{
                "name": "probe",
                "description": "Probe function",
                "input_schema": {
                    "type": "object",
                    "properties": {"q": {"type": "string"}},
                    "required": ["q"]
                }
            }],
            "tool_choice": {"type": "tool", "name": "probe"},
            "messages": [{"role": "user", "content": "call probe with q=test"}]
        }),
        ProbeKind::Thinking => json!({
            "model": model,
            "max_tokens": 2048,
            "thinking": {"type": "enabled", "budget_tokens": 1024},
            "messages": [{"role": "user", "content": "What is 2+3?"}]
        }),
        ProbeKind::Simple => json!({
            "model": model,
            "max_tokens": 5,
            "messages": [{"role": "user", "content": "Say OK"}]
        }),
    }
}

// ── Execution ─────────────────────────────────────────────────────────────────

/// Send one probe and extract a fingerprint. Failures never propagate as
/// errors: they land in the fingerprint's `error` field so the detection
/// can continue with the remaining probes.
pub async fn probe_once(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    model: &str,
    kind: ProbeKind,
) -> Fingerprint {
    let mut fp = Fingerprint::new(kind, model);
    let payload = build_payload(kind, model);

    let t0 = Instant::now();
    let resp = match client
        .post(messages_url(base_url))
        .header("Content-Type", "application/json")
        .header("anthropic-version", ANTHROPIC_VERSION)
        .header("x-api-key", api_key)
        .bearer_auth(api_key)
        .json(&payload)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            tracing::debug!(model, probe = %kind, error = %e, "probe request failed");
            fp.error = "request failed".to_string();
            return fp;
        }
    };
    fp.latency_ms = t0.elapsed().as_millis() as i64;

    let status = resp.status();
    if status.as_u16() != 200 {
        let body = resp.bytes().await.unwrap_or_default();
        let snippet = &body[..body.len().min(ERROR_BODY_SNIPPET_BYTES)];
        fp.error = format!("HTTP {}: {}", status.as_u16(), String::from_utf8_lossy(snippet));
        return fp;
    }

    fingerprint::scan_headers(resp.headers(), &mut fp);

    let body = match resp.bytes().await {
        Ok(b) => b,
        Err(_) => {
            fp.error = "failed to read response".to_string();
            return fp;
        }
    };
    let body: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => {
            fp.error = "response body not JSON".to_string();
            return fp;
        }
    };

    fingerprint::extract_body(&body, &mut fp);
    fp
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MsgIdSource, ToolIdSource};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn tool_payload_shape() {
        let p = build_payload(ProbeKind::Tool, "claude-sonnet-4-5-20250929");
        assert_eq!(p["max_tokens"], 50);
        assert_eq!(p["tool_choice"]["type"], "tool");
        assert_eq!(p["tool_choice"]["name"], "probe");
        assert_eq!(p["tools"][0]["input_schema"]["required"][0], "q");
        assert_eq!(p["messages"][0]["content"], "call probe with q=test");
    }

    #[test]
    fn thinking_payload_shape() {
        let p = build_payload(ProbeKind::Thinking, "claude-opus-4-6-thinking");
        assert_eq!(p["max_tokens"], 2048);
        assert_eq!(p["thinking"]["type"], "enabled");
        assert_eq!(p["thinking"]["budget_tokens"], 1024);
    }

    #[test]
    fn simple_payload_shape() {
        let p = build_payload(ProbeKind::Simple, "claude-3-haiku-20240307");
        assert_eq!(p["max_tokens"], 5);
        assert_eq!(p["messages"][0]["content"], "Say OK");
        assert!(p.get("tools").is_none());
    }

    #[test]
    fn messages_url_trims_trailing_slash() {
        assert_eq!(messages_url("https://api.example.com/"), "https://api.example.com/v1/messages");
        assert_eq!(messages_url("https://api.example.com"), "https://api.example.com/v1/messages");
    }

    #[tokio::test]
    async fn probe_extracts_fingerprint_and_sends_both_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(header("x-api-key", "sk-test"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("anthropic-ratelimit-input-tokens-remaining", "49000")
                    .set_body_json(serde_json::json!({
                        "id": "msg_01Xy",
                        "model": "claude-sonnet-4-5-20250929",
                        "stop_reason": "tool_use",
                        "content": [
                            {"type": "tool_use", "id": "toolu_01Ab", "name": "probe", "input": {}}
                        ],
                        "usage": {"input_tokens": 20, "output_tokens": 8}
                    })),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let fp = probe_once(
            &client,
            &server.uri(),
            "sk-test",
            "claude-sonnet-4-5-20250929",
            ProbeKind::Tool,
        )
        .await;

        assert!(fp.is_valid(), "unexpected error: {}", fp.error);
        assert_eq!(fp.tool_id_source, ToolIdSource::Anthropic);
        assert_eq!(fp.msg_id_source, MsgIdSource::Anthropic);
        assert!(fp.has_anthropic_headers);
        assert_eq!(fp.ratelimit_input_remaining, Some(49000));
    }

    #[tokio::test]
    async fn non_200_records_status_and_snippet() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_string("{\"error\":\"invalid key\"}"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let fp = probe_once(&client, &server.uri(), "bad", "m", ProbeKind::Simple).await;
        assert!(fp.error.starts_with("HTTP 401:"));
        assert!(fp.error.contains("invalid key"));
    }

    #[tokio::test]
    async fn non_json_body_is_a_probe_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let fp = probe_once(&client, &server.uri(), "k", "m", ProbeKind::Simple).await;
        assert_eq!(fp.error, "response body not JSON");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_request_failed() {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(500))
            .build()
            .unwrap();
        // Reserved TEST-NET-1 address, nothing listens there.
        let fp = probe_once(&client, "http://192.0.2.1:9", "k", "m", ProbeKind::Simple).await;
        assert_eq!(fp.error, "request failed");
    }
}
