// relayscope/src/detector.rs
//
// Detection coordination.
//
// One detection is one logical task running probes sequentially: `rounds`
// tool probes 300 ms apart, one thinking probe, then classification, then
// the optional ratelimit verification. Multi-model scans run models in
// order with an availability gate in front of each — sequential on purpose,
// to keep quota cost predictable and the evidence stream legible.
//
// Every blocking step sits under the detection deadline. When it expires,
// the in-flight probe reports "detection timed out", later probes are
// skipped, and classification proceeds on whatever was collected.

use std::collections::BTreeMap;

use anyhow::Result;
use tokio::time::{sleep, timeout_at, Duration, Instant};
use tracing::{debug, info};

use crate::classifier;
use crate::models::{DEFAULT_SCAN_MODELS, WORKING_MODEL_PROBES};
use crate::probe;
use crate::ratelimit;
use crate::request::DetectRequest;
use crate::ssrf;
use crate::types::{
    DetectResult, Fingerprint, ProbeKind, RatelimitVerdict, ScanResult, Verdict,
};

const SINGLE_DETECT_TIMEOUT: Duration = Duration::from_secs(120);
const MULTI_SCAN_TIMEOUT: Duration = Duration::from_secs(300);
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);
const AVAIL_CHECK_TIMEOUT: Duration = Duration::from_secs(20);
const WORKING_MODEL_CHECK_TIMEOUT: Duration = Duration::from_secs(15);

const TOOL_ROUND_PAUSE: Duration = Duration::from_millis(300);
const MODEL_PAUSE: Duration = Duration::from_millis(500);

async fn probe_with_deadline(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    model: &str,
    kind: ProbeKind,
    deadline: Instant,
) -> Fingerprint {
    match timeout_at(
        deadline,
        probe::probe_once(client, base_url, api_key, model, kind),
    )
    .await
    {
        Ok(fp) => fp,
        Err(_) => Fingerprint::failed(kind, model, "detection timed out"),
    }
}

/// Run the full probe sequence against one model and classify.
pub async fn detect_single_model(
    base_url: &str,
    api_key: &str,
    model: &str,
    rounds: usize,
    skip_ssrf_check: bool,
    verify_ratelimit: bool,
) -> Result<DetectResult> {
    let deadline = Instant::now() + SINGLE_DETECT_TIMEOUT;
    if !skip_ssrf_check {
        ssrf::ensure_public_host(base_url)?;
    }
    let client = ssrf::client_for(PROBE_TIMEOUT, skip_ssrf_check)?;

    let mut fingerprints: Vec<Fingerprint> = Vec::new();

    for i in 0..rounds {
        if Instant::now() >= deadline {
            break;
        }
        let fp = probe_with_deadline(&client, base_url, api_key, model, ProbeKind::Tool, deadline).await;
        debug!(model, round = i + 1, error = %fp.error, "tool probe done");
        fingerprints.push(fp);
        if i + 1 < rounds {
            sleep(TOOL_ROUND_PAUSE).await;
        }
    }

    if Instant::now() < deadline {
        let fp =
            probe_with_deadline(&client, base_url, api_key, model, ProbeKind::Thinking, deadline)
                .await;
        debug!(model, error = %fp.error, "thinking probe done");
        fingerprints.push(fp);
    }

    let mut result = classifier::analyze(fingerprints, model);

    if verify_ratelimit && Instant::now() < deadline {
        let verify = ratelimit::verify_ratelimit_dynamic(
            &client,
            base_url,
            api_key,
            model,
            ratelimit::DEFAULT_SHOTS,
            deadline,
        )
        .await;
        result.evidence.push(match verify.verdict {
            RatelimitVerdict::Static => {
                "[!!] ratelimit remaining 值固定不变，疑似伪造的 ratelimit header".to_string()
            }
            RatelimitVerdict::Dynamic => {
                "[✓] ratelimit remaining 正常递减，真实 Anthropic ratelimit header".to_string()
            }
            RatelimitVerdict::Unavailable => {
                "[i] ratelimit header 不可用，无法进行动态验证".to_string()
            }
        });
        result.ratelimit_verify = Some(verify);
    }

    info!(model, verdict = %result.verdict, confidence = result.confidence, "detection finished");
    Ok(result)
}

/// One cheap probe; HTTP 200 means the model is usable on this endpoint.
pub async fn check_model_available(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    model: &str,
    deadline: Instant,
) -> bool {
    let payload = probe::build_payload(ProbeKind::Simple, model);
    let send = client
        .post(probe::messages_url(base_url))
        .header("Content-Type", "application/json")
        .header("anthropic-version", probe::ANTHROPIC_VERSION)
        .header("x-api-key", api_key)
        .bearer_auth(api_key)
        .json(&payload)
        .send();
    match timeout_at(deadline, send).await {
        Ok(Ok(resp)) => resp.status().as_u16() == 200,
        _ => false,
    }
}

/// First model from `probes` the endpoint accepts, or the list head when
/// none answers. `probes` defaults to the Opus-free built-in list.
pub async fn find_working_model(
    base_url: &str,
    api_key: &str,
    skip_ssrf_check: bool,
    probes: &[&str],
) -> Result<String> {
    let probes = if probes.is_empty() { WORKING_MODEL_PROBES } else { probes };
    if !skip_ssrf_check {
        ssrf::ensure_public_host(base_url)?;
    }
    let client = ssrf::client_for(WORKING_MODEL_CHECK_TIMEOUT, skip_ssrf_check)?;

    for model in probes {
        let deadline = Instant::now() + WORKING_MODEL_CHECK_TIMEOUT;
        if check_model_available(&client, base_url, api_key, model, deadline).await {
            return Ok(model.to_string());
        }
    }
    Ok(probes[0].to_string())
}

/// Scan several models in sequence and flag mixed channels.
pub async fn scan_multiple_models(
    base_url: &str,
    api_key: &str,
    models: &[String],
    rounds: usize,
    skip_ssrf_check: bool,
) -> Result<ScanResult> {
    let models: Vec<String> = if models.is_empty() {
        DEFAULT_SCAN_MODELS.iter().map(|m| m.to_string()).collect()
    } else {
        models.to_vec()
    };

    let deadline = Instant::now() + MULTI_SCAN_TIMEOUT;
    if !skip_ssrf_check {
        ssrf::ensure_public_host(base_url)?;
    }

    let mut scan = ScanResult {
        base_url: base_url.to_string(),
        proxy_platform: String::new(),
        model_results: Vec::new(),
        summary: BTreeMap::new(),
        is_mixed: false,
    };

    let last = models.len().saturating_sub(1);
    for (i, model) in models.iter().enumerate() {
        if Instant::now() >= deadline {
            break;
        }

        let avail_client = ssrf::client_for(AVAIL_CHECK_TIMEOUT, skip_ssrf_check)?;
        let avail_deadline = deadline.min(Instant::now() + AVAIL_CHECK_TIMEOUT);
        if !check_model_available(&avail_client, base_url, api_key, model, avail_deadline).await {
            info!(model, "model unavailable, skipping probes");
            scan.model_results.push(DetectResult::unavailable(model));
            scan.summary.insert(model.clone(), Verdict::Unavailable);
            continue;
        }

        let result =
            detect_single_model(base_url, api_key, model, rounds, skip_ssrf_check, false).await?;
        scan.summary.insert(model.clone(), result.verdict);
        if scan.proxy_platform.is_empty() && !result.proxy_platform.is_empty() {
            scan.proxy_platform = result.proxy_platform.clone();
        }
        scan.model_results.push(result);

        if i < last {
            sleep(MODEL_PAUSE).await;
        }
    }

    scan.is_mixed = is_mixed(&scan.summary);
    Ok(scan)
}

/// Mixed channel: at least two distinct non-unavailable verdicts.
fn is_mixed(summary: &BTreeMap<String, Verdict>) -> bool {
    let mut seen: Vec<Verdict> = Vec::new();
    for v in summary.values() {
        if *v != Verdict::Unavailable && !seen.contains(v) {
            seen.push(*v);
        }
    }
    seen.len() > 1
}

/// Entry point for a validated detect request: single-model detections are
/// wrapped into a one-entry ScanResult so callers always get the same shape.
/// `skip_ssrf_check` is NOT part of the request — it comes from the caller's
/// privilege, never from the wire.
pub async fn run_detect(
    base_url: &str,
    req: &DetectRequest,
    skip_ssrf_check: bool,
) -> Result<ScanResult> {
    if req.models.len() == 1 {
        let result = detect_single_model(
            base_url,
            &req.api_key,
            &req.models[0],
            req.rounds,
            skip_ssrf_check,
            req.verify_ratelimit,
        )
        .await?;
        Ok(ScanResult::single(base_url, result))
    } else {
        scan_multiple_models(base_url, &req.api_key, &req.models, req.rounds, skip_ssrf_check).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn anthropic_message(model: &str) -> serde_json::Value {
        json!({
            "id": "msg_01WvRtS9gH4x",
            "model": model,
            "stop_reason": "tool_use",
            "content": [
                {"type": "tool_use", "id": "toolu_01A9XkQ", "name": "probe", "input": {"q": "test"}}
            ],
            "usage": {
                "input_tokens": 30,
                "output_tokens": 12,
                "service_tier": "standard",
                "inference_geo": "us-east-1",
                "cache_creation": {"ephemeral_5m_input_tokens": 0}
            }
        })
    }

    fn vertex_message(model: &str) -> serde_json::Value {
        json!({
            "id": "req_vrtx_0051ce0e",
            "model": model,
            "stop_reason": "tool_use",
            "content": [
                {"type": "tool_use", "id": "tool_0", "name": "probe", "input": {"q": "test"}}
            ],
            "usage": {"input_tokens": 30, "output_tokens": 12}
        })
    }

    #[tokio::test]
    async fn single_model_detection_end_to_end() {
        let model = "claude-sonnet-4-5-20250929";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_message(model)))
            .mount(&server)
            .await;

        let result = detect_single_model(&server.uri(), "sk-test", model, 1, true, false)
            .await
            .unwrap();

        assert_eq!(result.verdict, Verdict::Anthropic);
        assert_eq!(result.fingerprints.len(), 2); // 1 tool round + thinking
        assert!(result.confidence > 0.9);
    }

    #[tokio::test]
    async fn ratelimit_verification_merges_into_result() {
        let model = "claude-3-haiku-20240307";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("anthropic-ratelimit-input-tokens-remaining", "50000")
                    .set_body_json(anthropic_message(model)),
            )
            .mount(&server)
            .await;

        let result = detect_single_model(&server.uri(), "sk-test", model, 1, true, true)
            .await
            .unwrap();

        let verify = result.ratelimit_verify.expect("ratelimit verify present");
        assert_eq!(verify.verdict, RatelimitVerdict::Static);
        assert!(result
            .evidence
            .last()
            .unwrap()
            .contains("疑似伪造的 ratelimit header"));
    }

    #[tokio::test]
    async fn unavailable_model_short_circuits_the_scan() {
        let good = "claude-sonnet-4-5-20250929";
        let bad = "claude-3-haiku-20240307";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({"model": bad})))
            .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({"model": good})))
            .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_message(good)))
            .mount(&server)
            .await;

        let models = vec![good.to_string(), bad.to_string()];
        let scan = scan_multiple_models(&server.uri(), "sk-test", &models, 1, true)
            .await
            .unwrap();

        assert_eq!(scan.model_results.len(), 2);
        assert_eq!(scan.summary[good], Verdict::Anthropic);
        assert_eq!(scan.summary[bad], Verdict::Unavailable);
        let unavailable = &scan.model_results[1];
        assert!(unavailable.fingerprints.is_empty());
        assert_eq!(unavailable.scores.total(), 0);
        // One good verdict + unavailable is not a mixed channel.
        assert!(!scan.is_mixed);
    }

    #[tokio::test]
    async fn differing_upstreams_flag_a_mixed_channel() {
        let a = "claude-sonnet-4-5-20250929";
        let b = "claude-3-5-sonnet-20241022";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({"model": a})))
            .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_message(a)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({"model": b})))
            .respond_with(ResponseTemplate::new(200).set_body_json(vertex_message(b)))
            .mount(&server)
            .await;

        let models = vec![a.to_string(), b.to_string()];
        let scan = scan_multiple_models(&server.uri(), "sk-test", &models, 1, true)
            .await
            .unwrap();

        assert_eq!(scan.summary[a], Verdict::Anthropic);
        assert_eq!(scan.summary[b], Verdict::Antigravity);
        assert!(scan.is_mixed);
    }

    #[tokio::test]
    async fn run_detect_wraps_single_model_in_scan_result() {
        let model = "claude-sonnet-4-5-20250929";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_message(model)))
            .mount(&server)
            .await;

        let req = DetectRequest {
            base_url: server.uri(),
            api_key: "sk-test".to_string(),
            models: vec![model.to_string()],
            rounds: 1,
            verify_ratelimit: false,
        };
        let scan = run_detect(&server.uri(), &req, true).await.unwrap();

        assert_eq!(scan.model_results.len(), 1);
        assert!(!scan.is_mixed);
        assert_eq!(scan.summary[model], Verdict::Anthropic);
    }

    #[tokio::test]
    async fn find_working_model_walks_the_probe_list_in_order() {
        // Only the second candidate answers 200; everything else falls
        // through to the mock server's default 404.
        let server = MockServer::start().await;
        let second = WORKING_MODEL_PROBES[1];
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({"model": second})))
            .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_message(second)))
            .mount(&server)
            .await;

        let model = find_working_model(&server.uri(), "sk-test", true, &[]).await.unwrap();
        assert_eq!(model, second);
    }

    #[tokio::test]
    async fn find_working_model_falls_back_to_the_list_head() {
        let server = MockServer::start().await;
        let model = find_working_model(&server.uri(), "sk-test", true, &[]).await.unwrap();
        assert_eq!(model, WORKING_MODEL_PROBES[0]);
    }

    #[test]
    fn is_mixed_law() {
        let mut summary = BTreeMap::new();
        summary.insert("a".to_string(), Verdict::Anthropic);
        summary.insert("b".to_string(), Verdict::Unavailable);
        assert!(!is_mixed(&summary));

        summary.insert("c".to_string(), Verdict::Bedrock);
        assert!(is_mixed(&summary));

        let mut same = BTreeMap::new();
        same.insert("a".to_string(), Verdict::Bedrock);
        same.insert("b".to_string(), Verdict::Bedrock);
        assert!(!is_mixed(&same));
    }
}
