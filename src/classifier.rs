// relayscope/src/classifier.rs
//
// Weighted multi-pass classification of a model's fingerprints.
//
// Pass A  additive scoring per fingerprint dimension
// Pass B  attribution correction — Antigravity-over-Vertex relays also emit
//         tooluse_ prefixes, so without a kiro-* model those points belong
//         to Antigravity; conversely kiro relays rewrite msg ids into UUIDs
// Pass C  negative evidence — a relay can forge Anthropic-shaped ids and
//         inject service_tier, but not inference_geo, the nested
//         cache_creation object, or a genuine thinking signature
// Pass D  verdict + confidence
//
// Weight scale: 8 is a smoking gun (kiro-* model name), 5-6 a strong
// provider-specific identifier, 1-3 a corroborating marker.
//
// analyze() is a pure function over its inputs; evidence line order is
// observable (probe order, then corrections, then missing-field findings,
// then the verdict summary) and tests rely on it.

use crate::types::{
    DetectResult, Fingerprint, ModelSource, MsgIdSource, ProbeKind, Scores, ThinkingSigClass,
    ToolIdSource, UsageStyle, Verdict,
};

const W_TOOL_ID: i64 = 5;
const W_MSG_ID_ANTHROPIC: i64 = 2;
const W_MSG_ID_VERTEX: i64 = 6;
const W_THINKING_SIG_VERTEX: i64 = 5;
const W_MODEL_KIRO: i64 = 8;
const W_MODEL_BEDROCK: i64 = 3;
const W_SERVICE_TIER: i64 = 3;
const W_INFERENCE_GEO: i64 = 2;
const W_CACHE_CREATION_OBJ: i64 = 1;
const W_USAGE_CAMELCASE: i64 = 2;
const W_AWS_HEADERS: i64 = 3;
const W_ANTHROPIC_HEADERS: i64 = 2;

const PENALTY_MISSING_GEO: i64 = 3;
const PENALTY_MISSING_CACHE_OBJ: i64 = 2;
const PENALTY_MISSING_THINKING_SIG: i64 = 3;

const ID_DISPLAY_LEN: usize = 28;

/// Classify the fingerprints collected for one model.
pub fn analyze(fingerprints: Vec<Fingerprint>, model: &str) -> DetectResult {
    let valid: Vec<&Fingerprint> = fingerprints.iter().filter(|fp| fp.is_valid()).collect();

    if valid.is_empty() {
        return DetectResult {
            verdict: Verdict::Unknown,
            verdict_text: Verdict::Unknown.label().to_string(),
            confidence: 0.0,
            scores: Scores::default(),
            evidence: vec!["所有探测均失败".to_string()],
            fingerprints,
            model: model.to_string(),
            avg_latency_ms: 0,
            proxy_platform: String::new(),
            platform_clues: Vec::new(),
            ratelimit_verify: None,
        };
    }

    let avg_latency_ms =
        valid.iter().map(|fp| fp.latency_ms).sum::<i64>() / valid.len() as i64;

    let (proxy_platform, platform_clues) = valid
        .iter()
        .find(|fp| !fp.proxy_platform.is_empty())
        .map(|fp| (fp.proxy_platform.clone(), fp.platform_clues.clone()))
        .unwrap_or_default();

    let mut scores = Scores::default();
    let mut evidence: Vec<String> = Vec::new();

    if !proxy_platform.is_empty() {
        evidence.push(format!("中转平台: {proxy_platform}"));
    }

    // ── Pass A: additive scoring ──────────────────────────────────────────────

    for (i, fp) in valid.iter().enumerate() {
        let tag = format!("[R{}]", i + 1);

        match fp.tool_id_source {
            ToolIdSource::Bedrock => {
                scores.bedrock += W_TOOL_ID;
                evidence.push(format!(
                    "{tag} tool_use id: {} -> tooluse_ (Bedrock/AG)",
                    trunc(&fp.tool_id, ID_DISPLAY_LEN)
                ));
            }
            ToolIdSource::Anthropic => {
                scores.anthropic += W_TOOL_ID;
                evidence.push(format!(
                    "{tag} tool_use id: {} -> toolu_ (Anthropic)",
                    trunc(&fp.tool_id, ID_DISPLAY_LEN)
                ));
            }
            ToolIdSource::Vertex => {
                scores.antigravity += W_TOOL_ID;
                evidence.push(format!(
                    "{tag} tool_use id: {} -> tool_N (Vertex AI)",
                    trunc(&fp.tool_id, ID_DISPLAY_LEN)
                ));
            }
            ToolIdSource::Rewritten => {
                if !fp.tool_id.is_empty() {
                    evidence.push(format!(
                        "{tag} tool_use id: {} -> 被改写",
                        trunc(&fp.tool_id, ID_DISPLAY_LEN)
                    ));
                }
            }
            ToolIdSource::Empty => {}
        }

        match fp.thinking_sig_class {
            ThinkingSigClass::Short => {
                evidence.push(format!(
                    "{tag} thinking sig: (len={}) -> 签名截断",
                    fp.thinking_sig_len
                ));
            }
            ThinkingSigClass::Vertex => {
                scores.antigravity += W_THINKING_SIG_VERTEX;
                evidence.push(format!(
                    "{tag} thinking sig: (len={}) -> claude# 前缀 (Vertex AI)",
                    fp.thinking_sig_len
                ));
            }
            ThinkingSigClass::Normal => {
                evidence.push(format!(
                    "{tag} thinking sig: (len={}) -> 正常签名",
                    fp.thinking_sig_len
                ));
            }
            ThinkingSigClass::None => {
                if fp.probe_type == ProbeKind::Thinking {
                    evidence.push(format!("{tag} thinking sig: 无签名"));
                }
            }
        }

        match fp.msg_id_source {
            MsgIdSource::Anthropic => {
                scores.anthropic += W_MSG_ID_ANTHROPIC;
                evidence.push(format!(
                    "{tag} message id: {} -> msg_<base62> (Anthropic)",
                    trunc(&fp.msg_id, ID_DISPLAY_LEN)
                ));
            }
            MsgIdSource::Antigravity => {
                evidence.push(format!(
                    "{tag} message id: {} -> msg_<UUID> (非原生)",
                    trunc(&fp.msg_id, ID_DISPLAY_LEN)
                ));
            }
            MsgIdSource::Vertex => {
                scores.antigravity += W_MSG_ID_VERTEX;
                evidence.push(format!(
                    "{tag} message id: {} -> req_vrtx_ (Vertex AI)",
                    trunc(&fp.msg_id, ID_DISPLAY_LEN)
                ));
            }
            MsgIdSource::Rewritten => {
                evidence.push(format!(
                    "{tag} message id: {} -> 被改写",
                    trunc(&fp.msg_id, ID_DISPLAY_LEN)
                ));
            }
            MsgIdSource::Unknown => {}
        }

        match fp.model_source {
            ModelSource::Kiro => {
                scores.bedrock += W_MODEL_KIRO;
                evidence.push(format!("{tag} model: {} -> kiro-* (Kiro 逆向铁证)", fp.model));
            }
            ModelSource::Bedrock => {
                scores.bedrock += W_MODEL_BEDROCK;
                evidence.push(format!("{tag} model: {} -> anthropic.* (Bedrock)", fp.model));
            }
            ModelSource::Anthropic | ModelSource::Empty => {}
        }

        if fp.has_service_tier {
            scores.anthropic += W_SERVICE_TIER;
            evidence.push(format!("{tag} service_tier: {} -> Anthropic 独有", fp.service_tier));
        }
        if fp.has_inference_geo {
            scores.anthropic += W_INFERENCE_GEO;
            evidence.push(format!("{tag} inference_geo: {} -> Anthropic 独有", fp.inference_geo));
        }
        if fp.has_cache_creation_obj {
            scores.anthropic += W_CACHE_CREATION_OBJ;
            evidence.push(format!("{tag} cache_creation: 嵌套对象 -> Anthropic 新格式"));
        }

        if fp.usage_style == UsageStyle::CamelCase {
            scores.bedrock += W_USAGE_CAMELCASE;
            evidence.push(format!("{tag} usage: camelCase (Bedrock)"));
        }

        if fp.has_aws_headers {
            scores.bedrock += W_AWS_HEADERS;
            evidence.push(format!("{tag} AWS headers detected"));
        }
        if fp.has_anthropic_headers {
            scores.anthropic += W_ANTHROPIC_HEADERS;
            evidence.push(format!("{tag} Anthropic rate-limit headers detected"));
        }
    }

    // ── Pass B: tooluse_ attribution correction ───────────────────────────────

    let has_kiro_model = valid.iter().any(|fp| fp.model_source == ModelSource::Kiro);

    if !has_kiro_model && scores.antigravity > 0 && scores.bedrock > 0 {
        let tooluse_points = W_TOOL_ID
            * valid
                .iter()
                .filter(|fp| fp.tool_id_source == ToolIdSource::Bedrock)
                .count() as i64;
        if scores.antigravity >= 4 {
            scores.antigravity += tooluse_points;
            scores.bedrock -= tooluse_points;
            evidence.push(format!(
                "[修正] tooluse_ 分数 {tooluse_points} 从 Bedrock 转移到 Antigravity"
            ));
        }
    }

    if has_kiro_model {
        let msg_uuid_count = valid
            .iter()
            .filter(|fp| fp.msg_id_source == MsgIdSource::Antigravity)
            .count();
        if msg_uuid_count > 0 {
            evidence.push(format!(
                "[修正] msg_<UUID> x{msg_uuid_count} 归属 Kiro 中转改写 (非 Antigravity)"
            ));
        }
    }

    // ── Pass C: missing-field negative evidence ───────────────────────────────

    let mut missing_flags: Vec<&'static str> = Vec::new();
    let has_thinking_probe = valid.iter().any(|fp| fp.probe_type == ProbeKind::Thinking);

    if scores.anthropic > 0 && scores.bedrock == 0 && scores.antigravity == 0 {
        let any_inference_geo = valid.iter().any(|fp| fp.has_inference_geo);
        let any_cache_obj = valid.iter().any(|fp| fp.has_cache_creation_obj);

        if !any_inference_geo {
            missing_flags.push("inference_geo");
            scores.anthropic -= PENALTY_MISSING_GEO;
            evidence.push("[缺失] inference_geo 未出现 (Anthropic 官方必有字段)".to_string());
        }
        if !any_cache_obj {
            missing_flags.push("cache_creation_obj");
            scores.anthropic -= PENALTY_MISSING_CACHE_OBJ;
            evidence.push("[缺失] cache_creation 嵌套对象未出现".to_string());
        }

        if has_thinking_probe {
            let any_thinking_sig = valid
                .iter()
                .any(|fp| fp.probe_type == ProbeKind::Thinking && fp.thinking_sig_len > 0);
            if !any_thinking_sig {
                missing_flags.push("thinking_signature");
                scores.anthropic -= PENALTY_MISSING_THINKING_SIG;
                evidence.push(
                    "[缺失] thinking signature 为空 (真 Anthropic thinking 轮应有 len 200+ 签名)"
                        .to_string(),
                );
            }
        }
    }

    scores.clamp_non_negative();

    // ── Pass D: verdict ───────────────────────────────────────────────────────

    let total = scores.total();
    let mut suspicious = false;
    let mut verdict;
    let confidence;

    if total == 0 {
        confidence = 0.0;
        if !missing_flags.is_empty() {
            verdict = Verdict::Anthropic;
            suspicious = true;
            evidence.push("[!] 正面分数被缺失扣分抵消，高度可疑伪装 Anthropic".to_string());
        } else {
            verdict = Verdict::Unknown;
            evidence.push("未获取到有效指纹信号".to_string());
        }
    } else {
        let (winner, max) = scores.winner();
        verdict = winner;
        confidence = (max as f64 / total as f64 * 100.0).round() / 100.0;
        if winner == Verdict::Anthropic && missing_flags.len() >= 2 {
            suspicious = true;
        }
    }

    if suspicious {
        verdict = Verdict::Suspicious;
        evidence.push(format!(
            "[!!] 疑似伪装 Anthropic: {} 个必有字段缺失 ({})",
            missing_flags.len(),
            missing_flags.join(", ")
        ));
        evidence.push(
            "[!!] 中转站可能重写了 tool_id 前缀并注入 service_tier，但无法伪造 inference_geo 和 cache_creation 嵌套对象"
                .to_string(),
        );
    }

    DetectResult {
        verdict,
        verdict_text: verdict.label().to_string(),
        confidence,
        scores,
        evidence,
        fingerprints,
        model: model.to_string(),
        avg_latency_ms,
        proxy_platform,
        platform_clues,
        ratelimit_verify: None,
    }
}

fn trunc(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
