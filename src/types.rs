// relayscope/src/types.rs
//
// Shared domain types flowing through relayscope.
//
// Wire field names match the JSON shape the detection endpoint has always
// emitted, so serialized results stay drop-in compatible with existing
// consumers. Empty-string tags are real states ("no tool_use block seen"),
// not absent fields, and serialize as "".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ── Probe kinds ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Tool,
    Thinking,
    Simple,
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tool     => write!(f, "tool"),
            Self::Thinking => write!(f, "thinking"),
            Self::Simple   => write!(f, "simple"),
        }
    }
}

// ── Fingerprint dimension tags ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolIdSource {
    Anthropic,
    Bedrock,
    Vertex,
    Rewritten,
    #[default]
    #[serde(rename = "")]
    Empty,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgIdSource {
    Anthropic,
    Antigravity,
    Vertex,
    Rewritten,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgIdFormat {
    #[serde(rename = "req_vrtx")]
    ReqVrtx,
    #[serde(rename = "msg_uuid")]
    MsgUuid,
    #[serde(rename = "base62")]
    Base62,
    #[serde(rename = "uuid")]
    Uuid,
    #[serde(rename = "other")]
    Other,
    #[default]
    #[serde(rename = "")]
    Empty,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    Anthropic,
    Bedrock,
    Kiro,
    #[default]
    #[serde(rename = "")]
    Empty,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageStyle {
    #[serde(rename = "camelCase")]
    CamelCase,
    #[serde(rename = "snake_case")]
    SnakeCase,
    #[default]
    #[serde(rename = "")]
    Empty,
}

/// Class of the `thinking` block signature. `None` covers both "no thinking
/// block in the response" and "block present with an empty signature".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingSigClass {
    #[default]
    None,
    Short,
    Normal,
    Vertex,
}

// ── Fingerprint ───────────────────────────────────────────────────────────────

/// Everything extracted from one probe response. One record exists per
/// issued probe; a failed probe carries a non-empty `error` and is skipped
/// by the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Fingerprint {
    pub probe_type:       ProbeKind,
    pub model_requested:  String,
    pub model:            String,
    pub model_source:     ModelSource,
    pub tool_id:          String,
    pub tool_id_source:   ToolIdSource,
    pub msg_id:           String,
    pub msg_id_source:    MsgIdSource,
    pub msg_id_format:    MsgIdFormat,
    pub usage_style:      UsageStyle,
    pub has_service_tier: bool,
    pub service_tier:     String,
    pub has_inference_geo: bool,
    pub inference_geo:     String,
    pub has_cache_creation_obj: bool,
    pub has_aws_headers:        bool,
    pub has_anthropic_headers:  bool,
    pub thinking_sig_class: ThinkingSigClass,
    pub thinking_sig_len:   usize,
    pub stop_reason:        String,
    pub latency_ms:         i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_platform: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub platform_clues: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratelimit_input_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratelimit_input_remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratelimit_input_reset: Option<String>,
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self::new(ProbeKind::Simple, "")
    }
}

impl Fingerprint {
    pub fn new(probe_type: ProbeKind, model_requested: &str) -> Self {
        Self {
            probe_type,
            model_requested: model_requested.to_string(),
            model: String::new(),
            model_source: ModelSource::Empty,
            tool_id: String::new(),
            tool_id_source: ToolIdSource::Empty,
            msg_id: String::new(),
            msg_id_source: MsgIdSource::Unknown,
            msg_id_format: MsgIdFormat::Empty,
            usage_style: UsageStyle::Empty,
            has_service_tier: false,
            service_tier: String::new(),
            has_inference_geo: false,
            inference_geo: String::new(),
            has_cache_creation_obj: false,
            has_aws_headers: false,
            has_anthropic_headers: false,
            thinking_sig_class: ThinkingSigClass::None,
            thinking_sig_len: 0,
            stop_reason: String::new(),
            latency_ms: 0,
            proxy_platform: String::new(),
            platform_clues: Vec::new(),
            error: String::new(),
            ratelimit_input_limit: None,
            ratelimit_input_remaining: None,
            ratelimit_input_reset: None,
        }
    }

    /// A probe that produced a usable response.
    pub fn is_valid(&self) -> bool {
        self.error.is_empty()
    }

    pub fn failed(probe_type: ProbeKind, model_requested: &str, error: impl Into<String>) -> Self {
        let mut fp = Self::new(probe_type, model_requested);
        fp.error = error.into();
        fp
    }
}

// ── Verdict ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Anthropic,
    Bedrock,
    Antigravity,
    Suspicious,
    Unknown,
    Unavailable,
}

impl Verdict {
    /// Localized label shown to operators.
    pub fn label(self) -> &'static str {
        match self {
            Self::Anthropic   => "Anthropic 官方 API",
            Self::Bedrock     => "AWS Bedrock (Kiro)",
            Self::Antigravity => "Google Vertex AI (Antigravity)",
            Self::Suspicious  => "疑似伪装 Anthropic",
            Self::Unknown     => "无法确定",
            Self::Unavailable => "不可用",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic   => write!(f, "anthropic"),
            Self::Bedrock     => write!(f, "bedrock"),
            Self::Antigravity => write!(f, "antigravity"),
            Self::Suspicious  => write!(f, "suspicious"),
            Self::Unknown     => write!(f, "unknown"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

// ── Scores ────────────────────────────────────────────────────────────────────

/// Per-origin evidence points. Fixed fields rather than a map so winner
/// selection has a stable iteration order: anthropic is compared first and
/// bedrock/antigravity replace it only on strictly greater score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scores {
    pub anthropic:   i64,
    pub bedrock:     i64,
    pub antigravity: i64,
}

impl Scores {
    pub fn total(&self) -> i64 {
        self.anthropic + self.bedrock + self.antigravity
    }

    /// Negative buckets are an artifact of the missing-field penalties and
    /// never surface in results.
    pub fn clamp_non_negative(&mut self) {
        self.anthropic = self.anthropic.max(0);
        self.bedrock = self.bedrock.max(0);
        self.antigravity = self.antigravity.max(0);
    }

    /// Max-scoring origin. Tie-break: anthropic, then bedrock, then
    /// antigravity — later entries win only on strictly greater.
    pub fn winner(&self) -> (Verdict, i64) {
        let mut verdict = Verdict::Anthropic;
        let mut max = self.anthropic;
        for (v, s) in [
            (Verdict::Bedrock, self.bedrock),
            (Verdict::Antigravity, self.antigravity),
        ] {
            if s > max {
                max = s;
                verdict = v;
            }
        }
        (verdict, max)
    }
}

// ── Ratelimit verification ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatelimitVerdict {
    Dynamic,
    Static,
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatelimitSample {
    pub remaining: u64,
    pub reset:     String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatelimitVerify {
    pub verdict: RatelimitVerdict,
    pub samples: Vec<RatelimitSample>,
    pub detail:  String,
}

// ── Results ───────────────────────────────────────────────────────────────────

/// Classification outcome for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectResult {
    pub verdict:        Verdict,
    pub verdict_text:   String,
    pub confidence:     f64,
    pub scores:         Scores,
    pub evidence:       Vec<String>,
    pub fingerprints:   Vec<Fingerprint>,
    pub model:          String,
    pub avg_latency_ms: i64,
    pub proxy_platform: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub platform_clues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ratelimit_verify: Option<RatelimitVerify>,
}

impl DetectResult {
    /// Result for a model that failed the availability pre-check: zero
    /// scores, no fingerprints, no evidence.
    pub fn unavailable(model: &str) -> Self {
        Self {
            verdict: Verdict::Unavailable,
            verdict_text: Verdict::Unavailable.label().to_string(),
            confidence: 0.0,
            scores: Scores::default(),
            evidence: Vec::new(),
            fingerprints: Vec::new(),
            model: model.to_string(),
            avg_latency_ms: 0,
            proxy_platform: String::new(),
            platform_clues: Vec::new(),
            ratelimit_verify: None,
        }
    }
}

/// Multi-model aggregation. `is_mixed` is true iff at least two distinct
/// non-unavailable verdicts were observed across the scanned models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub base_url:       String,
    pub proxy_platform: String,
    pub model_results:  Vec<DetectResult>,
    pub summary:        BTreeMap<String, Verdict>,
    pub is_mixed:       bool,
}

impl ScanResult {
    /// Wrap a single-model detection for response uniformity.
    pub fn single(base_url: &str, result: DetectResult) -> Self {
        let mut summary = BTreeMap::new();
        summary.insert(result.model.clone(), result.verdict);
        Self {
            base_url: base_url.to_string(),
            proxy_platform: result.proxy_platform.clone(),
            model_results: vec![result],
            summary,
            is_mixed: false,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
