// relayscope/src/ratelimit.rs
//
// Ratelimit header forgery check.
//
// A relay can copy anthropic-ratelimit-* headers into its responses, but a
// static mirror cannot reproduce the upstream's live counter: the real
// `input-tokens-remaining` decreases monotonically as probes consume quota.
// Fire a few cheap probes and watch the counter.

use tokio::time::{sleep, timeout_at, Duration, Instant};

use crate::probe;
use crate::types::{Fingerprint, ProbeKind, RatelimitSample, RatelimitVerdict, RatelimitVerify};

pub const DEFAULT_SHOTS: usize = 4;

const SHOT_PAUSE: Duration = Duration::from_millis(300);

/// Decide dynamic/static/unavailable from collected samples. Pure over its
/// input; the probe loop feeds it.
pub fn judge_samples(samples: Vec<RatelimitSample>) -> RatelimitVerify {
    if samples.len() < 2 {
        return RatelimitVerify {
            verdict: RatelimitVerdict::Unavailable,
            samples,
            detail: "ratelimit header 不可用（样本不足）".to_string(),
        };
    }

    let first = samples[0].remaining;
    let last = samples[samples.len() - 1].remaining;
    let all_same = samples.iter().all(|s| s.remaining == first);
    let monotone_dec = samples.windows(2).all(|w| w[0].remaining >= w[1].remaining);
    let total_drop = first as i64 - last as i64;

    if all_same {
        RatelimitVerify {
            verdict: RatelimitVerdict::Static,
            detail: format!("remaining 固定为 {first}，疑似伪造"),
            samples,
        }
    } else if monotone_dec && total_drop > 0 {
        RatelimitVerify {
            verdict: RatelimitVerdict::Dynamic,
            detail: format!("remaining 单调递减 {first} → {last} (drop={total_drop})，真实 ratelimit"),
            samples,
        }
    } else {
        RatelimitVerify {
            verdict: RatelimitVerdict::Dynamic,
            detail: format!("remaining 有变化但非单调 ({first} → {last})，可能真实"),
            samples,
        }
    }
}

/// Fire `shots` simple probes 300 ms apart and judge the remaining-counter
/// sequence. Shares the caller's detection deadline.
pub async fn verify_ratelimit_dynamic(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    model: &str,
    shots: usize,
    deadline: Instant,
) -> RatelimitVerify {
    let shots = if shots == 0 { DEFAULT_SHOTS } else { shots };
    let mut samples: Vec<RatelimitSample> = Vec::new();

    for i in 0..shots {
        if Instant::now() >= deadline {
            break;
        }
        let fp = match timeout_at(
            deadline,
            probe::probe_once(client, base_url, api_key, model, ProbeKind::Simple),
        )
        .await
        {
            Ok(fp) => fp,
            Err(_) => Fingerprint::failed(ProbeKind::Simple, model, "detection timed out"),
        };

        if fp.is_valid() {
            if let Some(remaining) = fp.ratelimit_input_remaining.filter(|&n| n > 0) {
                samples.push(RatelimitSample {
                    remaining,
                    reset: fp.ratelimit_input_reset.unwrap_or_default(),
                });
            }
        }

        if i + 1 < shots {
            sleep(SHOT_PAUSE).await;
        }
    }

    judge_samples(samples)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
