// relayscope/src/main.rs
//
// relayscope — proxy-origin fingerprinting for Claude-compatible API relays.
//
// Given a base URL and an API key, probes /v1/messages with shaped requests
// and classifies the true upstream: Anthropic official, AWS Bedrock (Kiro
// relays), Google Vertex AI (Antigravity relays), a disguised Anthropic
// impostor, or unknown. Multi-model scans additionally flag mixed channels
// (different models routed to different upstreams).
//
// Usage:
//   relayscope detect --base-url https://relay.example.com --api-key sk-... \
//       --model claude-sonnet-4-5-20250929 --verify-ratelimit
//   relayscope scan   --base-url https://relay.example.com --api-key sk-...
//   relayscope models --base-url https://relay.example.com --api-key sk-...

use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod classifier;
mod detector;
mod fingerprint;
mod models;
mod probe;
mod ratelimit;
mod request;
mod ssrf;
mod types;

use request::DetectRequest;
use types::{DetectResult, ScanResult, Verdict};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "relayscope",
    about   = "Proxy-origin fingerprinting for Claude-compatible API relays",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fingerprint specific models (auto-picks a working model when none given)
    Detect {
        #[arg(long)]
        base_url: String,

        #[arg(long, env = "RELAYSCOPE_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Model to probe; repeat for multi-model detection (max 6)
        #[arg(long = "model")]
        models: Vec<String>,

        /// Tool-probe rounds per model (1-3)
        #[arg(long, default_value_t = request::DEFAULT_ROUNDS)]
        rounds: usize,

        /// Check whether ratelimit headers are live counters (single model only)
        #[arg(long)]
        verify_ratelimit: bool,

        /// Allow targets resolving to private addresses (admin use)
        #[arg(long)]
        allow_private: bool,

        /// Emit the raw ScanResult JSON instead of the rendered report
        #[arg(long)]
        json: bool,
    },

    /// Scan the default model set for mixed-channel relays
    Scan {
        #[arg(long)]
        base_url: String,

        #[arg(long, env = "RELAYSCOPE_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Override the default scan models (max 6)
        #[arg(long = "model")]
        models: Vec<String>,

        #[arg(long, default_value_t = request::DEFAULT_ROUNDS)]
        rounds: usize,

        #[arg(long)]
        allow_private: bool,

        #[arg(long)]
        json: bool,
    },

    /// List the Claude-family models the endpoint advertises
    Models {
        #[arg(long)]
        base_url: String,

        #[arg(long, env = "RELAYSCOPE_API_KEY", hide_env_values = true)]
        api_key: String,

        #[arg(long)]
        allow_private: bool,
    },
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("relayscope=info".parse()?),
        )
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Detect {
            base_url,
            api_key,
            mut models,
            rounds,
            verify_ratelimit,
            allow_private,
            json,
        } => {
            let base_url = resolve_target(&base_url, allow_private)?;
            if models.is_empty() {
                info!("no model given, probing for a usable one");
                let model =
                    detector::find_working_model(&base_url, &api_key, allow_private, &[]).await?;
                models.push(model);
            }
            let mut req = DetectRequest {
                base_url: base_url.clone(),
                api_key,
                models,
                rounds,
                verify_ratelimit,
            };
            req.normalize()?;
            let scan = detector::run_detect(&base_url, &req, allow_private).await?;
            emit(&scan, json)?;
        }

        Command::Scan {
            base_url,
            api_key,
            mut models,
            rounds,
            allow_private,
            json,
        } => {
            let base_url = resolve_target(&base_url, allow_private)?;
            if models.is_empty() {
                models = crate::models::DEFAULT_SCAN_MODELS
                    .iter()
                    .map(|m| m.to_string())
                    .collect();
            }
            let mut req = DetectRequest {
                base_url: base_url.clone(),
                api_key,
                models,
                rounds,
                verify_ratelimit: false,
            };
            req.normalize()?;
            let scan = detector::run_detect(&base_url, &req, allow_private).await?;
            emit(&scan, json)?;
        }

        Command::Models {
            base_url,
            api_key,
            allow_private,
        } => {
            let req = request::ListModelsRequest {
                base_url: resolve_target(&base_url, allow_private)?,
                api_key,
            };
            req.normalize()?;
            let ids =
                models::fetch_remote_models(&req.base_url, &req.api_key, allow_private).await?;
            for id in ids {
                println!("{id}");
            }
        }
    }

    Ok(())
}

/// Apply the server-pinning policy: without `--allow-private` (the admin
/// bit) the target is overridden by RELAYSCOPE_SERVER when one is
/// configured. Unpinned deployments probe the requested URL as-is.
fn resolve_target(requested: &str, is_admin: bool) -> Result<String> {
    let default_server =
        std::env::var("RELAYSCOPE_SERVER").unwrap_or_else(|_| requested.to_string());
    request::resolve_base_url(requested, is_admin, &default_server)
}

fn emit(scan: &ScanResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(scan)?);
    } else {
        print_report(scan);
    }
    Ok(())
}

// ── Terminal output ───────────────────────────────────────────────────────────

fn print_report(scan: &ScanResult) {
    println!("\n\x1b[1m── relayscope  {}  {} ──\x1b[0m", scan.base_url, Local::now().format("%Y-%m-%d %H:%M:%S"));
    if !scan.proxy_platform.is_empty() {
        println!("  中转平台: \x1b[93m{}\x1b[0m", scan.proxy_platform);
    }

    for result in &scan.model_results {
        print_result(result);
    }

    if scan.is_mixed {
        println!("\n\x1b[91;1m⚠ 混合渠道: 不同模型路由到了不同上游\x1b[0m");
        for (model, verdict) in &scan.summary {
            println!("  {model} → {}", verdict.label());
        }
    }
    println!();
}

fn print_result(result: &DetectResult) {
    let (color, icon) = verdict_style(result.verdict);
    let reset = "\x1b[0m";

    println!("\n{color}{icon} {} → {}{reset}", result.model, result.verdict_text);
    if result.verdict == Verdict::Unavailable {
        return;
    }
    println!(
        "  置信度 {:.0}%  |  scores a={} b={} ag={}  |  {} ms",
        result.confidence * 100.0,
        result.scores.anthropic,
        result.scores.bedrock,
        result.scores.antigravity,
        result.avg_latency_ms,
    );
    for line in &result.evidence {
        println!("  \x1b[90m{line}{reset}");
    }
}

fn verdict_style(verdict: Verdict) -> (&'static str, &'static str) {
    match verdict {
        Verdict::Anthropic   => ("\x1b[92m", "🟢"),
        Verdict::Bedrock     => ("\x1b[93m", "🟡"),
        Verdict::Antigravity => ("\x1b[96m", "🔵"),
        Verdict::Suspicious  => ("\x1b[91;1m", "🔴"),
        Verdict::Unknown     => ("\x1b[90m", "⚪"),
        Verdict::Unavailable => ("\x1b[90m", "⚫"),
    }
}
