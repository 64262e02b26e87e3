use std::io::{self, BufRead, Write};
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{Clock, ManualClock, RateLimiter, SystemClock};

/// Replay request lines through the limiter and print one decision per line.
///
/// Input lines are `CALLER METHOD PATH [EPOCH_MILLIS]`. Lines without a
/// timestamp are checked at the current wall-clock time.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<String>,

    /// Rule table file (YAML), overrides `rate_limiting.rules_path`
    #[arg(short, long)]
    rules: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Serialize)]
struct Decision<'a> {
    caller: &'a str,
    endpoint: String,
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    window_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

struct Request<'a> {
    caller: &'a str,
    method: &'a str,
    path: &'a str,
    at_millis: Option<u64>,
}

fn parse_line(line: &str) -> Option<Request<'_>> {
    let mut fields = line.split_whitespace();
    let caller = fields.next()?;
    let method = fields.next()?;
    let path = fields.next()?;
    let at_millis = match fields.next() {
        Some(ts) => Some(ts.parse().ok()?),
        None => None,
    };
    if fields.next().is_some() {
        return None;
    }
    Some(Request {
        caller,
        method,
        path,
        at_millis,
    })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for decisions
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Turnstile replay");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => TurnstileConfig::from_file(path)?,
        None => TurnstileConfig::default(),
    };
    if cli.rules.is_some() {
        config.rate_limiting.rules_path = cli.rules.clone();
    }

    let clock = Arc::new(ManualClock::new(SystemClock.now_millis()));
    let limiter = RateLimiter::from_config(&config.rate_limiting, clock.clone())?;

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    let (mut allowed, mut denied) = (0u64, 0u64);

    for (line_no, line) in stdin.lock().lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some(request) = parse_line(trimmed) else {
            warn!(line = line_no + 1, "Skipping malformed request line");
            continue;
        };

        clock.set(request.at_millis.unwrap_or_else(|| SystemClock.now_millis()));

        let decision = match limiter.check(request.caller, request.method, request.path) {
            Ok(()) => {
                allowed += 1;
                Decision {
                    caller: request.caller,
                    endpoint: format!(
                        "{}:{}",
                        request.method,
                        limiter.rules().normalizer().normalize(request.path)
                    ),
                    allowed: true,
                    limit: None,
                    window_seconds: None,
                    retry_after_seconds: None,
                }
            }
            Err(rejection) => {
                denied += 1;
                Decision {
                    caller: request.caller,
                    endpoint: rejection.endpoint,
                    allowed: false,
                    limit: Some(rejection.limit),
                    window_seconds: Some(rejection.window_seconds),
                    retry_after_seconds: Some(rejection.retry_after_seconds),
                }
            }
        };

        serde_json::to_writer(&mut stdout, &decision)?;
        stdout.write_all(b"\n")?;
    }

    stdout.flush()?;
    info!(
        allowed = allowed,
        denied = denied,
        counters = limiter.counter_count(),
        "Replay finished"
    );
    Ok(())
}
