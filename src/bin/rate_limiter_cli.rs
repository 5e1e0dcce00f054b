// src/bin/rate_limiter_cli.rs

use prettytable::{row, Cell, Row, Table};
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use distributed_rate_limiter::config::{
    AlgorithmConfig, FailurePolicy, FixedWindowConfig, InMemoryConfig, LeakyBucketConfig,
    RateLimiterConfig, RedisConfig, SlidingLogConfig, SlidingWindowConfig, TokenBucketConfig,
};
use distributed_rate_limiter::storage::{MemoryStorage, RedisStorage};
use distributed_rate_limiter::{Decision, RateLimiter};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "rate_limiter_cli",
    about = "Replays simulated traffic through one rate limiting algorithm"
)]
struct Opt {
    /// Rate limiting algorithm to use
    #[structopt(short, long, possible_values = &["fixed_window", "sliding_window", "sliding_log", "leaky_bucket", "token_bucket"], default_value = "token_bucket")]
    algorithm: String,

    /// Storage backend to use
    #[structopt(short, long, possible_values = &["memory", "redis"], default_value = "memory")]
    storage: String,

    /// Redis URL (when using Redis storage)
    #[structopt(long, default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Client identifier to limit
    #[structopt(short, long, default_value = "default_user")]
    key: String,

    /// Maximum requests per window, or bucket capacity
    #[structopt(short, long, default_value = "10")]
    max_requests: u64,

    /// Window length for the window based algorithms, in milliseconds
    #[structopt(short, long, default_value = "10000")]
    window_ms: u64,

    /// Leak or refill interval for the bucket based algorithms, in milliseconds
    #[structopt(short, long, default_value = "1000")]
    interval_ms: u64,

    /// Buckets per window for the sliding window counter
    #[structopt(short, long, default_value = "10")]
    precision: u32,

    /// What to decide when the store is unreachable
    #[structopt(long, possible_values = &["fail_open", "fail_closed"], default_value = "fail_open")]
    failure_policy: String,

    /// Simulation mode
    #[structopt(long, possible_values = &["burst", "steady", "sine_wave"], default_value = "burst")]
    simulation: String,

    /// Number of requests to simulate
    #[structopt(short = "n", long, default_value = "20")]
    num_requests: usize,

    /// Time between requests in milliseconds (steady and sine_wave modes)
    #[structopt(short = "t", long, default_value = "100")]
    request_interval_ms: u64,

    /// Verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Disable logs
    #[structopt(long)]
    disable_logs: bool,
}

/// One simulated request and what the limiter said
struct Sample {
    at: Duration,
    decision: Decision,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();

    let log_level = match (opt.disable_logs, opt.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "rate_limiter_cli={},distributed_rate_limiter={}",
            log_level, log_level
        )))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = limiter_config(&opt)?;
    info!(
        algorithm = config.algorithm.name(),
        storage = %opt.storage,
        "Starting rate limiter CLI"
    );

    let limiter = match opt.storage.as_str() {
        "memory" => RateLimiter::from_config(MemoryStorage::new(InMemoryConfig::default()), &config)?,
        "redis" => {
            let storage = match RedisStorage::new(RedisConfig::new(opt.redis_url.clone())).await {
                Ok(storage) => storage,
                Err(e) => {
                    error!("Failed to connect to Redis: {}", e);
                    return Err(e.into());
                }
            };
            RateLimiter::from_config(storage, &config)?
        }
        other => return Err(format!("Unknown storage backend: {}", other).into()),
    };

    let samples = run_simulation(&opt, &limiter).await?;
    print_report(&opt, &limiter, &samples);

    Ok(())
}

fn limiter_config(opt: &Opt) -> Result<RateLimiterConfig, Box<dyn std::error::Error>> {
    let window = Duration::from_millis(opt.window_ms);
    let interval = Duration::from_millis(opt.interval_ms);

    let algorithm = match opt.algorithm.as_str() {
        "fixed_window" => AlgorithmConfig::FixedWindow(FixedWindowConfig {
            window_size: window,
            max_requests: opt.max_requests,
        }),
        "sliding_window" => AlgorithmConfig::SlidingWindow(SlidingWindowConfig {
            window_size: window,
            max_requests: opt.max_requests,
            precision: opt.precision,
        }),
        "sliding_log" => AlgorithmConfig::SlidingLog(SlidingLogConfig {
            duration: window,
            max_requests: opt.max_requests,
        }),
        "leaky_bucket" => AlgorithmConfig::LeakyBucket(LeakyBucketConfig {
            leak_interval: interval,
            capacity: opt.max_requests,
        }),
        "token_bucket" => AlgorithmConfig::TokenBucket(TokenBucketConfig {
            refill_interval: interval,
            capacity: opt.max_requests,
        }),
        other => return Err(format!("Unknown algorithm: {}", other).into()),
    };

    let mut config = RateLimiterConfig::new(algorithm);
    config.key_prefix = "cli".to_string();
    config.failure_policy = match opt.failure_policy.as_str() {
        "fail_closed" => FailurePolicy::FailClosed,
        _ => FailurePolicy::FailOpen,
    };
    config.validate()?;
    Ok(config)
}

/// Delay before request `i`, or None for back to back requests
fn pacing(opt: &Opt, i: usize) -> Option<Duration> {
    let base = Duration::from_millis(opt.request_interval_ms);
    match opt.simulation.as_str() {
        "steady" => Some(base),
        "sine_wave" => {
            // One full cycle over the run, between 0.5x and 1.5x the base interval
            let phase = (i as f64 * std::f64::consts::PI * 2.0) / (opt.num_requests as f64);
            Some(base.mul_f64(1.0 + 0.5 * phase.sin()))
        }
        _ => None,
    }
}

async fn run_simulation(
    opt: &Opt,
    limiter: &RateLimiter,
) -> Result<Vec<Sample>, Box<dyn std::error::Error>> {
    info!(
        "Simulating {} {} requests for key: {}",
        opt.num_requests, opt.simulation, opt.key
    );

    let mut samples = Vec::with_capacity(opt.num_requests);
    let start_time = Instant::now();

    for i in 0..opt.num_requests {
        let request_time = Instant::now();
        let decision = limiter.check(&opt.key).await?;

        if decision.allowed {
            info!("Request {}: ALLOWED (remaining: {})", i + 1, decision.remaining);
        } else {
            warn!(
                "Request {}: DENIED (retry after: {}ms)",
                i + 1,
                decision.retry_after_ms
            );
        }
        samples.push(Sample {
            at: start_time.elapsed(),
            decision,
        });

        if let Some(interval) = pacing(opt, i) {
            let elapsed = request_time.elapsed();
            if elapsed < interval {
                time::sleep(interval - elapsed).await;
            }
        }
    }

    Ok(samples)
}

fn print_report(opt: &Opt, limiter: &RateLimiter, samples: &[Sample]) {
    let mut table = Table::new();
    table.set_titles(row!["#", "At (ms)", "Decision", "Remaining", "Retry after (ms)"]);

    for (i, sample) in samples.iter().enumerate() {
        let (label, style) = if sample.decision.allowed {
            ("ALLOWED", "Fg")
        } else {
            ("DENIED", "Fr")
        };
        table.add_row(Row::new(vec![
            Cell::new(&(i + 1).to_string()),
            Cell::new(&sample.at.as_millis().to_string()),
            Cell::new(label).style_spec(style),
            Cell::new(&sample.decision.remaining.to_string()),
            Cell::new(&sample.decision.retry_after_ms.to_string()),
        ]));
    }
    table.printstd();

    let allowed = samples.iter().filter(|s| s.decision.allowed).count();
    let elapsed = samples.last().map(|s| s.at).unwrap_or_default();

    let mut summary = Table::new();
    summary.add_row(row!["Algorithm", limiter.algorithm_name()]);
    summary.add_row(row!["Storage", opt.storage]);
    summary.add_row(row!["Limit", limiter.limit()]);
    summary.add_row(row!["Simulation", opt.simulation]);
    summary.add_row(row!["Total requests", samples.len()]);
    summary.add_row(row!["Allowed", allowed]);
    summary.add_row(row!["Denied", samples.len() - allowed]);
    summary.add_row(row!["Time elapsed", format!("{:?}", elapsed)]);
    summary.printstd();
}
