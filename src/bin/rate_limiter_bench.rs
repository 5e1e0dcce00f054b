// src/bin/rate_limiter_bench.rs

use indicatif::{ProgressBar, ProgressStyle};
use prettytable::{row, Table};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::sync::{Barrier, Semaphore};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use distributed_rate_limiter::config::{
    AlgorithmConfig, FailurePolicy, FixedWindowConfig, InMemoryConfig, LeakyBucketConfig,
    RateLimiterConfig, RedisConfig, SlidingLogConfig, SlidingWindowConfig, TokenBucketConfig,
};
use distributed_rate_limiter::storage::{MemoryStorage, RedisStorage};
use distributed_rate_limiter::RateLimiter;

const ALGORITHMS: [&str; 5] = [
    "fixed_window",
    "sliding_window",
    "sliding_log",
    "leaky_bucket",
    "token_bucket",
];

#[derive(Debug, Clone, StructOpt)]
#[structopt(
    name = "rate_limiter_bench",
    about = "Hammers the limiter from many tasks and checks nobody got more than the limit"
)]
struct Opt {
    /// Rate limiting algorithm to benchmark
    #[structopt(short, long, possible_values = &["fixed_window", "sliding_window", "sliding_log", "leaky_bucket", "token_bucket", "all"], default_value = "all")]
    algorithm: String,

    /// Storage backend to use
    #[structopt(short, long, possible_values = &["memory", "redis"], default_value = "memory")]
    storage: String,

    /// Redis URL (when using Redis storage)
    #[structopt(long, default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Independent limiters sharing the store, standing in for separate processes
    #[structopt(long, default_value = "4")]
    processes: usize,

    /// Maximum requests per window, or bucket capacity
    #[structopt(short, long, default_value = "100")]
    max_requests: u64,

    /// Window length in milliseconds; bucket intervals are window / max_requests
    #[structopt(short, long, default_value = "60000")]
    window_ms: u64,

    /// Buckets per window for the sliding window counter
    #[structopt(short, long, default_value = "10")]
    precision: u32,

    /// Number of concurrent users to simulate
    #[structopt(short = "u", long, default_value = "10")]
    num_users: usize,

    /// Number of requests per user
    #[structopt(short = "r", long, default_value = "500")]
    requests_per_user: usize,

    /// Maximum number of checks in flight
    #[structopt(short = "c", long, default_value = "100")]
    concurrency: usize,

    /// Verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Disable logs
    #[structopt(long)]
    disable_logs: bool,
}

/// Outcome of one algorithm run
struct BenchResult {
    algorithm: &'static str,
    elapsed: Duration,
    allowed: u64,
    denied: u64,
    errors: u64,
    worst_user: u64,
    ceiling: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();

    let log_level = match (opt.disable_logs, opt.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        _ => "debug",
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "rate_limiter_bench={},distributed_rate_limiter={}",
            log_level, log_level
        )))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })?;
    }

    let algorithms: Vec<&'static str> = if opt.algorithm == "all" {
        ALGORITHMS.to_vec()
    } else {
        ALGORITHMS
            .iter()
            .copied()
            .filter(|name| *name == opt.algorithm)
            .collect()
    };

    let mut results = Vec::with_capacity(algorithms.len());
    for algorithm in algorithms {
        if stop.load(Ordering::SeqCst) {
            warn!("Interrupted, skipping remaining algorithms");
            break;
        }

        let config = limiter_config(algorithm, &opt)?;
        let limiters = build_limiters(&config, &opt).await?;
        results.push(run_benchmark(algorithm, &limiters, &opt, Arc::clone(&stop)).await?);
    }

    print_results(&opt, &results);

    if results.iter().any(|r| r.worst_user > r.ceiling) {
        return Err("a client was admitted more often than its limit allows".into());
    }
    Ok(())
}

fn limiter_config(
    algorithm: &str,
    opt: &Opt,
) -> Result<RateLimiterConfig, Box<dyn std::error::Error>> {
    let window = Duration::from_millis(opt.window_ms);
    // Bucket algorithms sustain the same average rate as the window ones
    let interval = Duration::from_millis((opt.window_ms / opt.max_requests.max(1)).max(1));

    let algorithm = match algorithm {
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
    config.key_prefix = format!("bench:{}", uuid::Uuid::new_v4());
    // Errors must show up in the report instead of turning into admissions
    config.failure_policy = FailurePolicy::FailClosed;
    config.timeout = Duration::from_secs(2);
    config.validate()?;
    Ok(config)
}

/// One limiter per simulated process, all over the same store
async fn build_limiters(
    config: &RateLimiterConfig,
    opt: &Opt,
) -> Result<Vec<RateLimiter>, Box<dyn std::error::Error>> {
    let processes = opt.processes.max(1);
    let mut limiters = Vec::with_capacity(processes);

    match opt.storage.as_str() {
        "memory" => {
            let storage = MemoryStorage::new(InMemoryConfig {
                max_entries: 100_000, // Large capacity for benchmarking
                ..InMemoryConfig::default()
            });
            for _ in 0..processes {
                limiters.push(RateLimiter::from_config(storage.clone(), config)?);
            }
        }
        "redis" => {
            for _ in 0..processes {
                let mut redis_config = RedisConfig::new(opt.redis_url.clone());
                redis_config.connection_timeout = Duration::from_secs(5);
                let storage = match RedisStorage::new(redis_config).await {
                    Ok(storage) => storage,
                    Err(e) => {
                        error!("Failed to connect to Redis: {}", e);
                        return Err(e.into());
                    }
                };
                limiters.push(RateLimiter::from_config(storage, config)?);
            }
        }
        other => return Err(format!("Unknown storage backend: {}", other).into()),
    }

    Ok(limiters)
}

/// Most admissions a single client may legitimately get in `elapsed`
fn admission_ceiling(algorithm: &str, opt: &Opt, elapsed: Duration) -> u64 {
    let limit = opt.max_requests;
    let elapsed_ms = elapsed.as_millis() as u64;
    let windows = elapsed_ms / opt.window_ms.max(1) + 1;

    match algorithm {
        // A run can straddle a window boundary
        "fixed_window" => limit * (windows + 1),
        "sliding_window" | "sliding_log" => limit * windows,
        _ => {
            let interval = (opt.window_ms / limit.max(1)).max(1);
            limit + elapsed_ms / interval + 1
        }
    }
}

async fn run_benchmark(
    algorithm: &'static str,
    limiters: &[RateLimiter],
    opt: &Opt,
    stop: Arc<AtomicBool>,
) -> Result<BenchResult, Box<dyn std::error::Error>> {
    let total = (opt.num_users * opt.requests_per_user) as u64;
    let progress = ProgressBar::new(total);
    progress.set_style(
        ProgressStyle::with_template(
            "{prefix:>15} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({per_sec})",
        )?
        .progress_chars("=> "),
    );
    progress.set_prefix(algorithm);

    let barrier = Arc::new(Barrier::new(opt.num_users));
    let semaphore = Arc::new(Semaphore::new(opt.concurrency.max(1)));
    let start_time = Instant::now();

    let handles: Vec<_> = (0..opt.num_users)
        .map(|user_id| {
            let barrier = Arc::clone(&barrier);
            let semaphore = Arc::clone(&semaphore);
            let stop = Arc::clone(&stop);
            let progress = progress.clone();
            let limiters = limiters.to_vec();
            let key = format!("user_{}", user_id);
            let requests_per_user = opt.requests_per_user;

            tokio::spawn(async move {
                barrier.wait().await;

                let (mut allowed, mut denied, mut errors) = (0u64, 0u64, 0u64);
                for i in 0..requests_per_user {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let _permit = match semaphore.acquire().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    // Spread each client's requests over every process
                    let limiter = &limiters[(user_id + i) % limiters.len()];
                    match limiter.check(&key).await {
                        Ok(decision) if decision.allowed => allowed += 1,
                        Ok(_) => denied += 1,
                        Err(e) => {
                            errors += 1;
                            warn!("Error in rate limiting: {}", e);
                        }
                    }
                    progress.inc(1);
                }
                (allowed, denied, errors)
            })
        })
        .collect();

    let mut result = BenchResult {
        algorithm,
        elapsed: Duration::ZERO,
        allowed: 0,
        denied: 0,
        errors: 0,
        worst_user: 0,
        ceiling: 0,
    };

    for joined in futures::future::join_all(handles).await {
        match joined {
            Ok((allowed, denied, errors)) => {
                result.allowed += allowed;
                result.denied += denied;
                result.errors += errors;
                result.worst_user = result.worst_user.max(allowed);
            }
            Err(e) => error!("Benchmark task failed: {}", e),
        }
    }

    result.elapsed = start_time.elapsed();
    result.ceiling = admission_ceiling(algorithm, opt, result.elapsed);
    progress.finish_and_clear();

    info!(
        algorithm,
        allowed = result.allowed,
        denied = result.denied,
        errors = result.errors,
        "Benchmark finished"
    );

    for user_id in 0..opt.num_users {
        if let Some(limiter) = limiters.first() {
            limiter.reset(&format!("user_{}", user_id)).await?;
        }
    }

    Ok(result)
}

fn print_results(opt: &Opt, results: &[BenchResult]) {
    let mut table = Table::new();
    table.set_titles(row![
        "Algorithm",
        "Storage",
        "Elapsed",
        "Allowed",
        "Denied",
        "Errors",
        "Req/sec",
        "Max per user",
        "Ceiling",
        "Verdict"
    ]);

    for r in results {
        let total = r.allowed + r.denied + r.errors;
        let per_sec = total as f64 / r.elapsed.as_secs_f64().max(f64::EPSILON);
        let verdict = if r.worst_user <= r.ceiling {
            "OK"
        } else {
            "OVER LIMIT"
        };
        table.add_row(row![
            r.algorithm,
            opt.storage,
            format!("{:.2?}", r.elapsed),
            r.allowed,
            r.denied,
            r.errors,
            format!("{:.0}", per_sec),
            r.worst_user,
            r.ceiling,
            verdict
        ]);
    }

    table.printstd();
}
