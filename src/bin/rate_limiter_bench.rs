// src/bin/rate_limiter_bench.rs

use dotenv::dotenv;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::sync::{Barrier, Semaphore};
use tracing::{error, info, warn};

use ratelimit_engine::config::{InMemoryConfig, RedisConfig};
use ratelimit_engine::{
    init_logging, MemoryStorage, RateLimiter, RateLimiterConfig, RedisStorage, StorageBackend,
    StrategyConfig, StrategyKind,
};

#[derive(Debug, Clone, StructOpt)]
#[structopt(
    name = "rate_limiter_bench",
    about = "A benchmarking tool for the rate limiting strategies"
)]
struct Opt {
    /// Strategy to benchmark
    #[structopt(short, long, possible_values = &["token_bucket", "fixed_window", "sliding_window", "sliding_window_counter", "concurrent", "all"], default_value = "all")]
    strategy: String,

    /// Storage backend to use
    #[structopt(long, possible_values = &["memory", "redis"], default_value = "memory")]
    storage: String,

    /// Redis URL (when using Redis storage)
    #[structopt(long, default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Cap per identifier
    #[structopt(short, long, default_value = "1000")]
    limit: u64,

    /// Window duration in seconds
    #[structopt(short, long, default_value = "60")]
    window_seconds: u64,

    /// Buckets per window for the sliding window counter
    #[structopt(long, default_value = "6")]
    sub_windows: u32,

    /// Number of concurrent users to simulate
    #[structopt(short = "u", long, default_value = "10")]
    num_users: usize,

    /// Number of requests per user
    #[structopt(short = "r", long, default_value = "100")]
    requests_per_user: usize,

    /// Share of requests sent to one identifier every user contends on
    #[structopt(long, default_value = "0.1")]
    hot_ratio: f64,

    /// Number of iterations to run
    #[structopt(short, long, default_value = "3")]
    iterations: usize,

    /// Maximum concurrency level
    #[structopt(short = "c", long, default_value = "100")]
    concurrency: usize,

    /// Seed for the traffic mix
    #[structopt(long, default_value = "7")]
    seed: u64,
}

impl Opt {
    fn strategies(&self) -> Result<Vec<StrategyKind>, Box<dyn std::error::Error>> {
        if self.strategy == "all" {
            return Ok(StrategyKind::ALL.to_vec());
        }
        Ok(vec![self.strategy.parse()?])
    }

    /// Most requests one identifier may be granted over `elapsed`, `None`
    /// where released slots make any count legitimate.
    fn allowed_ceiling(&self, kind: StrategyKind, elapsed: Duration) -> Option<u64> {
        let window_ms = (self.window_seconds * 1000).max(1);
        let windows = elapsed.as_millis() as u64 / window_ms;
        match kind {
            StrategyKind::TokenBucket => {
                let rate = self.limit as f64 / self.window_seconds.max(1) as f64;
                Some(self.limit + (rate * elapsed.as_secs_f64()).ceil() as u64)
            }
            // a run may straddle a window boundary
            StrategyKind::FixedWindow => Some(self.limit * (windows + 2)),
            StrategyKind::SlidingWindow => Some(self.limit * (windows + 1)),
            StrategyKind::SlidingWindowCounter => {
                let slack = self.limit / u64::from(self.sub_windows.max(1));
                Some((self.limit + slack) * (windows + 1))
            }
            StrategyKind::Concurrent => None,
        }
    }

    fn strategy_config(&self, kind: StrategyKind) -> StrategyConfig {
        let window = Duration::from_secs(self.window_seconds);
        match kind {
            StrategyKind::TokenBucket => StrategyConfig::token_bucket(
                self.limit,
                self.limit as f64 / self.window_seconds.max(1) as f64,
            ),
            StrategyKind::FixedWindow => StrategyConfig::fixed_window(self.limit, window),
            StrategyKind::SlidingWindow => StrategyConfig::sliding_window(self.limit, window),
            StrategyKind::SlidingWindowCounter => {
                StrategyConfig::sliding_window_counter(self.limit, window, self.sub_windows)
            }
            StrategyKind::Concurrent => StrategyConfig::concurrent(self.limit, window),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_logging();
    let opt = Opt::from_args();

    let config = RateLimiterConfig {
        key_prefix: "bench".to_string(),
        ..RateLimiterConfig::from_env()?
    };

    match opt.storage.as_str() {
        "memory" => {
            let storage = MemoryStorage::new(InMemoryConfig {
                // Large capacity for benchmarking
                max_entries: 100_000,
                ..InMemoryConfig::default()
            });
            let limiter = Arc::new(RateLimiter::new(Arc::new(storage), config));
            run_all(limiter, "Memory", &opt).await
        }
        "redis" => {
            let redis_config = RedisConfig {
                url: opt.redis_url.clone(),
                connection_timeout: Duration::from_secs(5),
            };
            let storage = match RedisStorage::new(redis_config).await {
                Ok(storage) => storage,
                Err(e) => {
                    error!("Failed to connect to Redis: {}", e);
                    return Err(e.into());
                }
            };
            let limiter = Arc::new(RateLimiter::new(Arc::new(storage), config));
            run_all(limiter, "Redis", &opt).await
        }
        other => Err(format!("Unknown storage backend: {}", other).into()),
    }
}

async fn run_all<S>(
    limiter: Arc<RateLimiter<S>>,
    backend: &str,
    opt: &Opt,
) -> Result<(), Box<dyn std::error::Error>>
where
    S: StorageBackend + 'static,
{
    for kind in opt.strategies()? {
        let strategy = opt.strategy_config(kind);
        strategy.validate()?;
        let name = format!("{} ({})", kind, backend);
        run_benchmark(Arc::clone(&limiter), strategy, &name, opt).await?;
    }
    Ok(())
}

#[derive(Debug, Default)]
struct UserRun {
    allowed: usize,
    /// Grants to the task's own identifier
    own_allowed: u64,
    /// Grants to the shared hot identifier
    hot_allowed: u64,
    denied: usize,
    degraded: usize,
    violations: usize,
    latencies: Vec<Duration>,
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

async fn run_benchmark<S>(
    limiter: Arc<RateLimiter<S>>,
    strategy: StrategyConfig,
    name: &str,
    opt: &Opt,
) -> Result<(), Box<dyn std::error::Error>>
where
    S: StorageBackend + 'static,
{
    println!("\nRunning benchmark: {}", name);
    println!("======================={}", "=".repeat(name.len()));

    let mut total_duration = Duration::ZERO;
    let mut total = UserRun::default();
    let strategy = Arc::new(strategy);

    for iteration in 0..opt.iterations {
        info!(iteration = iteration + 1, of = opt.iterations, "Starting iteration");

        // Every iteration starts from fresh state
        limiter.reset("hot_user", &strategy).await?;
        for i in 0..opt.num_users {
            limiter.reset(&format!("user_{}", i), &strategy).await?;
        }

        let start_time = Instant::now();
        let barrier = Arc::new(Barrier::new(opt.num_users));
        let semaphore = Arc::new(Semaphore::new(opt.concurrency));
        let mut handles = Vec::with_capacity(opt.num_users);

        for user_id in 0..opt.num_users {
            let limiter = Arc::clone(&limiter);
            let barrier = Arc::clone(&barrier);
            let semaphore = Arc::clone(&semaphore);
            let strategy = Arc::clone(&strategy);
            let own_key = format!("user_{}", user_id);
            let requests = opt.requests_per_user;
            let hot_ratio = opt.hot_ratio.clamp(0.0, 1.0);
            let stream = (iteration * opt.num_users + user_id) as u64;
            let mut rng = StdRng::seed_from_u64(opt.seed ^ stream);

            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let mut run = UserRun {
                    latencies: Vec::with_capacity(requests),
                    ..UserRun::default()
                };

                for _ in 0..requests {
                    let Ok(_permit) = semaphore.acquire().await else {
                        break;
                    };
                    let key = if rng.random_bool(hot_ratio) {
                        "hot_user"
                    } else {
                        own_key.as_str()
                    };

                    let started = Instant::now();
                    match limiter.check(key, &strategy).await {
                        Ok(decision) => {
                            run.latencies.push(started.elapsed());
                            if decision.error.is_some() {
                                run.degraded += 1;
                            }
                            if decision.allowed {
                                run.allowed += 1;
                                // grants under the failure policy are not charged
                                match (decision.error.is_none(), key == "hot_user") {
                                    (true, true) => run.hot_allowed += 1,
                                    (true, false) => run.own_allowed += 1,
                                    (false, _) => {}
                                }
                            } else {
                                run.denied += 1;
                            }
                            if let Some(request_id) = &decision.request_id {
                                // hold the slot briefly so concurrency limits are exercised
                                let hold = Duration::from_micros(rng.random_range(0..500));
                                tokio::time::sleep(hold).await;
                                if let Err(e) = limiter.release(key, request_id).await {
                                    warn!("Error releasing slot: {}", e);
                                }
                            }
                        }
                        Err(e) => warn!("Error in rate limiting: {}", e),
                    }
                }
                run
            }));
        }

        let results = futures::future::join_all(handles).await;

        let elapsed = start_time.elapsed();
        let ceiling = opt.allowed_ceiling(strategy.kind(), elapsed);
        let mut iteration_run = UserRun::default();
        for result in results {
            match result {
                Ok(run) => {
                    if let Some(ceiling) = ceiling {
                        if run.own_allowed > ceiling {
                            total.violations += 1;
                            error!(granted = run.own_allowed, ceiling, "Identifier exceeded its cap");
                        }
                    }
                    iteration_run.hot_allowed += run.hot_allowed;
                    iteration_run.allowed += run.allowed;
                    iteration_run.denied += run.denied;
                    iteration_run.degraded += run.degraded;
                    iteration_run.latencies.extend(run.latencies);
                }
                Err(e) => error!("Benchmark task failed: {}", e),
            }
        }

        if let Some(ceiling) = ceiling {
            if iteration_run.hot_allowed > ceiling {
                total.violations += 1;
                error!(granted = iteration_run.hot_allowed, ceiling, "Hot identifier exceeded its cap");
            }
        }
        total_duration += elapsed;

        let requests = iteration_run.allowed + iteration_run.denied;
        println!(
            "Iteration {}: {:?}, {} allowed, {} denied, {:.2} req/sec",
            iteration + 1,
            elapsed,
            iteration_run.allowed,
            iteration_run.denied,
            requests as f64 / elapsed.as_secs_f64()
        );

        total.allowed += iteration_run.allowed;
        total.denied += iteration_run.denied;
        total.degraded += iteration_run.degraded;
        total.latencies.extend(iteration_run.latencies);
    }

    let total_requests = total.allowed + total.denied;
    if total_requests == 0 || opt.iterations == 0 {
        println!("No requests completed");
        return Ok(());
    }
    total.latencies.sort_unstable();

    println!("\nBenchmark Results for {}:", name);
    println!("  Total Requests:     {}", total_requests);
    println!(
        "  Allowed:            {} ({:.1}%)",
        total.allowed,
        100.0 * total.allowed as f64 / total_requests as f64
    );
    println!(
        "  Denied:             {} ({:.1}%)",
        total.denied,
        100.0 * total.denied as f64 / total_requests as f64
    );
    println!("  Failure policy:     {}", total.degraded);
    match total.violations {
        0 => println!("  Cap check:          ok"),
        n => println!("  Cap check:          {} identifiers over their cap", n),
    }
    println!("  Avg. Duration:      {:?}", total_duration / opt.iterations as u32);
    println!(
        "  Avg. Throughput:    {:.2} requests/second",
        total_requests as f64 / total_duration.as_secs_f64()
    );
    println!(
        "  Latency p50/p99:    {:?} / {:?}",
        percentile(&total.latencies, 0.50),
        percentile(&total.latencies, 0.99)
    );

    Ok(())
}
