// src/bin/rate_limiter_cli.rs

use chrono::{DateTime, SecondsFormat};
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::time;
use tracing::{error, info, warn};

use ratelimit_engine::config::{InMemoryConfig, RedisConfig};
use ratelimit_engine::{
    init_logging, Decision, MemoryStorage, RateLimiter, RateLimiterConfig, RedisStorage,
    StorageBackend, StrategyConfig, StrategyKind,
};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "rate_limiter_cli",
    about = "Drive the rate limiting engine with simulated traffic"
)]
struct Opt {
    /// Strategy to evaluate
    #[structopt(short, long, possible_values = &["token_bucket", "fixed_window", "sliding_window", "sliding_window_counter", "concurrent"], default_value = "fixed_window")]
    strategy: String,

    /// Identifier being limited
    #[structopt(short, long, default_value = "default_user")]
    identifier: String,

    /// Cap: requests per window, bucket capacity or concurrent slots
    #[structopt(short, long, default_value = "10")]
    limit: u64,

    /// Window length, or slot timeout for `concurrent`, in milliseconds
    #[structopt(short, long, default_value = "60000")]
    window_ms: u64,

    /// Buckets per window for `sliding_window_counter`
    #[structopt(long, default_value = "6")]
    sub_windows: u32,

    /// Tokens restored per second for `token_bucket`
    #[structopt(long, default_value = "1.0")]
    refill_rate: f64,

    /// JSON file holding an array of strategy configs, checked as tiers.
    /// Overrides the single-strategy options.
    #[structopt(long, parse(from_os_str))]
    tiers: Option<PathBuf>,

    /// Grant the identifier a bypass of this many seconds before starting
    #[structopt(long)]
    bypass_secs: Option<u64>,

    /// Keep concurrency slots instead of releasing them after each request
    #[structopt(long)]
    hold_slots: bool,

    /// Use the Redis store at REDIS_URL instead of process memory
    #[structopt(long)]
    redis: bool,

    /// Simulation mode
    #[structopt(long, possible_values = &["burst", "steady", "sine_wave"], default_value = "burst")]
    simulation: String,

    /// Number of requests to simulate
    #[structopt(short = "n", long, default_value = "20")]
    num_requests: usize,

    /// Time between requests in milliseconds (steady and sine_wave modes)
    #[structopt(short = "t", long, default_value = "100")]
    request_interval_ms: u64,

    /// Verbosity level, used when RUST_LOG is unset
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Print per-request decisions as JSON
    #[structopt(long)]
    json: bool,
}

impl Opt {
    fn strategy_config(&self) -> Result<StrategyConfig, Box<dyn std::error::Error>> {
        let window = Duration::from_millis(self.window_ms);
        let config = match self.strategy.parse::<StrategyKind>()? {
            StrategyKind::TokenBucket => StrategyConfig::token_bucket(self.limit, self.refill_rate),
            StrategyKind::FixedWindow => StrategyConfig::fixed_window(self.limit, window),
            StrategyKind::SlidingWindow => StrategyConfig::sliding_window(self.limit, window),
            StrategyKind::SlidingWindowCounter => {
                StrategyConfig::sliding_window_counter(self.limit, window, self.sub_windows)
            }
            StrategyKind::Concurrent => StrategyConfig::concurrent(self.limit, window),
        };
        config.validate()?;
        Ok(config)
    }

    fn tier_configs(&self) -> Result<Vec<StrategyConfig>, Box<dyn std::error::Error>> {
        let Some(path) = &self.tiers else {
            return Ok(vec![self.strategy_config()?]);
        };
        let raw = std::fs::read_to_string(path)?;
        let values: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
        let configs = values
            .into_iter()
            .map(StrategyConfig::from_value)
            .collect::<ratelimit_engine::Result<Vec<_>>>()?;
        Ok(configs)
    }

    fn interval(&self, request: usize) -> Duration {
        let base = Duration::from_millis(self.request_interval_ms);
        match self.simulation.as_str() {
            "sine_wave" => {
                // Full cycle over the run, between 0.5x and 1.5x the base interval
                let phase =
                    (request as f64 * std::f64::consts::PI * 2.0) / (self.num_requests as f64);
                base.mul_f64(1.0 + 0.5 * phase.sin())
            }
            "steady" => base,
            _ => Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    allowed: usize,
    denied: usize,
    bypassed: usize,
    degraded: usize,
}

impl Tally {
    fn record(&mut self, decision: &Decision) {
        if decision.allowed {
            self.allowed += 1;
        } else {
            self.denied += 1;
        }
        if decision.bypassed {
            self.bypassed += 1;
        }
        if decision.error.is_some() {
            self.degraded += 1;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let opt = Opt::from_args();

    if std::env::var_os("RUST_LOG").is_none() {
        let level = match opt.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", format!("rate_limiter_cli={level},ratelimit_engine={level}"));
    }
    init_logging();

    let config = RateLimiterConfig::from_env()?;
    let tiers = opt.tier_configs()?;

    if opt.redis {
        let storage = RedisStorage::new(RedisConfig::from_env()).await?;
        storage.ping().await?;
        info!("Connected to Redis store");
        run(&opt, RateLimiter::new(Arc::new(storage), config), &tiers).await
    } else {
        let storage = MemoryStorage::new(InMemoryConfig::default());
        run(&opt, RateLimiter::new(Arc::new(storage), config), &tiers).await
    }
}

async fn run<S>(
    opt: &Opt,
    limiter: RateLimiter<S>,
    tiers: &[StrategyConfig],
) -> Result<(), Box<dyn std::error::Error>>
where
    S: StorageBackend,
{
    if let Some(secs) = opt.bypass_secs {
        let record = limiter
            .create_bypass(
                &opt.identifier,
                Duration::from_secs(secs),
                "granted from the command line",
                "rate_limiter_cli",
            )
            .await?;
        info!(expires_at = ?record.expires_at_utc(), "Bypass granted");
    }

    info!(
        identifier = %opt.identifier,
        tiers = tiers.len(),
        simulation = %opt.simulation,
        "Starting simulation"
    );

    let mut tally = Tally::default();
    let mut exceeded: Vec<String> = Vec::new();
    let mut next_reset: Option<u64> = None;
    let start_time = Instant::now();

    for i in 0..opt.num_requests {
        let request_time = Instant::now();

        let outcome = limiter.check_multi_tier(&opt.identifier, tiers).await?;
        let Some(last) = outcome.results.last() else {
            error!("Multi-tier check returned no decisions");
            break;
        };
        tally.record(last);
        next_reset = Some(last.reset_time);
        if let Some(tier) = outcome.exceeded_tier.clone() {
            exceeded.push(tier);
        }

        if opt.json {
            println!("{}", serde_json::to_string(&outcome)?);
        } else if outcome.allowed {
            println!("Request {}: ALLOWED (remaining: {})", i + 1, last.remaining);
        } else {
            println!(
                "Request {}: DENIED by {} (retry after {:?})",
                i + 1,
                outcome.exceeded_tier.as_deref().unwrap_or("?"),
                last.retry_after()
            );
        }

        if !opt.hold_slots {
            release_slots(&limiter, &opt.identifier, &outcome.results).await;
        }

        let interval = opt.interval(i);
        let elapsed = request_time.elapsed();
        if elapsed < interval {
            time::sleep(interval - elapsed).await;
        }
    }

    let elapsed = start_time.elapsed();

    println!("\nSimulation Results ({}):", opt.simulation);
    println!("--------------------------");
    println!("Total requests: {}", opt.num_requests);
    println!("Allowed: {}", tally.allowed);
    println!("Denied: {}", tally.denied);
    println!("Bypassed: {}", tally.bypassed);
    println!("Resolved by failure policy: {}", tally.degraded);
    if !exceeded.is_empty() {
        exceeded.sort();
        exceeded.dedup();
        println!("Exceeded tiers: {}", exceeded.join(", "));
    }
    if let Some(at) = next_reset
        .and_then(|ms| i64::try_from(ms).ok())
        .and_then(DateTime::from_timestamp_millis)
    {
        println!("Next reset: {}", at.to_rfc3339_opts(SecondsFormat::Millis, true));
    }
    println!("Time elapsed: {:?}", elapsed);

    Ok(())
}

async fn release_slots<S>(limiter: &RateLimiter<S>, identifier: &str, decisions: &[Decision])
where
    S: StorageBackend,
{
    for decision in decisions {
        let Some(request_id) = &decision.request_id else {
            continue;
        };
        if let Err(e) = limiter.release(identifier, request_id).await {
            warn!(request_id = %request_id, error = %e, "Could not release slot");
        }
    }
}
