use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bucketgate::config::BucketgateConfig;
use bucketgate::harness::{self, TrafficConfig, TrafficReport};
use bucketgate::ratelimit::{DistributedRateLimiter, LocalRateLimiter, RateLimiterBackend};
use bucketgate::store::{MemoryStore, RedisStore};

/// Drive synthetic keyed traffic through token bucket limiters.
#[derive(Parser, Debug)]
#[command(name = "bucketgate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where buckets live
    #[arg(long, value_enum, default_value_t = Backend::Local)]
    backend: Backend,

    /// Tokens added per second (overrides the file)
    #[arg(long)]
    rate: Option<u32>,

    /// Bucket capacity (overrides the file)
    #[arg(long)]
    capacity: Option<u32>,

    /// Redis URL (overrides the file)
    #[arg(long)]
    redis_url: Option<String>,

    /// Number of distinct keys
    #[arg(long, default_value_t = 5)]
    keys: usize,

    /// Number of limiter instances calling every key
    #[arg(long, default_value_t = 3)]
    instances: usize,

    /// Milliseconds between calls for one key from one instance
    #[arg(long, default_value_t = 10)]
    interval_ms: u64,

    /// How long to run
    #[arg(long, default_value_t = 5)]
    duration_secs: u64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// A separate in-process limiter per instance
    Local,
    /// Instances share one in-process store
    Memory,
    /// Instances share buckets in Redis
    Redis,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    info!("Starting Bucketgate traffic run");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli)?;
    info!(
        backend = ?cli.backend,
        rate = config.bucket.rate,
        capacity = config.bucket.capacity,
        "Configuration loaded"
    );

    let instances = build_instances(&cli, &config).await?;
    let traffic = TrafficConfig {
        keys: TrafficConfig::numbered_keys(cli.keys),
        interval: Duration::from_millis(cli.interval_ms),
        duration: Duration::from_secs(cli.duration_secs),
    };

    let report = tokio::select! {
        report = harness::drive(&instances, &traffic) => report?,
        _ = shutdown_signal() => {
            info!("Traffic run interrupted");
            return Ok(());
        }
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    info!("Bucketgate traffic run finished");
    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<BucketgateConfig> {
    let mut config = match &cli.config {
        Some(path) => BucketgateConfig::from_file(path)?,
        None => BucketgateConfig::default(),
    };

    if let Some(rate) = cli.rate {
        config.bucket.rate = rate;
    }
    if let Some(capacity) = cli.capacity {
        config.bucket.capacity = capacity;
    }
    if let Some(url) = &cli.redis_url {
        config.store.url = url.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn build_instances(
    cli: &Cli,
    config: &BucketgateConfig,
) -> anyhow::Result<Vec<Arc<dyn RateLimiterBackend>>> {
    let rate = config.bucket.rate;
    let capacity = config.bucket.capacity;
    let mut instances: Vec<Arc<dyn RateLimiterBackend>> = Vec::with_capacity(cli.instances);

    match cli.backend {
        Backend::Local => {
            for _ in 0..cli.instances {
                let limiter = Arc::new(LocalRateLimiter::from_config(&config.bucket)?);
                if let Some(interval) = config.local.idle_sweep_interval() {
                    limiter.spawn_idle_sweeper(interval);
                }
                instances.push(limiter);
            }
        }
        Backend::Memory => {
            let store = Arc::new(MemoryStore::new());
            for _ in 0..cli.instances {
                let limiter = DistributedRateLimiter::new(store.clone(), rate, capacity)?
                    .with_key_prefix(config.store.key_prefix.clone());
                instances.push(Arc::new(limiter));
            }
        }
        Backend::Redis => {
            // A fresh namespace per run keeps earlier runs from skewing this one.
            let run_id = uuid::Uuid::new_v4().simple().to_string();
            let prefix = format!("{}{}:", config.store.key_prefix, run_id);
            info!(run_id = %run_id, "Using Redis bucket store");

            let store = Arc::new(RedisStore::connect(&config.store).await?);
            for _ in 0..cli.instances {
                let limiter = DistributedRateLimiter::new(store.clone(), rate, capacity)?
                    .with_key_prefix(prefix.clone());
                instances.push(Arc::new(limiter));
            }
        }
    }

    Ok(instances)
}

fn print_report(report: &TrafficReport) {
    println!(
        "{} instance(s), {:.2}s",
        report.instances, report.elapsed_secs
    );
    println!("{:<12} {:>10} {:>10} {:>10}", "KEY", "ALLOWED", "DENIED", "RATE/s");
    for key in &report.keys {
        println!(
            "{:<12} {:>10} {:>10} {:>10.2}",
            key.key, key.allowed, key.denied, key.allowed_per_sec
        );
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
