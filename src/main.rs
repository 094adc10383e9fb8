use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use quotaguard::config::{EngineConfig, LoggingConfig, StoreBackend};
use quotaguard::metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};
use quotaguard::policy::{FilePolicySource, PolicyCache, PolicyDocument};
use quotaguard::store::{CounterStore, MemoryCounterStore, RedisCounterStore, RedisStoreConfig};
use quotaguard::{CheckRequest, RateLimitChecker};

#[derive(Parser, Debug)]
#[command(name = "quotaguard", version, about = "Distributed rate limiting decision engine")]
struct Cli {
    /// Engine configuration file (YAML or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decide one request, or a stream of JSON requests read from stdin
    Check(CheckArgs),
    /// Validate a policy document
    Validate {
        /// Policy document to validate
        policies: PathBuf,
    },
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Policy document; overrides `policies_path` from the configuration
    #[arg(short, long)]
    policies: Option<PathBuf>,

    #[arg(long, required_unless_present = "stdin")]
    client: Option<String>,

    #[arg(long, required_unless_present = "stdin")]
    endpoint: Option<String>,

    #[arg(long)]
    tenant: Option<String>,

    #[arg(long)]
    api_key: Option<String>,

    #[arg(long, default_value_t = 1)]
    cost: u64,

    /// Send the same request this many times, concurrently
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Read newline-delimited JSON requests from stdin until EOF or Ctrl+C
    #[arg(long)]
    stdin: bool,

    /// Print Prometheus metrics after the decisions
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Validate { policies } => {
            init_tracing(&LoggingConfig::default());
            validate(&policies)
        }
        Command::Check(args) => {
            let config = EngineConfig::load(cli.config.as_deref())
                .context("Failed to load engine configuration")?;
            init_tracing(&config.logging);
            check(config, args).await
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let document = PolicyDocument::from_file(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut invalid = 0;
    for policy in &document.policies {
        match policy.validate() {
            Ok(()) => println!(
                "ok       {:<24} {:<16} {:?}",
                policy.id,
                policy.algorithm,
                policy.specificity()
            ),
            Err(e) => {
                invalid += 1;
                println!("invalid  {:<24} {}", policy.id, e);
            }
        }
    }

    if invalid > 0 {
        bail!("{} of {} policies are invalid", invalid, document.policies.len());
    }
    info!(count = document.policies.len(), "All policies valid");
    Ok(())
}

async fn check(config: EngineConfig, args: CheckArgs) -> anyhow::Result<()> {
    let Some(policies_path) = args.policies.clone().or_else(|| config.policies_path.clone())
    else {
        bail!("No policy document: pass --policies or set policies_path");
    };

    let store = connect_store(&config).await?;
    let cache = Arc::new(PolicyCache::new(
        Arc::new(FilePolicySource::new(policies_path)),
        config.cache.ttl(),
    ));
    let _expiry = cache.spawn_expiry(config.cache.ttl());

    let prometheus = if args.metrics {
        Some(Arc::new(PrometheusMetrics::new()?))
    } else {
        None
    };
    let sink: Arc<dyn MetricsSink> = match &prometheus {
        Some(metrics) => metrics.clone(),
        None => Arc::new(NoopMetrics),
    };
    let checker = RateLimitChecker::new(config, cache, store).with_metrics(sink);

    if args.stdin {
        tokio::select! {
            result = check_stream(&checker) => result?,
            _ = shutdown_signal() => {}
        }
    } else {
        let mut request = CheckRequest::new(
            args.client.unwrap_or_default(),
            args.endpoint.unwrap_or_default(),
        )
        .with_cost(args.cost);
        request.tenant_id = args.tenant;
        request.api_key = args.api_key;

        // Repeats race each other like concurrent callers would
        let responses =
            futures::future::join_all((0..args.repeat).map(|_| checker.check(&request))).await;
        for response in responses {
            println!("{}", serde_json::to_string(&response?)?);
        }
    }

    if let Some(metrics) = prometheus {
        print!("{}", metrics.encode_text()?);
    }
    Ok(())
}

async fn connect_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryCounterStore::new()),
        StoreBackend::Redis => {
            let settings = RedisStoreConfig {
                url: config.store.redis_url.clone(),
                max_connections: config.store.max_connections,
            };
            Arc::new(
                RedisCounterStore::connect(&settings)
                    .await
                    .context("Failed to connect to Redis")?,
            )
        }
    };
    info!(backend = store.backend(), "Counter store initialized");
    Ok(store)
}

/// Decide every JSON request on stdin, one response line per request.
async fn check_stream(checker: &RateLimitChecker) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: CheckRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Skipping malformed request");
                continue;
            }
        };
        match checker.check(&request).await {
            Ok(response) => println!("{}", serde_json::to_string(&response)?),
            Err(e) => error!(error = %e, client_id = %request.client_id, "Check failed"),
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
