use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, RemoteConfig};
use gatekeeper::grpc::GrpcServer;
use gatekeeper::ratelimit::RateLimiter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Per-identity request admission service.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address for the gRPC server
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,

    /// Requests per second when neither the request nor an override sets one
    #[arg(long)]
    default_limit: Option<i64>,

    /// Admission algorithm (`sliding` or `leaky`)
    #[arg(long)]
    mode: Option<String>,

    /// JSON file mapping identities to limits
    #[arg(long)]
    overrides: Option<PathBuf>,

    /// Redis `host:port`; enables distributed decisions
    #[arg(long)]
    redis_addr: Option<String>,

    /// Redis password
    #[arg(long, env = "GATEKEEPER_REDIS_PASSWORD", hide_env_values = true)]
    redis_password: Option<String>,

    /// Redis logical database
    #[arg(long)]
    redis_db: Option<i64>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Cli {
    /// Fold command-line flags over the loaded configuration.
    fn apply(&self, config: &mut GatekeeperConfig) {
        if let Some(addr) = self.grpc_addr {
            config.server.grpc_addr = addr;
        }
        if let Some(limit) = self.default_limit {
            config.limits.default_limit = limit;
        }
        if let Some(mode) = &self.mode {
            config.limits.mode = mode.clone();
        }
        if let Some(path) = &self.overrides {
            config.limits.overrides_path = Some(path.display().to_string());
        }
        if let Some(address) = &self.redis_addr {
            config
                .remote
                .get_or_insert_with(|| RemoteConfig::new(address.clone()))
                .address = address.clone();
        }
        match config.remote.as_mut() {
            Some(remote) => {
                if let Some(password) = &self.redis_password {
                    remote.password = Some(password.clone());
                }
                if let Some(db) = self.redis_db {
                    remote.db = db;
                }
            }
            None => {
                for flag in self.redis_only_flags() {
                    warn!(flag = flag, "Ignoring Redis option without a Redis address");
                }
            }
        }
    }

    /// Redis connection flags that were given on the command line.
    fn redis_only_flags(&self) -> Vec<&'static str> {
        let mut flags = Vec::new();
        if self.redis_password.is_some() {
            flags.push("--redis-password");
        }
        if self.redis_db.is_some() {
            flags.push("--redis-db");
        }
        flags
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Gatekeeper admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config =
        GatekeeperConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    info!(
        grpc_addr = %config.server.grpc_addr,
        default_limit = config.limits.default_limit,
        "Configuration loaded"
    );

    let rate_limiter = Arc::new(RateLimiter::new());
    let mode = rate_limiter.set_mode(&config.limits.mode);
    info!(mode = %mode, "Admission algorithm selected");

    if let Some(path) = &config.limits.overrides_path {
        let applied = rate_limiter
            .load_overrides(path)
            .with_context(|| format!("Failed to load overrides from {}", path))?;
        info!(path = %path, applied = applied, "Limit overrides loaded");
    }

    if let Some(remote) = &config.remote {
        let distributed = remote
            .build_limiter()
            .context("Failed to configure remote store")?;
        rate_limiter.set_remote(Some(distributed));
        info!(remote = ?remote, "Distributed admission enabled");
    }

    let eviction = spawn_eviction(
        rate_limiter.clone(),
        Duration::from_secs(config.limits.eviction_interval_secs.max(1)),
    );

    let grpc_server = GrpcServer::new(
        config.server.grpc_addr,
        rate_limiter,
        config.limits.default_limit,
    );
    grpc_server.serve_with_shutdown(shutdown_signal()).await?;

    eviction.abort();
    info!("Gatekeeper admission service stopped");
    Ok(())
}

/// Periodically drop local state for identities that have gone quiet.
fn spawn_eviction(rate_limiter: Arc<RateLimiter>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = rate_limiter.evict_idle();
            if removed > 0 {
                info!(
                    removed = removed,
                    tracked = rate_limiter.tracked_identities(),
                    "Idle identities evicted"
                );
            }
        }
    })
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
