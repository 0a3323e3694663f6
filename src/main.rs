use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ratekeeper::config::{RatekeeperConfig, StoreBackend};
use ratekeeper::gate::{GateServer, GateState, IdentityResolver};
use ratekeeper::ratelimit::RateLimiter;
use ratekeeper::store::{CounterStore, MemoryStore, RedisStore, RedisStoreConfig};

/// Per-client HTTP rate limiter.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "RATEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Ratekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = RatekeeperConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(listen_addr = %config.server.listen_addr, backend = ?config.store.backend, "Configuration loaded");

    let registry = config.registry()?;
    let address_scope = registry.address_scope();
    info!(
        limit = address_scope.request_limit(),
        window = ?address_scope.window(),
        block = ?address_scope.block_duration(),
        tokens = registry.token_count(),
        "Rate limit scopes loaded"
    );

    let store = open_store(&config).await?;
    let limiter = Arc::new(RateLimiter::new(store, registry));
    let resolver = IdentityResolver::new(
        &config.server.token_header,
        config.server.trust_forwarded_headers,
    )?;

    let server = GateServer::new(
        config.server.listen_addr,
        GateState::new(Arc::clone(&limiter), resolver),
    );
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    if let Err(e) = limiter.close().await {
        error!(error = %e, "Failed to close counter store");
    }
    served?;

    info!("Ratekeeper stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Open the configured counter store.
///
/// The memory store gets a background task that purges expired records.
async fn open_store(config: &RatekeeperConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            spawn_purge_task(Arc::clone(&store), config.store.purge_interval);
            info!("Using in-memory counter store");
            Ok(store as Arc<dyn CounterStore>)
        }
        StoreBackend::Redis => {
            let settings = &config.store.redis;
            let store = RedisStore::connect_with_config(
                &settings.url(),
                RedisStoreConfig {
                    key_prefix: settings.key_prefix.clone(),
                    timeout: settings.timeout,
                },
            )
            .await?;
            info!(addr = %settings.addr, db = settings.db, "Using Redis counter store");
            Ok(Arc::new(store) as Arc<dyn CounterStore>)
        }
    }
}

fn spawn_purge_task(store: Arc<MemoryStore>, interval: Duration) {
    if interval.is_zero() {
        info!("Expired record purging disabled");
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            store.purge_expired();
        }
    });
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
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
