use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;

use realtime_hub::config::ServerConfig;
use realtime_hub::core::dispatcher::{NotificationHub, SharedHub};
use realtime_hub::core::rate_limiter::MultiTierRateLimiter;
use realtime_hub::handlers::routes;
use realtime_hub::storage::MemoryCounterStore;

#[tokio::main]
async fn main() {
    // Initialize env
    let dotenv = dotenvy::dotenv();

    // Initialize logging
    env_logger::init();

    match dotenv {
        Ok(path) => info!("Environment variables loaded from {}", path.display()),
        Err(e) => warn!("Failed to load .env file: {}", e),
    };

    // Load config from the environment
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Configuration: host={}, port={}, trust_identity_header={}, rate_limiting={}",
        config.host, config.port, config.trust_identity_header, config.rate_limiting_enabled
    );

    let hub: SharedHub = Arc::new(NotificationHub::with_mailbox_capacity(config.mailbox_capacity));
    hub.clone()
        .start_reaper_task(config.reaper_interval, config.idle_timeout);

    let limiter = if config.rate_limiting_enabled {
        let store = Arc::new(MemoryCounterStore::new());
        store.clone().start_purge_task(config.counter_purge_interval);
        Some(Arc::new(MultiTierRateLimiter::new(
            config.rate_limit_config(),
            store,
        )))
    } else {
        warn!("Rate limiting is disabled");
        None
    };

    let routes = routes(hub, limiter, &config);

    // Build the server address
    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse server address: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
    };

    if config.enable_tls {
        if let (Some(cert_path), Some(key_path)) = (&config.tls_cert_path, &config.tls_key_path) {
            info!("Starting realtime hub on https://{}", addr);
            let (_, server) = warp::serve(routes)
                .tls()
                .cert_path(cert_path)
                .key_path(key_path)
                .bind_with_graceful_shutdown(addr, shutdown);
            server.await;
            return;
        }
    }

    match warp::serve(routes).try_bind_with_graceful_shutdown(addr, shutdown) {
        Ok((bound, server)) => {
            info!("Starting realtime hub on {}", bound);
            server.await;
        }
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    }
}
