use gateway_cache::{CacheStore, MemoryStore};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use review_gateway::config::{self, Config};
use review_gateway::server::{app_router, metrics_router, AppState, ReviewsRoute};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config_path = PathBuf::from("config.toml");
    let config = match Config::load_or_default(&config_path) {
        Ok(c) => c.with_env(),
        Err(e) => {
            tracing::error!(error = %e, "failed to load config.toml, refusing to start");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration, refusing to start");
        return ExitCode::FAILURE;
    }

    let prom_handle = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()
    {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "failed to install prometheus recorder");
            return ExitCode::FAILURE;
        }
    };

    // Process-wide store shared by every route
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(config.cache.capacity));

    let route = match ReviewsRoute::build(&config, Arc::clone(&store)) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "failed to build reviews route");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::new(route, store));

    let listen_addr = config.server.listen_addr.clone();
    let metrics_addr = config.server.metrics_addr.clone();

    tracing::info!(
        listen = %listen_addr,
        metrics = %metrics_addr,
        endpoint = %config.upstream.url.as_deref().unwrap_or_default(),
        strategy = %config.reviews.cache_strategy,
        capacity = config.cache.capacity,
        "review gateway starting"
    );

    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %listen_addr, "failed to bind listener");
            return ExitCode::FAILURE;
        }
    };
    let metrics_listener = match tokio::net::TcpListener::bind(&metrics_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %metrics_addr, "failed to bind metrics listener");
            return ExitCode::FAILURE;
        }
    };

    spawn_config_watcher(config_path, config, Arc::clone(&state));

    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    let app_future = axum::serve(listener, app_router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let metrics_future = axum::serve(metrics_listener, metrics_router(state, prom_handle))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let result = tokio::select! {
        result = app_future => result.map_err(|e| ("gateway", e)),
        result = metrics_future => result.map_err(|e| ("metrics", e)),
    };

    if let Err((server, e)) = result {
        tracing::error!(server, error = %e, "server error");
        return ExitCode::FAILURE;
    }

    tracing::info!("review gateway shut down");
    ExitCode::SUCCESS
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}

/// Watch config.toml and apply safe changes at runtime.
fn spawn_config_watcher(config_path: PathBuf, initial_config: Config, state: Arc<AppState>) {
    let current_config = Arc::new(Mutex::new(initial_config));

    let config_path_clone = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                match Config::load(&config_path_clone) {
                    Ok(new_config) => {
                        let new_config = new_config.with_env();
                        let mut current = current_config.lock();
                        *current = config::diff_and_apply(&current, &new_config, &state);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to reload config.toml");
                    }
                }
            }
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start config watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::debug!(error = %e, "config.toml not watchable, hot reload disabled");
        return;
    }

    // Leak the watcher so it lives for the process lifetime
    std::mem::forget(watcher);
    tracing::info!("config file watcher started");
}
