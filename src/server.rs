use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::backend::{BackendPool, HttpBackendClient};
use crate::config::Config;
use crate::config_validator::ConfigValidator;
use crate::error::{Result, TarotError};
use crate::handlers::{
    get_reading, get_reading_status, health_check, metrics, redis_health, submit_reading, tarot_health,
};
use crate::metrics::QueueMetrics;
use crate::middleware::{logging_middleware, rate_limit, RouteLimiter};
use crate::queue::TaskQueue;
use crate::rate_limit_config::RouteLimits;
use crate::rate_limiter::{spawn_cleanup, KeyedRateLimiter};
use crate::redis::RedisStore;
use crate::worker::WorkerPool;

pub use crate::handlers::AppState;

/// Build the router. Also returns the live limiters so their idle keys can be
/// swept in the background.
pub fn create_app(state: AppState, limits: &RouteLimits) -> (Router, Vec<Arc<KeyedRateLimiter>>) {
    let global = RouteLimiter::from_rule(&limits.global);
    let create = RouteLimiter::from_rule(&limits.create_reading);
    let query = RouteLimiter::from_rule(&limits.query_reading);

    let submissions = Router::new()
        .route("/v1/tarot/readings", post(submit_reading))
        .route_layer(middleware::from_fn_with_state(create.clone(), rate_limit));

    let lookups = Router::new()
        .route("/v1/tarot/readings/:id", get(get_reading))
        .route("/v1/tarot/readings/:id/status", get(get_reading_status))
        .route_layer(middleware::from_fn_with_state(query.clone(), rate_limit));

    let api = Router::new()
        .merge(submissions)
        .merge(lookups)
        .route("/v1/tarot/health", get(tarot_health))
        .route("/v1/tarot/health/redis", get(redis_health))
        .route_layer(middleware::from_fn_with_state(global.clone(), rate_limit));

    let app = Router::new()
        .merge(api)
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        );

    let limiters = [global, create, query]
        .iter()
        .filter_map(RouteLimiter::limiter)
        .collect();
    (app, limiters)
}

pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        ConfigValidator::validate(&config)?;
        Ok(Self { config })
    }

    /// Serve until a shutdown signal, then drain the workers and stop the
    /// background tasks.
    pub async fn run(self) -> Result<()> {
        let config = self.config;

        let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
        let metrics = Arc::new(QueueMetrics::new());
        let queue = Arc::new(TaskQueue::new(store, config.queue_settings(), Arc::clone(&metrics)));
        queue.ping().await?;
        tracing::info!(prefix = %config.queue_prefix, "Connected to Redis");

        let pool_settings = config.pool_settings();
        let client = HttpBackendClient::new(pool_settings.call_timeout)
            .map_err(|e| TarotError::Configuration(e.to_string()))?;
        let backends = Arc::new(BackendPool::from_lists(
            &config.backend_urls(),
            &config.backend_keys(),
            Arc::new(client),
            pool_settings,
        )?);
        tracing::info!(instances = backends.len(), "Backend pool ready");

        let workers = WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&backends),
            Arc::clone(&metrics),
            config.worker_settings(),
        );
        workers.start();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let prober = Arc::clone(&backends).spawn_health_prober(shutdown_rx.clone());

        let state = AppState::new(queue, backends, metrics);
        let (app, limiters) = create_app(state, &config.route_limits());
        let sweeper = spawn_cleanup(
            limiters,
            config.limiter_cleanup_interval(),
            config.limiter_idle_ttl(),
            shutdown_rx,
        );

        let listener = tokio::net::TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| TarotError::Configuration(format!("failed to bind {}: {}", config.bind_addr, e)))?;
        tracing::info!("Tarot server listening on {}", config.bind_addr);

        let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await;

        workers.shutdown().await;
        shutdown_tx.send_replace(true);
        for (name, handle) in [("health prober", prober), ("limiter sweeper", sweeper)] {
            if let Err(e) = handle.await {
                tracing::error!(task = name, error = %e, "Background task terminated abnormally");
            }
        }
        tracing::info!("Shutdown complete");

        served.map_err(|e| TarotError::Internal(format!("server error: {}", e)))
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
