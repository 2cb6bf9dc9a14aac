//! Broker assembly: shared state, router and listener

use axum::{
    middleware as axum_middleware,
    routing::{any, get, post},
    Router,
};
use neuralgate_proto::TUNNEL_PATH;
use neuralgate_store::Datastore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::access::AccessGate;
use crate::config::BrokerConfig;
use crate::correlator::Correlator;
use crate::dispatcher::Dispatcher;
use crate::handlers;
use crate::rate_limit::{self, RateLimitState, RateLimiter};
use crate::registry::SessionRegistry;
use crate::stats::StatsLogger;
use crate::tunnel;
use crate::verifier::Verifier;

/// Close code sent to agents when the broker stops
const CLOSE_GOING_AWAY: u16 = 1001;
const REASON_SHUTTING_DOWN: &str = "Server shutting down";
const STATS_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Application state shared across handlers
pub struct AppState {
    pub config: BrokerConfig,
    pub store: Arc<dyn Datastore>,
    pub registry: Arc<SessionRegistry>,
    pub correlator: Correlator,
    pub verifier: Verifier,
    pub access: AccessGate,
    pub dispatcher: Dispatcher,
    pub stats: StatsLogger,
}

impl AppState {
    pub fn new(config: BrokerConfig, store: Arc<dyn Datastore>, stats: StatsLogger) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let correlator = Correlator::new(config.request_timeout);

        Self {
            verifier: Verifier::new(store.clone(), config.lookup_timeout),
            access: AccessGate::new(store.clone(), stats.clone(), config.lookup_timeout),
            dispatcher: Dispatcher::new(registry.clone(), correlator.clone()),
            registry,
            correlator,
            stats,
            store,
            config,
        }
    }
}

pub struct Broker {
    state: Arc<AppState>,
    rate_limiter: Arc<RateLimiter>,
    stats_worker: Option<JoinHandle<()>>,
}

impl Broker {
    /// Create a broker and start its stats worker. Must be called inside a
    /// tokio runtime.
    pub fn new(config: BrokerConfig, store: Arc<dyn Datastore>) -> Self {
        let (stats, worker) = StatsLogger::spawn(store.clone(), config.lookup_timeout);
        let mut broker = Self::with_stats(config, store, stats);
        broker.stats_worker = Some(worker);
        broker
    }

    /// Create a broker that reports stats through `stats`
    pub fn with_stats(config: BrokerConfig, store: Arc<dyn Datastore>, stats: StatsLogger) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        Self {
            state: Arc::new(AppState::new(config, store, stats)),
            rate_limiter,
            stats_worker: None,
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let rate_limit_state = RateLimitState {
            limiter: self.rate_limiter.clone(),
            trust_proxy: self.state.config.trust_proxy,
        };

        // Public ingress, rate limited per source IP
        let ingress_router = Router::new()
            .route(
                "/users/{username}/{slug}/{*subpath}",
                any(handlers::passthrough),
            )
            .route("/users/{username}/{slug}/", any(handlers::passthrough))
            .route("/api/report-stats", post(handlers::report_stats))
            .with_state(self.state.clone())
            .layer(axum_middleware::from_fn_with_state(
                rate_limit_state,
                rate_limit::enforce,
            ));

        // Agent sockets and health are never rate limited
        let control_router = Router::new()
            .route(TUNNEL_PATH, get(tunnel::tunnel_handler))
            .route("/health", get(handlers::health))
            .with_state(self.state.clone());

        Router::new()
            .merge(ingress_router)
            .merge(control_router)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Serve on an already bound listener until `shutdown` fires
    pub async fn serve(
        mut self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), anyhow::Error> {
        let router = self.build_router();
        let addr = listener.local_addr()?;

        info!("Gateway listening on {}", addr);
        info!("WebSocket endpoint ready at ws://{}{}", addr, TUNNEL_PATH);

        // Closing sessions first lets in-flight passthroughs settle so the
        // graceful shutdown is not held open by them
        let registry = self.state.registry.clone();
        let stop = async move {
            shutdown.cancelled().await;
            let closed = registry.close_all(CLOSE_GOING_AWAY, REASON_SHUTTING_DOWN);
            info!(sessions = closed, "Shutting down gateway");
        };

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(stop)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        info!("Gateway stopped");

        // The worker exits once the last stats sender (held by the state) is gone
        let worker = self.stats_worker.take();
        drop(self);
        if let Some(worker) = worker {
            if tokio::time::timeout(STATS_DRAIN_TIMEOUT, worker).await.is_err() {
                warn!("Stats worker still busy at shutdown");
            }
        }

        Ok(())
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        let listener = TcpListener::bind(self.state.config.listen).await?;
        self.serve(listener, shutdown).await
    }
}
