//! Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use tether_backend::{BackendPool, DispatchPolicy, Dispatcher};
use tether_core::config::{GatewayConfig, ServerSettings};
use tether_core::ids::ConnectionId;

use crate::channel::WsChannel;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_ORIGIN_REJECTED_TOTAL;
use crate::registry::ConnectionRegistry;
use crate::session::{Session, SessionConfig, SessionContext};
use crate::shutdown::ShutdownCoordinator;

/// Failures starting the listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configured address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// `host:port` as configured.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// Any other listener I/O error.
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Listener and upgrade settings.
    pub settings: Arc<ServerSettings>,
    /// Backend pool shared by every session.
    pub pool: Arc<BackendPool>,
    /// Handed to each new session.
    pub sessions: SessionContext<BackendPool>,
    /// Shutdown token and session tracker.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Monotonic start, for uptime.
    pub start_time: Instant,
    /// Wall-clock start, for `/health`.
    pub started_at: DateTime<Utc>,
    /// Prometheus handle. `/metrics` answers 404 without one.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Wire the dispatcher, registry and shutdown coordinator around `pool`.
    pub fn new(config: &GatewayConfig, pool: Arc<BackendPool>, metrics: Option<PrometheusHandle>) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let sessions = SessionContext {
            dispatcher: Dispatcher::new(Arc::clone(&pool), DispatchPolicy::from(&config.dispatch)),
            registry: Arc::new(ConnectionRegistry::new()),
            config: SessionConfig::from(&config.session),
            shutdown: shutdown.token(),
        };
        Self {
            settings: Arc::new(config.server.clone()),
            pool,
            sessions,
            shutdown,
            start_time: Instant::now(),
            started_at: Utc::now(),
            metrics,
        }
    }

    /// Live sessions.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.sessions.registry
    }
}

/// Build the Axum router with all routes.
pub fn router(state: AppState) -> Router {
    let ws_path = state.settings.ws_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A running server.
pub struct ServerHandle {
    addr: SocketAddr,
    state: AppState,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting connections, end every session, and wait up to
    /// `timeout` for them. Returns `false` if the timeout elapsed.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.state
            .shutdown
            .graceful_shutdown(vec![self.task], timeout)
            .await
    }
}

/// Bind the listener and serve until shutdown.
pub async fn start(
    config: &GatewayConfig,
    pool: Arc<BackendPool>,
    metrics: Option<PrometheusHandle>,
) -> Result<ServerHandle, ServerError> {
    let state = AppState::new(config, pool, metrics);
    let host = config.server.host.as_str();
    let port = config.server.port;
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|source| ServerError::Bind {
            addr: format!("{host}:{port}"),
            source,
        })?;
    let addr = listener.local_addr()?;

    let app = router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
    let token = state.shutdown.token();
    let task = tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(err) = served {
            error!(error = %err, "server terminated with error");
        }
    });

    info!(%addr, ws_path = %config.server.ws_path, "gateway listening");
    Ok(ServerHandle { addr, state, task })
}

/// GET <wsPath>: origin check, then upgrade into a session. Refused with 503
/// once shutdown has begun.
async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !state.settings.origin_allowed(origin) {
        warn!(?origin, %peer, "rejecting upgrade from disallowed origin");
        counter!(WS_ORIGIN_REJECTED_TOTAL).increment(1);
        return StatusCode::FORBIDDEN.into_response();
    }

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let ctx = state.sessions.clone();
    let shutdown = Arc::clone(&state.shutdown);
    upgrade
        .max_message_size(state.settings.max_message_size)
        .on_upgrade(move |socket| async move {
            let channel = WsChannel::new(socket, ctx.config.write_wait);
            let session = Session::new(ConnectionId::new(), channel, ctx);
            let _ = shutdown.track_session(session.run(Some(peer))).await;
        })
}

/// GET /health
///
/// Never waits on the pool. `backends` is `null` whenever a resolution holds
/// the pool lock, so under steady traffic it is often `null`; clients should
/// treat it as best-effort.
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.started_at,
        state.registry().count(),
        state.pool.try_snapshot(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tether_backend::{catalog, FailoverPolicy, StaticBackend};
    use tether_core::backend::{Backend, Resolver};
    use tower::ServiceExt;

    fn make_state(config: &GatewayConfig, metrics: Option<PrometheusHandle>) -> AppState {
        let pool = BackendPool::new(catalog(&config.backends), FailoverPolicy::from(&config.failover)).unwrap();
        AppState::new(config, Arc::new(pool), metrics)
    }

    fn app(config: &GatewayConfig, metrics: Option<PrometheusHandle>) -> Router {
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        router(make_state(config, metrics)).layer(MockConnectInfo(peer))
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_lists_backends() {
        let resp = app(&GatewayConfig::default(), None)
            .oneshot(get_req("/health"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["backends"].as_array().unwrap().len(), 3);
        assert_eq!(parsed["backends"][0]["name"], "provider-1");
        assert_eq!(parsed["backends"][0]["active"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn health_reports_null_backends_while_pool_is_busy() {
        let slow: Arc<dyn Backend> = Arc::new(
            StaticBackend::new("slow", "fb")
                .with_answer("Hi", "hello")
                .with_latency(Duration::from_secs(1)),
        );
        let pool = Arc::new(BackendPool::new(vec![slow], FailoverPolicy::default()).unwrap());
        let state = AppState::new(&GatewayConfig::default(), Arc::clone(&pool), None);
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let app = router(state).layer(MockConnectInfo(peer));

        let resolving = tokio::spawn(async move { pool.resolve("Hi").await });
        tokio::task::yield_now().await;

        let parsed = body_json(app.clone().oneshot(get_req("/health")).await.unwrap()).await;
        assert_eq!(parsed["status"], "ok");
        assert!(parsed["backends"].is_null());

        assert_eq!(resolving.await.unwrap().unwrap(), "hello");
        let parsed = body_json(app.oneshot(get_req("/health")).await.unwrap()).await;
        assert_eq!(parsed["backends"][0]["lastLatencyMs"], 1_000);
    }

    #[tokio::test]
    async fn upgrade_refused_during_shutdown() {
        let state = make_state(&GatewayConfig::default(), None);
        state.shutdown.shutdown();
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let resp = router(state)
            .layer(MockConnectInfo(peer))
            .oneshot(get_req("/ws"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let resp = app(&GatewayConfig::default(), None)
            .oneshot(get_req("/metrics"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_handle_renders_text() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let resp = app(&GatewayConfig::default(), Some(handle))
            .oneshot(get_req("/metrics"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }

    #[tokio::test]
    async fn disallowed_origin_is_forbidden() {
        let mut config = GatewayConfig::default();
        config.server.allowed_origins = vec!["http://allowed.example".into()];

        let req = Request::builder()
            .uri("/ws")
            .header(header::ORIGIN, "http://evil.example")
            .body(Body::empty())
            .unwrap();
        let resp = app(&config, None).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn plain_get_on_ws_path_is_not_upgraded() {
        let resp = app(&GatewayConfig::default(), None)
            .oneshot(get_req("/ws"))
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
        assert_ne!(resp.status(), StatusCode::FORBIDDEN);
        assert_ne!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn custom_ws_path_is_routed() {
        let mut config = GatewayConfig::default();
        config.server.ws_path = "/stream".into();
        let router = app(&config, None);

        let resp = router.clone().oneshot(get_req("/ws")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = router.oneshot(get_req("/stream")).await.unwrap();
        assert_ne!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let resp = app(&GatewayConfig::default(), None)
            .oneshot(get_req("/nonexistent"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = GatewayConfig::default();
        config.server.host = "127.0.0.1".into();
        config.server.port = taken.local_addr().unwrap().port();
        let pool = BackendPool::new(catalog(&config.backends), FailoverPolicy::default()).unwrap();
        let err = start(&config, Arc::new(pool), None).await.err().unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
    }
}
