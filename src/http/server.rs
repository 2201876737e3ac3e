//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the cache handler
//! - Wire up middleware (tracing, timeout, request ID)
//! - Buffer request bodies and attach the peer address
//! - Hand every request to the cache coordinator
//! - Swap in a rebuilt cache when the configuration changes
//! - Observability (metrics, correlation IDs)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderName, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::request::{ClientAddr, X_REQUEST_ID};
use crate::backend::{BackendError, HttpOrigin};
use crate::cache::HttpCache;
use crate::config::ProxyConfig;
use crate::observability::metrics;
use crate::security::limits::buffer_body;
use crate::security::TrustedProxies;
use crate::store::{FileStore, StoreError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid trusted proxies: {0}")]
    TrustedProxies(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a request needs, rebuilt as a unit on config reload.
pub struct ServerInner {
    pub config: ProxyConfig,
    pub cache: HttpCache,
}

impl ServerInner {
    pub fn build(config: ProxyConfig) -> Result<Self, ServerError> {
        let origin = HttpOrigin::new(&config.origin, &config.timeouts)?;
        let lease = config.store.lock_lease_secs.map(Duration::from_secs);
        let store = FileStore::with_lease(&config.store.root, lease)?
            .with_prune_threshold(config.store.prune_threshold);
        let trusted =
            TrustedProxies::parse(&config.security.trusted_proxies).map_err(ServerError::TrustedProxies)?;

        let cache = HttpCache::new(Arc::new(origin), Arc::new(store), config.cache.clone())
            .with_surrogates(config.surrogate.dialects.clone())
            .with_trusted_proxies(trusted);
        Ok(Self { config, cache })
    }
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<ArcSwap<ServerInner>>,
}

impl AppState {
    pub fn new(inner: ServerInner) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(inner)),
        }
    }

    /// Rebuild the cache from `config`; the running one is kept if that fails.
    pub fn reload(&self, config: ProxyConfig) {
        match ServerInner::build(config) {
            Ok(inner) => {
                tracing::info!(
                    origin = %inner.config.origin.address,
                    store = %inner.config.store.root,
                    "Configuration reloaded"
                );
                self.inner.store(Arc::new(inner));
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to apply reloaded configuration. Keeping current configuration.");
            }
        }
    }
}

/// HTTP server for the caching proxy.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let router_config = config.clone();
        let state = AppState::new(ServerInner::build(config)?);
        let router = Self::build_router(&router_config, state.clone());
        Ok(Self { router, state })
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        let request_id = HeaderName::from_static(X_REQUEST_ID);
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(PropagateRequestIdLayer::new(request_id.clone()))
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
    }

    /// Shared state, for mounting the admin API next to the proxy.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Run the server until `shutdown` fires, applying configurations from `config_updates`.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let reload_state = self.state.clone();
        let mut reload_shutdown = shutdown.resubscribe();
        let reloader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(config) = config_updates.recv() => reload_state.reload(config),
                    _ = reload_shutdown.recv() => break,
                    else => break,
                }
            }
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received, draining connections");
            })
            .await?;

        reloader.abort();
        // Locks of requests cut short by shutdown must not outlive the process.
        self.state.inner.load().cache.store().cleanup();
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Turn an origin-form request target into an absolute URI using the Host header.
fn absolute_uri(uri: &Uri, host: Option<&str>) -> Option<Uri> {
    if uri.authority().is_some() {
        return Some(uri.clone());
    }
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let host = host.filter(|h| !h.is_empty()).unwrap_or("localhost");
    format!("http://{}{}", host, path).parse().ok()
}

/// Main cache handler.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: axum::http::Request<Body>,
) -> Response {
    let start_time = Instant::now();
    let inner = state.inner.load_full();
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let method_str = request.method().to_string();

    let (mut parts, body) = request.into_parts();
    let body = match buffer_body(body, inner.config.security.max_body_size).await {
        Ok(bytes) => bytes,
        Err(status) => {
            tracing::warn!(request_id = %request_id, "Request body rejected");
            metrics::record_request(&method_str, status.as_u16(), start_time);
            return (status, "Request body too large").into_response();
        }
    };

    let host = parts.headers.get(header::HOST).and_then(|v| v.to_str().ok());
    let Some(uri) = absolute_uri(&parts.uri, host) else {
        metrics::record_request(&method_str, 400, start_time);
        return (StatusCode::BAD_REQUEST, "Invalid request target").into_response();
    };
    parts.uri = uri;

    let mut request = axum::http::Request::from_parts(parts, body);
    request.extensions_mut().insert(ClientAddr(peer.ip()));

    tracing::debug!(
        request_id = %request_id,
        method = %request.method(),
        uri = %request.uri(),
        "Handling request"
    );

    match inner.cache.handle(request).await {
        Ok(response) => {
            metrics::record_request(&method_str, response.status().as_u16(), start_time);
            response.map(Body::from).into_response()
        }
        Err(e) => {
            let status = if e.is_origin_failure() {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            tracing::error!(request_id = %request_id, error = %e, status = %status, "Cache request failed");
            metrics::record_request(&method_str, status.as_u16(), start_time);
            let message = if status == StatusCode::BAD_GATEWAY {
                "Upstream request failed"
            } else {
                "Internal cache error"
            };
            (status, message).into_response()
        }
    }
}
