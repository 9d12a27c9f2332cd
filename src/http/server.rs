//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with the catch-all proxy handler
//! - Wire up tower layers (tracing, body limit, request ID)
//! - Bound concurrent in-flight requests
//! - Serve plain or TLS, with graceful shutdown
//!
//! Routing, middleware and forwarding are the dispatcher's job; the handler
//! only pins the current snapshot and hands the request over.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::schema::ProxyConfig;
use crate::http::dispatcher::Dispatcher;
use crate::http::request::{request_id_header, MakeRequestUuid};
use crate::http::response::plain_text;
use crate::net::tls::{listener_tls_config, CertificateStore, TlsError};
use crate::reconcile::SnapshotHandle;

/// How long in-flight requests may drain after shutdown is signalled.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("listener I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub snapshots: SnapshotHandle,
    pub dispatcher: Arc<Dispatcher>,
    inflight: Arc<Semaphore>,
    tls: bool,
}

/// HTTP server for the reverse proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
    certificates: Arc<CertificateStore>,
}

impl HttpServer {
    /// Serves TLS when the listener has a default certificate or the store
    /// holds any; handshakes pick the store's certificate by SNI name.
    pub fn new(
        config: ProxyConfig,
        snapshots: SnapshotHandle,
        dispatcher: Arc<Dispatcher>,
        certificates: Arc<CertificateStore>,
    ) -> Self {
        let state = AppState {
            snapshots,
            dispatcher,
            inflight: Arc::new(Semaphore::new(config.listener.max_connections.max(1))),
            tls: config.listener.tls.is_some() || !certificates.is_empty(),
        };
        let router = Self::build_router(&config, state);
        Self {
            router,
            config,
            certificates,
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .with_state(state)
            .layer(RequestBodyLimitLayer::new(config.security.max_body_size))
            .layer(PropagateRequestIdLayer::new(request_id_header()))
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::new(request_id_header(), MakeRequestUuid))
    }

    /// The proxy router, for serving it elsewhere.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Accept connections until `shutdown` fires, then drain.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        if self.config.listener.tls.is_some() || !self.certificates.is_empty() {
            let rustls =
                listener_tls_config(self.certificates.clone(), self.config.listener.tls.as_ref())?;
            return self.run_tls(listener, rustls, shutdown).await;
        }

        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server draining");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    async fn run_tls(
        self,
        listener: TcpListener,
        rustls: axum_server::tls_rustls::RustlsConfig,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        // Keep the bound socket so the address is never released.
        let listener = listener.into_std()?;
        tracing::info!(address = %addr, "HTTPS server starting");

        let handle = axum_server::Handle::new();
        let drain = handle.clone();
        tokio::spawn(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTPS server draining");
            drain.graceful_shutdown(Some(DRAIN_TIMEOUT));
        });

        axum_server::from_tcp_rustls(listener, rustls)
            .handle(handle)
            .serve(self.router.into_make_service_with_connect_info::<SocketAddr>())
            .await?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }
}

/// Catch-all handler: pin the snapshot, then dispatch.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response<Body> {
    let Ok(_permit) = state.inflight.clone().try_acquire_owned() else {
        tracing::warn!(client = %client_addr, "In-flight request limit reached");
        return plain_text(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
    };

    let snapshot = state.snapshots.load();
    state
        .dispatcher
        .dispatch(snapshot, request, client_addr, state.tls)
        .await
}
