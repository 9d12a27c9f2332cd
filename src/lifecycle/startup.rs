//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize all subsystems in dependency order
//! - Publish the first snapshot before any listener accepts traffic
//! - Start background tasks (reconciler, health monitor, file watchers)
//! - Bind listeners and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast on static problems (bad addresses, unreadable certificates)
//! - Topology problems are never fatal; a bad fragment is reported and skipped
//! - Listeners start last (traffic only when ready)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::RecommendedWatcher;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::admin::{setup_admin_router, AdminState};
use crate::config::schema::ProxyConfig;
use crate::config::watcher::FileProvider;
use crate::health::HealthMonitor;
use crate::http::client::build_client;
use crate::http::dispatcher::Dispatcher;
use crate::http::server::HttpServer;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::wait_for_signal;
use crate::load_balancer::PoolDefaults;
use crate::net::tls::{CertificateResolver, CertificateStore, TlsError};
use crate::observability::{logging, metrics};
use crate::reconcile::{topology_channel, BuildContext, Reconciler, SnapshotHandle, TopologyPublisher};

/// How long `stop` waits for background tasks.
const STOP_TIMEOUT: Duration = Duration::from_secs(35);

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to watch fragment file: {0}")]
    Watch(#[from] notify::Error),
}

/// Handles to a started proxy.
pub struct RunningProxy {
    pub proxy_addr: SocketAddr,
    pub admin_addr: Option<SocketAddr>,
    pub snapshots: SnapshotHandle,
    /// For provider adapters outside the process config.
    pub publisher: TopologyPublisher,
    shutdown: Shutdown,
    tasks: Vec<JoinHandle<()>>,
    _watchers: Vec<RecommendedWatcher>,
}

impl RunningProxy {
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Signal shutdown and wait for every task to drain.
    pub async fn stop(self) {
        self.shutdown.trigger();
        let drain = futures_util::future::join_all(self.tasks);
        if tokio::time::timeout(STOP_TIMEOUT, drain).await.is_err() {
            tracing::warn!("Shutdown timed out, abandoning remaining tasks");
        }
        tracing::info!("Shutdown complete");
    }

    /// Run until a signal or an external trigger, then stop.
    pub async fn wait(self) {
        let mut triggered = self.shutdown.subscribe();
        if !self.shutdown.is_triggered() {
            tokio::select! {
                _ = wait_for_signal() => {}
                _ = triggered.recv() => {}
            }
        }
        self.stop().await;
    }
}

async fn bind(address: &str) -> Result<TcpListener, StartupError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| StartupError::Bind {
            address: address.to_string(),
            source,
        })
}

/// Start every subsystem and return once listeners are accepting.
pub async fn start(config: ProxyConfig) -> Result<RunningProxy, StartupError> {
    let shutdown = Shutdown::new();
    let mut tasks = Vec::new();

    let store = Arc::new(CertificateStore::from_config(&config.certificates)?);
    let certificates: Option<Arc<dyn CertificateResolver>> = if store.is_empty() {
        None
    } else {
        tracing::info!(names = store.len(), "Certificate store ready");
        Some(store.clone())
    };

    // Reconciler and first snapshot.
    let snapshots = SnapshotHandle::default();
    let ctx = BuildContext {
        defaults: PoolDefaults::from_config(&config),
        certificates,
    };
    let mut reconciler = Reconciler::new(
        snapshots.clone(),
        ctx,
        Duration::from_millis(config.reconcile.debounce_ms),
    );
    let (publisher, mut events) = topology_channel();

    let mut providers = Vec::new();
    for provider_config in &config.providers.files {
        let provider = FileProvider::new(provider_config, publisher.clone());
        if let Err(e) = provider.publish_current() {
            tracing::error!(source = %provider.source(), error = %e, "Fragment not loaded");
        }
        providers.push((provider, provider_config.watch));
    }
    while let Ok(event) = events.try_recv() {
        reconciler.apply(event);
    }
    reconciler.reconcile().emit();

    let mut watchers = Vec::new();
    for (provider, watch) in providers {
        if watch {
            watchers.push(provider.watch()?);
        }
    }

    tasks.push(tokio::spawn(reconciler.run(events, shutdown.subscribe())));

    let monitor = HealthMonitor::new(snapshots.clone());
    tasks.push(tokio::spawn(monitor.run(shutdown.subscribe())));

    // Admin API.
    let admin_addr = if config.admin.enabled {
        let listener = bind(&config.admin.bind_address).await?;
        let addr = listener.local_addr().map_err(|source| StartupError::Bind {
            address: config.admin.bind_address.clone(),
            source,
        })?;
        let app = setup_admin_router(AdminState {
            snapshots: snapshots.clone(),
            api_key: config.admin.api_key.clone(),
            started: Instant::now(),
        });
        let mut stop = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            tracing::info!(address = %addr, "Admin API listening");
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.recv().await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Admin API failed");
            }
        }));
        Some(addr)
    } else {
        None
    };

    // Proxy listener, last.
    let client = build_client(&config.timeouts);
    let dispatcher = Arc::new(Dispatcher::from_config(&config, client));
    let listener = bind(&config.listener.bind_address).await?;
    let proxy_addr = listener.local_addr().map_err(|source| StartupError::Bind {
        address: config.listener.bind_address.clone(),
        source,
    })?;
    let server = HttpServer::new(config, snapshots.clone(), dispatcher, store);
    let stop = shutdown.subscribe();
    let on_failure = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = server.run(listener, stop).await {
            tracing::error!(error = %e, "Proxy listener failed");
            on_failure.trigger();
        }
    }));

    Ok(RunningProxy {
        proxy_addr,
        admin_addr,
        snapshots,
        publisher,
        shutdown,
        tasks,
        _watchers: watchers,
    })
}

/// Process entry: logging, metrics, start, run until signalled.
pub async fn run(config: ProxyConfig) -> Result<(), StartupError> {
    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "edge-proxy starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        providers = config.providers.files.len(),
        fail_open = config.dispatch.fail_open,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    let proxy = start(config).await?;
    tracing::info!(address = %proxy.proxy_addr, generation = proxy.snapshots.generation(), "Listening for connections");
    proxy.wait().await;
    Ok(())
}
