//! S3 Server implementation

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use coffer_auth::{AuthPolicy, SignatureVerifier, StaticCredentialProvider};
use coffer_core::config::{MetadataBackendKind, StorageBackendKind};
use coffer_core::{CofferConfig, Result};
use coffer_metadata::{MemoryMetadataStore, MetadataStore, SqliteMetadataStore};
use coffer_storage::{LocalStorage, MemoryStorage, StorageBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{error, info, warn, Level};

use crate::metrics::{metrics_handler, metrics_middleware, MetricsRecorder};
use crate::routes;
use crate::services::{BucketService, MultipartEngine, ObjectService};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CofferConfig>,
    pub verifier: Arc<SignatureVerifier>,
    pub storage: Arc<dyn StorageBackend>,
    pub buckets: BucketService,
    pub objects: ObjectService,
    pub multipart: MultipartEngine,
    pub metrics: Option<MetricsRecorder>,
}

impl AppState {
    pub fn new(
        config: CofferConfig,
        storage: Arc<dyn StorageBackend>,
        metadata: Arc<dyn MetadataStore>,
        metrics: Option<MetricsRecorder>,
    ) -> Self {
        let credentials = StaticCredentialProvider::from_entries(&config.auth.all_credentials());
        let verifier = SignatureVerifier::new(
            Arc::new(credentials),
            AuthPolicy::from(&config.auth),
        );

        Self {
            buckets: BucketService::new(
                storage.clone(),
                metadata.clone(),
                config.auth.region.clone(),
            ),
            objects: ObjectService::new(storage.clone(), metadata.clone()),
            multipart: MultipartEngine::new(
                storage.clone(),
                metadata,
                config.multipart.min_part_size,
            ),
            verifier: Arc::new(verifier),
            storage,
            metrics,
            config: Arc::new(config),
        }
    }
}

/// Build the HTTP router.
///
/// `/_coffer` can never be a bucket name, so the built-in endpoints cannot
/// shadow S3 paths. Everything else goes to the S3 handler.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/_coffer/metrics", get(metrics_handler))
        .route("/_coffer/health", get(health_handler))
        .fallback(routes::handle_s3_request)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new().level(Level::INFO)))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Response {
    match state.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(e) => {
            error!("Storage health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable").into_response()
        }
    }
}

/// S3 Server
pub struct S3Server {
    config: CofferConfig,
}

impl S3Server {
    pub fn new(config: CofferConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        self.config.validate()?;

        let metrics = if self.config.server.metrics_enabled {
            let recorder = MetricsRecorder::install()?;
            info!("Prometheus metrics initialized");
            Some(recorder)
        } else {
            None
        };

        let storage: Arc<dyn StorageBackend> = match self.config.storage.backend {
            StorageBackendKind::Local => {
                let storage = LocalStorage::new(&self.config.storage.data_dir);
                storage.init().await?;
                info!("Local storage at {}", self.config.storage.data_dir.display());
                Arc::new(storage)
            }
            StorageBackendKind::Memory => {
                warn!("Using in-memory storage; data is lost on shutdown");
                Arc::new(MemoryStorage::new())
            }
        };

        let metadata: Arc<dyn MetadataStore> = match self.config.database.backend {
            MetadataBackendKind::Sqlite => Arc::new(
                SqliteMetadataStore::new(
                    &self.config.database.url,
                    self.config.database.max_connections,
                )
                .await?,
            ),
            MetadataBackendKind::Memory => {
                warn!("Using in-memory metadata; buckets are lost on shutdown");
                Arc::new(MemoryMetadataStore::new())
            }
        };

        let addr = format!("{}:{}", self.config.server.bind_address, self.config.server.port);
        let janitor = self.config.multipart.stale_upload_secs.map(|max_age| {
            (
                max_age,
                Duration::from_secs(self.config.multipart.janitor_interval_secs),
            )
        });
        let anonymous = self.config.auth.allow_anonymous || !self.config.auth.enabled;
        let access_key = self.config.auth.root_access_key.clone();

        let state = AppState::new(self.config, storage, metadata, metrics);
        if state.metrics.is_some() {
            // Sessions persisted by an earlier run still count as active
            match state.multipart.count_open().await {
                Ok(open) => crate::metrics::set_active_uploads(open),
                Err(e) => warn!("Failed to count open multipart uploads: {}", e),
            }
        }
        if let Some((max_age, interval)) = janitor {
            spawn_janitor(state.multipart.clone(), max_age, interval);
        }

        let app = create_router(state);
        let listener = TcpListener::bind(&addr).await?;

        info!("🚀 Coffer S3 API listening on http://{}", addr);
        info!("📈 Prometheus metrics at http://{}/_coffer/metrics", addr);
        info!("🔑 Access Key: {}", access_key);
        if anonymous {
            warn!("Unsigned requests are accepted");
        }

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Server stopped");
        Ok(())
    }
}

/// Periodically abort upload sessions older than `max_age_secs`
fn spawn_janitor(engine: MultipartEngine, max_age_secs: u64, every: Duration) {
    let max_age = chrono::Duration::seconds(max_age_secs.min(i64::MAX as u64) as i64);
    info!(
        "Upload janitor enabled: sessions older than {}s are aborted every {}s",
        max_age_secs,
        every.as_secs()
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match engine.reap_stale(max_age, chrono::Utc::now()).await {
                Ok(0) => {}
                Ok(n) => info!("Aborted {} stale multipart uploads", n),
                Err(e) => error!("Upload janitor pass failed: {}", e),
            }
        }
    });
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await
        }
    }
}
