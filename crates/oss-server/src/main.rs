use std::sync::Arc;
use std::time::Duration;
use std::{env, net::SocketAddr};

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use oss_core::{
    BlobStore, BreakerConfig, Config, CredentialCrypto, Database, FsBlobStore, GmailProvider,
    JobDispatcher, JobQueue, S3BlobStore, Sanitizer, WorkerHostConfig, init_telemetry,
    run_migrations, run_worker_host,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod api;

#[derive(Clone)]
struct AppState {
    db: Database,
    queue: JobQueue,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    init_telemetry(&config.app)?;

    let db = Database::new(&config.paths.database).await?;
    run_migrations(&db).await?;

    let crypto = CredentialCrypto::from_base64_key(&config.crypto.credentials_key)?;
    let blob: Arc<dyn BlobStore> = match config.blob.backend.as_str() {
        "s3" => Arc::new(S3BlobStore::from_config(&config.blob).await?),
        _ => Arc::new(FsBlobStore::new(&config.paths.blob_root)),
    };
    let provider = Arc::new(GmailProvider::new(reqwest_client(), crypto));

    let queue = JobQueue::new(db.clone()).with_backoff(
        Duration::from_secs(config.worker.backoff_base_secs),
        Duration::from_secs(config.worker.backoff_cap_secs),
    );
    let dispatcher = JobDispatcher::new(db.clone(), queue.clone(), blob, provider)
        .with_sanitizer(Sanitizer::new(config.parser.sanitizer_revision.clone()))
        .with_breaker(BreakerConfig {
            threshold: config.sync.breaker_threshold,
            pause: Duration::from_secs(config.sync.pause_minutes.max(1) as u64 * 60),
        })
        .with_sync_cadence(config.sync.cadence());

    let shutdown = CancellationToken::new();
    let worker_handle = tokio::spawn(run_worker_host(
        queue.clone(),
        Arc::new(dispatcher),
        WorkerHostConfig::from_settings(&config.worker),
        shutdown.child_token(),
    ));

    let state = AppState {
        db: db.clone(),
        queue,
    };
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.app.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("oss-server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(err) = worker_handle.await {
        warn!("worker host join error: {err}");
    }
    Ok(())
}

fn reqwest_client() -> reqwest::Client {
    reqwest::Client::new()
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api::router())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    database: String,
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_status = match state.db.health_check().await {
        Ok(_) => "ok",
        Err(_) => "unhealthy",
    };

    let status = if db_status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if db_status == "ok" {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: db_status.to_string(),
        }),
    )
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, shutting down");
        }
        _ = terminate => {
            warn!("received terminate signal, shutting down");
        }
    }

    shutdown.cancel();
}
