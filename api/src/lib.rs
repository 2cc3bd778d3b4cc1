use axum::{
    extract::{DefaultBodyLimit, FromRequest, Path, State},
    http::{header, HeaderMap},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod error;
pub mod identity;
pub mod models;
pub mod relay;
pub mod store;

use config::{Config, StorageKind};
use error::ApiError;
use models::{HistoryLists, Track, UserRecord, UserStats};
use relay::{PlaylistRelay, PlaylistRequest};
use store::{ActivityStore, FileBackend, MemoryBackend, RecordBackend};

const BODY_LIMIT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: ActivityStore,
    pub relay: PlaylistRelay,
}

/// `Json` that answers malformed bodies with `{"error": ...}` instead of
/// axum's plain-text rejection.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct JsonBody<T>(pub T);

#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

impl Ack {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    #[serde(default)]
    pub action: Option<String>,
    pub track: Track,
}

#[derive(Debug, Default, Deserialize)]
pub struct IdentifyRequest {
    #[serde(default)]
    pub fingerprint: Option<String>,
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "IranMix Server API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn health_check() -> Json<Value> {
    tracing::debug!("health check requested");
    Json(json!({
        "status": "ok",
        "message": "IranMix server is running",
        "timestamp": models::iso_millis(Utc::now()),
    }))
}

async fn identify(JsonBody(body): JsonBody<IdentifyRequest>) -> Json<Value> {
    let user_id = identity::user_id_from_fingerprint(body.fingerprint.as_deref());
    Json(json!({ "userId": user_id }))
}

async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserRecord>, ApiError> {
    tracing::info!("getting user data for {}", user_id);
    let record = state
        .store
        .get(&user_id)
        .await
        .map_err(|e| ApiError::store("Failed to load user data", e))?;
    Ok(Json(record))
}

async fn save_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    JsonBody(record): JsonBody<UserRecord>,
) -> Result<Json<Ack>, ApiError> {
    tracing::info!("saving user data for {}", user_id);
    state
        .store
        .put(&user_id, record)
        .await
        .map_err(|e| ApiError::store("Failed to save user data", e))?;
    Ok(Ack::ok("Data saved successfully"))
}

async fn log_action(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    JsonBody(body): JsonBody<ActionRequest>,
) -> Result<Json<Ack>, ApiError> {
    let action = body.action.unwrap_or_else(|| "undefined".to_string());
    tracing::info!(
        "action {} for user {} (track: {})",
        action,
        user_id,
        body.track.text("title")
    );

    state
        .store
        .record_action(&user_id, &action, body.track)
        .await
        .map_err(|e| ApiError::store("Failed to log action", e))?;
    Ok(Ack::ok(format!("{action} logged successfully")))
}

async fn get_stats(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserStats>, ApiError> {
    let stats = state
        .store
        .derive_stats(&user_id)
        .await
        .map_err(|e| ApiError::store("Failed to get stats", e))?;
    Ok(Json(stats))
}

async fn get_lists(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<HistoryLists>, ApiError> {
    let lists = state
        .store
        .list_history(&user_id)
        .await
        .map_err(|e| ApiError::store("Failed to get lists", e))?;
    Ok(Json(lists))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim())
}

async fn generate_playlist(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(request): JsonBody<PlaylistRequest>,
) -> Result<Json<Value>, ApiError> {
    let playlist = state
        .relay
        .generate(&request, bearer_token(&headers))
        .await
        .map_err(|e| {
            tracing::error!("playlist generation error: {}", e);
            e
        })?;
    Ok(Json(playlist))
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root).fallback(not_found))
        .route("/api/health", get(health_check).fallback(not_found))
        .route("/api/identify", post(identify).fallback(not_found))
        .route(
            "/api/user/:user_id",
            get(get_user).post(save_user).fallback(not_found),
        )
        .route("/api/user/:user_id/action", post(log_action).fallback(not_found))
        .route("/api/user/:user_id/stats", get(get_stats).fallback(not_found))
        .route("/api/user/:user_id/lists", get(get_lists).fallback(not_found))
        .route(
            "/api/generate-playlist",
            post(generate_playlist).fallback(not_found),
        )
        // unknown paths; a known path with the wrong method hits the per-route fallback
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES)),
        )
        .with_state(state)
}

pub async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let backend: Arc<dyn RecordBackend> = match config.storage {
        StorageKind::File => Arc::new(FileBackend::open(&config.data_dir).await?),
        StorageKind::Memory => {
            tracing::warn!("using in-memory storage, user data is lost on restart");
            Arc::new(MemoryBackend::new())
        }
    };

    Ok(AppState {
        store: ActivityStore::new(backend, config.history_cap),
        relay: PlaylistRelay::new(config.llm.clone()),
    })
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("iranmix_api=debug,tower_http=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    let state = build_state(&config).await?;
    tracing::info!(
        "storage: {:?}, history cap: {}",
        config.storage,
        config.history_cap
    );

    if config.llm.api_key.is_none() {
        tracing::warn!("LLM_API_KEY not set, playlist requests must carry a bearer key");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => tracing::info!("received ctrl+c, shutting down"),
            Err(e) => {
                tracing::error!("failed to install ctrl+c handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::info!("received SIGTERM, shutting down");
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
