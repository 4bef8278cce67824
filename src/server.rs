//! HTTP API.

use crate::gateway::{normalize_identity, AccessDecision, AccessGateway, GatewayError};
use crate::reputation::{BanStatus, RecordSource, ReputationRecord};
use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Header carrying the server-side handling time in seconds.
pub const LATENCY_HEADER: &str = "x-api-latency";

#[derive(Clone)]
struct AppState {
    gateway: Arc<AccessGateway>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    cache: String,
}

#[derive(Debug, Serialize)]
struct AccessResponse {
    has_access: bool,
}

#[derive(Debug, Serialize)]
struct AccessDetailsResponse {
    delegatee: String,
    expires_at: u64,
    is_active: bool,
}

#[derive(Debug, Serialize)]
struct ReputationResponse {
    identity: String,
    #[serde(flatten)]
    record: ReputationRecord,
    source: RecordSource,
    /// The record is a fallback, not what the cache holds.
    degraded: bool,
    banned: Option<bool>,
    ban_ttl: i64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

/// Error responses. Internal cache problems never show up here.
#[derive(Debug)]
enum ApiError {
    RateLimited { retry_after: u64 },
    BadRequest(String),
    NotFound(String),
    BadGateway(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail, retry_after) = match self {
            ApiError::RateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                format!("Too many failed attempts, retry in {} seconds", retry_after),
                Some(retry_after),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg, None),
        };

        let mut response = (status, Json(ErrorBody { detail, retry_after })).into_response();
        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::InvalidIdentity(_) => ApiError::BadRequest(e.to_string()),
            GatewayError::Oracle(_) => ApiError::BadGateway(e.to_string()),
        }
    }
}

/// Build the API router.
pub fn router(gateway: Arc<AccessGateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/access/:token_id/:user", get(check_access))
        .route("/access-details/:token_id", get(access_details))
        .route("/reputation/:identity", get(reputation))
        .layer(middleware::from_fn(latency_header))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { gateway })
}

/// Serve `app` until Ctrl-C or SIGTERM.
pub async fn serve(listener: TcpListener, app: Router) -> anyhow::Result<()> {
    info!(address = %listener.local_addr()?, "Access gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}

async fn latency_header(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let mut response = next.run(request).await;
    let elapsed = format!("{:.6}", started.elapsed().as_secs_f64());
    if let Ok(value) = HeaderValue::from_str(&elapsed) {
        response.headers_mut().insert(LATENCY_HEADER, value);
    }
    response
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let cache = state.gateway.tracker().cache();
    let (status, cache_status) = match cache.ping().await {
        Ok(()) => ("ok", "ok".to_string()),
        Err(e) => ("degraded", e.to_string()),
    };

    Json(HealthResponse {
        status,
        cache: cache_status,
    })
}

async fn check_access(
    State(state): State<AppState>,
    Path((token_id, user)): Path<(u64, String)>,
) -> Result<Json<AccessResponse>, ApiError> {
    match state.gateway.check_access(token_id, &user).await? {
        AccessDecision::Granted => Ok(Json(AccessResponse { has_access: true })),
        AccessDecision::Denied => Ok(Json(AccessResponse { has_access: false })),
        AccessDecision::RateLimited { retry_after } => Err(ApiError::RateLimited { retry_after }),
    }
}

async fn access_details(
    State(state): State<AppState>,
    Path(token_id): Path<u64>,
) -> Result<Json<AccessDetailsResponse>, ApiError> {
    let details = state
        .gateway
        .oracle()
        .access_details(token_id)
        .await
        .map_err(|e| ApiError::BadGateway(format!("Access lookup failed: {}", e)))?
        .ok_or_else(|| ApiError::NotFound(format!("Token {} has no delegation", token_id)))?;

    let now = chrono::Utc::now().timestamp().max(0) as u64;

    Ok(Json(AccessDetailsResponse {
        is_active: details.expires_at > now,
        delegatee: details.delegatee,
        expires_at: details.expires_at,
    }))
}

async fn reputation(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<Json<ReputationResponse>, ApiError> {
    let identity = normalize_identity(&identity)?;
    let tracker = state.gateway.tracker();

    let lookup = tracker.lookup(&identity).await;
    let (banned, ban_ttl) = match tracker.ban_status(&identity).await {
        BanStatus::Banned { ttl_seconds } => (Some(true), ttl_seconds),
        BanStatus::NotBanned => (Some(false), crate::cache::TTL_KEY_ABSENT),
        BanStatus::Unknown => (None, crate::cache::TTL_KEY_ABSENT),
    };

    Ok(Json(ReputationResponse {
        identity,
        record: lookup.record,
        degraded: lookup.source.is_degraded(),
        source: lookup.source,
        banned,
        ban_ttl,
    }))
}
