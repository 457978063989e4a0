use axum::{
    body::Body,
    extract::{
        multipart::{Field, MultipartRejection},
        rejection::JsonRejection,
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dropcode::{
    AssetInfo, AssetRegistry, ByteStream, ExhaustedToken, Grant, KvStore, Redeemer, Redemption,
    TokenLedger, TokenRecord,
};
use futures::StreamExt;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::auth;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};

const DOWNLOAD_PATH: &str = "/download";
const DEFAULT_COUNT: i64 = 1;
const DEFAULT_MAX_DOWNLOADS: i64 = 3;

pub struct GatewayState {
    pub config: GatewayConfig,
    pub ledger: TokenLedger,
    pub assets: AssetRegistry,
    pub redeemer: Redeemer,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, store: Arc<dyn KvStore>) -> Self {
        let ledger = TokenLedger::new(store.clone());
        let assets = AssetRegistry::new(store);
        let redeemer = Redeemer::new(ledger.clone(), assets.clone(), config.redeem_policy);

        Self {
            config,
            ledger,
            assets,
            redeemer,
        }
    }
}

pub fn router(state: Arc<GatewayState>) -> Router {
    let upload_limit = state.config.max_upload_bytes;

    Router::new()
        .route("/health", get(health))
        .route("/info", get(get_info))
        // Admin
        .route("/api/admin/generate", post(generate_tokens))
        .route(
            "/api/admin/upload-album",
            post(upload_album)
                .layer::<_, std::convert::Infallible>(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(upload_limit)),
        )
        .route("/api/admin/exhausted", get(list_exhausted))
        // End users
        .route("/api/download", get(download_by_query))
        .route("/api/download/:token", get(download_by_path))
        .route("/download/:token", get(download_by_path))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(state: Arc<GatewayState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct InfoResponse {
    /// Currently published asset, if any
    asset: Option<AssetInfo>,
    max_batch: u32,
    max_downloads: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(default)]
    secret: Option<String>,
    #[serde(default, deserialize_with = "present")]
    count: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "present")]
    max_downloads: Option<serde_json::Value>,
}

/// Keeps an explicit `null` as `Some(Null)`; only a missing field is `None`.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    tokens: Vec<String>,
    urls: Vec<String>,
    count: usize,
    max_downloads: u32,
}

#[derive(Serialize)]
struct UploadResponse {
    ok: bool,
    message: &'static str,
    size: u64,
    sha256: String,
}

#[derive(Deserialize)]
struct SecretQuery {
    secret: Option<String>,
}

#[derive(Serialize)]
struct ExhaustedResponse {
    exhausted: Vec<ExhaustedToken>,
    count: usize,
}

#[derive(Deserialize)]
struct DownloadQuery {
    token: Option<String>,
    action: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    valid: bool,
    remaining: u32,
    max: u32,
    exhausted_at: Option<DateTime<Utc>>,
    message: String,
}

impl From<TokenRecord> for StatusResponse {
    fn from(record: TokenRecord) -> Self {
        Self {
            valid: true,
            message: record.message(),
            remaining: record.remaining,
            max: record.max,
            exhausted_at: record.exhausted_at,
        }
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn get_info(State(state): State<Arc<GatewayState>>) -> Result<Json<InfoResponse>> {
    Ok(Json(InfoResponse {
        asset: state.assets.info().await?,
        max_batch: dropcode::config::MAX_BATCH,
        max_downloads: dropcode::config::MAX_BUDGET,
    }))
}

/// A missing field takes `default`. A present one is read leniently as a
/// number (JSON number or numeric string). `null` and unparsable text read
/// as 0, which the clamps then raise to the minimum.
fn requested_int(value: Option<&serde_json::Value>, default: i64) -> i64 {
    use serde_json::Value;

    match value {
        None => default,
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<f64>().map(|f| f as i64).unwrap_or(0),
        Some(Value::Bool(b)) => i64::from(*b),
        Some(_) => 0,
    }
}

/// Origin redemption links point at: `SITE_URL`, else the caller's
/// `Origin`, else its `Host`.
fn base_url(config: &GatewayConfig, headers: &HeaderMap) -> String {
    let header = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let base = config
        .site_url
        .clone()
        .or_else(|| header(header::ORIGIN))
        .or_else(|| header(header::HOST).map(|host| format!("http://{}", host)))
        .unwrap_or_default();
    base.trim_end_matches('/').to_string()
}

async fn generate_tokens(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: std::result::Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>> {
    auth::configured_secret(&state.config)?;
    let Json(req) =
        body.map_err(|_| GatewayError::InvalidRequest("Invalid JSON body".into()))?;
    auth::check_admin(&state.config, req.secret.as_deref())?;

    let count = requested_int(req.count.as_ref(), DEFAULT_COUNT);
    let max = requested_int(req.max_downloads.as_ref(), DEFAULT_MAX_DOWNLOADS);
    let max_downloads = dropcode::clamp_budget(max);

    let tokens = state.ledger.issue(count, max).await?;
    let base = base_url(&state.config, &headers);
    let urls = tokens
        .iter()
        .map(|t| format!("{}{}/{}", base, DOWNLOAD_PATH, t))
        .collect();

    Ok(Json(GenerateResponse {
        count: tokens.len(),
        tokens,
        urls,
        max_downloads,
    }))
}

async fn upload_album(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>> {
    auth::configured_secret(&state.config)?;

    // A header secret is checked before a single body byte is read
    let mut authorized = match auth::header_secret(&headers) {
        Some(secret) => {
            auth::check_admin(&state.config, Some(&secret))?;
            true
        }
        None => false,
    };

    let mut multipart = multipart
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid multipart body: {}", e)))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("secret") if !authorized => {
                let secret = field.text().await.map_err(|e| {
                    GatewayError::InvalidRequest(format!("Invalid multipart body: {}", e))
                })?;
                auth::check_admin(&state.config, Some(&secret))?;
                authorized = true;
            }
            Some("file") => {
                // Form secrets must come before the file so nothing is stored unauthenticated
                if !authorized {
                    return Err(GatewayError::Unauthorized);
                }
                let info = publish_field(&state.assets, field).await?;
                return Ok(Json(UploadResponse {
                    ok: true,
                    message: "Album uploaded successfully",
                    size: info.size,
                    sha256: info.sha256,
                }));
            }
            _ => {}
        }
    }

    Err(GatewayError::InvalidRequest(
        "No file uploaded. Send multipart/form-data with field 'file' containing the ZIP.".into(),
    ))
}

/// Stream one multipart field into the registry without buffering it.
async fn publish_field(assets: &AssetRegistry, mut field: Field<'_>) -> Result<AssetInfo> {
    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
    let body: ByteStream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed();

    let pump = async move {
        loop {
            match field.chunk().await {
                Ok(Some(chunk)) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    break;
                }
            }
        }
    };

    let (published, ()) = tokio::join!(assets.publish(body), pump);
    Ok(published?)
}

async fn list_exhausted(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<SecretQuery>,
) -> Result<Json<ExhaustedResponse>> {
    auth::check_admin(&state.config, query.secret.as_deref())?;

    let exhausted = state.ledger.exhausted().await?;
    Ok(Json(ExhaustedResponse {
        count: exhausted.len(),
        exhausted,
    }))
}

async fn download_by_query(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response> {
    let token = query
        .token
        .ok_or_else(|| GatewayError::InvalidRequest("Missing or invalid token".into()))?;
    download(&state, &token, query.action.as_deref()).await
}

async fn download_by_path(
    State(state): State<Arc<GatewayState>>,
    Path(token): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response> {
    let token = query.token.unwrap_or(token);
    download(&state, &token, query.action.as_deref()).await
}

async fn download(state: &GatewayState, token: &str, action: Option<&str>) -> Result<Response> {
    if action != Some("use") {
        let record = state
            .ledger
            .status(token)
            .await?
            .ok_or(GatewayError::UnknownToken)?;
        return Ok(Json(StatusResponse::from(record)).into_response());
    }

    match state.redeemer.redeem(token).await? {
        Redemption::Granted(grant) => attachment(grant),
        Redemption::Denied(reason) => Err(GatewayError::Denied(reason)),
        Redemption::NotFound => Err(GatewayError::UnknownToken),
    }
}

fn attachment(grant: Grant) -> Result<Response> {
    let Grant { record, asset } = grant;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, asset.info.content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", asset.info.filename),
        )
        .header(header::CONTENT_LENGTH, asset.info.size)
        .header(header::CACHE_CONTROL, "no-store")
        .header("x-downloads-remaining", record.remaining)
        .body(Body::from_stream(asset.body))
        .map_err(|e| GatewayError::Internal(format!("Failed to build download response: {}", e)))
}
