use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::TryStreamExt;
use serde::Deserialize;
use tokio::sync::watch;

use antena_channels::Channel;

use crate::credentials::CredentialCache;
use crate::proxy::{self, Artifact, ProxyError};

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CredentialCache>,
    pub client: reqwest::Client,
}

/**
    Parse and validate a channel id. Unknown channels are rejected here,
    before any credential work or upstream fetch happens.
*/
fn parse_channel(id: &str) -> Result<Channel, (StatusCode, String)> {
    Channel::parse(id)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown channel '{}'", id)))
}

fn error_response(err: ProxyError) -> (StatusCode, String) {
    (err.status(), err.message())
}

/**
    Extract the base URL (scheme + host) from request headers.

    Checks X-Forwarded-Proto for the scheme (used by reverse proxies).
*/
fn get_base_url(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost:8090");
    format!("{scheme}://{host}")
}

/**
    Root endpoint: list every channel with its endpoints.
*/
async fn index(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let base_url = get_base_url(&headers);
    let cached = state.cache.cached_channels();

    let channels: Vec<serde_json::Value> = Channel::ALL
        .iter()
        .map(|channel| {
            serde_json::json!({
                "id": channel.id(),
                "broadcaster": channel.broadcaster().name(),
                "authenticated": channel.is_authenticated(),
                "cached": cached.contains(channel),
                "stream": format!("{}/stream?channel={}", base_url, channel.id()),
                "playlist": format!("{}/proxy?channel={}", base_url, channel.id()),
            })
        })
        .collect();

    (
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        serde_json::json!({ "channels": channels }).to_string(),
    )
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    channel: String,
}

/**
    Resolve credentials for a channel and report them, without fetching any
    stream data. Extraction runs on demand if the cache is cold.
*/
async fn stream_info(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let channel = parse_channel(&params.channel)?;

    if !channel.is_authenticated() {
        let json = serde_json::json!({
            "streamUrl": channel.public_stream_url(),
            "hasCookies": false,
            "cacheAge": 0,
        });
        return Ok((
            [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
            json.to_string(),
        ));
    }

    let credential = state.cache.get(channel).await.ok_or((
        StatusCode::SERVICE_UNAVAILABLE,
        "stream credentials unavailable".to_string(),
    ))?;

    let json = serde_json::json!({
        "streamUrl": credential.stream_url,
        "hasCookies": !credential.cookies.is_empty(),
        "cacheAge": credential.age().as_secs(),
    });

    Ok((
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        json.to_string(),
    ))
}

#[derive(Debug, Deserialize)]
struct ProxyParams {
    channel: String,
    path: Option<String>,
}

/**
    The relay proper: serve a channel's master manifest, chunklist or
    segment, fetched upstream with the channel's credentials. Manifests come
    back rewritten so every reference routes through this endpoint again.
*/
async fn proxy_artifact(
    State(state): State<AppState>,
    Query(params): Query<ProxyParams>,
) -> Result<Response, (StatusCode, String)> {
    let channel = parse_channel(&params.channel)?;

    if !channel.is_authenticated() {
        return Err((
            StatusCode::BAD_REQUEST,
            format!(
                "channel '{}' is public and served straight from its CDN",
                channel
            ),
        ));
    }

    let artifact = proxy::fetch_artifact(
        &state.client,
        &state.cache,
        channel,
        params.path.as_deref(),
    )
    .await
    .map_err(error_response)?;

    match artifact {
        Artifact::Manifest(body) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")
            .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
            .body(Body::from(body))
            .unwrap()),
        Artifact::Segment {
            content_type,
            upstream,
        } => {
            let stream = upstream.bytes_stream().map_err(std::io::Error::other);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CACHE_CONTROL, "public, max-age=30")
                .body(Body::from_stream(stream))
                .unwrap())
        }
    }
}

/**
    Drop a channel's credentials and extract fresh ones right away.
*/
async fn refresh_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let channel = parse_channel(&channel_id)?;

    state.cache.evict(channel);
    let refreshed = state.cache.get(channel).await.is_some();
    println!("[server] Refresh for '{}': ok={}", channel, refreshed);

    let json = serde_json::json!({
        "channel": channel.id(),
        "refreshed": refreshed,
    });
    Ok((
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        json.to_string(),
    ))
}

/**
    Extract credentials for every authenticated channel, concurrently. The
    per-channel coordinator keeps this from racing with live traffic.
*/
async fn prewarm(State(state): State<AppState>) -> impl IntoResponse {
    let results = futures::future::join_all(Channel::authenticated().map(|channel| {
        let cache = Arc::clone(&state.cache);
        async move { (channel, cache.get(channel).await.is_some()) }
    }))
    .await;

    let mut warmed = serde_json::Map::new();
    for (channel, ok) in results {
        warmed.insert(channel.id().to_string(), serde_json::Value::Bool(ok));
    }

    (
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        serde_json::json!({ "prewarmed": warmed }).to_string(),
    )
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let cached: Vec<&str> = state
        .cache
        .cached_channels()
        .iter()
        .map(|c| c.id())
        .collect();

    (
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        serde_json::json!({
            "status": "ok",
            "cached": cached,
        })
        .to_string(),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stream", get(stream_info))
        .route("/proxy", get(proxy_artifact))
        .route("/refresh/{channel}", post(refresh_channel))
        .route("/prewarm", post(prewarm))
        .route("/health", get(health))
        .with_state(state)
}

/**
    Run the HTTP server until the shutdown signal flips.
*/
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown_rx.borrow_and_update() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}
