use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::{Path, RawQuery, State},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use url::{Url, form_urlencoded};

use antena_channels::{Broadcaster, Channel, is_manifest_path, is_segment_path, parse_proxy_reference};

use crate::cache::{CacheStore, CachedResponse};

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<dyn CacheStore>,
    pub client: reqwest::Client,
    /// Base URL of the origin relay, no trailing slash.
    pub origin: String,
    /// Freshness window for cached segments.
    pub cache_ttl: Duration,
}

fn parse_channel(id: &str) -> Result<Channel, (StatusCode, String)> {
    Channel::parse(id)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown channel '{}'", id)))
}

/**
    Upstream URL for a channel resource. Authenticated channels go through
    the origin relay; public channels are fetched straight from their CDN.
*/
fn upstream_url(state: &AppState, channel: Channel, resource: Option<&str>) -> String {
    match channel.broadcaster() {
        Broadcaster::Altavoz => match resource {
            None => format!("{}/proxy?channel={}", state.origin, channel.id()),
            Some(resource) => {
                let encoded: String =
                    form_urlencoded::byte_serialize(resource.as_bytes()).collect();
                format!(
                    "{}/proxy?channel={}&path={}",
                    state.origin,
                    channel.id(),
                    encoded
                )
            }
        },
        Broadcaster::Austral => match resource {
            None => channel.public_stream_url(),
            Some(resource) => format!("{}/{}", public_base_dir(channel), resource),
        },
    }
}

/// Directory of the channel's public master manifest.
fn public_base_dir(channel: Channel) -> String {
    let master = channel.public_stream_url();
    match master.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => master,
    }
}

/**
    Second rewriting pass: turn every manifest reference into the edge's own
    `/{channel}/{resource}` shape, whatever form the upstream handed back
    (the origin relay's query form, an absolute CDN URL, or a bare relative
    reference). Lines already in edge shape pass through.
*/
pub fn rewrite_for_edge(channel: Channel, manifest: &str) -> String {
    let mut out = String::with_capacity(manifest.len());
    for line in manifest.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
        } else if let Some((ch, reference)) = parse_proxy_reference(trimmed) {
            out.push_str(&format!("/{}/{}", ch.id(), reference));
        } else if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            out.push_str(&map_absolute(channel, trimmed));
        } else if trimmed.starts_with('/') {
            out.push_str(line);
        } else {
            out.push_str(&format!("/{}/{}", channel.id(), trimmed));
        }
        out.push('\n');
    }
    out
}

/**
    Map an absolute reference into edge shape. References under the
    channel's public base keep their relative path; anything else (the
    provider relocating streams mid-flight) falls back to its final path
    component, which the next fetch re-joins against the channel base.
*/
fn map_absolute(channel: Channel, reference: &str) -> String {
    let base = format!("{}/", public_base_dir(channel));
    if let Some(rest) = reference.strip_prefix(&base) {
        return format!("/{}/{}", channel.id(), rest);
    }

    match Url::parse(reference) {
        Ok(url) => {
            let name = url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or("");
            match url.query() {
                Some(query) => format!("/{}/{}?{}", channel.id(), name, query),
                None => format!("/{}/{}", channel.id(), name),
            }
        }
        Err(_) => reference.to_string(),
    }
}

fn manifest_response(body: String) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .body(Body::from(body))
        .unwrap()
}

fn segment_response(entry: CachedResponse, ttl: Duration, cache_state: &str) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, entry.content_type)
        .header(
            header::CACHE_CONTROL,
            format!("public, max-age={}", ttl.as_secs()),
        )
        .header("x-cache", cache_state)
        .body(Body::from(entry.body))
        .unwrap()
}

async fn fetch(
    client: &reqwest::Client,
    target: &str,
) -> Result<reqwest::Response, (StatusCode, String)> {
    client.get(target).send().await.map_err(|e| {
        if e.is_timeout() {
            (
                StatusCode::GATEWAY_TIMEOUT,
                "upstream fetch timed out".to_string(),
            )
        } else {
            (
                StatusCode::BAD_GATEWAY,
                format!("upstream fetch failed: {}", e),
            )
        }
    })
}

/**
    Master manifest: always fetched upstream, never cached, rewritten into
    edge shape.
*/
async fn playlist(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    let channel = parse_channel(&channel_id)?;

    let target = upstream_url(&state, channel, None);
    let response = fetch(&state.client, &target).await?;

    let status = response.status();
    if !status.is_success() {
        // Pass the upstream status through verbatim; clients retry.
        return Err((status, format!("upstream returned {}", status)));
    }

    let body = response
        .text()
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;

    Ok(manifest_response(rewrite_for_edge(channel, &body)))
}

/**
    Chunklist or segment. Segment-shaped paths are answered from the edge
    cache when possible and stored on miss; manifest-shaped paths are always
    fetched and rewritten, never cached.
*/
async fn resource(
    State(state): State<AppState>,
    Path((channel_id, resource)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Result<Response, (StatusCode, String)> {
    let channel = parse_channel(&channel_id)?;

    let resource = match query {
        Some(query) => format!("{}?{}", resource, query),
        None => resource,
    };
    let cache_key = format!("/{}/{}", channel.id(), resource);
    let cacheable = is_segment_path(&resource);

    if cacheable {
        if let Some(hit) = state.cache.get(&cache_key).await {
            return Ok(segment_response(hit, state.cache_ttl, "HIT"));
        }
    }

    let target = upstream_url(&state, channel, Some(&resource));
    let response = fetch(&state.client, &target).await?;

    let status = response.status();
    if !status.is_success() {
        return Err((status, format!("upstream returned {}", status)));
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let is_manifest = is_manifest_path(&resource)
        || content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("mpegurl"));

    if is_manifest {
        let body = response
            .text()
            .await
            .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
        return Ok(manifest_response(rewrite_for_edge(channel, &body)));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
    let entry = CachedResponse {
        body,
        content_type: content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
    };

    if cacheable {
        state
            .cache
            .put(&cache_key, entry.clone(), state.cache_ttl)
            .await;
    }

    Ok(segment_response(entry, state.cache_ttl, "MISS"))
}

async fn health() -> impl IntoResponse {
    let authenticated: Vec<&str> = Channel::ALL
        .iter()
        .filter(|c| c.is_authenticated())
        .map(|c| c.id())
        .collect();
    let public: Vec<&str> = Channel::ALL
        .iter()
        .filter(|c| !c.is_authenticated())
        .map(|c| c.id())
        .collect();

    (
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        serde_json::json!({
            "status": "ok",
            "channels": {
                "authenticated": authenticated,
                "public": public,
            },
        })
        .to_string(),
    )
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS]);

    Router::new()
        .route("/health", get(health))
        .route("/{channel}/playlist.m3u8", get(playlist))
        .route("/{channel}/{*resource}", get(resource))
        .layer(cors)
        .with_state(state)
}

/**
    Run the edge HTTP server until the shutdown signal flips.
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
