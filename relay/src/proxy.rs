use std::time::Duration;

use anyhow::Result;
use reqwest::{StatusCode, header};
use url::Url;

use antena_channels::{Channel, PLAYER_ORIGIN, PLAYER_USER_AGENT, alternate_cdn_host};

use crate::credentials::{CredentialCache, StreamCredential};
use crate::hls;

/// Timeout on every upstream fetch; a hung CDN turns into a 5xx, not a stall.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/**
    Typed failure surface of the relay fetch path. Every upstream or internal
    problem resolves to one of these; nothing escapes as a panic or an
    unhandled error.
*/
#[derive(Debug)]
pub enum ProxyError {
    /// No credential could be obtained; retryable, clients should back off.
    NoCredential,
    /// Upstream answered with a non-success status, passed through verbatim.
    Upstream(StatusCode),
    /// The upstream fetch timed out.
    Timeout,
    /// Connection-level failure or malformed upstream data.
    Transport(String),
    /// The relay itself produced something unusable (bad cached URL, broken
    /// reference resolution).
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoCredential => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream(status) => *status,
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Transport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ProxyError::NoCredential => "stream credentials unavailable".to_string(),
            ProxyError::Upstream(status) => format!("upstream returned {}", status),
            ProxyError::Timeout => "upstream fetch timed out".to_string(),
            ProxyError::Transport(detail) => format!("upstream fetch failed: {}", detail),
            ProxyError::Internal(detail) => format!("proxy error: {}", detail),
        }
    }
}

/**
    A fetched HLS artifact. Manifests come back rewritten and ready to serve;
    segments stay as the open upstream response so bytes stream through
    without buffering.
*/
pub enum Artifact {
    Manifest(String),
    Segment {
        content_type: String,
        upstream: reqwest::Response,
    },
}

/// Shared HTTP client for upstream fetches, presented as the player would be.
pub fn build_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(PLAYER_USER_AGENT)
        .connect_timeout(Duration::from_secs(10))
        .timeout(REQUEST_TIMEOUT)
        .build()?)
}

/**
    Fetch an HLS artifact for a channel through its cached credentials.

    No `reference` means the master manifest, which is the only fetch that
    walks the CDN/quality fallback ladder; applying it to segment fetches
    would multiply one bad chunklist into a storm of retries. A 403 anywhere
    evicts the channel's credential so the next request re-extracts; the
    current request is not retried.
*/
pub async fn fetch_artifact(
    client: &reqwest::Client,
    cache: &CredentialCache,
    channel: Channel,
    reference: Option<&str>,
) -> Result<Artifact, ProxyError> {
    let credential = cache.get(channel).await.ok_or(ProxyError::NoCredential)?;

    let master = Url::parse(&credential.stream_url)
        .map_err(|e| ProxyError::Internal(format!("bad stream url: {}", e)))?;

    let (target, response) = match reference {
        Some(reference) => {
            let target = hls::resolve_reference(&master, reference)
                .map_err(|e| ProxyError::Internal(e.to_string()))?;
            let response = send(client, &credential, target.clone()).await?;
            (target, response)
        }
        None => {
            let (resolved, response) = fetch_master(client, &credential, channel, &master).await?;
            // Whatever rung answered becomes the channel's resolved master,
            // so later reference resolution uses the URL that works.
            if resolved != master && response.status().is_success() {
                cache.update_stream_url(channel, resolved.as_str());
            }
            (resolved, response)
        }
    };

    let status = response.status();
    if status == StatusCode::FORBIDDEN {
        eprintln!(
            "[relay] Upstream rejected credentials for '{}', evicting",
            channel
        );
        cache.evict(channel);
        return Err(ProxyError::Upstream(status));
    }
    if !status.is_success() {
        return Err(ProxyError::Upstream(status));
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if hls::is_manifest_response(&target, content_type.as_deref()) {
        let body = response
            .text()
            .await
            .map_err(|e| ProxyError::Transport(e.to_string()))?;
        Ok(Artifact::Manifest(hls::rewrite_manifest(channel, &body)))
    } else {
        Ok(Artifact::Segment {
            content_type: content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
            upstream: response,
        })
    }
}

/**
    The master-manifest fallback ladder, in order: the resolved URL, the same
    path on the alternate CDN host, and (for channels publishing hd/sd
    variants) the quality-swapped path. First non-404 wins and becomes the
    base for manifest-relative rewriting.
*/
pub fn fallback_candidates(master: &Url, channel: Channel) -> Vec<Url> {
    let mut candidates = vec![master.clone()];

    if let Some(host) = master.host_str() {
        if let Some(alternate) = alternate_cdn_host(host) {
            let mut swapped = master.clone();
            if swapped.set_host(Some(alternate)).is_ok() {
                candidates.push(swapped);
            }
        }
    }

    if let Some(quality) = channel.swap_quality_suffix(master.as_str()) {
        if let Ok(url) = Url::parse(&quality) {
            candidates.push(url);
        }
    }

    candidates
}

async fn fetch_master(
    client: &reqwest::Client,
    credential: &StreamCredential,
    channel: Channel,
    master: &Url,
) -> Result<(Url, reqwest::Response), ProxyError> {
    let mut last = None;
    for candidate in fallback_candidates(master, channel) {
        let response = send(client, credential, candidate.clone()).await?;
        if response.status() == StatusCode::NOT_FOUND {
            eprintln!(
                "[relay] 404 from {}, walking the fallback ladder",
                candidate
            );
            last = Some((candidate, response));
            continue;
        }
        return Ok((candidate, response));
    }
    // Every rung 404'd; surface the last attempt.
    last.ok_or_else(|| ProxyError::Internal("no fetch candidates".to_string()))
}

async fn send(
    client: &reqwest::Client,
    credential: &StreamCredential,
    target: Url,
) -> Result<reqwest::Response, ProxyError> {
    client
        .get(target)
        .header(header::REFERER, credential.channel.player_url())
        .header(header::ORIGIN, PLAYER_ORIGIN)
        .header(header::COOKIE, credential.cookie_header())
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProxyError::Timeout
            } else {
                ProxyError::Transport(e.to_string())
            }
        })
}
