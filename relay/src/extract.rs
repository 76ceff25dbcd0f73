use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::EventRequestWillBeSent;
use chromiumoxide::cdp::browser_protocol::storage::GetCookiesParams;
use futures::{Stream, StreamExt};
use regex::Regex;

use antena_channels::{
    CDN_HOSTS, Channel, MANIFEST_URL_PATTERN, PLAYER_USER_AGENT, REQUIRED_COOKIES,
};

use crate::credentials::{CredentialExtractor, StreamCredential};

/// Maximum wait for the player to fire its manifest request.
const MANIFEST_WAIT: Duration = Duration::from_secs(25);

/// Per-navigation timeout.
const NAV_TIMEOUT: Duration = Duration::from_secs(30);

/// Hard ceiling on one extraction, browser launch to cookie harvest.
const OVERALL_DEADLINE: Duration = Duration::from_secs(75);

/**
    Play controls probed after navigation. The player only requests the
    manifest (and only receives its signed cookies) once playback starts,
    and the broadcaster has shipped several player skins.
*/
const PLAY_SELECTORS: [&str; 5] = [
    "button.vjs-big-play-button",
    "button[aria-label=\"Reproducir\"]",
    "button[aria-label=\"Play\"]",
    ".radio-player .play-button",
    ".player-controls .play",
];

fn manifest_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(MANIFEST_URL_PATTERN).expect("manifest pattern is valid"))
}

/**
    Credential extractor that drives a headless Chrome session against the
    broadcaster's public player.

    One isolated browser per extraction: launched, driven, and torn down on
    every exit path. Failures of any kind resolve to `None` at the trait
    boundary; the caller retries on the next request.
*/
pub struct BrowserExtractor {
    headless: bool,
}

impl BrowserExtractor {
    pub fn new(headless: bool) -> Self {
        Self { headless }
    }

    fn browser_config(&self) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1280, 720)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--autoplay-policy=no-user-gesture-required")
            .arg("--mute-audio")
            .arg(format!("--user-agent={}", PLAYER_USER_AGENT))
            .arg("--lang=es-CL,es");
        if !self.headless {
            builder = builder.with_head();
        }
        builder
            .build()
            .map_err(|e| anyhow!("failed to build browser config: {}", e))
    }

    async fn extract_credential(&self, channel: Channel) -> Result<StreamCredential> {
        println!("[extract] Launching browser for '{}'...", channel);
        let (mut browser, mut handler) = Browser::launch(self.browser_config()?).await?;
        let driver = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let outcome = tokio::time::timeout(OVERALL_DEADLINE, harvest(&browser, channel)).await;

        // Tear the browser down on every path, deadline included.
        let _ = browser.close().await;
        let _ = browser.wait().await;
        driver.abort();

        match outcome {
            Ok(result) => result,
            Err(_) => Err(anyhow!("extraction deadline hit for '{}'", channel)),
        }
    }
}

#[async_trait]
impl CredentialExtractor for BrowserExtractor {
    async fn extract(&self, channel: Channel) -> Option<StreamCredential> {
        if !channel.is_authenticated() {
            eprintln!("[extract] Channel '{}' needs no credentials", channel);
            return None;
        }

        match self.extract_credential(channel).await {
            Ok(credential) => {
                println!(
                    "[extract] Credentials for '{}' scoped to {}",
                    channel, credential.cookie_domain
                );
                Some(credential)
            }
            Err(e) => {
                eprintln!("[extract] Extraction failed for '{}': {}", channel, e);
                None
            }
        }
    }
}

/**
    Drive the player page and collect the credential: navigate, trigger
    playback, watch outgoing requests for the manifest URL, then read the
    signed cookies off the browser context.
*/
async fn harvest(browser: &Browser, channel: Channel) -> Result<StreamCredential> {
    let page = browser.new_page("about:blank").await?;

    // Subscribe before navigating; the manifest request can fire at any
    // point once playback starts.
    let mut requests = page.event_listener::<EventRequestWillBeSent>().await?;

    let player_url = channel.player_url();
    println!("[extract] Navigating to {}", player_url);
    tokio::time::timeout(NAV_TIMEOUT, page.goto(player_url.as_str()))
        .await
        .map_err(|_| anyhow!("navigation to player page timed out"))??;
    let _ = tokio::time::timeout(NAV_TIMEOUT, page.wait_for_navigation()).await;

    // Let the player boot before poking at it.
    tokio::time::sleep(Duration::from_secs(2)).await;

    for selector in PLAY_SELECTORS {
        if let Ok(element) = page.find_element(selector).await {
            if element.click().await.is_ok() {
                println!("[extract] Clicked play control '{}'", selector);
                break;
            }
        }
    }

    let observed = wait_for_manifest_request(&mut requests).await;
    match &observed {
        Some(url) => println!(
            "[extract] Observed manifest request: {}",
            &url[..url.len().min(80)]
        ),
        None => println!(
            "[extract] No manifest request observed for '{}', will use the conventional URL",
            channel
        ),
    }

    // Read every cookie in the context: the signed set lives on the CDN
    // domain, not on the player page's, so a page-scoped read misses it.
    let cookies = page
        .execute(GetCookiesParams::default())
        .await?
        .result
        .cookies;
    let harvested: Vec<(String, String, String)> = cookies
        .into_iter()
        .map(|c| (c.name, c.value, c.domain))
        .collect();

    let (cookies, cookie_domain) = select_signed_cookies(&harvested)
        .ok_or_else(|| anyhow!("signed cookie set incomplete for '{}'", channel))?;

    let _ = page.goto("about:blank").await;

    Ok(StreamCredential {
        channel,
        stream_url: observed.unwrap_or_else(|| channel.default_stream_url()),
        cookies,
        cookie_domain,
        extracted_at: Instant::now(),
    })
}

/**
    Wait for the first outgoing request matching the manifest pattern.
    Resolves to None after a bounded wait instead of hanging on a player
    that never starts.
*/
async fn wait_for_manifest_request<S>(events: &mut S) -> Option<String>
where
    S: Stream<Item = std::sync::Arc<EventRequestWillBeSent>> + Unpin,
{
    let next_match = async {
        while let Some(event) = events.next().await {
            if manifest_pattern().is_match(&event.request.url) {
                return Some(event.request.url.clone());
            }
        }
        None
    };

    tokio::time::timeout(MANIFEST_WAIT, next_match)
        .await
        .unwrap_or(None)
}

/**
    Pick the signed-cookie triplet out of a raw `(name, value, domain)`
    harvest, scoped to whichever CDN host carries a complete set. A partial
    set on both hosts is a failed extraction.
*/
fn select_signed_cookies(
    harvested: &[(String, String, String)],
) -> Option<(HashMap<String, String>, String)> {
    for host in CDN_HOSTS {
        let mut set = HashMap::new();
        for (name, value, domain) in harvested {
            if cookie_matches_host(domain, host) && REQUIRED_COOKIES.contains(&name.as_str()) {
                set.insert(name.clone(), value.clone());
            }
        }
        if REQUIRED_COOKIES.iter().all(|name| set.contains_key(*name)) {
            return Some((set, host.to_string()));
        }
    }
    None
}

/// Cookie-domain match: exact host or a parent domain (`.altavozmedia.cl`).
fn cookie_matches_host(domain: &str, host: &str) -> bool {
    let domain = domain.trim_start_matches('.');
    host == domain || host.ends_with(&format!(".{}", domain))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(name: &str, value: &str, domain: &str) -> (String, String, String) {
        (name.to_string(), value.to_string(), domain.to_string())
    }

    #[test]
    fn complete_triplet_on_primary_host_is_selected() {
        let harvested = vec![
            cookie("CloudFront-Policy", "pol", "live-a.altavozmedia.cl"),
            cookie("CloudFront-Signature", "sig", "live-a.altavozmedia.cl"),
            cookie("CloudFront-Key-Pair-Id", "kp", "live-a.altavozmedia.cl"),
            cookie("session", "xyz", "www.altavoz.cl"),
        ];

        let (set, domain) = select_signed_cookies(&harvested).unwrap();
        assert_eq!(domain, "live-a.altavozmedia.cl");
        assert_eq!(set.len(), 3);
        assert_eq!(set["CloudFront-Policy"], "pol");
    }

    #[test]
    fn parent_domain_cookies_cover_both_hosts() {
        let harvested = vec![
            cookie("CloudFront-Policy", "pol", ".altavozmedia.cl"),
            cookie("CloudFront-Signature", "sig", ".altavozmedia.cl"),
            cookie("CloudFront-Key-Pair-Id", "kp", ".altavozmedia.cl"),
        ];

        let (_, domain) = select_signed_cookies(&harvested).unwrap();
        assert_eq!(domain, "live-a.altavozmedia.cl");
    }

    #[test]
    fn alternate_host_is_used_when_primary_set_is_incomplete() {
        let harvested = vec![
            cookie("CloudFront-Policy", "pol", "live-a.altavozmedia.cl"),
            cookie("CloudFront-Policy", "pol", "live-b.altavozmedia.cl"),
            cookie("CloudFront-Signature", "sig", "live-b.altavozmedia.cl"),
            cookie("CloudFront-Key-Pair-Id", "kp", "live-b.altavozmedia.cl"),
        ];

        let (_, domain) = select_signed_cookies(&harvested).unwrap();
        assert_eq!(domain, "live-b.altavozmedia.cl");
    }

    #[test]
    fn partial_cookie_sets_are_a_failure() {
        let harvested = vec![
            cookie("CloudFront-Policy", "pol", "live-a.altavozmedia.cl"),
            cookie("CloudFront-Signature", "sig", "live-a.altavozmedia.cl"),
        ];

        assert!(select_signed_cookies(&harvested).is_none());
    }

    #[test]
    fn manifest_pattern_matches_either_cdn_host() {
        let pattern = manifest_pattern();
        assert!(pattern.is_match("https://live-a.altavozmedia.cl/radio/903hd/playlist.m3u8"));
        assert!(pattern.is_match(
            "https://live-b.altavozmedia.cl/radio/959/chunklist_w1234.m3u8?token=abc"
        ));
        assert!(!pattern.is_match("https://www.altavoz.cl/radio/903/en-vivo"));
        assert!(!pattern.is_match("https://live-a.altavozmedia.cl/radio/903hd/media_1.aac"));
    }
}
