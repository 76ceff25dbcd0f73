use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;

use antena_channels::Channel;

/// How long extracted credentials stay usable before a re-extraction.
pub const DEFAULT_TTL: Duration = Duration::from_secs(45 * 60);

/**
    Upper bound on a single extraction, over and above the extractor's own
    internal deadlines. A stalled browser session must not hold the
    per-channel slot forever.
*/
const EXTRACTION_DEADLINE: Duration = Duration::from_secs(90);

/// How long a coalesced request waits on another request's extraction.
const WAITER_TIMEOUT: Duration = Duration::from_secs(120);

/**
    Signed access credentials for one channel, as harvested from the
    broadcaster's web player.
*/
#[derive(Debug, Clone)]
pub struct StreamCredential {
    pub channel: Channel,
    /// Master manifest URL observed during extraction (or the deterministic
    /// fallback when playback never requested one).
    pub stream_url: String,
    /// The signed-cookie set, name → value.
    pub cookies: HashMap<String, String>,
    /// Host the cookies were scoped to; either of the CDN host pair.
    pub cookie_domain: String,
    pub extracted_at: Instant,
}

impl StreamCredential {
    pub fn age(&self) -> Duration {
        self.extracted_at.elapsed()
    }

    /**
        Render the cookie map as a `Cookie` request header value. Sorted by
        name so the header is stable across requests.
    */
    pub fn cookie_header(&self) -> String {
        let mut pairs: Vec<(&String, &String)> = self.cookies.iter().collect();
        pairs.sort_by_key(|(name, _)| name.as_str());
        pairs
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/**
    Anything that can produce credentials for a channel.

    Failure is a value, not an exception: extraction problems resolve to
    `None` and the next request simply retries from scratch.
*/
#[async_trait]
pub trait CredentialExtractor: Send + Sync {
    async fn extract(&self, channel: Channel) -> Option<StreamCredential>;
}

enum Role<'a> {
    /// This request runs the extraction.
    Owner(SlotGuard<'a>),
    /// Another request is already extracting; ride its completion signal.
    Waiter(watch::Receiver<()>),
}

/**
    Per-channel credential store and extraction coordinator.

    Guarantees at most one in-flight extraction per channel: concurrent
    requests for a cold channel coalesce onto a single browser session, and
    all of them observe that session's outcome. Freshness is checked on every
    read; there is no background sweeper.
*/
pub struct CredentialCache {
    extractor: Arc<dyn CredentialExtractor>,
    ttl: Duration,
    creds: Mutex<HashMap<Channel, StreamCredential>>,
    /// One entry per in-flight extraction; the receiver wakes waiters when
    /// the owning request drops its slot.
    inflight: Mutex<HashMap<Channel, watch::Receiver<()>>>,
}

impl CredentialCache {
    pub fn new(extractor: Arc<dyn CredentialExtractor>, ttl: Duration) -> Self {
        Self {
            extractor,
            ttl,
            creds: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /**
        Get credentials for a channel, extracting on demand.

        Cache hit returns immediately. On a miss, the first request claims
        the channel's extraction slot and runs the extractor under a
        deadline; requests arriving meanwhile wait for that extraction and
        share its result. Returns None when no credential could be obtained;
        that is a retryable condition.
    */
    pub async fn get(&self, channel: Channel) -> Option<StreamCredential> {
        if let Some(credential) = self.fresh(channel) {
            return Some(credential);
        }

        let role = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get(&channel) {
                Some(rx) => Role::Waiter(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(());
                    inflight.insert(channel, rx);
                    Role::Owner(SlotGuard {
                        cache: self,
                        channel,
                        _tx: tx,
                    })
                }
            }
        };

        match role {
            Role::Owner(slot) => {
                println!("[cache] Extracting credentials for '{}'...", channel);
                let outcome =
                    tokio::time::timeout(EXTRACTION_DEADLINE, self.extractor.extract(channel))
                        .await;
                let credential = match outcome {
                    Ok(credential) => credential,
                    Err(_) => {
                        eprintln!("[cache] Extraction deadline hit for '{}'", channel);
                        None
                    }
                };

                if let Some(ref credential) = credential {
                    println!(
                        "[cache] Credentials cached for '{}' ({} cookies)",
                        channel,
                        credential.cookies.len()
                    );
                    self.creds.lock().unwrap().insert(channel, credential.clone());
                } else {
                    eprintln!("[cache] No credentials obtained for '{}'", channel);
                }

                // Releases the slot and wakes every waiter.
                drop(slot);
                credential
            }
            Role::Waiter(mut rx) => {
                println!("[cache] Awaiting in-flight extraction for '{}'", channel);
                // changed() errors when the owner drops its sender; either
                // way the shared outcome is whatever the cache now holds.
                let _ = tokio::time::timeout(WAITER_TIMEOUT, rx.changed()).await;
                self.fresh(channel)
            }
        }
    }

    /**
        Point a cached credential at a new master manifest URL, after the
        fallback ladder lands somewhere other than the recorded URL. Later
        requests then fetch (and resolve references against) the URL that
        actually works.
    */
    pub fn update_stream_url(&self, channel: Channel, stream_url: &str) {
        let mut creds = self.creds.lock().unwrap();
        if let Some(credential) = creds.get_mut(&channel) {
            if credential.stream_url != stream_url {
                println!("[cache] Stream URL for '{}' is now {}", channel, stream_url);
                credential.stream_url = stream_url.to_string();
            }
        }
    }

    /**
        Drop a channel's cached credential, forcing the next request to
        re-extract. Used when the upstream CDN rejects the cookies.
    */
    pub fn evict(&self, channel: Channel) -> bool {
        let removed = self.creds.lock().unwrap().remove(&channel).is_some();
        if removed {
            println!("[cache] Evicted credentials for '{}'", channel);
        }
        removed
    }

    /// Channels currently holding a fresh credential.
    pub fn cached_channels(&self) -> Vec<Channel> {
        let ttl = self.ttl;
        let mut creds = self.creds.lock().unwrap();
        creds.retain(|_, credential| credential.age() <= ttl);
        let mut channels: Vec<Channel> = creds.keys().copied().collect();
        channels.sort_by_key(|c| c.id());
        channels
    }

    /**
        Return the cached credential if it is still within TTL. Stale entries
        are removed on the spot so they can never be served.
    */
    fn fresh(&self, channel: Channel) -> Option<StreamCredential> {
        let mut creds = self.creds.lock().unwrap();
        match creds.get(&channel) {
            Some(credential) if credential.age() <= self.ttl => Some(credential.clone()),
            Some(_) => {
                creds.remove(&channel);
                None
            }
            None => None,
        }
    }
}

/**
    Ownership of a channel's extraction slot. Dropping it removes the
    in-flight entry and then drops the watch sender, waking waiters. That
    holds even when the owning request is cancelled mid-extraction, so an
    abandoned request can never wedge the slot.
*/
struct SlotGuard<'a> {
    cache: &'a CredentialCache,
    channel: Channel,
    _tx: watch::Sender<()>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        // Remove the entry first; the sender (and with it the wakeup)
        // drops right after, once the slot is actually free.
        self.cache.inflight.lock().unwrap().remove(&self.channel);
    }
}

/**
    Extractor stub shared by this crate's tests: counts invocations,
    optionally fails, optionally dawdles, optionally points the credential's
    stream URL at an in-process upstream.
*/
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    pub struct StubExtractor {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
        stream_url: Option<String>,
    }

    impl StubExtractor {
        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
                stream_url: None,
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        pub fn with_stream_url(mut self, url: impl Into<String>) -> Self {
            self.stream_url = Some(url.into());
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn into_cache(self, ttl: Duration) -> (Arc<CredentialCache>, Arc<Self>) {
            let extractor = Arc::new(self);
            let cache = Arc::new(CredentialCache::new(extractor.clone(), ttl));
            (cache, extractor)
        }
    }

    #[async_trait]
    impl CredentialExtractor for StubExtractor {
        async fn extract(&self, channel: Channel) -> Option<StreamCredential> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return None;
            }
            let mut cookies = HashMap::new();
            for name in antena_channels::REQUIRED_COOKIES {
                cookies.insert(name.to_string(), format!("value-{}", n));
            }
            Some(StreamCredential {
                channel,
                stream_url: self.stream_url.clone().unwrap_or_else(|| {
                    format!(
                        "https://live-a.altavozmedia.cl/radio/{}/playlist.m3u8",
                        channel.stream_name()
                    )
                }),
                cookies,
                cookie_domain: "live-a.altavozmedia.cl".to_string(),
                extracted_at: Instant::now(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StubExtractor;
    use super::*;

    #[tokio::test]
    async fn concurrent_cold_requests_share_one_extraction() {
        let (cache, extractor) = StubExtractor::new()
            .with_delay(Duration::from_millis(100))
            .into_cache(DEFAULT_TTL);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.get(Channel::Fm903).await }));
        }

        let mut urls = Vec::new();
        for handle in handles {
            let credential = handle.await.unwrap().expect("all waiters share the result");
            urls.push(credential.stream_url);
        }

        assert_eq!(extractor.calls(), 1);
        assert!(urls.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn concurrent_cold_requests_share_one_failure() {
        let (cache, extractor) = StubExtractor::new()
            .with_delay(Duration::from_millis(50))
            .failing()
            .into_cache(DEFAULT_TTL);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.get(Channel::Fm959).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_none());
        }

        assert_eq!(extractor.calls(), 1);
    }

    #[tokio::test]
    async fn expired_credentials_are_never_served() {
        let ttl = Duration::from_millis(50);
        let (cache, extractor) = StubExtractor::new().into_cache(ttl);

        assert!(cache.get(Channel::Fm903).await.is_some());
        assert_eq!(extractor.calls(), 1);
        assert_eq!(cache.cached_channels(), vec![Channel::Fm903]);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.cached_channels().is_empty());

        // The read past TTL triggers a fresh extraction instead.
        assert!(cache.get(Channel::Fm903).await.is_some());
        assert_eq!(extractor.calls(), 2);
    }

    #[tokio::test]
    async fn eviction_forces_re_extraction() {
        let (cache, extractor) = StubExtractor::new().into_cache(DEFAULT_TTL);

        assert!(cache.get(Channel::Fm1041).await.is_some());
        assert!(cache.evict(Channel::Fm1041));
        assert!(!cache.evict(Channel::Fm1041));

        assert!(cache.get(Channel::Fm1041).await.is_some());
        assert_eq!(extractor.calls(), 2);
    }

    #[tokio::test]
    async fn channels_do_not_contend_with_each_other() {
        let (cache, extractor) = StubExtractor::new()
            .with_delay(Duration::from_millis(50))
            .into_cache(DEFAULT_TTL);

        let a = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get(Channel::Fm903).await })
        };
        let b = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get(Channel::Fm959).await })
        };

        assert!(a.await.unwrap().is_some());
        assert!(b.await.unwrap().is_some());
        assert_eq!(extractor.calls(), 2);
    }

    #[test]
    fn cookie_header_is_sorted_and_joined() {
        let mut cookies = HashMap::new();
        cookies.insert("CloudFront-Signature".to_string(), "sig".to_string());
        cookies.insert("CloudFront-Key-Pair-Id".to_string(), "kp".to_string());
        cookies.insert("CloudFront-Policy".to_string(), "pol".to_string());

        let credential = StreamCredential {
            channel: Channel::Fm903,
            stream_url: String::new(),
            cookies,
            cookie_domain: "live-a.altavozmedia.cl".to_string(),
            extracted_at: Instant::now(),
        };

        assert_eq!(
            credential.cookie_header(),
            "CloudFront-Key-Pair-Id=kp; CloudFront-Policy=pol; CloudFront-Signature=sig"
        );
    }
}
