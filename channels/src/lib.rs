/*!
    Shared channel taxonomy for the stream relay.

    Both the origin relay and the edge router need to agree on which channels
    exist, which broadcaster serves them, and how references are encoded when
    a manifest is rewritten to route through the relay. That contract lives
    here so the two processes cannot drift apart.
*/
use std::fmt;

use url::form_urlencoded;

/**
    The two interchangeable CDN hosts fronting the authenticated broadcaster.

    Both are CNAMEs of the same distribution; signed cookies issued for one
    are honored by the other, and streams occasionally move between them.
*/
pub const CDN_HOSTS: [&str; 2] = ["live-a.altavozmedia.cl", "live-b.altavozmedia.cl"];

/**
    The signed-cookie triplet that authorizes access to restricted stream
    paths. A credential missing any of the three is useless and must be
    discarded.
*/
pub const REQUIRED_COOKIES: [&str; 3] = [
    "CloudFront-Key-Pair-Id",
    "CloudFront-Policy",
    "CloudFront-Signature",
];

/// Web origin of the authenticated broadcaster's player pages.
pub const PLAYER_ORIGIN: &str = "https://www.altavoz.cl";

/**
    User agent presented to both broadcasters, by the headless player session
    and by every relay fetch. The CDNs fingerprint obvious non-browser
    clients, so the two must match.
*/
pub const PLAYER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/**
    Pattern matched against outgoing browser requests to spot the master
    manifest. The segment-server hostname is not guessable in advance (either
    CDN host may serve a given session), so both are accepted.
*/
pub const MANIFEST_URL_PATTERN: &str = r"^https://live-[ab]\.altavozmedia\.cl/.+\.m3u8";

/**
    Which broadcaster a channel belongs to, which decides the entire fetch
    path: Altavoz streams are cookie-signed and must go through the origin
    relay, Austral streams are public and fetched straight from its CDN.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Broadcaster {
    /// Terrestrial broadcaster with geo-restricted, cookie-signed streams.
    Altavoz,
    /// Public broadcaster, no credential machinery.
    Austral,
}

impl Broadcaster {
    pub fn name(&self) -> &'static str {
        match self {
            Broadcaster::Altavoz => "altavoz",
            Broadcaster::Austral => "austral",
        }
    }
}

/**
    The fixed set of relayed channels.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Altavoz 90.3 FM. The only channel with hd/sd stream variants.
    Fm903,
    /// Altavoz 95.9 FM.
    Fm959,
    /// Altavoz 104.1 FM.
    Fm1041,
    /// Radio Austral main signal.
    Austral,
    /// Radio Austral's classical channel.
    AustralClasica,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Fm903,
        Channel::Fm959,
        Channel::Fm1041,
        Channel::Austral,
        Channel::AustralClasica,
    ];

    /**
        Parse a channel identifier as it appears in URLs. Unknown identifiers
        are rejected here, before any upstream request is made.
    */
    pub fn parse(id: &str) -> Option<Channel> {
        Channel::ALL.iter().copied().find(|c| c.id() == id)
    }

    pub fn id(&self) -> &'static str {
        match self {
            Channel::Fm903 => "903",
            Channel::Fm959 => "959",
            Channel::Fm1041 => "1041",
            Channel::Austral => "austral",
            Channel::AustralClasica => "clasica",
        }
    }

    pub fn broadcaster(&self) -> Broadcaster {
        match self {
            Channel::Fm903 | Channel::Fm959 | Channel::Fm1041 => Broadcaster::Altavoz,
            Channel::Austral | Channel::AustralClasica => Broadcaster::Austral,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.broadcaster() == Broadcaster::Altavoz
    }

    /// Channels that require credential extraction.
    pub fn authenticated() -> impl Iterator<Item = Channel> {
        Channel::ALL.iter().copied().filter(Channel::is_authenticated)
    }

    /**
        The public player page for an authenticated channel. Navigating here
        and starting playback is what makes the broadcaster issue signed
        cookies.
    */
    pub fn player_url(&self) -> String {
        format!("{}/radio/{}/en-vivo", PLAYER_ORIGIN, self.id())
    }

    /**
        Stream name inside CDN paths. 90.3 defaults to its high-definition
        variant; the others have a single variant.
    */
    pub fn stream_name(&self) -> &'static str {
        match self {
            Channel::Fm903 => "903hd",
            Channel::Fm959 => "959",
            Channel::Fm1041 => "1041",
            Channel::Austral => "austral",
            Channel::AustralClasica => "clasica",
        }
    }

    /// Whether the channel publishes hd/sd stream variants.
    pub fn has_quality_variants(&self) -> bool {
        matches!(self, Channel::Fm903)
    }

    /**
        Deterministic master manifest URL for an authenticated channel, used
        when the player was not observed requesting one.
    */
    pub fn default_stream_url(&self) -> String {
        format!(
            "https://{}/radio/{}/playlist.m3u8",
            CDN_HOSTS[0],
            self.stream_name()
        )
    }

    /// Public CDN master manifest URL for an unauthenticated channel.
    pub fn public_stream_url(&self) -> String {
        format!("https://streams.radioaustral.cl/{}/playlist.m3u8", self.id())
    }

    /**
        Swap the hd/sd suffix in a stream URL, for channels that publish both
        variants. Returns None when the channel has no variants or the URL
        carries no recognizable suffix.
    */
    pub fn swap_quality_suffix(&self, stream_url: &str) -> Option<String> {
        if !self.has_quality_variants() {
            return None;
        }
        if stream_url.contains("903hd") {
            Some(stream_url.replace("903hd", "903sd"))
        } else if stream_url.contains("903sd") {
            Some(stream_url.replace("903sd", "903hd"))
        } else {
            None
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/**
    The other member of the interchangeable CDN host pair.
*/
pub fn alternate_cdn_host(host: &str) -> Option<&'static str> {
    if host == CDN_HOSTS[0] {
        Some(CDN_HOSTS[1])
    } else if host == CDN_HOSTS[1] {
        Some(CDN_HOSTS[0])
    } else {
        None
    }
}

/**
    Encode a manifest reference as a relay proxy URL.

    This is the reference form the origin relay writes into manifests, and
    the form the edge router recognizes when it rewrites them again into its
    own path shape.
*/
pub fn proxy_reference(channel: Channel, reference: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(reference.as_bytes()).collect();
    format!("/proxy?channel={}&path={}", channel.id(), encoded)
}

/**
    Decode a relay proxy reference back into `(channel, reference)`.
    Returns None for anything that is not a well-formed proxy reference.
*/
pub fn parse_proxy_reference(line: &str) -> Option<(Channel, String)> {
    let query = line.strip_prefix("/proxy?")?;

    let mut channel = None;
    let mut path = None;
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "channel" => channel = Channel::parse(&value),
            "path" => path = Some(value.into_owned()),
            _ => {}
        }
    }

    Some((channel?, path?))
}

/**
    Whether a resource path names a media segment (as opposed to a playlist).
    The edge cache only ever stores segment-shaped resources.
*/
pub fn is_segment_path(path: &str) -> bool {
    let bare = path.split(['?', '#']).next().unwrap_or(path);
    let ext = match bare.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return false,
    };
    matches!(ext.as_str(), "ts" | "aac" | "m4a" | "m4s" | "mp4" | "mp3")
}

/// Whether a resource path names an HLS playlist.
pub fn is_manifest_path(path: &str) -> bool {
    let bare = path.split(['?', '#']).next().unwrap_or(path);
    bare.ends_with(".m3u8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_all_ids() {
        for channel in Channel::ALL {
            assert_eq!(Channel::parse(channel.id()), Some(channel));
        }
        assert_eq!(Channel::parse("905"), None);
        assert_eq!(Channel::parse(""), None);
    }

    #[test]
    fn authenticated_channels_are_the_altavoz_ones() {
        let ids: Vec<&str> = Channel::authenticated().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["903", "959", "1041"]);
    }

    #[test]
    fn cdn_host_pair_swaps_both_ways() {
        assert_eq!(alternate_cdn_host(CDN_HOSTS[0]), Some(CDN_HOSTS[1]));
        assert_eq!(alternate_cdn_host(CDN_HOSTS[1]), Some(CDN_HOSTS[0]));
        assert_eq!(alternate_cdn_host("streams.radioaustral.cl"), None);
    }

    #[test]
    fn quality_suffix_swaps_only_for_903() {
        let url = "https://live-a.altavozmedia.cl/radio/903hd/playlist.m3u8";
        assert_eq!(
            Channel::Fm903.swap_quality_suffix(url).as_deref(),
            Some("https://live-a.altavozmedia.cl/radio/903sd/playlist.m3u8")
        );
        assert_eq!(Channel::Fm959.swap_quality_suffix(url), None);
        assert_eq!(
            Channel::Fm903.swap_quality_suffix("https://example.com/other.m3u8"),
            None
        );
    }

    #[test]
    fn proxy_reference_round_trips() {
        let reference = "chunklist_w1234.m3u8?token=a b&x=1";
        let line = proxy_reference(Channel::Fm903, reference);
        assert!(line.starts_with("/proxy?channel=903&path="));
        assert_eq!(
            parse_proxy_reference(&line),
            Some((Channel::Fm903, reference.to_string()))
        );
    }

    #[test]
    fn parse_proxy_reference_rejects_other_shapes() {
        assert_eq!(parse_proxy_reference("chunklist.m3u8"), None);
        assert_eq!(parse_proxy_reference("/proxy?channel=999&path=x"), None);
        assert_eq!(parse_proxy_reference("/proxy?channel=903"), None);
        assert_eq!(parse_proxy_reference("https://example.com/a.aac"), None);
    }

    #[test]
    fn segment_and_manifest_paths_are_distinguished() {
        assert!(is_segment_path("media_903hd_1234.aac"));
        assert!(is_segment_path("seg-5.ts?wowzasessionid=1"));
        assert!(is_segment_path("init.mp4"));
        assert!(!is_segment_path("chunklist_w1234.m3u8"));
        assert!(!is_segment_path("playlist"));

        assert!(is_manifest_path("playlist.m3u8"));
        assert!(is_manifest_path("chunklist.m3u8?token=x"));
        assert!(!is_manifest_path("media.aac"));
    }
}
