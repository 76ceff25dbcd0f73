use anyhow::{Result, anyhow};
use url::Url;

use antena_channels::{Channel, proxy_reference};

/**
    Whether an upstream response is a playlist rather than media bytes.
    Content type wins when present; some CDN configs serve playlists as
    `text/plain`, so the URL path is the fallback signal.
*/
pub fn is_manifest_response(target: &Url, content_type: Option<&str>) -> bool {
    if let Some(content_type) = content_type {
        if content_type.to_ascii_lowercase().contains("mpegurl") {
            return true;
        }
    }
    antena_channels::is_manifest_path(target.path())
}

/**
    Resolve a manifest reference against the master manifest URL. References
    are either already absolute or relative to the master's directory.
*/
pub fn resolve_reference(master: &Url, reference: &str) -> Result<Url> {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return Url::parse(reference)
            .map_err(|e| anyhow!("invalid absolute reference '{}': {}", reference, e));
    }
    master
        .join(reference)
        .map_err(|e| anyhow!("cannot resolve '{}' against {}: {}", reference, master, e))
}

/**
    Rewrite a playlist so every reference routes back through the relay.

    Each non-comment, non-blank line is a reference and becomes a
    `/proxy?channel=..&path=..` URL. Lines already in proxy form pass
    through untouched, so rewriting is idempotent and never double-encodes.
*/
pub fn rewrite_manifest(channel: Channel, manifest: &str) -> String {
    let mut out = String::with_capacity(manifest.len());
    for line in manifest.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("/proxy?") {
            out.push_str(line);
        } else {
            out.push_str(&proxy_reference(channel, trimmed));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U\n\
                          #EXT-X-VERSION:3\n\
                          #EXT-X-STREAM-INF:BANDWIDTH=128000,CODECS=\"mp4a.40.2\"\n\
                          chunklist_w1917158403.m3u8\n";

    #[test]
    fn rewrites_every_reference_line() {
        let rewritten = rewrite_manifest(Channel::Fm903, MASTER);
        for line in rewritten.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            assert!(
                line.starts_with("/proxy?channel=903&path="),
                "unexpected reference line: {}",
                line
            );
        }
        assert!(rewritten.contains("/proxy?channel=903&path=chunklist_w1917158403.m3u8"));
    }

    #[test]
    fn rewriting_is_idempotent() {
        let once = rewrite_manifest(Channel::Fm903, MASTER);
        let twice = rewrite_manifest(Channel::Fm903, &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn comments_and_blank_lines_survive_untouched() {
        let manifest = "#EXTM3U\n\n#EXT-X-TARGETDURATION:4\nmedia_1.aac\n";
        let rewritten = rewrite_manifest(Channel::Fm959, manifest);
        assert!(rewritten.contains("#EXTM3U\n"));
        assert!(rewritten.contains("\n\n"));
        assert!(rewritten.contains("#EXT-X-TARGETDURATION:4\n"));
        assert!(rewritten.contains("/proxy?channel=959&path=media_1.aac\n"));
    }

    #[test]
    fn resolves_relative_and_absolute_references() {
        let master =
            Url::parse("https://live-a.altavozmedia.cl/radio/903hd/playlist.m3u8").unwrap();

        let relative = resolve_reference(&master, "chunklist.m3u8?token=x").unwrap();
        assert_eq!(
            relative.as_str(),
            "https://live-a.altavozmedia.cl/radio/903hd/chunklist.m3u8?token=x"
        );

        let absolute =
            resolve_reference(&master, "https://live-b.altavozmedia.cl/radio/903hd/media_9.aac")
                .unwrap();
        assert_eq!(absolute.host_str(), Some("live-b.altavozmedia.cl"));
    }

    #[test]
    fn manifest_detection_prefers_content_type() {
        let manifest_url =
            Url::parse("https://live-a.altavozmedia.cl/radio/903hd/playlist.m3u8").unwrap();
        let segment_url =
            Url::parse("https://live-a.altavozmedia.cl/radio/903hd/media_1.aac").unwrap();

        assert!(is_manifest_response(&manifest_url, None));
        assert!(is_manifest_response(
            &segment_url,
            Some("application/vnd.apple.mpegurl")
        ));
        assert!(!is_manifest_response(&segment_url, Some("audio/aac")));
        assert!(!is_manifest_response(&segment_url, None));
    }
}
