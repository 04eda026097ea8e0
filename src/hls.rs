use m3u8_rs::Playlist;
use tracing::{debug, warn};
use url::Url;

/// Content types that mark a body as an HLS playlist.
const PLAYLIST_CONTENT_TYPES: &[&str] = &[
    "application/vnd.apple.mpegurl",
    "application/x-mpegurl",
    "audio/mpegurl",
    "audio/x-mpegurl",
];

/// Whether a fetched body should be treated as an HLS playlist.
pub fn is_playlist(content_type: Option<&str>, url: &Url) -> bool {
    if let Some(ct) = content_type {
        let ct = ct.split(';').next().unwrap_or(ct).trim();
        if PLAYLIST_CONTENT_TYPES
            .iter()
            .any(|known| ct.eq_ignore_ascii_case(known))
        {
            return true;
        }
    }
    url.path().to_ascii_lowercase().ends_with(".m3u8")
}

/// Extract the URLs referenced by a playlist body, resolved against the
/// playlist's own URL. Master playlists yield their variant (and alternative
/// media) playlist URLs; media playlists yield their segment URLs.
/// Unparseable bodies yield nothing.
pub fn referenced_urls(base: &Url, body: &[u8]) -> Vec<Url> {
    let playlist = match m3u8_rs::parse_playlist_res(body) {
        Ok(playlist) => playlist,
        Err(e) => {
            warn!("Failed to parse playlist at {base}: {e}");
            return Vec::new();
        }
    };

    let uris: Vec<String> = match playlist {
        Playlist::MasterPlaylist(master) => master
            .variants
            .iter()
            .map(|v| v.uri.clone())
            .chain(
                master
                    .alternatives
                    .iter()
                    .filter_map(|alt| alt.uri.clone()),
            )
            .collect(),
        Playlist::MediaPlaylist(media) => {
            media.segments.iter().map(|s| s.uri.clone()).collect()
        }
    };

    let mut urls = Vec::with_capacity(uris.len());
    for uri in uris {
        match base.join(&uri) {
            Ok(url) => urls.push(url),
            Err(e) => debug!("Skipping unresolvable playlist entry {uri}: {e}"),
        }
    }
    urls
}
