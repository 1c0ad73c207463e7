// HLS playlist resolution: fetches a playlist, follows master -> variant selection and
// produces the ordered list of absolute segment URLs.

use crate::error::{DownloadError, Result};
use m3u8_rs::{MasterPlaylist, MediaPlaylist, parse_playlist_res};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// One quality alternative listed by a master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub bandwidth: u64,
    pub uri: Url,
}

/// One media segment reference.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRef {
    pub uri: Url,
    /// Declared `#EXTINF` duration in seconds
    pub duration: f64,
}

/// A parsed playlist with every URI resolved against the playlist's own URL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub is_master: bool,
    pub variants: Vec<Variant>,
    pub segments: Vec<SegmentRef>,
    /// `#EXT-X-TARGETDURATION` in seconds
    pub target_duration: u64,
}

impl Manifest {
    /// Parses `body`, resolving relative URIs against `base`.
    pub fn parse(body: &[u8], base: &Url) -> Result<Self> {
        match parse_playlist_res(body) {
            Ok(m3u8_rs::Playlist::MasterPlaylist(pl)) => Self::from_master(pl, base),
            Ok(m3u8_rs::Playlist::MediaPlaylist(pl)) => Self::from_media(pl, base),
            Err(e) => Err(DownloadError::playlist(format!(
                "failed to parse playlist {base}: {e}"
            ))),
        }
    }

    fn from_master(playlist: MasterPlaylist, base: &Url) -> Result<Self> {
        let variants = playlist
            .variants
            .into_iter()
            .filter(|v| !v.is_i_frame)
            .map(|v| {
                Ok(Variant {
                    bandwidth: v.bandwidth,
                    uri: resolve_uri(base, &v.uri)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            is_master: true,
            variants,
            segments: Vec::new(),
            target_duration: 0,
        })
    }

    fn from_media(playlist: MediaPlaylist, base: &Url) -> Result<Self> {
        let segments = playlist
            .segments
            .into_iter()
            .filter(|s| !s.uri.trim().is_empty())
            .map(|s| {
                Ok(SegmentRef {
                    uri: resolve_uri(base, &s.uri)?,
                    duration: f64::from(s.duration),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            is_master: false,
            variants: Vec::new(),
            segments,
            target_duration: playlist.target_duration,
        })
    }

    /// The variant with the highest bandwidth. Ties keep the first listed.
    pub fn best_variant(&self) -> Option<&Variant> {
        self.variants.iter().reduce(|best, candidate| {
            if candidate.bandwidth > best.bandwidth {
                candidate
            } else {
                best
            }
        })
    }

    /// Sum of the declared segment durations.
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }
}

/// Resolves a playlist reference against the playlist URL.
///
/// Absolute `http(s)` URLs pass through, `//host/...` inherits the scheme, `/path`
/// inherits the origin and anything else is relative to the base directory.
pub fn resolve_uri(base: &Url, reference: &str) -> Result<Url> {
    base.join(reference.trim()).map_err(|e| {
        DownloadError::playlist(format!(
            "could not resolve `{reference}` against {base}: {e}"
        ))
    })
}

/// Fetches playlists and follows master playlists down to a media playlist.
pub struct ManifestResolver {
    client: Client,
    max_depth: usize,
}

impl ManifestResolver {
    pub fn new(client: Client, max_depth: usize) -> Self {
        Self {
            client,
            max_depth: max_depth.max(1),
        }
    }

    /// Resolves `url` to a media manifest with at least one segment.
    pub async fn resolve(&self, url: &str, token: &CancellationToken) -> Result<Manifest> {
        let mut current = Url::parse(url).map_err(|e| DownloadError::invalid_url(url, e.to_string()))?;

        for depth in 0..=self.max_depth {
            let manifest = self.load(&current, token).await?;
            if !manifest.is_master {
                if manifest.segments.is_empty() {
                    return Err(DownloadError::NoSegments {
                        url: current.to_string(),
                    });
                }
                info!(
                    url = %current,
                    segments = manifest.segments.len(),
                    target_duration = manifest.target_duration,
                    "Resolved media playlist"
                );
                return Ok(manifest);
            }

            let variant = manifest.best_variant().ok_or_else(|| {
                DownloadError::playlist(format!("master playlist {current} has no variants"))
            })?;
            debug!(
                depth,
                bandwidth = variant.bandwidth,
                variant = %variant.uri,
                "Selected highest bandwidth variant"
            );
            current = variant.uri.clone();
        }

        Err(DownloadError::playlist(format!(
            "master playlist nesting exceeds {} levels",
            self.max_depth
        )))
    }

    async fn load(&self, url: &Url, token: &CancellationToken) -> Result<Manifest> {
        let body = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            body = self.fetch_text(url) => body?,
        };
        Manifest::parse(body.as_bytes(), url)
    }

    async fn fetch_text(&self, url: &Url) -> Result<String> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::http_status(
                response.status(),
                url.as_str(),
                "playlist fetch",
            ));
        }
        Ok(response.text().await?)
    }
}
