// HLS Playlist Loader: fetches the manifest text, following a master playlist
// down to one media playlist.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use m3u8_rs::{MasterPlaylist, Playlist, VariantStream};
use reqwest::header::HeaderMap;
use tracing::{debug, info};
use url::Url;

use super::HlsDownloaderError;
use super::config::HlsVariantSelectionPolicy;
use super::transport::SegmentTransport;

/// Media playlist text plus the URL its relative locators resolve against.
#[derive(Debug, Clone)]
pub struct LoadedPlaylist {
    pub url: Url,
    pub text: String,
}

pub struct PlaylistLoader {
    transport: Arc<dyn SegmentTransport>,
    headers: HeaderMap,
    timeout: Duration,
    policy: HlsVariantSelectionPolicy,
}

impl PlaylistLoader {
    pub fn new(
        transport: Arc<dyn SegmentTransport>,
        headers: HeaderMap,
        timeout: Duration,
        policy: HlsVariantSelectionPolicy,
    ) -> Self {
        Self {
            transport,
            headers,
            timeout,
            policy,
        }
    }

    /// Fetch `url`. A master playlist is resolved to the variant chosen by the
    /// selection policy. Text that does not parse is returned as-is so the
    /// job reports it as a manifest error.
    pub async fn load(&self, url: &Url) -> Result<LoadedPlaylist, HlsDownloaderError> {
        let text = self.fetch_text(url).await?;
        let master = match m3u8_rs::parse_playlist_res(text.as_bytes()) {
            Ok(Playlist::MasterPlaylist(master)) => master,
            _ => {
                return Ok(LoadedPlaylist {
                    url: url.clone(),
                    text,
                });
            }
        };

        let variant = select_variant(&master, &self.policy)?;
        let media_url = url.join(&variant.uri).map_err(|e| {
            HlsDownloaderError::ManifestError(format!(
                "cannot resolve variant '{}' against {url}: {e}",
                variant.uri
            ))
        })?;
        info!(
            bandwidth = variant.bandwidth,
            url = %media_url,
            "Selected variant from master playlist"
        );

        let text = self.fetch_text(&media_url).await?;
        if let Ok(Playlist::MasterPlaylist(_)) = m3u8_rs::parse_playlist_res(text.as_bytes()) {
            return Err(HlsDownloaderError::ManifestError(format!(
                "variant {media_url} is another master playlist"
            )));
        }
        Ok(LoadedPlaylist {
            url: media_url,
            text,
        })
    }

    async fn fetch_text(&self, url: &Url) -> Result<String, HlsDownloaderError> {
        debug!(%url, "Fetching playlist");
        let response = self
            .transport
            .get(url, self.headers.clone(), self.timeout, None)
            .await
            .map_err(|e| HlsDownloaderError::ManifestError(format!("failed to fetch {url}: {e}")))?;
        if !response.is_success() {
            return Err(HlsDownloaderError::ManifestError(format!(
                "failed to fetch {url}: HTTP {}",
                response.status
            )));
        }
        String::from_utf8(response.body.to_vec()).map_err(|e| {
            HlsDownloaderError::ManifestError(format!("playlist {url} is not valid UTF-8: {e}"))
        })
    }
}

/// Pick a variant stream, ignoring I-frame-only entries.
pub fn select_variant<'a>(
    master: &'a MasterPlaylist,
    policy: &HlsVariantSelectionPolicy,
) -> Result<&'a VariantStream, HlsDownloaderError> {
    let variants = master.variants.iter().filter(|v| !v.is_i_frame);
    let selected = match policy {
        HlsVariantSelectionPolicy::HighestBitrate => variants.max_by_key(|v| v.bandwidth),
        HlsVariantSelectionPolicy::LowestBitrate => variants.min_by_key(|v| v.bandwidth),
        HlsVariantSelectionPolicy::ClosestToBitrate(target) => {
            variants.min_by_key(|v| v.bandwidth.abs_diff(*target))
        }
    };
    selected.ok_or_else(|| {
        HlsDownloaderError::ManifestError("master playlist has no variants".to_string())
    })
}

/// Write the raw playlist text next to the output, creating parent directories.
pub async fn save_playlist(path: &Path, text: &str) -> Result<(), HlsDownloaderError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, text).await?;
    debug!(path = %path.display(), "Saved playlist");
    Ok(())
}
