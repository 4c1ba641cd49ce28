// Segment Catalog: the ordered list of segments a job fetches, plus the
// optional decryption descriptor shared by all of them.

use m3u8_rs::{KeyMethod, MediaPlaylist, Playlist};
use tracing::{debug, info};
use url::Url;

use super::HlsDownloaderError;

/// One addressable chunk of the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Position in the final output, contiguous from zero
    pub index: u64,
    /// `EXT-X-MEDIA-SEQUENCE` based number, used as the implicit AES IV
    pub media_sequence: u64,
    pub url: Url,
    pub duration: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptionMethod {
    /// AES-128-CBC with PKCS#7 padding
    Aes128,
}

/// Key material location and parameters, at most one per job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionDescriptor {
    pub key_url: Url,
    /// Explicit IV from the playlist; `None` means "derive from media sequence"
    pub iv: Option<[u8; 16]>,
    pub method: DecryptionMethod,
}

#[derive(Debug, Clone, Default)]
pub struct SegmentCatalog {
    segments: Vec<Segment>,
    encryption: Option<EncryptionDescriptor>,
}

impl SegmentCatalog {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn encryption(&self) -> Option<&EncryptionDescriptor> {
        self.encryption.as_ref()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Sum of the declared segment durations, in seconds
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration as f64).sum()
    }

    pub fn into_parts(self) -> (Vec<Segment>, Option<EncryptionDescriptor>) {
        (self.segments, self.encryption)
    }
}

/// Turns raw manifest text into a [`SegmentCatalog`].
pub trait ManifestParser: Send + Sync {
    fn parse(&self, raw: &str, base: &Url) -> Result<SegmentCatalog, HlsDownloaderError>;
}

/// [`ManifestParser`] backed by `m3u8-rs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct M3u8ManifestParser;

impl ManifestParser for M3u8ManifestParser {
    fn parse(&self, raw: &str, base: &Url) -> Result<SegmentCatalog, HlsDownloaderError> {
        let playlist = match m3u8_rs::parse_playlist_res(raw.as_bytes()) {
            Ok(Playlist::MediaPlaylist(pl)) => pl,
            Ok(Playlist::MasterPlaylist(_)) => {
                return Err(HlsDownloaderError::ManifestError(
                    "expected a media playlist, got a master playlist".to_string(),
                ));
            }
            Err(e) => {
                return Err(HlsDownloaderError::ManifestError(format!(
                    "failed to parse playlist: {e}"
                )));
            }
        };
        catalog_from_media_playlist(&playlist, base)
    }
}

fn catalog_from_media_playlist(
    playlist: &MediaPlaylist,
    base: &Url,
) -> Result<SegmentCatalog, HlsDownloaderError> {
    if playlist.segments.is_empty() {
        return Err(HlsDownloaderError::ManifestError(
            "playlist contains no segments".to_string(),
        ));
    }

    let mut segments = Vec::with_capacity(playlist.segments.len());
    for (i, media_segment) in playlist.segments.iter().enumerate() {
        let url = resolve_locator(&media_segment.uri, base)?;
        segments.push(Segment {
            index: i as u64,
            media_sequence: playlist.media_sequence.wrapping_add(i as u64),
            url,
            duration: media_segment.duration,
        });
    }

    let encryption = match playlist
        .segments
        .iter()
        .filter_map(|s| s.key.as_ref())
        .find(|k| k.method != KeyMethod::None)
    {
        Some(key) => Some(encryption_from_key(key, base)?),
        None => None,
    };

    let catalog = SegmentCatalog {
        segments,
        encryption,
    };
    info!(
        segments = catalog.len(),
        encrypted = catalog.encryption.is_some(),
        "Expected duration after download: {:.1}s",
        catalog.total_duration()
    );
    Ok(catalog)
}

fn encryption_from_key(
    key: &m3u8_rs::Key,
    base: &Url,
) -> Result<EncryptionDescriptor, HlsDownloaderError> {
    let method = match &key.method {
        KeyMethod::AES128 => DecryptionMethod::Aes128,
        other => {
            return Err(HlsDownloaderError::ManifestError(format!(
                "unsupported encryption method: {other:?}"
            )));
        }
    };
    let uri = key.uri.as_deref().ok_or_else(|| {
        HlsDownloaderError::ManifestError("encryption key has no URI".to_string())
    })?;
    let iv = key.iv.as_deref().map(parse_iv).transpose()?;
    Ok(EncryptionDescriptor {
        key_url: resolve_locator(uri, base)?,
        iv,
        method,
    })
}

/// Parse a `0x`-prefixed 128-bit hex IV.
pub fn parse_iv(iv_hex: &str) -> Result<[u8; 16], HlsDownloaderError> {
    let digits = iv_hex
        .strip_prefix("0x")
        .or_else(|| iv_hex.strip_prefix("0X"))
        .unwrap_or(iv_hex);
    let mut iv = [0u8; 16];
    hex::decode_to_slice(digits, &mut iv).map_err(|e| {
        HlsDownloaderError::ManifestError(format!("invalid IV '{iv_hex}': {e}"))
    })?;
    Ok(iv)
}

/// Rewrite a locator without a scheme into an absolute URL against `base`.
pub fn resolve_locator(locator: &str, base: &Url) -> Result<Url, HlsDownloaderError> {
    let locator = locator.trim();
    if let Ok(url) = Url::parse(locator) {
        return Ok(url);
    }
    let url = base.join(locator).map_err(|e| {
        HlsDownloaderError::ManifestError(format!(
            "cannot resolve '{locator}' against {base}: {e}"
        ))
    })?;
    debug!(from = locator, to = %url, "Generated absolute segment URL");
    Ok(url)
}
