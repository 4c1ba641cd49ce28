use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::DownloaderConfig;
use crate::proxy::ProxyConfig;

// --- Top-Level Configuration ---
#[derive(Debug, Clone, Default)]
pub struct HlsConfig {
    /// Base downloader configuration
    pub base: DownloaderConfig,
    pub playlist_config: HlsPlaylistConfig,
    pub scheduler_config: HlsSchedulerConfig,
    pub fetcher_config: HlsFetcherConfig,
    pub output_config: HlsOutputConfig,
    pub proxy_config: HlsProxyConfig,
    pub headers_config: HlsHeadersConfig,
}

// --- Playlist Configuration ---
#[derive(Debug, Clone, Default)]
pub struct HlsPlaylistConfig {
    pub variant_selection_policy: HlsVariantSelectionPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HlsVariantSelectionPolicy {
    #[default]
    HighestBitrate,
    LowestBitrate,
    ClosestToBitrate(u64),
}

// --- Scheduler Configuration ---
/// Longest accepted delay between two task submissions
pub const MAX_SUBMISSION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct HlsSchedulerConfig {
    /// Max concurrent segment tasks (W)
    pub download_concurrency: usize,
    /// Delay between two task submissions (D), not between completions
    pub submission_interval: Duration,
    /// Run decryption on the blocking pool instead of the worker task
    pub offload_decryption_to_cpu_pool: bool,
}

impl Default for HlsSchedulerConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 4,
            submission_interval: Duration::from_millis(50),
            offload_decryption_to_cpu_pool: false,
        }
    }
}

// --- Fetcher Configuration ---
#[derive(Debug, Clone)]
pub struct HlsFetcherConfig {
    /// Per-segment request timeout (T)
    pub segment_download_timeout: Duration,
    /// Extra attempts per segment after the first; zero disables retries
    pub max_segment_retries: u32,
    pub segment_retry_delay_base: Duration, // Base for exponential backoff
    pub key_download_timeout: Duration,
    pub playlist_download_timeout: Duration,
}

impl Default for HlsFetcherConfig {
    fn default() -> Self {
        Self {
            segment_download_timeout: Duration::from_secs(15),
            max_segment_retries: 0,
            segment_retry_delay_base: Duration::from_millis(500),
            key_download_timeout: Duration::from_secs(10),
            playlist_download_timeout: Duration::from_secs(15),
        }
    }
}

/// What the writer does about a segment index that never arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum GapPolicy {
    /// Hold later segments until the missing one arrives. Whatever is still
    /// held when the job drains is dropped and reported.
    #[default]
    Wait,
    /// Step over an index once its fetch is known to have failed (or the
    /// buffer limit is hit), leaving a gap in the output.
    Skip,
}

#[derive(Debug, Clone)]
pub struct HlsOutputConfig {
    pub gap_policy: GapPolicy,
    /// Max segments held back waiting for a missing index; `None` is unbounded.
    /// Exceeding it fails the job under [`GapPolicy::Wait`] and skips the
    /// missing index under [`GapPolicy::Skip`].
    pub max_buffered_segments: Option<usize>,
}

impl Default for HlsOutputConfig {
    fn default() -> Self {
        Self {
            gap_policy: GapPolicy::Wait,
            max_buffered_segments: Some(512),
        }
    }
}

// --- Proxy rotation ---
#[derive(Debug, Clone)]
pub struct HlsProxyConfig {
    /// Candidate endpoints; empty means direct connections
    pub candidates: Vec<ProxyConfig>,
    pub validation_timeout: Duration,
}

impl Default for HlsProxyConfig {
    fn default() -> Self {
        Self {
            candidates: Vec::new(),
            validation_timeout: Duration::from_secs(10),
        }
    }
}

// --- Request headers ---
#[derive(Debug, Clone)]
pub struct HlsHeadersConfig {
    /// Headers for playlist and key requests
    pub index: HeaderMap,
    /// Headers for segment requests
    pub segments: HeaderMap,
    /// User agents rotated per request; empty keeps the client default
    pub user_agents: Vec<String>,
}

impl Default for HlsHeadersConfig {
    fn default() -> Self {
        let mut segments = HeaderMap::new();
        segments.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        Self {
            index: HeaderMap::new(),
            segments,
            user_agents: default_user_agents(),
        }
    }
}

fn default_user_agents() -> Vec<String> {
    [
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
        "Mozilla/5.0 (X11; Linux x86_64; rv:127.0) Gecko/20100101 Firefox/127.0",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:127.0) Gecko/20100101 Firefox/127.0",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
