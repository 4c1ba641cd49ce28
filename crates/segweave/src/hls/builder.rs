use std::str::FromStr;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::DownloaderConfig;
use crate::proxy::ProxyConfig;

use super::config::{GapPolicy, HlsConfig, HlsVariantSelectionPolicy, MAX_SUBMISSION_INTERVAL};
use super::HlsDownloaderError;

/// Fluent builder for [`HlsConfig`]
#[derive(Debug, Clone, Default)]
pub struct HlsConfigBuilder {
    config: HlsConfig,
}

impl HlsConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: HlsConfig::default(),
        }
    }

    pub fn with_base_config(mut self, base_config: DownloaderConfig) -> Self {
        self.config.base = base_config;
        self
    }

    // --- Scheduler ---

    /// Number of concurrent segment workers
    pub fn download_concurrency(mut self, concurrency: usize) -> Self {
        self.config.scheduler_config.download_concurrency = concurrency;
        self
    }

    /// Pacing delay between task submissions
    pub fn submission_interval(mut self, interval: Duration) -> Self {
        self.config.scheduler_config.submission_interval = interval;
        self
    }

    pub fn offload_decryption(mut self, offload: bool) -> Self {
        self.config.scheduler_config.offload_decryption_to_cpu_pool = offload;
        self
    }

    // --- Fetcher ---

    pub fn segment_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetcher_config.segment_download_timeout = timeout;
        self
    }

    pub fn segment_retry_count(mut self, retries: u32) -> Self {
        self.config.fetcher_config.max_segment_retries = retries;
        self
    }

    pub fn segment_retry_delay(mut self, base: Duration) -> Self {
        self.config.fetcher_config.segment_retry_delay_base = base;
        self
    }

    pub fn key_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetcher_config.key_download_timeout = timeout;
        self
    }

    pub fn playlist_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetcher_config.playlist_download_timeout = timeout;
        self
    }

    // --- Output ---

    pub fn gap_policy(mut self, policy: GapPolicy) -> Self {
        self.config.output_config.gap_policy = policy;
        self
    }

    pub fn max_buffered_segments(mut self, limit: Option<usize>) -> Self {
        self.config.output_config.max_buffered_segments = limit;
        self
    }

    // --- Playlist ---

    pub fn variant_selection_policy(mut self, policy: HlsVariantSelectionPolicy) -> Self {
        self.config.playlist_config.variant_selection_policy = policy;
        self
    }

    // --- Proxies ---

    pub fn add_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy_config.candidates.push(proxy);
        self
    }

    pub fn proxies(mut self, proxies: Vec<ProxyConfig>) -> Self {
        self.config.proxy_config.candidates = proxies;
        self
    }

    pub fn proxy_validation_timeout(mut self, timeout: Duration) -> Self {
        self.config.proxy_config.validation_timeout = timeout;
        self
    }

    // --- Headers ---

    /// Add a header to both playlist/key and segment requests
    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (HeaderName::from_str(name), HeaderValue::from_str(value)) {
            self.config
                .headers_config
                .index
                .insert(name.clone(), value.clone());
            self.config.headers_config.segments.insert(name, value);
        }
        self
    }

    pub fn index_headers(mut self, headers: HeaderMap) -> Self {
        self.config.headers_config.index = headers;
        self
    }

    pub fn segment_headers(mut self, headers: HeaderMap) -> Self {
        self.config.headers_config.segments = headers;
        self
    }

    /// Replace the rotation list; an empty list keeps the client's user agent
    pub fn user_agents(mut self, user_agents: Vec<String>) -> Self {
        self.config.headers_config.user_agents = user_agents;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<HlsConfig, HlsDownloaderError> {
        if self.config.scheduler_config.download_concurrency == 0 {
            return Err(HlsDownloaderError::ConfigError(
                "download concurrency must be at least 1".to_string(),
            ));
        }
        if self.config.scheduler_config.submission_interval > MAX_SUBMISSION_INTERVAL {
            return Err(HlsDownloaderError::ConfigError(format!(
                "submission interval must not exceed {MAX_SUBMISSION_INTERVAL:?}"
            )));
        }
        if self.config.output_config.max_buffered_segments == Some(0) {
            return Err(HlsDownloaderError::ConfigError(
                "max buffered segments must be at least 1".to_string(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HlsConfigBuilder::new().build().unwrap();
        assert_eq!(config.scheduler_config.download_concurrency, 4);
        assert_eq!(config.fetcher_config.max_segment_retries, 0);
        assert_eq!(config.output_config.gap_policy, GapPolicy::Wait);
        assert!(config.proxy_config.candidates.is_empty());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = HlsConfigBuilder::new()
            .download_concurrency(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, HlsDownloaderError::ConfigError(_)));
    }

    #[test]
    fn test_huge_submission_interval_rejected() {
        let err = HlsConfigBuilder::new()
            .submission_interval(Duration::from_millis(u64::MAX))
            .build()
            .unwrap_err();
        assert!(matches!(err, HlsDownloaderError::ConfigError(_)));

        let config = HlsConfigBuilder::new()
            .submission_interval(MAX_SUBMISSION_INTERVAL)
            .build()
            .unwrap();
        assert_eq!(config.scheduler_config.submission_interval, MAX_SUBMISSION_INTERVAL);
    }

    #[test]
    fn test_zero_buffer_limit_rejected() {
        let err = HlsConfigBuilder::new()
            .max_buffered_segments(Some(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, HlsDownloaderError::ConfigError(_)));
    }

    #[test]
    fn test_add_header_applies_to_both_sets() {
        let config = HlsConfigBuilder::new()
            .add_header("Referer", "https://example.com/")
            .add_proxy(ProxyConfig::new("http://10.0.0.2:3128"))
            .build()
            .unwrap();
        assert_eq!(
            config.headers_config.index.get("referer").unwrap(),
            "https://example.com/"
        );
        assert_eq!(
            config.headers_config.segments.get("referer").unwrap(),
            "https://example.com/"
        );
        assert_eq!(config.proxy_config.candidates.len(), 1);
    }
}
