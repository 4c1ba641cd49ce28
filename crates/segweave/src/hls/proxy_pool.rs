// Proxy rotation: validated endpoints picked deterministically by segment index.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::header::HeaderMap;
use tracing::{debug, info, warn};
use url::Url;

use crate::proxy::ProxyConfig;

use super::HlsDownloaderError;
use super::transport::SegmentTransport;

/// A proxy endpoint as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    config: ProxyConfig,
}

impl ProxyEndpoint {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.config, f)
    }
}

impl From<ProxyConfig> for ProxyEndpoint {
    fn from(config: ProxyConfig) -> Self {
        Self::new(config)
    }
}

/// Ordered set of endpoints that passed validation. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct ProxyPool {
    endpoints: Arc<[ProxyEndpoint]>,
}

impl ProxyPool {
    pub fn new(endpoints: Vec<ProxyEndpoint>) -> Self {
        Self {
            endpoints: endpoints.into(),
        }
    }

    /// Pool that never proxies
    pub fn direct() -> Self {
        Self::default()
    }

    /// Endpoint for the segment at `index`; `None` means connect directly.
    pub fn select(&self, index: u64) -> Option<&ProxyEndpoint> {
        if self.endpoints.is_empty() {
            return None;
        }
        let slot = (index % self.endpoints.len() as u64) as usize;
        self.endpoints.get(slot)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

}

/// Filters proxy candidates down to the ones that can reach the stream.
#[async_trait]
pub trait ProxyValidator: Send + Sync {
    /// Returns the usable candidates in their configured order.
    async fn validate(&self, candidates: &[ProxyEndpoint], probe_url: &Url) -> Vec<ProxyEndpoint>;
}

/// Probes each candidate with one GET against a real segment URL.
pub struct HttpProxyValidator {
    transport: Arc<dyn SegmentTransport>,
    headers: HeaderMap,
    timeout: Duration,
}

impl HttpProxyValidator {
    pub fn new(transport: Arc<dyn SegmentTransport>, headers: HeaderMap, timeout: Duration) -> Self {
        Self {
            transport,
            headers,
            timeout,
        }
    }

    async fn probe(&self, endpoint: &ProxyEndpoint, probe_url: &Url) -> bool {
        match self
            .transport
            .get(probe_url, self.headers.clone(), self.timeout, Some(endpoint))
            .await
        {
            Ok(response) if response.is_success() => {
                debug!(proxy = %endpoint, "Proxy passed validation");
                true
            }
            Ok(response) => {
                warn!(proxy = %endpoint, status = %response.status, "Proxy rejected");
                false
            }
            Err(e) => {
                warn!(proxy = %endpoint, error = %e, "Proxy rejected");
                false
            }
        }
    }
}

#[async_trait]
impl ProxyValidator for HttpProxyValidator {
    async fn validate(&self, candidates: &[ProxyEndpoint], probe_url: &Url) -> Vec<ProxyEndpoint> {
        let verdicts = join_all(candidates.iter().map(|c| self.probe(c, probe_url))).await;
        candidates
            .iter()
            .zip(verdicts)
            .filter_map(|(candidate, ok)| ok.then(|| candidate.clone()))
            .collect()
    }
}

/// Run validation and build the pool. No candidates means a direct pool;
/// candidates that all fail is an error.
pub async fn build_pool(
    validator: &dyn ProxyValidator,
    candidates: &[ProxyEndpoint],
    probe_url: &Url,
) -> Result<ProxyPool, HlsDownloaderError> {
    if candidates.is_empty() {
        return Ok(ProxyPool::direct());
    }
    let usable = validator.validate(candidates, probe_url).await;
    if usable.is_empty() {
        return Err(HlsDownloaderError::NoUsableProxy(candidates.len()));
    }
    info!(
        usable = usable.len(),
        configured = candidates.len(),
        "Proxy pool ready"
    );
    Ok(ProxyPool::new(usable))
}
