// HLS Transport: the single-GET primitive every segment, key and probe request goes through.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use tracing::trace;
use url::Url;

use crate::proxy::ProxyConfig;
use crate::{DownloadError, DownloaderConfig, create_client};

use super::HlsDownloaderError;
use super::proxy_pool::ProxyEndpoint;

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub headers: HeaderMap,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Turn a non-success status into an error
    pub fn error_for_status(self, url: &Url) -> Result<Self, HlsDownloaderError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(HlsDownloaderError::HttpStatus {
                status: self.status.as_u16(),
                url: url.to_string(),
            })
        }
    }
}

/// Issues one GET. Non-success statuses come back as responses; only
/// timeouts, connection failures and similar are errors.
#[async_trait]
pub trait SegmentTransport: Send + Sync {
    async fn get(
        &self,
        url: &Url,
        headers: HeaderMap,
        timeout: Duration,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<TransportResponse, HlsDownloaderError>;
}

/// reqwest-backed transport with one client per proxy endpoint.
///
/// reqwest binds proxies per client, so the clients are built once up front
/// and picked per request.
pub struct HttpTransport {
    direct: Client,
    /// Keyed on the whole proxy config so credentials tell endpoints apart
    proxied: HashMap<ProxyConfig, Client>,
}

impl HttpTransport {
    pub fn new(config: &DownloaderConfig, endpoints: &[ProxyEndpoint]) -> Result<Self, DownloadError> {
        let direct = create_client(config, None)?;
        let mut proxied = HashMap::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let client = create_client(config, Some(endpoint.config()))?;
            proxied.insert(endpoint.config().clone(), client);
        }
        Ok(Self { direct, proxied })
    }

    /// Transport that only ever connects directly
    pub fn from_client(client: Client) -> Self {
        Self {
            direct: client,
            proxied: HashMap::new(),
        }
    }

    fn client_for(&self, proxy: Option<&ProxyEndpoint>) -> Result<&Client, HlsDownloaderError> {
        match proxy {
            None => Ok(&self.direct),
            Some(endpoint) => self.proxied.get(endpoint.config()).ok_or_else(|| {
                HlsDownloaderError::InternalError(format!(
                    "no client was built for proxy {endpoint}"
                ))
            }),
        }
    }
}

#[async_trait]
impl SegmentTransport for HttpTransport {
    async fn get(
        &self,
        url: &Url,
        headers: HeaderMap,
        timeout: Duration,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<TransportResponse, HlsDownloaderError> {
        let client = self.client_for(proxy)?;
        let response = client
            .get(url.clone())
            .headers(headers)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_request_error(e, url, timeout))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_request_error(e, url, timeout))?;
        trace!(%url, %status, bytes = body.len(), "GET finished");

        Ok(TransportResponse {
            status,
            body,
            headers,
        })
    }
}

fn map_request_error(err: reqwest::Error, url: &Url, timeout: Duration) -> HlsDownloaderError {
    if err.is_timeout() {
        HlsDownloaderError::TimeoutError(format!("{url} did not answer within {timeout:?}"))
    } else {
        HlsDownloaderError::from(err)
    }
}
