//! Scripted transport shared by the engine's unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use tokio::time::Instant;
use url::Url;

use super::HlsDownloaderError;
use super::proxy_pool::ProxyEndpoint;
use super::transport::{SegmentTransport, TransportResponse};

/// Routes engine logs to the test harness output.
macro_rules! init_test_tracing {
    () => {
        init_test_tracing!(DEBUG);
    };
    ($level:ident) => {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::$level)
            .with_test_writer()
            .try_init();
    };
}

pub(crate) use init_test_tracing;

#[derive(Debug, Clone)]
pub(crate) enum MockReply {
    Body(Bytes),
    Status(u16),
    Timeout,
}

impl MockReply {
    pub(crate) fn body(data: &'static [u8]) -> Self {
        MockReply::Body(Bytes::from_static(data))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockCall {
    pub url: String,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub at: Instant,
}

/// Replies are scripted per URL; the last scripted reply repeats and unknown
/// URLs answer 404.
#[derive(Default)]
pub(crate) struct MockTransport {
    replies: Mutex<HashMap<String, VecDeque<MockReply>>>,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    calls: Mutex<Vec<MockCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reply(self, url: &str, replies: Vec<MockReply>) -> Self {
        self.replies.lock().insert(url.to_string(), replies.into());
        self
    }

    pub(crate) fn delay_for(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }

    pub(crate) fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.url == url).count()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, url: &str) -> MockReply {
        let mut replies = self.replies.lock();
        match replies.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(MockReply::Status(404)),
            Some(queue) => queue.front().cloned().unwrap_or(MockReply::Status(404)),
            None => MockReply::Status(404),
        }
    }
}

#[async_trait]
impl SegmentTransport for MockTransport {
    async fn get(
        &self,
        url: &Url,
        headers: HeaderMap,
        timeout: Duration,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<TransportResponse, HlsDownloaderError> {
        let key = url.as_str().to_string();
        self.calls.lock().push(MockCall {
            url: key.clone(),
            proxy: proxy.map(|p| p.url().to_string()),
            user_agent: headers
                .get(reqwest::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(String::from),
            at: Instant::now(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.get(&key).copied().unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let reply = self.next_reply(&key);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            MockReply::Body(body) => Ok(TransportResponse {
                status: StatusCode::OK,
                body,
                headers: HeaderMap::new(),
            }),
            MockReply::Status(code) => Ok(TransportResponse {
                status: StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                body: Bytes::new(),
                headers: HeaderMap::new(),
            }),
            MockReply::Timeout => Err(HlsDownloaderError::TimeoutError(format!(
                "{key} did not answer within {timeout:?}"
            ))),
        }
    }
}
