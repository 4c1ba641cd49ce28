// HLS Segment Scheduler: a bounded, paced pool of fetch tasks. Each task owns
// one segment from request to hand-off and fails without touching the others.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::HlsDownloaderError;
use super::catalog::Segment;
use super::config::{HlsFetcherConfig, HlsSchedulerConfig, MAX_SUBMISSION_INTERVAL};
use super::decryption::SegmentDecryptor;
use super::headers::RequestHeaders;
use super::output::{FetchedUnit, SegmentDelivery};
use super::progress::ProgressHook;
use super::proxy_pool::ProxyPool;
use super::transport::SegmentTransport;

/// Everything a fetch task reads. Shared read-only by all tasks.
pub struct WorkerContext {
    pub transport: Arc<dyn SegmentTransport>,
    pub decryptor: Arc<dyn SegmentDecryptor>,
    pub proxies: ProxyPool,
    pub headers: RequestHeaders,
    pub progress: Arc<dyn ProgressHook>,
    pub fetcher_config: HlsFetcherConfig,
    pub offload_decryption: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerSummary {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: Vec<u64>,
    pub bytes_received: u64,
}

pub struct SegmentScheduler {
    config: HlsSchedulerConfig,
    context: Arc<WorkerContext>,
    output_tx: mpsc::UnboundedSender<SegmentDelivery>,
    token: CancellationToken,
}

impl SegmentScheduler {
    pub fn new(
        config: HlsSchedulerConfig,
        context: Arc<WorkerContext>,
        output_tx: mpsc::UnboundedSender<SegmentDelivery>,
        token: CancellationToken,
    ) -> Self {
        Self {
            config,
            context,
            output_tx,
            token,
        }
    }

    /// Submit one task per segment and wait for all of them.
    ///
    /// Consumes the scheduler so its sender is dropped on return; the writer
    /// sees the channel close once the last task's sender goes too.
    pub async fn run(self, segments: Vec<Segment>) -> Result<SchedulerSummary, HlsDownloaderError> {
        let concurrency = self.config.download_concurrency.max(1);
        let interval = self.config.submission_interval.min(MAX_SUBMISSION_INTERVAL);
        info!(
            segments = segments.len(),
            concurrency,
            interval_ms = interval.as_millis() as u64,
            "SegmentScheduler started."
        );

        let mut pending = segments.into_iter().peekable();
        let mut in_flight = FuturesUnordered::new();
        let mut summary = SchedulerSummary::default();
        let mut next_submission = Instant::now();

        loop {
            let can_submit = in_flight.len() < concurrency && pending.peek().is_some();
            if !can_submit && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    warn!(in_flight = in_flight.len(), "SegmentScheduler cancelled.");
                    // Running tasks stop on the same token and are never joined.
                    self.abandon(&mut summary, in_flight.len() + pending.len());
                    return Err(HlsDownloaderError::Cancelled);
                }

                Some((index, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                    self.record(&mut summary, index, outcome);
                }

                _ = sleep_until(next_submission), if can_submit => {
                    if let Some(segment) = pending.next() {
                        in_flight.push(self.spawn_task(segment));
                        next_submission = Instant::now() + interval;
                    }
                }
            }
        }

        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            "SegmentScheduler finished."
        );
        Ok(summary)
    }

    fn spawn_task(
        &self,
        segment: Segment,
    ) -> impl Future<Output = (u64, Result<Result<u64, HlsDownloaderError>, tokio::task::JoinError>)>
    + use<> {
        let index = segment.index;
        debug!(index, url = %segment.url, "Submitting segment");
        let context = Arc::clone(&self.context);
        let output_tx = self.output_tx.clone();
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => Err(HlsDownloaderError::Cancelled),
                result = fetch_segment(&context, segment, &output_tx) => result,
            }
        });
        async move { (index, handle.await) }
    }

    /// Account for segments that end without a result.
    fn abandon(&self, summary: &mut SchedulerSummary, count: usize) {
        for _ in 0..count {
            summary.attempted += 1;
            self.context.progress.on_unit_attempted();
        }
    }

    fn record(
        &self,
        summary: &mut SchedulerSummary,
        index: u64,
        outcome: Result<Result<u64, HlsDownloaderError>, tokio::task::JoinError>,
    ) {
        summary.attempted += 1;
        self.context.progress.on_unit_attempted();

        let error = match outcome {
            Ok(Ok(bytes)) => {
                summary.succeeded += 1;
                summary.bytes_received += bytes;
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(join_error) => format!("task aborted: {join_error}"),
        };
        error!(index, error = %error, "Segment failed, continuing with the rest");
        summary.failed.push(index);
        // The writer may already be gone after a fatal error of its own.
        let _ = self.output_tx.send(SegmentDelivery::Failed(index));
    }
}

/// One segment: fetch, report, decrypt, hand off. Returns the bytes received.
async fn fetch_segment(
    context: &WorkerContext,
    segment: Segment,
    output_tx: &mpsc::UnboundedSender<SegmentDelivery>,
) -> Result<u64, HlsDownloaderError> {
    let config = &context.fetcher_config;
    let proxy = context.proxies.select(segment.index);

    let mut attempts = 0u32;
    let (response, elapsed) = loop {
        let started = Instant::now();
        let result = context
            .transport
            .get(
                &segment.url,
                context.headers.for_segment(segment.index),
                config.segment_download_timeout,
                proxy,
            )
            .await
            .and_then(|response| response.error_for_status(&segment.url));

        match result {
            Ok(response) => break (response, started.elapsed()),
            Err(e) if e.is_retryable() && attempts < config.max_segment_retries => {
                attempts += 1;
                let delay = retry_delay(config.segment_retry_delay_base, attempts);
                warn!(
                    index = segment.index,
                    attempt = attempts,
                    max = config.max_segment_retries,
                    error = %e,
                    "Retrying segment in {delay:?}"
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    };

    let bytes_received = response.body.len() as u64;
    context.progress.on_unit_complete(bytes_received, elapsed);

    let index = segment.index;
    let payload = if context.offload_decryption {
        let decryptor = Arc::clone(&context.decryptor);
        tokio::task::spawn_blocking(move || decryptor.decrypt(&segment, response.body))
            .await
            .map_err(|e| HlsDownloaderError::InternalError(format!("decryption task failed: {e}")))??
    } else {
        context.decryptor.decrypt(&segment, response.body)?
    };

    output_tx
        .send(SegmentDelivery::Unit(FetchedUnit { index, payload }))
        .map_err(|_| HlsDownloaderError::InternalError("writer is gone".to_string()))?;
    debug!(index, bytes = bytes_received, "Segment handed to writer");
    Ok(bytes_received)
}

fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
}
