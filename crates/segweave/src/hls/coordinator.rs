// HLS Job Coordinator: runs one job from manifest text to a closed sink.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::HlsDownloaderError;
use super::catalog::{M3u8ManifestParser, ManifestParser};
use super::config::HlsConfig;
use super::decryption::KeyFetcher;
use super::headers::RequestHeaders;
use super::output::OutputManager;
use super::progress::{NoopProgress, ProgressHook};
use super::proxy_pool::{HttpProxyValidator, ProxyEndpoint, ProxyValidator, build_pool};
use super::scheduler::{SegmentScheduler, WorkerContext};
use super::transport::SegmentTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Segments are being submitted and fetched
    Running,
    /// No more submissions; the writer is flushing what it holds
    Draining,
    /// Sink closed
    Closed,
}

/// Outcome of a job that ran to the end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub total_segments: usize,
    pub attempted: u64,
    pub succeeded: u64,
    /// Segments whose fetch or decryption failed
    pub failed_indices: Vec<u64>,
    /// Indices the writer stepped over, leaving a gap
    pub skipped_indices: Vec<u64>,
    /// Fetched segments that were never written because an earlier one was missing
    pub dropped_indices: Vec<u64>,
    pub bytes_received: u64,
    pub bytes_written: u64,
    pub elapsed: Duration,
}

impl JobReport {
    /// Every segment reached the sink, in order.
    pub fn is_complete(&self) -> bool {
        self.succeeded == self.total_segments as u64
            && self.failed_indices.is_empty()
            && self.skipped_indices.is_empty()
            && self.dropped_indices.is_empty()
    }
}

pub struct HlsJob {
    config: Arc<HlsConfig>,
    transport: Arc<dyn SegmentTransport>,
    parser: Arc<dyn ManifestParser>,
    proxy_validator: Arc<dyn ProxyValidator>,
    progress: Arc<dyn ProgressHook>,
    cancellation: CancellationToken,
    state_tx: watch::Sender<JobState>,
}

impl HlsJob {
    pub fn new(config: Arc<HlsConfig>, transport: Arc<dyn SegmentTransport>) -> Self {
        let headers = RequestHeaders::new(&config.headers_config);
        let proxy_validator = Arc::new(HttpProxyValidator::new(
            Arc::clone(&transport),
            headers.for_segment(0),
            config.proxy_config.validation_timeout,
        ));
        let (state_tx, _) = watch::channel(JobState::Running);
        Self {
            config,
            transport,
            parser: Arc::new(M3u8ManifestParser),
            proxy_validator,
            progress: Arc::new(NoopProgress),
            cancellation: CancellationToken::new(),
            state_tx,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressHook>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn ManifestParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_proxy_validator(mut self, validator: Arc<dyn ProxyValidator>) -> Self {
        self.proxy_validator = validator;
        self
    }

    /// Cancelling `token` stops the job and makes [`HlsJob::run`] return
    /// [`HlsDownloaderError::Cancelled`].
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn subscribe_state(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    /// Fetch every segment listed in `manifest` and write them to `sink` in
    /// playlist order. The sink is shut down before this returns, and the
    /// published state ends at [`JobState::Closed`] on every outcome.
    pub async fn run<W>(
        &self,
        manifest: &str,
        base_url: &Url,
        sink: W,
    ) -> Result<JobReport, HlsDownloaderError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let result = self.execute(manifest, base_url, sink).await;
        self.state_tx.send_replace(JobState::Closed);
        result
    }

    async fn execute<W>(
        &self,
        manifest: &str,
        base_url: &Url,
        sink: W,
    ) -> Result<JobReport, HlsDownloaderError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let started = Instant::now();
        let config = &self.config;

        let catalog = self.parser.parse(manifest, base_url)?;
        let total_segments = catalog.len();
        let (segments, encryption) = catalog.into_parts();

        let headers = RequestHeaders::new(&config.headers_config);
        let key_fetcher = KeyFetcher::new(
            Arc::clone(&self.transport),
            headers.for_index(),
            config.fetcher_config.key_download_timeout,
        );
        let decryptor = key_fetcher.decryptor_for(encryption.as_ref()).await?;

        let candidates: Vec<ProxyEndpoint> = config
            .proxy_config
            .candidates
            .iter()
            .cloned()
            .map(ProxyEndpoint::new)
            .collect();
        let probe_url = segments
            .first()
            .map(|s| s.url.clone())
            .ok_or_else(|| HlsDownloaderError::ManifestError("playlist contains no segments".into()))?;
        let proxies = build_pool(self.proxy_validator.as_ref(), &candidates, &probe_url).await?;

        self.progress.set_total(total_segments);
        self.state_tx.send_replace(JobState::Running);
        info!(
            segments = total_segments,
            workers = config.scheduler_config.download_concurrency,
            proxies = proxies.len(),
            "Starting job"
        );

        let job_token = self.cancellation.child_token();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let writer = OutputManager::new(
            sink,
            output_rx,
            config.output_config.clone(),
            job_token.clone(),
        );
        let context = Arc::new(WorkerContext {
            transport: Arc::clone(&self.transport),
            decryptor,
            proxies,
            headers,
            progress: Arc::clone(&self.progress),
            fetcher_config: config.fetcher_config.clone(),
            offload_decryption: config.scheduler_config.offload_decryption_to_cpu_pool,
        });
        let scheduler = SegmentScheduler::new(
            config.scheduler_config.clone(),
            context,
            output_tx,
            job_token.clone(),
        );

        let scheduling = async {
            let result = scheduler.run(segments).await;
            // The scheduler's sender is gone now; the writer drains what is queued.
            self.state_tx.send_replace(JobState::Draining);
            debug!("All segment tasks finished, writer draining");
            result
        };
        let (written, scheduled) = tokio::join!(writer.run(), scheduling);

        self.progress.finish();

        let (scheduler_summary, writer_summary) = match (scheduled, written) {
            (Ok(s), Ok((_sink, w))) => (s, w),
            // A writer fault is the root cause when the scheduler only saw cancellation.
            (_, Err(e)) if !matches!(e, HlsDownloaderError::Cancelled) => return Err(e),
            (Err(e), _) | (_, Err(e)) => return Err(e),
        };

        let mut failed_indices = scheduler_summary.failed;
        failed_indices.sort_unstable();
        let report = JobReport {
            total_segments,
            attempted: scheduler_summary.attempted,
            succeeded: scheduler_summary.succeeded,
            failed_indices,
            skipped_indices: writer_summary.skipped,
            dropped_indices: writer_summary.dropped,
            bytes_received: scheduler_summary.bytes_received,
            bytes_written: writer_summary.bytes_written,
            elapsed: started.elapsed(),
        };

        if report.is_complete() {
            info!(
                segments = report.total_segments,
                bytes = report.bytes_written,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Job complete"
            );
        } else {
            warn!(
                failed = ?report.failed_indices,
                skipped = ?report.skipped_indices,
                dropped = ?report.dropped_indices,
                "Job finished with missing segments"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::builder::HlsConfigBuilder;
    use crate::hls::config::GapPolicy;
    use crate::hls::decryption::u64_to_iv_bytes;
    use crate::hls::progress::ThroughputEstimator;
    use crate::hls::test_support::{MockReply, MockTransport, init_test_tracing};
    use crate::proxy::ProxyConfig;
    use aes::Aes128;
    use bytes::Bytes;
    use cbc::cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};

    fn base() -> Url {
        Url::parse("http://cdn.test/vod/index.m3u8").unwrap()
    }

    fn manifest(n: usize) -> String {
        let mut text = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:4\n");
        for i in 0..n {
            text.push_str(&format!("#EXTINF:4.0,\nseg{i}.ts\n"));
        }
        text.push_str("#EXT-X-ENDLIST\n");
        text
    }

    fn seg_url(i: usize) -> String {
        format!("http://cdn.test/vod/seg{i}.ts")
    }

    fn payload(i: usize) -> Bytes {
        Bytes::from(format!("[segment {i}]"))
    }

    fn serve(n: usize) -> MockTransport {
        (0..n).fold(MockTransport::new(), |t, i| {
            t.reply(&seg_url(i), vec![MockReply::Body(payload(i))])
        })
    }

    fn expected(indices: impl IntoIterator<Item = usize>) -> Vec<u8> {
        indices.into_iter().flat_map(|i| payload(i).to_vec()).collect()
    }

    fn config(builder: HlsConfigBuilder) -> Arc<HlsConfig> {
        Arc::new(
            builder
                .submission_interval(Duration::ZERO)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_out_of_order_completion_is_reassembled() {
        init_test_tracing!();
        // Completion order 4, 2, 0, 3, 1.
        let transport = Arc::new(
            serve(5)
                .delay_for(&seg_url(4), Duration::from_millis(10))
                .delay_for(&seg_url(2), Duration::from_millis(40))
                .delay_for(&seg_url(0), Duration::from_millis(70))
                .delay_for(&seg_url(3), Duration::from_millis(100))
                .delay_for(&seg_url(1), Duration::from_millis(130)),
        );
        let progress = Arc::new(ThroughputEstimator::new());
        let job = HlsJob::new(
            config(HlsConfigBuilder::new().download_concurrency(5)),
            transport,
        )
        .with_progress(progress.clone());
        let mut state = job.subscribe_state();

        let mut sink = Vec::new();
        let report = job.run(&manifest(5), &base(), &mut sink).await.unwrap();

        assert_eq!(sink, expected(0..5));
        assert!(report.is_complete());
        assert_eq!(report.attempted, 5);
        assert_eq!(report.bytes_written, sink.len() as u64);
        assert_eq!(report.bytes_received, sink.len() as u64);
        assert_eq!(progress.snapshot().total, 5);
        assert_eq!(*state.borrow_and_update(), JobState::Closed);
    }

    #[tokio::test]
    async fn test_failed_segment_stalls_output_under_wait() {
        init_test_tracing!();
        let transport = Arc::new(serve(3).reply(&seg_url(1), vec![MockReply::Timeout]));
        let job = HlsJob::new(config(HlsConfigBuilder::new()), transport);

        let mut sink = Vec::new();
        let report = job.run(&manifest(3), &base(), &mut sink).await.unwrap();

        assert_eq!(sink, expected([0]));
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed_indices, vec![1]);
        assert_eq!(report.dropped_indices, vec![2]);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_failed_segment_leaves_gap_under_skip() {
        let transport = Arc::new(serve(3).reply(&seg_url(1), vec![MockReply::Status(404)]));
        let job = HlsJob::new(
            config(HlsConfigBuilder::new().gap_policy(GapPolicy::Skip)),
            transport,
        );

        let mut sink = Vec::new();
        let report = job.run(&manifest(3), &base(), &mut sink).await.unwrap();

        assert_eq!(sink, expected([0, 2]));
        assert_eq!(report.skipped_indices, vec![1]);
        assert_eq!(report.failed_indices, vec![1]);
    }

    #[tokio::test]
    async fn test_encrypted_job_decrypts_each_segment() {
        let key = *b"k3y-material-16b";
        let encrypt = |plain: &[u8], iv: [u8; 16]| {
            let mut buf = vec![0u8; plain.len() + 16];
            buf[..plain.len()].copy_from_slice(plain);
            let len = cbc::Encryptor::<Aes128>::new(&key.into(), &iv.into())
                .encrypt_padded_mut::<Pkcs7>(&mut buf, plain.len())
                .unwrap()
                .len();
            buf.truncate(len);
            Bytes::from(buf)
        };

        let manifest = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-MEDIA-SEQUENCE:7
#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"
#EXTINF:4.0,
seg0.ts
#EXTINF:4.0,
seg1.ts
#EXT-X-ENDLIST
";
        let transport = Arc::new(
            MockTransport::new()
                .reply(
                    "http://cdn.test/vod/key.bin",
                    vec![MockReply::Body(Bytes::copy_from_slice(&key))],
                )
                .reply(
                    &seg_url(0),
                    vec![MockReply::Body(encrypt(&payload(0)[..], u64_to_iv_bytes(7)))],
                )
                .reply(
                    &seg_url(1),
                    vec![MockReply::Body(encrypt(&payload(1)[..], u64_to_iv_bytes(8)))],
                ),
        );
        let job = HlsJob::new(config(HlsConfigBuilder::new()), transport.clone());

        let mut sink = Vec::new();
        let report = job.run(manifest, &base(), &mut sink).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(sink, expected(0..2));
        assert_eq!(transport.calls()[0].url, "http://cdn.test/vod/key.bin");
        assert_eq!(transport.calls_to("http://cdn.test/vod/key.bin"), 1);
    }

    #[tokio::test]
    async fn test_bad_manifest_aborts_before_any_request() {
        let transport = Arc::new(serve(2));
        let progress = Arc::new(ThroughputEstimator::new());
        let job = HlsJob::new(config(HlsConfigBuilder::new()), transport.clone())
            .with_progress(progress.clone());

        let state = job.subscribe_state();

        let mut sink = Vec::new();
        let err = job
            .run("this is not a playlist", &base(), &mut sink)
            .await
            .unwrap_err();

        assert!(matches!(err, HlsDownloaderError::ManifestError(_)));
        assert_eq!(*state.borrow(), JobState::Closed);
        assert!(transport.calls().is_empty());
        assert!(sink.is_empty());
        assert_eq!(progress.snapshot().total, 0);
    }

    #[tokio::test]
    async fn test_key_failure_aborts_before_segments() {
        let manifest = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.test/k\"
#EXTINF:4.0,
seg0.ts
#EXT-X-ENDLIST
";
        let transport = Arc::new(serve(1).reply("https://keys.test/k", vec![MockReply::Status(403)]));
        let job = HlsJob::new(config(HlsConfigBuilder::new()), transport.clone());
        let state = job.subscribe_state();

        let mut sink = Vec::new();
        let err = job.run(manifest, &base(), &mut sink).await.unwrap_err();

        assert!(matches!(err, HlsDownloaderError::KeyFetchError(_)));
        assert_eq!(*state.borrow(), JobState::Closed);
        assert_eq!(transport.calls_to(&seg_url(0)), 0);
    }

    #[tokio::test]
    async fn test_unusable_proxies_abort_job() {
        // Both probes hit seg0 and get a 502.
        let transport = Arc::new(serve(2).reply(&seg_url(0), vec![MockReply::Status(502)]));
        let job = HlsJob::new(
            config(
                HlsConfigBuilder::new()
                    .add_proxy(ProxyConfig::new("http://p0:3128"))
                    .add_proxy(ProxyConfig::new("http://p1:3128")),
            ),
            transport.clone(),
        );
        let state = job.subscribe_state();

        let mut sink = Vec::new();
        let err = job.run(&manifest(2), &base(), &mut sink).await.unwrap_err();

        assert!(matches!(err, HlsDownloaderError::NoUsableProxy(2)));
        assert_eq!(*state.borrow(), JobState::Closed);
        assert_eq!(transport.calls_to(&seg_url(1)), 0);
        assert!(transport.calls().iter().all(|c| c.proxy.is_some()));
    }

    #[tokio::test]
    async fn test_segments_rotate_over_validated_proxies() {
        let transport = Arc::new(serve(4));
        let job = HlsJob::new(
            config(
                HlsConfigBuilder::new()
                    .add_proxy(ProxyConfig::new("http://p0:3128"))
                    .add_proxy(ProxyConfig::new("http://p1:3128")),
            ),
            transport.clone(),
        );

        let mut sink = Vec::new();
        let report = job.run(&manifest(4), &base(), &mut sink).await.unwrap();
        assert!(report.is_complete());

        // Two probes, then one call per segment.
        let calls = transport.calls();
        assert_eq!(calls.len(), 6);
        for i in 1..4 {
            let call = calls.iter().find(|c| c.url == seg_url(i)).unwrap();
            assert_eq!(call.proxy.as_deref(), Some(["http://p0:3128", "http://p1:3128"][i % 2]));
        }
    }

    #[tokio::test]
    async fn test_direct_job_never_uses_a_proxy() {
        let transport = Arc::new(serve(3));
        let job = HlsJob::new(config(HlsConfigBuilder::new()), transport.clone());

        let mut sink = Vec::new();
        job.run(&manifest(3), &base(), &mut sink).await.unwrap();
        assert!(transport.calls().iter().all(|c| c.proxy.is_none()));
    }

    #[tokio::test]
    async fn test_caller_cancellation() {
        let transport = Arc::new(serve(3).with_default_delay(Duration::from_secs(30)));
        let token = CancellationToken::new();
        let progress = Arc::new(ThroughputEstimator::new());
        let job = HlsJob::new(config(HlsConfigBuilder::new()), transport)
            .with_progress(progress.clone())
            .with_cancellation(token.clone());

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let mut sink = Vec::new();
        let err = job.run(&manifest(3), &base(), &mut sink).await.unwrap_err();
        assert!(matches!(err, HlsDownloaderError::Cancelled));

        // Every segment counts as attempted, even those cut off mid-fetch.
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.attempted, 3);
    }

    #[tokio::test]
    async fn test_cancellation_counts_unsubmitted_segments() {
        // One worker: seg0 hangs, the rest never get submitted.
        let transport = Arc::new(serve(5).delay_for(&seg_url(0), Duration::from_secs(30)));
        let token = CancellationToken::new();
        let progress = Arc::new(ThroughputEstimator::new());
        let job = HlsJob::new(
            config(HlsConfigBuilder::new().download_concurrency(1)),
            transport.clone(),
        )
        .with_progress(progress.clone())
        .with_cancellation(token.clone());

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let mut sink = Vec::new();
        let err = job.run(&manifest(5), &base(), &mut sink).await.unwrap_err();
        assert!(matches!(err, HlsDownloaderError::Cancelled));
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(progress.snapshot().attempted, 5);
    }

    #[tokio::test]
    async fn test_writer_overflow_fails_job() {
        let transport = Arc::new(serve(5).reply(&seg_url(0), vec![MockReply::Timeout]));
        let job = HlsJob::new(
            config(
                HlsConfigBuilder::new()
                    .download_concurrency(1)
                    .max_buffered_segments(Some(2)),
            ),
            transport,
        );

        let mut sink = Vec::new();
        let err = job.run(&manifest(5), &base(), &mut sink).await.unwrap_err();
        assert!(matches!(
            err,
            HlsDownloaderError::ReorderBufferOverflow { limit: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_overflow_still_counts_every_segment_attempted() {
        let transport = Arc::new(serve(6).delay_for(&seg_url(0), Duration::from_secs(30)));
        let progress = Arc::new(ThroughputEstimator::new());
        let job = HlsJob::new(
            config(
                HlsConfigBuilder::new()
                    .download_concurrency(6)
                    .max_buffered_segments(Some(2)),
            ),
            transport,
        )
        .with_progress(progress.clone());
        let state = job.subscribe_state();

        let mut sink = Vec::new();
        let err = job.run(&manifest(6), &base(), &mut sink).await.unwrap_err();
        assert!(matches!(
            err,
            HlsDownloaderError::ReorderBufferOverflow { expected: 0, limit: 2, .. }
        ));
        assert!(sink.is_empty());

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.total, 6);
        assert_eq!(snapshot.attempted, 6);
        assert_eq!(*state.borrow(), JobState::Closed);
    }
}
