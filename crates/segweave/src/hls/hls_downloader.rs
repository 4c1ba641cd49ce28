use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncWrite, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::DownloadError;

use super::HlsConfig;
use super::coordinator::{HlsJob, JobReport};
use super::headers::RequestHeaders;
use super::playlist::{LoadedPlaylist, PlaylistLoader};
use super::progress::ProgressHook;
use super::proxy_pool::ProxyEndpoint;
use super::transport::{HttpTransport, SegmentTransport};

/// Entry point for library callers: playlist URL in, reassembled stream out.
pub struct HlsDownloader {
    config: Arc<HlsConfig>,
    transport: Arc<dyn SegmentTransport>,
    cancellation: CancellationToken,
}

impl HlsDownloader {
    pub fn new(config: HlsConfig) -> Result<Self, DownloadError> {
        let endpoints: Vec<ProxyEndpoint> = config
            .proxy_config
            .candidates
            .iter()
            .cloned()
            .map(ProxyEndpoint::new)
            .collect();
        let transport = HttpTransport::new(&config.base, &endpoints)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Use a caller-provided transport instead of building reqwest clients
    pub fn with_transport(config: HlsConfig, transport: Arc<dyn SegmentTransport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &HlsConfig {
        &self.config
    }

    /// Token that stops any download started from this downloader
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub async fn load_playlist(&self, url: &str) -> Result<LoadedPlaylist, DownloadError> {
        let url = Url::parse(url)?;
        let headers = RequestHeaders::new(&self.config.headers_config);
        let loader = PlaylistLoader::new(
            Arc::clone(&self.transport),
            headers.for_index(),
            self.config.fetcher_config.playlist_download_timeout,
            self.config.playlist_config.variant_selection_policy.clone(),
        );
        Ok(loader.load(&url).await?)
    }

    pub async fn download_to_path(
        &self,
        url: &str,
        path: &Path,
        progress: Arc<dyn ProgressHook>,
    ) -> Result<JobReport, DownloadError> {
        let playlist = self.load_playlist(url).await?;
        self.download_playlist_to_path(&playlist, path, progress)
            .await
    }

    /// Run a job for an already loaded playlist, writing to a new file at `path`.
    pub async fn download_playlist_to_path(
        &self,
        playlist: &LoadedPlaylist,
        path: &Path,
        progress: Arc<dyn ProgressHook>,
    ) -> Result<JobReport, DownloadError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(path).await?;
        debug!(path = %path.display(), "Opened output file");
        let report = self
            .download_playlist(playlist, BufWriter::new(file), progress)
            .await?;
        info!(path = %path.display(), bytes = report.bytes_written, "Output written");
        Ok(report)
    }

    pub async fn download_to_writer<W>(
        &self,
        url: &str,
        sink: W,
        progress: Arc<dyn ProgressHook>,
    ) -> Result<JobReport, DownloadError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let playlist = self.load_playlist(url).await?;
        self.download_playlist(&playlist, sink, progress).await
    }

    async fn download_playlist<W>(
        &self,
        playlist: &LoadedPlaylist,
        sink: W,
        progress: Arc<dyn ProgressHook>,
    ) -> Result<JobReport, DownloadError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let job = HlsJob::new(Arc::clone(&self.config), Arc::clone(&self.transport))
            .with_progress(progress)
            .with_cancellation(self.cancellation.child_token());
        let state = job.subscribe_state();
        let report = job.run(&playlist.text, &playlist.url, sink).await?;
        debug!(state = ?*state.borrow(), "Job finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DownloaderConfig;
    use crate::hls::HlsConfigBuilder;
    use crate::hls::progress::ThroughputEstimator;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MEDIA: &str = "#EXTM3U
#EXT-X-TARGETDURATION:2
#EXTINF:2.0,
chunks/a.ts
#EXTINF:2.0,
chunks/b.ts
#EXTINF:2.0,
chunks/c.ts
#EXT-X-ENDLIST
";

    async fn serve_stream() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/show/index.m3u8"))
            .and(header("referer", "https://player.test/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(MEDIA))
            .mount(&server)
            .await;
        for (name, delay) in [("a", 60), ("b", 30), ("c", 0)] {
            Mock::given(method("GET"))
                .and(path(format!("/show/chunks/{name}.ts")))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string(format!("<{name}>"))
                        .set_delay(Duration::from_millis(delay)),
                )
                .expect(1)
                .mount(&server)
                .await;
        }
        server
    }

    fn downloader() -> HlsDownloader {
        let config = HlsConfigBuilder::new()
            .with_base_config(DownloaderConfig::builder().with_system_proxy(false).build())
            .download_concurrency(3)
            .submission_interval(Duration::ZERO)
            .add_header("Referer", "https://player.test/")
            .build()
            .unwrap();
        HlsDownloader::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_download_to_path() {
        let server = serve_stream().await;
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out").join("show.ts");
        let progress = Arc::new(ThroughputEstimator::new());

        let report = downloader()
            .download_to_path(
                &format!("{}/show/index.m3u8", server.uri()),
                &output,
                progress.clone(),
            )
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "<a><b><c>");
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.attempted, 3);
        assert_eq!(snapshot.bytes_received, 9);
    }

    #[tokio::test]
    async fn test_download_to_writer() {
        let server = serve_stream().await;
        let mut sink = Vec::new();

        let report = downloader()
            .download_to_writer(
                &format!("{}/show/index.m3u8", server.uri()),
                &mut sink,
                Arc::new(crate::hls::progress::NoopProgress),
            )
            .await
            .unwrap();

        assert_eq!(report.total_segments, 3);
        assert_eq!(sink, b"<a><b><c>");
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let err = downloader()
            .load_playlist("not a url")
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::UrlError(_)));
    }
}
