// Concurrent HLS segment fetch, decrypt and in-order reassembly

pub mod builder;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod decryption;
pub mod error;
pub mod headers;
pub mod hls_downloader;
pub mod output;
pub mod playlist;
pub mod progress;
pub mod proxy_pool;
pub mod scheduler;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for easier access
pub use builder::HlsConfigBuilder;
pub use catalog::{EncryptionDescriptor, M3u8ManifestParser, ManifestParser, Segment, SegmentCatalog};
pub use config::{GapPolicy, HlsConfig, HlsVariantSelectionPolicy};
pub use coordinator::{HlsJob, JobReport, JobState};
pub use error::HlsDownloaderError;
pub use hls_downloader::HlsDownloader;
pub use playlist::{LoadedPlaylist, save_playlist};
pub use progress::{NoopProgress, ProgressHook, ProgressSnapshot, ThroughputEstimator};
pub use transport::{HttpTransport, SegmentTransport, TransportResponse};
