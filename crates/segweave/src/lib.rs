//! # Segweave
//!
//! Concurrent segment fetch and reassembly engine for HLS-style streams.
//!
//! Given a media playlist, the engine fetches every segment with a bounded
//! pool of workers, optionally decrypts each payload, and writes a single
//! output stream whose segment order matches the playlist order even though
//! network completions arrive out of order.
//!
//! ## Features
//!
//! - Bounded, paced worker pool with per-segment failure isolation
//! - In-order reassembly through a writer-owned reorder buffer
//! - AES-128 decryption with per-job key retrieval
//! - Deterministic proxy rotation by segment index
//! - Throughput estimation hook for progress rendering

pub mod builder;
pub mod client;
pub mod config;
pub mod error;
pub mod hls;
pub mod proxy;

pub use builder::DownloaderConfigBuilder;
pub use config::DownloaderConfig;
pub use error::DownloadError;

pub use client::create_client;

pub use hls::{
    GapPolicy, HlsConfig, HlsConfigBuilder, HlsDownloader, HlsDownloaderError, HlsJob, JobReport,
    JobState, ProgressHook,
};

// Re-export proxy utilities
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
