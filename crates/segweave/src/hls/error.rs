use std::sync::Arc;

#[derive(Debug, thiserror::Error, Clone)]
pub enum HlsDownloaderError {
    #[error("Manifest error: {0}")]
    ManifestError(String),
    #[error("Key fetch error: {0}")]
    KeyFetchError(String),
    #[error("None of the {0} configured proxies passed validation")]
    NoUsableProxy(usize),
    #[error("Segment fetch error: {0}")]
    SegmentFetchError(String),
    #[error("HTTP status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("Decryption error: {0}")]
    DecryptionError(String),
    #[error("Network error: {source}")]
    NetworkError {
        #[from]
        source: Arc<reqwest::Error>,
    },
    #[error("I/O error: {source}")]
    IoError {
        #[from]
        source: Arc<std::io::Error>,
    },
    #[error("Segment {index} delivered out of order (next expected: {expected})")]
    ReorderViolation { index: u64, expected: u64 },
    #[error(
        "Reorder buffer holds {buffered} segments while waiting for segment {expected} (limit {limit})"
    )]
    ReorderBufferOverflow {
        expected: u64,
        buffered: usize,
        limit: usize,
    },
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Operation timed out: {0}")]
    TimeoutError(String),
    #[error("Internal error: {0}")]
    InternalError(String),
    #[error("Operation cancelled")]
    Cancelled,
}

impl HlsDownloaderError {
    /// Whether the error aborts the whole job rather than a single segment.
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self,
            HlsDownloaderError::ManifestError(_)
                | HlsDownloaderError::KeyFetchError(_)
                | HlsDownloaderError::NoUsableProxy(_)
                | HlsDownloaderError::ConfigError(_)
                | HlsDownloaderError::ReorderViolation { .. }
                | HlsDownloaderError::ReorderBufferOverflow { .. }
                | HlsDownloaderError::IoError { .. }
                | HlsDownloaderError::InternalError(_)
                | HlsDownloaderError::Cancelled
        )
    }

    /// Transient failures worth another attempt when a retry budget is configured.
    pub fn is_retryable(&self) -> bool {
        match self {
            HlsDownloaderError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            HlsDownloaderError::NetworkError { source } => {
                source.is_connect() || source.is_timeout() || source.is_request()
            }
            HlsDownloaderError::TimeoutError(_) => true,
            _ => false,
        }
    }
}

// Manual implementation of From<reqwest::Error> for HlsDownloaderError
// because of the Arc wrapping.
impl From<reqwest::Error> for HlsDownloaderError {
    fn from(err: reqwest::Error) -> Self {
        HlsDownloaderError::NetworkError {
            source: Arc::new(err),
        }
    }
}

impl From<std::io::Error> for HlsDownloaderError {
    fn from(err: std::io::Error) -> Self {
        HlsDownloaderError::IoError {
            source: Arc::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        assert!(HlsDownloaderError::ManifestError("empty".into()).is_job_fatal());
        assert!(HlsDownloaderError::KeyFetchError("404".into()).is_job_fatal());
        assert!(HlsDownloaderError::NoUsableProxy(3).is_job_fatal());
        assert!(
            HlsDownloaderError::ReorderViolation {
                index: 1,
                expected: 2
            }
            .is_job_fatal()
        );

        let status = HlsDownloaderError::HttpStatus {
            status: 503,
            url: "http://cdn/seg.ts".into(),
        };
        assert!(!status.is_job_fatal());
        assert!(status.is_retryable());

        let not_found = HlsDownloaderError::HttpStatus {
            status: 404,
            url: "http://cdn/seg.ts".into(),
        };
        assert!(!not_found.is_retryable());
        assert!(!HlsDownloaderError::DecryptionError("pad".into()).is_retryable());
    }
}
