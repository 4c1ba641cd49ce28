// HLS Decryption: one key fetch per job, then a stateless per-segment transform.

use std::sync::Arc;
use std::time::Duration;

use aes::Aes128;
use bytes::Bytes;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use reqwest::header::HeaderMap;
use tracing::{debug, info};
use url::Url;

use super::HlsDownloaderError;
use super::catalog::{DecryptionMethod, EncryptionDescriptor, Segment};
use super::transport::SegmentTransport;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

// --- KeyFetcher ---
// Fetches raw key material. No retries: a bad key fails the job up front.
pub struct KeyFetcher {
    transport: Arc<dyn SegmentTransport>,
    headers: HeaderMap,
    timeout: Duration,
}

impl KeyFetcher {
    pub fn new(transport: Arc<dyn SegmentTransport>, headers: HeaderMap, timeout: Duration) -> Self {
        Self {
            transport,
            headers,
            timeout,
        }
    }

    pub async fn fetch_key(&self, key_url: &Url) -> Result<[u8; 16], HlsDownloaderError> {
        let response = self
            .transport
            .get(key_url, self.headers.clone(), self.timeout, None)
            .await
            .map_err(|e| {
                HlsDownloaderError::KeyFetchError(format!("request to {key_url} failed: {e}"))
            })?;

        if !response.is_success() {
            return Err(HlsDownloaderError::KeyFetchError(format!(
                "{key_url} answered with status {}",
                response.status
            )));
        }

        let key: [u8; 16] = response.body.as_ref().try_into().map_err(|_| {
            HlsDownloaderError::KeyFetchError(format!(
                "key from {key_url} is {} bytes, expected 16",
                response.body.len()
            ))
        })?;
        debug!(key = %hex::encode(key), "Fetched decryption key");
        Ok(key)
    }

    /// Resolve the job's decryptor: passthrough without a descriptor,
    /// otherwise fetch the key once and bind it.
    pub async fn decryptor_for(
        &self,
        descriptor: Option<&EncryptionDescriptor>,
    ) -> Result<Arc<dyn SegmentDecryptor>, HlsDownloaderError> {
        let Some(descriptor) = descriptor else {
            return Ok(Arc::new(Passthrough));
        };
        match descriptor.method {
            DecryptionMethod::Aes128 => {
                let key = self.fetch_key(&descriptor.key_url).await?;
                info!(key_url = %descriptor.key_url, "AES-128 decryption enabled");
                Ok(Arc::new(Aes128Decryptor::new(key, descriptor.iv)))
            }
        }
    }
}

/// Pure per-segment transform. Shared read-only across all workers.
pub trait SegmentDecryptor: Send + Sync {
    fn decrypt(&self, segment: &Segment, payload: Bytes) -> Result<Bytes, HlsDownloaderError>;
}

/// Identity transform for unencrypted streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl SegmentDecryptor for Passthrough {
    fn decrypt(&self, _segment: &Segment, payload: Bytes) -> Result<Bytes, HlsDownloaderError> {
        Ok(payload)
    }
}

/// AES-128-CBC with PKCS#7 padding.
#[derive(Clone)]
pub struct Aes128Decryptor {
    key: [u8; 16],
    iv: Option<[u8; 16]>,
}

impl Aes128Decryptor {
    pub fn new(key: [u8; 16], iv: Option<[u8; 16]>) -> Self {
        Self { key, iv }
    }

    fn iv_for(&self, segment: &Segment) -> [u8; 16] {
        self.iv
            .unwrap_or_else(|| u64_to_iv_bytes(segment.media_sequence))
    }
}

impl std::fmt::Debug for Aes128Decryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aes128Decryptor")
            .field("iv", &self.iv.map(hex::encode))
            .finish_non_exhaustive()
    }
}

impl SegmentDecryptor for Aes128Decryptor {
    fn decrypt(&self, segment: &Segment, payload: Bytes) -> Result<Bytes, HlsDownloaderError> {
        let iv = self.iv_for(segment);
        let mut buffer = payload.to_vec();
        let decrypted_len = Aes128CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|e| {
                HlsDownloaderError::DecryptionError(format!(
                    "segment {} failed to decrypt: {e}",
                    segment.index
                ))
            })?
            .len();
        buffer.truncate(decrypted_len);
        Ok(Bytes::from(buffer))
    }
}

/// Media sequence number as a big-endian 128-bit IV
pub fn u64_to_iv_bytes(val: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&val.to_be_bytes());
    iv
}
