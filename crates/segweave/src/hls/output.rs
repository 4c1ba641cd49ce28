// HLS Output: the single writer that owns the reorder buffer and the sink.
// Units arrive in completion order and leave in index order.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::HlsDownloaderError;
use super::config::{GapPolicy, HlsOutputConfig};

/// A segment payload after decryption, tagged with its output position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedUnit {
    pub index: u64,
    pub payload: Bytes,
}

/// What a worker hands to the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentDelivery {
    Unit(FetchedUnit),
    /// The segment's task ended without a payload
    Failed(u64),
}

/// Held-back payloads plus the next index the sink is waiting for.
///
/// Every held index is strictly greater than `expected`. A unit for the
/// expected index is never stored: it comes straight back from
/// [`ReorderBuffer::push`] together with any run it completes.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    expected: u64,
    held: BTreeMap<u64, Bytes>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Number of segments completed but not yet writable
    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    pub fn held_indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.held.keys().copied()
    }

    /// Accept a unit and return whatever is now writable, in order.
    /// An index already written or already held is a logic fault.
    pub fn push(
        &mut self,
        index: u64,
        payload: Bytes,
    ) -> Result<Vec<(u64, Bytes)>, HlsDownloaderError> {
        if index < self.expected || self.held.contains_key(&index) {
            return Err(HlsDownloaderError::ReorderViolation {
                index,
                expected: self.expected,
            });
        }
        if index > self.expected {
            self.held.insert(index, payload);
            return Ok(Vec::new());
        }
        let mut ready = vec![(index, payload)];
        self.expected += 1;
        self.take_contiguous(&mut ready);
        Ok(ready)
    }

    /// Give up on the expected index. Returns it along with the units the
    /// skip made writable.
    pub fn skip_expected(&mut self) -> (u64, Vec<(u64, Bytes)>) {
        let skipped = self.expected;
        self.expected += 1;
        let mut ready = Vec::new();
        self.take_contiguous(&mut ready);
        (skipped, ready)
    }

    /// Empty the buffer in index order, leaving `expected` past the last unit.
    pub fn drain_held(&mut self) -> Vec<(u64, Bytes)> {
        let held = std::mem::take(&mut self.held);
        if let Some((&last, _)) = held.last_key_value() {
            self.expected = last + 1;
        }
        held.into_iter().collect()
    }

    fn take_contiguous(&mut self, ready: &mut Vec<(u64, Bytes)>) {
        while let Some(payload) = self.held.remove(&self.expected) {
            ready.push((self.expected, payload));
            self.expected += 1;
        }
    }
}

/// Per-job writer outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterSummary {
    /// Units written to the sink
    pub written: u64,
    pub bytes_written: u64,
    /// Indices stepped over under [`GapPolicy::Skip`]
    pub skipped: Vec<u64>,
    /// Units still held at drain under [`GapPolicy::Wait`], never written
    pub dropped: Vec<u64>,
}

pub struct OutputManager<W> {
    sink: W,
    input_rx: mpsc::UnboundedReceiver<SegmentDelivery>,
    buffer: ReorderBuffer,
    config: HlsOutputConfig,
    /// Failed indices not yet reached by the buffer
    failed: BTreeSet<u64>,
    skipped: BTreeSet<u64>,
    summary: WriterSummary,
    token: CancellationToken,
}

impl<W> OutputManager<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        sink: W,
        input_rx: mpsc::UnboundedReceiver<SegmentDelivery>,
        config: HlsOutputConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            sink,
            input_rx,
            buffer: ReorderBuffer::new(),
            config,
            failed: BTreeSet::new(),
            skipped: BTreeSet::new(),
            summary: WriterSummary::default(),
            token,
        }
    }

    /// Consume deliveries until every sender is gone and the queue is empty,
    /// then drain the buffer and close the sink.
    ///
    /// A fatal writer error cancels `token` so producers stop early.
    pub async fn run(mut self) -> Result<(W, WriterSummary), HlsDownloaderError> {
        debug!(gap_policy = ?self.config.gap_policy, "Writer started");
        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    debug!(expected = self.buffer.expected(), "Writer cancelled, closing sink without draining");
                    let _ = self.sink.shutdown().await;
                    return Err(HlsDownloaderError::Cancelled);
                }

                delivery = self.input_rx.recv() => match delivery {
                    Some(delivery) => {
                        if let Err(e) = self.accept(delivery).await {
                            error!(error = %e, "Writer failed, stopping job");
                            self.token.cancel();
                            let _ = self.sink.shutdown().await;
                            return Err(e);
                        }
                    }
                    // Every producer is gone and the queue is empty.
                    None => break,
                },
            }
        }

        if let Err(e) = self.drain().await {
            let _ = self.sink.shutdown().await;
            return Err(e);
        }
        self.sink.flush().await?;
        self.sink.shutdown().await?;
        info!(
            written = self.summary.written,
            bytes = self.summary.bytes_written,
            skipped = self.summary.skipped.len(),
            dropped = self.summary.dropped.len(),
            "Writer closed sink"
        );
        Ok((self.sink, self.summary))
    }

    async fn accept(&mut self, delivery: SegmentDelivery) -> Result<(), HlsDownloaderError> {
        match delivery {
            SegmentDelivery::Unit(FetchedUnit { index, payload }) => {
                if self.skipped.contains(&index) {
                    warn!(index, "Segment arrived after being skipped, discarding");
                    return Ok(());
                }
                let ready = self.buffer.push(index, payload)?;
                self.write_all(ready).await?;
            }
            SegmentDelivery::Failed(index) => {
                if index >= self.buffer.expected() {
                    self.failed.insert(index);
                }
            }
        }
        self.skip_failed().await?;
        self.enforce_limit().await
    }

    /// Under [`GapPolicy::Skip`], step over every known-failed index the
    /// buffer is currently stuck on.
    async fn skip_failed(&mut self) -> Result<(), HlsDownloaderError> {
        if self.config.gap_policy != GapPolicy::Skip {
            return Ok(());
        }
        while self.failed.remove(&self.buffer.expected()) {
            self.skip_expected("fetch failed").await?;
        }
        Ok(())
    }

    async fn enforce_limit(&mut self) -> Result<(), HlsDownloaderError> {
        let Some(limit) = self.config.max_buffered_segments else {
            return Ok(());
        };
        while self.buffer.held_len() > limit {
            match self.config.gap_policy {
                GapPolicy::Wait => {
                    return Err(HlsDownloaderError::ReorderBufferOverflow {
                        expected: self.buffer.expected(),
                        buffered: self.buffer.held_len(),
                        limit,
                    });
                }
                GapPolicy::Skip => {
                    self.skip_expected("reorder buffer full").await?;
                    self.skip_failed().await?;
                }
            }
        }
        Ok(())
    }

    async fn skip_expected(&mut self, reason: &str) -> Result<(), HlsDownloaderError> {
        let (index, ready) = self.buffer.skip_expected();
        self.failed.remove(&index);
        self.skipped.insert(index);
        self.summary.skipped.push(index);
        warn!(index, reason, "Skipping segment, output will have a gap");
        self.write_all(ready).await
    }

    async fn drain(&mut self) -> Result<(), HlsDownloaderError> {
        if self.buffer.held_len() == 0 {
            return Ok(());
        }
        match self.config.gap_policy {
            GapPolicy::Wait => {
                self.summary.dropped = self.buffer.held_indices().collect();
                warn!(
                    expected = self.buffer.expected(),
                    dropped = ?self.summary.dropped,
                    "Segment never arrived, held-back segments were not written"
                );
                self.buffer.drain_held();
            }
            GapPolicy::Skip => {
                let mut next = self.buffer.expected();
                for (index, payload) in self.buffer.drain_held() {
                    for missing in next..index {
                        self.summary.skipped.push(missing);
                        warn!(index = missing, "Segment never arrived, output will have a gap");
                    }
                    self.write_unit(index, &payload).await?;
                    next = index + 1;
                }
            }
        }
        Ok(())
    }

    async fn write_all(&mut self, ready: Vec<(u64, Bytes)>) -> Result<(), HlsDownloaderError> {
        for (index, payload) in ready {
            self.write_unit(index, &payload).await?;
        }
        Ok(())
    }

    async fn write_unit(&mut self, index: u64, payload: &Bytes) -> Result<(), HlsDownloaderError> {
        self.sink.write_all(payload).await?;
        self.summary.written += 1;
        self.summary.bytes_written += payload.len() as u64;
        debug!(index, bytes = payload.len(), "Wrote segment");
        Ok(())
    }
}
