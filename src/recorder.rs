//! Sample recording
//!
//! Every concentration value that passes through a session can be handed to a
//! storage collaborator. Writes are batched: samples accumulate in a buffer
//! and are persisted once the flush threshold is reached, when streaming stops
//! and on shutdown.

use crate::config::FocusConfig;
use crate::error::FocusError;
use crate::types::{MetricEvent, SessionId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Backlog kept across failed flushes, as a multiple of the threshold
const BACKLOG_FACTOR: usize = 4;

/// A concentration value as handed to storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSample {
    pub session_id: SessionId,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// Recorded while a calibration run was active
    pub is_calibration: bool,
}

impl StoredSample {
    pub fn from_event(event: &MetricEvent, is_calibration: bool) -> Self {
        Self {
            session_id: event.session_id,
            sequence_number: event.sequence_number,
            timestamp: event.timestamp,
            value: event.concentration,
            is_calibration,
        }
    }
}

/// Storage collaborator
#[async_trait]
pub trait SampleStore: Send + Sync {
    async fn persist(&self, batch: &[StoredSample]) -> Result<(), FocusError>;
}

/// Store that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    samples: Mutex<Vec<StoredSample>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn samples(&self) -> Vec<StoredSample> {
        self.samples.lock().await.clone()
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn persist(&self, batch: &[StoredSample]) -> Result<(), FocusError> {
        self.samples.lock().await.extend_from_slice(batch);
        Ok(())
    }
}

/// Buffer in front of a [`SampleStore`]
pub struct BufferedRecorder {
    store: Arc<dyn SampleStore>,
    threshold: usize,
    buffer: Mutex<Vec<StoredSample>>,
}

impl BufferedRecorder {
    pub fn new(store: Arc<dyn SampleStore>, threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            store,
            threshold,
            buffer: Mutex::new(Vec::with_capacity(threshold)),
        }
    }

    /// Recorder flushing at the configured `recorder_flush_threshold`
    pub fn from_config(store: Arc<dyn SampleStore>, config: &FocusConfig) -> Self {
        Self::new(store, config.recorder_flush_threshold)
    }

    pub async fn pending(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Buffer one sample, flushing when the threshold is reached
    pub async fn record(&self, sample: StoredSample) -> Result<(), FocusError> {
        let full = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(sample);
            buffer.len() >= self.threshold
        };
        if full {
            self.flush().await?;
        }
        Ok(())
    }

    /// Persist everything buffered. Returns the number of samples written.
    ///
    /// On failure the batch goes back to the front of the buffer; once the
    /// backlog limit is exceeded the oldest samples are dropped.
    pub async fn flush(&self) -> Result<usize, FocusError> {
        let batch = std::mem::take(&mut *self.buffer.lock().await);
        if batch.is_empty() {
            return Ok(0);
        }

        match self.store.persist(&batch).await {
            Ok(()) => {
                debug!(count = batch.len(), "Flushed samples");
                Ok(batch.len())
            }
            Err(e) => {
                let mut buffer = self.buffer.lock().await;
                let newer = std::mem::replace(&mut *buffer, batch);
                buffer.extend(newer);

                let limit = self.threshold * BACKLOG_FACTOR;
                if buffer.len() > limit {
                    let dropped = buffer.len() - limit;
                    buffer.drain(..dropped);
                    warn!(dropped, "Sample backlog full, dropping oldest samples");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn sample(seq: u64) -> StoredSample {
        StoredSample {
            session_id: 1,
            sequence_number: seq,
            timestamp: Utc::now(),
            value: seq as f64,
            is_calibration: false,
        }
    }

    struct FlakyStore {
        failing: AtomicBool,
        inner: MemoryStore,
    }

    #[async_trait]
    impl SampleStore for FlakyStore {
        async fn persist(&self, batch: &[StoredSample]) -> Result<(), FocusError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(FocusError::Io(std::io::Error::other("disk full")));
            }
            self.inner.persist(batch).await
        }
    }

    #[tokio::test]
    async fn test_flushes_at_threshold() {
        let store = Arc::new(MemoryStore::new());
        let recorder = BufferedRecorder::new(store.clone(), 3);

        recorder.record(sample(1)).await.unwrap();
        recorder.record(sample(2)).await.unwrap();
        assert!(store.samples().await.is_empty());

        recorder.record(sample(3)).await.unwrap();
        assert_eq!(store.samples().await.len(), 3);
        assert_eq!(recorder.pending().await, 0);

        recorder.record(sample(4)).await.unwrap();
        assert_eq!(recorder.flush().await.unwrap(), 1);
        assert_eq!(recorder.flush().await.unwrap(), 0);

        let seqs: Vec<u64> = store.samples().await.iter().map(|s| s.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_threshold_from_config() {
        let store = Arc::new(MemoryStore::new());
        let config = FocusConfig {
            recorder_flush_threshold: 2,
            ..FocusConfig::default()
        };
        let recorder = BufferedRecorder::from_config(store.clone(), &config);

        recorder.record(sample(1)).await.unwrap();
        assert_eq!(recorder.pending().await, 1);
        recorder.record(sample(2)).await.unwrap();
        assert_eq!(recorder.pending().await, 0);
        assert_eq!(store.samples().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_samples_in_order() {
        let store = Arc::new(FlakyStore {
            failing: AtomicBool::new(true),
            inner: MemoryStore::new(),
        });
        let recorder = BufferedRecorder::new(store.clone(), 2);

        recorder.record(sample(1)).await.unwrap();
        assert!(recorder.record(sample(2)).await.is_err());
        assert_eq!(recorder.pending().await, 2);

        store.failing.store(false, Ordering::SeqCst);
        recorder.record(sample(3)).await.unwrap();

        let seqs: Vec<u64> = store.inner.samples().await.iter().map(|s| s.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_backlog_is_bounded() {
        let store = Arc::new(FlakyStore {
            failing: AtomicBool::new(true),
            inner: MemoryStore::new(),
        });
        let recorder = BufferedRecorder::new(store.clone(), 1);

        for seq in 1..=10 {
            let _ = recorder.record(sample(seq)).await;
        }
        assert_eq!(recorder.pending().await, BACKLOG_FACTOR);

        store.failing.store(false, Ordering::SeqCst);
        recorder.flush().await.unwrap();
        let seqs: Vec<u64> = store.inner.samples().await.iter().map(|s| s.sequence_number).collect();
        assert_eq!(seqs, vec![7, 8, 9, 10]);
    }
}
