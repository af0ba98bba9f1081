//! Metric ingestion sources
//!
//! A source produces [`MetricEvent`]s for exactly one session. Once started it
//! pushes [`SourceSignal`]s into a bounded channel owned by the session's pump
//! task until it is stopped, runs out of data or fails.

mod live;
mod replay;

pub use live::{DeviceBridge, DeviceDriver, DeviceEvent, DeviceHandle, LiveDeviceSource, LiveSourceFactory};
pub use replay::{FileReplaySource, ReplayConfig, ReplayMode, ReplaySourceFactory};

use crate::error::FocusError;
use crate::types::{MetricEvent, SessionId, SessionMarker};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Everything a source can report to its consumer
#[derive(Debug, Clone)]
pub enum SourceSignal {
    Event(MetricEvent),
    /// Session boundary metadata found in the input
    Marker(SessionMarker),
    /// The input has no more data; the source is inactive
    Exhausted,
    /// The collaborator failed mid-stream; the source is inactive
    Failed(String),
}

/// Sending half handed to a source on start
#[derive(Debug, Clone)]
pub struct SourceSink {
    tx: mpsc::Sender<SourceSignal>,
}

impl SourceSink {
    /// Create a sink and the receiver the consumer reads from
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SourceSignal>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Forward an event. Returns `false` once the consumer is gone.
    pub async fn event(&self, event: MetricEvent) -> bool {
        self.tx.send(SourceSignal::Event(event)).await.is_ok()
    }

    pub async fn marker(&self, marker: SessionMarker) -> bool {
        self.tx.send(SourceSignal::Marker(marker)).await.is_ok()
    }

    pub async fn exhausted(&self) {
        let _ = self.tx.send(SourceSignal::Exhausted).await;
    }

    pub async fn failed(&self, reason: impl Into<String>) {
        let _ = self.tx.send(SourceSignal::Failed(reason.into())).await;
    }
}

/// A producer of metric events
#[async_trait]
pub trait MetricSource: Send {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Start producing into `sink`.
    ///
    /// Fails with `SourceUnavailable` when the underlying device or file cannot
    /// be reached; nothing is sent to the sink in that case.
    async fn start(&mut self, sink: SourceSink) -> Result<(), FocusError>;

    /// Stop producing and wait for the background task to finish.
    ///
    /// Idempotent, and safe to call on a source that was never started.
    async fn stop(&mut self);

    fn is_active(&self) -> bool;

    /// Change the pacing between emitted events. Returns `false` when the
    /// source is not paced (live devices).
    fn set_interval(&mut self, _interval: Duration) -> bool {
        false
    }
}

/// Creates sources on demand, e.g. when a subscriber sends `start_stream`
pub trait SourceFactory: Send + Sync {
    fn create(&self, session_id: SessionId, interval: Option<Duration>) -> Box<dyn MetricSource>;
}
