//! Live device source
//!
//! Wraps a [`DeviceDriver`] collaborator. The driver pushes [`DeviceEvent`]s
//! from its own callback context into a bounded channel; the source task turns
//! each sample into a [`MetricEvent`] with a locally assigned sequence number.

use super::{MetricSource, SourceFactory, SourceSink};
use crate::config::FocusConfig;
use crate::error::FocusError;
use crate::types::{MetricEvent, RawSample, SessionId};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Events a device driver can report
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Sample(RawSample),
    /// The device went away; carries the driver's reason
    Disconnected(String),
}

/// External device collaborator
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Locate the device. Callers bound this with their own timeout.
    async fn discover(&self) -> Result<(), FocusError>;

    /// Connect and start pushing events into `events`
    async fn connect(&self, events: mpsc::Sender<DeviceEvent>) -> Result<(), FocusError>;

    /// Stop pushing events and release the device
    async fn disconnect(&self);
}

/// Source backed by a live device
pub struct LiveDeviceSource {
    session_id: SessionId,
    driver: Arc<dyn DeviceDriver>,
    discovery_timeout: Duration,
    channel_capacity: usize,
    active: Arc<AtomicBool>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl LiveDeviceSource {
    pub fn new(session_id: SessionId, driver: Arc<dyn DeviceDriver>, discovery_timeout: Duration) -> Self {
        Self {
            session_id,
            driver,
            discovery_timeout,
            channel_capacity: 64,
            active: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Capacity of the driver-to-source channel
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    async fn connect_within_timeout(
        &self,
        events: mpsc::Sender<DeviceEvent>,
    ) -> Result<(), FocusError> {
        let attempt = async {
            self.driver.discover().await?;
            self.driver.connect(events).await
        };
        match tokio::time::timeout(self.discovery_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(FocusError::SourceUnavailable(format!(
                "device not found within {:?}",
                self.discovery_timeout
            ))),
        }
    }
}

#[async_trait]
impl MetricSource for LiveDeviceSource {
    fn name(&self) -> &str {
        "live-device"
    }

    async fn start(&mut self, sink: SourceSink) -> Result<(), FocusError> {
        if self.task.is_some() {
            warn!(session_id = self.session_id, "Live source already started");
            return Ok(());
        }

        let (events_tx, mut events_rx) = mpsc::channel(self.channel_capacity);
        if let Err(e) = self.connect_within_timeout(events_tx).await {
            self.driver.disconnect().await;
            return Err(match e {
                FocusError::SourceUnavailable(_) => e,
                other => FocusError::SourceUnavailable(other.to_string()),
            });
        }

        info!(session_id = self.session_id, "Live device connected");
        self.active.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let active = Arc::clone(&self.active);
        let session_id = self.session_id;

        let handle = tokio::spawn(async move {
            let mut sequence = 0u64;
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    next = events_rx.recv() => next,
                };

                match next {
                    Some(DeviceEvent::Sample(sample)) => {
                        match MetricEvent::from_sample(session_id, sequence + 1, sample) {
                            Ok(event) => {
                                sequence += 1;
                                let delivered = tokio::select! {
                                    _ = token.cancelled() => break,
                                    ok = sink.event(event) => ok,
                                };
                                if !delivered {
                                    debug!(session_id, "Consumer gone, stopping live source");
                                    break;
                                }
                            }
                            Err(e) => warn!(session_id, error = %e, "Skipping device sample"),
                        }
                    }
                    Some(DeviceEvent::Disconnected(reason)) => {
                        warn!(session_id, %reason, "Device disconnected");
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = sink.failed(reason) => {}
                        }
                        break;
                    }
                    None => {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = sink.failed("device stream closed") => {}
                        }
                        break;
                    }
                }
            }
            active.store(false, Ordering::SeqCst);
        });

        self.task = Some((cancel, handle));
        Ok(())
    }

    async fn stop(&mut self) {
        let Some((cancel, handle)) = self.task.take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!(session_id = self.session_id, error = %e, "Live source task panicked");
        }
        self.driver.disconnect().await;
        self.active.store(false, Ordering::SeqCst);
        info!(session_id = self.session_id, "Live device source stopped");
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Creates a [`LiveDeviceSource`] per session over one shared driver
#[derive(Clone)]
pub struct LiveSourceFactory {
    driver: Arc<dyn DeviceDriver>,
    discovery_timeout: Duration,
    channel_capacity: usize,
}

impl LiveSourceFactory {
    /// Discovery timeout and channel capacity come from `config`
    pub fn from_config(driver: Arc<dyn DeviceDriver>, config: &FocusConfig) -> Self {
        Self {
            driver,
            discovery_timeout: config.discovery_timeout(),
            channel_capacity: config.source_channel_capacity,
        }
    }
}

impl SourceFactory for LiveSourceFactory {
    fn create(&self, session_id: SessionId, _interval: Option<Duration>) -> Box<dyn MetricSource> {
        Box::new(
            LiveDeviceSource::new(session_id, Arc::clone(&self.driver), self.discovery_timeout)
                .with_channel_capacity(self.channel_capacity),
        )
    }
}

/// In-process driver for vendor SDKs that deliver data through callbacks.
///
/// The SDK side holds a [`DeviceHandle`] and calls its non-blocking methods
/// from whatever thread the vendor library uses.
#[derive(Clone)]
pub struct DeviceBridge {
    shared: Arc<BridgeShared>,
}

/// Callback-side handle of a [`DeviceBridge`]
#[derive(Clone)]
pub struct DeviceHandle {
    shared: Arc<BridgeShared>,
}

struct BridgeShared {
    present: watch::Sender<bool>,
    events: Mutex<Option<mpsc::Sender<DeviceEvent>>>,
}

impl DeviceBridge {
    pub fn new() -> (Self, DeviceHandle) {
        let (present, _) = watch::channel(false);
        let shared = Arc::new(BridgeShared {
            present,
            events: Mutex::new(None),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            DeviceHandle { shared },
        )
    }
}

impl DeviceHandle {
    /// Report that the device was found
    pub fn announce(&self) {
        self.shared.present.send_replace(true);
    }

    pub fn is_connected(&self) -> bool {
        self.sender().is_some()
    }

    /// Push a sample without blocking the caller.
    ///
    /// Fails when the source is not connected or its queue is full.
    pub fn push_sample(&self, sample: RawSample) -> Result<(), FocusError> {
        self.push(DeviceEvent::Sample(sample))
    }

    /// Report that the device dropped the connection
    pub fn disconnect(&self, reason: impl Into<String>) -> Result<(), FocusError> {
        self.shared.present.send_replace(false);
        self.push(DeviceEvent::Disconnected(reason.into()))
    }

    fn sender(&self) -> Option<mpsc::Sender<DeviceEvent>> {
        self.shared.events.lock().ok().and_then(|guard| guard.clone())
    }

    fn push(&self, event: DeviceEvent) -> Result<(), FocusError> {
        let sender = self
            .sender()
            .ok_or_else(|| FocusError::SourceUnavailable("device not connected".to_string()))?;
        sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                FocusError::SourceFailed("device queue full, sample dropped".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                FocusError::SourceUnavailable("device stream closed".to_string())
            }
        })
    }
}

#[async_trait]
impl DeviceDriver for DeviceBridge {
    async fn discover(&self) -> Result<(), FocusError> {
        let mut present = self.shared.present.subscribe();
        present
            .wait_for(|found| *found)
            .await
            .map(|_| ())
            .map_err(|_| FocusError::SourceUnavailable("device bridge dropped".to_string()))
    }

    async fn connect(&self, events: mpsc::Sender<DeviceEvent>) -> Result<(), FocusError> {
        let mut guard = self
            .shared
            .events
            .lock()
            .map_err(|_| FocusError::SourceUnavailable("device bridge poisoned".to_string()))?;
        *guard = Some(events);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Ok(mut guard) = self.shared.events.lock() {
            guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceSignal;
    use crate::types::{MetricBundle, SampleTime};

    fn sample(t: f64, concentration: Option<f64>) -> RawSample {
        let mut metrics = MetricBundle::new();
        metrics.insert("heart_rate".to_string(), 70.0);
        if let Some(c) = concentration {
            metrics.insert("concentration".to_string(), c);
        }
        RawSample::new(SampleTime::Seconds(t), metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fails_when_device_not_found() {
        let (bridge, _handle) = DeviceBridge::new();
        let mut source = LiveDeviceSource::new(1, Arc::new(bridge), Duration::from_secs(5));
        let (sink, mut rx) = SourceSink::channel(8);

        let result = source.start(sink).await;
        assert!(matches!(result, Err(FocusError::SourceUnavailable(_))));
        assert!(!source.is_active());
        // nothing was reported through the sink
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_samples_become_sequenced_events() {
        let (bridge, handle) = DeviceBridge::new();
        handle.announce();
        let mut source = LiveDeviceSource::new(9, Arc::new(bridge), Duration::from_secs(1));
        let (sink, mut rx) = SourceSink::channel(8);
        source.start(sink).await.unwrap();
        assert!(source.is_active());

        handle.push_sample(sample(1.0, Some(70.0))).unwrap();
        handle.push_sample(sample(2.0, None)).unwrap();
        handle.push_sample(sample(3.0, Some(65.0))).unwrap();

        let mut events = Vec::new();
        while events.len() < 2 {
            match rx.recv().await {
                Some(SourceSignal::Event(e)) => events.push(e),
                other => panic!("unexpected signal {:?}", other),
            }
        }
        assert_eq!(events[0].sequence_number, 1);
        assert_eq!(events[0].concentration, 70.0);
        assert_eq!(events[1].sequence_number, 2);
        assert_eq!(events[1].concentration, 65.0);
        assert_eq!(events[1].session_id, 9);

        source.stop().await;
        assert!(!source.is_active());
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_reports_failure() {
        let (bridge, handle) = DeviceBridge::new();
        handle.announce();
        let mut source = LiveDeviceSource::new(2, Arc::new(bridge), Duration::from_secs(1));
        let (sink, mut rx) = SourceSink::channel(8);
        source.start(sink).await.unwrap();

        handle.disconnect("battery low").unwrap();
        match rx.recv().await {
            Some(SourceSignal::Failed(reason)) => assert_eq!(reason, "battery low"),
            other => panic!("unexpected signal {:?}", other),
        }
        source.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (bridge, _handle) = DeviceBridge::new();
        let mut source = LiveDeviceSource::new(3, Arc::new(bridge), Duration::from_secs(1));
        source.stop().await;
        source.stop().await;
        assert!(!source.is_active());
        assert!(!source.set_interval(Duration::from_millis(10)));
    }

    #[test]
    fn test_push_without_connection_fails() {
        let (_bridge, handle) = DeviceBridge::new();
        assert!(matches!(
            handle.push_sample(sample(1.0, Some(1.0))),
            Err(FocusError::SourceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_completes_while_consumer_is_stalled() {
        let (bridge, handle) = DeviceBridge::new();
        handle.announce();
        let mut source = LiveDeviceSource::new(4, Arc::new(bridge), Duration::from_secs(1));
        // receiver stays alive but is never drained
        let (sink, _rx) = SourceSink::channel(1);
        source.start(sink).await.unwrap();

        for t in 1..=3 {
            handle.push_sample(sample(t as f64, Some(60.0))).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(2), source.stop()).await;
        assert!(stopped.is_ok());
        assert!(!source.is_active());
        assert!(!handle.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_factory_uses_configured_discovery_timeout() {
        let (bridge, _handle) = DeviceBridge::new();
        let config = FocusConfig {
            discovery_timeout_ms: 250,
            ..FocusConfig::default()
        };
        let factory = LiveSourceFactory::from_config(Arc::new(bridge), &config);
        let mut source = factory.create(6, None);
        assert_eq!(source.name(), "live-device");

        let (sink, _rx) = SourceSink::channel(4);
        let started = tokio::time::Instant::now();
        assert!(matches!(source.start(sink).await, Err(FocusError::SourceUnavailable(_))));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(250) && waited < Duration::from_secs(1));
    }
}
