//! Session orchestration
//!
//! [`SessionOrchestrator`] wires a session's source to calibration, the dip
//! detector, the sample recorder and the registry. Each streaming session owns
//! one pump task that drains the source's channel and fans every event out:
//!
//! 1. publish `concentration_update`
//! 2. feed the active calibration run and publish its progress
//! 3. hand the sample to the recorder
//! 4. evaluate the dip detector and publish `exercise_suggestion` on a dip
//!
//! Lifecycle operations (start, stop, calibration) are serialized per
//! orchestrator. Stopping cancels the pump and waits for it, so once
//! [`SessionOrchestrator::stop_streaming`] returns nothing more is published
//! for that session's source.

use crate::calibration::{CalibrationController, CalibrationProgress, CalibrationSummary};
use crate::config::FocusConfig;
use crate::detector::DipDetector;
use crate::error::FocusError;
use crate::exercise::{
    available_exercises, Effectiveness, ExerciseOutcome, ExerciseSuggester, LoggingSuggester,
};
use crate::message::{ExerciseResolution, MetricsSnapshot, OutboundMessage};
use crate::recorder::{BufferedRecorder, SampleStore, StoredSample};
use crate::registry::SessionRegistry;
use crate::source::{MetricSource, SourceSignal, SourceSink};
use crate::types::{ExerciseTrigger, MetricEvent, Session, SessionId, SessionMarker, SessionState};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-session bookkeeping
#[derive(Debug)]
struct SessionEntry {
    session: Session,
    /// Trigger waiting for the exercise to be resolved
    outstanding: Option<ExerciseTrigger>,
    latest: Option<MetricEvent>,
    total_points: u64,
}

impl SessionEntry {
    fn new(session_id: SessionId) -> Self {
        Self {
            session: Session::new(session_id),
            outstanding: None,
            latest: None,
            total_points: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    sessions: HashMap<SessionId, SessionEntry>,
    calibration: CalibrationController,
}

impl Shared {
    fn entry(&mut self, session_id: SessionId) -> Result<&mut SessionEntry, FocusError> {
        self.sessions
            .get_mut(&session_id)
            .ok_or(FocusError::SessionNotFound(session_id))
    }
}

/// Requests handled by a running pump
enum PumpControl {
    SetInterval(Duration, oneshot::Sender<bool>),
}

struct SessionWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    control: mpsc::Sender<PumpControl>,
}

impl SessionWorker {
    async fn shutdown(self, session_id: SessionId) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!(session_id, error = %e, "Session pump panicked");
        }
    }
}

type Ticker = (CancellationToken, JoinHandle<()>);

/// State shared between the orchestrator and its background tasks
#[derive(Clone)]
struct Core {
    config: FocusConfig,
    registry: SessionRegistry,
    detector: DipDetector,
    suggester: Arc<dyn ExerciseSuggester>,
    recorder: Option<Arc<BufferedRecorder>>,
    shared: Arc<Mutex<Shared>>,
    tickers: Arc<Mutex<HashMap<SessionId, Ticker>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Core {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    async fn handle_event(&self, event: MetricEvent) {
        let session_id = event.session_id;
        self.registry
            .publish(
                session_id,
                OutboundMessage::ConcentrationUpdate { data: event.clone() },
            )
            .await;

        let (progress, trigger) = {
            let mut guard = self.shared();
            let shared = &mut *guard;
            let progress = shared.calibration.record(session_id, event.concentration);
            let Some(entry) = shared.sessions.get_mut(&session_id) else {
                warn!(session_id, "Event for unknown session");
                return;
            };
            entry.latest = Some(event.clone());
            entry.total_points += 1;

            let baseline = entry.session.baseline_concentration;
            let trigger = if entry.outstanding.is_none()
                && self.detector.should_trigger(event.concentration, baseline)
            {
                let trigger = ExerciseTrigger {
                    session_id,
                    triggered_at: Utc::now(),
                    concentration_at_trigger: event.concentration,
                    baseline_at_trigger: baseline.unwrap_or_default(),
                    sequence_number: event.sequence_number,
                };
                entry.outstanding = Some(trigger.clone());
                entry.session.focus_dips += 1;
                Some(trigger)
            } else {
                None
            };
            (progress, trigger)
        };

        let calibrating = progress.is_some();
        if let Some(progress) = progress {
            self.registry
                .publish(session_id, OutboundMessage::CalibrationProgress { data: progress })
                .await;
        }

        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder
                .record(StoredSample::from_event(&event, calibrating))
                .await
            {
                warn!(session_id, error = %e, "Failed to record sample");
            }
        }

        if let Some(trigger) = trigger {
            info!(
                session_id,
                sequence = trigger.sequence_number,
                concentration = trigger.concentration_at_trigger,
                baseline = trigger.baseline_at_trigger,
                "Concentration dip detected"
            );
            self.registry
                .publish(
                    session_id,
                    OutboundMessage::ExerciseSuggestion {
                        data: trigger.clone(),
                        exercises: available_exercises(),
                    },
                )
                .await;
            self.suggester.suggest(&trigger);
        }
    }

    fn apply_marker(&self, session_id: SessionId, marker: SessionMarker) {
        if let Ok(entry) = self.shared().entry(session_id) {
            debug!(session_id, ?marker, "Recording marker");
            entry.session.apply_marker(marker);
        }
    }

    async fn source_exhausted(&self, session_id: SessionId) {
        info!(session_id, "Source exhausted");
        {
            let mut shared = self.shared();
            if let Ok(entry) = shared.entry(session_id) {
                if let Err(e) = entry.session.transition(SessionState::Idle, "finish stream") {
                    warn!(session_id, error = %e, "Unexpected state on exhaustion");
                }
            }
        }
        self.registry
            .publish(session_id, OutboundMessage::StreamStopped { session_id })
            .await;
    }

    async fn source_failed(&self, session_id: SessionId, reason: String) {
        let failure = FocusError::SourceFailed(reason.clone());
        error!(session_id, error = %failure, "Source failed");

        self.stop_ticker(session_id).await;
        {
            let mut shared = self.shared();
            if shared.calibration.abort(session_id) {
                warn!(session_id, "Calibration aborted by source failure");
            }
            if let Ok(entry) = shared.entry(session_id) {
                if let Err(e) = entry.session.transition(SessionState::Idle, "fail stream") {
                    warn!(session_id, error = %e, "Unexpected state on failure");
                }
            }
        }

        self.registry
            .publish(session_id, OutboundMessage::SourceFailed { session_id, reason })
            .await;
        self.registry
            .publish(session_id, OutboundMessage::error(failure.to_string()))
            .await;
    }

    fn spawn_ticker(&self, session_id: SessionId) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.clone().run_ticker(session_id, cancel.clone()));
        if let Some((stale, _)) = lock(&self.tickers).insert(session_id, (cancel, handle)) {
            stale.cancel();
        }
    }

    async fn stop_ticker(&self, session_id: SessionId) {
        let ticker = lock(&self.tickers).remove(&session_id);
        if let Some((cancel, handle)) = ticker {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(session_id, error = %e, "Calibration ticker panicked");
            }
        }
    }

    /// Publish calibration progress on a fixed period until the window ends
    async fn run_ticker(self, session_id: SessionId, cancel: CancellationToken) {
        let period = self
            .config
            .calibration_progress_interval()
            .max(Duration::from_millis(1));
        let mut ticks = tokio::time::interval(period);
        // the first tick completes immediately
        ticks.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {
                    let progress = {
                        let shared = self.shared();
                        shared.calibration.is_calibrating(session_id).then(|| {
                            (
                                shared.calibration.progress(session_id),
                                shared.calibration.is_due(session_id),
                            )
                        })
                    };
                    let Some((progress, finished)) = progress else { break };
                    self.registry
                        .publish(session_id, OutboundMessage::CalibrationProgress { data: progress })
                        .await;
                    if finished {
                        debug!(session_id, "Calibration window elapsed");
                        break;
                    }
                }
            }
        }
    }

    async fn flush_recorder(&self) {
        if let Some(recorder) = &self.recorder {
            match recorder.flush().await {
                Ok(0) => {}
                Ok(count) => debug!(count, "Flushed recorder"),
                Err(e) => warn!(error = %e, "Failed to flush recorder"),
            }
        }
    }
}

/// Drain one source until it stops, fails or the session is stopped
async fn run_pump(
    core: Core,
    session_id: SessionId,
    mut source: Box<dyn MetricSource>,
    mut signals: mpsc::Receiver<SourceSignal>,
    mut control: mpsc::Receiver<PumpControl>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(request) = control.recv() => match request {
                PumpControl::SetInterval(interval, reply) => {
                    let _ = reply.send(source.set_interval(interval));
                }
            },
            signal = signals.recv() => match signal {
                Some(SourceSignal::Event(event)) => core.handle_event(event).await,
                Some(SourceSignal::Marker(marker)) => core.apply_marker(session_id, marker),
                Some(SourceSignal::Exhausted) => {
                    core.source_exhausted(session_id).await;
                    break;
                }
                Some(SourceSignal::Failed(reason)) => {
                    core.source_failed(session_id, reason).await;
                    break;
                }
                None => {
                    core.source_failed(session_id, "source closed unexpectedly".to_string()).await;
                    break;
                }
            },
        }
    }

    // unblock a producer waiting on a full channel before joining it
    drop(signals);
    source.stop().await;
    debug!(session_id, source = source.name(), "Session pump finished");
}

/// Coordinates sources, calibration, dip detection and broadcasting for
/// every session
pub struct SessionOrchestrator {
    core: Core,
    workers: tokio::sync::Mutex<HashMap<SessionId, SessionWorker>>,
}

impl SessionOrchestrator {
    pub fn new(config: FocusConfig) -> Self {
        let registry = SessionRegistry::new(config.subscriber_buffer, config.delivery_timeout());
        Self {
            core: Core {
                detector: DipDetector::new(config.dip_ratio),
                registry,
                config,
                suggester: Arc::new(LoggingSuggester),
                recorder: None,
                shared: Arc::new(Mutex::new(Shared::default())),
                tickers: Arc::new(Mutex::new(HashMap::new())),
            },
            workers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_suggester(mut self, suggester: Arc<dyn ExerciseSuggester>) -> Self {
        self.core.suggester = suggester;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<BufferedRecorder>) -> Self {
        self.core.recorder = Some(recorder);
        self
    }

    /// Record samples into `store` with the configured flush threshold
    pub fn with_store(self, store: Arc<dyn SampleStore>) -> Self {
        let recorder = BufferedRecorder::from_config(store, &self.core.config);
        self.with_recorder(Arc::new(recorder))
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.core.registry
    }

    pub fn config(&self) -> &FocusConfig {
        &self.core.config
    }

    /// Register an idle session. Existing sessions are left untouched.
    pub fn create_session(&self, session_id: SessionId) -> Session {
        self.core
            .shared()
            .sessions
            .entry(session_id)
            .or_insert_with(|| {
                debug!(session_id, "Session created");
                SessionEntry::new(session_id)
            })
            .session
            .clone()
    }

    pub fn session(&self, session_id: SessionId) -> Option<Session> {
        self.core
            .shared()
            .sessions
            .get(&session_id)
            .map(|entry| entry.session.clone())
    }

    /// Start `source` and begin pumping its events.
    ///
    /// An ended session is reopened with its baseline kept. If the source
    /// cannot start the session stays idle and the error is returned.
    pub async fn start_streaming(
        &self,
        session_id: SessionId,
        mut source: Box<dyn MetricSource>,
    ) -> Result<(), FocusError> {
        let mut workers = self.workers.lock().await;

        {
            let mut shared = self.core.shared();
            let entry = shared.entry(session_id)?;
            let session = &mut entry.session;
            if session.state.is_live() {
                return Err(FocusError::InvalidSessionState {
                    session_id,
                    state: session.state.to_string(),
                    action: "start streaming",
                });
            }
            if session.state == SessionState::Ended {
                session.reopen()?;
            }
        }

        // a pump that ended on its own may still be winding down
        if let Some(stale) = workers.remove(&session_id) {
            stale.shutdown(session_id).await;
        }

        let (sink, signals) = SourceSink::channel(self.core.config.source_channel_capacity);
        source.start(sink).await?;

        let started = self
            .core
            .shared()
            .entry(session_id)
            .and_then(|entry| entry.session.transition(SessionState::Streaming, "start streaming"));
        if let Err(e) = started {
            source.stop().await;
            return Err(e);
        }

        info!(session_id, source = source.name(), "Streaming started");
        let cancel = CancellationToken::new();
        let (control, control_rx) = mpsc::channel(4);
        let handle = tokio::spawn(run_pump(
            self.core.clone(),
            session_id,
            source,
            signals,
            control_rx,
            cancel.clone(),
        ));
        workers.insert(
            session_id,
            SessionWorker {
                cancel,
                handle,
                control,
            },
        );
        Ok(())
    }

    /// Stop the session's source and end the session.
    ///
    /// Aborts an active calibration and releases its bookkeeping, clears an
    /// outstanding trigger and keeps the baseline. Calling it again is a no-op.
    pub async fn stop_streaming(&self, session_id: SessionId) -> Result<(), FocusError> {
        let mut workers = self.workers.lock().await;
        if !self.core.shared().sessions.contains_key(&session_id) {
            return Err(FocusError::SessionNotFound(session_id));
        }

        if let Some(worker) = workers.remove(&session_id) {
            worker.shutdown(session_id).await;
        }
        self.core.stop_ticker(session_id).await;

        {
            let mut shared = self.core.shared();
            if shared.calibration.abort(session_id) {
                info!(session_id, "Calibration aborted by stop");
            }
            shared.calibration.forget(session_id);
            let entry = shared.entry(session_id)?;
            entry.outstanding = None;
            entry.session.transition(SessionState::Ended, "stop streaming")?;
        }

        self.core.flush_recorder().await;
        info!(session_id, "Streaming stopped");
        Ok(())
    }

    /// Stop the session if needed and drop everything kept for it.
    ///
    /// Subscribers stay connected; the session id can be created again.
    pub async fn remove_session(&self, session_id: SessionId) -> Result<Session, FocusError> {
        self.stop_streaming(session_id).await?;

        let _workers = self.workers.lock().await;
        let mut shared = self.core.shared();
        shared.calibration.forget(session_id);
        let entry = shared
            .sessions
            .remove(&session_id)
            .ok_or(FocusError::SessionNotFound(session_id))?;
        info!(session_id, "Session removed");
        Ok(entry.session)
    }

    /// Begin a calibration run on a streaming session.
    ///
    /// `duration` defaults to the configured calibration window.
    pub async fn start_calibration(
        &self,
        session_id: SessionId,
        duration: Option<Duration>,
    ) -> Result<(), FocusError> {
        let _workers = self.workers.lock().await;
        let duration = duration.unwrap_or_else(|| self.core.config.calibration_duration());

        {
            let mut guard = self.core.shared();
            let shared = &mut *guard;
            let entry = shared
                .sessions
                .get_mut(&session_id)
                .ok_or(FocusError::SessionNotFound(session_id))?;
            match entry.session.state {
                SessionState::Streaming => {}
                SessionState::Calibrating => return Err(FocusError::AlreadyCalibrating(session_id)),
                _ => return Err(FocusError::NoActiveSource(session_id)),
            }
            shared.calibration.start(session_id, duration)?;
            entry.session.transition(SessionState::Calibrating, "start calibration")?;
        }

        info!(session_id, duration_secs = duration.as_secs_f64(), "Calibration started");
        self.core.spawn_ticker(session_id);
        Ok(())
    }

    /// Finish the active calibration and commit its mean as the baseline.
    ///
    /// With no samples the run fails and the previous baseline is kept.
    pub async fn complete_calibration(
        &self,
        session_id: SessionId,
    ) -> Result<CalibrationSummary, FocusError> {
        let _workers = self.workers.lock().await;
        self.core.stop_ticker(session_id).await;

        let summary = {
            let mut guard = self.core.shared();
            let shared = &mut *guard;
            let entry = shared
                .sessions
                .get_mut(&session_id)
                .ok_or(FocusError::SessionNotFound(session_id))?;
            let result = shared.calibration.complete(session_id);
            if entry.session.state == SessionState::Calibrating {
                entry.session.transition(SessionState::Streaming, "complete calibration")?;
            }
            let summary = result?;
            entry.session.baseline_concentration = Some(summary.baseline);
            summary
        };

        info!(
            session_id,
            baseline = summary.baseline,
            samples = summary.sample_count,
            "Calibration completed"
        );
        self.core
            .registry
            .publish(
                session_id,
                OutboundMessage::CalibrationCompleted { data: summary.clone() },
            )
            .await;
        Ok(summary)
    }

    /// Drop the active calibration run. Returns whether one was active.
    pub async fn abort_calibration(&self, session_id: SessionId) -> Result<bool, FocusError> {
        let _workers = self.workers.lock().await;
        self.core.stop_ticker(session_id).await;

        let mut guard = self.core.shared();
        let shared = &mut *guard;
        let entry = shared
            .sessions
            .get_mut(&session_id)
            .ok_or(FocusError::SessionNotFound(session_id))?;
        let aborted = shared.calibration.abort(session_id);
        if entry.session.state == SessionState::Calibrating {
            entry.session.transition(SessionState::Streaming, "abort calibration")?;
        }
        if aborted {
            info!(session_id, "Calibration aborted");
        }
        Ok(aborted)
    }

    pub fn calibration_progress(&self, session_id: SessionId) -> Result<CalibrationProgress, FocusError> {
        let shared = self.core.shared();
        if !shared.sessions.contains_key(&session_id) {
            return Err(FocusError::SessionNotFound(session_id));
        }
        Ok(shared.calibration.progress(session_id))
    }

    /// Use an externally stored baseline for the session
    pub fn import_baseline(&self, session_id: SessionId, baseline: f64) -> Result<(), FocusError> {
        if !(baseline.is_finite() && baseline > 0.0) {
            return Err(FocusError::MalformedRecord(format!("invalid baseline {}", baseline)));
        }
        let mut shared = self.core.shared();
        shared.entry(session_id)?.session.baseline_concentration = Some(baseline);
        info!(session_id, baseline, "Baseline imported");
        Ok(())
    }

    /// Clear the outstanding trigger once the user finished or skipped the
    /// exercise. Returns `None` when nothing was outstanding.
    pub async fn resolve_exercise(
        &self,
        session_id: SessionId,
        outcome: ExerciseOutcome,
    ) -> Result<Option<ExerciseResolution>, FocusError> {
        let resolution = {
            let mut shared = self.core.shared();
            let entry = shared.entry(session_id)?;
            let Some(trigger) = entry.outstanding.take() else {
                return Ok(None);
            };

            let before = trigger.concentration_at_trigger;
            let (after, effectiveness) = match outcome {
                ExerciseOutcome::Completed => {
                    let after = entry.latest.as_ref().map(|event| event.concentration);
                    (after, Some(Effectiveness::classify(Some(before), after)))
                }
                ExerciseOutcome::Skipped => (None, None),
            };
            ExerciseResolution {
                session_id,
                outcome,
                concentration_before: before,
                concentration_after: after,
                effectiveness,
                resolved_at: Utc::now(),
            }
        };

        info!(
            session_id,
            outcome = ?resolution.outcome,
            effectiveness = ?resolution.effectiveness,
            "Exercise resolved"
        );
        self.core
            .registry
            .publish(
                session_id,
                OutboundMessage::ExerciseResolved { data: resolution.clone() },
            )
            .await;
        Ok(Some(resolution))
    }

    /// Change the pacing of the session's source.
    ///
    /// Returns whether the source accepted the new interval.
    pub async fn set_speed(&self, session_id: SessionId, interval: Duration) -> Result<bool, FocusError> {
        let workers = self.workers.lock().await;
        let worker = workers
            .get(&session_id)
            .filter(|worker| !worker.handle.is_finished())
            .ok_or(FocusError::NoActiveSource(session_id))?;

        let (reply, answer) = oneshot::channel();
        worker
            .control
            .send(PumpControl::SetInterval(interval, reply))
            .await
            .map_err(|_| FocusError::NoActiveSource(session_id))?;
        let applied = answer
            .await
            .map_err(|_| FocusError::NoActiveSource(session_id))?;
        debug!(session_id, interval_ms = interval.as_millis() as u64, applied, "Source interval changed");
        Ok(applied)
    }

    pub fn metrics_snapshot(&self, session_id: SessionId) -> Result<MetricsSnapshot, FocusError> {
        let shared = self.core.shared();
        let entry = shared
            .sessions
            .get(&session_id)
            .ok_or(FocusError::SessionNotFound(session_id))?;
        let session = &entry.session;

        Ok(MetricsSnapshot {
            session_id,
            state: session.state,
            is_streaming: session.state.is_live(),
            baseline_concentration: session.baseline_concentration,
            latest: entry.latest.clone(),
            total_points: entry.total_points,
            focus_dips: session.focus_dips,
            trigger_outstanding: entry.outstanding.is_some(),
            calibration_phase: shared.calibration.phase(session_id),
            calibration: shared
                .calibration
                .is_calibrating(session_id)
                .then(|| shared.calibration.progress(session_id)),
            session_start: session.marker_start,
            session_stop: session.marker_stop,
        })
    }

    /// Stop every streaming session and flush the recorder
    pub async fn shutdown(&self) {
        let live: Vec<SessionId> = self
            .core
            .shared()
            .sessions
            .iter()
            .filter(|(_, entry)| entry.session.state.is_live())
            .map(|(id, _)| *id)
            .collect();
        let stale: Vec<SessionId> = self.workers.lock().await.keys().copied().collect();

        let mut ids = live;
        ids.extend(stale);
        ids.sort_unstable();
        ids.dedup();

        for session_id in ids {
            if let Err(e) = self.stop_streaming(session_id).await {
                warn!(session_id, error = %e, "Failed to stop session during shutdown");
            }
        }
        self.core.flush_recorder().await;
        info!("Orchestrator shut down");
    }
}
