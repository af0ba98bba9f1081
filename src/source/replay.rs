//! File replay source
//!
//! Two modes over a recording in the format described in [`crate::recording`]:
//!
//! - **Replay** loads every row at start and emits them with a fixed delay,
//!   optionally looping back to the first row.
//! - **Tail** follows a file that an external recorder is still appending to.
//!   Only complete, newly appended lines are considered; the byte offset moves
//!   past malformed rows too, so a bad line can never wedge the tail.

use super::{MetricSource, SourceFactory, SourceSink};
use crate::error::FocusError;
use crate::recording::{anchor_time, LineParser, RecordLine, RecordRow, Recording};
use crate::types::{SessionId, SessionMarker};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a recording is consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Emit the rows present at start, looping if `looped`
    Replay { looped: bool },
    /// Follow appended rows; `from_start` also emits rows already present
    Tail { from_start: bool },
}

/// Settings for a [`FileReplaySource`]
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub path: PathBuf,
    pub mode: ReplayMode,
    /// Delay between rows in replay mode, poll period in tail mode
    pub interval: Duration,
}

impl ReplayConfig {
    pub fn replay(path: impl Into<PathBuf>, interval: Duration, looped: bool) -> Self {
        Self {
            path: path.into(),
            mode: ReplayMode::Replay { looped },
            interval,
        }
    }

    pub fn tail(path: impl Into<PathBuf>, poll: Duration) -> Self {
        Self {
            path: path.into(),
            mode: ReplayMode::Tail { from_start: false },
            interval: poll,
        }
    }
}

/// Counters shared between the source handle and its task.
/// Only the task writes them.
#[derive(Debug, Default)]
struct ReplayProgress {
    active: AtomicBool,
    offset: AtomicU64,
    emitted: AtomicU64,
    skipped: AtomicU64,
}

/// Source that reads a recording from disk
pub struct FileReplaySource {
    session_id: SessionId,
    config: ReplayConfig,
    interval: watch::Sender<Duration>,
    progress: Arc<ReplayProgress>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl FileReplaySource {
    pub fn new(session_id: SessionId, config: ReplayConfig) -> Self {
        let (interval, _) = watch::channel(config.interval);
        Self {
            session_id,
            config,
            interval,
            progress: Arc::new(ReplayProgress::default()),
            task: None,
        }
    }

    /// Byte offset up to which the tail has consumed the file
    pub fn offset(&self) -> u64 {
        self.progress.offset.load(Ordering::SeqCst)
    }

    /// Number of events emitted so far
    pub fn emitted(&self) -> u64 {
        self.progress.emitted.load(Ordering::SeqCst)
    }

    /// Number of malformed rows skipped so far
    pub fn skipped_rows(&self) -> u64 {
        self.progress.skipped.load(Ordering::SeqCst)
    }

    async fn prepare_replay(&self) -> Result<Recording, FocusError> {
        let text = tokio::fs::read_to_string(&self.config.path)
            .await
            .map_err(|e| unavailable(&self.config.path, e))?;
        let recording = Recording::parse(&text);
        if !recording.malformed.is_empty() {
            warn!(
                session_id = self.session_id,
                skipped = recording.malformed.len(),
                "Recording contains malformed rows"
            );
        }
        Ok(recording)
    }

    /// Work out where tailing begins, which markers are already on disk and
    /// whether the header has already been written
    async fn prepare_tail(&self, from_start: bool) -> Result<TailStart, FocusError> {
        let path = &self.config.path;
        match tokio::fs::read(path).await {
            Ok(bytes) if !from_start => {
                let complete = bytes
                    .iter()
                    .rposition(|b| *b == b'\n')
                    .map(|pos| pos + 1)
                    .unwrap_or(0);
                let existing = String::from_utf8_lossy(&bytes[..complete]);
                let mut parser = LineParser::new();
                let markers = Recording::parse_with(&existing, &mut parser).markers;
                Ok(TailStart {
                    offset: complete as u64,
                    markers,
                    parser,
                })
            }
            Ok(_) => Ok(TailStart::default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let parent_exists = path
                    .parent()
                    .map(|p| p.as_os_str().is_empty() || p.exists())
                    .unwrap_or(true);
                if parent_exists {
                    debug!(path = %path.display(), "Waiting for recording to appear");
                    Ok(TailStart::default())
                } else {
                    Err(unavailable(path, e))
                }
            }
            Err(e) => Err(unavailable(path, e)),
        }
    }
}

/// Where a tail picks up an existing file
#[derive(Debug, Default)]
struct TailStart {
    offset: u64,
    markers: Vec<SessionMarker>,
    parser: LineParser,
}

fn unavailable(path: &Path, e: std::io::Error) -> FocusError {
    FocusError::SourceUnavailable(format!("{}: {}", path.display(), e))
}

#[async_trait]
impl MetricSource for FileReplaySource {
    fn name(&self) -> &str {
        match self.config.mode {
            ReplayMode::Replay { .. } => "file-replay",
            ReplayMode::Tail { .. } => "file-tail",
        }
    }

    async fn start(&mut self, sink: SourceSink) -> Result<(), FocusError> {
        if self.task.is_some() {
            warn!(session_id = self.session_id, "Replay source already started");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let task = ReplayTask {
            session_id: self.session_id,
            sink,
            cancel: cancel.clone(),
            interval: self.interval.subscribe(),
            progress: Arc::clone(&self.progress),
            sequence: 0,
        };

        let handle = match self.config.mode {
            ReplayMode::Replay { looped } => {
                let recording = self.prepare_replay().await?;
                info!(
                    session_id = self.session_id,
                    rows = recording.rows.len(),
                    looped,
                    path = %self.config.path.display(),
                    "Starting replay"
                );
                self.progress.active.store(true, Ordering::SeqCst);
                tokio::spawn(task.replay(recording, looped))
            }
            ReplayMode::Tail { from_start } => {
                let start = self.prepare_tail(from_start).await?;
                info!(
                    session_id = self.session_id,
                    offset = start.offset,
                    path = %self.config.path.display(),
                    "Starting tail"
                );
                self.progress.offset.store(start.offset, Ordering::SeqCst);
                self.progress.active.store(true, Ordering::SeqCst);
                tokio::spawn(task.tail(self.config.path.clone(), start))
            }
        };

        self.task = Some((cancel, handle));
        Ok(())
    }

    async fn stop(&mut self) {
        let Some((cancel, handle)) = self.task.take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!(session_id = self.session_id, error = %e, "Replay task panicked");
        }
        self.progress.active.store(false, Ordering::SeqCst);
        debug!(session_id = self.session_id, emitted = self.emitted(), "Replay source stopped");
    }

    fn is_active(&self) -> bool {
        self.progress.active.load(Ordering::SeqCst)
    }

    fn set_interval(&mut self, interval: Duration) -> bool {
        self.interval.send_replace(interval);
        true
    }
}

/// State owned by the background task
struct ReplayTask {
    session_id: SessionId,
    sink: SourceSink,
    cancel: CancellationToken,
    interval: watch::Receiver<Duration>,
    progress: Arc<ReplayProgress>,
    sequence: u64,
}

impl ReplayTask {
    async fn replay(mut self, recording: Recording, looped: bool) {
        let anchor = anchor_time(recording.start_time(), Utc::now());

        'outer: {
            for marker in &recording.markers {
                if !self.send_marker(*marker).await {
                    break 'outer;
                }
            }

            loop {
                for row in &recording.rows {
                    if !self.send_row(row.clone(), anchor).await || !self.pause().await {
                        break 'outer;
                    }
                }
                if !looped || recording.rows.is_empty() {
                    debug!(session_id = self.session_id, "Replay exhausted");
                    self.sink.exhausted().await;
                    break 'outer;
                }
                debug!(session_id = self.session_id, "Replay looping to first row");
            }
        }

        self.progress.active.store(false, Ordering::SeqCst);
    }

    async fn tail(mut self, path: PathBuf, start: TailStart) {
        let TailStart {
            mut offset,
            markers,
            mut parser,
        } = start;
        let mut start_time = None;
        for marker in markers {
            if let SessionMarker::Started(time) = marker {
                start_time = Some(time);
            }
            if !self.send_marker(marker).await {
                self.progress.active.store(false, Ordering::SeqCst);
                return;
            }
        }
        let mut anchor = anchor_time(start_time, Utc::now());

        'outer: loop {
            match read_appended(&path, offset).await {
                Ok(Some(chunk)) => {
                    if chunk.truncated {
                        warn!(session_id = self.session_id, "Recording truncated, restarting from the top");
                        parser.reset();
                    }
                    offset = chunk.next_offset;
                    self.progress.offset.store(offset, Ordering::SeqCst);

                    for line in chunk.text.lines() {
                        match parser.parse_line(line) {
                            Ok(RecordLine::Data(row)) => {
                                if !self.send_row(row, anchor).await {
                                    break 'outer;
                                }
                            }
                            Ok(RecordLine::Marker(Some(marker))) => {
                                if let SessionMarker::Started(time) = marker {
                                    anchor = anchor_time(Some(time), Utc::now());
                                }
                                if !self.send_marker(marker).await {
                                    break 'outer;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                self.progress.skipped.fetch_add(1, Ordering::SeqCst);
                                warn!(session_id = self.session_id, error = %e, "Skipping malformed row");
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(session_id = self.session_id, error = %e, "Tail read failed"),
            }

            if !self.pause().await {
                break;
            }
        }

        self.progress.active.store(false, Ordering::SeqCst);
    }

    /// Emit one row. Returns `false` when the task should stop.
    async fn send_row(&mut self, row: RecordRow, anchor: DateTime<Utc>) -> bool {
        let event = match row.into_event(self.session_id, self.sequence + 1, anchor) {
            Ok(event) => event,
            Err(e) => {
                self.progress.skipped.fetch_add(1, Ordering::SeqCst);
                warn!(session_id = self.session_id, error = %e, "Skipping row");
                return true;
            }
        };
        self.sequence += 1;

        let delivered = tokio::select! {
            _ = self.cancel.cancelled() => false,
            ok = self.sink.event(event) => ok,
        };
        if delivered {
            self.progress.emitted.fetch_add(1, Ordering::SeqCst);
        }
        delivered
    }

    async fn send_marker(&self, marker: SessionMarker) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            ok = self.sink.marker(marker) => ok,
        }
    }

    /// Wait one interval. Returns `false` if cancelled meanwhile.
    async fn pause(&self) -> bool {
        let interval = *self.interval.borrow();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(interval) => true,
        }
    }
}

/// Newly appended, newline-terminated content
struct TailChunk {
    text: String,
    next_offset: u64,
    truncated: bool,
}

async fn read_appended(path: &Path, offset: u64) -> std::io::Result<Option<TailChunk>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let len = file.metadata().await?.len();
    let truncated = len < offset;
    let start = if truncated { 0 } else { offset };
    if len == start {
        return Ok(truncated.then(|| TailChunk {
            text: String::new(),
            next_offset: 0,
            truncated,
        }));
    }

    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.take(len - start).read_to_end(&mut buf).await?;

    let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
        // only a partial line so far
        return Ok(Some(TailChunk {
            text: String::new(),
            next_offset: start,
            truncated,
        }));
    };

    Ok(Some(TailChunk {
        text: String::from_utf8_lossy(&buf[..=last_newline]).into_owned(),
        next_offset: start + last_newline as u64 + 1,
        truncated,
    }))
}

/// Creates a [`FileReplaySource`] per session from a shared configuration
#[derive(Debug, Clone)]
pub struct ReplaySourceFactory {
    config: ReplayConfig,
}

impl ReplaySourceFactory {
    pub fn new(config: ReplayConfig) -> Self {
        Self { config }
    }
}

impl SourceFactory for ReplaySourceFactory {
    fn create(&self, session_id: SessionId, interval: Option<Duration>) -> Box<dyn super::MetricSource> {
        let mut config = self.config.clone();
        if let Some(interval) = interval {
            config.interval = interval;
        }
        Box::new(FileReplaySource::new(session_id, config))
    }
}
