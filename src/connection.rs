//! Subscriber connection loop
//!
//! A [`ConnectionHandler`] serves one subscriber of one session. It is
//! transport-agnostic: inbound commands arrive as text frames through any
//! [`Stream`], and every outbound message (broadcasts and direct replies
//! alike) is read from the [`Subscription`] returned by [`ConnectionHandler::open`].
//!
//! Closing the inbound stream disconnects the subscriber. The session's source
//! keeps running; only `stop_stream` stops it.

use crate::error::FocusError;
use crate::message::{InboundCommand, OutboundMessage, COMMAND_TYPES};
use crate::orchestrator::SessionOrchestrator;
use crate::registry::{SubscriberHandle, Subscription};
use crate::source::SourceFactory;
use crate::types::SessionId;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Parse a text frame into a command.
///
/// Invalid JSON and unknown command types are reported as `InvalidCommand`.
pub fn parse_command(text: &str) -> Result<InboundCommand, FocusError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|_| FocusError::InvalidCommand("Invalid JSON format".to_string()))?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| FocusError::InvalidCommand("Missing command type".to_string()))?;
    if !COMMAND_TYPES.contains(&kind) {
        return Err(FocusError::InvalidCommand(format!("Unknown command type: {}", kind)));
    }

    serde_json::from_value(value).map_err(|e| FocusError::InvalidCommand(e.to_string()))
}

/// Convert a speed (seconds between rows) into a source interval
fn speed_to_interval(speed: f64) -> Result<Duration, FocusError> {
    if !(speed.is_finite() && speed > 0.0) {
        return Err(FocusError::InvalidCommand(format!(
            "speed must be a positive number of seconds, got {}",
            speed
        )));
    }
    Ok(Duration::from_secs_f64(speed))
}

/// Serves the commands of a single subscriber
pub struct ConnectionHandler {
    orchestrator: Arc<SessionOrchestrator>,
    factory: Arc<dyn SourceFactory>,
    handle: SubscriberHandle,
}

impl ConnectionHandler {
    /// Subscribe to `session_id`, creating the session if needed.
    ///
    /// The subscriber's first message is `connection_established`.
    pub async fn open(
        orchestrator: Arc<SessionOrchestrator>,
        factory: Arc<dyn SourceFactory>,
        session_id: SessionId,
    ) -> Result<(Self, Subscription), FocusError> {
        orchestrator.create_session(session_id);
        let subscription = orchestrator.registry().connect(session_id).await;
        let handle = subscription.handle();
        orchestrator
            .registry()
            .send_to(&handle, OutboundMessage::ConnectionEstablished { session_id })
            .await?;

        Ok((
            Self {
                orchestrator,
                factory,
                handle,
            },
            subscription,
        ))
    }

    pub fn handle(&self) -> SubscriberHandle {
        self.handle
    }

    pub fn session_id(&self) -> SessionId {
        self.handle.session_id
    }

    /// Answer one text frame
    pub async fn handle_text(&self, text: &str) -> OutboundMessage {
        match parse_command(text) {
            Ok(command) => self.handle_command(command).await,
            Err(FocusError::InvalidCommand(message)) => {
                debug!(session_id = self.session_id(), %message, "Rejected command");
                OutboundMessage::error(message)
            }
            Err(e) => OutboundMessage::error(e.to_string()),
        }
    }

    /// Execute a command and build the reply for this subscriber
    pub async fn handle_command(&self, command: InboundCommand) -> OutboundMessage {
        let session_id = self.session_id();
        let result = match command {
            InboundCommand::StartStream { speed } => self.start_stream(speed).await,
            InboundCommand::StopStream => self
                .orchestrator
                .stop_streaming(session_id)
                .await
                .map(|()| OutboundMessage::StreamStopped { session_id }),
            InboundCommand::SetSpeed { speed } => self.set_speed(speed).await,
            InboundCommand::GetMetrics => self
                .orchestrator
                .metrics_snapshot(session_id)
                .map(|data| OutboundMessage::CurrentMetrics { data }),
            InboundCommand::Ping => Ok(OutboundMessage::Pong),
        };

        result.unwrap_or_else(|e| {
            warn!(session_id, error = %e, "Command failed");
            OutboundMessage::error(e.to_string())
        })
    }

    async fn start_stream(&self, speed: Option<f64>) -> Result<OutboundMessage, FocusError> {
        let session_id = self.session_id();
        let interval = speed.map(speed_to_interval).transpose()?;
        let source = self.factory.create(session_id, interval);
        self.orchestrator.start_streaming(session_id, source).await?;

        let speed = interval
            .unwrap_or_else(|| self.orchestrator.config().replay_interval())
            .as_secs_f64();
        Ok(OutboundMessage::StreamStarted { session_id, speed })
    }

    async fn set_speed(&self, speed: f64) -> Result<OutboundMessage, FocusError> {
        let interval = speed_to_interval(speed)?;
        let applied = self
            .orchestrator
            .set_speed(self.session_id(), interval)
            .await?;
        Ok(OutboundMessage::SpeedChanged { speed, applied })
    }

    /// Answer every inbound frame until the stream ends, then disconnect
    pub async fn serve<S>(self, mut inbound: S)
    where
        S: Stream<Item = String> + Unpin,
    {
        let registry = self.orchestrator.registry().clone();
        info!(session_id = self.session_id(), subscriber = %self.handle.id, "Serving subscriber");

        while let Some(text) = inbound.next().await {
            let reply = self.handle_text(&text).await;
            if let Err(e) = registry.send_to(&self.handle, reply).await {
                warn!(session_id = self.session_id(), error = %e, "Subscriber gone");
                break;
            }
        }

        registry.disconnect(&self.handle).await;
        info!(session_id = self.session_id(), subscriber = %self.handle.id, "Subscriber closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FocusConfig;
    use crate::recording::format_row;
    use crate::registry::Delivery;
    use crate::source::{ReplayConfig, ReplaySourceFactory};
    use crate::types::SessionState;
    use futures::channel::mpsc as fmpsc;
    use std::path::Path;

    fn write_recording(path: &Path, values: &[f64]) {
        let mut lines = vec!["Session start time,10:00:00".to_string()];
        for (i, value) in values.iter().enumerate() {
            lines.push(format_row(0, i as u32 + 1, *value, 70.0));
        }
        let mut text = lines.join("\n");
        text.push('\n');
        std::fs::write(path, text).unwrap();
    }

    async fn next(sub: &mut Subscription) -> Delivery {
        tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for message")
            .expect("subscription closed")
    }

    fn setup(path: &Path) -> (Arc<SessionOrchestrator>, Arc<dyn SourceFactory>) {
        let orchestrator = Arc::new(SessionOrchestrator::new(FocusConfig::default()));
        let factory: Arc<dyn SourceFactory> = Arc::new(ReplaySourceFactory::new(ReplayConfig::replay(
            path,
            Duration::from_millis(10),
            false,
        )));
        (orchestrator, factory)
    }

    #[test]
    fn test_parse_command_errors() {
        match parse_command("{not json") {
            Err(FocusError::InvalidCommand(message)) => assert_eq!(message, "Invalid JSON format"),
            other => panic!("unexpected {:?}", other),
        }
        match parse_command(r#"{"type":"dance"}"#) {
            Err(FocusError::InvalidCommand(message)) => assert!(message.contains("dance")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(parse_command(r#"{"speed":1}"#), Err(FocusError::InvalidCommand(_))));
        assert!(matches!(
            parse_command(r#"{"type":"set_speed","speed":"fast"}"#),
            Err(FocusError::InvalidCommand(_))
        ));
        assert_eq!(parse_command(r#"{"type":"ping"}"#).unwrap(), InboundCommand::Ping);
    }

    #[tokio::test]
    async fn test_open_sends_connection_established() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let (orchestrator, factory) = setup(&path);

        let (handler, mut sub) = ConnectionHandler::open(orchestrator.clone(), factory, 3).await.unwrap();
        match next(&mut sub).await.as_ref() {
            OutboundMessage::ConnectionEstablished { session_id } => assert_eq!(*session_id, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(handler.handle_text(r#"{"type":"ping"}"#).await, OutboundMessage::Pong);
        assert_eq!(orchestrator.session(3).unwrap().state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_speed_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        write_recording(&path, &[70.0]);
        let (orchestrator, factory) = setup(&path);
        let (handler, _sub) = ConnectionHandler::open(orchestrator.clone(), factory, 4).await.unwrap();

        let reply = handler
            .handle_command(InboundCommand::StartStream { speed: Some(-1.0) })
            .await;
        assert_eq!(reply.kind(), "error");
        assert_eq!(orchestrator.session(4).unwrap().state, SessionState::Idle);

        let reply = handler.handle_command(InboundCommand::SetSpeed { speed: 0.5 }).await;
        assert_eq!(reply.kind(), "error");
    }

    #[tokio::test]
    async fn test_stream_through_serve() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        write_recording(&path, &[70.0, 65.0, 60.0]);
        let (orchestrator, factory) = setup(&path);

        let (handler, mut sub) = ConnectionHandler::open(orchestrator.clone(), factory, 1).await.unwrap();
        let (tx, rx) = fmpsc::unbounded::<String>();
        let serving = tokio::spawn(handler.serve(rx));
        assert_eq!(next(&mut sub).await.kind(), "connection_established");

        tx.unbounded_send(r#"{"type":"start_stream","speed":0.01}"#.to_string()).unwrap();
        let mut started = false;
        let mut values = Vec::new();
        loop {
            let message = next(&mut sub).await;
            match message.as_ref() {
                OutboundMessage::StreamStarted { speed, .. } => {
                    assert_eq!(*speed, 0.01);
                    started = true;
                }
                OutboundMessage::ConcentrationUpdate { data } => values.push(data.concentration),
                OutboundMessage::StreamStopped { .. } => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        if !started {
            assert_eq!(next(&mut sub).await.kind(), "stream_started");
        }
        assert_eq!(values, vec![70.0, 65.0, 60.0]);

        tx.unbounded_send("{oops".to_string()).unwrap();
        match next(&mut sub).await.as_ref() {
            OutboundMessage::Error { message } => assert_eq!(message, "Invalid JSON format"),
            other => panic!("unexpected {:?}", other),
        }

        tx.unbounded_send(r#"{"type":"get_metrics"}"#.to_string()).unwrap();
        match next(&mut sub).await.as_ref() {
            OutboundMessage::CurrentMetrics { data } => {
                assert_eq!(data.total_points, 3);
                assert!(!data.is_streaming);
                assert!(data.session_start.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }

        drop(tx);
        serving.await.unwrap();
        assert_eq!(orchestrator.registry().subscriber_count(1).await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_source_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        write_recording(&path, &[70.0, 65.0, 60.0]);
        let (orchestrator, factory) = setup(&path);

        let (handler, _sub) = ConnectionHandler::open(orchestrator.clone(), factory, 2).await.unwrap();
        let reply = handler
            .handle_command(InboundCommand::StartStream { speed: Some(30.0) })
            .await;
        assert_eq!(reply.kind(), "stream_started");

        handler.serve(futures::stream::empty()).await;
        assert_eq!(orchestrator.registry().subscriber_count(2).await, 0);
        assert_eq!(orchestrator.session(2).unwrap().state, SessionState::Streaming);

        let reply = orchestrator.set_speed(2, Duration::from_millis(5)).await.unwrap();
        assert!(reply);
        orchestrator.stop_streaming(2).await.unwrap();
        assert_eq!(orchestrator.session(2).unwrap().state, SessionState::Ended);
    }
}
