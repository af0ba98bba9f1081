//! Session registry and broadcaster
//!
//! Holds one delivery structure per session that has at least one
//! subscriber. Every subscriber owns a bounded queue; [`SessionRegistry::publish`]
//! pushes a message into all queues of a session.
//!
//! Delivery is at-most-once and best-effort: publishing to a session without
//! subscribers drops the message. A subscriber whose queue is closed, or stays
//! full for longer than the delivery timeout, is removed without affecting the
//! other subscribers of the session.
//!
//! Publish, connect and disconnect for one session are serialized by a
//! per-session async lock, so messages reach every subscriber in publish order.

use crate::error::FocusError;
use crate::message::OutboundMessage;
use crate::types::SessionId;
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A message as delivered to subscribers
pub type Delivery = Arc<OutboundMessage>;

/// Identifies one subscriber of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberHandle {
    pub session_id: SessionId,
    pub id: Uuid,
}

/// Receiving side of a subscriber
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriberHandle,
    receiver: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub fn handle(&self) -> SubscriberHandle {
        self.handle
    }

    /// Next message, or `None` once the registry dropped this subscriber
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug, Default)]
struct SessionChannel {
    subscribers: Vec<(Uuid, mpsc::Sender<Delivery>)>,
    /// Set once the channel has been unlinked from the registry
    closed: bool,
}

type ChannelRef = Arc<tokio::sync::Mutex<SessionChannel>>;

struct RegistryInner {
    sessions: Mutex<HashMap<SessionId, ChannelRef>>,
    subscriber_buffer: usize,
    delivery_timeout: Duration,
}

/// Per-session fan-out of outbound messages
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(subscriber_buffer: usize, delivery_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                subscriber_buffer: subscriber_buffer.max(1),
                delivery_timeout,
            }),
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, ChannelRef>> {
        // the map holds no invariants a panicking holder could break
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn channel(&self, session_id: SessionId) -> Option<ChannelRef> {
        self.sessions().get(&session_id).cloned()
    }

    /// Register a new subscriber, creating the session channel if needed
    pub async fn connect(&self, session_id: SessionId) -> Subscription {
        let (tx, receiver) = mpsc::channel(self.inner.subscriber_buffer);
        let id = Uuid::new_v4();

        loop {
            let channel = Arc::clone(self.sessions().entry(session_id).or_default());
            let mut guard = channel.lock().await;
            if guard.closed {
                // raced with the last disconnect; pick up the fresh channel
                continue;
            }
            guard.subscribers.push((id, tx));
            info!(
                session_id,
                subscriber = %id,
                subscribers = guard.subscribers.len(),
                "Subscriber connected"
            );
            break;
        }

        Subscription {
            handle: SubscriberHandle { session_id, id },
            receiver,
        }
    }

    /// Remove a subscriber. Returns whether it was registered.
    ///
    /// Never touches the session's source.
    pub async fn disconnect(&self, handle: &SubscriberHandle) -> bool {
        let Some(channel) = self.channel(handle.session_id) else {
            return false;
        };
        let mut guard = channel.lock().await;
        let before = guard.subscribers.len();
        guard.subscribers.retain(|(id, _)| *id != handle.id);
        let removed = guard.subscribers.len() < before;
        if removed {
            info!(session_id = handle.session_id, subscriber = %handle.id, "Subscriber disconnected");
        }
        self.release_if_empty(handle.session_id, &channel, &mut guard);
        removed
    }

    /// Deliver `message` to every subscriber of `session_id`.
    ///
    /// Returns the number of subscribers that accepted the message.
    pub async fn publish(&self, session_id: SessionId, message: OutboundMessage) -> usize {
        let Some(channel) = self.channel(session_id) else {
            return 0;
        };
        let message: Delivery = Arc::new(message);
        let mut guard = channel.lock().await;
        if guard.subscribers.is_empty() {
            return 0;
        }

        let timeout = self.inner.delivery_timeout;
        let results = join_all(guard.subscribers.iter().map(|(id, tx)| {
            let message = Arc::clone(&message);
            async move { (*id, tx.send_timeout(message, timeout).await.is_ok()) }
        }))
        .await;

        let failed: Vec<Uuid> = results
            .iter()
            .filter(|(_, ok)| !ok)
            .map(|(id, _)| *id)
            .collect();
        for id in &failed {
            let error = FocusError::SubscriberDeliveryFailed(id.to_string());
            warn!(session_id, kind = message.kind(), error = %error, "Removing subscriber");
        }
        if !failed.is_empty() {
            guard.subscribers.retain(|(id, _)| !failed.contains(id));
            self.release_if_empty(session_id, &channel, &mut guard);
        }

        results.len() - failed.len()
    }

    /// Deliver `message` to a single subscriber
    pub async fn send_to(
        &self,
        handle: &SubscriberHandle,
        message: OutboundMessage,
    ) -> Result<(), FocusError> {
        let not_found = || FocusError::SubscriberDeliveryFailed(handle.id.to_string());
        let channel = self.channel(handle.session_id).ok_or_else(not_found)?;
        let mut guard = channel.lock().await;
        let tx = guard
            .subscribers
            .iter()
            .find(|(id, _)| *id == handle.id)
            .map(|(_, tx)| tx.clone())
            .ok_or_else(not_found)?;

        if tx
            .send_timeout(Arc::new(message), self.inner.delivery_timeout)
            .await
            .is_err()
        {
            warn!(session_id = handle.session_id, subscriber = %handle.id, "Direct delivery failed");
            guard.subscribers.retain(|(id, _)| *id != handle.id);
            self.release_if_empty(handle.session_id, &channel, &mut guard);
            return Err(not_found());
        }
        Ok(())
    }

    /// Sessions that currently have at least one subscriber
    pub fn list_active_sessions(&self) -> BTreeSet<SessionId> {
        self.sessions().keys().copied().collect()
    }

    pub async fn subscriber_count(&self, session_id: SessionId) -> usize {
        match self.channel(session_id) {
            Some(channel) => channel.lock().await.subscribers.len(),
            None => 0,
        }
    }

    /// Unlink an empty session channel from the registry
    fn release_if_empty(&self, session_id: SessionId, channel: &ChannelRef, guard: &mut SessionChannel) {
        if !guard.subscribers.is_empty() || guard.closed {
            return;
        }
        let mut sessions = self.sessions();
        if sessions
            .get(&session_id)
            .is_some_and(|current| Arc::ptr_eq(current, channel))
        {
            sessions.remove(&session_id);
        }
        guard.closed = true;
        debug!(session_id, "Released session channel");
    }
}
