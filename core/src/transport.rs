/// Transport boundary: the abstract channel the sync engine talks through
///
/// The real network/P2P transport lives outside this crate. `MemoryTransport`
/// is the in-process stand-in used by tests and the CLI: scripted send
/// outcomes, injectable incoming messages and an online/offline switch.
use crate::error::{ChatError, Result};
use crate::messenger_types::Message;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Online,
    Offline,
}

/// Positive transport acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ack {
    /// Accepted by the transport
    Sent,
    /// Confirmed received by the remote side
    Delivered,
}

pub type IncomingHandler = Arc<dyn Fn(Message) + Send + Sync>;

pub trait Transport: Send + Sync {
    /// Hand a message to the network. Failure is `ChatError::TransportFailure`.
    fn send(&self, message: Message) -> BoxFuture<'static, Result<Ack>>;

    /// Register a callback invoked with every remote message
    fn on_incoming(&self, handler: IncomingHandler);

    fn connection_state(&self) -> ConnectionState;

    /// Change notifications for `connection_state`
    fn watch_connection(&self) -> watch::Receiver<ConnectionState>;
}

// ─── in-memory transport ─────────────────────────────────────────────────────

pub struct MemoryTransport {
    outcomes: Mutex<VecDeque<Result<Ack>>>,
    default_ack: Ack,
    sent: Mutex<Vec<Message>>,
    handlers: Mutex<Vec<IncomingHandler>>,
    state: watch::Sender<ConnectionState>,
}

impl MemoryTransport {
    /// Online transport that acks every send as `Sent` unless scripted otherwise
    pub fn new() -> Self {
        Self::with_default_ack(Ack::Sent)
    }

    /// Online transport that reports every send as delivered
    pub fn loopback() -> Self {
        Self::with_default_ack(Ack::Delivered)
    }

    fn with_default_ack(default_ack: Ack) -> Self {
        let (state, _) = watch::channel(ConnectionState::Online);
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            default_ack,
            sent: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            state,
        }
    }

    /// Queue the outcome of the next `send`
    pub fn push_outcome(&self, outcome: Result<Ack>) {
        if let Ok(mut q) = self.outcomes.lock() {
            q.push_back(outcome);
        }
    }

    /// Make the next `n` sends fail
    pub fn fail_next(&self, n: usize, reason: &str) {
        for _ in 0..n {
            self.push_outcome(Err(ChatError::TransportFailure(reason.to_string())));
        }
    }

    /// Every message handed to `send`, in order
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn attempts_for(&self, message_id: &str) -> usize {
        self.sent().iter().filter(|m| m.id == message_id).count()
    }

    pub fn set_connection(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Simulate a message arriving from the remote side
    pub fn deliver(&self, message: Message) {
        let handlers: Vec<IncomingHandler> = self
            .handlers
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default();
        debug!("Delivering {} to {} handler(s)", message.id, handlers.len());
        for handler in handlers {
            handler(message.clone());
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, message: Message) -> BoxFuture<'static, Result<Ack>> {
        let outcome = if *self.state.borrow() == ConnectionState::Offline {
            Err(ChatError::TransportFailure("offline".to_string()))
        } else {
            self.outcomes
                .lock()
                .ok()
                .and_then(|mut q| q.pop_front())
                .unwrap_or(Ok(self.default_ack))
        };
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message);
        }
        Box::pin(async move { outcome })
    }

    fn on_incoming(&self, handler: IncomingHandler) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.push(handler);
        }
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger_types::Payload;
    use chrono::Utc;

    #[tokio::test]
    async fn test_scripted_outcomes_then_default() {
        let t = MemoryTransport::new();
        t.fail_next(1, "timeout");
        let m = Message::new_local("c", "me", Payload::text("x"), Utc::now());

        assert!(t.send(m.clone()).await.is_err());
        assert_eq!(t.send(m.clone()).await.unwrap(), Ack::Sent);
        assert_eq!(t.attempts_for(&m.id), 2);
    }

    #[tokio::test]
    async fn test_offline_sends_fail() {
        let t = MemoryTransport::loopback();
        t.set_connection(ConnectionState::Offline);
        let m = Message::new_local("c", "me", Payload::text("x"), Utc::now());
        assert!(matches!(
            t.send(m).await,
            Err(ChatError::TransportFailure(_))
        ));
        assert_eq!(t.connection_state(), ConnectionState::Offline);
    }

    #[test]
    fn test_deliver_invokes_handlers() {
        let t = MemoryTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        t.on_incoming(Arc::new(move |m: Message| sink.lock().unwrap().push(m.id)));

        let m = Message::new_local("c", "them", Payload::text("x"), Utc::now());
        t.deliver(m.clone());
        assert_eq!(*seen.lock().unwrap(), vec![m.id]);
    }
}
