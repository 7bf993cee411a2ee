/// Sync engine: reconciles the local log with the transport
///
/// Outgoing messages follow `Pending -> Sent -> Delivered`, or
/// `Pending -> Failed -> (retry) -> Pending`. Failed sends are retried with
/// exponential backoff until acknowledged or cancelled; nothing is ever
/// removed from the log. Incoming messages merge idempotently by id and are
/// ordered by sequence only.
use crate::clock::Clock;
use crate::conversation_index::ConversationIndex;
use crate::error::{ChatError, Result};
use crate::message_log::{AppendStatus, MessageLog};
use crate::messenger_types::{ConversationSummary, DeliveryState, Message};
use crate::presence::Presence;
use crate::transport::{Ack, ConnectionState, Transport};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Retry and visibility tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub retry_base: Duration,
    pub retry_cap: Duration,
    /// Failed attempts after which the UI shows "failed, tap to retry"
    pub visible_failure_threshold: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(30),
            visible_failure_threshold: 3,
        }
    }
}

impl SyncConfig {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.retry_base
            .checked_mul(factor)
            .unwrap_or(self.retry_cap)
            .min(self.retry_cap)
    }
}

/// Events streamed to the UI layer and telemetry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A message was written to the log (local send or remote arrival)
    MessageStored { message: Message },
    DeliveryStateChanged {
        message_id: String,
        conversation_id: String,
        state: DeliveryState,
    },
    DeliveryFailed {
        message_id: String,
        conversation_id: String,
        attempts: u32,
        reason: String,
        /// Past the visible-failure threshold; retries continue regardless
        visible: bool,
    },
    /// Same id arrived with different content; the first copy was kept
    ConflictDetected { message_id: String, reason: String },
    ConnectionChanged { state: ConnectionState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for a send slot (e.g. offline)
    Queued,
    InFlight,
    AwaitingRetry,
}

struct OutgoingEntry {
    conversation_id: String,
    attempts: u32,
    phase: Phase,
    /// Bumped whenever a retry is scheduled; stale timers compare and bail
    generation: u64,
    retry: Option<AbortHandle>,
}

impl OutgoingEntry {
    fn new(conversation_id: String) -> Self {
        Self {
            conversation_id,
            attempts: 0,
            phase: Phase::Queued,
            generation: 0,
            retry: None,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(handle) = self.retry.take() {
            handle.abort();
        }
    }
}

struct Inner {
    log: MessageLog,
    index: ConversationIndex,
    transport: Arc<dyn Transport>,
    presence: Arc<dyn Presence>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    open_conversation: RwLock<Option<String>>,
    outgoing: Mutex<HashMap<String, OutgoingEntry>>,
    /// Cancelled while an attempt was in flight; consumed by that attempt's outcome
    cancelled: Mutex<HashSet<String>>,
    generation: AtomicU64,
    events: broadcast::Sender<SyncEvent>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

/// Handle to the sync engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        log: MessageLog,
        index: ConversationIndex,
        transport: Arc<dyn Transport>,
        presence: Arc<dyn Presence>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        transport.on_incoming(Arc::new(move |message: Message| {
            if incoming_tx.send(message).is_err() {
                debug!("Sync engine gone, dropping incoming handler call");
            }
        }));
        let (events, _) = broadcast::channel(256);

        Self {
            inner: Arc::new(Inner {
                log,
                index,
                transport,
                presence,
                clock,
                config,
                open_conversation: RwLock::new(None),
                outgoing: Mutex::new(HashMap::new()),
                cancelled: Mutex::new(HashSet::new()),
                generation: AtomicU64::new(0),
                events,
                incoming_rx: Mutex::new(Some(incoming_rx)),
            }),
        }
    }

    pub fn log(&self) -> &MessageLog {
        &self.inner.log
    }

    pub fn index(&self) -> &ConversationIndex {
        &self.inner.index
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn local_user_id(&self) -> &str {
        self.inner.index.local_user_id()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    // ─── outgoing ────────────────────────────────────────────────────────────

    /// Append a local message as pending and make the first delivery attempt.
    ///
    /// Returns the stored message as it stands after that attempt.
    pub async fn enqueue_outgoing(&self, mut message: Message) -> Result<Message> {
        message.delivery_state = DeliveryState::Pending;
        let conversation_id = message.conversation_id.clone();

        let outcome = self.inner.log.append_local(&conversation_id, message).await?;
        let stored = outcome.message;
        self.inner.index.touch(&conversation_id, &stored).await?;

        if outcome.status == AppendStatus::Duplicate {
            debug!("Outgoing {} already in log", stored.id);
            if stored.delivery_state.is_settled() {
                return Ok(stored);
            }
        } else {
            self.emit(SyncEvent::MessageStored {
                message: stored.clone(),
            });
        }

        self.inner
            .outgoing
            .lock()
            .await
            .entry(stored.id.clone())
            .or_insert_with(|| OutgoingEntry::new(conversation_id.clone()));

        self.dispatch(&stored.id).await?;
        Ok(self.inner.log.find(&stored.id)?.unwrap_or(stored))
    }

    /// One delivery attempt. Parks the message while offline.
    async fn dispatch(&self, message_id: &str) -> Result<()> {
        {
            let mut outgoing = self.inner.outgoing.lock().await;
            let Some(entry) = outgoing.get_mut(message_id) else {
                return Ok(());
            };
            if entry.phase == Phase::InFlight {
                return Ok(());
            }
            if self.inner.transport.connection_state() == ConnectionState::Offline {
                debug!("Offline, parking {}", message_id);
                entry.cancel_timer();
                entry.phase = Phase::Queued;
                return Ok(());
            }
            entry.cancel_timer();
            entry.phase = Phase::InFlight;
        }

        let result = self.attempt(message_id).await;
        if result.is_err() {
            // Storage trouble mid-attempt: leave it for the next flush
            self.requeue(message_id).await;
        }
        result
    }

    async fn attempt(&self, message_id: &str) -> Result<()> {
        let message = match self.inner.log.find(message_id)? {
            Some(m) if !m.delivery_state.is_settled() => m,
            _ => {
                self.inner.outgoing.lock().await.remove(message_id);
                return Ok(());
            }
        };

        if message.delivery_state == DeliveryState::Failed {
            self.set_state(message_id, DeliveryState::Pending).await?;
        }

        debug!("Sending {} in {}", message_id, message.conversation_id);
        match self.inner.transport.send(message).await {
            Ok(ack) => self.on_transport_ack(message_id, ack).await,
            Err(e) => self.on_transport_failure(message_id, &e.to_string()).await,
        }
    }

    async fn requeue(&self, message_id: &str) {
        if let Some(entry) = self.inner.outgoing.lock().await.get_mut(message_id) {
            if entry.phase == Phase::InFlight {
                entry.phase = Phase::Queued;
            }
        }
    }

    /// Transport acknowledged a message. Calling this twice is a no-op.
    pub async fn on_transport_ack(&self, message_id: &str, ack: Ack) -> Result<()> {
        let state = match ack {
            Ack::Sent => DeliveryState::Sent,
            Ack::Delivered => DeliveryState::Delivered,
        };
        self.set_state(message_id, state).await?;

        if let Some(mut entry) = self.inner.outgoing.lock().await.remove(message_id) {
            entry.cancel_timer();
            debug!("{} acknowledged after {} failed attempt(s)", message_id, entry.attempts);
        }
        self.inner.cancelled.lock().await.remove(message_id);
        Ok(())
    }

    /// Transport gave up on a message: mark it failed and schedule a retry
    pub async fn on_transport_failure(&self, message_id: &str, reason: &str) -> Result<()> {
        let message = self
            .inner
            .log
            .find(message_id)?
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        if message.delivery_state.is_settled() {
            debug!("Late failure for settled {}, ignoring", message_id);
            self.inner.cancelled.lock().await.remove(message_id);
            return Ok(());
        }
        self.set_state(message_id, DeliveryState::Failed).await?;

        let cancelled = self.inner.cancelled.lock().await.remove(message_id);
        let mut outgoing = self.inner.outgoing.lock().await;
        let entry = outgoing
            .entry(message_id.to_string())
            .or_insert_with(|| OutgoingEntry::new(message.conversation_id.clone()));
        entry.attempts += 1;
        let attempts = entry.attempts;
        let visible = attempts >= self.inner.config.visible_failure_threshold;
        entry.cancel_timer();

        if cancelled {
            outgoing.remove(message_id);
            info!("{} failed and retries are cancelled", message_id);
        } else {
            let delay = self.inner.config.backoff(attempts);
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            entry.generation = generation;
            entry.phase = Phase::AwaitingRetry;
            entry.retry = Some(self.schedule_retry(message_id.to_string(), generation, delay));
            warn!(
                "Send of {} failed (attempt {}): {}; retrying in {:?}",
                message_id, attempts, reason, delay
            );
        }
        drop(outgoing);

        self.emit(SyncEvent::DeliveryFailed {
            message_id: message_id.to_string(),
            conversation_id: message.conversation_id,
            attempts,
            reason: reason.to_string(),
            visible,
        });
        Ok(())
    }

    fn schedule_retry(&self, message_id: String, generation: u64, delay: Duration) -> AbortHandle {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let engine = SyncEngine { inner };
            if let Err(e) = engine.fire_retry(&message_id, generation).await {
                error!("Retry of {} failed: {}", message_id, e);
            }
        });
        task.abort_handle()
    }

    async fn fire_retry(&self, message_id: &str, generation: u64) -> Result<()> {
        {
            let mut outgoing = self.inner.outgoing.lock().await;
            let Some(entry) = outgoing.get_mut(message_id) else {
                return Ok(());
            };
            if entry.generation != generation || entry.phase != Phase::AwaitingRetry {
                debug!("Stale retry timer for {}", message_id);
                return Ok(());
            }
            // This task is the timer; dropping the handle keeps dispatch from aborting it
            entry.retry = None;
            entry.phase = Phase::Queued;
        }
        debug!("Retrying {}", message_id);
        self.dispatch(message_id).await
    }

    /// Stop retrying a message. It stays in the log as failed.
    pub async fn cancel_retry(&self, message_id: &str) -> Result<bool> {
        let removed = self.inner.outgoing.lock().await.remove(message_id);
        let Some(mut entry) = removed else {
            return Ok(false);
        };
        entry.cancel_timer();
        if entry.phase == Phase::InFlight {
            // The running attempt must not schedule another retry when it fails
            self.inner
                .cancelled
                .lock()
                .await
                .insert(message_id.to_string());
        }
        self.set_state(message_id, DeliveryState::Failed).await?;
        info!("Cancelled retries for {}", message_id);
        Ok(true)
    }

    /// Stop retrying every outgoing message of a conversation
    pub async fn cancel_conversation(&self, conversation_id: &str) -> Result<usize> {
        let ids: Vec<String> = self
            .inner
            .outgoing
            .lock()
            .await
            .iter()
            .filter(|(_, e)| e.conversation_id == conversation_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.cancel_retry(id).await?;
        }
        Ok(ids.len())
    }

    /// User-initiated retry ("tap to retry")
    pub async fn retry_message(&self, message_id: &str) -> Result<()> {
        let message = self
            .inner
            .log
            .find(message_id)?
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        if message.delivery_state.is_settled() {
            return Ok(());
        }
        self.inner.cancelled.lock().await.remove(message_id);
        self.inner
            .outgoing
            .lock()
            .await
            .entry(message_id.to_string())
            .or_insert_with(|| OutgoingEntry::new(message.conversation_id.clone()));
        self.dispatch(message_id).await
    }

    /// Failed attempts so far, or `None` when the message is not tracked
    pub async fn attempts(&self, message_id: &str) -> Option<u32> {
        self.inner
            .outgoing
            .lock()
            .await
            .get(message_id)
            .map(|e| e.attempts)
    }

    /// Re-track unsettled local messages found in the log (after a restart)
    pub async fn resume(&self) -> Result<usize> {
        let local = self.local_user_id().to_string();
        let unsettled: Vec<Message> = self
            .inner
            .log
            .unsettled()?
            .into_iter()
            .filter(|m| m.author_id == local)
            .collect();
        {
            let mut outgoing = self.inner.outgoing.lock().await;
            for m in &unsettled {
                outgoing
                    .entry(m.id.clone())
                    .or_insert_with(|| OutgoingEntry::new(m.conversation_id.clone()));
            }
        }
        info!("Resumed {} unsettled outgoing message(s)", unsettled.len());
        self.flush().await?;
        Ok(unsettled.len())
    }

    /// Attempt every queued or retry-waiting message now
    pub async fn flush(&self) -> Result<()> {
        let ids: Vec<String> = self
            .inner
            .outgoing
            .lock()
            .await
            .iter()
            .filter(|(_, e)| e.phase != Phase::InFlight)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.dispatch(&id).await?;
        }
        Ok(())
    }

    pub async fn on_connection_change(&self, state: ConnectionState) -> Result<()> {
        info!("Transport is now {:?}", state);
        self.emit(SyncEvent::ConnectionChanged { state });
        if state == ConnectionState::Online {
            self.flush().await?;
        }
        Ok(())
    }

    async fn set_state(&self, message_id: &str, state: DeliveryState) -> Result<()> {
        if let Some(updated) = self
            .inner
            .log
            .set_delivery_state(message_id, state)
            .await?
        {
            self.emit(SyncEvent::DeliveryStateChanged {
                message_id: updated.id,
                conversation_id: updated.conversation_id,
                state: updated.delivery_state,
            });
        }
        Ok(())
    }

    // ─── incoming ────────────────────────────────────────────────────────────

    /// Merge a remote message. Redelivery of the same id is a no-op.
    pub async fn on_incoming(&self, mut message: Message) -> Result<Message> {
        if message.id.is_empty() || message.conversation_id.is_empty() || message.author_id.is_empty() {
            warn!("Rejecting malformed incoming message {:?}", message.id);
            return Err(ChatError::Corrupt {
                key: format!("incoming:{}", message.id),
                reason: "missing id, conversation or author".to_string(),
            });
        }
        message.delivery_state = DeliveryState::Delivered;
        let conversation_id = message.conversation_id.clone();

        let outcome = match self.inner.log.merge_remote(message).await {
            Ok(o) => o,
            Err(ChatError::Conflict { message_id, reason }) => {
                warn!("Conflict on incoming {}: {}", message_id, reason);
                self.emit(SyncEvent::ConflictDetected {
                    message_id: message_id.clone(),
                    reason: reason.clone(),
                });
                return Err(ChatError::Conflict { message_id, reason });
            }
            Err(e) => return Err(e),
        };

        let stored = outcome.message;
        self.inner.index.touch(&conversation_id, &stored).await?;
        if outcome.status == AppendStatus::Duplicate {
            debug!("Duplicate incoming {}", stored.id);
            return Ok(stored);
        }

        if stored.author_id != self.local_user_id() {
            let is_open = self.inner.open_conversation.read().await.as_deref()
                == Some(conversation_id.as_str());
            if is_open {
                self.inner.log.mark_read(&conversation_id, u64::MAX).await?;
                self.inner.index.clear_unread(&conversation_id).await?;
            } else {
                self.inner
                    .index
                    .increment_unread(&conversation_id, &stored)
                    .await?;
            }
        }

        self.emit(SyncEvent::MessageStored {
            message: stored.clone(),
        });
        Ok(stored)
    }

    // ─── conversation focus ──────────────────────────────────────────────────

    /// Mark a conversation as on screen and everything in it as read
    /// Unknown conversations are `NotFound` and leave the focus unchanged.
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<ConversationSummary> {
        // Focus first, so anything arriving from here on counts as read
        let previous = self
            .inner
            .open_conversation
            .write()
            .await
            .replace(conversation_id.to_string());
        if let Err(e) = self.inner.log.mark_read(conversation_id, u64::MAX).await {
            *self.inner.open_conversation.write().await = previous;
            return Err(e);
        }
        self.inner.index.clear_unread(conversation_id).await
    }

    pub async fn close_conversation(&self) {
        *self.inner.open_conversation.write().await = None;
    }

    pub async fn open_conversation_id(&self) -> Option<String> {
        self.inner.open_conversation.read().await.clone()
    }

    /// Whether any other participant is online, per the presence collaborator
    pub fn conversation_online(&self, summary: &ConversationSummary) -> bool {
        summary
            .participant_ids
            .iter()
            .filter(|id| id.as_str() != self.local_user_id())
            .any(|id| self.inner.presence.is_online(id))
    }

    // ─── background loop ─────────────────────────────────────────────────────

    /// Consume incoming messages and connection changes until `shutdown` flips.
    ///
    /// Only one loop may run per engine.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut incoming = self
            .inner
            .incoming_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ChatError::InvalidTransition("sync loop already running".to_string()))?;
        let mut connection = self.inner.transport.watch_connection();
        info!("Sync loop started");

        loop {
            tokio::select! {
                Some(message) = incoming.recv() => {
                    let id = message.id.clone();
                    if let Err(e) = self.on_incoming(message).await {
                        error!("Incoming {} not merged: {}", id, e);
                    }
                }
                changed = connection.changed() => {
                    if changed.is_err() {
                        warn!("Transport connection watch closed");
                        break;
                    }
                    let state = *connection.borrow_and_update();
                    if let Err(e) = self.on_connection_change(state).await {
                        error!("Flush after connection change failed: {}", e);
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        *self.inner.incoming_rx.lock().await = Some(incoming);
        info!("Sync loop stopped");
        Ok(())
    }
}
