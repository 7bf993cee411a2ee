/// Messenger: the read/write surface a UI talks to
///
/// Reads come straight from the local store, so every screen works offline.
/// Writes go through the sync engine; contact names and presence come from
/// injected collaborators.
use crate::call_session::{
    CallDirection, CallHistory, CallRecord, CallSessionController, CallSignal, CallState,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::contact_store::{Contact, ContactDirectory, ContactStore};
use crate::conversation_index::ConversationIndex;
use crate::error::{ChatError, Result};
use crate::local_store::LocalStore;
use crate::message_log::MessageLog;
use crate::messenger_types::{conversation_id_for, ConversationSummary, Message, Payload};
use crate::presence::Presence;
use crate::sync_engine::SyncEngine;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Which slice of a conversation to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    /// The newest `limit` messages
    Latest { limit: usize },
    /// `limit` messages starting at `sequence`
    From { sequence: i64, limit: usize },
    /// `limit` messages strictly older than `sequence`
    Before { sequence: u64, limit: usize },
}

/// One row of the conversation list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationView {
    pub summary: ConversationSummary,
    pub title: String,
    pub online: bool,
    pub last_preview: Option<String>,
}

#[derive(Clone)]
pub struct Messenger {
    engine: SyncEngine,
    contacts: ContactStore,
    directory: Arc<dyn ContactDirectory>,
    calls: CallHistory,
    clock: Arc<dyn Clock>,
    call_tick: Duration,
    active_call: Arc<Mutex<Option<CallSessionController>>>,
}

impl Messenger {
    /// Wire every component over one store
    pub fn new(
        store: LocalStore,
        transport: Arc<dyn Transport>,
        presence: Arc<dyn Presence>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        let log = MessageLog::new(store.clone());
        let index = ConversationIndex::new(store.clone(), config.local_user_id.clone());
        let engine = SyncEngine::new(
            log,
            index,
            transport,
            presence,
            clock.clone(),
            config.sync_config(),
        );
        let contacts = ContactStore::new(store.clone());
        Self {
            engine,
            directory: Arc::new(contacts.clone()),
            contacts,
            calls: CallHistory::new(store),
            clock,
            call_tick: config.call_tick,
            active_call: Arc::new(Mutex::new(None)),
        }
    }

    /// Open the store named by `config` (sled, or memory with `--memory`)
    pub fn open(
        config: &Config,
        transport: Arc<dyn Transport>,
        presence: Arc<dyn Presence>,
    ) -> Result<Self> {
        let store = if config.in_memory {
            LocalStore::in_memory()
        } else {
            LocalStore::open(&config.resolved_data_dir())?
        };
        info!("Messenger ready for {}", config.local_user_id);
        Ok(Self::new(
            store,
            transport,
            presence,
            Arc::new(SystemClock),
            config,
        ))
    }

    /// Use another source for contact names than the local address book
    pub fn with_directory(mut self, directory: Arc<dyn ContactDirectory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn contacts(&self) -> &ContactStore {
        &self.contacts
    }

    pub fn local_user_id(&self) -> &str {
        self.engine.local_user_id()
    }

    // ─── conversations ───────────────────────────────────────────────────────

    pub fn list_conversations(&self) -> Result<Vec<ConversationView>> {
        self.engine
            .index()
            .list()?
            .into_iter()
            .map(|s| self.view(s))
            .collect()
    }

    /// Conversations whose title contains `query`, ignoring case
    pub fn search_conversations(&self, query: &str) -> Result<Vec<ConversationView>> {
        let q = query.trim().to_lowercase();
        let all = self.list_conversations()?;
        if q.is_empty() {
            return Ok(all);
        }
        Ok(all
            .into_iter()
            .filter(|v| v.title.to_lowercase().contains(&q))
            .collect())
    }

    /// Create (or find) the conversation between the local user and `others`
    pub async fn start_conversation(&self, others: &[String]) -> Result<ConversationSummary> {
        let mut participants: BTreeSet<String> = others
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        participants.insert(self.local_user_id().to_string());
        if participants.len() < 2 {
            return Err(ChatError::OutOfRange(
                "a conversation needs at least one other participant".to_string(),
            ));
        }

        let conversation_id = conversation_id_for(&participants);
        let now = self.clock.now();
        self.engine
            .log()
            .ensure_conversation(&conversation_id, &participants, now)
            .await?;
        let summary = self
            .engine
            .index()
            .ensure(&conversation_id, &participants, now)
            .await?;
        info!("Conversation {} with {} participant(s)", conversation_id, participants.len());
        Ok(summary)
    }

    pub async fn open_conversation(&self, conversation_id: &str) -> Result<ConversationView> {
        let summary = self.engine.open_conversation(conversation_id).await?;
        self.view(summary)
    }

    pub async fn close_conversation(&self) {
        self.engine.close_conversation().await;
    }

    // ─── messages ────────────────────────────────────────────────────────────

    pub async fn list_messages(&self, conversation_id: &str, page: Page) -> Result<Vec<Message>> {
        let log = self.engine.log();
        match page {
            Page::Latest { limit } => log.latest(conversation_id, limit).await,
            Page::From { sequence, limit } => log.get(conversation_id, sequence, limit).await,
            Page::Before { sequence, limit } => log.before(conversation_id, sequence, limit).await,
        }
    }

    /// Optimistic send: the message is in the log before the transport sees it.
    /// The conversation must already exist.
    pub async fn send_message(&self, conversation_id: &str, payload: Payload) -> Result<Message> {
        if self.engine.log().load(conversation_id)?.is_none() {
            return Err(ChatError::NotFound(format!("conversation {}", conversation_id)));
        }
        let message = Message::new_local(
            conversation_id,
            self.local_user_id(),
            payload,
            self.clock.now(),
        );
        debug!("Sending {} to {}", message.id, conversation_id);
        self.engine.enqueue_outgoing(message).await
    }

    pub async fn retry_message(&self, message_id: &str) -> Result<()> {
        self.engine.retry_message(message_id).await
    }

    /// Recompute every summary from the logs
    pub async fn rebuild_index(&self) -> Result<Vec<ConversationSummary>> {
        self.engine.index().rebuild_from(self.engine.log()).await
    }

    // ─── contacts ────────────────────────────────────────────────────────────

    pub fn search_contacts(&self, query: &str) -> Result<Vec<Contact>> {
        self.directory.search(query)
    }

    // ─── calls ───────────────────────────────────────────────────────────────

    /// Start a call in a conversation. Only one call may be live at a time.
    pub async fn start_call(
        &self,
        conversation_id: &str,
        direction: CallDirection,
    ) -> Result<CallSessionController> {
        let mut active = self.active_call.lock().await;
        self.settle(&mut active).await?;
        if active.is_some() {
            return Err(ChatError::InvalidTransition(
                "another call is in progress".to_string(),
            ));
        }
        let call = CallSessionController::new(
            conversation_id,
            direction,
            self.clock.clone(),
            self.call_tick,
        );
        *active = Some(call.clone());
        Ok(call)
    }

    pub async fn active_call(&self) -> Option<CallSessionController> {
        self.active_call.lock().await.clone()
    }

    /// Feed a signal to the live call; a finished call lands in history
    pub async fn call_signal(&self, signal: CallSignal) -> Result<Option<CallRecord>> {
        let mut active = self.active_call.lock().await;
        let call = active
            .as_ref()
            .ok_or_else(|| ChatError::InvalidTransition("no active call".to_string()))?;
        // An ended call still here is waiting for its history write
        if call.state()? != CallState::Ended {
            call.handle(signal)?;
        }
        self.settle(&mut active).await
    }

    pub async fn hang_up(&self) -> Result<Option<CallRecord>> {
        self.call_signal(CallSignal::LocalHangUp).await
    }

    /// Finished calls, newest first
    pub async fn call_history(&self) -> Result<Vec<CallRecord>> {
        self.settle(&mut *self.active_call.lock().await).await?;
        self.calls.list()
    }

    /// Persist the active call's record once it has ended, then release it.
    /// The call stays active until the write succeeds.
    async fn settle(
        &self,
        active: &mut Option<CallSessionController>,
    ) -> Result<Option<CallRecord>> {
        let Some(record) = active.as_ref().map(|c| c.record()).transpose()?.flatten() else {
            return Ok(None);
        };
        self.calls.record(record.clone()).await?;
        debug!("Call {} saved to history", record.call_id);
        *active = None;
        Ok(Some(record))
    }

    // ─── helpers ─────────────────────────────────────────────────────────────

    fn view(&self, summary: ConversationSummary) -> Result<ConversationView> {
        let local = self.local_user_id();
        let mut names = Vec::new();
        for id in summary.participant_ids.iter().filter(|id| id.as_str() != local) {
            let name = self
                .directory
                .lookup(id)?
                .map(|c| c.display_name)
                .unwrap_or_else(|| id.clone());
            names.push(name);
        }
        let title = if names.is_empty() {
            summary.conversation_id.clone()
        } else {
            names.join(", ")
        };

        let last_preview = match &summary.last_message_id {
            Some(id) => self.engine.log().find(id)?.map(|m| m.payload.preview()),
            None => None,
        };
        let online = self.engine.conversation_online(&summary);
        Ok(ConversationView {
            summary,
            title,
            online,
            last_preview,
        })
    }
}
