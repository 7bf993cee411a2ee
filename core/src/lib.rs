/// Parley - offline-first messaging core
///
/// Local log is the source of truth; a sync engine reconciles it with an
/// abstract transport. Conversation summaries are derived and rebuildable.

pub mod error;
pub mod config;
pub mod clock;
pub mod presence;
pub mod messenger_types;
pub mod local_store;
pub mod message_log;
pub mod conversation_index;
pub mod transport;
pub mod sync_engine;
pub mod contact_store;
pub mod call_session;
pub mod messenger;
pub mod cli_app;

pub use call_session::{CallDirection, CallSessionController, CallSignal, CallState};
pub use config::Config;
pub use error::{ChatError, Result};
pub use local_store::LocalStore;
pub use messenger::{ConversationView, Messenger, Page};
pub use messenger_types::{ConversationSummary, DeliveryState, Message, Payload};
pub use sync_engine::{SyncConfig, SyncEngine, SyncEvent};
