/// Call session state machine: Dialing -> Connected -> Ended, or Dialing -> Ended
///
/// Driven by `CallSignal`s. In production those come from the transport;
/// `SimulatedAnswer` is the timer-based stand-in. While connected, a ticker
/// publishes the running duration on a fixed interval.
use crate::clock::Clock;
use crate::error::{ChatError, Result};
use crate::local_store::LocalStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Dialing,
    Connected,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// How a finished call is shown in history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Answered,
    /// Incoming call never picked up
    Missed,
    /// Outgoing call hung up before the other side answered
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSignal {
    RemoteAnswered,
    RemoteHungUp,
    LocalHangUp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: String,
    pub conversation_id: String,
    pub direction: CallDirection,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub muted: bool,
    pub video_enabled: bool,
}

/// Finished call, as kept in the call history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub conversation_id: String,
    pub direction: CallDirection,
    pub outcome: CallOutcome,
    pub started_at: DateTime<Utc>,
    pub duration_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    StateChanged { call_id: String, state: CallState },
    Tick { call_id: String, elapsed_secs: i64 },
}

struct Shared {
    session: CallSession,
    ticker: Option<AbortHandle>,
    /// Set once the call has ended
    record: Option<CallRecord>,
}

#[derive(Clone)]
pub struct CallSessionController {
    shared: Arc<Mutex<Shared>>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    events: broadcast::Sender<CallEvent>,
}

impl CallSessionController {
    pub fn new(
        conversation_id: impl Into<String>,
        direction: CallDirection,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
    ) -> Self {
        let session = CallSession {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            direction,
            state: CallState::Dialing,
            started_at: clock.now(),
            connected_at: None,
            ended_at: None,
            muted: false,
            video_enabled: true,
        };
        info!(
            "Call {} ({:?}) dialing in {}",
            session.id, direction, session.conversation_id
        );
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Mutex::new(Shared {
                session,
                ticker: None,
                record: None,
            })),
            clock,
            tick_interval,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Shared>> {
        self.shared
            .lock()
            .map_err(|_| ChatError::InvalidTransition("call state lock poisoned".to_string()))
    }

    /// Snapshot of the session
    pub fn session(&self) -> Result<CallSession> {
        Ok(self.lock()?.session.clone())
    }

    pub fn state(&self) -> Result<CallState> {
        Ok(self.lock()?.session.state)
    }

    /// Dialing -> Connected. Any other starting state is an error.
    pub fn connect(&self) -> Result<()> {
        let mut shared = self.lock()?;
        if shared.session.state != CallState::Dialing {
            return Err(ChatError::InvalidTransition(format!(
                "connect from {:?}",
                shared.session.state
            )));
        }
        shared.session.state = CallState::Connected;
        shared.session.connected_at = Some(self.clock.now());
        shared.ticker = self.start_ticker(shared.session.id.clone());
        info!("Call {} connected", shared.session.id);
        let _ = self.events.send(CallEvent::StateChanged {
            call_id: shared.session.id.clone(),
            state: CallState::Connected,
        });
        Ok(())
    }

    /// End the call from any live state. Returns the history record the
    /// first time; later calls are no-ops returning `None`.
    pub fn end(&self) -> Result<Option<CallRecord>> {
        let mut shared = self.lock()?;
        if shared.session.state == CallState::Ended {
            debug!("Call {} already ended", shared.session.id);
            return Ok(None);
        }
        let was_connected = shared.session.state == CallState::Connected;
        shared.session.state = CallState::Ended;
        shared.session.ended_at = Some(self.clock.now());
        if let Some(ticker) = shared.ticker.take() {
            ticker.abort();
        }

        let session = &shared.session;
        let outcome = match (was_connected, session.direction) {
            (true, _) => CallOutcome::Answered,
            (false, CallDirection::Incoming) => CallOutcome::Missed,
            (false, CallDirection::Outgoing) => CallOutcome::Cancelled,
        };
        let record = CallRecord {
            call_id: session.id.clone(),
            conversation_id: session.conversation_id.clone(),
            direction: session.direction,
            outcome,
            started_at: session.started_at,
            duration_secs: frozen_duration(session).num_seconds(),
        };
        info!("Call {} ended: {:?}", session.id, outcome);
        let _ = self.events.send(CallEvent::StateChanged {
            call_id: session.id.clone(),
            state: CallState::Ended,
        });
        shared.record = Some(record.clone());
        Ok(Some(record))
    }

    /// The history record of an ended call, however it was ended
    pub fn record(&self) -> Result<Option<CallRecord>> {
        Ok(self.lock()?.record.clone())
    }

    pub fn handle(&self, signal: CallSignal) -> Result<Option<CallRecord>> {
        debug!("Call signal {:?}", signal);
        match signal {
            CallSignal::RemoteAnswered => self.connect().map(|_| None),
            CallSignal::RemoteHungUp | CallSignal::LocalHangUp => self.end(),
        }
    }

    /// Live while connected, frozen once ended, zero if never connected
    pub fn duration(&self) -> Result<ChronoDuration> {
        let shared = self.lock()?;
        Ok(current_duration(&shared.session, self.clock.as_ref()))
    }

    pub fn toggle_mute(&self) -> Result<bool> {
        self.toggle(|s| &mut s.muted)
    }

    pub fn toggle_video(&self) -> Result<bool> {
        self.toggle(|s| &mut s.video_enabled)
    }

    fn toggle(&self, field: fn(&mut CallSession) -> &mut bool) -> Result<bool> {
        let mut shared = self.lock()?;
        if shared.session.state == CallState::Ended {
            return Err(ChatError::InvalidTransition("call has ended".to_string()));
        }
        let flag = field(&mut shared.session);
        *flag = !*flag;
        Ok(*flag)
    }

    fn start_ticker(&self, call_id: String) -> Option<AbortHandle> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime, call {} runs without a duration ticker", call_id);
            return None;
        };
        // Weak, so a controller dropped while connected takes its ticker with it
        let shared: Weak<Mutex<Shared>> = Arc::downgrade(&self.shared);
        let clock = self.clock.clone();
        let events = self.events.clone();
        let period = self.tick_interval;
        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(strong) = shared.upgrade() else {
                    debug!("Call {} dropped, stopping ticker", call_id);
                    break;
                };
                let elapsed = match strong.lock() {
                    Ok(s) if s.session.state == CallState::Connected => {
                        current_duration(&s.session, clock.as_ref())
                    }
                    _ => break,
                };
                let _ = events.send(CallEvent::Tick {
                    call_id: call_id.clone(),
                    elapsed_secs: elapsed.num_seconds(),
                });
            }
        });
        Some(task.abort_handle())
    }

    pub fn has_ticker(&self) -> Result<bool> {
        Ok(self.lock()?.ticker.is_some())
    }
}

fn current_duration(session: &CallSession, clock: &dyn Clock) -> ChronoDuration {
    match (session.state, session.connected_at) {
        (CallState::Connected, Some(at)) => clock.now() - at,
        _ => frozen_duration(session),
    }
}

fn frozen_duration(session: &CallSession) -> ChronoDuration {
    match (session.connected_at, session.ended_at) {
        (Some(c), Some(e)) => e - c,
        _ => ChronoDuration::zero(),
    }
}

// ─── history ─────────────────────────────────────────────────────────────────

pub const CALL_HISTORY_KEY: &str = "calls:history";

/// Persisted list of finished calls, oldest first on disk
#[derive(Clone)]
pub struct CallHistory {
    store: LocalStore,
}

impl CallHistory {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub async fn record(&self, record: CallRecord) -> Result<()> {
        let key = CALL_HISTORY_KEY.to_string();
        self.store
            .transaction(std::slice::from_ref(&key), |txn| {
                let mut all: Vec<CallRecord> = txn.get_record(&key)?.unwrap_or_default();
                if all.iter().any(|r| r.call_id == record.call_id) {
                    return Ok(());
                }
                all.push(record);
                txn.set_record(&key, &all)
            })
            .await
    }

    /// Newest first
    pub fn list(&self) -> Result<Vec<CallRecord>> {
        let mut all: Vec<CallRecord> = self.store.get_record(CALL_HISTORY_KEY)?.unwrap_or_default();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(all)
    }
}

/// Timer stand-in for the remote side picking up
pub struct SimulatedAnswer;

impl SimulatedAnswer {
    pub fn spawn(controller: CallSessionController, after: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Err(e) = controller.handle(CallSignal::RemoteAnswered) {
                debug!("Simulated answer ignored: {}", e);
            }
        })
    }
}

/// "mm:ss", or "h:mm:ss" past an hour
pub fn format_duration(d: ChronoDuration) -> String {
    let total = d.num_seconds().max(0);
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn setup(direction: CallDirection) -> (CallSessionController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        ));
        let c = CallSessionController::new("dm:a:b", direction, clock.clone(), Duration::from_secs(1));
        (c, clock)
    }

    #[tokio::test]
    async fn test_end_twice_is_noop_and_duration_frozen() {
        let (call, clock) = setup(CallDirection::Outgoing);
        call.connect().unwrap();
        clock.advance(ChronoDuration::seconds(65));

        let record = call.end().unwrap().unwrap();
        assert_eq!(record.outcome, CallOutcome::Answered);
        assert_eq!(record.duration_secs, 65);
        assert_eq!(call.state().unwrap(), CallState::Ended);
        let frozen = call.duration().unwrap();

        clock.advance(ChronoDuration::seconds(30));
        assert!(call.end().unwrap().is_none());
        assert_eq!(call.duration().unwrap(), frozen);
        assert_eq!(format_duration(frozen), "01:05");
    }

    #[tokio::test]
    async fn test_duration_is_live_while_connected() {
        let (call, clock) = setup(CallDirection::Outgoing);
        assert_eq!(call.duration().unwrap(), ChronoDuration::zero());
        call.connect().unwrap();
        clock.advance(ChronoDuration::seconds(10));
        assert_eq!(call.duration().unwrap().num_seconds(), 10);
        clock.advance(ChronoDuration::seconds(5));
        assert_eq!(call.duration().unwrap().num_seconds(), 15);
    }

    #[tokio::test]
    async fn test_connect_only_from_dialing() {
        let (call, _) = setup(CallDirection::Outgoing);
        call.connect().unwrap();
        assert!(matches!(call.connect(), Err(ChatError::InvalidTransition(_))));

        call.end().unwrap();
        assert!(matches!(call.connect(), Err(ChatError::InvalidTransition(_))));
        assert_eq!(call.state().unwrap(), CallState::Ended);
    }

    #[tokio::test]
    async fn test_cancel_before_connect_outcomes() {
        let (outgoing, _) = setup(CallDirection::Outgoing);
        let r = outgoing.handle(CallSignal::LocalHangUp).unwrap().unwrap();
        assert_eq!(r.outcome, CallOutcome::Cancelled);
        assert_eq!(r.duration_secs, 0);

        let (incoming, _) = setup(CallDirection::Incoming);
        let r = incoming.handle(CallSignal::RemoteHungUp).unwrap().unwrap();
        assert_eq!(r.outcome, CallOutcome::Missed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_runs_while_connected_and_stops_once() {
        let (call, clock) = setup(CallDirection::Outgoing);
        let mut events = call.subscribe();
        call.connect().unwrap();
        assert!(call.has_ticker().unwrap());
        assert!(matches!(
            events.recv().await.unwrap(),
            CallEvent::StateChanged { state: CallState::Connected, .. }
        ));

        clock.advance(ChronoDuration::seconds(1));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            CallEvent::Tick { elapsed_secs: 1, .. }
        ));

        call.end().unwrap();
        assert!(!call.has_ticker().unwrap());
        call.end().unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            CallEvent::StateChanged { state: CallState::Ended, .. }
        ));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stops_when_connected_call_is_dropped() {
        let (call, clock) = setup(CallDirection::Outgoing);
        let mut events = call.subscribe();
        call.connect().unwrap();
        drop(call);

        clock.advance(ChronoDuration::seconds(3));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            CallEvent::StateChanged { state: CallState::Connected, .. }
        ));
        // The ticker exited and released the last sender
        assert!(matches!(
            events.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_record_kept_after_end() {
        let (call, _) = setup(CallDirection::Incoming);
        assert!(call.record().unwrap().is_none());
        let ended = call.end().unwrap().unwrap();
        assert!(call.end().unwrap().is_none());
        assert_eq!(call.record().unwrap(), Some(ended));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_answer_connects_after_delay() {
        let (call, _) = setup(CallDirection::Outgoing);
        let handle = SimulatedAnswer::spawn(call.clone(), Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(call.state().unwrap(), CallState::Dialing);
        handle.await.unwrap();
        assert_eq!(call.state().unwrap(), CallState::Connected);
        call.end().unwrap();
    }

    #[tokio::test]
    async fn test_toggles_rejected_after_end() {
        let (call, _) = setup(CallDirection::Outgoing);
        assert!(call.toggle_mute().unwrap());
        assert!(!call.toggle_video().unwrap());
        call.end().unwrap();
        assert!(call.toggle_mute().is_err());
    }

    #[tokio::test]
    async fn test_history_is_persisted_once_per_call() {
        let history = CallHistory::new(LocalStore::in_memory());
        let (first, clock) = setup(CallDirection::Outgoing);
        let r1 = first.end().unwrap().unwrap();
        clock.advance(ChronoDuration::seconds(60));
        let (second, _) = setup(CallDirection::Incoming);
        let r2 = second.end().unwrap().unwrap();

        history.record(r1.clone()).await.unwrap();
        history.record(r1.clone()).await.unwrap();
        history.record(r2.clone()).await.unwrap();

        let listed = history.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed.iter().filter(|r| r.call_id == r1.call_id).count(), 1);
        assert!(listed.iter().any(|r| r.outcome == CallOutcome::Missed));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(ChronoDuration::seconds(0)), "00:00");
        assert_eq!(format_duration(ChronoDuration::seconds(599)), "09:59");
        assert_eq!(format_duration(ChronoDuration::seconds(3725)), "1:02:05");
    }
}
