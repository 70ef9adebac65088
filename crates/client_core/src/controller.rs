use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::Utc;
use shared::{
    domain::{
        ActionId, ActionItem, Card, CardId, ParticipantId, SessionId, SessionStatus, TimerState,
    },
    error::ErrorCode,
    protocol::{CardPatch, CreateActionRequest, CreateCardRequest, SessionPatch, Table},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    error::RetroError,
    ledger::{UnvoteOutcome, VoteOutcome},
    state::{Applied, BoardSnapshot, FullSnapshot, RetroState},
    store::RecordStore,
    timer::{Clock, TimerClock, TimerPhase, TimerTick, TICK_INTERVAL},
    transport::{
        subscribe_cards, subscribe_session, subscribe_votes, ChangeHandler, ChannelHandler,
        ConnectionStatus, EventTransport, SubscriptionHandle, TransportMessage,
    },
};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub display_name: String,
    /// `None` leaves ticking to the caller.
    pub tick_interval: Option<Duration>,
}

impl ControllerConfig {
    pub fn new(
        session_id: SessionId,
        participant_id: ParticipantId,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            participant_id,
            display_name: display_name.into(),
            tick_interval: Some(TICK_INTERVAL),
        }
    }
}

/// Output for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    BoardChanged,
    TimerTick {
        remaining_seconds: u32,
        phase: TimerPhase,
    },
    /// Play the completion cue and show the celebration overlay.
    TimerExpired,
    ConnectionChanged(ConnectionStatus),
    SessionCompleted,
    Error(String),
}

type ResyncReply = oneshot::Sender<Result<(), RetroError>>;

/// Drives one participant's view of a retro session.
///
/// Every mutation is applied optimistically, then written to the record store.
/// The store's change feed is the only path by which confirmed state enters,
/// including this client's own writes. A rejected write rolls back the local
/// overlay.
pub struct RetroController {
    config: ControllerConfig,
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn EventTransport>,
    clock: Arc<dyn Clock>,
    state: Mutex<RetroState>,
    events: broadcast::Sender<ClientEvent>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Present while the pump runs; resyncs are queued through it.
    resyncs: Mutex<Option<mpsc::UnboundedSender<ResyncReply>>>,
}

impl RetroController {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn EventTransport>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let state = RetroState::new(config.session_id, config.participant_id.clone());
        Arc::new(Self {
            config,
            store,
            transport,
            clock,
            state: Mutex::new(state),
            events,
            subscriptions: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            resyncs: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.config.session_id
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.config.participant_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Opens the three subscriptions and loads the session.
    ///
    /// The subscriptions stay up even if the initial fetch fails; the next
    /// `Connected` transition retries it.
    pub async fn mount(self: &Arc<Self>) -> Result<(), RetroError> {
        let session_id = self.config.session_id;
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn ChangeHandler> = Arc::new(ChannelHandler::new(tx));
        {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.clear();
            subscriptions.push(subscribe_cards(
                self.transport.as_ref(),
                session_id,
                Arc::clone(&handler),
            ));
            subscriptions.push(subscribe_votes(
                self.transport.as_ref(),
                session_id,
                Arc::clone(&handler),
            ));
            subscriptions.push(subscribe_session(
                self.transport.as_ref(),
                session_id,
                handler,
            ));
        }

        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        *self.resyncs.lock().await = Some(resync_tx);
        let mut tasks = self.tasks.lock().await;
        tasks.push(spawn_pump(Arc::downgrade(self), rx, resync_rx));
        if let Some(period) = self.config.tick_interval {
            tasks.push(spawn_ticker(Arc::downgrade(self), period));
        }
        drop(tasks);

        info!(%session_id, participant_id = %self.config.participant_id, "mounting retro session");
        self.resync().await
    }

    /// Stops subscriptions and background tasks.
    pub async fn shutdown(&self) {
        self.resyncs.lock().await.take();
        self.subscriptions.lock().await.clear();
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        debug!(session_id = %self.config.session_id, "retro controller shut down");
    }

    /// Full refetch.
    ///
    /// Once mounted, the refetch runs on the pump task. Change events that
    /// arrive while it is in flight queue behind it and are applied on top of
    /// the fetched rows. The state lock is only taken to swap the rows in, so
    /// a stalled fetch leaves the board stale but responsive.
    pub async fn resync(&self) -> Result<(), RetroError> {
        let queue = self.resyncs.lock().await.clone();
        let Some(queue) = queue else {
            return self.fetch_and_load().await;
        };
        let (reply, done) = oneshot::channel();
        if queue.send(reply).is_err() {
            return self.fetch_and_load().await;
        }
        done.await.map_err(|_| RetroError::TransportDisconnected)?
    }

    async fn fetch_and_load(&self) -> Result<(), RetroError> {
        let session_id = self.config.session_id;
        let (session, cards, votes, actions) = futures::try_join!(
            self.store.get_session(session_id),
            self.store.list_cards(session_id),
            self.store.list_votes(session_id),
            self.store.list_actions(session_id),
        )?;
        debug!(%session_id, cards = cards.len(), votes = votes.len(), version = session.version, "resynced");
        let completed_now = self.state.lock().await.load(FullSnapshot {
            session,
            cards,
            votes,
            actions,
        });

        self.emit(ClientEvent::BoardChanged);
        if completed_now {
            self.emit(ClientEvent::SessionCompleted);
        }
        self.emit_timer_tick().await;
        Ok(())
    }

    async fn handle_message(&self, message: TransportMessage) {
        match message {
            TransportMessage::Change(event) => {
                let applied = self.state.lock().await.apply_change(&event);
                match applied {
                    Ok(Applied::Board) => self.emit(ClientEvent::BoardChanged),
                    Ok(Applied::Session { completed_now }) => {
                        self.emit(ClientEvent::BoardChanged);
                        if completed_now {
                            info!(session_id = %self.config.session_id, "retro completed");
                            self.emit(ClientEvent::SessionCompleted);
                        }
                        self.emit_timer_tick().await;
                    }
                    Ok(Applied::Ignored) => {}
                    Err(err) => {
                        warn!(error = %err, seq = event.seq, "dropping change event");
                    }
                }
            }
            TransportMessage::Status { table, status } => {
                // Connectivity shown to the user follows the cards channel.
                if table == Table::Cards {
                    let changed = self.state.lock().await.set_connection(status);
                    if changed {
                        if status == ConnectionStatus::Connecting {
                            warn!(session_id = %self.config.session_id, "change feed disconnected; board may be stale");
                        }
                        self.emit(ClientEvent::ConnectionChanged(status));
                    }
                }
                if status == ConnectionStatus::Connected {
                    if let Err(err) = self.fetch_and_load().await {
                        warn!(error = %err, table = table.as_str(), "resync after reconnect failed");
                        self.emit(ClientEvent::Error(err.to_string()));
                    }
                }
            }
        }
    }

    pub async fn snapshot(&self) -> BoardSnapshot {
        let now = self.clock.now_ms();
        self.state.lock().await.snapshot(now)
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        self.state.lock().await.connection()
    }

    pub async fn is_completed(&self) -> bool {
        self.state.lock().await.is_completed()
    }

    async fn undo(&self, f: impl FnOnce(&mut RetroState)) {
        f(&mut *self.state.lock().await);
        self.emit(ClientEvent::BoardChanged);
    }

    fn ensure_open(state: &RetroState) -> Result<(), RetroError> {
        if state.is_completed() {
            return Err(RetroError::SessionCompleted);
        }
        Ok(())
    }

    pub async fn add_card(
        &self,
        column_id: &str,
        content: &str,
        color: Option<String>,
    ) -> Result<CardId, RetroError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(RetroError::InvalidInput("card content is empty".into()));
        }
        let now = Utc::now();
        let card = Card {
            id: CardId::new(),
            session_id: self.config.session_id,
            column_id: column_id.to_string(),
            author_id: self.config.participant_id.clone(),
            author_name: self.config.display_name.clone(),
            content: content.to_string(),
            color,
            created_at: now,
            updated_at: now,
        };
        let card_id = card.id;
        {
            let mut state = self.state.lock().await;
            Self::ensure_open(&state)?;
            state.board_mut().add_card(card.clone())?;
        }
        self.emit(ClientEvent::BoardChanged);

        let req = CreateCardRequest {
            id: card.id,
            session_id: card.session_id,
            column_id: card.column_id,
            author_id: card.author_id,
            author_name: card.author_name,
            content: card.content,
            color: card.color,
        };
        if let Err(err) = self.store.create_card(req).await {
            warn!(error = %err, %card_id, "card create rejected");
            self.undo(|state| state.board_mut().rollback(card_id)).await;
            return Err(err.into());
        }
        Ok(card_id)
    }

    pub async fn edit_card(
        &self,
        card_id: CardId,
        content: Option<String>,
        color: Option<String>,
    ) -> Result<(), RetroError> {
        let content = content.map(|c| c.trim().to_string());
        if content.as_deref() == Some("") {
            return Err(RetroError::InvalidInput("card content is empty".into()));
        }
        let participant_id = self.config.participant_id.clone();
        self.state.lock().await.board_mut().edit_card(
            card_id,
            &participant_id,
            content.clone(),
            color.clone(),
        )?;
        self.emit(ClientEvent::BoardChanged);

        let patch = CardPatch {
            participant_id,
            content,
            color,
        };
        if let Err(err) = self.store.update_card(card_id, patch).await {
            warn!(error = %err, %card_id, "card edit rejected");
            self.undo(|state| state.board_mut().rollback(card_id)).await;
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn delete_card(&self, card_id: CardId) -> Result<(), RetroError> {
        let participant_id = self.config.participant_id.clone();
        self.state
            .lock()
            .await
            .board_mut()
            .delete_card(card_id, &participant_id)?;
        self.emit(ClientEvent::BoardChanged);

        if let Err(err) = self.store.delete_card(card_id, &participant_id).await {
            warn!(error = %err, %card_id, "card delete rejected");
            self.undo(|state| state.board_mut().rollback(card_id)).await;
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn vote(&self, card_id: CardId) -> Result<VoteOutcome, RetroError> {
        let participant_id = self.config.participant_id.clone();
        let max = {
            let mut state = self.state.lock().await;
            Self::ensure_open(&state)?;
            if !state.board().contains(card_id) {
                return Err(RetroError::UnknownCard(card_id));
            }
            if state.ledger_mut().vote(card_id, &participant_id)? == VoteOutcome::AlreadyVoted {
                return Ok(VoteOutcome::AlreadyVoted);
            }
            state.ledger().max_votes_per_person()
        };
        self.emit(ClientEvent::BoardChanged);

        match self.store.create_vote(card_id, &participant_id).await {
            Ok(Some(_)) => Ok(VoteOutcome::Cast),
            Ok(None) => {
                // Recorded elsewhere already; the feed settles the count.
                self.undo(|state| state.ledger_mut().rollback(card_id, &participant_id))
                    .await;
                Ok(VoteOutcome::AlreadyVoted)
            }
            Err(err) => {
                warn!(error = %err, %card_id, "vote rejected");
                self.undo(|state| state.ledger_mut().rollback(card_id, &participant_id))
                    .await;
                if err.code() == Some(ErrorCode::RateLimited) {
                    return Err(RetroError::VoteCapExceeded { max });
                }
                Err(err.into())
            }
        }
    }

    pub async fn unvote(&self, card_id: CardId) -> Result<UnvoteOutcome, RetroError> {
        let participant_id = self.config.participant_id.clone();
        {
            let mut state = self.state.lock().await;
            Self::ensure_open(&state)?;
            if state.ledger_mut().unvote(card_id, &participant_id) == UnvoteOutcome::NotVoted {
                return Ok(UnvoteOutcome::NotVoted);
            }
        }
        self.emit(ClientEvent::BoardChanged);

        if let Err(err) = self.store.delete_vote(card_id, &participant_id).await {
            warn!(error = %err, %card_id, "unvote rejected");
            self.undo(|state| state.ledger_mut().rollback(card_id, &participant_id))
                .await;
            return Err(err.into());
        }
        Ok(UnvoteOutcome::Removed)
    }

    /// Applies `next` locally and writes it back; `None` from `compute` means
    /// there is nothing to do.
    async fn write_timer(
        &self,
        compute: impl FnOnce(&TimerClock, i64) -> Option<TimerState>,
    ) -> Result<(), RetroError> {
        let now = self.clock.now_ms();
        let next = {
            let mut state = self.state.lock().await;
            let Some(next) = compute(state.timer(), now) else {
                return Ok(());
            };
            state.timer_mut().apply_remote(next);
            next
        };
        self.emit_timer_tick().await;

        if let Err(err) = self
            .store
            .update_session(self.config.session_id, SessionPatch::timer(next))
            .await
        {
            warn!(error = %err, "timer update rejected");
            {
                let mut state = self.state.lock().await;
                if let Some(timer) = state.session().map(|session| session.timer) {
                    state.timer_mut().apply_remote(timer);
                }
            }
            self.emit_timer_tick().await;
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn start_timer(&self, minutes: u32) -> Result<(), RetroError> {
        if minutes == 0 {
            return Err(RetroError::InvalidInput("timer needs at least one minute".into()));
        }
        self.write_timer(|timer, now| Some(timer.start(minutes, now)))
            .await
    }

    pub async fn pause_timer(&self) -> Result<(), RetroError> {
        self.write_timer(|timer, now| timer.state().is_running.then(|| timer.pause(now)))
            .await
    }

    pub async fn resume_timer(&self) -> Result<(), RetroError> {
        self.write_timer(|timer, now| timer.resume(now)).await
    }

    pub async fn reset_timer(&self) -> Result<(), RetroError> {
        self.write_timer(|timer, _| Some(timer.reset())).await
    }

    pub async fn adjust_timer(&self, delta_minutes: i32) -> Result<(), RetroError> {
        self.write_timer(|timer, now| Some(timer.adjust(delta_minutes, now)))
            .await
    }

    async fn emit_timer_tick(&self) {
        let now = self.clock.now_ms();
        let (remaining_seconds, phase) = {
            let state = self.state.lock().await;
            (state.timer().remaining(now), state.timer().phase(now))
        };
        self.emit(ClientEvent::TimerTick {
            remaining_seconds,
            phase,
        });
    }

    /// One cosmetic tick. On the expiry edge this client writes the expired
    /// state back, conditional on the timer it saw expire. A write-back that
    /// arrives after someone started a new timer is dropped by the store.
    pub async fn tick(&self) -> TimerTick {
        let now = self.clock.now_ms();
        let (tick, expired_timer) = {
            let mut state = self.state.lock().await;
            let timer = state.timer_mut();
            (timer.tick(now), timer.state())
        };
        self.emit(ClientEvent::TimerTick {
            remaining_seconds: tick.remaining_seconds,
            phase: tick.phase,
        });
        if tick.expired {
            info!(session_id = %self.config.session_id, "timer expired");
            self.emit(ClientEvent::TimerExpired);
            if let Err(err) = self
                .store
                .update_session(
                    self.config.session_id,
                    SessionPatch::timer_if_unchanged(expired_timer, TimerClock::expired_state()),
                )
                .await
            {
                warn!(error = %err, "failed to write back expired timer");
                self.emit(ClientEvent::Error(err.to_string()));
            }
        }
        tick
    }

    /// One-way transition to `completed`.
    pub async fn complete_session(&self) -> Result<(), RetroError> {
        if !self.state.lock().await.mark_completed() {
            return Ok(());
        }
        self.emit(ClientEvent::SessionCompleted);
        self.emit(ClientEvent::BoardChanged);

        if let Err(err) = self
            .store
            .update_session(
                self.config.session_id,
                SessionPatch::status(SessionStatus::Completed),
            )
            .await
        {
            warn!(error = %err, "completing retro rejected");
            self.undo(RetroState::restore_completion).await;
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn set_recommendations(&self, recommendations: Vec<String>) -> Result<(), RetroError> {
        let metadata = {
            let state = self.state.lock().await;
            let mut metadata = state
                .session()
                .map(|session| session.metadata.clone())
                .unwrap_or_default();
            metadata.recommendations = recommendations;
            metadata
        };
        let patch = SessionPatch {
            metadata: Some(metadata),
            ..SessionPatch::default()
        };
        self.store
            .update_session(self.config.session_id, patch)
            .await?;
        Ok(())
    }

    /// Action items are not on the change feed; the stored row is applied
    /// directly.
    pub async fn add_action(
        &self,
        title: &str,
        assignee: Option<String>,
    ) -> Result<ActionItem, RetroError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(RetroError::InvalidInput("action item title is empty".into()));
        }
        let action = self
            .store
            .create_action(CreateActionRequest {
                session_id: self.config.session_id,
                title: title.to_string(),
                assignee,
            })
            .await?;
        self.state.lock().await.push_action(action.clone());
        self.emit(ClientEvent::BoardChanged);
        Ok(action)
    }

    pub async fn remove_action(&self, action_id: ActionId) -> Result<(), RetroError> {
        self.store.delete_action(action_id).await?;
        self.state.lock().await.remove_action(action_id);
        self.emit(ClientEvent::BoardChanged);
        Ok(())
    }
}

/// Applies transport messages and resync requests one at a time, in arrival
/// order.
fn spawn_pump(
    controller: Weak<RetroController>,
    mut rx: mpsc::UnboundedReceiver<TransportMessage>,
    mut resyncs: mpsc::UnboundedReceiver<ResyncReply>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(message) = rx.recv() => {
                    let Some(controller) = controller.upgrade() else {
                        break;
                    };
                    controller.handle_message(message).await;
                }
                Some(reply) = resyncs.recv() => {
                    let Some(controller) = controller.upgrade() else {
                        break;
                    };
                    let _ = reply.send(controller.fetch_and_load().await);
                }
                else => break,
            }
        }
    })
}

fn spawn_ticker(controller: Weak<RetroController>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(controller) = controller.upgrade() else {
                break;
            };
            controller.tick().await;
        }
    })
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
