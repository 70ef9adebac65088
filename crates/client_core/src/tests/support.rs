//! In-memory record store that publishes its commits to a
//! [`LocalEventTransport`], the same way the server fans out its change feed.

use std::{
    collections::HashMap,
    time::Duration,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use shared::{
    domain::{
        ActionId, ActionItem, Card, CardId, ParticipantId, RetroSession, SessionId,
        SessionMetadata, SessionStatus, TimerState, Vote,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        CardPatch, ChangeEvent, ChangeKind, CreateActionRequest, CreateCardRequest, SessionPatch,
        Table,
    },
    template::find_template,
};

use crate::{error::StoreError, store::RecordStore, transport::LocalEventTransport};

#[derive(Default)]
struct Data {
    sessions: HashMap<SessionId, RetroSession>,
    cards: HashMap<CardId, Card>,
    votes: Vec<Vote>,
    actions: Vec<ActionItem>,
}

pub(crate) struct MemoryStore {
    transport: LocalEventTransport,
    data: Mutex<Data>,
    seq: AtomicU64,
    writes: AtomicUsize,
    offline: AtomicBool,
    stall_reads: AtomicBool,
    fail_next: Mutex<Option<ApiError>>,
}

fn reject(code: ErrorCode, message: &str) -> StoreError {
    StoreError::Rejected(ApiError::new(code, message))
}

impl MemoryStore {
    pub(crate) fn new(transport: LocalEventTransport) -> Self {
        Self {
            transport,
            data: Mutex::new(Data::default()),
            seq: AtomicU64::new(0),
            writes: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
            stall_reads: AtomicBool::new(false),
            fail_next: Mutex::new(None),
        }
    }

    pub(crate) fn create_session(&self, template_id: &str) -> RetroSession {
        let now = Utc::now();
        let session = RetroSession {
            id: SessionId::new(),
            template_id: template_id.to_string(),
            title: "Sprint review".into(),
            status: SessionStatus::InProgress,
            timer: TimerState::idle(),
            metadata: SessionMetadata::default(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.lock().sessions.insert(session.id, session.clone());
        session
    }

    /// Stores a card without publishing, as if the event was lost.
    pub(crate) fn insert_card_silently(&self, card: Card) {
        self.lock().cards.insert(card.id, card);
    }

    pub(crate) fn fail_next(&self, err: ApiError) {
        if let Ok(mut slot) = self.fail_next.lock() {
            *slot = Some(err);
        }
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// While set, `list_cards` hangs as if the request never got an answer.
    pub(crate) fn set_stall_reads(&self, stall: bool) {
        self.stall_reads.store(stall, Ordering::SeqCst);
    }

    /// Replaces the stored timer without publishing, as if the event was
    /// still in flight.
    pub(crate) fn set_timer_silently(&self, session_id: SessionId, timer: TimerState) {
        if let Some(session) = self.lock().sessions.get_mut(&session_id) {
            session.timer = timer;
            session.version += 1;
        }
    }

    /// Write calls that reached the store, including rejected ones.
    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn session(&self, session_id: SessionId) -> Option<RetroSession> {
        self.lock().sessions.get(&session_id).cloned()
    }

    pub(crate) fn vote_count(&self) -> usize {
        self.lock().votes.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Data> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish<T: Serialize>(&self, session_id: SessionId, table: Table, kind: ChangeKind, row: &T) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.transport.publish(ChangeEvent {
            session_id,
            table,
            kind,
            row: serde_json::to_value(row).unwrap_or_default(),
            seq,
        });
    }

    fn gate(&self, write: bool) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(anyhow!("connection refused")));
        }
        if write {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.fail_next.lock().ok().and_then(|mut slot| slot.take()) {
                return Err(StoreError::Rejected(err));
            }
        }
        Ok(())
    }

    fn open_session(data: &Data, session_id: SessionId) -> Result<&RetroSession, StoreError> {
        let session = data
            .sessions
            .get(&session_id)
            .ok_or_else(|| reject(ErrorCode::NotFound, "session not found"))?;
        if session.status.is_completed() {
            return Err(reject(ErrorCode::Conflict, "retro is completed"));
        }
        Ok(session)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_session(&self, session_id: SessionId) -> Result<RetroSession, StoreError> {
        self.gate(false)?;
        self.session(session_id)
            .ok_or_else(|| reject(ErrorCode::NotFound, "session not found"))
    }

    async fn update_session(
        &self,
        session_id: SessionId,
        patch: SessionPatch,
    ) -> Result<RetroSession, StoreError> {
        self.gate(true)?;
        let mut data = self.lock();
        let session = data
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| reject(ErrorCode::NotFound, "session not found"))?;
        if session.status.is_completed() && patch.status == Some(SessionStatus::InProgress) {
            return Err(reject(ErrorCode::Conflict, "a completed retro cannot be reopened"));
        }
        let patch = match patch.if_timer {
            Some(expected) if expected != session.timer => SessionPatch {
                timer: None,
                if_timer: None,
                ..patch
            },
            _ => patch,
        };
        if patch.is_empty() {
            return Ok(session.clone());
        }
        if let Some(title) = patch.title {
            session.title = title;
        }
        if let Some(status) = patch.status {
            session.status = status;
        }
        if let Some(timer) = patch.timer {
            session.timer = timer;
        }
        if let Some(metadata) = patch.metadata {
            session.metadata = metadata;
        }
        session.version += 1;
        session.updated_at = Utc::now();
        let session = session.clone();
        self.publish(session_id, Table::Sessions, ChangeKind::Update, &session);
        Ok(session)
    }

    async fn list_cards(&self, session_id: SessionId) -> Result<Vec<Card>, StoreError> {
        self.gate(false)?;
        while self.stall_reads.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(self
            .lock()
            .cards
            .values()
            .filter(|card| card.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn create_card(&self, req: CreateCardRequest) -> Result<Card, StoreError> {
        self.gate(true)?;
        let mut data = self.lock();
        let session = Self::open_session(&data, req.session_id)?;
        let template = find_template(&session.template_id)
            .ok_or_else(|| reject(ErrorCode::Internal, "unknown template"))?;
        if !template.has_column(&req.column_id) {
            return Err(reject(ErrorCode::Validation, "unknown column"));
        }
        if data.cards.contains_key(&req.id) {
            return Err(reject(ErrorCode::Validation, "card id already used"));
        }
        let now = Utc::now();
        let card = Card {
            id: req.id,
            session_id: req.session_id,
            column_id: req.column_id,
            author_id: req.author_id,
            author_name: req.author_name,
            content: req.content,
            color: req.color,
            created_at: now,
            updated_at: now,
        };
        data.cards.insert(card.id, card.clone());
        self.publish(card.session_id, Table::Cards, ChangeKind::Insert, &card);
        Ok(card)
    }

    async fn update_card(&self, card_id: CardId, patch: CardPatch) -> Result<Card, StoreError> {
        self.gate(true)?;
        let mut data = self.lock();
        let card = data
            .cards
            .get_mut(&card_id)
            .ok_or_else(|| reject(ErrorCode::NotFound, "card not found"))?;
        if card.author_id != patch.participant_id {
            return Err(reject(ErrorCode::Forbidden, "only the author may edit"));
        }
        if let Some(content) = patch.content {
            card.content = content;
        }
        if patch.color.is_some() {
            card.color = patch.color;
        }
        card.updated_at = Utc::now();
        let card = card.clone();
        self.publish(card.session_id, Table::Cards, ChangeKind::Update, &card);
        Ok(card)
    }

    async fn delete_card(
        &self,
        card_id: CardId,
        participant_id: &ParticipantId,
    ) -> Result<(), StoreError> {
        self.gate(true)?;
        let mut data = self.lock();
        let card = data
            .cards
            .get(&card_id)
            .cloned()
            .ok_or_else(|| reject(ErrorCode::NotFound, "card not found"))?;
        if &card.author_id != participant_id {
            return Err(reject(ErrorCode::Forbidden, "only the author may delete"));
        }
        let (removed, kept): (Vec<Vote>, Vec<Vote>) =
            data.votes.drain(..).partition(|vote| vote.card_id == card_id);
        data.votes = kept;
        data.cards.remove(&card_id);
        for vote in &removed {
            self.publish(card.session_id, Table::Votes, ChangeKind::Delete, vote);
        }
        self.publish(card.session_id, Table::Cards, ChangeKind::Delete, &card);
        Ok(())
    }

    async fn list_votes(&self, session_id: SessionId) -> Result<Vec<Vote>, StoreError> {
        self.gate(false)?;
        Ok(self
            .lock()
            .votes
            .iter()
            .filter(|vote| vote.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn create_vote(
        &self,
        card_id: CardId,
        participant_id: &ParticipantId,
    ) -> Result<Option<Vote>, StoreError> {
        self.gate(true)?;
        let mut data = self.lock();
        let session_id = data
            .cards
            .get(&card_id)
            .map(|card| card.session_id)
            .ok_or_else(|| reject(ErrorCode::NotFound, "card not found"))?;
        let session = Self::open_session(&data, session_id)?;
        let cap = find_template(&session.template_id)
            .map(|template| template.max_votes_per_person)
            .unwrap_or(0);
        if data
            .votes
            .iter()
            .any(|v| v.card_id == card_id && &v.participant_id == participant_id)
        {
            return Ok(None);
        }
        let held = data
            .votes
            .iter()
            .filter(|v| v.session_id == session_id && &v.participant_id == participant_id)
            .count();
        if held >= cap as usize {
            return Err(reject(ErrorCode::RateLimited, "vote limit reached"));
        }
        let vote = Vote {
            session_id,
            card_id,
            participant_id: participant_id.clone(),
            created_at: Utc::now(),
        };
        data.votes.push(vote.clone());
        self.publish(session_id, Table::Votes, ChangeKind::Insert, &vote);
        Ok(Some(vote))
    }

    async fn delete_vote(
        &self,
        card_id: CardId,
        participant_id: &ParticipantId,
    ) -> Result<(), StoreError> {
        self.gate(true)?;
        let mut data = self.lock();
        let Some(index) = data
            .votes
            .iter()
            .position(|v| v.card_id == card_id && &v.participant_id == participant_id)
        else {
            return Ok(());
        };
        Self::open_session(&data, data.votes[index].session_id)?;
        let vote = data.votes.remove(index);
        self.publish(vote.session_id, Table::Votes, ChangeKind::Delete, &vote);
        Ok(())
    }

    async fn list_actions(&self, session_id: SessionId) -> Result<Vec<ActionItem>, StoreError> {
        self.gate(false)?;
        Ok(self
            .lock()
            .actions
            .iter()
            .filter(|action| action.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn create_action(&self, req: CreateActionRequest) -> Result<ActionItem, StoreError> {
        self.gate(true)?;
        let action = ActionItem {
            id: ActionId::new(),
            session_id: req.session_id,
            title: req.title,
            assignee: req.assignee,
            created_at: Utc::now(),
        };
        self.lock().actions.push(action.clone());
        Ok(action)
    }

    async fn delete_action(&self, action_id: ActionId) -> Result<(), StoreError> {
        self.gate(true)?;
        self.lock().actions.retain(|action| action.id != action_id);
        Ok(())
    }
}
