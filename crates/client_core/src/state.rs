use serde::Deserialize;
use shared::{
    domain::{
        ActionItem, Card, CardId, ParticipantId, RetroSession, SessionId, SessionStatus, Vote,
    },
    protocol::{ChangeEvent, ChangeKind, Table},
    template::{find_template, ColumnDef, RetroTemplate, DEFAULT_TEMPLATE_ID},
};
use tracing::warn;

use crate::{
    board::CardBoard,
    error::RetroError,
    ledger::VoteLedger,
    timer::{format_mm_ss, TimerClock, TimerPhase},
    transport::ConnectionStatus,
};

/// Everything fetched on mount or resync.
#[derive(Debug, Clone)]
pub struct FullSnapshot {
    pub session: RetroSession,
    pub cards: Vec<Card>,
    pub votes: Vec<Vote>,
    pub actions: Vec<ActionItem>,
}

/// What an applied change touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Board,
    Session { completed_now: bool },
    Ignored,
}

#[derive(Deserialize)]
struct CardKey {
    id: CardId,
}

#[derive(Deserialize)]
struct VoteKey {
    card_id: CardId,
    participant_id: ParticipantId,
}

/// Client-side projection of one retro session.
#[derive(Debug)]
pub struct RetroState {
    session_id: SessionId,
    participant_id: ParticipantId,
    template: RetroTemplate,
    session: Option<RetroSession>,
    completed: bool,
    board: CardBoard,
    ledger: VoteLedger,
    timer: TimerClock,
    actions: Vec<ActionItem>,
    connection: ConnectionStatus,
}

fn template_or_default(template_id: &str) -> RetroTemplate {
    find_template(template_id)
        .or_else(|| {
            warn!(template_id, "unknown template; falling back to default layout");
            find_template(DEFAULT_TEMPLATE_ID)
        })
        .unwrap_or_else(|| RetroTemplate {
            id: template_id.to_string(),
            name: template_id.to_string(),
            columns: Vec::new(),
            max_votes_per_person: 0,
        })
}

impl RetroState {
    pub fn new(session_id: SessionId, participant_id: ParticipantId) -> Self {
        let template = template_or_default(DEFAULT_TEMPLATE_ID);
        Self {
            session_id,
            participant_id,
            board: CardBoard::new(template.columns.clone()),
            ledger: VoteLedger::new(template.max_votes_per_person),
            template,
            session: None,
            completed: false,
            timer: TimerClock::default(),
            actions: Vec::new(),
            connection: ConnectionStatus::Connecting,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn session(&self) -> Option<&RetroSession> {
        self.session.as_ref()
    }

    pub fn template(&self) -> &RetroTemplate {
        &self.template
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn board(&self) -> &CardBoard {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut CardBoard {
        &mut self.board
    }

    pub fn ledger(&self) -> &VoteLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut VoteLedger {
        &mut self.ledger
    }

    pub fn timer(&self) -> &TimerClock {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut TimerClock {
        &mut self.timer
    }

    pub fn actions(&self) -> &[ActionItem] {
        &self.actions
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.connection
    }

    /// Returns true when the status changed.
    pub fn set_connection(&mut self, status: ConnectionStatus) -> bool {
        let changed = self.connection != status;
        self.connection = status;
        changed
    }

    /// Replaces everything with freshly fetched rows. Returns true if this
    /// load observed the session becoming completed.
    pub fn load(&mut self, snapshot: FullSnapshot) -> bool {
        let FullSnapshot {
            session,
            cards,
            votes,
            actions,
        } = snapshot;
        if self.template.id != session.template_id {
            self.template = template_or_default(&session.template_id);
            self.board.set_columns(self.template.columns.clone());
            self.ledger
                .set_max_votes_per_person(self.template.max_votes_per_person);
        }
        self.board.replace_confirmed(cards);
        self.ledger.replace_confirmed(votes);
        self.actions = actions;
        self.set_session(session)
    }

    /// Optimistic completion before the write-back is confirmed.
    pub fn mark_completed(&mut self) -> bool {
        let was = self.completed;
        self.completed = true;
        !was
    }

    /// Restores the completion flag from the last authoritative row.
    pub fn restore_completion(&mut self) {
        self.completed = self
            .session
            .as_ref()
            .is_some_and(|session| session.status.is_completed());
    }

    fn set_session(&mut self, session: RetroSession) -> bool {
        if let Some(current) = &self.session {
            if session.version < current.version {
                return false;
            }
        }
        self.timer.apply_remote(session.timer);
        // Completion is one-way.
        let completed_now = session.status == SessionStatus::Completed && !self.completed;
        if session.status.is_completed() {
            self.completed = true;
        }
        self.session = Some(session);
        completed_now
    }

    pub fn push_action(&mut self, action: ActionItem) {
        if !self.actions.iter().any(|a| a.id == action.id) {
            self.actions.push(action);
        }
    }

    pub fn remove_action(&mut self, action_id: shared::domain::ActionId) -> Option<ActionItem> {
        let index = self.actions.iter().position(|a| a.id == action_id)?;
        Some(self.actions.remove(index))
    }

    /// Routes one change event. Events for other sessions are ignored; rows
    /// that fail to decode are reported and leave state untouched.
    pub fn apply_change(&mut self, event: &ChangeEvent) -> Result<Applied, RetroError> {
        if event.session_id != self.session_id {
            return Ok(Applied::Ignored);
        }
        let malformed = |err: serde_json::Error| RetroError::MalformedEvent {
            table: event.table,
            reason: err.to_string(),
        };
        match (event.table, event.kind) {
            (Table::Cards, ChangeKind::Insert | ChangeKind::Update) => {
                let card: Card = event.decode_row().map_err(malformed)?;
                if card.session_id != self.session_id {
                    return Ok(Applied::Ignored);
                }
                self.board.apply_upsert(card);
                Ok(Applied::Board)
            }
            (Table::Cards, ChangeKind::Delete) => {
                let key: CardKey = event.decode_row().map_err(malformed)?;
                self.board.apply_delete(key.id);
                self.ledger.forget_card(key.id);
                Ok(Applied::Board)
            }
            (Table::Votes, ChangeKind::Insert | ChangeKind::Update) => {
                let vote: Vote = event.decode_row().map_err(malformed)?;
                self.ledger.apply_insert(&vote);
                Ok(Applied::Board)
            }
            (Table::Votes, ChangeKind::Delete) => {
                let key: VoteKey = event.decode_row().map_err(malformed)?;
                self.ledger.apply_delete(key.card_id, &key.participant_id);
                Ok(Applied::Board)
            }
            (Table::Sessions, ChangeKind::Insert | ChangeKind::Update) => {
                let session: RetroSession = event.decode_row().map_err(malformed)?;
                if session.id != self.session_id {
                    return Ok(Applied::Ignored);
                }
                let completed_now = self.set_session(session);
                Ok(Applied::Session { completed_now })
            }
            (Table::Sessions, ChangeKind::Delete) => Ok(Applied::Ignored),
        }
    }

    pub fn snapshot(&self, now_ms: i64) -> BoardSnapshot {
        let confidential = self
            .session
            .as_ref()
            .map(|s| s.metadata.confidential)
            .unwrap_or_default();
        let votes_hidden = confidential.hide_votes_until_complete && !self.completed;
        let columns = self
            .board
            .columns()
            .iter()
            .map(|column| ColumnView {
                column: column.clone(),
                cards: self
                    .board
                    .cards_in_column(&column.id)
                    .into_iter()
                    .map(|card| {
                        let mine = card.author_id == self.participant_id;
                        CardView {
                            id: card.id,
                            content: card.content.clone(),
                            author_name: if confidential.anonymous_cards && !mine {
                                None
                            } else {
                                Some(card.author_name.clone())
                            },
                            color: card.color.clone(),
                            votes: self.ledger.votes_for_card(card.id),
                            voted_by_me: self.ledger.has_voted(card.id, &self.participant_id),
                            mine,
                            pending: self.board.is_pending(card.id),
                        }
                    })
                    .collect(),
            })
            .collect();
        let remaining = self.timer.remaining(now_ms);
        BoardSnapshot {
            title: self.session.as_ref().map(|s| s.title.clone()).unwrap_or_default(),
            completed: self.completed,
            columns,
            votes_hidden,
            votes_remaining: self.ledger.remaining_votes(&self.participant_id),
            max_votes_per_person: self.ledger.max_votes_per_person(),
            timer: TimerView {
                remaining_seconds: remaining,
                display: format_mm_ss(remaining),
                phase: self.timer.phase(now_ms),
            },
            recommendations: self
                .session
                .as_ref()
                .map(|s| s.metadata.recommendations.clone())
                .unwrap_or_default(),
            actions: self.actions.clone(),
            connection: self.connection,
        }
    }
}

/// Render model handed to presentation.
#[derive(Debug, Clone)]
pub struct BoardSnapshot {
    pub title: String,
    pub completed: bool,
    pub columns: Vec<ColumnView>,
    /// Counts are computed either way; presentation hides them when set.
    pub votes_hidden: bool,
    pub votes_remaining: u32,
    pub max_votes_per_person: u32,
    pub timer: TimerView,
    pub recommendations: Vec<String>,
    pub actions: Vec<ActionItem>,
    pub connection: ConnectionStatus,
}

impl BoardSnapshot {
    pub fn card(&self, card_id: CardId) -> Option<&CardView> {
        self.columns
            .iter()
            .flat_map(|column| column.cards.iter())
            .find(|card| card.id == card_id)
    }
}

#[derive(Debug, Clone)]
pub struct ColumnView {
    pub column: ColumnDef,
    pub cards: Vec<CardView>,
}

#[derive(Debug, Clone)]
pub struct CardView {
    pub id: CardId,
    pub content: String,
    /// `None` on anonymous boards for cards written by others.
    pub author_name: Option<String>,
    pub color: Option<String>,
    pub votes: u32,
    pub voted_by_me: bool,
    pub mine: bool,
    pub pending: bool,
}

#[derive(Debug, Clone)]
pub struct TimerView {
    pub remaining_seconds: u32,
    pub display: String,
    pub phase: TimerPhase,
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;
