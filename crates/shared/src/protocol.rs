use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    domain::{CardId, ParticipantId, SessionId, SessionMetadata, SessionStatus, TimerState},
    error::ApiError,
};

/// Record tables that publish change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Cards,
    Votes,
    Sessions,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Cards => "cards",
            Table::Votes => "votes",
            Table::Sessions => "sessions",
        }
    }
}

impl std::str::FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cards" => Ok(Table::Cards),
            "votes" => Ok(Table::Votes),
            "sessions" => Ok(Table::Sessions),
            other => Err(format!("unknown table '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A committed change to one row, fanned out to every subscriber of
/// `(session_id, table)`. Delete events carry the row as it was before removal.
///
/// `row` stays untyped on the wire so a consumer can reject a malformed
/// payload without failing the whole frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub session_id: SessionId,
    pub table: Table,
    pub kind: ChangeKind,
    pub row: serde_json::Value,
    /// Monotonic commit sequence assigned by the publisher.
    pub seq: u64,
}

impl ChangeEvent {
    pub fn decode_row<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.row)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Subscribed { session_id: SessionId, table: Table },
    Change(ChangeEvent),
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub title: String,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub metadata: SessionMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCardRequest {
    pub id: CardId,
    pub session_id: SessionId,
    pub column_id: String,
    pub author_id: ParticipantId,
    pub author_name: String,
    pub content: String,
    #[serde(default)]
    pub color: Option<String>,
}

/// Card edits are author-only, so the patch names who is asking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardPatch {
    pub participant_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantQuery {
    pub participant_id: ParticipantId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub card_id: CardId,
    pub participant_id: ParticipantId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer: Option<TimerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
    /// When set, `timer` is only written if the stored timer still equals this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_timer: Option<TimerState>,
}

impl SessionPatch {
    pub fn timer(timer: TimerState) -> Self {
        Self {
            timer: Some(timer),
            ..Self::default()
        }
    }

    /// Replaces the timer unless someone re-armed it after `expected` was read.
    pub fn timer_if_unchanged(expected: TimerState, timer: TimerState) -> Self {
        Self {
            timer: Some(timer),
            if_timer: Some(expected),
            ..Self::default()
        }
    }

    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.status.is_none() && self.timer.is_none() && self.metadata.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateActionRequest {
    pub session_id: SessionId,
    pub title: String,
    #[serde(default)]
    pub assignee: Option<String>,
}
