use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_newtype!(SessionId);
id_newtype!(CardId);
id_newtype!(ActionId);

/// Participants are identified by whatever the (external) auth layer hands us.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    InProgress,
    Completed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "in_progress" => Some(SessionStatus::InProgress),
            "completed" => Some(SessionStatus::Completed),
            _ => None,
        }
    }

    pub fn is_completed(self) -> bool {
        self == SessionStatus::Completed
    }
}

/// Authoritative countdown state as persisted on the session row.
///
/// While `is_running` is set, `start_timestamp` (unix millis) marks the
/// instant the `minutes`/`seconds` budget started draining. Remaining time is
/// always derived from it; nobody decrements these fields tick by tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub minutes: u32,
    pub seconds: u32,
    pub is_running: bool,
    #[serde(default)]
    pub start_timestamp: Option<i64>,
}

impl TimerState {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn from_total_seconds(total: u32, is_running: bool, start_timestamp: Option<i64>) -> Self {
        Self {
            minutes: total / 60,
            seconds: total % 60,
            is_running,
            start_timestamp,
        }
    }

    pub fn total_seconds(&self) -> u32 {
        self.minutes.saturating_mul(60).saturating_add(self.seconds)
    }

    /// A running timer must carry its start instant.
    pub fn is_consistent(&self) -> bool {
        !self.is_running || self.start_timestamp.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfidentialSettings {
    #[serde(default)]
    pub anonymous_cards: bool,
    #[serde(default)]
    pub hide_votes_until_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub confidential: ConfidentialSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetroSession {
    pub id: SessionId,
    pub template_id: String,
    pub title: String,
    pub status: SessionStatus,
    pub timer: TimerState,
    #[serde(default)]
    pub metadata: SessionMetadata,
    /// Bumped by the record store on every write to the session row.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub session_id: SessionId,
    pub column_id: String,
    pub author_id: ParticipantId,
    pub author_name: String,
    pub content: String,
    #[serde(default)]
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vote {
    pub session_id: SessionId,
    pub card_id: CardId,
    pub participant_id: ParticipantId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionItem {
    pub id: ActionId,
    pub session_id: SessionId,
    pub title: String,
    #[serde(default)]
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
}
