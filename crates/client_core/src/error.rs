use shared::{
    domain::CardId,
    error::{ApiError, ErrorCode},
    protocol::Table,
};
use thiserror::Error;

/// Failures surfaced by the retro controller.
///
/// None of these are fatal: the worst case is a stale board that a reconnect
/// or refetch repairs.
#[derive(Debug, Error)]
pub enum RetroError {
    #[error("vote limit reached ({max} per person)")]
    VoteCapExceeded { max: u32 },
    #[error("not connected to the record store; the board may be stale")]
    TransportDisconnected,
    #[error("change rejected by the record store ({code:?}): {message}")]
    MutationRejected { code: ErrorCode, message: String },
    #[error("malformed {} event: {reason}", table.as_str())]
    MalformedEvent { table: Table, reason: String },
    #[error("only the author may change card {card_id}")]
    NotAuthor { card_id: CardId },
    #[error("retro is completed; the board is read-only")]
    SessionCompleted,
    #[error("card {0} is not on the board")]
    UnknownCard(CardId),
    #[error("column '{0}' is not part of this retro")]
    UnknownColumn(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Error returned by a [`crate::store::RecordStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store rejected request: {0}")]
    Rejected(ApiError),
    #[error("record store unreachable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

impl StoreError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            StoreError::Rejected(api) => Some(api.code),
            StoreError::Unavailable(_) => None,
        }
    }
}

impl From<StoreError> for RetroError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Rejected(api) => RetroError::MutationRejected {
                code: api.code,
                message: api.message,
            },
            StoreError::Unavailable(_) => RetroError::TransportDisconnected,
        }
    }
}
