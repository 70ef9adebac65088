use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ActionId, ActionItem, Card, CardId, ParticipantId, RetroSession, SessionId, Vote},
    error::{ApiError, ErrorCode},
    protocol::{CardPatch, CreateActionRequest, CreateCardRequest, SessionPatch, VoteRequest},
};

use crate::error::StoreError;

/// Shared record store the controller writes through.
///
/// Writes only report success or failure; the resulting rows reach the board
/// through the change feed like everyone else's.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_session(&self, session_id: SessionId) -> Result<RetroSession, StoreError>;
    async fn update_session(
        &self,
        session_id: SessionId,
        patch: SessionPatch,
    ) -> Result<RetroSession, StoreError>;
    async fn list_cards(&self, session_id: SessionId) -> Result<Vec<Card>, StoreError>;
    async fn create_card(&self, req: CreateCardRequest) -> Result<Card, StoreError>;
    async fn update_card(&self, card_id: CardId, patch: CardPatch) -> Result<Card, StoreError>;
    async fn delete_card(
        &self,
        card_id: CardId,
        participant_id: &ParticipantId,
    ) -> Result<(), StoreError>;
    async fn list_votes(&self, session_id: SessionId) -> Result<Vec<Vote>, StoreError>;
    /// `None` when the participant already voted for the card.
    async fn create_vote(
        &self,
        card_id: CardId,
        participant_id: &ParticipantId,
    ) -> Result<Option<Vote>, StoreError>;
    async fn delete_vote(
        &self,
        card_id: CardId,
        participant_id: &ParticipantId,
    ) -> Result<(), StoreError>;
    async fn list_actions(&self, session_id: SessionId) -> Result<Vec<ActionItem>, StoreError>;
    async fn create_action(&self, req: CreateActionRequest) -> Result<ActionItem, StoreError>;
    async fn delete_action(&self, action_id: ActionId) -> Result<(), StoreError>;
}

/// [`RecordStore`] backed by the retro server's HTTP API.
#[derive(Clone)]
pub struct HttpRecordStore {
    http: Client,
    base_url: String,
}

impl HttpRecordStore {
    pub fn new(server_url: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn unavailable(err: reqwest::Error) -> StoreError {
    StoreError::Unavailable(anyhow!(err))
}

/// Maps non-success responses to the server's `ApiError` body, falling back
/// to the status code when the body is not one.
async fn check(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if let Ok(api) = serde_json::from_str::<ApiError>(&body) {
        return Err(StoreError::Rejected(api));
    }
    let code = match status.as_u16() {
        403 => ErrorCode::Forbidden,
        404 => ErrorCode::NotFound,
        400 | 413 | 422 => ErrorCode::Validation,
        409 => ErrorCode::Conflict,
        429 => ErrorCode::RateLimited,
        _ => ErrorCode::Internal,
    };
    Err(StoreError::Rejected(ApiError::new(
        code,
        format!("request failed with status {status}"),
    )))
}

async fn json<T: DeserializeOwned>(response: Response) -> Result<T, StoreError> {
    let response = check(response).await?;
    response
        .json()
        .await
        .context("failed to decode record store response")
        .map_err(StoreError::Unavailable)
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn get_session(&self, session_id: SessionId) -> Result<RetroSession, StoreError> {
        let response = self
            .http
            .get(self.url(&format!("/sessions/{session_id}")))
            .send()
            .await
            .map_err(unavailable)?;
        json(response).await
    }

    async fn update_session(
        &self,
        session_id: SessionId,
        patch: SessionPatch,
    ) -> Result<RetroSession, StoreError> {
        let response = self
            .http
            .patch(self.url(&format!("/sessions/{session_id}")))
            .json(&patch)
            .send()
            .await
            .map_err(unavailable)?;
        json(response).await
    }

    async fn list_cards(&self, session_id: SessionId) -> Result<Vec<Card>, StoreError> {
        let response = self
            .http
            .get(self.url(&format!("/sessions/{session_id}/cards")))
            .send()
            .await
            .map_err(unavailable)?;
        json(response).await
    }

    async fn create_card(&self, req: CreateCardRequest) -> Result<Card, StoreError> {
        let response = self
            .http
            .post(self.url("/cards"))
            .json(&req)
            .send()
            .await
            .map_err(unavailable)?;
        json(response).await
    }

    async fn update_card(&self, card_id: CardId, patch: CardPatch) -> Result<Card, StoreError> {
        let response = self
            .http
            .patch(self.url(&format!("/cards/{card_id}")))
            .json(&patch)
            .send()
            .await
            .map_err(unavailable)?;
        json(response).await
    }

    async fn delete_card(
        &self,
        card_id: CardId,
        participant_id: &ParticipantId,
    ) -> Result<(), StoreError> {
        let response = self
            .http
            .delete(self.url(&format!("/cards/{card_id}")))
            .query(&[("participant_id", participant_id.as_str())])
            .send()
            .await
            .map_err(unavailable)?;
        check(response).await.map(|_| ())
    }

    async fn list_votes(&self, session_id: SessionId) -> Result<Vec<Vote>, StoreError> {
        let response = self
            .http
            .get(self.url(&format!("/sessions/{session_id}/votes")))
            .send()
            .await
            .map_err(unavailable)?;
        json(response).await
    }

    async fn create_vote(
        &self,
        card_id: CardId,
        participant_id: &ParticipantId,
    ) -> Result<Option<Vote>, StoreError> {
        let response = self
            .http
            .post(self.url("/votes"))
            .json(&VoteRequest {
                card_id,
                participant_id: participant_id.clone(),
            })
            .send()
            .await
            .map_err(unavailable)?;
        json(response).await
    }

    async fn delete_vote(
        &self,
        card_id: CardId,
        participant_id: &ParticipantId,
    ) -> Result<(), StoreError> {
        let card_id = card_id.to_string();
        let response = self
            .http
            .delete(self.url("/votes"))
            .query(&[
                ("card_id", card_id.as_str()),
                ("participant_id", participant_id.as_str()),
            ])
            .send()
            .await
            .map_err(unavailable)?;
        check(response).await.map(|_| ())
    }

    async fn list_actions(&self, session_id: SessionId) -> Result<Vec<ActionItem>, StoreError> {
        let response = self
            .http
            .get(self.url(&format!("/sessions/{session_id}/actions")))
            .send()
            .await
            .map_err(unavailable)?;
        json(response).await
    }

    async fn create_action(&self, req: CreateActionRequest) -> Result<ActionItem, StoreError> {
        let response = self
            .http
            .post(self.url("/actions"))
            .json(&req)
            .send()
            .await
            .map_err(unavailable)?;
        json(response).await
    }

    async fn delete_action(&self, action_id: ActionId) -> Result<(), StoreError> {
        let response = self
            .http
            .delete(self.url(&format!("/actions/{action_id}")))
            .send()
            .await
            .map_err(unavailable)?;
        check(response).await.map(|_| ())
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
