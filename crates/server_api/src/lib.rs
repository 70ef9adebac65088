use chrono::Utc;
use shared::{
    domain::{
        ActionId, ActionItem, Card, CardId, ParticipantId, RetroSession, SessionId, SessionStatus,
        Vote,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        CardPatch, ChangeKind, CreateActionRequest, CreateCardRequest, CreateSessionRequest,
        SessionPatch, Table,
    },
    template::{builtin_templates, find_template, RetroTemplate, DEFAULT_TEMPLATE_ID},
};
use storage::{Storage, VoteInsert};
use tracing::{debug, info};

mod feed;

pub use feed::ChangeFeed;

pub const MAX_CARD_CONTENT_CHARS: usize = 2_000;
pub const MAX_TITLE_CHARS: usize = 200;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub feed: ChangeFeed,
}

pub fn list_templates() -> Vec<RetroTemplate> {
    builtin_templates()
}

pub async fn create_session(
    ctx: &ApiContext,
    req: CreateSessionRequest,
) -> Result<RetroSession, ApiError> {
    let title = validate_text(&req.title, "title", MAX_TITLE_CHARS)?;
    let template_id = req
        .template_id
        .as_deref()
        .unwrap_or(DEFAULT_TEMPLATE_ID)
        .to_string();
    if find_template(&template_id).is_none() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("unknown template '{template_id}'"),
        ));
    }
    let session = ctx
        .storage
        .create_session(&title, &template_id, &req.metadata)
        .await
        .map_err(internal)?;
    info!(session_id = %session.id, %template_id, "retro session created");
    Ok(session)
}

pub async fn get_session(ctx: &ApiContext, session_id: SessionId) -> Result<RetroSession, ApiError> {
    ctx.storage
        .get_session(session_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "session not found"))
}

pub async fn update_session(
    ctx: &ApiContext,
    session_id: SessionId,
    patch: SessionPatch,
) -> Result<RetroSession, ApiError> {
    if patch.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "empty session patch"));
    }
    if let Some(timer) = &patch.timer {
        if !timer.is_consistent() {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "running timer requires a start timestamp",
            ));
        }
        if timer.seconds >= 60 {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "timer seconds must be below 60",
            ));
        }
    }
    let patch = SessionPatch {
        title: patch
            .title
            .as_deref()
            .map(|title| validate_text(title, "title", MAX_TITLE_CHARS))
            .transpose()?,
        ..patch
    };

    let _guard = ctx.feed.write_guard().await;
    let current = get_session(ctx, session_id).await?;
    if current.status.is_completed() && patch.status == Some(SessionStatus::InProgress) {
        return Err(ApiError::new(
            ErrorCode::Conflict,
            "completed sessions cannot be reopened",
        ));
    }
    let patch = match patch.if_timer {
        Some(expected) if expected != current.timer => {
            debug!(%session_id, "timer re-armed since the write was issued; keeping it");
            SessionPatch {
                timer: None,
                if_timer: None,
                ..patch
            }
        }
        _ => patch,
    };
    if patch.is_empty() {
        return Ok(current);
    }
    let updated = ctx
        .storage
        .update_session(session_id, &patch)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "session not found"))?;
    if !current.status.is_completed() && updated.status.is_completed() {
        info!(%session_id, "retro session completed");
    }
    ctx.feed
        .publish(session_id, Table::Sessions, ChangeKind::Update, &updated);
    Ok(updated)
}

pub async fn list_cards(ctx: &ApiContext, session_id: SessionId) -> Result<Vec<Card>, ApiError> {
    get_session(ctx, session_id).await?;
    ctx.storage.list_cards(session_id).await.map_err(internal)
}

pub async fn create_card(ctx: &ApiContext, req: CreateCardRequest) -> Result<Card, ApiError> {
    let content = validate_text(&req.content, "content", MAX_CARD_CONTENT_CHARS)?;
    let author_name = validate_text(&req.author_name, "author name", MAX_TITLE_CHARS)?;

    let _guard = ctx.feed.write_guard().await;
    let session = ensure_in_progress(ctx, req.session_id).await?;
    let template = template_for(&session)?;
    if !template.has_column(&req.column_id) {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("column '{}' is not part of this retro", req.column_id),
        ));
    }
    if ctx
        .storage
        .get_card(req.id)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err(ApiError::new(ErrorCode::Validation, "card id already used"));
    }

    let now = Utc::now();
    let card = ctx
        .storage
        .insert_card(&Card {
            id: req.id,
            session_id: req.session_id,
            column_id: req.column_id,
            author_id: req.author_id,
            author_name,
            content,
            color: req.color,
            created_at: now,
            updated_at: now,
        })
        .await
        .map_err(internal)?;
    ctx.feed
        .publish(card.session_id, Table::Cards, ChangeKind::Insert, &card);
    Ok(card)
}

pub async fn update_card(
    ctx: &ApiContext,
    card_id: CardId,
    patch: CardPatch,
) -> Result<Card, ApiError> {
    let content = patch
        .content
        .as_deref()
        .map(|content| validate_text(content, "content", MAX_CARD_CONTENT_CHARS))
        .transpose()?;

    let _guard = ctx.feed.write_guard().await;
    let existing = load_card_for_author(ctx, card_id, &patch.participant_id).await?;
    let card = ctx
        .storage
        .update_card(existing.id, content.as_deref(), patch.color.as_deref())
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "card not found"))?;
    ctx.feed
        .publish(card.session_id, Table::Cards, ChangeKind::Update, &card);
    Ok(card)
}

/// Removes a card and, ahead of it, every vote that referenced it.
pub async fn delete_card(
    ctx: &ApiContext,
    card_id: CardId,
    participant_id: &ParticipantId,
) -> Result<(), ApiError> {
    let _guard = ctx.feed.write_guard().await;
    load_card_for_author(ctx, card_id, participant_id).await?;
    let Some(deleted) = ctx.storage.delete_card(card_id).await.map_err(internal)? else {
        return Err(ApiError::new(ErrorCode::NotFound, "card not found"));
    };
    for vote in &deleted.votes {
        ctx.feed
            .publish(vote.session_id, Table::Votes, ChangeKind::Delete, vote);
    }
    ctx.feed.publish(
        deleted.card.session_id,
        Table::Cards,
        ChangeKind::Delete,
        &deleted.card,
    );
    Ok(())
}

pub async fn list_votes(ctx: &ApiContext, session_id: SessionId) -> Result<Vec<Vote>, ApiError> {
    get_session(ctx, session_id).await?;
    ctx.storage.list_votes(session_id).await.map_err(internal)
}

/// Casts a vote. `Ok(None)` means the vote already existed.
pub async fn cast_vote(
    ctx: &ApiContext,
    card_id: CardId,
    participant_id: &ParticipantId,
) -> Result<Option<Vote>, ApiError> {
    let _guard = ctx.feed.write_guard().await;
    let card = ctx
        .storage
        .get_card(card_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "card not found"))?;
    let session = ensure_in_progress(ctx, card.session_id).await?;
    let cap = template_for(&session)?.max_votes_per_person;

    match ctx
        .storage
        .insert_vote_capped(card_id, participant_id, cap)
        .await
        .map_err(internal)?
    {
        VoteInsert::Inserted(vote) => {
            ctx.feed
                .publish(vote.session_id, Table::Votes, ChangeKind::Insert, &vote);
            Ok(Some(vote))
        }
        VoteInsert::AlreadyExists => Ok(None),
        VoteInsert::CapReached { held } => Err(ApiError::new(
            ErrorCode::RateLimited,
            format!("vote limit reached ({held} of {cap} used)"),
        )),
        VoteInsert::UnknownCard => Err(ApiError::new(ErrorCode::NotFound, "card not found")),
    }
}

/// Withdraws a vote. Missing votes are not an error.
pub async fn remove_vote(
    ctx: &ApiContext,
    card_id: CardId,
    participant_id: &ParticipantId,
) -> Result<Option<Vote>, ApiError> {
    let _guard = ctx.feed.write_guard().await;
    if let Some(card) = ctx.storage.get_card(card_id).await.map_err(internal)? {
        ensure_in_progress(ctx, card.session_id).await?;
    }
    let removed = ctx
        .storage
        .delete_vote(card_id, participant_id)
        .await
        .map_err(internal)?;
    if let Some(vote) = &removed {
        ctx.feed
            .publish(vote.session_id, Table::Votes, ChangeKind::Delete, vote);
    }
    Ok(removed)
}

pub async fn list_actions(
    ctx: &ApiContext,
    session_id: SessionId,
) -> Result<Vec<ActionItem>, ApiError> {
    get_session(ctx, session_id).await?;
    ctx.storage.list_actions(session_id).await.map_err(internal)
}

pub async fn create_action(
    ctx: &ApiContext,
    req: CreateActionRequest,
) -> Result<ActionItem, ApiError> {
    let title = validate_text(&req.title, "title", MAX_TITLE_CHARS)?;
    get_session(ctx, req.session_id).await?;
    ctx.storage
        .insert_action(req.session_id, &title, req.assignee.as_deref())
        .await
        .map_err(internal)
}

pub async fn delete_action(ctx: &ApiContext, action_id: ActionId) -> Result<(), ApiError> {
    ctx.storage
        .delete_action(action_id)
        .await
        .map_err(internal)?
        .map(|_| ())
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "action not found"))
}

async fn ensure_in_progress(
    ctx: &ApiContext,
    session_id: SessionId,
) -> Result<RetroSession, ApiError> {
    let session = get_session(ctx, session_id).await?;
    if session.status.is_completed() {
        return Err(ApiError::new(
            ErrorCode::Conflict,
            "retro is completed; the board is read-only",
        ));
    }
    Ok(session)
}

async fn load_card_for_author(
    ctx: &ApiContext,
    card_id: CardId,
    participant_id: &ParticipantId,
) -> Result<Card, ApiError> {
    let card = ctx
        .storage
        .get_card(card_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "card not found"))?;
    if &card.author_id != participant_id {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the author may change this card",
        ));
    }
    Ok(card)
}

fn template_for(session: &RetroSession) -> Result<RetroTemplate, ApiError> {
    find_template(&session.template_id).ok_or_else(|| {
        ApiError::internal(format!(
            "session {} references unknown template '{}'",
            session.id, session.template_id
        ))
    })
}

fn validate_text(raw: &str, field: &str, max_chars: usize) -> Result<String, ApiError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("{field} cannot be empty"),
        ));
    }
    if trimmed.chars().count() > max_chars {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("{field} exceeds {max_chars} characters"),
        ));
    }
    Ok(trimmed.to_string())
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
