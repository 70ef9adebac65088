use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::{
    domain::{
        ActionId, ActionItem, Card, CardId, ParticipantId, RetroSession, SessionId,
        SessionMetadata, SessionStatus, TimerState, Vote,
    },
    protocol::SessionPatch,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Outcome of a capped vote insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteInsert {
    Inserted(Vote),
    AlreadyExists,
    CapReached { held: u32 },
    UnknownCard,
}

/// A removed card together with the votes that went with it.
#[derive(Debug, Clone)]
pub struct DeletedCard {
    pub card: Card,
    pub votes: Vec<Vote>,
}

const SESSION_COLUMNS: &str = "id, template_id, title, status, timer_minutes, timer_seconds, timer_running, timer_start_ms, metadata, version, created_at, updated_at";
const CARD_COLUMNS: &str =
    "id, session_id, column_id, author_id, author_name, content, color, created_at, updated_at";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to `sqlite::memory:` opens its own empty database.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!(%database_url, "storage ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_session(
        &self,
        title: &str,
        template_id: &str,
        metadata: &SessionMetadata,
    ) -> Result<RetroSession> {
        let id = SessionId::new();
        let now = Utc::now();
        let metadata = serde_json::to_string(metadata).context("failed to encode metadata")?;
        let row = sqlx::query(&format!(
            "INSERT INTO retro_sessions (id, template_id, title, status, metadata, version, created_at, updated_at)
             VALUES (?, ?, ?, 'in_progress', ?, 1, ?, ?)
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(id.to_string())
        .bind(template_id)
        .bind(title)
        .bind(metadata)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        session_from_row(&row)
    }

    pub async fn get_session(&self, session_id: SessionId) -> Result<Option<RetroSession>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM retro_sessions WHERE id = ?"
        ))
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    pub async fn list_sessions(&self) -> Result<Vec<RetroSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM retro_sessions ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    /// Applies `patch` and bumps the row version. Returns `None` for an unknown session.
    pub async fn update_session(
        &self,
        session_id: SessionId,
        patch: &SessionPatch,
    ) -> Result<Option<RetroSession>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM retro_sessions WHERE id = ?"
        ))
        .bind(session_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut session = session_from_row(&row)?;

        if let Some(title) = &patch.title {
            session.title = title.clone();
        }
        if let Some(status) = patch.status {
            session.status = status;
        }
        if let Some(timer) = patch.timer {
            session.timer = timer;
        }
        if let Some(metadata) = &patch.metadata {
            session.metadata = metadata.clone();
        }
        session.version += 1;
        session.updated_at = Utc::now();

        let metadata =
            serde_json::to_string(&session.metadata).context("failed to encode metadata")?;
        sqlx::query(
            "UPDATE retro_sessions
             SET title = ?, status = ?, timer_minutes = ?, timer_seconds = ?, timer_running = ?,
                 timer_start_ms = ?, metadata = ?, version = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&session.title)
        .bind(session.status.as_str())
        .bind(session.timer.minutes)
        .bind(session.timer.seconds)
        .bind(session.timer.is_running)
        .bind(session.timer.start_timestamp)
        .bind(metadata)
        .bind(i64::try_from(session.version).unwrap_or(i64::MAX))
        .bind(session.updated_at)
        .bind(session_id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(session))
    }

    pub async fn list_cards(&self, session_id: SessionId) -> Result<Vec<Card>> {
        let rows = sqlx::query(&format!(
            "SELECT {CARD_COLUMNS} FROM retro_cards WHERE session_id = ? ORDER BY created_at ASC, id ASC"
        ))
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(card_from_row).collect()
    }

    pub async fn get_card(&self, card_id: CardId) -> Result<Option<Card>> {
        let row = sqlx::query(&format!(
            "SELECT {CARD_COLUMNS} FROM retro_cards WHERE id = ?"
        ))
        .bind(card_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(card_from_row).transpose()
    }

    pub async fn insert_card(&self, card: &Card) -> Result<Card> {
        let row = sqlx::query(&format!(
            "INSERT INTO retro_cards (id, session_id, column_id, author_id, author_name, content, color, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {CARD_COLUMNS}"
        ))
        .bind(card.id.to_string())
        .bind(card.session_id.to_string())
        .bind(&card.column_id)
        .bind(card.author_id.as_str())
        .bind(&card.author_name)
        .bind(&card.content)
        .bind(card.color.as_deref())
        .bind(card.created_at)
        .bind(card.updated_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to insert card {}", card.id))?;
        card_from_row(&row)
    }

    pub async fn update_card(
        &self,
        card_id: CardId,
        content: Option<&str>,
        color: Option<&str>,
    ) -> Result<Option<Card>> {
        let row = sqlx::query(&format!(
            "UPDATE retro_cards
             SET content = COALESCE(?, content), color = COALESCE(?, color), updated_at = ?
             WHERE id = ?
             RETURNING {CARD_COLUMNS}"
        ))
        .bind(content)
        .bind(color)
        .bind(Utc::now())
        .bind(card_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(card_from_row).transpose()
    }

    /// Deletes a card and its votes in one transaction.
    pub async fn delete_card(&self, card_id: CardId) -> Result<Option<DeletedCard>> {
        let mut tx = self.pool.begin().await?;
        let vote_rows = sqlx::query(
            "DELETE FROM retro_votes WHERE card_id = ?
             RETURNING session_id, card_id, participant_id, created_at",
        )
        .bind(card_id.to_string())
        .fetch_all(&mut *tx)
        .await?;
        let card_row = sqlx::query(&format!(
            "DELETE FROM retro_cards WHERE id = ? RETURNING {CARD_COLUMNS}"
        ))
        .bind(card_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(card_row) = card_row else {
            return Ok(None);
        };
        let deleted = DeletedCard {
            card: card_from_row(&card_row)?,
            votes: vote_rows.iter().map(vote_from_row).collect::<Result<_>>()?,
        };
        tx.commit().await?;
        Ok(Some(deleted))
    }

    pub async fn list_votes(&self, session_id: SessionId) -> Result<Vec<Vote>> {
        let rows = sqlx::query(
            "SELECT session_id, card_id, participant_id, created_at
             FROM retro_votes WHERE session_id = ? ORDER BY created_at ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(vote_from_row).collect()
    }

    pub async fn count_votes_for_participant(
        &self,
        session_id: SessionId,
        participant_id: &ParticipantId,
    ) -> Result<u32> {
        let held: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM retro_votes WHERE session_id = ? AND participant_id = ?",
        )
        .bind(session_id.to_string())
        .bind(participant_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(held).unwrap_or(u32::MAX))
    }

    /// Inserts a vote only while the participant holds fewer than `cap` votes
    /// in the card's session. The count check and the insert are one statement.
    pub async fn insert_vote_capped(
        &self,
        card_id: CardId,
        participant_id: &ParticipantId,
        cap: u32,
    ) -> Result<VoteInsert> {
        let mut tx = self.pool.begin().await?;
        let session_id: Option<String> =
            sqlx::query_scalar("SELECT session_id FROM retro_cards WHERE id = ?")
                .bind(card_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(session_id) = session_id else {
            return Ok(VoteInsert::UnknownCard);
        };

        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM retro_votes WHERE card_id = ? AND participant_id = ?",
        )
        .bind(card_id.to_string())
        .bind(participant_id.as_str())
        .fetch_one(&mut *tx)
        .await?;
        if existing > 0 {
            return Ok(VoteInsert::AlreadyExists);
        }

        let now = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO retro_votes (session_id, card_id, participant_id, created_at)
             SELECT ?1, ?2, ?3, ?4
             WHERE (SELECT COUNT(*) FROM retro_votes WHERE session_id = ?1 AND participant_id = ?3) < ?5
             ON CONFLICT(card_id, participant_id) DO NOTHING
             RETURNING session_id, card_id, participant_id, created_at",
        )
        .bind(&session_id)
        .bind(card_id.to_string())
        .bind(participant_id.as_str())
        .bind(now)
        .bind(cap)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match inserted {
            Some(row) => VoteInsert::Inserted(vote_from_row(&row)?),
            None => {
                let held: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM retro_votes WHERE session_id = ? AND participant_id = ?",
                )
                .bind(&session_id)
                .bind(participant_id.as_str())
                .fetch_one(&mut *tx)
                .await?;
                VoteInsert::CapReached {
                    held: u32::try_from(held).unwrap_or(u32::MAX),
                }
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn delete_vote(
        &self,
        card_id: CardId,
        participant_id: &ParticipantId,
    ) -> Result<Option<Vote>> {
        let row = sqlx::query(
            "DELETE FROM retro_votes WHERE card_id = ? AND participant_id = ?
             RETURNING session_id, card_id, participant_id, created_at",
        )
        .bind(card_id.to_string())
        .bind(participant_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(vote_from_row).transpose()
    }

    pub async fn list_actions(&self, session_id: SessionId) -> Result<Vec<ActionItem>> {
        let rows = sqlx::query(
            "SELECT id, session_id, title, assignee, created_at
             FROM retro_actions WHERE session_id = ? ORDER BY created_at ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(action_from_row).collect()
    }

    pub async fn insert_action(
        &self,
        session_id: SessionId,
        title: &str,
        assignee: Option<&str>,
    ) -> Result<ActionItem> {
        let row = sqlx::query(
            "INSERT INTO retro_actions (id, session_id, title, assignee, created_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id, session_id, title, assignee, created_at",
        )
        .bind(ActionId::new().to_string())
        .bind(session_id.to_string())
        .bind(title)
        .bind(assignee)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        action_from_row(&row)
    }

    pub async fn delete_action(&self, action_id: ActionId) -> Result<Option<ActionItem>> {
        let row = sqlx::query(
            "DELETE FROM retro_actions WHERE id = ?
             RETURNING id, session_id, title, assignee, created_at",
        )
        .bind(action_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(action_from_row).transpose()
    }
}

fn parse_id<T>(raw: &str, what: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|err| anyhow!("invalid {what} '{raw}' in storage: {err}"))
}

fn session_from_row(row: &SqliteRow) -> Result<RetroSession> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let metadata: String = row.try_get("metadata")?;
    let version: i64 = row.try_get("version")?;
    Ok(RetroSession {
        id: parse_id(&id, "session id")?,
        template_id: row.try_get("template_id")?,
        title: row.try_get("title")?,
        status: SessionStatus::parse(&status)
            .ok_or_else(|| anyhow!("invalid session status '{status}'"))?,
        timer: TimerState {
            minutes: row.try_get("timer_minutes")?,
            seconds: row.try_get("timer_seconds")?,
            is_running: row.try_get("timer_running")?,
            start_timestamp: row.try_get("timer_start_ms")?,
        },
        metadata: serde_json::from_str(&metadata).context("invalid session metadata")?,
        version: u64::try_from(version).unwrap_or_default(),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn card_from_row(row: &SqliteRow) -> Result<Card> {
    let id: String = row.try_get("id")?;
    let session_id: String = row.try_get("session_id")?;
    Ok(Card {
        id: parse_id(&id, "card id")?,
        session_id: parse_id(&session_id, "session id")?,
        column_id: row.try_get("column_id")?,
        author_id: ParticipantId(row.try_get("author_id")?),
        author_name: row.try_get("author_name")?,
        content: row.try_get("content")?,
        color: row.try_get("color")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn vote_from_row(row: &SqliteRow) -> Result<Vote> {
    let session_id: String = row.try_get("session_id")?;
    let card_id: String = row.try_get("card_id")?;
    Ok(Vote {
        session_id: parse_id(&session_id, "session id")?,
        card_id: parse_id(&card_id, "card id")?,
        participant_id: ParticipantId(row.try_get("participant_id")?),
        created_at: row.try_get("created_at")?,
    })
}

fn action_from_row(row: &SqliteRow) -> Result<ActionItem> {
    let id: String = row.try_get("id")?;
    let session_id: String = row.try_get("session_id")?;
    Ok(ActionItem {
        id: parse_id(&id, "action id")?,
        session_id: parse_id(&session_id, "session id")?,
        title: row.try_get("title")?,
        assignee: row.try_get("assignee")?,
        created_at: row.try_get("created_at")?,
    })
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
