use super::*;
use shared::template::DEFAULT_TEMPLATE_ID;

async fn seeded() -> (Storage, RetroSession) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let session = storage
        .create_session("Sprint 14", DEFAULT_TEMPLATE_ID, &SessionMetadata::default())
        .await
        .expect("session");
    (storage, session)
}

fn card(session_id: SessionId, author: &str, content: &str) -> Card {
    let now = Utc::now();
    Card {
        id: CardId::new(),
        session_id,
        column_id: "went_well".to_string(),
        author_id: ParticipantId::new(author),
        author_name: author.to_string(),
        content: content.to_string(),
        color: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("retro_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn new_session_starts_in_progress_with_idle_timer() {
    let (storage, session) = seeded().await;
    assert_eq!(session.status, SessionStatus::InProgress);
    assert_eq!(session.timer, TimerState::idle());
    assert_eq!(session.version, 1);

    let loaded = storage
        .get_session(session.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(loaded, session);
}

#[tokio::test]
async fn update_session_bumps_version_and_persists_timer() {
    let (storage, session) = seeded().await;
    let timer = TimerState {
        minutes: 5,
        seconds: 0,
        is_running: true,
        start_timestamp: Some(1_700_000_000_000),
    };
    let updated = storage
        .update_session(session.id, &SessionPatch::timer(timer))
        .await
        .expect("update")
        .expect("exists");
    assert_eq!(updated.version, 2);
    assert_eq!(updated.timer, timer);

    let reloaded = storage
        .get_session(session.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(reloaded.timer, timer);
    assert_eq!(reloaded.version, 2);
}

#[tokio::test]
async fn update_unknown_session_returns_none() {
    let (storage, _) = seeded().await;
    let missing = storage
        .update_session(SessionId::new(), &SessionPatch::status(SessionStatus::Completed))
        .await
        .expect("update");
    assert!(missing.is_none());
}

#[tokio::test]
async fn card_update_keeps_untouched_fields() {
    let (storage, session) = seeded().await;
    let mut original = card(session.id, "alice", "Ship faster");
    original.color = Some("green".to_string());
    storage.insert_card(&original).await.expect("insert");

    let updated = storage
        .update_card(original.id, Some("Ship even faster"), None)
        .await
        .expect("update")
        .expect("exists");
    assert_eq!(updated.content, "Ship even faster");
    assert_eq!(updated.color.as_deref(), Some("green"));
    assert_eq!(updated.author_id, original.author_id);
}

#[tokio::test]
async fn vote_cap_is_enforced_by_conditional_insert() {
    let (storage, session) = seeded().await;
    let voter = ParticipantId::new("bob");
    let mut cards = Vec::new();
    for i in 0..3 {
        let c = card(session.id, "alice", &format!("card {i}"));
        storage.insert_card(&c).await.expect("insert");
        cards.push(c);
    }

    let first = storage
        .insert_vote_capped(cards[0].id, &voter, 2)
        .await
        .expect("vote");
    assert!(matches!(first, VoteInsert::Inserted(_)));
    let again = storage
        .insert_vote_capped(cards[0].id, &voter, 2)
        .await
        .expect("vote");
    assert_eq!(again, VoteInsert::AlreadyExists);
    let second = storage
        .insert_vote_capped(cards[1].id, &voter, 2)
        .await
        .expect("vote");
    assert!(matches!(second, VoteInsert::Inserted(_)));
    let third = storage
        .insert_vote_capped(cards[2].id, &voter, 2)
        .await
        .expect("vote");
    assert_eq!(third, VoteInsert::CapReached { held: 2 });

    assert_eq!(
        storage
            .count_votes_for_participant(session.id, &voter)
            .await
            .expect("count"),
        2
    );
}

#[tokio::test]
async fn vote_on_unknown_card_is_reported() {
    let (storage, _) = seeded().await;
    let outcome = storage
        .insert_vote_capped(CardId::new(), &ParticipantId::new("bob"), 5)
        .await
        .expect("vote");
    assert_eq!(outcome, VoteInsert::UnknownCard);
}

#[tokio::test]
async fn deleting_card_removes_its_votes() {
    let (storage, session) = seeded().await;
    let c = card(session.id, "alice", "Flaky CI");
    storage.insert_card(&c).await.expect("insert");
    for voter in ["bob", "carol"] {
        storage
            .insert_vote_capped(c.id, &ParticipantId::new(voter), 5)
            .await
            .expect("vote");
    }

    let deleted = storage
        .delete_card(c.id)
        .await
        .expect("delete")
        .expect("existed");
    assert_eq!(deleted.card.id, c.id);
    assert_eq!(deleted.votes.len(), 2);
    assert!(storage.list_votes(session.id).await.expect("votes").is_empty());
    assert!(storage.delete_card(c.id).await.expect("delete").is_none());
}

#[tokio::test]
async fn delete_vote_returns_removed_row_once() {
    let (storage, session) = seeded().await;
    let c = card(session.id, "alice", "Pairing helped");
    storage.insert_card(&c).await.expect("insert");
    let voter = ParticipantId::new("bob");
    storage
        .insert_vote_capped(c.id, &voter, 5)
        .await
        .expect("vote");

    let removed = storage.delete_vote(c.id, &voter).await.expect("delete");
    assert_eq!(removed.map(|v| v.participant_id), Some(voter.clone()));
    assert!(storage
        .delete_vote(c.id, &voter)
        .await
        .expect("delete")
        .is_none());
}

#[tokio::test]
async fn actions_round_trip_through_storage() {
    let (storage, session) = seeded().await;
    let action = storage
        .insert_action(session.id, "Automate release notes", Some("dana"))
        .await
        .expect("action");
    let listed = storage.list_actions(session.id).await.expect("list");
    assert_eq!(listed, vec![action.clone()]);

    storage
        .delete_action(action.id)
        .await
        .expect("delete")
        .expect("existed");
    assert!(storage.list_actions(session.id).await.expect("list").is_empty());
}
