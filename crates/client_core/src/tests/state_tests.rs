use super::*;
use chrono::Utc;
use shared::domain::{ConfidentialSettings, SessionMetadata, TimerState};

fn session(id: SessionId, version: u64) -> RetroSession {
    let now = Utc::now();
    RetroSession {
        id,
        template_id: "start_stop_continue".into(),
        title: "Sprint 9".into(),
        status: SessionStatus::InProgress,
        timer: TimerState::idle(),
        metadata: SessionMetadata::default(),
        version,
        created_at: now,
        updated_at: now,
    }
}

fn card(session_id: SessionId, author: &str, column: &str) -> Card {
    let now = Utc::now();
    Card {
        id: CardId::new(),
        session_id,
        column_id: column.into(),
        author_id: ParticipantId::new(author),
        author_name: author.to_uppercase(),
        content: "Standups run long".into(),
        color: None,
        created_at: now,
        updated_at: now,
    }
}

fn vote(session_id: SessionId, card_id: CardId, who: &str) -> Vote {
    Vote {
        session_id,
        card_id,
        participant_id: ParticipantId::new(who),
        created_at: Utc::now(),
    }
}

fn event<T: serde::Serialize>(session_id: SessionId, table: Table, kind: ChangeKind, row: &T) -> ChangeEvent {
    ChangeEvent {
        session_id,
        table,
        kind,
        row: serde_json::to_value(row).expect("row"),
        seq: 0,
    }
}

fn loaded() -> RetroState {
    let session_id = SessionId::new();
    let mut state = RetroState::new(session_id, ParticipantId::new("alice"));
    state.load(FullSnapshot {
        session: session(session_id, 1),
        cards: Vec::new(),
        votes: Vec::new(),
        actions: Vec::new(),
    });
    state
}

#[test]
fn load_switches_to_session_template() {
    let state = loaded();
    assert_eq!(state.template().id, "start_stop_continue");
    let ids: Vec<&str> = state.board().columns().iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["start", "stop", "continue"]);
    assert_eq!(state.ledger().max_votes_per_person(), 3);
}

#[test]
fn routes_card_and_vote_events() {
    let mut state = loaded();
    let sid = state.session_id();
    let c = card(sid, "bob", "stop");

    assert_eq!(
        state.apply_change(&event(sid, Table::Cards, ChangeKind::Insert, &c)).expect("card"),
        Applied::Board
    );
    state
        .apply_change(&event(sid, Table::Votes, ChangeKind::Insert, &vote(sid, c.id, "alice")))
        .expect("vote");
    let view = state.snapshot(0);
    let shown = view.card(c.id).expect("card shown");
    assert_eq!(shown.votes, 1);
    assert!(shown.voted_by_me);
    assert_eq!(view.votes_remaining, 2);

    state
        .apply_change(&event(sid, Table::Cards, ChangeKind::Delete, &c))
        .expect("delete");
    assert!(state.board().is_empty());
    assert_eq!(state.ledger().votes_for_card(c.id), 0);
}

#[test]
fn vote_for_unknown_card_counts_once_card_arrives() {
    let mut state = loaded();
    let sid = state.session_id();
    let c = card(sid, "bob", "start");
    state
        .apply_change(&event(sid, Table::Votes, ChangeKind::Insert, &vote(sid, c.id, "carol")))
        .expect("early vote");
    assert!(state.snapshot(0).card(c.id).is_none());

    state
        .apply_change(&event(sid, Table::Cards, ChangeKind::Insert, &c))
        .expect("card");
    assert_eq!(state.snapshot(0).card(c.id).map(|v| v.votes), Some(1));
}

#[test]
fn malformed_rows_are_rejected_without_side_effects() {
    let mut state = loaded();
    let sid = state.session_id();
    let bad = ChangeEvent {
        session_id: sid,
        table: Table::Cards,
        kind: ChangeKind::Insert,
        row: serde_json::json!({ "id": "not-a-uuid" }),
        seq: 3,
    };
    assert!(matches!(
        state.apply_change(&bad),
        Err(RetroError::MalformedEvent { table: Table::Cards, .. })
    ));
    assert!(state.board().is_empty());
}

#[test]
fn other_sessions_are_ignored() {
    let mut state = loaded();
    let other = SessionId::new();
    let c = card(other, "bob", "start");
    assert_eq!(
        state.apply_change(&event(other, Table::Cards, ChangeKind::Insert, &c)).expect("ignored"),
        Applied::Ignored
    );
}

#[test]
fn stale_session_versions_are_ignored_and_completion_is_one_way() {
    let mut state = loaded();
    let sid = state.session_id();

    let mut completed = session(sid, 3);
    completed.status = SessionStatus::Completed;
    assert_eq!(
        state
            .apply_change(&event(sid, Table::Sessions, ChangeKind::Update, &completed))
            .expect("completed"),
        Applied::Session { completed_now: true }
    );

    let mut stale = session(sid, 2);
    stale.title = "older".into();
    state
        .apply_change(&event(sid, Table::Sessions, ChangeKind::Update, &stale))
        .expect("stale");
    assert_eq!(state.session().map(|s| s.title.as_str()), Some("Sprint 9"));
    assert!(state.is_completed());

    let again = session(sid, 4);
    assert_eq!(
        state
            .apply_change(&event(sid, Table::Sessions, ChangeKind::Update, &again))
            .expect("reopen attempt"),
        Applied::Session { completed_now: false }
    );
    assert!(state.is_completed());
}

#[test]
fn confidential_settings_shape_the_view() {
    let session_id = SessionId::new();
    let mut state = RetroState::new(session_id, ParticipantId::new("alice"));
    let mut row = session(session_id, 1);
    row.metadata.confidential = ConfidentialSettings {
        anonymous_cards: true,
        hide_votes_until_complete: true,
    };
    let theirs = card(session_id, "bob", "start");
    let mine = card(session_id, "alice", "start");
    state.load(FullSnapshot {
        session: row,
        cards: vec![theirs.clone(), mine.clone()],
        votes: Vec::new(),
        actions: Vec::new(),
    });

    let view = state.snapshot(0);
    assert!(view.votes_hidden);
    assert_eq!(view.card(theirs.id).and_then(|c| c.author_name.clone()), None);
    assert_eq!(
        view.card(mine.id).and_then(|c| c.author_name.clone()),
        Some("ALICE".to_string())
    );
}
