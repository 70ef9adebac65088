use super::*;
use chrono::{Duration, TimeZone};
use shared::{domain::SessionId, template::find_template};

fn board() -> CardBoard {
    let template = find_template("went_well_to_improve").expect("template");
    CardBoard::new(template.columns)
}

fn card(author: &str, column: &str, secs: i64) -> Card {
    let at = Utc.timestamp_opt(1_700_000_000, 0).single().expect("time") + Duration::seconds(secs);
    Card {
        id: CardId::new(),
        session_id: SessionId::new(),
        column_id: column.into(),
        author_id: ParticipantId::new(author),
        author_name: author.into(),
        content: format!("{author} says hi"),
        color: None,
        created_at: at,
        updated_at: at,
    }
}

#[test]
fn rejects_unknown_column() {
    let mut board = board();
    let err = board
        .add_card(card("alice", "kudos", 0))
        .expect_err("not a template column");
    assert!(matches!(err, RetroError::UnknownColumn(column) if column == "kudos"));
    assert!(board.is_empty());
}

#[test]
fn optimistic_add_settles_on_own_event() {
    let mut board = board();
    let mine = card("alice", "went_well", 0);
    board.add_card(mine.clone()).expect("add");
    assert!(board.is_pending(mine.id));
    assert_eq!(board.len(), 1);

    board.apply_upsert(mine.clone());
    board.apply_upsert(mine.clone());
    assert!(!board.is_pending(mine.id));
    assert_eq!(board.len(), 1);
}

#[test]
fn columns_sort_by_creation_then_id() {
    let mut board = board();
    let late = card("bob", "to_improve", 30);
    let early = card("alice", "to_improve", 10);
    board.apply_upsert(late.clone());
    board.apply_upsert(early.clone());
    board.apply_upsert(card("carol", "went_well", 0));

    let ids: Vec<CardId> = board
        .cards_in_column("to_improve")
        .iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids, vec![early.id, late.id]);
}

#[test]
fn only_author_may_edit_or_delete() {
    let mut board = board();
    let alices = card("alice", "went_well", 0);
    board.apply_upsert(alices.clone());
    let bob = ParticipantId::new("bob");

    assert!(matches!(
        board.edit_card(alices.id, &bob, Some("hijack".into()), None),
        Err(RetroError::NotAuthor { .. })
    ));
    assert!(matches!(
        board.delete_card(alices.id, &bob),
        Err(RetroError::NotAuthor { .. })
    ));
    assert_eq!(board.get(alices.id).map(|c| c.content.as_str()), Some("alice says hi"));
}

#[test]
fn rollback_restores_last_authoritative_value() {
    let mut board = board();
    let alice = ParticipantId::new("alice");
    let original = card("alice", "went_well", 0);
    board.apply_upsert(original.clone());

    let edited = board
        .edit_card(original.id, &alice, Some("better".into()), Some("#ffcc00".into()))
        .expect("edit");
    assert_eq!(edited.color.as_deref(), Some("#ffcc00"));
    assert_eq!(board.get(original.id).map(|c| c.content.as_str()), Some("better"));
    board.rollback(original.id);
    assert_eq!(board.get(original.id), Some(&original));

    board.delete_card(original.id, &alice).expect("delete");
    assert!(!board.contains(original.id));
    board.rollback(original.id);
    assert!(board.contains(original.id));

    let never_stored = card("alice", "to_improve", 5);
    board.add_card(never_stored.clone()).expect("add");
    board.rollback(never_stored.id);
    assert!(!board.contains(never_stored.id));
}

#[test]
fn delete_event_is_idempotent_and_unknown_card_is_rejected() {
    let mut board = board();
    let c = card("alice", "action_items", 0);
    board.apply_upsert(c.clone());
    assert!(board.apply_delete(c.id));
    assert!(!board.apply_delete(c.id));
    assert!(matches!(
        board.delete_card(c.id, &ParticipantId::new("alice")),
        Err(RetroError::UnknownCard(id)) if id == c.id
    ));
}

#[test]
fn resync_discards_overlays() {
    let mut board = board();
    let pending = card("alice", "went_well", 0);
    board.add_card(pending.clone()).expect("add");
    let stored = card("bob", "to_improve", 1);
    board.replace_confirmed(vec![stored.clone()]);
    assert!(!board.contains(pending.id));
    assert_eq!(board.get(stored.id), Some(&stored));
}
