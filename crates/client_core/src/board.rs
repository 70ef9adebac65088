use std::collections::HashMap;

use chrono::Utc;
use shared::{
    domain::{Card, CardId, ParticipantId},
    template::ColumnDef,
};

use crate::error::RetroError;

#[derive(Debug, Clone)]
enum Overlay {
    Upsert(Card),
    Delete,
}

#[derive(Debug, Clone, Default)]
struct Entry {
    confirmed: Option<Card>,
    overlay: Option<Overlay>,
}

impl Entry {
    fn visible(&self) -> Option<&Card> {
        match &self.overlay {
            Some(Overlay::Upsert(card)) => Some(card),
            Some(Overlay::Delete) => None,
            None => self.confirmed.as_ref(),
        }
    }
}

/// Cards of one session keyed by id.
///
/// Each entry holds the last row seen on the change feed plus at most one
/// optimistic local change. Reconciliation is idempotent: applying the same
/// upsert or delete twice leaves the board unchanged.
#[derive(Debug, Clone, Default)]
pub struct CardBoard {
    columns: Vec<ColumnDef>,
    entries: HashMap<CardId, Entry>,
}

impl CardBoard {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self {
            columns,
            entries: HashMap::new(),
        }
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn has_column(&self, column_id: &str) -> bool {
        self.columns.iter().any(|column| column.id == column_id)
    }

    pub fn get(&self, card_id: CardId) -> Option<&Card> {
        self.entries.get(&card_id).and_then(Entry::visible)
    }

    pub fn contains(&self, card_id: CardId) -> bool {
        self.get(card_id).is_some()
    }

    pub fn is_pending(&self, card_id: CardId) -> bool {
        self.entries
            .get(&card_id)
            .is_some_and(|entry| entry.overlay.is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.visible().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible cards of a column, oldest first.
    pub fn cards_in_column(&self, column_id: &str) -> Vec<&Card> {
        let mut cards: Vec<&Card> = self
            .entries
            .values()
            .filter_map(Entry::visible)
            .filter(|card| card.column_id == column_id)
            .collect();
        cards.sort_by(|a, b| (a.created_at, a.id.0).cmp(&(b.created_at, b.id.0)));
        cards
    }

    pub fn add_card(&mut self, card: Card) -> Result<(), RetroError> {
        if !self.has_column(&card.column_id) {
            return Err(RetroError::UnknownColumn(card.column_id));
        }
        let entry = self.entries.entry(card.id).or_default();
        entry.overlay = Some(Overlay::Upsert(card));
        Ok(())
    }

    fn authored(&self, card_id: CardId, editor: &ParticipantId) -> Result<&Card, RetroError> {
        let card = self.get(card_id).ok_or(RetroError::UnknownCard(card_id))?;
        if &card.author_id != editor {
            return Err(RetroError::NotAuthor { card_id });
        }
        Ok(card)
    }

    /// Returns the edited card as shown locally.
    pub fn edit_card(
        &mut self,
        card_id: CardId,
        editor: &ParticipantId,
        content: Option<String>,
        color: Option<String>,
    ) -> Result<Card, RetroError> {
        let mut card = self.authored(card_id, editor)?.clone();
        if let Some(content) = content {
            card.content = content;
        }
        if color.is_some() {
            card.color = color;
        }
        card.updated_at = Utc::now();
        if let Some(entry) = self.entries.get_mut(&card_id) {
            entry.overlay = Some(Overlay::Upsert(card.clone()));
        }
        Ok(card)
    }

    /// Hides the card locally and returns it.
    pub fn delete_card(
        &mut self,
        card_id: CardId,
        editor: &ParticipantId,
    ) -> Result<Card, RetroError> {
        let card = self.authored(card_id, editor)?.clone();
        if let Some(entry) = self.entries.get_mut(&card_id) {
            entry.overlay = Some(Overlay::Delete);
        }
        Ok(card)
    }

    /// Insert or update event. The authoritative row replaces any overlay.
    pub fn apply_upsert(&mut self, card: Card) {
        self.entries.insert(
            card.id,
            Entry {
                confirmed: Some(card),
                overlay: None,
            },
        );
    }

    pub fn apply_delete(&mut self, card_id: CardId) -> bool {
        self.entries.remove(&card_id).is_some()
    }

    /// Drops the local overlay so the last authoritative value shows again.
    pub fn rollback(&mut self, card_id: CardId) {
        let drop_entry = match self.entries.get_mut(&card_id) {
            Some(entry) => {
                entry.overlay = None;
                entry.confirmed.is_none()
            }
            None => false,
        };
        if drop_entry {
            self.entries.remove(&card_id);
        }
    }

    /// Resync: the fetched rows become the whole truth.
    pub fn replace_confirmed(&mut self, cards: impl IntoIterator<Item = Card>) {
        self.entries = cards
            .into_iter()
            .map(|card| {
                (
                    card.id,
                    Entry {
                        confirmed: Some(card),
                        overlay: None,
                    },
                )
            })
            .collect();
    }

    pub fn set_columns(&mut self, columns: Vec<ColumnDef>) {
        self.columns = columns;
    }
}

#[cfg(test)]
#[path = "tests/board_tests.rs"]
mod tests;
