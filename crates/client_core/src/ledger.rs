use std::collections::{HashMap, HashSet};

use shared::domain::{CardId, ParticipantId, Vote};

use crate::error::RetroError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Cast,
    /// Voting twice for the same card is a silent no-op.
    AlreadyVoted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnvoteOutcome {
    Removed,
    NotVoted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingVote {
    Add,
    Remove,
}

type VoteKey = (CardId, ParticipantId);

/// Vote membership for one session.
///
/// `confirmed` mirrors the record store as seen through the change feed.
/// `pending` holds this client's in-flight writes until their own event comes
/// back or the write is rolled back. Counts are always recomputed from the
/// effective set, never incremented.
#[derive(Debug, Clone)]
pub struct VoteLedger {
    max_votes_per_person: u32,
    confirmed: HashSet<VoteKey>,
    pending: HashMap<VoteKey, PendingVote>,
}

impl VoteLedger {
    pub fn new(max_votes_per_person: u32) -> Self {
        Self {
            max_votes_per_person,
            confirmed: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    pub fn max_votes_per_person(&self) -> u32 {
        self.max_votes_per_person
    }

    pub fn set_max_votes_per_person(&mut self, max: u32) {
        self.max_votes_per_person = max;
    }

    fn is_effective(&self, key: &VoteKey) -> bool {
        match self.pending.get(key) {
            Some(PendingVote::Add) => true,
            Some(PendingVote::Remove) => false,
            None => self.confirmed.contains(key),
        }
    }

    fn effective(&self) -> impl Iterator<Item = &VoteKey> {
        self.confirmed
            .iter()
            .filter(|key| !matches!(self.pending.get(*key), Some(PendingVote::Remove)))
            .chain(
                self.pending
                    .iter()
                    .filter(|(key, op)| **op == PendingVote::Add && !self.confirmed.contains(*key))
                    .map(|(key, _)| key),
            )
    }

    pub fn has_voted(&self, card_id: CardId, participant_id: &ParticipantId) -> bool {
        self.is_effective(&(card_id, participant_id.clone()))
    }

    pub fn votes_held(&self, participant_id: &ParticipantId) -> u32 {
        let held = self
            .effective()
            .filter(|(_, voter)| voter == participant_id)
            .count();
        u32::try_from(held).unwrap_or(u32::MAX)
    }

    pub fn remaining_votes(&self, participant_id: &ParticipantId) -> u32 {
        self.max_votes_per_person
            .saturating_sub(self.votes_held(participant_id))
    }

    pub fn votes_for_card(&self, card_id: CardId) -> u32 {
        let count = self.effective().filter(|(card, _)| *card == card_id).count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    pub fn voted_cards(&self, participant_id: &ParticipantId) -> Vec<CardId> {
        self.effective()
            .filter(|(_, voter)| voter == participant_id)
            .map(|(card, _)| *card)
            .collect()
    }

    /// Records an optimistic vote. The caller forwards it to the record store
    /// and calls [`VoteLedger::rollback`] if that fails.
    pub fn vote(
        &mut self,
        card_id: CardId,
        participant_id: &ParticipantId,
    ) -> Result<VoteOutcome, RetroError> {
        let key = (card_id, participant_id.clone());
        if self.is_effective(&key) {
            return Ok(VoteOutcome::AlreadyVoted);
        }
        if self.votes_held(participant_id) >= self.max_votes_per_person {
            return Err(RetroError::VoteCapExceeded {
                max: self.max_votes_per_person,
            });
        }
        self.pending.insert(key, PendingVote::Add);
        Ok(VoteOutcome::Cast)
    }

    pub fn unvote(&mut self, card_id: CardId, participant_id: &ParticipantId) -> UnvoteOutcome {
        let key = (card_id, participant_id.clone());
        if !self.is_effective(&key) {
            return UnvoteOutcome::NotVoted;
        }
        self.pending.insert(key, PendingVote::Remove);
        UnvoteOutcome::Removed
    }

    pub fn rollback(&mut self, card_id: CardId, participant_id: &ParticipantId) {
        self.pending.remove(&(card_id, participant_id.clone()));
    }

    /// Insert event. Votes for cards not yet on the board are kept and count
    /// once the card arrives.
    pub fn apply_insert(&mut self, vote: &Vote) {
        let key = (vote.card_id, vote.participant_id.clone());
        if self.pending.get(&key) == Some(&PendingVote::Add) {
            self.pending.remove(&key);
        }
        self.confirmed.insert(key);
    }

    pub fn apply_delete(&mut self, card_id: CardId, participant_id: &ParticipantId) {
        let key = (card_id, participant_id.clone());
        if self.pending.get(&key) == Some(&PendingVote::Remove) {
            self.pending.remove(&key);
        }
        self.confirmed.remove(&key);
    }

    /// Drops every vote attached to a deleted card.
    pub fn forget_card(&mut self, card_id: CardId) {
        self.confirmed.retain(|(card, _)| *card != card_id);
        self.pending.retain(|(card, _), _| *card != card_id);
    }

    /// Resync: the fetched rows become the whole truth.
    pub fn replace_confirmed(&mut self, votes: impl IntoIterator<Item = Vote>) {
        self.confirmed = votes
            .into_iter()
            .map(|vote| (vote.card_id, vote.participant_id))
            .collect();
        self.pending.clear();
    }
}

#[cfg(test)]
#[path = "tests/ledger_tests.rs"]
mod tests;
