//! Record of mutations that exhausted their retry budget.
//!
//! The log is persisted in the same record as the active queue, so moving a
//! mutation here and removing it from the queue is a single atomic save.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::model::{MutationId, MutationKind, PendingMutation, UnixTimeMs};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeadLetter {
    pub id: MutationId,
    pub kind: MutationKind,
    pub payload: serde_json::Value,
    pub enqueued_at: UnixTimeMs,
    pub retry_count: u32,
    pub dead_lettered_at: UnixTimeMs,
    #[serde(default)]
    pub last_reason: Option<String>,
}

impl DeadLetter {
    pub fn from_mutation(
        mutation: PendingMutation,
        final_reason: Option<String>,
        now: UnixTimeMs,
    ) -> Self {
        Self {
            id: mutation.id,
            kind: mutation.kind,
            payload: mutation.payload,
            enqueued_at: mutation.enqueued_at,
            retry_count: mutation.retry_count,
            dead_lettered_at: now,
            last_reason: final_reason.or(mutation.last_rejection),
        }
    }
}

/// Ordered by dead-lettering time. Entries leave only by eviction of the
/// oldest or by operator acknowledgement.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterLog {
    entries: Vec<DeadLetter>,
}

impl DeadLetterLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, letter: DeadLetter) {
        self.entries.push(letter);
    }

    /// Drop and return the oldest entry.
    pub fn evict_oldest(&mut self) -> Option<DeadLetter> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    /// Remove every entry whose id is in `ids`. Returns how many were removed.
    pub fn remove_ids(&mut self, ids: &HashSet<&MutationId>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|l| !ids.contains(&l.id));
        before - self.entries.len()
    }

    pub fn entries(&self) -> &[DeadLetter] {
        &self.entries
    }

    pub fn get(&self, id: &MutationId) -> Option<&DeadLetter> {
        self.entries.iter().find(|l| &l.id == id)
    }

    pub fn contains(&self, id: &MutationId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
