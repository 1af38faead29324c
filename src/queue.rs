//! Durable, ordered queue of pending mutations.
//!
//! Every state change is persisted before it becomes visible in memory, so the
//! in-memory view never runs ahead of what a restart would reload.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::dead_letter::DeadLetter;
use crate::envelope::{self, QueueDocument};
use crate::metrics::{MetricsSnapshot, QueueMetrics};
use crate::model::{MutationId, MutationKind, MutationStatus, PendingMutation, UnixTimeMs};
use crate::store::{PersistentStore, StoreError};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("mutation not found: {0}")]
    NotFound(MutationId),

    #[error("queue full: {0} entries")]
    Full(usize),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub eligible_now: usize,
    pub dead_lettered: usize,
    pub by_kind: HashMap<MutationKind, usize>,
    pub oldest_enqueued_at: Option<UnixTimeMs>,
    /// Earliest backoff gate among pending mutations. Hosts use it to schedule the next flush.
    pub next_eligible_at: Option<UnixTimeMs>,
}

pub struct MutationQueue<S: PersistentStore> {
    store: Arc<S>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    state: RwLock<QueueDocument>,
    metrics: QueueMetrics,
}

impl<S: PersistentStore> MutationQueue<S> {
    pub async fn open(store: Arc<S>, config: QueueConfig) -> Result<Self, QueueError> {
        Self::open_with_clock(store, config, Arc::new(SystemClock)).await
    }

    /// Load the last committed queue from `store`. An empty store yields an empty queue.
    #[instrument(skip(store, config, clock))]
    pub async fn open_with_clock(
        store: Arc<S>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        config.validate()?;

        let document = match store.load().await {
            Ok(Some(bytes)) => envelope::decode(&bytes)?,
            Ok(None) => QueueDocument::default(),
            Err(e) => {
                error!(error = %e, "failed to load queue record");
                return Err(e.into());
            }
        };

        info!(
            pending = document.mutations.len(),
            dead_lettered = document.dead_letters.len(),
            "mutation queue opened"
        );

        Ok(Self {
            store,
            config,
            clock,
            state: RwLock::new(document),
            metrics: QueueMetrics::new(),
        })
    }

    /// Append a new mutation and persist the whole queue before returning its id.
    #[instrument(skip(self, payload))]
    pub async fn enqueue(
        &self,
        kind: MutationKind,
        payload: serde_json::Value,
    ) -> Result<MutationId, QueueError> {
        let mut state = self.state.write().await;

        // Retained dead letters share the capacity with pending mutations
        if state.mutations.len() + state.dead_letters.len() >= self.config.max_entries {
            return Err(QueueError::Full(self.config.max_entries));
        }

        let mutation = PendingMutation::new(kind, payload, self.clock.now());
        let id = mutation.id.clone();

        let mut next = state.clone();
        next.mutations.push(mutation);
        self.persist(&next).await?;
        *state = next;

        QueueMetrics::incr(&self.metrics.enqueued);
        info!(mutation_id = %id, "mutation enqueued");

        Ok(id)
    }

    pub async fn snapshot(&self) -> Vec<PendingMutation> {
        self.state.read().await.mutations.clone()
    }

    pub async fn get(&self, id: &MutationId) -> Option<PendingMutation> {
        let state = self.state.read().await;
        state.mutations.iter().find(|m| &m.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.mutations.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.mutations.is_empty()
    }

    /// `None` once a mutation has been delivered, or if the id was never enqueued here.
    pub async fn status_of(&self, id: &MutationId) -> Option<MutationStatus> {
        let state = self.state.read().await;
        if state.mutations.iter().any(|m| &m.id == id) {
            Some(MutationStatus::Pending)
        } else if state.dead_letters.contains(id) {
            Some(MutationStatus::DeadLettered)
        } else {
            None
        }
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.read().await.dead_letters.entries().to_vec()
    }

    pub async fn next_eligible_at(&self) -> Option<UnixTimeMs> {
        let state = self.state.read().await;
        state.mutations.iter().map(|m| m.next_eligible_at).min()
    }

    pub async fn stats(&self) -> QueueStats {
        let now = self.clock.now();
        let state = self.state.read().await;

        let mut stats = QueueStats {
            pending: state.mutations.len(),
            dead_lettered: state.dead_letters.len(),
            ..Default::default()
        };

        for m in &state.mutations {
            if m.is_eligible(now) {
                stats.eligible_now += 1;
            }
            *stats.by_kind.entry(m.kind).or_insert(0) += 1;
            stats.oldest_enqueued_at = Some(
                stats
                    .oldest_enqueued_at
                    .map_or(m.enqueued_at, |t| t.min(m.enqueued_at)),
            );
            stats.next_eligible_at = Some(
                stats
                    .next_eligible_at
                    .map_or(m.next_eligible_at, |t| t.min(m.next_eligible_at)),
            );
        }

        stats
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn now(&self) -> UnixTimeMs {
        self.clock.now()
    }

    pub(crate) fn counters(&self) -> &QueueMetrics {
        &self.metrics
    }

    /// First mutation in insertion order that is eligible at `now` and not in `skip`.
    pub(crate) async fn first_eligible(
        &self,
        now: UnixTimeMs,
        skip: &HashSet<MutationId>,
    ) -> Option<PendingMutation> {
        let state = self.state.read().await;
        state
            .mutations
            .iter()
            .find(|m| m.is_eligible(now) && !skip.contains(&m.id))
            .cloned()
    }

    /// Mutations not in `skip` whose backoff gate is still closed at `now`.
    pub(crate) async fn count_gated(&self, now: UnixTimeMs, skip: &HashSet<MutationId>) -> usize {
        let state = self.state.read().await;
        state
            .mutations
            .iter()
            .filter(|m| !m.is_eligible(now) && !skip.contains(&m.id))
            .count()
    }

    /// Drop a delivered mutation.
    pub(crate) async fn remove(&self, id: &MutationId) -> Result<PendingMutation, QueueError> {
        let mut state = self.state.write().await;
        let idx = Self::position(&state, id)?;

        let mut next = state.clone();
        let removed = next.mutations.remove(idx);
        self.persist(&next).await?;
        *state = next;

        Ok(removed)
    }

    /// Count one more rejection and close the backoff gate for `backoff`.
    pub(crate) async fn mark_retry(
        &self,
        id: &MutationId,
        backoff: Duration,
        reason: Option<String>,
    ) -> Result<PendingMutation, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let idx = Self::position(&state, id)?;

        let mut next = state.clone();
        let entry = &mut next.mutations[idx];
        entry.retry_count = entry.retry_count.saturating_add(1);
        entry.next_eligible_at = now.saturating_add(backoff);
        if reason.is_some() {
            entry.last_rejection = reason;
        }
        let updated = entry.clone();

        self.persist(&next).await?;
        *state = next;

        Ok(updated)
    }

    /// Count the final rejection and move the mutation to the dead-letter log.
    /// Removal and append land in the same save.
    pub(crate) async fn dead_letter(
        &self,
        id: &MutationId,
        reason: Option<String>,
    ) -> Result<DeadLetter, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let idx = Self::position(&state, id)?;

        let mut next = state.clone();
        let mut mutation = next.mutations.remove(idx);
        mutation.retry_count = mutation.retry_count.saturating_add(1);
        let letter = DeadLetter::from_mutation(mutation, reason, now);
        next.dead_letters.append(letter.clone());

        while next.dead_letters.len() > self.config.max_dead_letters {
            self.evict_oldest_letter(&mut next, "dead-letter log full");
        }

        // Older dead letters give way rather than wedging the drain on this item
        let bytes = loop {
            match envelope::encode_with_limit(&next, self.config.max_record_bytes) {
                Err(StoreError::StoreTooLarge { .. }) if next.dead_letters.len() > 1 => {
                    self.evict_oldest_letter(&mut next, "queue record over size limit");
                }
                other => break other,
            }
        };

        self.save_encoded(bytes).await?;
        *state = next;

        Ok(letter)
    }

    /// Operator acknowledgement: drop the given dead letters in one save.
    /// Unknown ids are ignored. Returns how many entries were removed.
    #[instrument(skip(self, ids), fields(requested = ids.len()))]
    pub async fn acknowledge_dead_letters(&self, ids: &[MutationId]) -> Result<usize, QueueError> {
        let ids: HashSet<&MutationId> = ids.iter().collect();
        let mut state = self.state.write().await;

        let mut next = state.clone();
        let removed = next.dead_letters.remove_ids(&ids);
        if removed == 0 {
            return Ok(0);
        }

        self.persist(&next).await?;
        *state = next;

        info!(removed, "dead letters acknowledged");
        Ok(removed)
    }

    fn evict_oldest_letter(&self, document: &mut QueueDocument, cause: &'static str) {
        if let Some(evicted) = document.dead_letters.evict_oldest() {
            QueueMetrics::incr(&self.metrics.dead_letters_evicted);
            warn!(
                mutation_id = %evicted.id,
                kind = %evicted.kind,
                cause,
                "evicted oldest dead letter"
            );
        }
    }

    fn position(state: &QueueDocument, id: &MutationId) -> Result<usize, QueueError> {
        state
            .mutations
            .iter()
            .position(|m| &m.id == id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    async fn persist(&self, document: &QueueDocument) -> Result<(), StoreError> {
        self.save_encoded(envelope::encode_with_limit(
            document,
            self.config.max_record_bytes,
        ))
        .await
    }

    async fn save_encoded(&self, encoded: Result<Vec<u8>, StoreError>) -> Result<(), StoreError> {
        let result = match encoded {
            Ok(bytes) => self.store.save(bytes).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            QueueMetrics::incr(&self.metrics.storage_errors);
            error!(error = %e, "failed to persist queue");
        }

        result
    }
}
