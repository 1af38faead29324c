#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use offline_sync::{
    AttemptOutcome, Clock, ManualClock, MemoryStore, MutationId, MutationQueue, PendingMutation,
    PersistentStore, QueueConfig, StoreError, Transport, UnixTimeMs,
};
use tokio::sync::{Notify, Semaphore};

pub const START: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(START))
}

/// Backoff without jitter so gate times are predictable.
pub fn fixed_config() -> QueueConfig {
    QueueConfig {
        max_retries: 3,
        backoff_base_ms: 1_000,
        backoff_cap_ms: 30_000,
        jitter_fraction: 0.0,
        max_entries: 1_000,
        max_dead_letters: 100,
        ..QueueConfig::default()
    }
}

pub async fn open_queue<S: PersistentStore>(
    store: Arc<S>,
    config: QueueConfig,
    clock: Arc<ManualClock>,
) -> Arc<MutationQueue<S>> {
    let clock: Arc<dyn Clock> = clock;
    Arc::new(
        MutationQueue::open_with_clock(store, config, clock)
            .await
            .unwrap(),
    )
}

/// Plays queued outcomes in order, then falls back to `fallback`.
/// Records every attempt and the peak number of concurrent attempts.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<AttemptOutcome>>,
    fallback: AttemptOutcome,
    calls: Mutex<Vec<(MutationId, AttemptOutcome)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    gate: Option<Semaphore>,
    entered: Notify,
}

impl ScriptedTransport {
    pub fn delivering() -> Self {
        Self::with_fallback(AttemptOutcome::Delivered)
    }

    pub fn with_fallback(fallback: AttemptOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            gate: None,
            entered: Notify::new(),
        }
    }

    /// Every attempt parks until [`release`](Self::release) hands out a permit.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::delivering()
        }
    }

    pub fn push(&self, outcomes: impl IntoIterator<Item = AttemptOutcome>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    pub fn release(&self, attempts: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(attempts);
        }
    }

    /// Resolves once an attempt has started.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn calls(&self) -> Vec<(MutationId, AttemptOutcome)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn attempted_ids(&self) -> Vec<MutationId> {
        self.calls().into_iter().map(|(id, _)| id).collect()
    }

    pub fn delivered_ids(&self) -> Vec<MutationId> {
        self.calls()
            .into_iter()
            .filter(|(_, outcome)| outcome.is_delivered())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn attempt(&self, mutation: &PendingMutation) -> AttemptOutcome {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        self.entered.notify_one();

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        } else {
            tokio::task::yield_now().await;
        }

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        self.calls
            .lock()
            .unwrap()
            .push((mutation.id.clone(), outcome.clone()));

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Memory store that starts failing saves on demand.
#[derive(Default)]
pub struct FailableStore {
    pub inner: MemoryStore,
    saves_left: Mutex<Option<usize>>,
    saves: AtomicUsize,
}

impl FailableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `n` more successful saves, then fail every save after that.
    pub fn fail_after(&self, n: usize) {
        *self.saves_left.lock().unwrap() = Some(n);
    }

    pub fn heal(&self) {
        *self.saves_left.lock().unwrap() = None;
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PersistentStore for FailableStore {
    async fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.load().await
    }

    async fn save(&self, bytes: Vec<u8>) -> Result<(), StoreError> {
        {
            let mut left = self.saves_left.lock().unwrap();
            if let Some(n) = left.as_mut() {
                if *n == 0 {
                    return Err(StoreError::Unavailable("injected save failure".into()));
                }
                *n -= 1;
            }
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(bytes).await
    }
}
