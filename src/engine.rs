//! Single-flight drain of the mutation queue against a transport.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::metrics::QueueMetrics;
use crate::model::{MutationId, PendingMutation};
use crate::queue::{MutationQueue, QueueError};
use crate::store::PersistentStore;
use crate::transport::{AttemptOutcome, Transport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FlushOutcome {
    /// Every eligible mutation was attempted.
    #[default]
    Drained,
    /// The transport reported the channel down; remaining mutations wait for the next flush.
    HaltedUnreachable,
    /// Another drain was running. Nothing was attempted.
    AlreadyDraining,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub outcome: FlushOutcome,
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Pending mutations left untouched because their backoff gate was closed.
    pub deferred: usize,
}

impl FlushReport {
    fn already_draining() -> Self {
        Self {
            outcome: FlushOutcome::AlreadyDraining,
            ..Default::default()
        }
    }

    pub fn attempted(&self) -> usize {
        self.delivered + self.retried + self.dead_lettered
    }
}

/// Resets the draining flag however the drain ends, including on error.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct FlushEngine<S: PersistentStore, T: Transport> {
    queue: Arc<MutationQueue<S>>,
    transport: Arc<T>,
    backoff: BackoffPolicy,
    draining: AtomicBool,
}

impl<S: PersistentStore, T: Transport> FlushEngine<S, T> {
    pub fn new(queue: Arc<MutationQueue<S>>, transport: Arc<T>) -> Self {
        let backoff = BackoffPolicy::from_config(queue.config());
        Self {
            queue,
            transport,
            backoff,
            draining: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &Arc<MutationQueue<S>> {
        &self.queue
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Drain every eligible mutation, in insertion order.
    ///
    /// Returns immediately with [`FlushOutcome::AlreadyDraining`] if a drain is in
    /// progress; that drain also picks up anything enqueued while it runs. A
    /// persistence failure aborts the drain with the failing item left as it was.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<FlushReport, QueueError> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            QueueMetrics::incr(&self.queue.counters().skipped_drains);
            debug!("drain already in progress");
            return Ok(FlushReport::already_draining());
        }
        let _guard = DrainGuard(&self.draining);
        QueueMetrics::incr(&self.queue.counters().drains);

        let report = self.drain().await?;

        info!(
            outcome = ?report.outcome,
            delivered = report.delivered,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            deferred = report.deferred,
            "drain finished"
        );
        Ok(report)
    }

    async fn drain(&self) -> Result<FlushReport, QueueError> {
        let mut report = FlushReport::default();
        let mut attempted: HashSet<MutationId> = HashSet::new();
        let budget = self.queue.config().max_entries;

        while attempted.len() < budget {
            let now = self.queue.now();
            let Some(mutation) = self.queue.first_eligible(now, &attempted).await else {
                break;
            };
            attempted.insert(mutation.id.clone());

            if !self.process(mutation, &mut report).await? {
                report.outcome = FlushOutcome::HaltedUnreachable;
                break;
            }
        }

        report.deferred = self.queue.count_gated(self.queue.now(), &attempted).await;
        if report.deferred > 0 {
            debug!(deferred = report.deferred, "backoff-gated mutations skipped");
        }
        Ok(report)
    }

    /// Attempt one mutation and persist the decision. `Ok(false)` halts the drain.
    async fn process(
        &self,
        mutation: PendingMutation,
        report: &mut FlushReport,
    ) -> Result<bool, QueueError> {
        let counters = self.queue.counters();

        match self.transport.attempt(&mutation).await {
            AttemptOutcome::Delivered => {
                self.queue.remove(&mutation.id).await?;
                QueueMetrics::incr(&counters.delivered);
                report.delivered += 1;
                info!(mutation_id = %mutation.id, kind = %mutation.kind, "mutation delivered");
            }
            AttemptOutcome::Rejected { reason } => {
                QueueMetrics::incr(&counters.rejected);
                let retry_count = mutation.retry_count.saturating_add(1);

                if retry_count >= self.queue.config().max_retries {
                    self.queue.dead_letter(&mutation.id, Some(reason)).await?;
                    QueueMetrics::incr(&counters.dead_lettered);
                    report.dead_lettered += 1;
                    warn!(
                        mutation_id = %mutation.id,
                        kind = %mutation.kind,
                        retry_count,
                        "retry budget exhausted, mutation dead-lettered"
                    );
                } else {
                    let delay = self.backoff.delay(retry_count);
                    self.queue
                        .mark_retry(&mutation.id, delay, Some(reason.clone()))
                        .await?;
                    report.retried += 1;
                    warn!(
                        mutation_id = %mutation.id,
                        kind = %mutation.kind,
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "mutation rejected, backing off"
                    );
                }
            }
            AttemptOutcome::Unreachable { reason } => {
                QueueMetrics::incr(&counters.unreachable_halts);
                warn!(mutation_id = %mutation.id, reason = %reason, "transport unreachable, halting drain");
                return Ok(false);
            }
        }

        Ok(true)
    }
}
