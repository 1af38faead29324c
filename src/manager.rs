//! Session-scoped owner of the queue and its flush engine.
//!
//! Hosts construct one [`SyncManager`] per signed-in session and hand it to
//! producers and to the platform event hooks that request flushes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument};

use crate::engine::{FlushEngine, FlushReport};
use crate::model::{MutationId, MutationKind};
use crate::queue::{MutationQueue, QueueError};
use crate::store::PersistentStore;
use crate::transport::Transport;

/// Platform signals that may warrant a flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    ConnectivityChanged { online: bool },
    AppForegrounded,
    TimerElapsed,
    /// Explicit user or host request. Flushes even when the device is believed offline.
    Manual,
}

pub struct SyncManager<S: PersistentStore, T: Transport> {
    queue: Arc<MutationQueue<S>>,
    engine: FlushEngine<S, T>,
    online: AtomicBool,
}

impl<S: PersistentStore, T: Transport> SyncManager<S, T> {
    /// Connectivity starts out assumed online until the host reports otherwise.
    pub fn new(queue: Arc<MutationQueue<S>>, transport: Arc<T>) -> Self {
        let engine = FlushEngine::new(queue.clone(), transport);
        Self {
            queue,
            engine,
            online: AtomicBool::new(true),
        }
    }

    pub fn queue(&self) -> &Arc<MutationQueue<S>> {
        &self.queue
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub async fn enqueue(
        &self,
        kind: MutationKind,
        payload: serde_json::Value,
    ) -> Result<MutationId, QueueError> {
        self.queue.enqueue(kind, payload).await
    }

    pub async fn flush(&self) -> Result<FlushReport, QueueError> {
        self.engine.flush().await
    }

    /// Apply `event`, flushing when it calls for one. `Ok(None)` means no flush ran.
    #[instrument(skip(self))]
    pub async fn handle(&self, event: SyncEvent) -> Result<Option<FlushReport>, QueueError> {
        match event {
            SyncEvent::ConnectivityChanged { online } => {
                let was_online = self.online.swap(online, Ordering::AcqRel);
                if was_online != online {
                    info!(online, "connectivity changed");
                }
                if !online {
                    return Ok(None);
                }
            }
            SyncEvent::AppForegrounded | SyncEvent::TimerElapsed => {
                if !self.is_online() {
                    debug!("offline, flush skipped");
                    return Ok(None);
                }
            }
            SyncEvent::Manual => {}
        }

        self.engine.flush().await.map(Some)
    }

    /// Feed [`SyncEvent::TimerElapsed`] every `period` until `shutdown` flips to
    /// `true` or its sender is dropped. Flush errors are logged and the loop keeps going.
    pub async fn run_periodic(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.handle(SyncEvent::TimerElapsed).await {
                        error!(error = %e, "periodic flush failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("periodic flush loop stopped");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::engine::FlushOutcome;
    use crate::model::PendingMutation;
    use crate::store::MemoryStore;
    use crate::transport::AttemptOutcome;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingTransport {
        attempts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Transport for CountingTransport {
        async fn attempt(&self, _mutation: &PendingMutation) -> AttemptOutcome {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            AttemptOutcome::Delivered
        }
    }

    async fn manager() -> (
        SyncManager<MemoryStore, CountingTransport>,
        Arc<CountingTransport>,
    ) {
        let queue = MutationQueue::open(Arc::new(MemoryStore::new()), QueueConfig::default())
            .await
            .unwrap();
        let transport = Arc::new(CountingTransport::default());
        (SyncManager::new(Arc::new(queue), transport.clone()), transport)
    }

    #[tokio::test]
    async fn test_offline_suppresses_automatic_flushes() {
        let (manager, transport) = manager().await;
        manager
            .enqueue(MutationKind::Telemetry, json!({"spo2": 97}))
            .await
            .unwrap();

        let report = manager
            .handle(SyncEvent::ConnectivityChanged { online: false })
            .await
            .unwrap();
        assert!(report.is_none());
        assert!(!manager.is_online());

        assert!(manager.handle(SyncEvent::AppForegrounded).await.unwrap().is_none());
        assert!(manager.handle(SyncEvent::TimerElapsed).await.unwrap().is_none());
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 0);

        let report = manager
            .handle(SyncEvent::ConnectivityChanged { online: true })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert!(manager.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_manual_flush_ignores_connectivity() {
        let (manager, transport) = manager().await;
        manager
            .handle(SyncEvent::ConnectivityChanged { online: false })
            .await
            .unwrap();
        manager
            .enqueue(MutationKind::DeviceConfig, json!({"led": "off"}))
            .await
            .unwrap();

        let report = manager.handle(SyncEvent::Manual).await.unwrap().unwrap();

        assert_eq!(report.outcome, FlushOutcome::Drained);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_periodic_loop_flushes_until_shutdown() {
        let (manager, transport) = manager().await;
        let manager = Arc::new(manager);
        manager
            .enqueue(MutationKind::Telemetry, json!(1))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let runner = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.run_periodic(Duration::from_millis(10), rx).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        runner.await.unwrap();

        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        assert!(manager.queue().is_empty().await);
        assert!(manager.queue().metrics().drains >= 1);
    }
}
