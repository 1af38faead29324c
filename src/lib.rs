//! Durable client-side mutation queue with a single-flight flush engine.
//!
//! Producers [`enqueue`](MutationQueue::enqueue) state changes that must reach
//! the remote service eventually. Platform events drive a [`FlushEngine`]
//! (usually through a [`SyncManager`]) that delivers them through a
//! [`Transport`], backing off rejected mutations and dead-lettering those that
//! exhaust their retry budget. Every decision is persisted through a
//! [`PersistentStore`] before the next one is made.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod backoff;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod dead_letter;
pub mod engine;
pub mod envelope;
pub mod manager;
pub mod metrics;
pub mod model;
pub mod queue;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub mod sqlite;
pub mod store;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QueueConfig;
pub use crypto::{CryptoError, CryptoProvider, EncryptedStore, StoreContext, XChaChaProvider};
pub use dead_letter::{DeadLetter, DeadLetterLog};
pub use engine::{FlushEngine, FlushOutcome, FlushReport};
pub use manager::{SyncEvent, SyncManager};
pub use metrics::{MetricsSnapshot, QueueMetrics};
pub use model::{MutationId, MutationKind, MutationStatus, PendingMutation, UnixTimeMs};
pub use queue::{MutationQueue, QueueError, QueueStats};
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use sqlite::SqliteStore;
pub use store::{FileStore, MemoryStore, PersistentStore, StoreError};
pub use transport::{AttemptOutcome, Transport};
