use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Globally unique mutation identifier, assigned at enqueue time.
///
/// Doubles as the idempotency key a transport forwards to the remote side.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MutationId(String);

impl MutationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MutationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Routing tag for the transport. Never used for ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    Telemetry,
    ProfileUpdate,
    DeviceConfig,
}

impl MutationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Telemetry => "telemetry",
            MutationKind::ProfileUpdate => "profile-update",
            MutationKind::DeviceConfig => "device-config",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    #[must_use]
    pub fn saturating_add(self, delay: Duration) -> Self {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// Milliseconds from `earlier` to `self`, zero if `earlier` is later.
    pub fn millis_since(self, earlier: UnixTimeMs) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Where a mutation currently lives. Delivered mutations have no status: they are gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    DeadLettered,
}

/// A queued state change awaiting remote acknowledgement.
///
/// Created by enqueue, mutated only by the flush engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PendingMutation {
    pub id: MutationId,
    pub kind: MutationKind,
    /// Transport-defined; the queue never looks inside.
    pub payload: serde_json::Value,
    pub enqueued_at: UnixTimeMs,
    pub retry_count: u32,
    pub next_eligible_at: UnixTimeMs,
    /// Reason given by the remote side for the most recent rejection.
    #[serde(default)]
    pub last_rejection: Option<String>,
}

impl PendingMutation {
    pub fn new(kind: MutationKind, payload: serde_json::Value, now: UnixTimeMs) -> Self {
        Self {
            id: MutationId::generate(),
            kind,
            payload,
            enqueued_at: now,
            retry_count: 0,
            next_eligible_at: now,
            last_rejection: None,
        }
    }

    pub fn is_eligible(&self, now: UnixTimeMs) -> bool {
        self.next_eligible_at <= now
    }
}
