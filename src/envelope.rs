//! Persisted layout of the queue: a versioned, checksummed CBOR record.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::dead_letter::DeadLetterLog;
use crate::model::PendingMutation;
use crate::store::StoreError;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
const MIN_SCHEMA_VERSION: u32 = 1;
pub const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;
const RECORD_MAGIC: &[u8; 4] = b"MQST";

/// Everything the queue owns on disk: the active mutations in insertion order
/// and the dead-letter log.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueDocument {
    pub mutations: Vec<PendingMutation>,
    pub dead_letters: DeadLetterLog,
}

#[derive(Serialize, Deserialize, Debug)]
struct RecordEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub fn encode(document: &QueueDocument) -> Result<Vec<u8>, StoreError> {
    encode_with_limit(document, MAX_RECORD_BYTES)
}

/// Encode, failing with [`StoreError::StoreTooLarge`] above `max_bytes`.
pub fn encode_with_limit(document: &QueueDocument, max_bytes: usize) -> Result<Vec<u8>, StoreError> {
    let max_bytes = max_bytes.min(MAX_RECORD_BYTES);
    let mut payload_bytes = Vec::new();
    ciborium::into_writer(document, &mut payload_bytes)?;

    let checksum = blake3::hash(&payload_bytes);

    let envelope = RecordEnvelope {
        magic: *RECORD_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        payload: payload_bytes,
    };

    let mut envelope_bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut envelope_bytes)?;

    if envelope_bytes.len() > max_bytes {
        return Err(StoreError::StoreTooLarge {
            size: envelope_bytes.len(),
            max: max_bytes,
        });
    }

    Ok(envelope_bytes)
}

pub fn decode(bytes: &[u8]) -> Result<QueueDocument, StoreError> {
    if bytes.is_empty() {
        return Err(StoreError::Corrupted {
            reason: "empty record",
        });
    }

    if bytes.len() > MAX_RECORD_BYTES {
        return Err(StoreError::StoreTooLarge {
            size: bytes.len(),
            max: MAX_RECORD_BYTES,
        });
    }

    let envelope: RecordEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *RECORD_MAGIC {
        return Err(StoreError::Corrupted {
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    if envelope.schema_version < MIN_SCHEMA_VERSION {
        return Err(StoreError::UnknownSchema(envelope.schema_version));
    }

    let actual_checksum = blake3::hash(&envelope.payload);
    if actual_checksum.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual_checksum.as_bytes()),
        });
    }

    let document: QueueDocument = ciborium::from_reader(&envelope.payload[..])?;

    let dead: HashSet<_> = document.dead_letters.entries().iter().map(|l| &l.id).collect();
    let mut seen = HashSet::with_capacity(document.mutations.len());
    for mutation in &document.mutations {
        if !seen.insert(&mutation.id) || dead.contains(&mutation.id) {
            return Err(StoreError::DuplicateMutationId(mutation.id.to_string()));
        }
    }

    Ok(document)
}
