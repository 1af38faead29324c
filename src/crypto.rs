//! Encryption at rest for the queue record.
//!
//! Sealed layout: magic(8) | version u32 LE | alg(1) | nonce(24) | ciphertext | tag(16).

use aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use secrecy::{ExposeSecret, Secret};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{instrument, warn};
use zeroize::Zeroize;

use crate::store::{PersistentStore, StoreError};

const ENVELOPE_MAGIC: [u8; 8] = *b"MQSEAL01";
const CURRENT_VERSION: u32 = 1;
const MIN_SUPPORTED_VERSION: u32 = 1;
const NONCE_SIZE: usize = 24;
const HEADER_SIZE: usize = 8 + 4 + 1 + NONCE_SIZE;
const TAG_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;
const MAX_AAD_FIELD: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptFailure {
    MalformedEnvelope,
    UnsupportedVersion { version: u32 },
    UnsupportedAlgorithm { alg: u8 },
    AuthenticationFailed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("randomness unavailable")]
    RandomUnavailable,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: {0:?}")]
    DecryptionFailed(DecryptFailure),

    #[error("aad required but empty")]
    AadRequired,

    #[error("aad field too large: {field} has {size} > {max}")]
    AadFieldTooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },
}

pub trait CryptoProvider: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

pub trait RandomProvider: Send + Sync {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError>;
}

pub struct OsRng;

impl RandomProvider for OsRng {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError> {
        getrandom::getrandom(out).map_err(|_| CryptoError::RandomUnavailable)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AlgId {
    XChaCha20Poly1305 = 1,
}

impl TryFrom<u8> for AlgId {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            1 => Ok(AlgId::XChaCha20Poly1305),
            other => Err(other),
        }
    }
}

/// Single-key XChaCha20-Poly1305 sealer. The host owns key storage and rotation.
pub struct XChaChaProvider<R: RandomProvider = OsRng> {
    key: Secret<[u8; KEY_SIZE]>,
    rng: R,
    decrypt_failures: AtomicU64,
}

impl XChaChaProvider<OsRng> {
    pub fn with_os_rng(key_bytes: &[u8]) -> Result<Self, CryptoError> {
        Self::new(key_bytes, OsRng)
    }
}

impl<R: RandomProvider> XChaChaProvider<R> {
    pub fn new(key_bytes: &[u8], rng: R) -> Result<Self, CryptoError> {
        if key_bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: key_bytes.len(),
            });
        }

        let mut k = [0u8; KEY_SIZE];
        k.copy_from_slice(key_bytes);
        let key = Secret::new(k);
        k.zeroize();

        Ok(Self {
            key,
            rng,
            decrypt_failures: AtomicU64::new(0),
        })
    }

    pub fn decrypt_failures(&self) -> u64 {
        self.decrypt_failures.load(Ordering::Relaxed)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.key.expose_secret()))
    }

    fn open(&self, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if aad.is_empty() {
            return Err(CryptoError::AadRequired);
        }

        if envelope.len() < HEADER_SIZE + TAG_SIZE || envelope[0..8] != ENVELOPE_MAGIC {
            return Err(CryptoError::DecryptionFailed(
                DecryptFailure::MalformedEnvelope,
            ));
        }

        let mut version_bytes = [0u8; 4];
        version_bytes.copy_from_slice(&envelope[8..12]);
        let version = u32::from_le_bytes(version_bytes);
        if !(MIN_SUPPORTED_VERSION..=CURRENT_VERSION).contains(&version) {
            return Err(CryptoError::DecryptionFailed(
                DecryptFailure::UnsupportedVersion { version },
            ));
        }

        let alg_byte = envelope[12];
        AlgId::try_from(alg_byte).map_err(|_| {
            CryptoError::DecryptionFailed(DecryptFailure::UnsupportedAlgorithm { alg: alg_byte })
        })?;

        let nonce = XNonce::from_slice(&envelope[13..HEADER_SIZE]);
        let body = &envelope[HEADER_SIZE..];
        let ct_len = body.len() - TAG_SIZE;
        let mut buffer = body[..ct_len].to_vec();
        let tag = &body[ct_len..];

        if self
            .cipher()
            .decrypt_in_place_detached(nonce, aad, &mut buffer, tag.into())
            .is_err()
        {
            buffer.zeroize();
            return Err(CryptoError::DecryptionFailed(
                DecryptFailure::AuthenticationFailed,
            ));
        }

        Ok(buffer)
    }
}

impl<R: RandomProvider> CryptoProvider for XChaChaProvider<R> {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if aad.is_empty() {
            return Err(CryptoError::AadRequired);
        }

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce_bytes)?;

        let pt_end = HEADER_SIZE + plaintext.len();
        let mut out = vec![0u8; pt_end + TAG_SIZE];

        out[0..8].copy_from_slice(&ENVELOPE_MAGIC);
        out[8..12].copy_from_slice(&CURRENT_VERSION.to_le_bytes());
        out[12] = AlgId::XChaCha20Poly1305 as u8;
        out[13..HEADER_SIZE].copy_from_slice(&nonce_bytes);
        out[HEADER_SIZE..pt_end].copy_from_slice(plaintext);

        let tag = self
            .cipher()
            .encrypt_in_place_detached(
                XNonce::from_slice(&nonce_bytes),
                aad,
                &mut out[HEADER_SIZE..pt_end],
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        out[pt_end..].copy_from_slice(&tag);
        Ok(out)
    }

    fn decrypt(&self, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let result = self.open(envelope, aad);
        if result.is_err() {
            self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

/// Identity the sealed record is bound to. A record written for one user or
/// device fails authentication when loaded under another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreContext {
    pub user_id: String,
    pub device_id: String,
}

impl StoreContext {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }

    pub fn to_aad(&self) -> Result<Vec<u8>, CryptoError> {
        const NAMESPACE: &str = "offline-sync/queue";

        let fields: [(&'static str, &str); 3] = [
            ("namespace", NAMESPACE),
            ("user_id", &self.user_id),
            ("device_id", &self.device_id),
        ];

        let mut aad = Vec::new();
        for (name, value) in fields {
            if value.len() > MAX_AAD_FIELD {
                return Err(CryptoError::AadFieldTooLarge {
                    field: name,
                    size: value.len(),
                    max: MAX_AAD_FIELD,
                });
            }
            aad.extend_from_slice(&(value.len() as u16).to_le_bytes());
            aad.extend_from_slice(value.as_bytes());
        }
        Ok(aad)
    }
}

/// Seals every saved blob before handing it to the inner store.
pub struct EncryptedStore<S, C = XChaChaProvider> {
    inner: S,
    crypto: C,
    aad: Vec<u8>,
}

impl<S: PersistentStore, C: CryptoProvider> EncryptedStore<S, C> {
    pub fn new(inner: S, crypto: C, context: &StoreContext) -> Result<Self, CryptoError> {
        Ok(Self {
            inner,
            crypto,
            aad: context.to_aad()?,
        })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait::async_trait]
impl<S: PersistentStore, C: CryptoProvider> PersistentStore for EncryptedStore<S, C> {
    #[instrument(skip(self))]
    async fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(sealed) = self.inner.load().await? else {
            return Ok(None);
        };

        match self.crypto.decrypt(&sealed, &self.aad) {
            Ok(plain) => Ok(Some(plain)),
            Err(e) => {
                warn!(error = %e, "sealed queue record failed to open");
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    async fn save(&self, mut bytes: Vec<u8>) -> Result<(), StoreError> {
        let sealed = self.crypto.encrypt(&bytes, &self.aad);
        bytes.zeroize();
        self.inner.save(sealed?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    struct SequentialRng {
        counter: AtomicU64,
    }

    impl SequentialRng {
        fn new() -> Self {
            Self {
                counter: AtomicU64::new(1),
            }
        }
    }

    impl RandomProvider for SequentialRng {
        fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError> {
            let val = self.counter.fetch_add(1, Ordering::SeqCst);
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = ((val >> ((i % 8) * 8)) ^ (i as u64)) as u8;
            }
            Ok(())
        }
    }

    struct BrokenRng;

    impl RandomProvider for BrokenRng {
        fn fill(&self, _out: &mut [u8]) -> Result<(), CryptoError> {
            Err(CryptoError::RandomUnavailable)
        }
    }

    fn provider() -> XChaChaProvider<SequentialRng> {
        XChaChaProvider::new(&[7u8; KEY_SIZE], SequentialRng::new()).unwrap()
    }

    fn aad() -> Vec<u8> {
        StoreContext::new("user-1", "device-1").to_aad().unwrap()
    }

    #[test]
    fn roundtrip() {
        let p = provider();
        let enc = p.encrypt(b"queue bytes", &aad()).unwrap();
        assert_eq!(enc.len(), HEADER_SIZE + 11 + TAG_SIZE);
        assert_eq!(p.decrypt(&enc, &aad()).unwrap(), b"queue bytes");
    }

    #[test]
    fn nonces_differ_between_seals() {
        let p = provider();
        let a = p.encrypt(b"same", &aad()).unwrap();
        let b = p.encrypt(b"same", &aad()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_context_fails() {
        let p = provider();
        let enc = p.encrypt(b"hello", &aad()).unwrap();
        let other = StoreContext::new("user-2", "device-1").to_aad().unwrap();

        let err = p.decrypt(&enc, &other).unwrap_err();
        assert_eq!(
            err,
            CryptoError::DecryptionFailed(DecryptFailure::AuthenticationFailed)
        );
        assert_eq!(p.decrypt_failures(), 1);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let p = provider();
        let mut enc = p.encrypt(b"hello", &aad()).unwrap();
        enc[HEADER_SIZE] ^= 0x01;

        assert!(matches!(
            p.decrypt(&enc, &aad()),
            Err(CryptoError::DecryptionFailed(
                DecryptFailure::AuthenticationFailed
            ))
        ));
    }

    #[test]
    fn truncated_and_foreign_envelopes_are_malformed() {
        let p = provider();
        let malformed = CryptoError::DecryptionFailed(DecryptFailure::MalformedEnvelope);

        assert_eq!(p.decrypt(&[0u8; 10], &aad()).unwrap_err(), malformed);

        let mut enc = p.encrypt(b"x", &aad()).unwrap();
        enc[0] = b'X';
        assert_eq!(p.decrypt(&enc, &aad()).unwrap_err(), malformed);
    }

    #[test]
    fn unsupported_version_and_alg() {
        let p = provider();
        let enc = p.encrypt(b"x", &aad()).unwrap();

        let mut bad_version = enc.clone();
        bad_version[8..12].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            p.decrypt(&bad_version, &aad()),
            Err(CryptoError::DecryptionFailed(
                DecryptFailure::UnsupportedVersion { version: 9 }
            ))
        ));

        let mut bad_alg = enc;
        bad_alg[12] = 42;
        assert!(matches!(
            p.decrypt(&bad_alg, &aad()),
            Err(CryptoError::DecryptionFailed(
                DecryptFailure::UnsupportedAlgorithm { alg: 42 }
            ))
        ));
    }

    #[test]
    fn bad_key_length_rejected() {
        let err = XChaChaProvider::new(&[0u8; 16], SequentialRng::new())
            .err()
            .unwrap();
        assert_eq!(
            err,
            CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: 16
            }
        );
    }

    #[test]
    fn empty_aad_rejected() {
        let p = provider();
        assert_eq!(p.encrypt(b"x", &[]).unwrap_err(), CryptoError::AadRequired);
    }

    #[test]
    fn rng_failure_surfaces() {
        let p = XChaChaProvider::new(&[1u8; KEY_SIZE], BrokenRng).unwrap();
        assert_eq!(
            p.encrypt(b"x", &aad()).unwrap_err(),
            CryptoError::RandomUnavailable
        );
    }

    #[test]
    fn oversized_context_field_rejected() {
        let ctx = StoreContext::new("u".repeat(MAX_AAD_FIELD + 1), "d");
        assert!(matches!(
            ctx.to_aad(),
            Err(CryptoError::AadFieldTooLarge {
                field: "user_id",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn encrypted_store_seals_inner_blob() {
        let store = EncryptedStore::new(
            MemoryStore::new(),
            provider(),
            &StoreContext::new("user-1", "device-1"),
        )
        .unwrap();

        assert!(store.load().await.unwrap().is_none());

        store.save(b"plain queue record".to_vec()).await.unwrap();

        let raw = store.inner().contents().unwrap();
        assert_eq!(&raw[0..8], &ENVELOPE_MAGIC);
        assert!(!raw
            .windows(b"plain".len())
            .any(|w| w == b"plain"));

        assert_eq!(
            store.load().await.unwrap(),
            Some(b"plain queue record".to_vec())
        );
    }

    #[tokio::test]
    async fn encrypted_store_rejects_other_device() {
        let sealed = {
            let store = EncryptedStore::new(
                MemoryStore::new(),
                provider(),
                &StoreContext::new("user-1", "device-1"),
            )
            .unwrap();
            store.save(b"record".to_vec()).await.unwrap();
            store.inner().contents().unwrap()
        };

        let store = EncryptedStore::new(
            MemoryStore::with_contents(sealed),
            provider(),
            &StoreContext::new("user-1", "device-2"),
        )
        .unwrap();

        assert!(matches!(
            store.load().await,
            Err(StoreError::Crypto(CryptoError::DecryptionFailed(_)))
        ));
    }
}
