//! Audit events and the encrypt-then-sign pipeline.
//!
//! Every admitted operation produces one audit event. Events are
//! canonicalized to JSON, encrypted with the per-day log-encryption key
//! (AES-256-GCM), and the blake3 hash of the *ciphertext* is signed with
//! the node's Ed25519 key. Verification recomputes the hash, verifies the
//! signature, then decrypts — sensitive data never enters the signing
//! pipeline as plaintext.

use crate::audit::policy::Classification;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Result, ThemisError};

/// Operation category recorded in the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Read,
    Write,
    Delete,
    Query,
    VectorSearch,
    GraphTraverse,
    Admin,
}

/// One audit event, pre-encryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// Event timestamp, epoch ms
    pub ts: i64,
    pub category: AuditCategory,
    pub actor: String,
    pub resource_urn: String,
    pub action: String,
    pub classification: Classification,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        category: AuditCategory,
        actor: &str,
        resource_urn: &str,
        action: &str,
        classification: Classification,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts: Utc::now().timestamp_millis(),
            category,
            actor: actor.to_string(),
            resource_urn: resource_urn.to_string(),
            action: action.to_string(),
            classification,
            duration_ms: 0,
            error: None,
        }
    }
}

/// Canonical JSON: recursively key-sorted, no insignificant whitespace.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut sorted = serde_json::Map::new();
                let mut keys: Vec<_> = map.keys().collect();
                keys.sort();
                for k in keys {
                    sorted.insert(k.clone(), sort(&map[k]));
                }
                serde_json::Value::Object(sorted)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Per-day log-encryption key schedule derived from a master key.
#[derive(Clone)]
pub struct LekSchedule {
    master: [u8; 32],
}

impl LekSchedule {
    pub fn new(master: [u8; 32]) -> Self {
        Self { master }
    }

    /// Key id for a timestamp: the UTC date.
    pub fn key_id_for(&self, ts_ms: i64) -> String {
        let dt = DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap_or_else(Utc::now);
        dt.format("%Y-%m-%d").to_string()
    }

    /// Derive the LEK for a key id.
    pub fn key_for(&self, key_id: &str) -> [u8; 32] {
        let context = format!("themis audit lek {key_id}");
        blake3::derive_key(&context, &self.master)
    }

    /// Derive the outer key for double encryption.
    fn outer_key_for(&self, key_id: &str) -> [u8; 32] {
        let context = format!("themis audit lek outer {key_id}");
        blake3::derive_key(&context, &self.master)
    }
}

/// A sealed audit record: ciphertext plus signature metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedAuditRecord {
    pub event_id: Uuid,
    pub ts: i64,
    /// AEAD algorithm identifier
    pub alg: String,
    /// LEK key id (UTC date)
    pub key_id: String,
    pub iv: [u8; 12],
    /// Second IV when double-encrypted
    pub outer_iv: Option<[u8; 12]>,
    /// Additional authenticated data bound into the AEAD
    pub aad: Vec<u8>,
    pub ciphertext: Vec<u8>,
    /// blake3 of `ciphertext` — the signed payload
    pub ciphertext_hash: [u8; 32],
    /// Ed25519 signature over `ciphertext_hash`
    pub signature: Vec<u8>,
    /// Signer key id (hex of the verifying key)
    pub signer: String,
}

/// Seals and verifies audit events for one node.
pub struct AuditSealer {
    lek: LekSchedule,
    signing: SigningKey,
}

impl AuditSealer {
    pub fn new(lek: LekSchedule, signing: SigningKey) -> Self {
        Self { lek, signing }
    }

    /// The node's verifying key, for out-of-band verification.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Encrypt-then-sign one event.
    pub fn seal(&self, event: &AuditEvent, double_encrypt: bool) -> Result<SealedAuditRecord> {
        let plaintext = canonical_json(&serde_json::to_value(event)?);
        let key_id = self.lek.key_id_for(event.ts);
        let aad = format!("{}:{}", event.id, key_id).into_bytes();

        let mut iv = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut iv);
        let mut ciphertext = aead_encrypt(
            &self.lek.key_for(&key_id),
            &iv,
            plaintext.as_bytes(),
            &aad,
        )?;

        let outer_iv = if double_encrypt {
            let mut iv2 = [0u8; 12];
            rand::thread_rng().fill_bytes(&mut iv2);
            ciphertext = aead_encrypt(&self.lek.outer_key_for(&key_id), &iv2, &ciphertext, &aad)?;
            Some(iv2)
        } else {
            None
        };

        let ciphertext_hash: [u8; 32] = *blake3::hash(&ciphertext).as_bytes();
        let signature: Signature = self.signing.sign(&ciphertext_hash);

        Ok(SealedAuditRecord {
            event_id: event.id,
            ts: event.ts,
            alg: "AES-256-GCM+Ed25519".to_string(),
            key_id,
            iv,
            outer_iv,
            aad,
            ciphertext,
            ciphertext_hash,
            signature: signature.to_bytes().to_vec(),
            signer: hex_lower(self.signing.verifying_key().as_bytes()),
        })
    }

    /// Verify a sealed record and decrypt the event.
    ///
    /// Order is hash → signature → decrypt; a tampered ciphertext fails
    /// before any key material touches it.
    pub fn verify(&self, record: &SealedAuditRecord) -> Result<AuditEvent> {
        verify_with(record, &self.signing.verifying_key(), &self.lek)
    }
}

/// Verification against an explicit verifying key (auditor-side path).
pub fn verify_with(
    record: &SealedAuditRecord,
    verifying: &VerifyingKey,
    lek: &LekSchedule,
) -> Result<AuditEvent> {
    let recomputed: [u8; 32] = *blake3::hash(&record.ciphertext).as_bytes();
    if recomputed != record.ciphertext_hash {
        return Err(ThemisError::IndexCorrupt("audit ciphertext hash mismatch".into()));
    }
    let sig_bytes: [u8; 64] = record
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| ThemisError::IndexCorrupt("bad audit signature length".into()))?;
    let signature = Signature::from_bytes(&sig_bytes);
    verifying
        .verify(&record.ciphertext_hash, &signature)
        .map_err(|_| ThemisError::IndexCorrupt("audit signature invalid".into()))?;

    let mut plaintext = record.ciphertext.clone();
    if let Some(outer_iv) = record.outer_iv {
        plaintext = aead_decrypt(
            &lek.outer_key_for(&record.key_id),
            &outer_iv,
            &plaintext,
            &record.aad,
        )?;
    }
    let plaintext = aead_decrypt(&lek.key_for(&record.key_id), &record.iv, &plaintext, &record.aad)?;

    Ok(serde_json::from_slice(&plaintext)?)
}

fn aead_encrypt(key: &[u8; 32], iv: &[u8; 12], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(iv), Payload { msg, aad })
        .map_err(|_| ThemisError::internal("audit encryption failed"))
}

fn aead_decrypt(key: &[u8; 32], iv: &[u8; 12], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(iv), Payload { msg, aad })
        .map_err(|_| ThemisError::IndexCorrupt("audit decryption failed".into()))
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn sealer() -> AuditSealer {
        AuditSealer::new(LekSchedule::new([7u8; 32]), SigningKey::generate(&mut OsRng))
    }

    fn sample_event() -> AuditEvent {
        AuditEvent::new(
            AuditCategory::Write,
            "svc:ingest",
            "urn:themis:relational:t:users:8f14e45f-ceea-4e7f-a2f0-946c61bfb0cd",
            "put",
            Classification::Geheim,
        )
    }

    #[test]
    fn test_seal_verify_roundtrip() {
        let sealer = sealer();
        let event = sample_event();
        let record = sealer.seal(&event, false).unwrap();
        let recovered = sealer.verify(&record).unwrap();
        assert_eq!(recovered.id, event.id);
        assert_eq!(recovered.resource_urn, event.resource_urn);
        assert_eq!(recovered.classification, Classification::Geheim);
    }

    #[test]
    fn test_double_encrypt_roundtrip() {
        let sealer = sealer();
        let event = sample_event();
        let record = sealer.seal(&event, true).unwrap();
        assert!(record.outer_iv.is_some());
        let recovered = sealer.verify(&record).unwrap();
        assert_eq!(recovered.id, event.id);
    }

    #[test]
    fn test_tampered_ciphertext_fails_before_decrypt() {
        let sealer = sealer();
        let mut record = sealer.seal(&sample_event(), false).unwrap();
        record.ciphertext[0] ^= 0xFF;
        assert!(matches!(
            sealer.verify(&record),
            Err(ThemisError::IndexCorrupt(_))
        ));
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let sealer_a = sealer();
        let sealer_b = sealer();
        let record = sealer_a.seal(&sample_event(), false).unwrap();
        assert!(verify_with(
            &record,
            &sealer_b.verifying_key(),
            &LekSchedule::new([7u8; 32])
        )
        .is_err());
    }

    #[test]
    fn test_signature_covers_ciphertext_not_plaintext() {
        // Two events with identical content still sign different hashes
        // because the IV randomizes the ciphertext.
        let sealer = sealer();
        let event = sample_event();
        let r1 = sealer.seal(&event, false).unwrap();
        let r2 = sealer.seal(&event, false).unwrap();
        assert_ne!(r1.ciphertext_hash, r2.ciphertext_hash);
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let v = serde_json::json!({"b": 1, "a": {"d": 2, "c": 3}});
        assert_eq!(canonical_json(&v), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn test_lek_differs_per_day() {
        let lek = LekSchedule::new([1u8; 32]);
        assert_ne!(lek.key_for("2026-08-01"), lek.key_for("2026-08-02"));
    }
}
