//! Safety numbers and trust tracking for remote identities.
//!
//! Each party's half of the safety number is SHA-512 iterated over its
//! identity key and stable identifier; the two halves are concatenated in
//! stable-ID order so both sides display the same 60 digits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::error::CryptoError;
use crate::identity::IdentityPublicKey;
use crate::keychain::{KEY_TRUST_TABLE, VAULT_TRUST};
use crate::keystore::KeyStore;

const FINGERPRINT_VERSION: u16 = 0;
const ITERATIONS: usize = 5200;
const HALF_LEN: usize = 30;
const DIGIT_GROUP: usize = 5;

/// A 60-digit comparable fingerprint. Not secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyNumber {
    digits: String,
}

impl SafetyNumber {
    /// The 60 digits without separators.
    pub fn digits(&self) -> &str {
        &self.digits
    }

    /// Compare against a number typed or scanned by the user; whitespace is
    /// ignored.
    pub fn matches(&self, other: &str) -> bool {
        let cleaned: String = other.chars().filter(|c| !c.is_whitespace()).collect();
        cleaned == self.digits
    }
}

impl std::fmt::Display for SafetyNumber {
    /// Twelve groups of five digits.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let groups: Vec<&str> = self
            .digits
            .as_bytes()
            .chunks(DIGIT_GROUP)
            .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
            .collect();
        f.write_str(&groups.join(" "))
    }
}

pub struct SafetyVerifier;

impl SafetyVerifier {
    /// Deterministic and symmetric: swapping the local and remote arguments
    /// yields the same number.
    pub fn compute_fingerprint(
        local_identity: &IdentityPublicKey,
        local_stable_id: &str,
        remote_identity: &IdentityPublicKey,
        remote_stable_id: &str,
    ) -> SafetyNumber {
        let local = (local_stable_id, local_identity);
        let remote = (remote_stable_id, remote_identity);
        let (first, second) = if local <= remote {
            (local, remote)
        } else {
            (remote, local)
        };

        let mut digits = party_digits(first.1, first.0);
        digits.push_str(&party_digits(second.1, second.0));
        SafetyNumber { digits }
    }
}

fn party_digits(key: &IdentityPublicKey, stable_id: &str) -> String {
    let mut hash = Sha512::new()
        .chain_update(FINGERPRINT_VERSION.to_be_bytes())
        .chain_update(key.as_bytes())
        .chain_update(stable_id.as_bytes())
        .finalize();
    for _ in 0..ITERATIONS {
        hash = Sha512::new()
            .chain_update(hash)
            .chain_update(key.as_bytes())
            .finalize();
    }

    hash[..HALF_LEN]
        .chunks(5)
        .map(|chunk| {
            let value = chunk
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
            format!("{:05}", value % 100_000)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustStatus {
    Unverified,
    Verified,
}

/// What observing a remote identity key revealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustEvent {
    FirstSeen,
    Unchanged,
    /// The key differs from the one on record. Any earlier verification has
    /// been withdrawn; surface this to the user.
    Changed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrustEntry {
    identity_key: IdentityPublicKey,
    status: TrustStatus,
}

/// Remembered remote identity keys and their verification status.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TrustStore {
    entries: BTreeMap<String, TrustEntry>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, remote_id: &str, identity_key: &IdentityPublicKey) -> TrustEvent {
        match self.entries.get_mut(remote_id) {
            None => {
                self.entries.insert(
                    remote_id.to_string(),
                    TrustEntry {
                        identity_key: *identity_key,
                        status: TrustStatus::Unverified,
                    },
                );
                TrustEvent::FirstSeen
            }
            Some(entry) if entry.identity_key == *identity_key => TrustEvent::Unchanged,
            Some(entry) => {
                tracing::warn!(
                    remote = %remote_id,
                    previous = %entry.identity_key.to_hex(),
                    current = %identity_key.to_hex(),
                    "remote identity key changed, conversation marked unverified"
                );
                entry.identity_key = *identity_key;
                entry.status = TrustStatus::Unverified;
                TrustEvent::Changed
            }
        }
    }

    pub fn status(&self, remote_id: &str) -> Option<TrustStatus> {
        self.entries.get(remote_id).map(|e| e.status)
    }

    pub fn identity_key(&self, remote_id: &str) -> Option<IdentityPublicKey> {
        self.entries.get(remote_id).map(|e| e.identity_key)
    }

    /// Mark `remote_id` verified if `scanned` matches the safety number
    /// computed from the keys on record.
    pub fn verify(
        &mut self,
        local_identity: &IdentityPublicKey,
        local_id: &str,
        remote_id: &str,
        scanned: &str,
    ) -> Result<(), CryptoError> {
        let entry = self
            .entries
            .get_mut(remote_id)
            .ok_or_else(|| CryptoError::NoSession(remote_id.to_string()))?;
        let expected = SafetyVerifier::compute_fingerprint(
            local_identity,
            local_id,
            &entry.identity_key,
            remote_id,
        );
        if !expected.matches(scanned) {
            tracing::warn!(remote = %remote_id, "safety number mismatch");
            entry.status = TrustStatus::Unverified;
            return Err(CryptoError::SafetyNumberMismatch);
        }
        entry.status = TrustStatus::Verified;
        tracing::info!(remote = %remote_id, "safety number verified");
        Ok(())
    }

    pub fn save(&self, store: &KeyStore) -> Result<(), CryptoError> {
        let bytes = zeroize::Zeroizing::new(bincode::serialize(self)?);
        store.put(VAULT_TRUST, KEY_TRUST_TABLE, &bytes)
    }

    pub fn load(store: &KeyStore) -> Result<Self, CryptoError> {
        match store.get(VAULT_TRUST, KEY_TRUST_TABLE)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Self::new()),
        }
    }
}
