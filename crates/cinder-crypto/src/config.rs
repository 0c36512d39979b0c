use serde::Deserialize;

use crate::error::CryptoError;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Tunables for prekey lifecycle and ratchet resource bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Largest counter jump accepted within a single receiving chain.
    pub max_skip_per_chain: u32,
    /// Capacity of the skipped message key cache; the oldest entry is evicted.
    pub max_skipped_keys: usize,
    /// How many consumed `(ratchet key, counter)` pairs are remembered.
    pub replay_window: usize,
    /// How many previous remote ratchet keys are remembered.
    pub retired_chain_memory: usize,
    pub signed_prekey_rotation_secs: u64,
    /// How long a replaced signed prekey still accepts handshakes.
    pub signed_prekey_grace_secs: u64,
    /// Bundles whose signed prekey is older than this are refused.
    pub signed_prekey_max_age_secs: u64,
    pub one_time_prekey_batch: u32,
    pub one_time_prekey_low_water: usize,
    /// How many accepted handshake base keys are remembered, so a replayed
    /// first message cannot establish a session twice.
    pub accepted_handshake_memory: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_skip_per_chain: 1000,
            max_skipped_keys: 1000,
            replay_window: 2000,
            retired_chain_memory: 16,
            signed_prekey_rotation_secs: 7 * DAY_SECS,
            signed_prekey_grace_secs: 2 * DAY_SECS,
            signed_prekey_max_age_secs: 30 * DAY_SECS,
            one_time_prekey_batch: 100,
            one_time_prekey_low_water: 10,
            accepted_handshake_memory: 1000,
        }
    }
}

impl ProtocolConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        serde_json::from_str(json).map_err(|e| CryptoError::Serialization(e.to_string()))
    }
}

/// Argon2id cost parameters for PIN stretching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// Production: `m=65536, t=3, p=4`.
    /// Debug builds: `m=256, t=1, p=1` (fast iteration).
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self {
                memory_kib: 256,
                iterations: 1,
                parallelism: 1,
            }
        } else {
            Self {
                memory_kib: 65536,
                iterations: 3,
                parallelism: 4,
            }
        }
    }
}

/// Device lock policy.
///
/// Enabling `wipe_after_failures` makes failed PIN entry destructive. Hosts
/// must show [`LockPolicy::wipe_warning`] to the user before turning it on.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockPolicy {
    pub wipe_after_failures: Option<u32>,
    pub inactivity_timeout_secs: u64,
    pub kdf: KdfParams,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            wipe_after_failures: Some(10),
            inactivity_timeout_secs: 300,
            kdf: KdfParams::default(),
        }
    }
}

impl LockPolicy {
    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        serde_json::from_str(json).map_err(|e| CryptoError::Serialization(e.to_string()))
    }

    /// User-facing description of the wipe trade-off, if wiping is enabled.
    pub fn wipe_warning(&self) -> Option<String> {
        self.wipe_after_failures.map(|n| {
            format!(
                "After {n} consecutive wrong PIN entries all keys on this device are erased. \
                 Messages can only be recovered with your recovery code."
            )
        })
    }
}
