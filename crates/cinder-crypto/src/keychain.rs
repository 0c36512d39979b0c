use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::CryptoError;

/// Raw blob storage behind the key store.
///
/// The core never hands plaintext key material to a `Keychain`: everything
/// except the device lock record is wrapped under the master key first. The
/// backend (file, database, platform keystore) is the host's choice.
pub trait Keychain: Send + Sync {
    /// Store a blob under a vault/key pair, replacing any previous value.
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError>;

    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError>;

    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError>;

    /// Names of all keys in a vault, sorted.
    fn list_keys(&self, vault: &str) -> Result<Vec<String>, CryptoError>;

    /// Irreversibly remove every vault.
    fn wipe(&self) -> Result<(), CryptoError>;
}

// Vault and key constants used throughout the crate.

/// Vault for the device lock record (stored unwrapped; it is the gate).
pub const VAULT_LOCK: &str = "lock";
pub const KEY_LOCK_RECORD: &str = "record";

/// Vault for identity and prekey material.
pub const VAULT_IDENTITY: &str = "identity";
pub const KEY_IDENTITY_MATERIAL: &str = "material";

/// Vault for ratchet sessions, one blob per `(local, remote)` device pair.
pub const VAULT_SESSIONS: &str = "sessions";

/// Vault for remembered remote identity keys and verification status.
pub const VAULT_TRUST: &str = "trust";
pub const KEY_TRUST_TABLE: &str = "table";

/// In-memory keychain for tests and ephemeral devices.
#[derive(Default)]
pub struct MemoryKeychain {
    entries: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored blobs across all vaults.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Every raw blob currently stored, for inspecting what reaches disk.
    pub fn raw_blobs(&self) -> Vec<Vec<u8>> {
        self.entries.lock().values().cloned().collect()
    }
}

impl Keychain for MemoryKeychain {
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        self.entries
            .lock()
            .insert((vault.to_string(), key.to_string()), data.to_vec());
        Ok(())
    }

    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self
            .entries
            .lock()
            .get(&(vault.to_string(), key.to_string()))
            .cloned())
    }

    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError> {
        self.entries
            .lock()
            .remove(&(vault.to_string(), key.to_string()));
        Ok(())
    }

    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError> {
        Ok(self
            .entries
            .lock()
            .contains_key(&(vault.to_string(), key.to_string())))
    }

    fn list_keys(&self, vault: &str) -> Result<Vec<String>, CryptoError> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|(v, _)| v == vault)
            .map(|(_, k)| k.clone())
            .collect())
    }

    fn wipe(&self) -> Result<(), CryptoError> {
        // Overwrite before dropping so the freed allocations hold no secrets.
        let mut entries = self.entries.lock();
        for blob in entries.values_mut() {
            zeroize::Zeroize::zeroize(blob);
        }
        entries.clear();
        Ok(())
    }
}
