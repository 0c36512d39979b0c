use std::sync::Arc;

use zeroize::Zeroizing;

use crate::backup::{BackupCodec, RecoveryCode};
use crate::error::CryptoError;
use crate::keychain::{Keychain, VAULT_LOCK};
use crate::lock::DeviceLock;

/// Encrypted-at-rest storage for every secret the core owns.
///
/// Blobs are sealed under the master key held by the [`DeviceLock`], with
/// the `vault/key` slot name as associated data so a blob copied into a
/// different slot fails to open. A locked device refuses every operation.
#[derive(Clone)]
pub struct KeyStore {
    lock: Arc<DeviceLock>,
    keychain: Arc<dyn Keychain>,
}

impl KeyStore {
    pub fn new(lock: Arc<DeviceLock>, keychain: Arc<dyn Keychain>) -> Self {
        Self { lock, keychain }
    }

    pub fn device_lock(&self) -> &Arc<DeviceLock> {
        &self.lock
    }

    pub fn put(&self, vault: &str, key: &str, plaintext: &[u8]) -> Result<(), CryptoError> {
        check_vault(vault)?;
        self.lock.with_master_key(|master| {
            let blob = master.wrap(plaintext, slot_name(vault, key).as_bytes())?;
            self.keychain.store_key(vault, key, &blob)
        })
    }

    pub fn get(&self, vault: &str, key: &str) -> Result<Option<Zeroizing<Vec<u8>>>, CryptoError> {
        check_vault(vault)?;
        self.lock.with_master_key(|master| {
            let Some(blob) = self.keychain.load_key(vault, key)? else {
                return Ok(None);
            };
            master
                .unwrap(&blob, slot_name(vault, key).as_bytes())
                .map(Some)
                .map_err(|_| CryptoError::StorageError(format!("cannot open {vault}/{key}")))
        })
    }

    pub fn delete(&self, vault: &str, key: &str) -> Result<(), CryptoError> {
        check_vault(vault)?;
        self.lock
            .with_master_key(|_| self.keychain.delete_key(vault, key))
    }

    pub fn contains(&self, vault: &str, key: &str) -> Result<bool, CryptoError> {
        check_vault(vault)?;
        self.lock
            .with_master_key(|_| self.keychain.key_exists(vault, key))
    }

    pub fn list(&self, vault: &str) -> Result<Vec<String>, CryptoError> {
        check_vault(vault)?;
        self.lock.with_master_key(|_| self.keychain.list_keys(vault))
    }

    /// Encode the master key as a recovery code. Show it to the user once;
    /// never log or store it.
    pub fn create_recovery_artifact(&self) -> Result<RecoveryCode, CryptoError> {
        self.lock
            .with_master_key(|master| Ok(BackupCodec::create_recovery_artifact(master)))
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

fn slot_name(vault: &str, key: &str) -> String {
    format!("{vault}/{key}")
}

/// The lock vault is managed by [`DeviceLock`] only.
fn check_vault(vault: &str) -> Result<(), CryptoError> {
    if vault == VAULT_LOCK {
        return Err(CryptoError::StorageError(
            "the lock vault is reserved".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{KdfParams, LockPolicy};
    use crate::keychain::{MemoryKeychain, VAULT_IDENTITY, VAULT_SESSIONS};

    fn unlocked_store() -> (Arc<MemoryKeychain>, KeyStore) {
        let keychain = Arc::new(MemoryKeychain::new());
        let policy = LockPolicy {
            kdf: KdfParams {
                memory_kib: 64,
                iterations: 1,
                parallelism: 1,
            },
            ..LockPolicy::default()
        };
        let lock = Arc::new(DeviceLock::new(
            keychain.clone(),
            policy,
            Arc::new(ManualClock::new(0)),
        ));
        lock.provision("1357").unwrap();
        (keychain.clone(), KeyStore::new(lock, keychain))
    }

    #[test]
    fn put_get_round_trip() {
        let (_, store) = unlocked_store();
        store.put(VAULT_IDENTITY, "material", b"secret").unwrap();
        let loaded = store.get(VAULT_IDENTITY, "material").unwrap().unwrap();
        assert_eq!(loaded.as_slice(), b"secret");
        assert!(store.get(VAULT_IDENTITY, "missing").unwrap().is_none());
    }

    #[test]
    fn plaintext_never_reaches_keychain() {
        let (keychain, store) = unlocked_store();
        let marker = b"PLAINTEXT-ROOT-KEY-MARKER";
        store.put(VAULT_SESSIONS, "alice:bob", marker).unwrap();

        for blob in keychain.raw_blobs() {
            assert!(!blob.windows(marker.len()).any(|w| w == marker));
        }
    }

    #[test]
    fn blobs_are_bound_to_their_slot() {
        let (keychain, store) = unlocked_store();
        store.put(VAULT_SESSIONS, "a", b"one").unwrap();
        let blob = keychain.load_key(VAULT_SESSIONS, "a").unwrap().unwrap();
        keychain.store_key(VAULT_SESSIONS, "b", &blob).unwrap();

        assert!(store.get(VAULT_SESSIONS, "b").is_err());
    }

    #[test]
    fn locked_store_refuses_access() {
        let (_, store) = unlocked_store();
        store.put(VAULT_IDENTITY, "material", b"secret").unwrap();
        store.device_lock().lock();

        assert!(matches!(
            store.get(VAULT_IDENTITY, "material"),
            Err(CryptoError::Locked)
        ));
        assert!(matches!(
            store.put(VAULT_IDENTITY, "material", b"x"),
            Err(CryptoError::Locked)
        ));

        store.device_lock().unlock("1357").unwrap();
        assert!(store.get(VAULT_IDENTITY, "material").unwrap().is_some());
    }

    #[test]
    fn lock_vault_is_reserved() {
        let (_, store) = unlocked_store();
        assert!(store.put(VAULT_LOCK, "record", b"x").is_err());
    }

    #[test]
    fn list_and_delete() {
        let (_, store) = unlocked_store();
        store.put(VAULT_SESSIONS, "x", b"1").unwrap();
        store.put(VAULT_SESSIONS, "y", b"2").unwrap();
        assert_eq!(store.list(VAULT_SESSIONS).unwrap(), vec!["x", "y"]);

        store.delete(VAULT_SESSIONS, "x").unwrap();
        assert!(!store.contains(VAULT_SESSIONS, "x").unwrap());
        assert!(store.contains(VAULT_SESSIONS, "y").unwrap());
    }
}
