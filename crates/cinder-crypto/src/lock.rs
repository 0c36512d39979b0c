//! PIN-gated access to the master key.
//!
//! The lock record in the keychain holds an Argon2id salt, a verifier, the
//! master key wrapped under a PIN-derived key and the failed-attempt counter.
//! Unlocking keeps the master key in memory until [`DeviceLock::lock`] or the
//! inactivity timeout zeroes it. Key store reads hold the state read lock, so
//! they never observe a half-finished unlock or lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::clock::Clock;
use crate::config::{KdfParams, LockPolicy};
use crate::error::CryptoError;
use crate::keychain::{Keychain, KEY_LOCK_RECORD, VAULT_LOCK};
use crate::master_key::{derive_pin_keys, open_blob, seal_blob, MasterKey, MASTER_KEY_LEN};

const RECORD_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const WRAP_AAD: &[u8] = b"cinder-lock-master-v1";

#[derive(Serialize, Deserialize)]
struct LockRecord {
    version: u8,
    salt: [u8; SALT_LEN],
    verifier: [u8; 32],
    wrapped_master: Vec<u8>,
    master_check: [u8; 32],
    failed_attempts: u32,
    kdf: KdfParams,
}

pub struct DeviceLock {
    keychain: Arc<dyn Keychain>,
    policy: LockPolicy,
    clock: Arc<dyn Clock>,
    master: RwLock<Option<MasterKey>>,
    last_activity: AtomicU64,
    /// Bumped by every wipe. Holders of decrypted key material compare it
    /// to the value they started with.
    epoch: AtomicU64,
}

impl DeviceLock {
    pub fn new(keychain: Arc<dyn Keychain>, policy: LockPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            keychain,
            policy,
            clock,
            master: RwLock::new(None),
            last_activity: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    pub fn is_provisioned(&self) -> Result<bool, CryptoError> {
        self.keychain.key_exists(VAULT_LOCK, KEY_LOCK_RECORD)
    }

    /// Create a fresh master key protected by `pin` and leave the lock open.
    pub fn provision(&self, pin: &str) -> Result<(), CryptoError> {
        let mut master = self.master.write();
        if self.is_provisioned()? {
            return Err(CryptoError::AlreadyInitialized);
        }
        let key = MasterKey::generate();
        self.write_record(&key, pin)?;
        *master = Some(key);
        self.touch();
        tracing::info!("device lock provisioned");
        Ok(())
    }

    /// Derive a candidate key from `pin` and, if it matches, load the master
    /// key into memory.
    ///
    /// Each failure is persisted before returning. Reaching the configured
    /// threshold wipes the whole keychain and returns
    /// [`CryptoError::WipeTriggered`].
    pub fn unlock(&self, pin: &str) -> Result<(), CryptoError> {
        let mut master = self.master.write();
        let mut record = self.load_record()?;
        let keys = derive_pin_keys(pin, &record.salt, record.kdf)?;

        if bool::from(keys.verifier[..].ct_eq(&record.verifier[..])) {
            let opened = open_blob(&keys.wrapping, &record.wrapped_master, WRAP_AAD)
                .map_err(|_| CryptoError::StorageError("lock record is corrupt".into()))?;
            let bytes: [u8; MASTER_KEY_LEN] = opened
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::StorageError("lock record is corrupt".into()))?;
            let key = MasterKey::from_bytes(bytes);

            if record.failed_attempts != 0 {
                record.failed_attempts = 0;
                self.save_record(&record)?;
            }
            *master = Some(key);
            self.touch();
            tracing::info!("device unlocked");
            return Ok(());
        }

        record.failed_attempts = record.failed_attempts.saturating_add(1);
        let remaining = self
            .policy
            .wipe_after_failures
            .map(|limit| limit.saturating_sub(record.failed_attempts));

        if remaining == Some(0) {
            *master = None;
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.keychain.wipe()?;
            tracing::warn!(
                attempts = record.failed_attempts,
                "failed unlock limit reached, key store wiped"
            );
            return Err(CryptoError::WipeTriggered);
        }

        self.save_record(&record)?;
        tracing::warn!(attempts = record.failed_attempts, ?remaining, "wrong PIN");
        Err(CryptoError::WrongPin { remaining })
    }

    /// Zero the in-memory master key.
    pub fn lock(&self) {
        let mut master = self.master.write();
        if master.take().is_some() {
            tracing::info!("device locked");
        }
    }

    /// How many times this lock has wiped its keychain.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_unlocked(&self) -> bool {
        self.master.read().is_some() && !self.idle_expired()
    }

    /// Lock if the inactivity timeout has passed. Returns whether the device
    /// is locked afterwards.
    pub fn enforce_inactivity_timeout(&self) -> bool {
        if self.master.read().is_none() {
            return true;
        }
        if self.idle_expired() {
            tracing::debug!("inactivity timeout reached");
            self.lock();
            return true;
        }
        false
    }

    /// Unlock attempts left before a wipe, or `None` when wiping is disabled.
    pub fn remaining_attempts(&self) -> Result<Option<u32>, CryptoError> {
        let record = self.load_record()?;
        Ok(self
            .policy
            .wipe_after_failures
            .map(|limit| limit.saturating_sub(record.failed_attempts)))
    }

    /// Re-wrap the master key under `new_pin`. A wrong `old_pin` counts as a
    /// failed unlock.
    pub fn change_pin(&self, old_pin: &str, new_pin: &str) -> Result<(), CryptoError> {
        self.unlock(old_pin)?;
        let master = self.master.write();
        let key = master.as_ref().ok_or(CryptoError::Locked)?;
        self.write_record(key, new_pin)?;
        tracing::info!("PIN changed");
        Ok(())
    }

    /// Protect a recovered master key with a new PIN.
    ///
    /// If a lock record still exists the key must be the one it wraps;
    /// after a wipe the device is re-provisioned around the recovered key.
    pub fn reset_pin(&self, recovered: &MasterKey, new_pin: &str) -> Result<(), CryptoError> {
        let mut master = self.master.write();
        if self.is_provisioned()? {
            let record = self.load_record()?;
            if !bool::from(recovered.check_value()[..].ct_eq(&record.master_check[..])) {
                return Err(CryptoError::InvalidRecoveryCode);
            }
        }
        self.write_record(recovered, new_pin)?;
        *master = Some(recovered.clone());
        self.touch();
        tracing::info!("PIN reset from recovery key");
        Ok(())
    }

    /// Run `f` with the master key, failing with [`CryptoError::Locked`]
    /// when locked or idle for too long.
    pub(crate) fn with_master_key<T>(
        &self,
        f: impl FnOnce(&MasterKey) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        {
            let master = self.master.read();
            match master.as_ref() {
                None => return Err(CryptoError::Locked),
                Some(key) if !self.idle_expired() => {
                    self.touch();
                    return f(key);
                }
                Some(_) => {}
            }
        }
        tracing::debug!("inactivity timeout reached");
        self.lock();
        Err(CryptoError::Locked)
    }

    fn idle_expired(&self) -> bool {
        let last = self.last_activity.load(Ordering::SeqCst);
        self.clock.now_secs().saturating_sub(last) > self.policy.inactivity_timeout_secs
    }

    fn touch(&self) {
        self.last_activity
            .store(self.clock.now_secs(), Ordering::SeqCst);
    }

    fn write_record(&self, key: &MasterKey, pin: &str) -> Result<(), CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let keys = derive_pin_keys(pin, &salt, self.policy.kdf)?;
        let wrapped_master = seal_blob(&keys.wrapping, key.as_bytes(), WRAP_AAD)?;

        self.save_record(&LockRecord {
            version: RECORD_VERSION,
            salt,
            verifier: keys.verifier,
            wrapped_master,
            master_check: key.check_value(),
            failed_attempts: 0,
            kdf: self.policy.kdf,
        })
    }

    fn load_record(&self) -> Result<LockRecord, CryptoError> {
        let bytes = self
            .keychain
            .load_key(VAULT_LOCK, KEY_LOCK_RECORD)?
            .ok_or(CryptoError::NotProvisioned)?;
        let record: LockRecord = bincode::deserialize(&bytes)?;
        if record.version != RECORD_VERSION {
            return Err(CryptoError::StorageError(format!(
                "unsupported lock record version {}",
                record.version
            )));
        }
        Ok(record)
    }

    fn save_record(&self, record: &LockRecord) -> Result<(), CryptoError> {
        let bytes = bincode::serialize(record)?;
        self.keychain.store_key(VAULT_LOCK, KEY_LOCK_RECORD, &bytes)
    }
}

impl std::fmt::Debug for DeviceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLock")
            .field("unlocked", &self.master.read().is_some())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
