use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::clock::Clock;
use crate::config::ProtocolConfig;
use crate::error::CryptoError;
use crate::identity::IdentityPublicKey;
use crate::keychain::{KEY_IDENTITY_MATERIAL, VAULT_IDENTITY, VAULT_SESSIONS};
use crate::keystore::KeyStore;
use crate::safety::{SafetyNumber, SafetyVerifier, TrustEvent, TrustStatus, TrustStore};
use crate::signal::envelope::{Envelope, PreKeyMessage, RatchetMessage};
use crate::signal::prekeys::{IdentityManager, PreKeyBundle, PublicBundle};
use crate::signal::ratchet::RatchetEngine;
use crate::signal::x3dh::{Handshake, SessionEstablisher};

const SESSION_VERSION: u8 = 1;

/// Stable identifier of one device of one account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A pairwise session is identified by both of its endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub local: DeviceId,
    pub remote: DeviceId,
}

impl SessionId {
    fn storage_key(&self) -> String {
        format!("{}:{}", self.local, self.remote)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

struct Session {
    ratchet: RatchetEngine,
    remote_identity: IdentityPublicKey,
    /// Set on the initiator until the first reply decrypts; every outgoing
    /// message is wrapped as a prekey message meanwhile.
    pending_handshake: Option<Handshake>,
    /// The handshake base key a responder session was created from.
    base_key: Option<[u8; 32]>,
}

impl Session {
    /// A copy of this session to run one step on. It replaces the live one
    /// once it has been persisted.
    fn stage(&self) -> Self {
        Self {
            ratchet: self.ratchet.fork(),
            remote_identity: self.remote_identity,
            pending_handshake: self.pending_handshake,
            base_key: self.base_key,
        }
    }
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredSession {
    version: u8,
    #[zeroize(skip)]
    remote_identity: IdentityPublicKey,
    #[zeroize(skip)]
    pending_handshake: Option<Handshake>,
    base_key: Option<[u8; 32]>,
    ratchet: Vec<u8>,
}

/// Entry point for the transport: establishes sessions, seals outgoing
/// messages and opens incoming ones.
///
/// Each session sits behind its own mutex, so operations on one session are
/// serialized while different sessions proceed in parallel. A step is
/// computed on a staged copy and only replaces the in-memory state after it
/// has been persisted through the [`KeyStore`].
///
/// A manager is bound to the wipe epoch of its [`DeviceLock`](crate::DeviceLock).
/// Once the lock wipes, the manager zeroizes everything it holds and refuses
/// further work with [`CryptoError::NotInitialized`].
pub struct SessionManager {
    local: DeviceId,
    config: ProtocolConfig,
    store: KeyStore,
    epoch: u64,
    establisher: SessionEstablisher,
    identities: Mutex<IdentityManager>,
    trust: Mutex<TrustStore>,
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    identity_changes: Mutex<Vec<DeviceId>>,
}

impl SessionManager {
    /// Provision a new device: generate its identity, a signed prekey and a
    /// first batch of one-time prekeys, and persist them.
    pub fn create(
        local: DeviceId,
        config: ProtocolConfig,
        store: KeyStore,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CryptoError> {
        if store.contains(VAULT_IDENTITY, KEY_IDENTITY_MATERIAL)? {
            return Err(CryptoError::AlreadyInitialized);
        }
        let mut identities = IdentityManager::new(config.clone(), clock.clone());
        identities.generate_identity()?;
        identities.generate_one_time_prekeys(config.one_time_prekey_batch)?;
        identities.save(&store)?;
        tracing::info!(device = %local, "device provisioned");

        Ok(Self::assemble(local, config, store, clock, identities, TrustStore::new()))
    }

    /// Reopen a provisioned device after unlock, restoring its identity,
    /// trust table and sessions.
    pub fn open(
        local: DeviceId,
        config: ProtocolConfig,
        store: KeyStore,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CryptoError> {
        let identities = IdentityManager::load(config.clone(), clock.clone(), &store)?;
        let trust = TrustStore::load(&store)?;
        let manager = Self::assemble(local, config, store, clock, identities, trust);
        let restored = manager.load_sessions()?;
        tracing::info!(device = %manager.local, sessions = restored, "device opened");
        Ok(manager)
    }

    fn assemble(
        local: DeviceId,
        config: ProtocolConfig,
        store: KeyStore,
        clock: Arc<dyn Clock>,
        identities: IdentityManager,
        trust: TrustStore,
    ) -> Self {
        Self {
            establisher: SessionEstablisher::new(&config, clock),
            epoch: store.device_lock().epoch(),
            local,
            config,
            store,
            identities: Mutex::new(identities),
            trust: Mutex::new(trust),
            sessions: RwLock::new(HashMap::new()),
            identity_changes: Mutex::new(Vec::new()),
        }
    }

    pub fn local_device(&self) -> &DeviceId {
        &self.local
    }

    pub fn session_id(&self, remote: &DeviceId) -> SessionId {
        SessionId {
            local: self.local.clone(),
            remote: remote.clone(),
        }
    }

    pub fn identity_public_key(&self) -> Result<IdentityPublicKey, CryptoError> {
        self.ensure_current()?;
        self.identities.lock().identity_public_key()
    }

    /// Public material for the directory.
    pub fn public_bundle(&self) -> Result<PublicBundle, CryptoError> {
        self.ensure_current()?;
        self.identities.lock().public_bundle()
    }

    pub fn has_session(&self, id: &SessionId) -> bool {
        self.ensure_current().is_ok() && self.sessions.read().contains_key(id)
    }

    /// Remote devices whose identity key changed since the last call. Each
    /// change is reported once; hosts should warn the user and offer to
    /// compare safety numbers again.
    pub fn take_identity_changes(&self) -> Vec<DeviceId> {
        std::mem::take(&mut *self.identity_changes.lock())
    }

    /// Start a session from a remote device's prekey bundle. An existing
    /// session with that device is replaced.
    pub fn initiate(
        &self,
        remote: &DeviceId,
        bundle: &PreKeyBundle,
    ) -> Result<SessionId, CryptoError> {
        self.ensure_current()?;
        self.ensure_unlocked()?;
        let id = self.session_id(remote);

        let initiated = {
            let identities = self.identities.lock();
            self.establisher.initiate_session(
                bundle,
                identities.identity()?,
                StaticSecret::random_from_rng(OsRng),
            )?
        };
        self.observe_identity(remote, &bundle.identity_key)?;

        let mut ratchet = RatchetEngine::new(&self.config);
        ratchet.initialize_as_initiator(
            initiated.shared,
            initiated.ephemeral,
            &initiated.remote_signed_prekey,
        )?;
        let session = Session {
            ratchet,
            remote_identity: bundle.identity_key,
            pending_handshake: Some(initiated.handshake),
            base_key: None,
        };
        self.persist(&id, &session)?;
        self.install(&id, session);
        tracing::info!(session = %id, "session initiated");
        Ok(id)
    }

    /// Encrypt `plaintext` for the transport.
    pub fn prepare_message(&self, id: &SessionId, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
        self.ensure_local(id)?;
        self.ensure_current()?;
        self.ensure_unlocked()?;
        let session = self.session(id)?;
        let mut session = session.lock();

        let mut staged = session.stage();
        let (header, ciphertext) = staged.ratchet.encrypt(plaintext)?;
        let message = RatchetMessage { header, ciphertext };
        let envelope = match staged.pending_handshake {
            Some(handshake) => Envelope::PreKey(PreKeyMessage { handshake, message }),
            None => Envelope::Ratchet(message),
        };
        self.persist(id, &staged)?;
        *session = staged;
        tracing::debug!(session = %id, n = header.message_number, "message prepared");
        Ok(envelope)
    }

    /// Decrypt an envelope received from the transport. A prekey envelope
    /// with a new handshake establishes (or replaces) the session.
    pub fn deliver_ciphertext(
        &self,
        id: &SessionId,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, CryptoError> {
        self.ensure_local(id)?;
        self.ensure_current()?;
        self.ensure_unlocked()?;
        match envelope {
            Envelope::Ratchet(message) => {
                let session = self.session(id)?;
                let mut session = session.lock();
                self.decrypt_existing(id, &mut session, message)
            }
            Envelope::PreKey(prekey) => self.deliver_prekey(id, prekey),
        }
    }

    fn decrypt_existing(
        &self,
        id: &SessionId,
        session: &mut Session,
        message: &RatchetMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut staged = session.stage();
        let plaintext = staged
            .ratchet
            .decrypt_step(&message.header, &message.ciphertext)
            .inspect_err(|e| tracing::debug!(session = %id, error = %e, "decrypt failed"))?;
        let acknowledged = staged.pending_handshake.take().is_some();
        self.persist(id, &staged)?;
        *session = staged;
        if acknowledged {
            tracing::debug!(session = %id, "handshake acknowledged");
        }
        Ok(plaintext)
    }

    fn deliver_prekey(&self, id: &SessionId, prekey: &PreKeyMessage) -> Result<Vec<u8>, CryptoError> {
        let handshake = &prekey.handshake;
        let mut identities = self.identities.lock();

        let existing = self.sessions.read().get(id).cloned();
        if let Some(existing) = &existing {
            let mut session = existing.lock();
            if session.base_key == Some(handshake.base_key) {
                drop(identities);
                return self.decrypt_existing(id, &mut session, &prekey.message);
            }
        }

        // A handshake that already produced a session, live or not, never
        // produces a second one.
        if identities.handshake_accepted(&handshake.base_key)? {
            tracing::warn!(session = %id, "replayed handshake rejected");
            return Err(CryptoError::ReplayDetected);
        }

        let shared = self.establisher.accept_session(&identities, handshake)?;
        let mut ratchet = RatchetEngine::new(&self.config);
        ratchet.initialize_as_responder(shared, &handshake.base_key)?;
        let plaintext = ratchet.decrypt_step(&prekey.message.header, &prekey.message.ciphertext)?;
        self.observe_identity(&id.remote, &handshake.identity_key)?;

        let session = Session {
            ratchet,
            remote_identity: handshake.identity_key,
            pending_handshake: None,
            base_key: Some(handshake.base_key),
        };
        self.persist(id, &session)?;

        // Only an authenticated first message may burn the one-time prekey.
        if let Err(e) = identities.accept_handshake(
            &self.store,
            handshake.base_key,
            handshake.one_time_prekey_id,
        ) {
            self.restore_persisted(id, existing.as_ref());
            return Err(e);
        }

        if existing.is_some() {
            tracing::warn!(session = %id, "session replaced by a new verified handshake");
        } else {
            tracing::info!(session = %id, "session accepted");
        }
        // Installed before the identity lock is released, so a second message
        // of the same handshake finds this session rather than the
        // accepted-handshake record.
        self.install(id, session);
        drop(identities);
        Ok(plaintext)
    }

    /// Explicit teardown: zeroize the ratchet and delete the stored blob.
    pub fn close_session(&self, id: &SessionId) -> Result<(), CryptoError> {
        self.ensure_current()?;
        let session = self
            .sessions
            .write()
            .remove(id)
            .ok_or_else(|| CryptoError::NoSession(id.to_string()))?;
        session.lock().ratchet.close();
        self.store.delete(VAULT_SESSIONS, &id.storage_key())?;
        tracing::info!(session = %id, "session closed");
        Ok(())
    }

    /// Restore every persisted session of this device into memory.
    pub fn load_sessions(&self) -> Result<usize, CryptoError> {
        self.ensure_current()?;
        let prefix = format!("{}:", self.local);
        let mut restored = 0;
        for key in self.store.list(VAULT_SESSIONS)? {
            let Some(remote) = key.strip_prefix(&prefix) else {
                continue;
            };
            let Some(bytes) = self.store.get(VAULT_SESSIONS, &key)? else {
                continue;
            };
            let stored: StoredSession = bincode::deserialize(&bytes)?;
            if stored.version != SESSION_VERSION {
                return Err(CryptoError::Serialization(format!(
                    "unsupported session version {}",
                    stored.version
                )));
            }
            let session = Session {
                ratchet: RatchetEngine::from_bytes(&stored.ratchet, &self.config)?,
                remote_identity: stored.remote_identity,
                pending_handshake: stored.pending_handshake,
                base_key: stored.base_key,
            };
            self.install(&self.session_id(&DeviceId::new(remote)), session);
            restored += 1;
        }
        Ok(restored)
    }

    /// Rotate the signed prekey when due, purge expired ones and top up the
    /// one-time pool. Returns how many one-time prekeys were added.
    pub fn replenish_prekeys(&self) -> Result<usize, CryptoError> {
        self.ensure_current()?;
        let mut identities = self.identities.lock();
        identities.purge_expired()?;
        if identities.needs_rotation() {
            identities.rotate_signed_prekey()?;
        }
        let added = identities.replenish()?.len();
        identities.save(&self.store)?;
        Ok(added)
    }

    /// The safety number to compare with `remote` out of band.
    pub fn safety_number(&self, remote: &DeviceId) -> Result<SafetyNumber, CryptoError> {
        let local_key = self.identity_public_key()?;
        let remote_key = self
            .trust
            .lock()
            .identity_key(remote.as_str())
            .ok_or_else(|| CryptoError::NoSession(remote.to_string()))?;
        Ok(SafetyVerifier::compute_fingerprint(
            &local_key,
            self.local.as_str(),
            &remote_key,
            remote.as_str(),
        ))
    }

    /// Record the outcome of an out-of-band comparison.
    pub fn verify_safety_number(&self, remote: &DeviceId, scanned: &str) -> Result<(), CryptoError> {
        let local_key = self.identity_public_key()?;
        let mut trust = self.trust.lock();
        let result = trust.verify(&local_key, self.local.as_str(), remote.as_str(), scanned);
        trust.save(&self.store)?;
        result
    }

    pub fn trust_status(&self, remote: &DeviceId) -> Option<TrustStatus> {
        self.ensure_current().ok()?;
        self.trust.lock().status(remote.as_str())
    }

    /// The identity key a session was established with.
    pub fn remote_identity(&self, id: &SessionId) -> Result<IdentityPublicKey, CryptoError> {
        self.ensure_current()?;
        Ok(self.session(id)?.lock().remote_identity)
    }

    /// Record the identity key `remote` presented. A changed key is queued
    /// for [`SessionManager::take_identity_changes`].
    fn observe_identity(
        &self,
        remote: &DeviceId,
        identity_key: &IdentityPublicKey,
    ) -> Result<(), CryptoError> {
        let mut trust = self.trust.lock();
        let event = trust.observe(remote.as_str(), identity_key);
        if event != TrustEvent::Unchanged {
            trust.save(&self.store)?;
        }
        drop(trust);
        if event == TrustEvent::Changed {
            self.identity_changes.lock().push(remote.clone());
        }
        Ok(())
    }

    fn session(&self, id: &SessionId) -> Result<Arc<Mutex<Session>>, CryptoError> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CryptoError::NoSession(id.to_string()))
    }

    fn install(&self, id: &SessionId, session: Session) {
        let previous = self
            .sessions
            .write()
            .insert(id.clone(), Arc::new(Mutex::new(session)));
        if let Some(previous) = previous {
            previous.lock().ratchet.close();
        }
    }

    fn persist(&self, id: &SessionId, session: &Session) -> Result<(), CryptoError> {
        let mut ratchet = session.ratchet.to_bytes()?;
        let stored = StoredSession {
            version: SESSION_VERSION,
            remote_identity: session.remote_identity,
            pending_handshake: session.pending_handshake,
            base_key: session.base_key,
            ratchet: std::mem::take(&mut *ratchet),
        };
        let bytes = Zeroizing::new(bincode::serialize(&stored)?);
        self.store.put(VAULT_SESSIONS, &id.storage_key(), &bytes)
    }

    fn ensure_local(&self, id: &SessionId) -> Result<(), CryptoError> {
        if id.local != self.local {
            return Err(CryptoError::NoSession(id.to_string()));
        }
        Ok(())
    }

    /// Put the stored blob of `id` back the way it was before a failed
    /// acceptance overwrote it.
    fn restore_persisted(&self, id: &SessionId, previous: Option<&Arc<Mutex<Session>>>) {
        let restored = match previous {
            Some(previous) => self.persist(id, &previous.lock()),
            None => self.store.delete(VAULT_SESSIONS, &id.storage_key()),
        };
        if let Err(e) = restored {
            tracing::error!(session = %id, error = %e, "could not roll back stored session");
        }
    }

    fn ensure_unlocked(&self) -> Result<(), CryptoError> {
        if !self.store.device_lock().is_unlocked() {
            return Err(CryptoError::Locked);
        }
        Ok(())
    }

    /// Fails once the device lock has wiped since this manager was built,
    /// zeroizing whatever the manager still holds the first time.
    fn ensure_current(&self) -> Result<(), CryptoError> {
        if self.store.device_lock().epoch() == self.epoch {
            return Ok(());
        }
        let mut identities = self.identities.lock();
        if identities.is_initialized() {
            identities.wipe();
            *self.trust.lock() = TrustStore::new();
            let sessions = std::mem::take(&mut *self.sessions.write());
            for session in sessions.into_values() {
                session.lock().ratchet.close();
            }
            self.identity_changes.lock().clear();
            tracing::warn!(device = %self.local, "device lock wiped, in-memory keys discarded");
        }
        Err(CryptoError::NotInitialized)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("local", &self.local)
            .field("sessions", &self.sessions.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{KdfParams, LockPolicy};
    use crate::keychain::{Keychain, MemoryKeychain};
    use crate::lock::DeviceLock;

    /// Memory keychain whose session writes can be made to fail.
    #[derive(Default)]
    struct FlakyKeychain {
        inner: MemoryKeychain,
        fail_session_writes: AtomicBool,
    }

    impl FlakyKeychain {
        fn fail(&self, fail: bool) {
            self.fail_session_writes.store(fail, Ordering::SeqCst);
        }
    }

    impl Keychain for FlakyKeychain {
        fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError> {
            if vault == VAULT_SESSIONS && self.fail_session_writes.load(Ordering::SeqCst) {
                return Err(CryptoError::StorageError("disk full".into()));
            }
            self.inner.store_key(vault, key, data)
        }

        fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
            self.inner.load_key(vault, key)
        }

        fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError> {
            self.inner.delete_key(vault, key)
        }

        fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError> {
            self.inner.key_exists(vault, key)
        }

        fn list_keys(&self, vault: &str) -> Result<Vec<String>, CryptoError> {
            self.inner.list_keys(vault)
        }

        fn wipe(&self) -> Result<(), CryptoError> {
            self.inner.wipe()
        }
    }

    fn store() -> KeyStore {
        store_on(Arc::new(MemoryKeychain::new()))
    }

    fn store_on(keychain: Arc<dyn Keychain>) -> KeyStore {
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
        lock.provision("2468").unwrap();
        KeyStore::new(lock, keychain)
    }

    fn device(name: &str, clock: &ManualClock) -> SessionManager {
        device_on(name, clock, store())
    }

    fn device_on(name: &str, clock: &ManualClock, store: KeyStore) -> SessionManager {
        SessionManager::create(
            DeviceId::new(name),
            ProtocolConfig {
                one_time_prekey_batch: 3,
                ..ProtocolConfig::default()
            },
            store,
            Arc::new(clock.clone()),
        )
        .unwrap()
    }

    fn connect(alice: &SessionManager, bob: &SessionManager) -> (SessionId, SessionId) {
        let bundle = bob.public_bundle().unwrap().take_prekey_bundle();
        let at_alice = alice.initiate(bob.local_device(), &bundle).unwrap();
        (at_alice, bob.session_id(alice.local_device()))
    }

    #[test]
    fn prekey_envelopes_until_reply() {
        let clock = ManualClock::new(1_000);
        let alice = device("alice", &clock);
        let bob = device("bob", &clock);
        let (a_id, b_id) = connect(&alice, &bob);

        let first = alice.prepare_message(&a_id, b"one").unwrap();
        let second = alice.prepare_message(&a_id, b"two").unwrap();
        assert!(first.is_prekey() && second.is_prekey());

        assert_eq!(bob.deliver_ciphertext(&b_id, &second).unwrap(), b"two");
        assert_eq!(bob.deliver_ciphertext(&b_id, &first).unwrap(), b"one");

        let reply = bob.prepare_message(&b_id, b"ack").unwrap();
        assert!(!reply.is_prekey());
        assert_eq!(alice.deliver_ciphertext(&a_id, &reply).unwrap(), b"ack");

        let third = alice.prepare_message(&a_id, b"three").unwrap();
        assert!(!third.is_prekey());
        assert_eq!(bob.deliver_ciphertext(&b_id, &third).unwrap(), b"three");
    }

    #[test]
    fn forged_prekey_message_keeps_one_time_prekey() {
        let clock = ManualClock::new(1_000);
        let alice = device("alice", &clock);
        let bob = device("bob", &clock);
        let (a_id, b_id) = connect(&alice, &bob);

        let Envelope::PreKey(mut forged) = alice.prepare_message(&a_id, b"hi").unwrap() else {
            panic!("expected a prekey envelope");
        };
        let otpk = forged.handshake.one_time_prekey_id.unwrap();
        forged.message.ciphertext[0] ^= 1;

        assert!(matches!(
            bob.deliver_ciphertext(&b_id, &Envelope::PreKey(forged)),
            Err(CryptoError::AuthenticationFailed)
        ));
        assert!(!bob.has_session(&b_id));
        let pool = bob.public_bundle().unwrap().one_time_prekeys;
        assert!(pool.iter().any(|p| p.id == otpk));
    }

    #[test]
    fn unknown_session_and_foreign_local() {
        let clock = ManualClock::new(1_000);
        let alice = device("alice", &clock);
        let id = alice.session_id(&DeviceId::new("nobody"));
        assert!(matches!(
            alice.prepare_message(&id, b"x"),
            Err(CryptoError::NoSession(_))
        ));

        let foreign = SessionId {
            local: DeviceId::new("mallory"),
            remote: DeviceId::new("alice"),
        };
        assert!(matches!(
            alice.prepare_message(&foreign, b"x"),
            Err(CryptoError::NoSession(_))
        ));
    }

    #[test]
    fn closed_session_is_gone() {
        let clock = ManualClock::new(1_000);
        let alice = device("alice", &clock);
        let bob = device("bob", &clock);
        let (a_id, _) = connect(&alice, &bob);

        alice.close_session(&a_id).unwrap();
        assert!(!alice.has_session(&a_id));
        assert_eq!(alice.load_sessions().unwrap(), 0);
        assert!(matches!(
            alice.close_session(&a_id),
            Err(CryptoError::NoSession(_))
        ));
    }

    #[test]
    fn locked_device_refuses_messages() {
        let clock = ManualClock::new(1_000);
        let alice = device("alice", &clock);
        let bob = device("bob", &clock);
        let (a_id, _) = connect(&alice, &bob);

        alice.store.device_lock().lock();
        assert!(matches!(
            alice.prepare_message(&a_id, b"x"),
            Err(CryptoError::Locked)
        ));
    }

    #[test]
    fn safety_numbers_agree_and_verify() {
        let clock = ManualClock::new(1_000);
        let alice = device("alice", &clock);
        let bob = device("bob", &clock);
        let (a_id, b_id) = connect(&alice, &bob);
        let hello = alice.prepare_message(&a_id, b"hello").unwrap();
        bob.deliver_ciphertext(&b_id, &hello).unwrap();

        let at_alice = alice.safety_number(bob.local_device()).unwrap();
        let at_bob = bob.safety_number(alice.local_device()).unwrap();
        assert_eq!(at_alice, at_bob);

        alice
            .verify_safety_number(bob.local_device(), &at_bob.to_string())
            .unwrap();
        assert_eq!(
            alice.trust_status(bob.local_device()),
            Some(TrustStatus::Verified)
        );
    }

    #[test]
    fn replenish_tops_up_pool() {
        let clock = ManualClock::new(1_000);
        let alice = device("alice", &clock);
        let bob = device("bob", &clock);
        for _ in 0..3 {
            let (a_id, b_id) = connect(&alice, &bob);
            let msg = alice.prepare_message(&a_id, b"x").unwrap();
            bob.deliver_ciphertext(&b_id, &msg).unwrap();
        }
        assert!(bob.public_bundle().unwrap().one_time_prekeys.is_empty());
        assert_eq!(bob.replenish_prekeys().unwrap(), 3);
        assert_eq!(bob.public_bundle().unwrap().one_time_prekeys.len(), 3);
    }

    #[test]
    fn failed_write_leaves_the_session_untouched() {
        let clock = ManualClock::new(1_000);
        let keychain = Arc::new(FlakyKeychain::default());
        let alice = device("alice", &clock);
        let bob = device_on("bob", &clock, store_on(keychain.clone()));
        let (a_id, b_id) = connect(&alice, &bob);
        bob.deliver_ciphertext(&b_id, &alice.prepare_message(&a_id, b"hello").unwrap())
            .unwrap();
        alice
            .deliver_ciphertext(&a_id, &bob.prepare_message(&b_id, b"ack").unwrap())
            .unwrap();

        let incoming = alice.prepare_message(&a_id, b"survives").unwrap();
        keychain.fail(true);
        assert!(matches!(
            bob.deliver_ciphertext(&b_id, &incoming),
            Err(CryptoError::StorageError(_))
        ));
        assert!(matches!(
            bob.prepare_message(&b_id, b"lost"),
            Err(CryptoError::StorageError(_))
        ));

        keychain.fail(false);
        let Envelope::Ratchet(reply) = bob.prepare_message(&b_id, b"kept").unwrap() else {
            panic!("expected a ratchet envelope");
        };
        // The failed attempt did not use up a message number.
        assert_eq!(reply.header.message_number, 1);
        assert_eq!(
            alice.deliver_ciphertext(&a_id, &Envelope::Ratchet(reply)).unwrap(),
            b"kept"
        );
        assert_eq!(bob.deliver_ciphertext(&b_id, &incoming).unwrap(), b"survives");
    }

    #[test]
    fn failed_write_during_acceptance_keeps_the_prekey() {
        let clock = ManualClock::new(1_000);
        let keychain = Arc::new(FlakyKeychain::default());
        let alice = device("alice", &clock);
        let bob = device_on("bob", &clock, store_on(keychain.clone()));
        let (a_id, b_id) = connect(&alice, &bob);
        let hello = alice.prepare_message(&a_id, b"hello").unwrap();

        keychain.fail(true);
        assert!(matches!(
            bob.deliver_ciphertext(&b_id, &hello),
            Err(CryptoError::StorageError(_))
        ));
        assert!(!bob.has_session(&b_id));
        assert_eq!(bob.public_bundle().unwrap().one_time_prekeys.len(), 3);

        keychain.fail(false);
        assert_eq!(bob.deliver_ciphertext(&b_id, &hello).unwrap(), b"hello");
        assert_eq!(bob.public_bundle().unwrap().one_time_prekeys.len(), 2);
    }

    #[test]
    fn replayed_first_message_after_close_is_rejected() {
        let clock = ManualClock::new(1_000);
        let alice = device("alice", &clock);
        let bob = device("bob", &clock);
        let (a_id, b_id) = connect(&alice, &bob);
        let hello = alice.prepare_message(&a_id, b"hello").unwrap();
        bob.deliver_ciphertext(&b_id, &hello).unwrap();

        bob.close_session(&b_id).unwrap();
        assert!(matches!(
            bob.deliver_ciphertext(&b_id, &hello),
            Err(CryptoError::ReplayDetected)
        ));
        assert!(!bob.has_session(&b_id));
    }

    #[test]
    fn changed_identity_is_reported_once() {
        let clock = ManualClock::new(1_000);
        let alice = device("alice", &clock);
        let bob = device("bob", &clock);
        let (a_id, b_id) = connect(&alice, &bob);
        bob.deliver_ciphertext(&b_id, &alice.prepare_message(&a_id, b"hi").unwrap())
            .unwrap();
        assert!(bob.take_identity_changes().is_empty());

        // Same device name, fresh identity.
        let alice = device("alice", &clock);
        let (a_id, b_id) = connect(&alice, &bob);
        bob.deliver_ciphertext(&b_id, &alice.prepare_message(&a_id, b"new").unwrap())
            .unwrap();
        assert_eq!(bob.take_identity_changes(), vec![alice.local_device().clone()]);
        assert!(bob.take_identity_changes().is_empty());
    }

    #[test]
    fn wipe_discards_the_running_manager() {
        let clock = ManualClock::new(1_000);
        let alice = device("alice", &clock);
        let bob = device("bob", &clock);
        let (a_id, b_id) = connect(&alice, &bob);
        let hello = alice.prepare_message(&a_id, b"hello").unwrap();

        let lock = bob.store.device_lock().clone();
        assert!((0..10).any(|_| matches!(lock.unlock("0000"), Err(CryptoError::WipeTriggered))));
        lock.provision("1111").unwrap();

        assert!(matches!(
            bob.deliver_ciphertext(&b_id, &hello),
            Err(CryptoError::NotInitialized)
        ));
        assert!(matches!(bob.public_bundle(), Err(CryptoError::NotInitialized)));
        assert!(!bob.has_session(&b_id));
        assert!(!bob.identities.lock().is_initialized());
    }
}
