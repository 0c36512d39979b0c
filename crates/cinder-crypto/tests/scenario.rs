//! End-to-end flows through the public session API: two or more devices,
//! each with its own keychain and device lock, exchanging envelopes as
//! bytes the way a transport would.

use std::sync::Arc;

use cinder_crypto::signal::Envelope;
use cinder_crypto::{
    BackupCodec, CryptoError, DeviceId, DeviceLock, KdfParams, KeyStore, LockPolicy, ManualClock,
    MemoryKeychain, ProtocolConfig, SessionId, SessionManager, TrustStatus,
};

const PIN: &str = "482913";

struct Device {
    id: DeviceId,
    keychain: Arc<MemoryKeychain>,
    lock: Arc<DeviceLock>,
    clock: ManualClock,
    manager: SessionManager,
}

fn policy() -> LockPolicy {
    LockPolicy {
        wipe_after_failures: Some(3),
        kdf: KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        },
        ..LockPolicy::default()
    }
}

fn config() -> ProtocolConfig {
    ProtocolConfig {
        one_time_prekey_batch: 5,
        one_time_prekey_low_water: 2,
        ..ProtocolConfig::default()
    }
}

fn device(name: &str, clock: &ManualClock) -> Device {
    let keychain = Arc::new(MemoryKeychain::new());
    let lock = Arc::new(DeviceLock::new(
        keychain.clone(),
        policy(),
        Arc::new(clock.clone()),
    ));
    lock.provision(PIN).unwrap();
    let manager = SessionManager::create(
        DeviceId::new(name),
        config(),
        KeyStore::new(lock.clone(), keychain.clone()),
        Arc::new(clock.clone()),
    )
    .unwrap();
    Device {
        id: DeviceId::new(name),
        keychain,
        lock,
        clock: clock.clone(),
        manager,
    }
}

impl Device {
    fn store(&self) -> KeyStore {
        KeyStore::new(self.lock.clone(), self.keychain.clone())
    }

    fn reopen(&mut self) {
        self.manager = SessionManager::open(
            self.id.clone(),
            config(),
            self.store(),
            Arc::new(self.clock.clone()),
        )
        .unwrap();
    }

    fn session_with(&self, remote: &Device) -> SessionId {
        self.manager.session_id(&remote.id)
    }

    /// Seal for `remote` and return the wire bytes.
    fn send(&self, remote: &Device, plaintext: &[u8]) -> Vec<u8> {
        self.manager
            .prepare_message(&self.session_with(remote), plaintext)
            .unwrap()
            .encode()
            .unwrap()
    }

    fn receive(&self, remote: &Device, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let envelope = Envelope::decode(wire)?;
        self.manager
            .deliver_ciphertext(&self.session_with(remote), &envelope)
    }
}

/// Alice fetches Bob's bundle and opens a session.
fn connect(alice: &Device, bob: &Device) -> u32 {
    let bundle = bob.manager.public_bundle().unwrap().take_prekey_bundle();
    let one_time = bundle.one_time_prekey.unwrap().id;
    alice.manager.initiate(&bob.id, &bundle).unwrap();
    one_time
}

// ── First contact ──

#[test]
fn hello_consumes_the_one_time_prekey() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    let bob = device("bob", &clock);

    let one_time = connect(&alice, &bob);
    let wire = alice.send(&bob, b"hello");
    assert!(Envelope::decode(&wire).unwrap().is_prekey());

    assert_eq!(bob.receive(&alice, &wire).unwrap(), b"hello");
    let remaining = bob.manager.public_bundle().unwrap().one_time_prekeys;
    assert_eq!(remaining.len(), 4);
    assert!(remaining.iter().all(|p| p.id != one_time));
    assert_eq!(
        bob.manager
            .remote_identity(&bob.session_with(&alice))
            .unwrap(),
        alice.manager.identity_public_key().unwrap()
    );
}

#[test]
fn prekey_envelopes_stop_after_the_first_reply() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    let bob = device("bob", &clock);
    connect(&alice, &bob);

    let first = alice.send(&bob, b"one");
    let second = alice.send(&bob, b"two");
    assert!(Envelope::decode(&second).unwrap().is_prekey());

    // Both carry the same handshake; the second lands in the session the
    // first created.
    assert_eq!(bob.receive(&alice, &second).unwrap(), b"two");
    assert_eq!(bob.receive(&alice, &first).unwrap(), b"one");

    let reply = bob.send(&alice, b"hi alice");
    assert!(!Envelope::decode(&reply).unwrap().is_prekey());
    assert_eq!(alice.receive(&bob, &reply).unwrap(), b"hi alice");

    let third = alice.send(&bob, b"three");
    assert!(!Envelope::decode(&third).unwrap().is_prekey());
    assert_eq!(bob.receive(&alice, &third).unwrap(), b"three");
}

#[test]
fn racing_initiators_cannot_share_a_one_time_prekey() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    let bob = device("bob", &clock);
    let dave = device("dave", &clock);

    // A directory that handed out the same bundle twice.
    let bundle = bob.manager.public_bundle().unwrap().take_prekey_bundle();
    alice.manager.initiate(&bob.id, &bundle).unwrap();
    dave.manager.initiate(&bob.id, &bundle).unwrap();

    assert_eq!(bob.receive(&alice, &alice.send(&bob, b"a")).unwrap(), b"a");
    let one_time = bundle.one_time_prekey.unwrap().id;
    assert!(matches!(
        bob.receive(&dave, &dave.send(&bob, b"d")),
        Err(CryptoError::PreKeyAlreadyConsumed(id)) if id == one_time
    ));
}

#[test]
fn empty_prekey_pool_still_connects() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    let bob = device("bob", &clock);

    let mut bundle = bob.manager.public_bundle().unwrap();
    bundle.one_time_prekeys.clear();
    alice
        .manager
        .initiate(&bob.id, &bundle.take_prekey_bundle())
        .unwrap();

    assert_eq!(bob.receive(&alice, &alice.send(&bob, b"no otpk")).unwrap(), b"no otpk");
    assert_eq!(bob.manager.public_bundle().unwrap().one_time_prekeys.len(), 5);
}

/// Alice opens a session from a bundle whose one-time prekeys ran out.
fn connect_without_one_time_prekey(alice: &Device, bob: &Device) {
    let mut bundle = bob.manager.public_bundle().unwrap();
    bundle.one_time_prekeys.clear();
    alice
        .manager
        .initiate(&bob.id, &bundle.take_prekey_bundle())
        .unwrap();
}

#[test]
fn first_message_replayed_after_close_is_rejected() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    let mut bob = device("bob", &clock);
    connect_without_one_time_prekey(&alice, &bob);

    let hello = alice.send(&bob, b"transfer $100");
    assert_eq!(bob.receive(&alice, &hello).unwrap(), b"transfer $100");
    bob.manager.close_session(&bob.session_with(&alice)).unwrap();

    assert!(matches!(
        bob.receive(&alice, &hello),
        Err(CryptoError::ReplayDetected)
    ));
    // Remembered across a restart too.
    bob.reopen();
    assert!(matches!(
        bob.receive(&alice, &hello),
        Err(CryptoError::ReplayDetected)
    ));
    assert!(!bob.manager.has_session(&bob.session_with(&alice)));
}

#[test]
fn superseded_first_message_cannot_take_over_the_session() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    let bob = device("bob", &clock);
    connect_without_one_time_prekey(&alice, &bob);
    let old_hello = alice.send(&bob, b"old hello");
    bob.receive(&alice, &old_hello).unwrap();

    // Alice starts over; Bob accepts the new handshake.
    connect_without_one_time_prekey(&alice, &bob);
    assert_eq!(bob.receive(&alice, &alice.send(&bob, b"new hello")).unwrap(), b"new hello");
    assert_eq!(alice.receive(&bob, &bob.send(&alice, b"ack")).unwrap(), b"ack");

    assert!(matches!(
        bob.receive(&alice, &old_hello),
        Err(CryptoError::ReplayDetected)
    ));
    assert_eq!(bob.receive(&alice, &alice.send(&bob, b"still live")).unwrap(), b"still live");
}

// ── Delivery failures ──

#[test]
fn replayed_and_tampered_wire_bytes_are_rejected() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    let bob = device("bob", &clock);
    connect(&alice, &bob);

    let hello = alice.send(&bob, b"hello");
    bob.receive(&alice, &hello).unwrap();
    assert!(matches!(
        bob.receive(&alice, &hello),
        Err(CryptoError::ReplayDetected)
    ));

    alice.receive(&bob, &bob.send(&alice, b"ack")).unwrap();
    let wire = alice.send(&bob, b"tamper with me");

    let mut tampered = wire.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    assert!(matches!(
        bob.receive(&alice, &tampered),
        Err(CryptoError::AuthenticationFailed)
    ));

    let mut versioned = wire.clone();
    versioned[0] = 9;
    assert!(matches!(
        bob.receive(&alice, &versioned),
        Err(CryptoError::UnsupportedVersion(9))
    ));

    assert!(matches!(
        bob.receive(&alice, &wire[..wire.len() - 3]),
        Err(CryptoError::MalformedEnvelope(_))
    ));

    // None of the failures advanced Bob's session.
    assert_eq!(bob.receive(&alice, &wire).unwrap(), b"tamper with me");
}

#[test]
fn out_of_order_delivery() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    let bob = device("bob", &clock);
    connect(&alice, &bob);
    bob.receive(&alice, &alice.send(&bob, b"hello")).unwrap();
    alice.receive(&bob, &bob.send(&alice, b"ack")).unwrap();

    let batch: Vec<_> = (0..6u8).map(|i| (i, alice.send(&bob, &[i]))).collect();
    for (i, wire) in batch.iter().rev() {
        assert_eq!(bob.receive(&alice, wire).unwrap(), vec![*i]);
    }
}

#[test]
fn unknown_and_closed_sessions() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    let bob = device("bob", &clock);
    let carol = device("carol", &clock);
    connect(&alice, &bob);
    bob.receive(&alice, &alice.send(&bob, b"hello")).unwrap();
    let reply = bob.send(&alice, b"reply");

    assert!(matches!(
        carol.manager.prepare_message(&carol.session_with(&alice), b"x"),
        Err(CryptoError::NoSession(_))
    ));
    assert!(matches!(
        carol.receive(&bob, &reply),
        Err(CryptoError::NoSession(_))
    ));

    let id = alice.session_with(&bob);
    alice.manager.close_session(&id).unwrap();
    assert!(!alice.manager.has_session(&id));
    assert!(matches!(
        alice.receive(&bob, &reply),
        Err(CryptoError::NoSession(_))
    ));
}

// ── Device lock ──

#[test]
fn sessions_survive_lock_and_reopen() {
    let clock = ManualClock::new(1_700_000_000);
    let mut alice = device("alice", &clock);
    let mut bob = device("bob", &clock);
    connect(&alice, &bob);
    bob.receive(&alice, &alice.send(&bob, b"hello")).unwrap();
    alice.receive(&bob, &bob.send(&alice, b"ack")).unwrap();
    let in_flight = alice.send(&bob, b"sent before restart");

    alice.lock.lock();
    bob.lock.lock();
    assert!(matches!(
        alice.manager.prepare_message(&alice.session_with(&bob), b"x"),
        Err(CryptoError::Locked)
    ));

    alice.lock.unlock(PIN).unwrap();
    bob.lock.unlock(PIN).unwrap();
    alice.reopen();
    bob.reopen();

    assert!(alice.manager.has_session(&alice.session_with(&bob)));
    assert_eq!(bob.receive(&alice, &in_flight).unwrap(), b"sent before restart");
    assert_eq!(alice.receive(&bob, &bob.send(&alice, b"still here")).unwrap(), b"still here");
    assert_eq!(bob.receive(&alice, &alice.send(&bob, b"and here")).unwrap(), b"and here");
}

#[test]
fn inactivity_timeout_locks_the_session_manager() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    let bob = device("bob", &clock);
    connect(&alice, &bob);

    clock.advance(policy().inactivity_timeout_secs + 1);
    assert!(matches!(
        alice.manager.prepare_message(&alice.session_with(&bob), b"late"),
        Err(CryptoError::Locked)
    ));
    assert!(alice.lock.enforce_inactivity_timeout());

    alice.lock.unlock(PIN).unwrap();
    assert!(alice.manager.prepare_message(&alice.session_with(&bob), b"late").is_ok());
}

#[test]
fn wrong_pins_wipe_the_device() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    let bob = device("bob", &clock);
    connect(&alice, &bob);
    alice.lock.lock();

    assert!(matches!(
        alice.lock.unlock("000000"),
        Err(CryptoError::WrongPin { remaining: Some(2) })
    ));
    assert!(matches!(
        alice.lock.unlock("000001"),
        Err(CryptoError::WrongPin { remaining: Some(1) })
    ));
    let err = alice.lock.unlock("000002").unwrap_err();
    assert!(matches!(err, CryptoError::WipeTriggered));
    assert!(err.is_irreversible());

    assert!(alice.keychain.is_empty());
    assert!(matches!(alice.lock.unlock(PIN), Err(CryptoError::NotProvisioned)));
    assert!(matches!(
        alice.manager.prepare_message(&alice.session_with(&bob), b"x"),
        Err(CryptoError::NotInitialized)
    ));
}

#[test]
fn wiped_keys_stay_gone_after_provisioning_a_new_pin() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    let bob = device("bob", &clock);
    connect(&alice, &bob);
    bob.receive(&alice, &alice.send(&bob, b"hello")).unwrap();
    alice.receive(&bob, &bob.send(&alice, b"ack")).unwrap();
    let after_wipe = bob.send(&alice, b"post-wipe secret");

    for pin in ["1", "2", "3"] {
        let _ = alice.lock.unlock(pin);
    }
    assert!(alice.keychain.is_empty());
    alice.lock.provision("9999").unwrap();

    assert!(matches!(
        alice.receive(&bob, &after_wipe),
        Err(CryptoError::NotInitialized)
    ));
    assert!(matches!(
        alice.manager.prepare_message(&alice.session_with(&bob), b"x"),
        Err(CryptoError::NotInitialized)
    ));
    assert!(matches!(
        alice.manager.identity_public_key(),
        Err(CryptoError::NotInitialized)
    ));
    assert!(!alice.manager.has_session(&alice.session_with(&bob)));
    assert_eq!(alice.manager.trust_status(&bob.id), None);

    // Nothing was written back under the new master key.
    assert!(alice.store().list("sessions").unwrap().is_empty());
}

#[test]
fn successful_unlock_resets_the_failure_count() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    alice.lock.lock();

    for _ in 0..2 {
        assert!(alice.lock.unlock("999999").is_err());
    }
    alice.lock.unlock(PIN).unwrap();
    assert_eq!(alice.lock.remaining_attempts().unwrap(), Some(3));
}

// ── Recovery ──

#[test]
fn recovery_code_resets_a_forgotten_pin() {
    let clock = ManualClock::new(1_700_000_000);
    let mut alice = device("alice", &clock);
    let mut bob = device("bob", &clock);
    connect(&alice, &bob);
    bob.receive(&alice, &alice.send(&bob, b"hello")).unwrap();

    let code = alice.store().create_recovery_artifact().unwrap();
    alice.lock.lock();

    let recovered = BackupCodec::restore_from_artifact(code.expose()).unwrap();
    alice.lock.reset_pin(&recovered, "135790").unwrap();
    alice.lock.lock();
    assert!(matches!(
        alice.lock.unlock(PIN),
        Err(CryptoError::WrongPin { .. })
    ));
    alice.lock.unlock("135790").unwrap();

    alice.reopen();
    bob.reopen();
    assert_eq!(alice.receive(&bob, &bob.send(&alice, b"welcome back")).unwrap(), b"welcome back");
}

#[test]
fn recovery_code_of_another_device_is_refused() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    let bob = device("bob", &clock);

    let bobs = BackupCodec::restore_from_artifact(
        bob.store().create_recovery_artifact().unwrap().expose(),
    )
    .unwrap();
    assert!(matches!(
        alice.lock.reset_pin(&bobs, "135790"),
        Err(CryptoError::InvalidRecoveryCode)
    ));
}

#[test]
fn recovery_after_wipe_restores_the_lock_but_not_the_keys() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    let code = alice.store().create_recovery_artifact().unwrap();
    alice.lock.lock();
    for pin in ["1", "2", "3"] {
        let _ = alice.lock.unlock(pin);
    }
    assert!(alice.keychain.is_empty());

    let recovered = BackupCodec::restore_from_artifact(code.expose()).unwrap();
    alice.lock.reset_pin(&recovered, PIN).unwrap();
    assert!(alice.lock.is_provisioned().unwrap());
    assert!(matches!(
        SessionManager::open(alice.id.clone(), config(), alice.store(), Arc::new(clock.clone())),
        Err(CryptoError::NotInitialized)
    ));
}

// ── Trust ──

#[test]
fn safety_numbers_agree_and_verify() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    let bob = device("bob", &clock);
    connect(&alice, &bob);
    bob.receive(&alice, &alice.send(&bob, b"hello")).unwrap();

    let on_alice = alice.manager.safety_number(&bob.id).unwrap();
    let on_bob = bob.manager.safety_number(&alice.id).unwrap();
    assert_eq!(on_alice, on_bob);
    assert_eq!(alice.manager.trust_status(&bob.id), Some(TrustStatus::Unverified));

    assert!(matches!(
        alice.manager.verify_safety_number(&bob.id, &"1".repeat(60)),
        Err(CryptoError::SafetyNumberMismatch)
    ));
    alice
        .manager
        .verify_safety_number(&bob.id, &on_bob.to_string())
        .unwrap();
    assert_eq!(alice.manager.trust_status(&bob.id), Some(TrustStatus::Verified));
}

#[test]
fn reinstalled_peer_is_no_longer_verified() {
    let clock = ManualClock::new(1_700_000_000);
    let mut alice = device("alice", &clock);
    let bob = device("bob", &clock);
    connect(&alice, &bob);
    bob.receive(&alice, &alice.send(&bob, b"hello")).unwrap();
    let before = alice.manager.safety_number(&bob.id).unwrap();
    alice
        .manager
        .verify_safety_number(&bob.id, before.digits())
        .unwrap();

    // Same device name, fresh identity.
    let bob = device("bob", &clock);
    let bundle = alice.manager.public_bundle().unwrap().take_prekey_bundle();
    bob.manager.initiate(&alice.id, &bundle).unwrap();
    assert!(alice.manager.take_identity_changes().is_empty());
    assert_eq!(alice.receive(&bob, &bob.send(&alice, b"new phone")).unwrap(), b"new phone");

    assert_eq!(alice.manager.take_identity_changes(), vec![bob.id.clone()]);
    assert_eq!(alice.manager.trust_status(&bob.id), Some(TrustStatus::Unverified));
    assert_ne!(alice.manager.safety_number(&bob.id).unwrap(), before);

    // The change is persisted with the trust table.
    alice.reopen();
    assert_eq!(alice.manager.trust_status(&bob.id), Some(TrustStatus::Unverified));
    assert_eq!(
        alice.manager.remote_identity(&alice.session_with(&bob)).unwrap(),
        bob.manager.identity_public_key().unwrap()
    );
}

// ── Concurrency ──

#[test]
fn independent_sessions_run_in_parallel() {
    let clock = ManualClock::new(1_700_000_000);
    let carol = device("carol", &clock);
    let peers: Vec<_> = ["alice", "bob", "dave"]
        .iter()
        .map(|name| device(name, &clock))
        .collect();
    for peer in &peers {
        connect(peer, &carol);
    }

    std::thread::scope(|scope| {
        for peer in &peers {
            let carol = &carol;
            scope.spawn(move || {
                for i in 0..20u8 {
                    let wire = peer.send(carol, &[i]);
                    assert_eq!(carol.receive(peer, &wire).unwrap(), vec![i]);
                    let wire = carol.send(peer, &[i, i]);
                    assert_eq!(peer.receive(carol, &wire).unwrap(), vec![i, i]);
                }
            });
        }
    });

    assert_eq!(carol.store().list("sessions").unwrap().len(), peers.len());
}

#[test]
fn one_session_shared_by_many_threads() {
    let clock = ManualClock::new(1_700_000_000);
    let alice = device("alice", &clock);
    let bob = device("bob", &clock);
    connect(&alice, &bob);
    bob.receive(&alice, &alice.send(&bob, b"hello")).unwrap();
    alice.receive(&bob, &bob.send(&alice, b"ack")).unwrap();

    // Four senders share Alice's single session with Bob.
    let sent: Vec<(u8, Vec<u8>)> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4u8)
            .map(|thread| {
                let (alice, bob) = (&alice, &bob);
                scope.spawn(move || {
                    (0..10u8)
                        .map(|i| {
                            let plaintext = thread * 10 + i;
                            (plaintext, alice.send(bob, &[plaintext]))
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });

    let mut numbers: Vec<u32> = sent
        .iter()
        .map(|(_, wire)| Envelope::decode(wire).unwrap().message().header.message_number)
        .collect();
    numbers.sort_unstable();
    assert_eq!(numbers, (0..40).collect::<Vec<u32>>());

    // Four receivers share Bob's session; each message opens exactly once.
    std::thread::scope(|scope| {
        for chunk in sent.chunks(10) {
            let (alice, bob) = (&alice, &bob);
            scope.spawn(move || {
                for (plaintext, wire) in chunk {
                    assert_eq!(bob.receive(alice, wire).unwrap(), vec![*plaintext]);
                }
            });
        }
    });
    for (_, wire) in &sent {
        assert!(matches!(
            bob.receive(&alice, wire),
            Err(CryptoError::ReplayDetected)
        ));
    }
}
