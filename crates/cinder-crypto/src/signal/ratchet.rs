//! The Double Ratchet.
//!
//! Every message advances a symmetric chain; every change of the remote
//! ratchet key advances the root through a fresh Diffie-Hellman exchange.
//! Decryption runs on a staged copy of the chain state and commits only
//! once the message has authenticated, so a forged or corrupted message
//! never moves the ratchet.

use std::collections::VecDeque;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::cipher::{MessageCipher, MessageKey};
use crate::config::ProtocolConfig;
use crate::error::CryptoError;
use crate::signal::skipped::{ChainIndex, ReplayWindow, SkippedKeyCache};
use crate::signal::x3dh::SharedSecret;

type HmacSha256 = Hmac<Sha256>;

const ROOT_INFO: &[u8] = b"CinderRatchet";
const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;
const STATE_VERSION: u8 = 1;

pub const HEADER_LEN: usize = 40;

/// Sent in the clear alongside every ratcheted message and authenticated as
/// associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sender's current ratchet public key.
    pub ratchet_key: [u8; 32],
    /// Length of the sender's previous sending chain.
    pub previous_chain_length: u32,
    pub message_number: u32,
}

impl Header {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..32].copy_from_slice(&self.ratchet_key);
        out[32..36].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        out[36..].copy_from_slice(&self.message_number.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Self {
        let mut ratchet_key = [0u8; 32];
        ratchet_key.copy_from_slice(&bytes[..32]);
        let mut previous = [0u8; 4];
        previous.copy_from_slice(&bytes[32..36]);
        let mut number = [0u8; 4];
        number.copy_from_slice(&bytes[36..]);
        Self {
            ratchet_key,
            previous_chain_length: u32::from_be_bytes(previous),
            message_number: u32::from_be_bytes(number),
        }
    }

    fn position(&self) -> ChainIndex {
        (self.ratchet_key, self.message_number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Sending,
    Receiving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Uninitialized,
    /// Seeded from the handshake; no message has been processed yet.
    Established,
    /// The last operation moved the given chain.
    Ratcheting(Direction),
    Closed,
}

#[derive(Clone)]
struct Chain {
    key: Zeroizing<[u8; 32]>,
    index: u32,
}

impl Chain {
    fn new(key: Zeroizing<[u8; 32]>) -> Self {
        Self { key, index: 0 }
    }

    /// Derive this position's message key and move to the next position.
    /// A chain that has used every message number refuses to step.
    fn step(&mut self) -> Result<MessageKey, CryptoError> {
        let index = self.index.checked_add(1).ok_or(CryptoError::ChainExhausted)?;
        let message_key = chain_hmac(&self.key, MESSAGE_KEY_SEED);
        let next = chain_hmac(&self.key, CHAIN_KEY_SEED);
        self.key = Zeroizing::new(next);
        self.index = index;
        Ok(MessageKey::from_bytes(message_key))
    }
}

fn chain_hmac(key: &[u8; 32], seed: u8) -> [u8; 32] {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac.update(&[seed]);
    mac.finalize().into_bytes().into()
}

/// Root KDF: mix a DH output into the root key, producing a new root key and
/// a new chain key.
fn kdf_rk(
    root_key: &[u8; 32],
    dh_output: &[u8; 32],
) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
    let hk = Hkdf::<Sha256>::new(Some(&root_key[..]), dh_output);
    let mut okm = Zeroizing::new([0u8; 64]);
    if hk.expand(ROOT_INFO, &mut *okm).is_err() {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    }
    let mut root = Zeroizing::new([0u8; 32]);
    let mut chain = Zeroizing::new([0u8; 32]);
    root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    (root, chain)
}

fn diffie_hellman(
    secret: &StaticSecret,
    remote: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let shared = secret.diffie_hellman(&X25519Public::from(*remote));
    if !shared.was_contributory() {
        return Err(CryptoError::AuthenticationFailed);
    }
    Ok(Zeroizing::new(shared.to_bytes()))
}

/// Keys and counters that move with every step. Small enough to clone for
/// staging.
#[derive(Clone)]
struct RatchetState {
    root_key: Zeroizing<[u8; 32]>,
    dh_self: StaticSecret,
    dh_remote: [u8; 32],
    sending: Option<Chain>,
    receiving: Option<Chain>,
    previous_sending_length: u32,
}

/// A decryption computed but not yet committed.
struct Staged {
    state: RatchetState,
    skipped: Vec<(ChainIndex, MessageKey)>,
    retired: Option<[u8; 32]>,
    message_key: MessageKey,
}

/// One side of a pairwise Double Ratchet session.
pub struct RatchetEngine {
    phase: Phase,
    max_skip_per_chain: u32,
    retired_capacity: usize,
    state: Option<RatchetState>,
    skipped: SkippedKeyCache,
    replay: ReplayWindow,
    retired_remotes: VecDeque<[u8; 32]>,
    associated_data: Vec<u8>,
}

impl RatchetEngine {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            phase: Phase::Uninitialized,
            max_skip_per_chain: config.max_skip_per_chain,
            retired_capacity: config.retired_chain_memory,
            state: None,
            skipped: SkippedKeyCache::new(config.max_skipped_keys),
            replay: ReplayWindow::new(config.replay_window),
            retired_remotes: VecDeque::new(),
            associated_data: Vec::new(),
        }
    }

    /// Seed the initiator: the handshake chain key is the first sending
    /// chain and the handshake ephemeral key the first ratchet key.
    pub fn initialize_as_initiator(
        &mut self,
        shared: SharedSecret,
        ephemeral: StaticSecret,
        remote_signed_prekey: &X25519Public,
    ) -> Result<(), CryptoError> {
        self.check_uninitialized()?;
        self.state = Some(RatchetState {
            root_key: shared.root_key,
            dh_self: ephemeral,
            dh_remote: remote_signed_prekey.to_bytes(),
            sending: Some(Chain::new(shared.chain_key)),
            receiving: None,
            previous_sending_length: 0,
        });
        self.associated_data = shared.associated_data;
        self.phase = Phase::Established;
        Ok(())
    }

    /// Seed the responder: the handshake chain key receives the initiator's
    /// first chain, and a fresh ratchet key starts the reply chain right
    /// away.
    pub fn initialize_as_responder(
        &mut self,
        shared: SharedSecret,
        initiator_base_key: &[u8; 32],
    ) -> Result<(), CryptoError> {
        self.check_uninitialized()?;
        let dh_self = StaticSecret::random_from_rng(OsRng);
        let dh = diffie_hellman(&dh_self, initiator_base_key)
            .map_err(|_| CryptoError::InvalidKey("non-contributory base key".into()))?;
        let (root_key, sending_key) = kdf_rk(&shared.root_key, &dh);

        self.state = Some(RatchetState {
            root_key,
            dh_self,
            dh_remote: *initiator_base_key,
            sending: Some(Chain::new(sending_key)),
            receiving: Some(Chain::new(shared.chain_key)),
            previous_sending_length: 0,
        });
        self.associated_data = shared.associated_data;
        self.phase = Phase::Established;
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Derive the next sending message key and advance the sending chain in
    /// one step. The previous chain key is overwritten.
    pub fn encrypt_step(&mut self) -> Result<(Header, MessageKey), CryptoError> {
        self.check_active()?;
        let state = self.state.as_mut().ok_or(CryptoError::NotInitialized)?;
        let chain = state.sending.as_mut().ok_or(CryptoError::NotInitialized)?;
        let header = Header {
            ratchet_key: X25519Public::from(&state.dh_self).to_bytes(),
            previous_chain_length: state.previous_sending_length,
            message_number: chain.index,
        };
        let message_key = chain.step()?;
        self.phase = Phase::Ratcheting(Direction::Sending);
        Ok((header, message_key))
    }

    /// Encrypt one message. The sending chain only advances if sealing
    /// succeeds.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(Header, Vec<u8>), CryptoError> {
        self.check_active()?;
        let state = self.state.as_ref().ok_or(CryptoError::NotInitialized)?;
        let mut chain = state.sending.clone().ok_or(CryptoError::NotInitialized)?;
        let header = Header {
            ratchet_key: X25519Public::from(&state.dh_self).to_bytes(),
            previous_chain_length: state.previous_sending_length,
            message_number: chain.index,
        };
        let message_key = chain.step()?;
        let ciphertext = MessageCipher::seal(message_key, plaintext, &self.message_ad(&header))?;

        if let Some(state) = self.state.as_mut() {
            state.sending = Some(chain);
        }
        self.phase = Phase::Ratcheting(Direction::Sending);
        Ok((header, ciphertext))
    }

    /// Decrypt one message, performing a DH ratchet step if the sender has
    /// moved to a new ratchet key.
    ///
    /// Message keys for positions skipped on the way are cached. A position
    /// already consumed is [`CryptoError::ReplayDetected`]; one whose key is
    /// gone is [`CryptoError::MessageKeyExpired`].
    pub fn decrypt_step(
        &mut self,
        header: &Header,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.check_active()?;
        let position = header.position();
        let ad = self.message_ad(header);

        if self.replay.contains(&position) {
            tracing::warn!(n = header.message_number, "replayed message rejected");
            return Err(CryptoError::ReplayDetected);
        }

        if let Some(key) = self.skipped.get(&position) {
            let plaintext = MessageCipher::open(key, ciphertext, &ad)?;
            self.skipped.remove(&position);
            self.replay.record(position);
            self.phase = Phase::Ratcheting(Direction::Receiving);
            tracing::trace!(n = header.message_number, "decrypted with skipped key");
            return Ok(plaintext);
        }

        let state = self.state.as_ref().ok_or(CryptoError::NotInitialized)?;
        if header.ratchet_key == state.dh_remote {
            if let Some(chain) = &state.receiving {
                if header.message_number < chain.index {
                    return Err(CryptoError::MessageKeyExpired);
                }
            }
        } else if self.retired_remotes.contains(&header.ratchet_key) {
            return Err(CryptoError::MessageKeyExpired);
        }

        let staged = self.stage(header)?;
        let plaintext = MessageCipher::open(&staged.message_key, ciphertext, &ad)?;
        self.commit(staged, position);
        Ok(plaintext)
    }

    fn stage(&self, header: &Header) -> Result<Staged, CryptoError> {
        let mut next = self
            .state
            .clone()
            .ok_or(CryptoError::NotInitialized)?;
        let mut skipped = Vec::new();
        let mut retired = None;

        if header.ratchet_key != next.dh_remote {
            if let Some(chain) = next.receiving.as_mut() {
                self.skip_to(chain, next.dh_remote, header.previous_chain_length, &mut skipped)?;
            }
            retired = Some(next.dh_remote);

            let dh = diffie_hellman(&next.dh_self, &header.ratchet_key)?;
            let (root_key, receiving_key) = kdf_rk(&next.root_key, &dh);

            let dh_self = StaticSecret::random_from_rng(OsRng);
            let dh = diffie_hellman(&dh_self, &header.ratchet_key)?;
            let (root_key, sending_key) = kdf_rk(&root_key, &dh);

            next.previous_sending_length = next.sending.as_ref().map_or(0, |c| c.index);
            next.root_key = root_key;
            next.dh_self = dh_self;
            next.dh_remote = header.ratchet_key;
            next.receiving = Some(Chain::new(receiving_key));
            next.sending = Some(Chain::new(sending_key));
        }

        let chain = next
            .receiving
            .as_mut()
            .ok_or(CryptoError::AuthenticationFailed)?;
        self.skip_to(chain, header.ratchet_key, header.message_number, &mut skipped)?;
        let message_key = chain.step()?;

        Ok(Staged {
            state: next,
            skipped,
            retired,
            message_key,
        })
    }

    fn skip_to(
        &self,
        chain: &mut Chain,
        ratchet_key: [u8; 32],
        until: u32,
        out: &mut Vec<(ChainIndex, MessageKey)>,
    ) -> Result<(), CryptoError> {
        if until <= chain.index {
            return Ok(());
        }
        let requested = until - chain.index;
        if requested > self.max_skip_per_chain {
            tracing::warn!(requested, limit = self.max_skip_per_chain, "skip limit exceeded");
            return Err(CryptoError::TooManySkippedMessages {
                requested,
                limit: self.max_skip_per_chain,
            });
        }
        while chain.index < until {
            let index = chain.index;
            out.push(((ratchet_key, index), chain.step()?));
        }
        Ok(())
    }

    fn commit(&mut self, staged: Staged, position: ChainIndex) {
        let Staged {
            state,
            skipped,
            retired,
            message_key,
        } = staged;
        drop(message_key);

        if let Some(old) = retired {
            tracing::debug!("dh ratchet step");
            self.retired_remotes.push_back(old);
            while self.retired_remotes.len() > self.retired_capacity {
                self.retired_remotes.pop_front();
            }
        }
        for (index, key) in skipped {
            self.skipped.insert(index, key);
        }
        self.state = Some(state);
        self.replay.record(position);
        self.phase = Phase::Ratcheting(Direction::Receiving);
    }

    /// An independent copy to stage a step on. Whoever keeps the copy must
    /// drop the original, or both would hand out the same message keys.
    pub(crate) fn fork(&self) -> Self {
        Self {
            phase: self.phase,
            max_skip_per_chain: self.max_skip_per_chain,
            retired_capacity: self.retired_capacity,
            state: self.state.clone(),
            skipped: self.skipped.fork(),
            replay: self.replay.clone(),
            retired_remotes: self.retired_remotes.clone(),
            associated_data: self.associated_data.clone(),
        }
    }

    /// Tear the session down. Keys are zeroized and every later operation
    /// fails with [`CryptoError::SessionClosed`].
    pub fn close(&mut self) {
        self.state = None;
        self.skipped = SkippedKeyCache::new(0);
        self.phase = Phase::Closed;
    }

    /// Messages sent on the current sending chain.
    pub fn sending_index(&self) -> Option<u32> {
        self.state.as_ref()?.sending.as_ref().map(|c| c.index)
    }

    /// Messages received on the current receiving chain.
    pub fn receiving_index(&self) -> Option<u32> {
        self.state.as_ref()?.receiving.as_ref().map(|c| c.index)
    }

    /// SHA-256 of the root key, for comparing ratchet positions in tests
    /// without exposing the key.
    pub fn root_key_fingerprint(&self) -> Option<[u8; 32]> {
        let state = self.state.as_ref()?;
        Some(Sha256::digest(state.root_key.as_slice()).into())
    }

    /// Our current ratchet public key.
    pub fn ratchet_public_key(&self) -> Option<[u8; 32]> {
        self.state
            .as_ref()
            .map(|s| X25519Public::from(&s.dh_self).to_bytes())
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    fn message_ad(&self, header: &Header) -> Vec<u8> {
        let mut ad = Vec::with_capacity(self.associated_data.len() + HEADER_LEN);
        ad.extend_from_slice(&self.associated_data);
        ad.extend_from_slice(&header.to_bytes());
        ad
    }

    fn check_uninitialized(&self) -> Result<(), CryptoError> {
        match self.phase {
            Phase::Uninitialized => Ok(()),
            Phase::Closed => Err(CryptoError::SessionClosed),
            _ => Err(CryptoError::AlreadyInitialized),
        }
    }

    fn check_active(&self) -> Result<(), CryptoError> {
        match self.phase {
            Phase::Uninitialized => Err(CryptoError::NotInitialized),
            Phase::Closed => Err(CryptoError::SessionClosed),
            Phase::Established | Phase::Ratcheting(_) => Ok(()),
        }
    }

    /// Serialize the full state for the key store.
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let stored = StoredRatchet::from_engine(self);
        Ok(Zeroizing::new(bincode::serialize(&stored)?))
    }

    /// Restore an engine from [`RatchetEngine::to_bytes`]. Bounds come from
    /// `config`, not from the stored state.
    pub fn from_bytes(bytes: &[u8], config: &ProtocolConfig) -> Result<Self, CryptoError> {
        let stored: StoredRatchet = bincode::deserialize(bytes)?;
        if stored.version != STATE_VERSION {
            return Err(CryptoError::Serialization(format!(
                "unsupported ratchet state version {}",
                stored.version
            )));
        }
        Ok(stored.into_engine(config))
    }
}

impl std::fmt::Debug for RatchetEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetEngine")
            .field("phase", &self.phase)
            .field("sending_index", &self.sending_index())
            .field("receiving_index", &self.receiving_index())
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredChain {
    key: [u8; 32],
    index: u32,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredSkippedKey {
    ratchet_key: [u8; 32],
    message_number: u32,
    key: [u8; 32],
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredPosition {
    ratchet_key: [u8; 32],
    message_number: u32,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredRatchet {
    version: u8,
    #[zeroize(skip)]
    phase: Phase,
    root_key: Option<[u8; 32]>,
    dh_self: Option<[u8; 32]>,
    dh_remote: Option<[u8; 32]>,
    sending: Option<StoredChain>,
    receiving: Option<StoredChain>,
    previous_sending_length: u32,
    skipped: Vec<StoredSkippedKey>,
    replay: Vec<StoredPosition>,
    retired_remotes: Vec<[u8; 32]>,
    associated_data: Vec<u8>,
}

impl StoredChain {
    fn new(chain: &Chain) -> Self {
        Self {
            key: *chain.key,
            index: chain.index,
        }
    }

    fn restore(&self) -> Chain {
        Chain {
            key: Zeroizing::new(self.key),
            index: self.index,
        }
    }
}

impl StoredRatchet {
    fn from_engine(engine: &RatchetEngine) -> Self {
        let state = engine.state.as_ref();
        Self {
            version: STATE_VERSION,
            phase: engine.phase,
            root_key: state.map(|s| *s.root_key),
            dh_self: state.map(|s| s.dh_self.to_bytes()),
            dh_remote: state.map(|s| s.dh_remote),
            sending: state.and_then(|s| s.sending.as_ref()).map(StoredChain::new),
            receiving: state.and_then(|s| s.receiving.as_ref()).map(StoredChain::new),
            previous_sending_length: state.map_or(0, |s| s.previous_sending_length),
            skipped: engine
                .skipped
                .entries()
                .map(|((ratchet_key, message_number), key)| StoredSkippedKey {
                    ratchet_key: *ratchet_key,
                    message_number: *message_number,
                    key: *key.as_bytes(),
                })
                .collect(),
            replay: engine
                .replay
                .positions()
                .map(|(ratchet_key, message_number)| StoredPosition {
                    ratchet_key: *ratchet_key,
                    message_number: *message_number,
                })
                .collect(),
            retired_remotes: engine.retired_remotes.iter().copied().collect(),
            associated_data: engine.associated_data.clone(),
        }
    }

    fn into_engine(self, config: &ProtocolConfig) -> RatchetEngine {
        let mut engine = RatchetEngine::new(config);
        engine.phase = self.phase;
        engine.state = match (self.root_key, self.dh_self, self.dh_remote) {
            (Some(root_key), Some(dh_self), Some(dh_remote)) => Some(RatchetState {
                root_key: Zeroizing::new(root_key),
                dh_self: StaticSecret::from(dh_self),
                dh_remote,
                sending: self.sending.as_ref().map(StoredChain::restore),
                receiving: self.receiving.as_ref().map(StoredChain::restore),
                previous_sending_length: self.previous_sending_length,
            }),
            _ => None,
        };
        for entry in &self.skipped {
            engine.skipped.insert(
                (entry.ratchet_key, entry.message_number),
                MessageKey::from_bytes(entry.key),
            );
        }
        for position in &self.replay {
            engine
                .replay
                .record((position.ratchet_key, position.message_number));
        }
        engine.retired_remotes = self.retired_remotes.iter().copied().collect();
        while engine.retired_remotes.len() > engine.retired_capacity {
            engine.retired_remotes.pop_front();
        }
        engine.associated_data = self.associated_data.clone();
        engine
    }
}
