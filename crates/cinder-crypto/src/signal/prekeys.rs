//! Identity and prekey lifecycle.
//!
//! The [`IdentityManager`] owns the device identity, the current signed
//! prekey, signed prekeys still inside their grace window and the pool of
//! unused one-time prekeys. Its public half is published as a
//! [`PublicBundle`]; a directory hands each initiator a single-use
//! [`PreKeyBundle`] cut from it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::clock::Clock;
use crate::config::ProtocolConfig;
use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, IdentityPublicKey};
use crate::keychain::{KEY_IDENTITY_MATERIAL, VAULT_IDENTITY};
use crate::keystore::KeyStore;

const SIGNATURE_DOMAIN: &[u8] = b"cinder-spk-v1";
const MATERIAL_VERSION: u8 = 2;

/// Bytes covered by a signed prekey signature. The creation time is signed
/// so a directory cannot make an old prekey look fresh.
fn signed_prekey_payload(id: u32, created_at: u64, public_key: &[u8; 32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(SIGNATURE_DOMAIN.len() + 4 + 8 + 32);
    payload.extend_from_slice(SIGNATURE_DOMAIN);
    payload.extend_from_slice(&id.to_be_bytes());
    payload.extend_from_slice(&created_at.to_be_bytes());
    payload.extend_from_slice(public_key);
    payload
}

/// Public half of a signed prekey as published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    pub id: u32,
    pub created_at: u64,
    pub public_key: [u8; 32],
    /// Ed25519 signature by the identity key.
    pub signature: Vec<u8>,
}

impl SignedPreKeyPublic {
    pub fn verify(&self, identity: &IdentityPublicKey) -> Result<(), CryptoError> {
        identity.verify(
            &signed_prekey_payload(self.id, self.created_at, &self.public_key),
            &self.signature,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub id: u32,
    pub public_key: [u8; 32],
}

/// Everything an initiator needs to start a session with an offline device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub identity_key: IdentityPublicKey,
    pub signed_prekey: SignedPreKeyPublic,
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
}

/// The full public material a device publishes to its directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicBundle {
    pub identity_key: IdentityPublicKey,
    pub signed_prekey: SignedPreKeyPublic,
    pub one_time_prekeys: Vec<OneTimePreKeyPublic>,
}

impl PublicBundle {
    /// Hand out a bundle for one initiator, removing the one-time prekey it
    /// carries so no other initiator receives it. Once the pool is empty the
    /// bundle carries none.
    pub fn take_prekey_bundle(&mut self) -> PreKeyBundle {
        let one_time_prekey = if self.one_time_prekeys.is_empty() {
            None
        } else {
            Some(self.one_time_prekeys.remove(0))
        };
        PreKeyBundle {
            identity_key: self.identity_key,
            signed_prekey: self.signed_prekey.clone(),
            one_time_prekey,
        }
    }
}

/// A signed prekey with its private half.
#[derive(Clone)]
pub struct SignedPreKey {
    id: u32,
    created_at: u64,
    secret: StaticSecret,
    signature: Vec<u8>,
}

impl SignedPreKey {
    fn generate(identity: &IdentityKeyPair, id: u32, created_at: u64) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        let signature = identity
            .sign(&signed_prekey_payload(id, created_at, public.as_bytes()))
            .to_bytes()
            .to_vec();
        Self {
            id,
            created_at,
            secret,
            signature,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn public(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            id: self.id,
            created_at: self.created_at,
            public_key: X25519Public::from(&self.secret).to_bytes(),
            signature: self.signature.clone(),
        }
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

/// A one-time prekey with its private half. Consumed at most once.
pub struct OneTimePreKey {
    id: u32,
    secret: StaticSecret,
}

impl OneTimePreKey {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn public(&self) -> OneTimePreKeyPublic {
        OneTimePreKeyPublic {
            id: self.id,
            public_key: X25519Public::from(&self.secret).to_bytes(),
        }
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

struct RetiringPreKey {
    prekey: SignedPreKey,
    retired_at: u64,
}

struct Material {
    identity: IdentityKeyPair,
    current: SignedPreKey,
    retiring: Vec<RetiringPreKey>,
    one_time: BTreeMap<u32, OneTimePreKey>,
    next_signed_id: u32,
    next_one_time_id: u32,
    /// Base keys of handshakes already turned into sessions, oldest first.
    accepted_handshakes: VecDeque<[u8; 32]>,
}

/// Owner of the identity keypair and every prekey.
pub struct IdentityManager {
    config: ProtocolConfig,
    clock: Arc<dyn Clock>,
    material: Option<Material>,
}

impl IdentityManager {
    /// An empty manager. Call [`IdentityManager::generate_identity`] or
    /// [`IdentityManager::load`] before use.
    pub fn new(config: ProtocolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            material: None,
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.material.is_some()
    }

    /// Create the device identity and its first signed prekey.
    pub fn generate_identity(&mut self) -> Result<IdentityPublicKey, CryptoError> {
        if self.material.is_some() {
            return Err(CryptoError::AlreadyInitialized);
        }
        let identity = IdentityKeyPair::generate();
        let current = SignedPreKey::generate(&identity, 1, self.clock.now_secs());
        let public = identity.public_key();
        self.material = Some(Material {
            identity,
            current,
            retiring: Vec::new(),
            one_time: BTreeMap::new(),
            next_signed_id: 2,
            next_one_time_id: 1,
            accepted_handshakes: VecDeque::new(),
        });
        tracing::info!(identity = %public.to_hex(), "identity generated");
        Ok(public)
    }

    pub fn identity_public_key(&self) -> Result<IdentityPublicKey, CryptoError> {
        Ok(self.material()?.identity.public_key())
    }

    pub(crate) fn identity(&self) -> Result<&IdentityKeyPair, CryptoError> {
        Ok(&self.material()?.identity)
    }

    /// Replace the current signed prekey. The previous one keeps accepting
    /// handshakes until the grace window runs out.
    pub fn rotate_signed_prekey(&mut self) -> Result<SignedPreKeyPublic, CryptoError> {
        let now = self.clock.now_secs();
        let material = self.material_mut()?;
        let id = material.next_signed_id;
        material.next_signed_id = id.wrapping_add(1).max(1);

        let fresh = SignedPreKey::generate(&material.identity, id, now);
        let previous = std::mem::replace(&mut material.current, fresh);
        tracing::info!(new = id, retiring = previous.id, "signed prekey rotated");
        material.retiring.push(RetiringPreKey {
            prekey: previous,
            retired_at: now,
        });
        Ok(material.current.public())
    }

    /// Generate `count` one-time prekeys and return their public halves.
    pub fn generate_one_time_prekeys(
        &mut self,
        count: u32,
    ) -> Result<Vec<OneTimePreKeyPublic>, CryptoError> {
        let material = self.material_mut()?;
        let mut published = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = material.next_one_time_id;
            material.next_one_time_id = id
                .checked_add(1)
                .ok_or_else(|| CryptoError::KeyGeneration("one-time prekey ids exhausted".into()))?;
            let prekey = OneTimePreKey {
                id,
                secret: StaticSecret::random_from_rng(OsRng),
            };
            published.push(prekey.public());
            material.one_time.insert(id, prekey);
        }
        tracing::debug!(count, pool = material.one_time.len(), "one-time prekeys generated");
        Ok(published)
    }

    /// Generate a fresh batch once the pool has fallen below the low-water
    /// mark. Returns the newly generated public halves.
    pub fn replenish(&mut self) -> Result<Vec<OneTimePreKeyPublic>, CryptoError> {
        if !self.needs_replenish() {
            return Ok(Vec::new());
        }
        self.generate_one_time_prekeys(self.config.one_time_prekey_batch)
    }

    /// Remove a one-time prekey from the pool and hand over its private half.
    ///
    /// Removal is the consumption: a second call for the same ID fails with
    /// [`CryptoError::PreKeyAlreadyConsumed`].
    pub fn consume_one_time_prekey(&mut self, id: u32) -> Result<OneTimePreKey, CryptoError> {
        let material = self.material_mut()?;
        match material.one_time.remove(&id) {
            Some(prekey) => {
                tracing::debug!(id, remaining = material.one_time.len(), "one-time prekey consumed");
                Ok(prekey)
            }
            None => Err(missing_one_time(material, id)),
        }
    }

    /// Look up a one-time prekey without consuming it.
    pub(crate) fn one_time_prekey(&self, id: u32) -> Result<&OneTimePreKey, CryptoError> {
        let material = self.material()?;
        material
            .one_time
            .get(&id)
            .ok_or_else(|| missing_one_time(material, id))
    }

    /// Whether a handshake with this base key was already accepted.
    pub(crate) fn handshake_accepted(&self, base_key: &[u8; 32]) -> Result<bool, CryptoError> {
        Ok(self.material()?.accepted_handshakes.contains(base_key))
    }

    /// Commit a verified handshake: burn its one-time prekey, remember its
    /// base key and persist both. Memory is left as it was if the write
    /// fails.
    pub(crate) fn accept_handshake(
        &mut self,
        store: &KeyStore,
        base_key: [u8; 32],
        one_time_prekey_id: Option<u32>,
    ) -> Result<(), CryptoError> {
        let consumed = one_time_prekey_id
            .map(|id| self.consume_one_time_prekey(id))
            .transpose()?;
        let memory = self.config.accepted_handshake_memory;
        let material = self.material_mut()?;
        let previous = material.accepted_handshakes.clone();
        if memory > 0 {
            material.accepted_handshakes.push_back(base_key);
            while material.accepted_handshakes.len() > memory {
                material.accepted_handshakes.pop_front();
            }
        }

        if let Err(e) = self.save(store) {
            let material = self.material_mut()?;
            material.accepted_handshakes = previous;
            if let Some(prekey) = consumed {
                material.one_time.insert(prekey.id, prekey);
            }
            return Err(e);
        }
        Ok(())
    }

    /// The current or a still-retiring signed prekey. Anything else has
    /// expired.
    pub(crate) fn signed_prekey(&self, id: u32) -> Result<&SignedPreKey, CryptoError> {
        let material = self.material()?;
        if material.current.id == id {
            return Ok(&material.current);
        }
        material
            .retiring
            .iter()
            .map(|r| &r.prekey)
            .find(|p| p.id == id)
            .ok_or(CryptoError::StalePreKey)
    }

    /// Discard retiring signed prekeys whose grace window has passed.
    /// Returns how many were discarded.
    pub fn purge_expired(&mut self) -> Result<usize, CryptoError> {
        let now = self.clock.now_secs();
        let grace = self.config.signed_prekey_grace_secs;
        let material = self.material_mut()?;
        let before = material.retiring.len();
        material
            .retiring
            .retain(|r| now.saturating_sub(r.retired_at) < grace);
        let purged = before - material.retiring.len();
        if purged > 0 {
            tracing::info!(purged, "retired signed prekeys purged");
        }
        Ok(purged)
    }

    pub fn needs_rotation(&self) -> bool {
        self.material.as_ref().is_some_and(|m| {
            self.clock.now_secs().saturating_sub(m.current.created_at)
                >= self.config.signed_prekey_rotation_secs
        })
    }

    pub fn needs_replenish(&self) -> bool {
        self.material
            .as_ref()
            .is_some_and(|m| m.one_time.len() < self.config.one_time_prekey_low_water)
    }

    pub fn one_time_prekey_count(&self) -> usize {
        self.material.as_ref().map_or(0, |m| m.one_time.len())
    }

    pub fn retiring_count(&self) -> usize {
        self.material.as_ref().map_or(0, |m| m.retiring.len())
    }

    pub fn public_bundle(&self) -> Result<PublicBundle, CryptoError> {
        let material = self.material()?;
        Ok(PublicBundle {
            identity_key: material.identity.public_key(),
            signed_prekey: material.current.public(),
            one_time_prekeys: material.one_time.values().map(OneTimePreKey::public).collect(),
        })
    }

    /// Destroy the identity and all prekeys. Afterwards
    /// [`IdentityManager::generate_identity`] may be called again.
    pub fn wipe(&mut self) {
        if self.material.take().is_some() {
            tracing::warn!("identity material wiped");
        }
    }

    /// Persist all material as one blob in the key store.
    pub fn save(&self, store: &KeyStore) -> Result<(), CryptoError> {
        let stored = StoredMaterial::from_material(self.material()?);
        let bytes = Zeroizing::new(bincode::serialize(&stored)?);
        store.put(VAULT_IDENTITY, KEY_IDENTITY_MATERIAL, &bytes)
    }

    /// Restore a manager saved with [`IdentityManager::save`].
    pub fn load(
        config: ProtocolConfig,
        clock: Arc<dyn Clock>,
        store: &KeyStore,
    ) -> Result<Self, CryptoError> {
        let bytes = store
            .get(VAULT_IDENTITY, KEY_IDENTITY_MATERIAL)?
            .ok_or(CryptoError::NotInitialized)?;
        let stored: StoredMaterial = bincode::deserialize(&bytes)?;
        if stored.version != MATERIAL_VERSION {
            return Err(CryptoError::Serialization(format!(
                "unsupported identity material version {}",
                stored.version
            )));
        }
        Ok(Self {
            config,
            clock,
            material: Some(stored.into_material()),
        })
    }

    fn material(&self) -> Result<&Material, CryptoError> {
        self.material.as_ref().ok_or(CryptoError::NotInitialized)
    }

    fn material_mut(&mut self) -> Result<&mut Material, CryptoError> {
        self.material.as_mut().ok_or(CryptoError::NotInitialized)
    }
}

fn missing_one_time(material: &Material, id: u32) -> CryptoError {
    if id != 0 && id < material.next_one_time_id {
        CryptoError::PreKeyAlreadyConsumed(id)
    } else {
        CryptoError::UnknownPreKey(id)
    }
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("initialized", &self.is_initialized())
            .field("one_time_prekeys", &self.one_time_prekey_count())
            .finish_non_exhaustive()
    }
}

// Serialized form. Only ever exists inside a `Zeroizing` buffer on its way
// into or out of the key store.

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredSignedPreKey {
    id: u32,
    created_at: u64,
    secret: [u8; 32],
    signature: Vec<u8>,
    retired_at: u64,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredOneTimePreKey {
    id: u32,
    secret: [u8; 32],
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredMaterial {
    version: u8,
    identity_secret: [u8; 32],
    current: StoredSignedPreKey,
    retiring: Vec<StoredSignedPreKey>,
    one_time: Vec<StoredOneTimePreKey>,
    next_signed_id: u32,
    next_one_time_id: u32,
    accepted_handshakes: Vec<[u8; 32]>,
}

impl StoredSignedPreKey {
    fn new(prekey: &SignedPreKey, retired_at: u64) -> Self {
        Self {
            id: prekey.id,
            created_at: prekey.created_at,
            secret: prekey.secret.to_bytes(),
            signature: prekey.signature.clone(),
            retired_at,
        }
    }

    fn restore(&self) -> SignedPreKey {
        SignedPreKey {
            id: self.id,
            created_at: self.created_at,
            secret: StaticSecret::from(self.secret),
            signature: self.signature.clone(),
        }
    }
}

impl StoredMaterial {
    fn from_material(material: &Material) -> Self {
        Self {
            version: MATERIAL_VERSION,
            identity_secret: *material.identity.secret_key_bytes(),
            current: StoredSignedPreKey::new(&material.current, 0),
            retiring: material
                .retiring
                .iter()
                .map(|r| StoredSignedPreKey::new(&r.prekey, r.retired_at))
                .collect(),
            one_time: material
                .one_time
                .values()
                .map(|p| StoredOneTimePreKey {
                    id: p.id,
                    secret: p.secret.to_bytes(),
                })
                .collect(),
            next_signed_id: material.next_signed_id,
            next_one_time_id: material.next_one_time_id,
            accepted_handshakes: material.accepted_handshakes.iter().copied().collect(),
        }
    }

    fn into_material(self) -> Material {
        Material {
            identity: IdentityKeyPair::from_secret_bytes(&self.identity_secret),
            current: self.current.restore(),
            retiring: self
                .retiring
                .iter()
                .map(|r| RetiringPreKey {
                    prekey: r.restore(),
                    retired_at: r.retired_at,
                })
                .collect(),
            one_time: self
                .one_time
                .iter()
                .map(|p| {
                    (
                        p.id,
                        OneTimePreKey {
                            id: p.id,
                            secret: StaticSecret::from(p.secret),
                        },
                    )
                })
                .collect(),
            next_signed_id: self.next_signed_id,
            next_one_time_id: self.next_one_time_id,
            accepted_handshakes: self.accepted_handshakes.iter().copied().collect(),
        }
    }
}
