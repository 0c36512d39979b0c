//! The master key and the blob wrapping built on it.
//!
//! Everything the key store persists is sealed with XChaCha20-Poly1305 under
//! the master key (24-byte random nonce, 16-byte tag). The master key itself
//! is only ever persisted wrapped under a PIN-derived key.

use chacha20poly1305::aead::{Aead, KeyInit, OsRng, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::KdfParams;
use crate::error::CryptoError;

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
pub const MASTER_KEY_LEN: usize = 32;

/// Symmetric key that wraps every other secret at rest. Never persisted
/// directly.
#[derive(Clone, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; MASTER_KEY_LEN],
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut key = [0u8; MASTER_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_bytes(key: [u8; MASTER_KEY_LEN]) -> Self {
        Self { key }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.key
    }

    /// Non-secret value that identifies this key, used to confirm that a
    /// recovered key belongs to a given key store.
    pub fn check_value(&self) -> [u8; 32] {
        expand(&self.key, b"cinder-master-check-v1")
    }

    /// Seal `plaintext`, binding it to `aad`.
    ///
    /// Returns `[24-byte nonce || ciphertext || 16-byte tag]`.
    pub fn wrap(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal_blob(&self.key, plaintext, aad)
    }

    /// Open a blob produced by [`MasterKey::wrap`] with the same `aad`.
    pub fn unwrap(&self, data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        open_blob(&self.key, data, aad)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Keys stretched from a PIN: a verifier compared on unlock and a separate
/// key that wraps the master key.
pub(crate) struct PinKeys {
    pub verifier: [u8; 32],
    pub wrapping: Zeroizing<[u8; 32]>,
}

/// Stretch a PIN with Argon2id and split the output into verifier and
/// wrapping key via HKDF.
pub(crate) fn derive_pin_keys(
    pin: &str,
    salt: &[u8],
    params: KdfParams,
) -> Result<PinKeys, CryptoError> {
    use argon2::{Algorithm, Argon2, Params, Version};

    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| CryptoError::KeyGeneration(format!("argon2 params: {e}")))?;
    let hasher = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut stretched = Zeroizing::new([0u8; 32]);
    hasher
        .hash_password_into(pin.as_bytes(), salt, &mut *stretched)
        .map_err(|e| CryptoError::KeyGeneration(format!("argon2: {e}")))?;

    Ok(PinKeys {
        verifier: expand(stretched.as_slice(), b"cinder-pin-verifier-v1"),
        wrapping: Zeroizing::new(expand(stretched.as_slice(), b"cinder-pin-wrap-v1")),
    })
}

fn expand(ikm: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut out = [0u8; 32];
    // 32 bytes is far below the HKDF-SHA256 output limit.
    if hk.expand(info, &mut out).is_err() {
        unreachable!("32-byte output is valid for HKDF-SHA256");
    }
    out
}

pub(crate) fn seal_blob(
    key: &[u8; 32],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::StorageError("blob encryption failed".into()))?;

    let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub(crate) fn open_blob(
    key: &[u8; 32],
    data: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::AuthenticationFailed);
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    cipher
        .decrypt(XNonce::from_slice(nonce_bytes), Payload { msg: ciphertext, aad })
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

impl Zeroize for PinKeys {
    fn zeroize(&mut self) {
        self.verifier.zeroize();
        self.wrapping.zeroize();
    }
}

impl Drop for PinKeys {
    fn drop(&mut self) {
        self.zeroize();
    }
}
