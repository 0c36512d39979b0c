//! Per-message authenticated encryption.
//!
//! A message key is expanded into an AES-256 key, an HMAC key and a 96-bit
//! IV. The payload is AES-256-GCM over the plaintext with the caller's
//! associated data, followed by a truncated HMAC-SHA256 over `ad || ct` that
//! commits the ciphertext to this one key.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

const KEY_INFO: &[u8] = b"CinderMessageKeys";
const ENC_KEY_LEN: usize = 32;
const MAC_KEY_LEN: usize = 32;
const IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;
const COMMIT_TAG_LEN: usize = 16;

/// Bytes added to every plaintext by [`MessageCipher::seal`].
pub const CIPHERTEXT_OVERHEAD: usize = GCM_TAG_LEN + COMMIT_TAG_LEN;

/// A single-use key for exactly one message.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MessageKey([u8; 32]);

impl MessageKey {
    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageKey(<redacted>)")
    }
}

struct DerivedKeys {
    enc: Zeroizing<[u8; ENC_KEY_LEN]>,
    mac: Zeroizing<[u8; MAC_KEY_LEN]>,
    iv: [u8; IV_LEN],
}

fn derive(key: &MessageKey) -> DerivedKeys {
    let hk = Hkdf::<Sha256>::new(None, key.as_bytes());
    let mut okm = Zeroizing::new([0u8; ENC_KEY_LEN + MAC_KEY_LEN + IV_LEN]);
    if hk.expand(KEY_INFO, &mut *okm).is_err() {
        unreachable!("76 bytes is a valid HKDF-SHA256 output length");
    }

    let mut enc = Zeroizing::new([0u8; ENC_KEY_LEN]);
    let mut mac = Zeroizing::new([0u8; MAC_KEY_LEN]);
    let mut iv = [0u8; IV_LEN];
    enc.copy_from_slice(&okm[..ENC_KEY_LEN]);
    mac.copy_from_slice(&okm[ENC_KEY_LEN..ENC_KEY_LEN + MAC_KEY_LEN]);
    iv.copy_from_slice(&okm[ENC_KEY_LEN + MAC_KEY_LEN..]);
    DerivedKeys { enc, mac, iv }
}

fn commitment(mac_key: &[u8], ad: &[u8], ciphertext: &[u8]) -> Result<[u8; COMMIT_TAG_LEN], CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(ad);
    mac.update(ciphertext);
    let full = mac.finalize().into_bytes();
    let mut tag = [0u8; COMMIT_TAG_LEN];
    tag.copy_from_slice(&full[..COMMIT_TAG_LEN]);
    Ok(tag)
}

pub struct MessageCipher;

impl MessageCipher {
    /// Encrypt `plaintext` under `key`, binding `ad`. The key is consumed.
    pub fn seal(key: MessageKey, plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let keys = derive(&key);
        drop(key);

        let cipher = Aes256Gcm::new_from_slice(keys.enc.as_slice())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let mut output = cipher
            .encrypt(Nonce::from_slice(&keys.iv), Payload { msg: plaintext, aad: ad })
            .map_err(|_| CryptoError::KeyGeneration("message encryption failed".into()))?;

        let tag = commitment(keys.mac.as_slice(), ad, &output)?;
        output.extend_from_slice(&tag);
        Ok(output)
    }

    /// Decrypt a payload produced by [`MessageCipher::seal`].
    ///
    /// Takes the key by reference so a caller holding a cached key can keep
    /// it when the payload turns out to be forged. Every failure is reported
    /// as [`CryptoError::AuthenticationFailed`].
    pub fn open(key: &MessageKey, payload: &[u8], ad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if payload.len() < CIPHERTEXT_OVERHEAD {
            return Err(CryptoError::AuthenticationFailed);
        }
        let keys = derive(key);
        let (ciphertext, tag) = payload.split_at(payload.len() - COMMIT_TAG_LEN);

        let expected = commitment(keys.mac.as_slice(), ad, ciphertext)
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        if !bool::from(expected[..].ct_eq(tag)) {
            return Err(CryptoError::AuthenticationFailed);
        }

        let cipher = Aes256Gcm::new_from_slice(keys.enc.as_slice())
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        cipher
            .decrypt(Nonce::from_slice(&keys.iv), Payload { msg: ciphertext, aad: ad })
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}
