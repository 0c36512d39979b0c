//! Asynchronous session establishment (X3DH).
//!
//! The initiator combines its identity and a fresh ephemeral key with the
//! responder's identity, signed prekey and optional one-time prekey. The
//! responder recomputes the same secret later from the handshake fields
//! alone, without having been online when it was sent.

use std::sync::Arc;

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, SharedSecret as DhOutput, StaticSecret};
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::config::ProtocolConfig;
use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, IdentityPublicKey};
use crate::signal::prekeys::{IdentityManager, PreKeyBundle};

const X3DH_INFO: &[u8] = b"CinderX3DH";

/// Output of the handshake: the seed for the ratchet.
pub struct SharedSecret {
    pub(crate) root_key: Zeroizing<[u8; 32]>,
    pub(crate) chain_key: Zeroizing<[u8; 32]>,
    /// `IK_initiator || IK_responder`, bound into every message.
    pub(crate) associated_data: Vec<u8>,
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}

/// The handshake fields an initiator sends ahead of its first message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub identity_key: IdentityPublicKey,
    /// The initiator's ephemeral X25519 public key.
    pub base_key: [u8; 32],
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
}

/// Initiator side result.
pub struct InitiatedSession {
    pub shared: SharedSecret,
    pub handshake: Handshake,
    /// The ephemeral secret; it doubles as the first sending ratchet key.
    pub ephemeral: StaticSecret,
    pub remote_signed_prekey: X25519Public,
}

pub struct SessionEstablisher {
    clock: Arc<dyn Clock>,
    max_prekey_age_secs: u64,
}

impl SessionEstablisher {
    pub fn new(config: &ProtocolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            max_prekey_age_secs: config.signed_prekey_max_age_secs,
        }
    }

    /// Derive a shared secret from a remote prekey bundle.
    ///
    /// Fails with [`CryptoError::InvalidSignature`] if the signed prekey is
    /// not signed by the bundle's identity, or [`CryptoError::StalePreKey`]
    /// if it is older than the configured maximum age.
    pub fn initiate_session(
        &self,
        bundle: &PreKeyBundle,
        local_identity: &IdentityKeyPair,
        local_ephemeral: StaticSecret,
    ) -> Result<InitiatedSession, CryptoError> {
        bundle.signed_prekey.verify(&bundle.identity_key)?;

        let now = self.clock.now_secs();
        let age = now.saturating_sub(bundle.signed_prekey.created_at);
        if age > self.max_prekey_age_secs {
            tracing::warn!(
                spk = bundle.signed_prekey.id,
                age_secs = age,
                "refusing stale prekey bundle"
            );
            return Err(CryptoError::StalePreKey);
        }

        let remote_identity = bundle.identity_key.to_x25519()?;
        let remote_signed_prekey = X25519Public::from(bundle.signed_prekey.public_key);
        let local_identity_secret = local_identity.to_x25519_secret();

        let mut outputs = vec![
            local_identity_secret.diffie_hellman(&remote_signed_prekey),
            local_ephemeral.diffie_hellman(&remote_identity),
            local_ephemeral.diffie_hellman(&remote_signed_prekey),
        ];
        if let Some(one_time) = &bundle.one_time_prekey {
            outputs.push(local_ephemeral.diffie_hellman(&X25519Public::from(one_time.public_key)));
        }

        let shared = derive_shared_secret(
            &outputs,
            &local_identity.public_key(),
            &bundle.identity_key,
        )?;
        let handshake = Handshake {
            identity_key: local_identity.public_key(),
            base_key: X25519Public::from(&local_ephemeral).to_bytes(),
            signed_prekey_id: bundle.signed_prekey.id,
            one_time_prekey_id: bundle.one_time_prekey.map(|p| p.id),
        };
        tracing::debug!(
            spk = handshake.signed_prekey_id,
            otpk = ?handshake.one_time_prekey_id,
            "x3dh initiated"
        );

        Ok(InitiatedSession {
            shared,
            handshake,
            ephemeral: local_ephemeral,
            remote_signed_prekey,
        })
    }

    /// Recompute the initiator's shared secret from its handshake.
    ///
    /// The referenced one-time prekey is only looked up here; the caller
    /// consumes it once the first message has authenticated, so a forged
    /// handshake cannot burn prekeys.
    pub fn accept_session(
        &self,
        identities: &IdentityManager,
        handshake: &Handshake,
    ) -> Result<SharedSecret, CryptoError> {
        let local_identity = identities.identity()?;
        let signed_prekey = identities.signed_prekey(handshake.signed_prekey_id)?;

        let remote_identity = handshake.identity_key.to_x25519()?;
        let base_key = X25519Public::from(handshake.base_key);
        let local_identity_secret = local_identity.to_x25519_secret();

        let mut outputs = vec![
            signed_prekey.secret().diffie_hellman(&remote_identity),
            local_identity_secret.diffie_hellman(&base_key),
            signed_prekey.secret().diffie_hellman(&base_key),
        ];
        if let Some(id) = handshake.one_time_prekey_id {
            let one_time = identities.one_time_prekey(id)?;
            outputs.push(one_time.secret().diffie_hellman(&base_key));
        }

        derive_shared_secret(&outputs, &handshake.identity_key, &local_identity.public_key())
    }
}

fn derive_shared_secret(
    outputs: &[DhOutput],
    initiator: &IdentityPublicKey,
    responder: &IdentityPublicKey,
) -> Result<SharedSecret, CryptoError> {
    if outputs.iter().any(|dh| !dh.was_contributory()) {
        return Err(CryptoError::InvalidKey("non-contributory X25519 output".into()));
    }

    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * (outputs.len() + 1)));
    ikm.extend_from_slice(&[0xFF; 32]);
    for dh in outputs {
        ikm.extend_from_slice(dh.as_bytes());
    }

    let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32][..]), &ikm);
    let mut okm = Zeroizing::new([0u8; 64]);
    hk.expand(X3DH_INFO, &mut *okm)
        .map_err(|e| CryptoError::KeyGeneration(format!("HKDF expand failed: {e}")))?;

    let mut root_key = Zeroizing::new([0u8; 32]);
    let mut chain_key = Zeroizing::new([0u8; 32]);
    root_key.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);

    let mut associated_data = Vec::with_capacity(64);
    associated_data.extend_from_slice(initiator.as_bytes());
    associated_data.extend_from_slice(responder.as_bytes());

    Ok(SharedSecret {
        root_key,
        chain_key,
        associated_data,
    })
}
