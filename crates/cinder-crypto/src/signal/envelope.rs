//! Wire envelopes handed to the transport.
//!
//! Layout: `version (1) || tag (1) || body`. Unknown versions and tags fail
//! closed; nothing is parsed past the first inconsistency.
//!
//! ```text
//! Ratchet body: header (40) || ciphertext length (u32 BE) || ciphertext
//! PreKey body:  identity key (32) || base key (32) || signed prekey id (u32 BE)
//!               || has one-time prekey (1) || [one-time prekey id (u32 BE)]
//!               || ratchet body
//! ```

use crate::error::CryptoError;
use crate::identity::IdentityPublicKey;
use crate::signal::ratchet::{Header, HEADER_LEN};
use crate::signal::x3dh::Handshake;

pub const ENVELOPE_VERSION: u8 = 1;

const TAG_PREKEY: u8 = 0x01;
const TAG_RATCHET: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    pub header: Header,
    pub ciphertext: Vec<u8>,
}

/// First messages from an initiator carry the handshake until the
/// responder has replied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyMessage {
    pub handshake: Handshake,
    pub message: RatchetMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    PreKey(PreKeyMessage),
    Ratchet(RatchetMessage),
}

impl Envelope {
    pub fn message(&self) -> &RatchetMessage {
        match self {
            Self::PreKey(prekey) => &prekey.message,
            Self::Ratchet(message) => message,
        }
    }

    pub fn is_prekey(&self) -> bool {
        matches!(self, Self::PreKey(_))
    }

    /// Serialize for the transport. Fails only for a ciphertext whose
    /// length does not fit the u32 length field.
    pub fn encode(&self) -> Result<Vec<u8>, CryptoError> {
        let message = self.message();
        let mut out = Vec::with_capacity(2 + 73 + HEADER_LEN + 4 + message.ciphertext.len());
        out.push(ENVELOPE_VERSION);
        match self {
            Self::PreKey(prekey) => {
                let handshake = &prekey.handshake;
                out.push(TAG_PREKEY);
                out.extend_from_slice(handshake.identity_key.as_bytes());
                out.extend_from_slice(&handshake.base_key);
                out.extend_from_slice(&handshake.signed_prekey_id.to_be_bytes());
                match handshake.one_time_prekey_id {
                    Some(id) => {
                        out.push(1);
                        out.extend_from_slice(&id.to_be_bytes());
                    }
                    None => out.push(0),
                }
            }
            Self::Ratchet(_) => out.push(TAG_RATCHET),
        }
        out.extend_from_slice(&message.header.to_bytes());
        out.extend_from_slice(&length_prefix(message.ciphertext.len())?);
        out.extend_from_slice(&message.ciphertext);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        let mut reader = Reader { buf: bytes };
        let version = reader.u8("version")?;
        if version != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }

        let envelope = match reader.u8("tag")? {
            TAG_PREKEY => {
                let identity_key = IdentityPublicKey(reader.array32("identity key")?);
                let base_key = reader.array32("base key")?;
                let signed_prekey_id = reader.u32("signed prekey id")?;
                let one_time_prekey_id = match reader.u8("one-time prekey flag")? {
                    0 => None,
                    1 => Some(reader.u32("one-time prekey id")?),
                    _ => return Err(CryptoError::MalformedEnvelope("invalid one-time prekey flag")),
                };
                Self::PreKey(PreKeyMessage {
                    handshake: Handshake {
                        identity_key,
                        base_key,
                        signed_prekey_id,
                        one_time_prekey_id,
                    },
                    message: reader.ratchet_message()?,
                })
            }
            TAG_RATCHET => Self::Ratchet(reader.ratchet_message()?),
            _ => return Err(CryptoError::MalformedEnvelope("unknown tag")),
        };

        if !reader.buf.is_empty() {
            return Err(CryptoError::MalformedEnvelope("trailing bytes"));
        }
        Ok(envelope)
    }
}

fn length_prefix(len: usize) -> Result<[u8; 4], CryptoError> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| CryptoError::MalformedEnvelope("ciphertext too large"))
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], CryptoError> {
        if self.buf.len() < len {
            return Err(CryptoError::MalformedEnvelope(what));
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, CryptoError> {
        Ok(self.take(1, what)?[0])
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, CryptoError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4, what)?);
        Ok(u32::from_be_bytes(bytes))
    }

    fn array32(&mut self, what: &'static str) -> Result<[u8; 32], CryptoError> {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(self.take(32, what)?);
        Ok(bytes)
    }

    fn ratchet_message(&mut self) -> Result<RatchetMessage, CryptoError> {
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(self.take(HEADER_LEN, "header")?);
        let len = self.u32("ciphertext length")? as usize;
        let ciphertext = self.take(len, "ciphertext")?.to_vec();
        Ok(RatchetMessage {
            header: Header::from_bytes(&header),
            ciphertext,
        })
    }
}
