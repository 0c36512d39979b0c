use thiserror::Error;

/// Every failure the session core can report.
///
/// Every AEAD failure surfaces as [`CryptoError::AuthenticationFailed`],
/// whatever the cause.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("identity already initialized")]
    AlreadyInitialized,

    #[error("identity not initialized")]
    NotInitialized,

    #[error("signed prekey signature does not verify")]
    InvalidSignature,

    #[error("prekey bundle is stale")]
    StalePreKey,

    #[error("one-time prekey {0} was already consumed")]
    PreKeyAlreadyConsumed(u32),

    #[error("one-time prekey {0} is unknown")]
    UnknownPreKey(u32),

    #[error("message was already received")]
    ReplayDetected,

    #[error("message key no longer available")]
    MessageKeyExpired,

    #[error("too many skipped messages in one chain ({requested} > {limit})")]
    TooManySkippedMessages { requested: u32, limit: u32 },

    #[error("message counter exhausted; start a new session")]
    ChainExhausted,

    #[error("decryption failed")]
    AuthenticationFailed,

    #[error("safety number does not match")]
    SafetyNumberMismatch,

    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),

    #[error("no session with {0}")]
    NoSession(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("wrong PIN ({remaining:?} attempts remaining)")]
    WrongPin { remaining: Option<u32> },

    #[error("too many failed unlock attempts: key store wiped")]
    WipeTriggered,

    #[error("key store is locked")]
    Locked,

    #[error("device lock is not provisioned")]
    NotProvisioned,

    #[error("invalid recovery code")]
    InvalidRecoveryCode,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("key storage error: {0}")]
    StorageError(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Coarse classification used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Cryptographic protocol violation. Never retried.
    Protocol,
    /// Expected steady-state condition; re-establish the session or tell the
    /// user the message is permanently lost.
    Resource,
    /// Device lock refused access; re-authenticate or re-provision.
    Lock,
    /// Identity lifecycle misuse.
    Lifecycle,
    /// Storage, serialization or key-material plumbing.
    Internal,
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSignature
            | Self::StalePreKey
            | Self::ReplayDetected
            | Self::MessageKeyExpired
            | Self::AuthenticationFailed
            | Self::SafetyNumberMismatch
            | Self::UnsupportedVersion(_)
            | Self::MalformedEnvelope(_) => ErrorKind::Protocol,
            Self::PreKeyAlreadyConsumed(_)
            | Self::UnknownPreKey(_)
            | Self::TooManySkippedMessages { .. }
            | Self::ChainExhausted
            | Self::NoSession(_)
            | Self::SessionClosed => ErrorKind::Resource,
            Self::WrongPin { .. }
            | Self::WipeTriggered
            | Self::Locked
            | Self::NotProvisioned
            | Self::InvalidRecoveryCode => ErrorKind::Lock,
            Self::AlreadyInitialized | Self::NotInitialized => ErrorKind::Lifecycle,
            Self::InvalidKey(_)
            | Self::KeyGeneration(_)
            | Self::StorageError(_)
            | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Whether the failure destroyed state that cannot be brought back.
    pub fn is_irreversible(&self) -> bool {
        matches!(self, Self::WipeTriggered)
    }
}

impl From<bincode::Error> for CryptoError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
