pub mod background;
pub mod backup;
pub mod cipher;
pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod keychain;
pub mod keystore;
pub mod lock;
pub mod master_key;
pub mod safety;
pub mod signal;

pub use backup::{BackupCodec, RecoveryCode};
pub use cipher::{MessageCipher, MessageKey};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{KdfParams, LockPolicy, ProtocolConfig};
pub use error::{CryptoError, ErrorKind};
pub use identity::{IdentityKeyPair, IdentityPublicKey};
pub use keychain::{Keychain, MemoryKeychain};
pub use keystore::KeyStore;
pub use lock::DeviceLock;
pub use master_key::MasterKey;
pub use safety::{SafetyNumber, SafetyVerifier, TrustEvent, TrustStatus, TrustStore};
pub use signal::{DeviceId, Envelope, IdentityManager, PreKeyBundle, SessionId, SessionManager};
