//! Recovery codes that re-derive the master key.
//!
//! A code is the 32-byte master key followed by a 4-byte SHA-256 checksum,
//! hex-encoded in dash-separated groups of four characters. It is exactly as
//! sensitive as the master key itself.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::master_key::{MasterKey, MASTER_KEY_LEN};

const CHECKSUM_LEN: usize = 4;
const GROUP_LEN: usize = 4;
const CHECKSUM_DOMAIN: &[u8] = b"cinder-recovery-v1";

/// A human-presentable recovery code.
///
/// No `Display`, and `Debug` is redacted. Use [`RecoveryCode::expose`] to show
/// it to the user.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryCode(String);

impl RecoveryCode {
    /// The code text, for the single time it is shown to the user.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for RecoveryCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecoveryCode(<redacted>)")
    }
}

pub struct BackupCodec;

impl BackupCodec {
    pub fn create_recovery_artifact(master_key: &MasterKey) -> RecoveryCode {
        let mut payload = Zeroizing::new(Vec::with_capacity(MASTER_KEY_LEN + CHECKSUM_LEN));
        payload.extend_from_slice(master_key.as_bytes());
        payload.extend_from_slice(&checksum(master_key.as_bytes()));

        let encoded = Zeroizing::new(hex::encode(payload.as_slice()));
        let mut code = String::with_capacity(encoded.len() + encoded.len() / GROUP_LEN);
        for (i, c) in encoded.chars().enumerate() {
            if i > 0 && i % GROUP_LEN == 0 {
                code.push('-');
            }
            code.push(c);
        }
        RecoveryCode(code)
    }

    /// Parse a code typed back by the user. Case, whitespace and dashes are
    /// ignored.
    pub fn restore_from_artifact(code: &str) -> Result<MasterKey, CryptoError> {
        let normalized: Zeroizing<String> = Zeroizing::new(
            code.chars()
                .filter(|c| !c.is_whitespace() && *c != '-')
                .map(|c| c.to_ascii_lowercase())
                .collect(),
        );
        let decoded = Zeroizing::new(
            hex::decode(normalized.as_bytes()).map_err(|_| CryptoError::InvalidRecoveryCode)?,
        );
        if decoded.len() != MASTER_KEY_LEN + CHECKSUM_LEN {
            return Err(CryptoError::InvalidRecoveryCode);
        }

        let (key, sum) = decoded.split_at(MASTER_KEY_LEN);
        if !bool::from(checksum(key)[..].ct_eq(sum)) {
            return Err(CryptoError::InvalidRecoveryCode);
        }

        let mut bytes = [0u8; MASTER_KEY_LEN];
        bytes.copy_from_slice(key);
        Ok(MasterKey::from_bytes(bytes))
    }
}

fn checksum(key: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::new()
        .chain_update(CHECKSUM_DOMAIN)
        .chain_update(key)
        .finalize();
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_yields_same_key() {
        let key = MasterKey::generate();
        let code = BackupCodec::create_recovery_artifact(&key);
        let restored = BackupCodec::restore_from_artifact(code.expose()).unwrap();
        assert_eq!(restored.check_value(), key.check_value());
    }

    #[test]
    fn code_is_grouped() {
        let code = BackupCodec::create_recovery_artifact(&MasterKey::from_bytes([0xab; 32]));
        let groups: Vec<&str> = code.expose().split('-').collect();
        assert_eq!(groups.len(), (MASTER_KEY_LEN + CHECKSUM_LEN) * 2 / GROUP_LEN);
        assert!(groups.iter().all(|g| g.len() == GROUP_LEN));
    }

    #[test]
    fn tolerant_of_formatting() {
        let key = MasterKey::generate();
        let code = BackupCodec::create_recovery_artifact(&key);
        let sloppy = code.expose().replace('-', " ").to_uppercase();
        let restored = BackupCodec::restore_from_artifact(&sloppy).unwrap();
        assert_eq!(restored.check_value(), key.check_value());
    }

    #[test]
    fn single_typo_is_rejected() {
        let code = BackupCodec::create_recovery_artifact(&MasterKey::generate());
        let mut chars: Vec<char> = code.expose().chars().collect();
        chars[0] = if chars[0] == '0' { '1' } else { '0' };
        let typo: String = chars.into_iter().collect();

        assert!(matches!(
            BackupCodec::restore_from_artifact(&typo),
            Err(CryptoError::InvalidRecoveryCode)
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        let too_long = "00".repeat(40);
        for input in ["", "not hex", "abcd-ef", too_long.as_str()] {
            assert!(matches!(
                BackupCodec::restore_from_artifact(input),
                Err(CryptoError::InvalidRecoveryCode)
            ));
        }
    }

    #[test]
    fn debug_is_redacted() {
        let code = BackupCodec::create_recovery_artifact(&MasterKey::generate());
        assert_eq!(format!("{code:?}"), "RecoveryCode(<redacted>)");
    }
}
