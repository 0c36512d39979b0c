use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use cinder_crypto::{CryptoError, Keychain};

/// A directory-backed keychain for the demo.
///
/// Every `(vault, key)` pair is one file at `root/vault/hex(key)`. The
/// core only ever hands this keychain blobs already sealed under the master
/// key, so the files need no encryption of their own. Writes go through a
/// temporary file and a rename so a crash never leaves a torn blob.
pub struct FileKeychain {
    root: PathBuf,
    /// Serializes writers; readers see either the old or the new file.
    write_guard: Mutex<()>,
}

impl FileKeychain {
    /// Open (or create) a keychain rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, CryptoError> {
        fs::create_dir_all(root).map_err(|e| storage_error("create keychain dir", &e))?;
        Ok(Self {
            root: root.to_path_buf(),
            write_guard: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn vault_dir(&self, vault: &str) -> PathBuf {
        self.root.join(hex::encode(vault))
    }

    fn key_path(&self, vault: &str, key: &str) -> PathBuf {
        self.vault_dir(vault).join(hex::encode(key))
    }
}

impl Keychain for FileKeychain {
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        let _guard = self.write_guard.lock();
        let dir = self.vault_dir(vault);
        fs::create_dir_all(&dir).map_err(|e| storage_error("create vault dir", &e))?;

        let path = self.key_path(vault, key);
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(|e| storage_error("create blob", &e))?;
        file.write_all(data)
            .and_then(|()| file.sync_all())
            .map_err(|e| storage_error("write blob", &e))?;
        fs::rename(&tmp, &path).map_err(|e| storage_error("commit blob", &e))?;
        Ok(())
    }

    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        match fs::read(self.key_path(vault, key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("read blob", &e)),
        }
    }

    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError> {
        let _guard = self.write_guard.lock();
        match fs::remove_file(self.key_path(vault, key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error("delete blob", &e)),
        }
    }

    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError> {
        Ok(self.key_path(vault, key).is_file())
    }

    fn list_keys(&self, vault: &str) -> Result<Vec<String>, CryptoError> {
        let entries = match fs::read_dir(self.vault_dir(vault)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_error("list vault", &e)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| storage_error("list vault", &e))?;
            let name = entry.file_name();
            // Leftover temp files from an interrupted write are not keys.
            let Some(decoded) = name
                .to_str()
                .and_then(|n| hex::decode(n).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok())
            else {
                continue;
            };
            keys.push(decoded);
        }
        keys.sort();
        Ok(keys)
    }

    fn wipe(&self) -> Result<(), CryptoError> {
        let _guard = self.write_guard.lock();
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(storage_error("wipe keychain", &e)),
        }
        fs::create_dir_all(&self.root).map_err(|e| storage_error("recreate keychain dir", &e))?;
        tracing::warn!(root = %self.root.display(), "keychain wiped");
        Ok(())
    }
}

fn storage_error(context: &str, e: &std::io::Error) -> CryptoError {
    CryptoError::StorageError(format!("{context}: {e}"))
}
