//! Async wrappers that move CPU-bound work off the caller's executor.
//!
//! Argon2 unlock and prekey batch generation are slow. Call them through
//! these helpers from async code.

use std::sync::Arc;

use crate::error::CryptoError;
use crate::lock::DeviceLock;
use crate::signal::SessionManager;

async fn run_blocking<T, F>(context: &'static str, f: F) -> Result<T, CryptoError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CryptoError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        tracing::error!(context, error = %e, "background task failed");
        CryptoError::KeyGeneration(format!("{context}: {e}"))
    })?
}

/// [`DeviceLock::unlock`] on the blocking pool.
pub async fn unlock_in_background(lock: Arc<DeviceLock>, pin: String) -> Result<(), CryptoError> {
    run_blocking("unlock", move || {
        let pin = zeroize::Zeroizing::new(pin);
        lock.unlock(&pin)
    })
    .await
}

/// [`SessionManager::replenish_prekeys`] on the blocking pool.
pub async fn replenish_prekeys_in_background(
    manager: Arc<SessionManager>,
) -> Result<usize, CryptoError> {
    run_blocking("replenish prekeys", move || manager.replenish_prekeys()).await
}
