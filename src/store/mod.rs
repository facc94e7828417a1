//! Encrypted, file-backed state: the profile registry and the API keystore.

use crate::collectors::ValidationError;
use crate::collectors::crypto::CipherError;
use std::path::PathBuf;

pub mod handle;
pub mod keystore;
pub mod profiles;
pub mod sealed;

pub use handle::StoreHandle;
pub use keystore::KeyStore;
pub use profiles::ProfileStore;
pub use sealed::{SealError, SealedFile};

pub const PROFILES_FILE: &str = ".pg-stat-profiler.prof";
pub const KEYSTORE_FILE: &str = ".pg-stat-profiler.keystr";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("profile {0} not found")]
    NotFound(String),

    #[error("profile {0} already exists")]
    AlreadyExists(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("query encryption is not enabled for profile {0}")]
    EncryptionDisabled(String),

    /// Distinct from [`StoreError::NotFound`]: the profile exists but its
    /// secret does not open the ciphertext.
    #[error(transparent)]
    Decrypt(#[from] CipherError),

    #[error("failed to load {}: {source}", path.display())]
    Load { path: PathBuf, source: SealError },

    /// Nothing changed, neither on disk nor in memory.
    #[error("failed to persist {}: {source}", path.display())]
    Persist { path: PathBuf, source: SealError },

    #[error("profile store is not running")]
    Unavailable,
}
