//! API keys: a fixed rotation set kept in a sealed file.

use crate::store::{SealedFile, StoreError};
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::SecretString;
use std::path::PathBuf;
use tracing::info;

pub const API_KEY_COUNT: usize = 5;

const KEY_INFO: &[u8] = b"pg-stat-profiler-keystore-v1";

pub struct KeyStore {
    file: SealedFile,
    keys: Vec<String>,
}

impl KeyStore {
    /// Open the keystore at `path`, generating and persisting a fresh key
    /// set when the file is absent or holds the wrong number of keys.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Load`] or [`StoreError::Persist`].
    pub fn open(path: impl Into<PathBuf>, secret: &SecretString) -> Result<Self, StoreError> {
        let path = path.into();
        let load_err = |source| StoreError::Load {
            path: path.clone(),
            source,
        };

        let file = SealedFile::new(&path, secret, KEY_INFO).map_err(load_err)?;
        let keys: Option<Vec<String>> = file.load().map_err(load_err)?;

        let mut store = Self {
            file,
            keys: keys.unwrap_or_default(),
        };

        if store.keys.len() != API_KEY_COUNT {
            store.reset_keys()?;
        }

        Ok(store)
    }

    pub fn check_key(&self, key: &str) -> bool {
        let key = key.trim().to_ascii_lowercase();
        !key.is_empty() && self.keys.iter().any(|k| *k == key)
    }

    /// Key `i` of the rotation set, `0 <= i < API_KEY_COUNT`.
    pub fn api_key(&self, i: usize) -> Option<&str> {
        self.keys.get(i).map(String::as_str)
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Replace every key. Old keys stop working immediately.
    ///
    /// # Errors
    ///
    /// [`StoreError::Persist`]; the previous keys stay valid in that case.
    pub fn reset_keys(&mut self) -> Result<&[String], StoreError> {
        let keys: Vec<String> = (0..API_KEY_COUNT).map(|_| generate_key()).collect();

        self.file
            .store(&keys)
            .map_err(|source| StoreError::Persist {
                path: self.file.path().to_path_buf(),
                source,
            })?;

        self.keys = keys;
        info!(keys = API_KEY_COUNT, "api keys regenerated");

        Ok(&self.keys)
    }
}

fn generate_key() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    format!("{:032x}", u128::from_be_bytes(bytes))
}
