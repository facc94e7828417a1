//! Files sealed with XChaCha20-Poly1305 under a key derived from the
//! configuration secret.
//!
//! Layout: 24-byte nonce followed by the AEAD ciphertext of the JSON body.
//! Writes go to a sibling temp file that is renamed over the target, so a
//! failed write leaves the previous file intact.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const NONCE_LEN: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("key derivation failed")]
    Kdf,

    #[error("encryption failed")]
    Encrypt,

    /// Wrong configuration secret or a damaged file.
    #[error("file cannot be opened with the configured secret")]
    Decrypt,

    #[error("file is truncated")]
    Truncated,
}

pub struct SealedFile {
    path: PathBuf,
    aead: XChaCha20Poly1305,
}

impl SealedFile {
    /// Bind `path` to a key derived from `secret`. `info` separates the keys
    /// of files that share a secret.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Kdf`] if the key cannot be derived.
    pub fn new(path: impl Into<PathBuf>, secret: &SecretString, info: &[u8]) -> Result<Self, SealError> {
        let hk = Hkdf::<Sha256>::new(None, secret.expose_secret().as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(info, &mut okm).map_err(|_| SealError::Kdf)?;

        Ok(Self {
            path: path.into(),
            aead: XChaCha20Poly1305::new(Key::from_slice(&okm)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and open the file. `Ok(None)` when it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, opened or parsed.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, SealError> {
        let sealed = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if sealed.len() < NONCE_LEN {
            return Err(SealError::Truncated);
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plain = self
            .aead
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Decrypt)?;

        Ok(Some(serde_json::from_slice(&plain)?))
    }

    /// Seal `value` and atomically replace the file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, encryption or any file operation
    /// fails; the previous file is left untouched in that case.
    pub fn store<T: Serialize>(&self, value: &T) -> Result<(), SealError> {
        let plain = serde_json::to_vec(value)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .aead
            .encrypt(XNonce::from_slice(&nonce), plain.as_slice())
            .map_err(|_| SealError::Encrypt)?;

        let tmp = self.tmp_path();
        let written = write_private(&tmp, &nonce, &ciphertext).and_then(|()| fs::rename(&tmp, &self.path));

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn write_private(path: &Path, nonce: &[u8], ciphertext: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(nonce)?;
    file.write_all(ciphertext)?;
    file.sync_all()
}
