//! Encryption of captured query text.
//!
//! The profile secret is base64 encoded raw key material. It is decoded,
//! right-padded with spaces or truncated to 32 bytes and used as an
//! XChaCha20-Poly1305 key. Each ciphertext is stored as URL-safe base64 of
//! `nonce || sealed bytes`, so the same plaintext never encrypts twice to the
//! same value.

use base64::{
    Engine,
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD},
};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("query encryption secret is not valid base64")]
    InvalidSecret,
    #[error("query encryption secret is empty")]
    EmptySecret,
    #[error("ciphertext is malformed")]
    Malformed,
    #[error("failed to encrypt query text")]
    Encrypt,
    #[error("failed to decrypt query text: wrong secret or corrupted data")]
    Decrypt,
}

#[derive(Clone)]
pub struct QueryCipher {
    aead: XChaCha20Poly1305,
}

impl QueryCipher {
    /// Derive the cipher from a profile secret.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidSecret`] when the secret is not base64 in
    /// any of the common alphabets, or [`CipherError::EmptySecret`] when it
    /// decodes to nothing.
    pub fn from_secret(secret: &SecretString) -> Result<Self, CipherError> {
        let raw = decode_secret(secret.expose_secret().trim())?;

        if raw.is_empty() {
            return Err(CipherError::EmptySecret);
        }

        let mut key = [b' '; KEY_LEN];
        for (dst, src) in key.iter_mut().zip(raw.iter()) {
            *dst = *src;
        }

        Ok(Self {
            aead: XChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    /// # Errors
    ///
    /// Returns [`CipherError::Encrypt`] if the AEAD rejects the input.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = self
            .aead
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);

        Ok(URL_SAFE.encode(out))
    }

    /// # Errors
    ///
    /// Returns [`CipherError::Malformed`] for input that is not a ciphertext
    /// produced by [`QueryCipher::encrypt`], and [`CipherError::Decrypt`] when
    /// authentication fails (typically a different secret).
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        let bytes = URL_SAFE
            .decode(ciphertext.trim())
            .or_else(|_| URL_SAFE_NO_PAD.decode(ciphertext.trim()))
            .map_err(|_| CipherError::Malformed)?;

        if bytes.len() <= NONCE_LEN {
            return Err(CipherError::Malformed);
        }

        let (nonce, sealed) = bytes.split_at(NONCE_LEN);

        let plain = self
            .aead
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::Decrypt)?;

        String::from_utf8(plain).map_err(|_| CipherError::Malformed)
    }
}

fn decode_secret(secret: &str) -> Result<Vec<u8>, CipherError> {
    [URL_SAFE, URL_SAFE_NO_PAD, STANDARD, STANDARD_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(secret).ok())
        .ok_or(CipherError::InvalidSecret)
}
