//! Authenticated symmetric encryption for credentials at rest.

use aes_gcm::aead::{Aead, KeyInit, OsRng as AesOsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{Error, Result};

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// A 32-byte symmetric key. Zeroized on drop so a key never lingers in
/// memory longer than its owner.
#[derive(Clone)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        SymmetricKey(bytes)
    }

    pub fn try_from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LEN {
            return Err(Error::InvalidKey(format!(
                "expected a {}-byte key, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut buf = [0u8; KEY_LEN];
        buf.copy_from_slice(bytes);
        Ok(SymmetricKey(buf))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Generates a fresh 32-byte key from a CSPRNG.
pub fn generate_key() -> SymmetricKey {
    let mut bytes = [0u8; KEY_LEN];
    AesOsRng.fill_bytes(&mut bytes);
    SymmetricKey(bytes)
}

/// Derives a 32-byte key from a passphrase and salt using Argon2id.
/// `iterations` maps onto Argon2's time cost; the memory and
/// parallelism costs are fixed at the crate's chosen defaults so the
/// derivation is reproducible given the same passphrase, salt and
/// iteration count.
pub fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> Result<SymmetricKey> {
    let params = argon2::Params::new(19 * 1024, iterations.max(1), 1, Some(KEY_LEN))
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let mut out = [0u8; KEY_LEN];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut out)
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
    Ok(SymmetricKey(out))
}

/// Generates a fresh random salt suitable for `derive_key`.
pub fn generate_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    AesOsRng.fill_bytes(&mut salt);
    salt
}

/// Encrypts `plaintext` with `key`, producing `nonce || ciphertext`.
/// An empty plaintext encrypts to an empty ciphertext (no nonce is
/// spent on nothing to encrypt).
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.is_empty() {
        return Ok(Vec::new());
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    AesOsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| Error::Decryption(e.to_string()))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a `nonce || ciphertext` blob produced by [`encrypt`].
pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data.len() < NONCE_LEN {
        return Err(Error::Decryption(
            "ciphertext shorter than nonce length".into(),
        ));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::Decryption("authentication tag mismatch".into()))
}

/// Overwrites a short-lived plaintext buffer with zeros.
pub fn clear(buf: &mut [u8]) {
    buf.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let key = generate_key();
        let plaintext = b"hunter2";
        let ciphertext = encrypt(&key, plaintext).unwrap();
        let recovered = decrypt(&key, &ciphertext).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn two_encryptions_differ() {
        let key = generate_key();
        let a = encrypt(&key, b"same plaintext").unwrap();
        let b = encrypt(&key, b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let key = generate_key();
        let ciphertext = encrypt(&key, b"").unwrap();
        assert!(ciphertext.is_empty());
        assert!(decrypt(&key, &ciphertext).unwrap().is_empty());
    }

    #[test]
    fn short_ciphertext_is_invalid() {
        let key = generate_key();
        let err = decrypt(&key, &[1, 2, 3]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Decryption);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let key = generate_key();
        let mut ciphertext = encrypt(&key, b"hunter2").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(decrypt(&key, &ciphertext).is_err());
    }

    #[test]
    fn derive_key_is_deterministic_for_same_salt() {
        let salt = generate_salt();
        let a = derive_key("correct horse battery staple", &salt, 2).unwrap();
        let b = derive_key("correct horse battery staple", &salt, 2).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }
}
