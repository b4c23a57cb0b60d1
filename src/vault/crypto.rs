//! Secret sealing with AES-256-GCM under an Argon2id-derived store key.
//!
//! The store key is derived once when the vault opens, from the master
//! passphrase and a per-database salt. Each sealed value carries its own
//! random nonce: nonce (12) || ciphertext+tag.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::Argon2;
use rand::RngCore;
use zeroize::Zeroizing;

use super::{Secret, StoreError};

pub const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub struct SecretSealer {
    cipher: Aes256Gcm,
}

impl SecretSealer {
    /// Derive the store key from a passphrase and salt.
    pub fn derive(passphrase: &[u8], salt: &[u8]) -> Result<Self, StoreError> {
        let mut key = Zeroizing::new([0u8; 32]);
        Argon2::default()
            .hash_password_into(passphrase, salt, &mut key[..])
            .map_err(|e| StoreError::Crypto(format!("key derivation failed: {}", e)))?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|_| StoreError::Crypto("derived key has wrong length".into()))?;
        Ok(Self { cipher })
    }

    pub fn generate_salt() -> [u8; SALT_LEN] {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| StoreError::Crypto("encryption failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(StoreError::Crypto("sealed value too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| StoreError::Crypto("decryption failed (wrong master key or corrupted data)".into()))
    }

    pub fn open_secret(&self, sealed: &[u8]) -> Result<Secret, StoreError> {
        let plaintext = self.open(sealed)?;
        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| StoreError::Corrupt("secret is not valid UTF-8".into()))?;
        Ok(Secret::new(text))
    }
}
