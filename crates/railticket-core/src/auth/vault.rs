//! At-rest protection for the remembered password.
//!
//! Each seal draws a fresh salt and nonce, derives a 256-bit key from the
//! device secret with Argon2id, and encrypts with ChaCha20-Poly1305. Only
//! the `SealedSecret` ever reaches disk.

use anyhow::{anyhow, Context, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// An encrypted password as persisted in the session record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

impl std::fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealedSecret(..)")
    }
}

pub struct PasswordVault {
    secret: Vec<u8>,
    params: Params,
}

impl PasswordVault {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            params: Params::default(),
        }
    }

    /// Vault with explicit Argon2 cost parameters.
    pub fn with_params(secret: Vec<u8>, params: Params) -> Self {
        Self { secret, params }
    }

    fn derive_key(&self, salt: &[u8]) -> Result<[u8; KEY_LEN]> {
        let params = Params::new(
            self.params.m_cost(),
            self.params.t_cost(),
            self.params.p_cost(),
            Some(KEY_LEN),
        )
        .map_err(|e| anyhow!("Invalid key derivation parameters: {}", e))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; KEY_LEN];
        argon2
            .hash_password_into(&self.secret, salt, &mut key)
            .map_err(|e| anyhow!("Key derivation failed: {}", e))?;
        Ok(key)
    }

    pub fn seal(&self, password: &str) -> Result<SealedSecret> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let key = self.derive_key(&salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), password.as_bytes())
            .map_err(|_| anyhow!("Failed to encrypt password"))?;

        Ok(SealedSecret {
            salt: STANDARD.encode(salt),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    pub fn open(&self, sealed: &SealedSecret) -> Result<String> {
        let salt = STANDARD.decode(&sealed.salt).context("Corrupt salt")?;
        let nonce = STANDARD.decode(&sealed.nonce).context("Corrupt nonce")?;
        let ciphertext = STANDARD.decode(&sealed.ciphertext).context("Corrupt ciphertext")?;
        if nonce.len() != NONCE_LEN {
            return Err(anyhow!("Corrupt nonce"));
        }

        let key = self.derive_key(&salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| anyhow!("Stored password could not be decrypted"))?;

        String::from_utf8(plaintext).context("Stored password is not valid UTF-8")
    }
}

#[cfg(test)]
pub(crate) fn test_vault(secret: &[u8]) -> PasswordVault {
    // Minimal Argon2 cost keeps the tests fast
    let params = Params::new(8, 1, 1, None).expect("valid test params");
    PasswordVault::with_params(secret.to_vec(), params)
}
