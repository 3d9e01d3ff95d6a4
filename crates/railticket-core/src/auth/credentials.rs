use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use keyring::Entry;
use rand::RngCore;
use tracing::{debug, info};

use crate::config::APP_NAME;

/// Keyring account under which the vault's device secret lives.
const DEVICE_SECRET_ACCOUNT: &str = "device-secret";

/// Environment override for hosts without a usable keyring.
pub const ENV_VAULT_KEY: &str = "RAILTICKET_VAULT_KEY";

const DEVICE_SECRET_LEN: usize = 32;

pub struct CredentialStore;

impl CredentialStore {
    /// Secret that keys the password vault.
    ///
    /// `RAILTICKET_VAULT_KEY` wins when set; otherwise the secret is read
    /// from the OS keychain, generating and storing a fresh one on first use.
    pub fn device_secret() -> Result<Vec<u8>> {
        if let Ok(key) = std::env::var(ENV_VAULT_KEY) {
            if !key.trim().is_empty() {
                debug!("Using vault key from environment");
                return Ok(key.trim().as_bytes().to_vec());
            }
        }

        let entry = Entry::new(APP_NAME, DEVICE_SECRET_ACCOUNT)
            .context("Failed to create keyring entry")?;

        match entry.get_password() {
            Ok(encoded) => STANDARD
                .decode(encoded.trim())
                .context("Device secret in keychain is corrupt"),
            Err(keyring::Error::NoEntry) => {
                let mut secret = vec![0u8; DEVICE_SECRET_LEN];
                rand::rngs::OsRng.fill_bytes(&mut secret);
                entry
                    .set_password(&STANDARD.encode(&secret))
                    .context("Failed to store device secret in keychain")?;
                info!("Generated new device secret");
                Ok(secret)
            }
            Err(e) => Err(e).context("Failed to retrieve device secret from keychain"),
        }
    }

    /// Forget the device secret; previously sealed passwords become unreadable.
    pub fn delete_device_secret() -> Result<()> {
        let entry = Entry::new(APP_NAME, DEVICE_SECRET_ACCOUNT)
            .context("Failed to create keyring entry")?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete device secret from keychain"),
        }
    }
}
