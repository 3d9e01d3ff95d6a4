//! Authentication module for the ticketing session.
//!
//! This module provides:
//! - `SessionManager`: login, logout, and silent renewal before expiry
//! - `SessionStore`: the single persisted session record
//! - `PasswordVault`: encryption of the remembered password at rest
//! - `CredentialStore`: the device secret in the OS keyring
//!
//! A session with "remember me" set re-authenticates itself shortly before
//! its token expires; any failure ends the session.

pub mod credentials;
pub mod manager;
pub mod session;
pub mod vault;

pub use credentials::CredentialStore;
pub use manager::{LoginResult, RenewalOutcome, SessionEvent, SessionManager, SessionSnapshot};
pub use session::{AuthState, Freshness, PersistedSession, SessionData, SessionStore};
pub use vault::{PasswordVault, SealedSecret};
