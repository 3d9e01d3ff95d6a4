use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::vault::SealedSecret;

/// Well-known key of the persisted session record.
pub const AUTH_STORAGE_KEY: &str = "ticket-downloader-auth";

/// Current time in seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// How close a token is to its expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum Freshness {
    Fresh,
    /// Below the renewal threshold but not yet expired.
    Stale,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "freshness", rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum AuthState {
    Unauthenticated,
    Authenticated(Freshness),
}

/// A live, authenticated session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionData {
    pub username: String,
    pub token: String,
    /// Seconds since the Unix epoch.
    pub token_expires_at: i64,
    pub remember_credential: bool,
    /// Only ever `Some` when `remember_credential` is set.
    pub password: Option<SealedSecret>,
}

impl SessionData {
    pub fn time_until_expiry(&self, now: i64) -> i64 {
        self.token_expires_at - now
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.time_until_expiry(now) <= 0
    }

    pub fn freshness(&self, now: i64, renewal_threshold: Duration) -> Freshness {
        let remaining = self.time_until_expiry(now);
        if remaining <= 0 {
            Freshness::Expired
        } else if remaining < renewal_threshold.as_secs() as i64 {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    /// Whether a silent re-authentication is possible.
    pub fn can_renew(&self) -> bool {
        self.remember_credential && self.password.is_some()
    }
}

/// The session record as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub is_authenticated: bool,
    pub username: Option<String>,
    pub token: Option<String>,
    pub token_expires_at: Option<i64>,
    #[serde(default)]
    pub remember_credential: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<SealedSecret>,
}

impl From<&SessionData> for PersistedSession {
    fn from(data: &SessionData) -> Self {
        Self {
            is_authenticated: true,
            username: Some(data.username.clone()),
            token: Some(data.token.clone()),
            token_expires_at: Some(data.token_expires_at),
            remember_credential: data.remember_credential,
            password: if data.remember_credential {
                data.password.clone()
            } else {
                None
            },
        }
    }
}

impl PersistedSession {
    /// Validate the record, returning `None` when it cannot describe a session.
    pub fn into_session(self) -> Option<SessionData> {
        if !self.is_authenticated {
            return None;
        }
        let (Some(username), Some(token), Some(token_expires_at)) =
            (self.username, self.token, self.token_expires_at)
        else {
            warn!("Persisted session is missing its username, token or expiry");
            return None;
        };
        if username.is_empty() || token.is_empty() {
            return None;
        }

        let password = if self.remember_credential {
            self.password
        } else {
            if self.password.is_some() {
                warn!("Dropping stored password without remember flag");
            }
            None
        };

        Some(SessionData {
            username,
            token,
            token_expires_at,
            remember_credential: self.remember_credential,
            password,
        })
    }
}

/// Single-record persistence for the session, fully overwritten on every
/// mutation and removed on logout.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(format!("{}.json", AUTH_STORAGE_KEY)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<PersistedSession>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)
            .context("Failed to read session file")?;
        let record = serde_json::from_str(&contents).context("Failed to parse session file")?;
        Ok(Some(record))
    }

    pub fn save(&self, record: &PersistedSession) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(record)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents).context("Failed to write session file")?;
        restrict_permissions(&tmp)?;
        std::fs::rename(&tmp, &self.path).context("Failed to replace session file")?;
        debug!(path = %self.path.display(), "Session saved");
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Session removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove session file"),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .context("Failed to restrict session file permissions")
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(expires_in: i64) -> SessionData {
        SessionData {
            username: "alice".into(),
            token: "tok".into(),
            token_expires_at: now_secs() + expires_in,
            remember_credential: false,
            password: None,
        }
    }

    #[test]
    fn test_freshness_boundaries() {
        let threshold = Duration::from_secs(300);
        let now = 1_700_000_000;
        let data = SessionData {
            token_expires_at: now,
            ..session(0)
        };
        assert_eq!(data.freshness(now, threshold), Freshness::Expired);
        assert_eq!(data.freshness(now - 1, threshold), Freshness::Stale);
        assert_eq!(data.freshness(now - 299, threshold), Freshness::Stale);
        assert_eq!(data.freshness(now - 300, threshold), Freshness::Fresh);
        assert_eq!(data.freshness(now + 1, threshold), Freshness::Expired);
        assert!(data.is_expired(now));
    }

    #[test]
    fn test_persisted_round_trip_keeps_fields() {
        let data = session(3600);
        let record = PersistedSession::from(&data);
        assert!(record.is_authenticated);
        assert_eq!(record.into_session(), Some(data));
    }

    #[test]
    fn test_password_requires_remember_flag() {
        let sealed = SealedSecret {
            salt: "s".into(),
            nonce: "n".into(),
            ciphertext: "c".into(),
        };
        let mut data = session(3600);
        data.password = Some(sealed.clone());
        // Not remembered: never written
        assert!(PersistedSession::from(&data).password.is_none());

        let record = PersistedSession {
            password: Some(sealed),
            ..PersistedSession::from(&session(3600))
        };
        let restored = record.into_session().expect("valid record");
        assert!(restored.password.is_none());
    }

    #[test]
    fn test_invalid_records_are_rejected() {
        let half = PersistedSession {
            token_expires_at: None,
            ..PersistedSession::from(&session(3600))
        };
        assert!(half.into_session().is_none());

        let logged_out = PersistedSession::default();
        assert!(logged_out.into_session().is_none());
    }

    #[test]
    fn test_store_save_load_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(&dir.path().join("data"));
        assert!(store.load().expect("load").is_none());

        let record = PersistedSession::from(&session(3600));
        store.save(&record).expect("save");
        assert!(store.path().ends_with("ticket-downloader-auth.json"));
        assert_eq!(store.load().expect("load"), Some(record));

        let raw = std::fs::read_to_string(store.path()).expect("read");
        assert!(raw.contains("\"isAuthenticated\": true"));
        assert!(raw.contains("\"tokenExpiresAt\""));

        store.clear().expect("clear");
        assert!(store.load().expect("load").is_none());
        // Clearing twice is fine
        store.clear().expect("clear again");
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        std::fs::write(store.path(), "{not json").expect("write");
        assert!(store.load().is_err());
    }
}
