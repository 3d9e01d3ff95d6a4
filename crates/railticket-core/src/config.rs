//! Application configuration management.
//!
//! Two sources feed the core:
//! - `Settings`: environment-level knobs (rate budget, upstream endpoint,
//!   renewal timing), each with a sane default.
//! - `Config`: the small persisted file holding the last used username and
//!   the default for "remember me", stored at
//!   `~/.config/railticket/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "railticket";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Upstream REST root of the MÁV mobile service.
pub const DEFAULT_API_BASE_URL: &str =
    "https://vim.mav-start.hu/VIM/PR/20240320/MobileServiceS.svc/rest";

/// Client identifier the upstream expects on every request.
pub const DEFAULT_CLIENT_ID: &str = "0-0ecpn803G72T1ztcxi2BEDDr786d";

/// Language tag sent with every request.
pub const LANGUAGE: &str = "HU";

const DEFAULT_MAX_REQUESTS: usize = 3000;
const DEFAULT_WINDOW_SECS: u64 = 60 * 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RENEWAL_THRESHOLD_SECS: u64 = 5 * 60;
const DEFAULT_RENEWAL_INTERVAL_SECS: u64 = 60;

pub const ENV_MAX_REQUESTS: &str = "MAV_API_MAX_HOURLY_REQUESTS";
pub const ENV_WINDOW_SECS: &str = "RAILTICKET_RATE_WINDOW_SECS";
pub const ENV_API_BASE_URL: &str = "RAILTICKET_API_BASE_URL";
pub const ENV_CLIENT_ID: &str = "RAILTICKET_UAID";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "RAILTICKET_REQUEST_TIMEOUT_SECS";
pub const ENV_RENEWAL_THRESHOLD_SECS: &str = "RAILTICKET_RENEWAL_THRESHOLD_SECS";
pub const ENV_RENEWAL_INTERVAL_SECS: &str = "RAILTICKET_RENEWAL_INTERVAL_SECS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorConfig {
    pub max_requests: usize,
    pub window: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub client_id: String,
    pub language: String,
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            language: LANGUAGE.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// A token with less time than this left is stale and gets renewed.
    pub renewal_threshold: Duration,
    /// How often the renewal timer checks the token.
    pub check_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            renewal_threshold: Duration::from_secs(DEFAULT_RENEWAL_THRESHOLD_SECS),
            check_interval: Duration::from_secs(DEFAULT_RENEWAL_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub governor: GovernorConfig,
    pub upstream: UpstreamConfig,
    pub session: SessionSettings,
}

/// Read a positive integer knob, falling back to `default` with a warning
/// when it is present but unusable.
fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + PartialEq + Default + Copy + std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) if value != T::default() => value,
            _ => {
                warn!(key, value = %raw, fallback = %default, "Ignoring invalid setting");
                default
            }
        },
    }
}

fn text(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let governor = GovernorConfig {
            max_requests: positive(&lookup, ENV_MAX_REQUESTS, DEFAULT_MAX_REQUESTS),
            window: Duration::from_secs(positive(&lookup, ENV_WINDOW_SECS, DEFAULT_WINDOW_SECS)),
        };

        let upstream = UpstreamConfig {
            base_url: text(&lookup, ENV_API_BASE_URL, DEFAULT_API_BASE_URL),
            client_id: text(&lookup, ENV_CLIENT_ID, DEFAULT_CLIENT_ID),
            language: LANGUAGE.to_string(),
            request_timeout_secs: positive(
                &lookup,
                ENV_REQUEST_TIMEOUT_SECS,
                DEFAULT_REQUEST_TIMEOUT_SECS,
            ),
        };

        let session = SessionSettings {
            renewal_threshold: Duration::from_secs(positive(
                &lookup,
                ENV_RENEWAL_THRESHOLD_SECS,
                DEFAULT_RENEWAL_THRESHOLD_SECS,
            )),
            check_interval: Duration::from_secs(positive(
                &lookup,
                ENV_RENEWAL_INTERVAL_SECS,
                DEFAULT_RENEWAL_INTERVAL_SECS,
            )),
        };

        Self {
            governor,
            upstream,
            session,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub last_username: Option<String>,
    #[serde(default)]
    pub remember_by_default: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the persisted session record.
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let settings = Settings::from_lookup(|_| None);
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.governor.max_requests, 3000);
        assert_eq!(settings.governor.window, Duration::from_secs(3600));
        assert_eq!(settings.session.renewal_threshold, Duration::from_secs(300));
        assert_eq!(settings.session.check_interval, Duration::from_secs(60));
        assert_eq!(settings.upstream.language, "HU");
    }

    #[test]
    fn test_env_overrides() {
        let settings = Settings::from_lookup(lookup_from(&[
            (ENV_MAX_REQUESTS, "10"),
            (ENV_WINDOW_SECS, "60"),
            (ENV_API_BASE_URL, "http://localhost:8080/rest"),
            (ENV_RENEWAL_INTERVAL_SECS, "5"),
        ]));
        assert_eq!(settings.governor.max_requests, 10);
        assert_eq!(settings.governor.window, Duration::from_secs(60));
        assert_eq!(settings.upstream.base_url, "http://localhost:8080/rest");
        assert_eq!(settings.upstream.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(settings.session.check_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let settings = Settings::from_lookup(lookup_from(&[
            (ENV_MAX_REQUESTS, "lots"),
            (ENV_WINDOW_SECS, "0"),
            (ENV_API_BASE_URL, "   "),
        ]));
        assert_eq!(settings.governor.max_requests, 3000);
        assert_eq!(settings.governor.window, Duration::from_secs(3600));
        assert_eq!(settings.upstream.base_url, DEFAULT_API_BASE_URL);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let missing = Config::load_from(&path).expect("missing file is default");
        assert!(missing.last_username.is_none());

        let config = Config {
            last_username: Some("alice".into()),
            remember_by_default: true,
        };
        config.save_to(&path).expect("save config");
        let loaded = Config::load_from(&path).expect("load config");
        assert_eq!(loaded.last_username.as_deref(), Some("alice"));
        assert!(loaded.remember_by_default);
    }
}
