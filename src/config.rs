//! Portal configuration with `PORTAL_*` environment overrides.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, info};

use crate::api::NOTIFICATIONS_PATH;
use crate::client::DEFAULT_API_URL;
use crate::error::ConfigError;
use crate::notification::{ChannelMode, NotificationConfig};
use crate::push::DEFAULT_PUSH_URL;

/// Everything needed to wire up a [`Portal`](crate::Portal).
///
/// Defaults match the local development deployment: the gateway on
/// `localhost:4004`, polling every three seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalConfig {
    /// REST base URL, without a trailing slash.
    pub api_url: String,
    /// WebSocket URL for push notifications.
    pub push_url: String,
    /// Which notification channel to run.
    pub channel_mode: ChannelMode,
    /// Path of the polled notification endpoint.
    pub notifications_path: String,
    /// Directory the session file lives in.
    pub session_dir: PathBuf,
    /// Per-request timeout for the HTTP gateway.
    pub request_timeout: Duration,
    /// Channel and banner timing.
    pub notification: NotificationConfig,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_owned(),
            push_url: DEFAULT_PUSH_URL.to_owned(),
            channel_mode: ChannelMode::Poll,
            notifications_path: NOTIFICATIONS_PATH.to_owned(),
            session_dir: PathBuf::from(".clinic-portal"),
            request_timeout: Duration::from_secs(30),
            notification: NotificationConfig::default(),
        }
    }
}

impl PortalConfig {
    /// Load the configuration from the process environment.
    ///
    /// Recognised variables: `PORTAL_API_URL`, `PORTAL_PUSH_URL`,
    /// `PORTAL_NOTIFY_MODE` (`poll` or `push`), `PORTAL_NOTIFICATIONS_PATH`,
    /// `PORTAL_SESSION_DIR`, `PORTAL_REQUEST_TIMEOUT_MS`,
    /// `PORTAL_POLL_INTERVAL_MS`, `PORTAL_RECONNECT_DELAY_MS`. Unset
    /// variables keep their default.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a variable that is set but does
    /// not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(url) = var("PORTAL_API_URL") {
            config.api_url = url.trim().trim_end_matches('/').to_owned();
        }
        if let Some(url) = var("PORTAL_PUSH_URL") {
            config.push_url = url.trim().to_owned();
        }
        if let Some(mode) = parsed::<ChannelMode>(&var, "PORTAL_NOTIFY_MODE")? {
            config.channel_mode = mode;
        }
        if let Some(path) = var("PORTAL_NOTIFICATIONS_PATH") {
            config.notifications_path = path.trim().to_owned();
        }
        if let Some(dir) = var("PORTAL_SESSION_DIR") {
            config.session_dir = PathBuf::from(dir);
        }
        if let Some(ms) = millis(&var, "PORTAL_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = ms;
        }
        if let Some(ms) = millis(&var, "PORTAL_POLL_INTERVAL_MS")? {
            config.notification.poll_interval = ms;
        }
        if let Some(ms) = millis(&var, "PORTAL_RECONNECT_DELAY_MS")? {
            config.notification.reconnect_delay = ms;
        }

        info!(
            api_url = %config.api_url,
            mode = ?config.channel_mode,
            session_dir = %config.session_dir.display(),
            "portal configuration loaded"
        );
        Ok(config)
    }
}

fn parsed<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match var(key) {
        None => {
            debug!("{key} not set, using default");
            Ok(None)
        }
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
            }),
    }
}

fn millis(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    match parsed::<u64>(var, key)? {
        Some(0) => Err(ConfigError::Invalid {
            key,
            reason: "must be greater than zero".to_owned(),
        }),
        other => Ok(other.map(Duration::from_millis)),
    }
}
