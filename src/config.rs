use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{FixedOffset, TimeDelta};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::backend::ReconnectPolicy;
use crate::error::ConfigError;
use crate::timeline::{GroupingPolicy, DEFAULT_PAGE_SIZE, GROUPING_WINDOW_MS};

// Default configuration
pub const DEFAULT_SERVER: &str = "http://localhost:8000";
pub const DEFAULT_WEBSOCKET_PATH: &str = "/ws/chat";
pub const DEFAULT_HISTORY_TIMEOUT_MS: u64 = 10_000;
/// How many recently opened conversations are remembered.
const MAX_RECENT: usize = 10;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the portal, e.g. `https://portal.example.edu`
    pub server: String,
    pub websocket_path: String,
    /// Raw `Cookie` header value carrying the portal session
    pub session_cookie: Option<String>,
    pub page_size: usize,
    pub history_timeout_ms: u64,
    pub grouping_window_ms: i64,
    /// Offset of the zone whose midnight splits message blocks
    pub utc_offset_minutes: i32,
    pub reconnect: ReconnectPolicy,
    /// Write conversation transcripts to disk
    pub transcripts: bool,
    /// Recently opened conversation references, newest first
    pub recent: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            websocket_path: DEFAULT_WEBSOCKET_PATH.to_string(),
            session_cookie: None,
            page_size: DEFAULT_PAGE_SIZE,
            history_timeout_ms: DEFAULT_HISTORY_TIMEOUT_MS,
            grouping_window_ms: GROUPING_WINDOW_MS,
            utc_offset_minutes: 0,
            reconnect: ReconnectPolicy::default(),
            transcripts: false,
            recent: Vec::new(),
        }
    }
}

impl Settings {
    pub fn grouping_policy(&self) -> Result<GroupingPolicy, ConfigError> {
        if self.grouping_window_ms <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "grouping_window_ms",
                reason: "must be positive".into(),
            });
        }
        let offset = FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60)).ok_or(
            ConfigError::InvalidValue {
                field: "utc_offset_minutes",
                reason: format!("{} is out of range", self.utc_offset_minutes),
            },
        )?;
        Ok(GroupingPolicy::new(
            TimeDelta::milliseconds(self.grouping_window_ms),
            offset,
        ))
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_millis(self.history_timeout_ms)
    }

    /// Base for REST calls, always ending with a slash.
    pub fn api_url(&self) -> Result<Url, ConfigError> {
        let mut url = self.server_url()?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    /// `ws://` or `wss://` endpoint matching the server scheme.
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        let mut url = self.server_url()?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ConfigError::InvalidServer {
                    url: self.server.clone(),
                    reason: format!("unsupported scheme {}", other),
                })
            }
        };
        url.set_scheme(scheme).map_err(|_| ConfigError::InvalidServer {
            url: self.server.clone(),
            reason: "cannot switch to a websocket scheme".into(),
        })?;
        url.set_path(&self.websocket_path);
        Ok(url)
    }

    /// Put `reference` at the front of the recent list.
    pub fn remember(&mut self, reference: &str) {
        self.recent.retain(|r| r != reference);
        self.recent.insert(0, reference.to_string());
        self.recent.truncate(MAX_RECENT);
    }

    fn server_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.server).map_err(|e| ConfigError::InvalidServer {
            url: self.server.clone(),
            reason: e.to_string(),
        })
    }
}

pub fn settings_path() -> Option<PathBuf> {
    if let Some(proj) = ProjectDirs::from("org", "portal", "portal-chat") {
        let dir = proj.config_dir();
        if let Err(e) = fs::create_dir_all(dir) {
            tracing::warn!("Failed to create config dir: {}", e);
            return None;
        }
        return Some(dir.join("settings.json"));
    }
    None
}

/// Load settings from the default location. A missing file yields the
/// defaults; an unreadable one is reported and also yields the defaults.
pub fn load_settings() -> Settings {
    let Some(path) = settings_path() else {
        return Settings::default();
    };
    if !path.exists() {
        return Settings::default();
    }
    load_settings_from(&path).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), "ignoring unreadable settings: {}", e);
        Settings::default()
    })
}

pub fn load_settings_from(path: &Path) -> Result<Settings, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

pub fn save_settings(settings: &Settings) -> Result<(), ConfigError> {
    let path = settings_path().ok_or(ConfigError::NoConfigDir)?;
    save_settings_to(settings, &path)
}

pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<(), ConfigError> {
    let data = serde_json::to_string_pretty(settings)?;
    let mut file = fs::File::create(path)?;
    file.write_all(data.as_bytes())?;
    Ok(())
}
