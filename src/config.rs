//! Runtime configuration from environment (and `.env`)

use crate::sync::Session;
use std::path::PathBuf;

const DEFAULT_TOKEN_EXPIRES_IN_SECS: i64 = 3600;
const DATABASE_FILE: &str = "sync-queue.db";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("Failed to determine app data directory")]
    NoDataDir,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backend_url: String,
    pub api_key: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_in: i64,
    pub database_path: PathBuf,
}

impl AppConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup` (name -> value)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let backend_url = get("SYNC_BACKEND_URL").ok_or(ConfigError::Missing("SYNC_BACKEND_URL"))?;
        url::Url::parse(&backend_url).map_err(|e| ConfigError::Invalid {
            name: "SYNC_BACKEND_URL",
            reason: e.to_string(),
        })?;

        let api_key = get("SYNC_API_KEY").ok_or(ConfigError::Missing("SYNC_API_KEY"))?;

        let token_expires_in = match get("SYNC_TOKEN_EXPIRES_IN") {
            Some(raw) => raw.trim().parse::<i64>().map_err(|e| ConfigError::Invalid {
                name: "SYNC_TOKEN_EXPIRES_IN",
                reason: e.to_string(),
            })?,
            None => DEFAULT_TOKEN_EXPIRES_IN_SECS,
        };

        let database_path = match get("SYNC_DATABASE_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_database_path()?,
        };

        Ok(Self {
            backend_url,
            api_key,
            access_token: get("SYNC_ACCESS_TOKEN"),
            refresh_token: get("SYNC_REFRESH_TOKEN"),
            token_expires_in,
            database_path,
        })
    }

    /// Initial session, when both tokens are configured
    pub fn session(&self) -> Option<Session> {
        match (&self.access_token, &self.refresh_token) {
            (Some(access), Some(refresh)) => Some(Session::new(
                access.clone(),
                refresh.clone(),
                self.token_expires_in,
            )),
            _ => None,
        }
    }
}

fn default_database_path() -> Result<PathBuf, ConfigError> {
    let dirs = directories::ProjectDirs::from("com", "planner", "planner-sync")
        .ok_or(ConfigError::NoDataDir)?;
    Ok(dirs.data_dir().join(DATABASE_FILE))
}
