//! Environment-variable configuration, loaded the way `auth-service::config`
//! does it in the wider pack: a `.env` file (best-effort, ignored if absent)
//! followed by `envy::from_env`, with each field's default baked in via
//! `#[serde(default = ...)]` rather than a fallible read per field.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_cloud_port")]
    pub cloud_port: u16,
    #[serde(default = "default_database_file")]
    pub database_file: String,
    #[serde(default = "default_retention_minutes")]
    pub message_retention_minutes: i64,
    #[serde(default = "default_devices_limit")]
    pub default_devices_limit: i64,
    #[serde(default)]
    pub debug: bool,
}

impl Config {
    /// Load from the process environment, seeded from a `.env` file if one
    /// exists in the working directory. Missing variables fall back to the
    /// defaults above rather than failing startup.
    pub fn from_env() -> Result<Self, envy::Error> {
        if let Err(err) = dotenvy::dotenv() {
            if !matches!(err, dotenvy::Error::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound)
            {
                tracing::warn!(%err, "failed to load .env file");
            }
        }
        envy::from_env()
    }

    pub fn base_url(&self) -> String {
        format!("http://localhost:{}", self.cloud_port)
    }
}

fn default_cloud_port() -> u16 {
    9009
}

fn default_database_file() -> String {
    "wakelink_cloud.db".to_string()
}

fn default_retention_minutes() -> i64 {
    5
}

fn default_devices_limit() -> i64 {
    5
}
