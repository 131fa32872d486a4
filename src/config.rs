use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub spotify: SpotifyConfig,
    pub sync: SyncConfig,
    pub database: DatabaseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            spotify: SpotifyConfig::default(),
            sync: SyncConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

/// Spotify application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    /// OAuth client id of the registered application
    pub client_id: String,
    /// OAuth client secret of the registered application
    pub client_secret: String,
    /// Token endpoint of the accounts service
    pub token_url: String,
    /// Base URL of the web API
    pub api_base: String,
    /// Per-request timeout in seconds (0 disables the timeout; a hung
    /// request then holds the request lane until the server gives up)
    pub request_timeout_secs: u64,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            token_url: "https://accounts.spotify.com/api/token".to_string(),
            api_base: "https://api.spotify.com/v1".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl SpotifyConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        if self.request_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.request_timeout_secs))
        }
    }
}

/// Sync loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between polling iterations
    pub poll_interval_secs: u64,
    /// Maximum number of played items requested per poll (API caps at 50)
    pub batch_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 120,
            batch_limit: 50,
        }
    }
}

/// Database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file path (empty = default data dir)
    pub path: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: None }
    }
}

impl DatabaseConfig {
    /// Resolve the database file path, creating the data directory if needed.
    pub fn resolve_path(&self) -> Result<PathBuf> {
        if let Some(ref custom) = self.path {
            return Ok(PathBuf::from(custom));
        }
        let data_dir = dirs::data_dir()
            .context("Failed to get data directory")?
            .join("wavelog");
        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        Ok(data_dir.join("library.db"))
    }
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("wavelog");

        fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path).context("Failed to read config file")?;

            let config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;

            Ok(config)
        } else {
            // Create default config and save it
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents).context("Failed to write config file")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.spotify.client_id.is_empty());
        assert_eq!(
            config.spotify.token_url,
            "https://accounts.spotify.com/api/token"
        );
        assert_eq!(config.spotify.api_base, "https://api.spotify.com/v1");
        assert_eq!(config.spotify.request_timeout_secs, 30);
        assert_eq!(config.sync.poll_interval_secs, 120);
        assert_eq!(config.sync.batch_limit, 50);
        assert!(config.database.path.is_none());
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();

        assert_eq!(config.spotify.token_url, deserialized.spotify.token_url);
        assert_eq!(
            config.sync.poll_interval_secs,
            deserialized.sync.poll_interval_secs
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial_toml = r#"
[spotify]
client_id = "abc123"
client_secret = "shhh"
"#;

        let config: Config = toml::from_str(partial_toml).unwrap();

        // Custom values
        assert_eq!(config.spotify.client_id, "abc123");
        assert_eq!(config.spotify.client_secret, "shhh");
        // Default values
        assert_eq!(config.spotify.api_base, "https://api.spotify.com/v1");
        assert_eq!(config.sync.poll_interval_secs, 120);
    }

    #[test]
    fn test_full_config_parsing() {
        let full_toml = r#"
[spotify]
client_id = "id"
client_secret = "secret"
token_url = "http://localhost:9000/token"
api_base = "http://localhost:9000/v1"
request_timeout_secs = 5

[sync]
poll_interval_secs = 30
batch_limit = 20

[database]
path = "/tmp/wavelog-test.db"
"#;

        let config: Config = toml::from_str(full_toml).unwrap();

        assert_eq!(config.spotify.token_url, "http://localhost:9000/token");
        assert_eq!(config.spotify.request_timeout_secs, 5);
        assert_eq!(config.sync.poll_interval_secs, 30);
        assert_eq!(config.sync.batch_limit, 20);
        assert_eq!(
            config.database.path,
            Some("/tmp/wavelog-test.db".to_string())
        );
    }

    #[test]
    fn test_zero_timeout_disables_request_timeout() {
        let mut config = SpotifyConfig::default();
        config.request_timeout_secs = 0;
        assert!(config.request_timeout().is_none());

        config.request_timeout_secs = 10;
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let invalid_toml = "this is not valid [[ toml";
        let result: Result<Config, _> = toml::from_str(invalid_toml);
        assert!(result.is_err());
    }
}
