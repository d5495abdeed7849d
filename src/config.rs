//! Configuration management for notesync.
//!
//! This module handles loading and saving application configuration to/from
//! a JSON file. The config directory can be customized.
//!
//! The file holds the `sync` section: remote backend location, owning user
//! and pass options. The database location is chosen by the embedding app,
//! which opens the `Database` itself.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NotesError, NotesResult};

/// Options a single `synchronize` call is invoked with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Push binary columns. When false they are omitted from the request body.
    pub include_binary_data: bool,
    /// Run the download phase after the upload phase.
    pub two_way_sync: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            include_binary_data: true,
            two_way_sync: true,
        }
    }
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the remote backend (table endpoints live under /rest/v1)
    #[serde(default)]
    pub remote_url: String,
    /// Project API key sent alongside the bearer token
    #[serde(default)]
    pub api_key: String,
    /// Owning user of all synced rows
    pub user_id: Option<String>,
    /// Records per upload/download batch (one local transaction each)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Rows per remote pull page
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_true")]
    pub include_binary_data: bool,
    #[serde(default = "default_true")]
    pub two_way_sync: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_batch_size() -> usize {
    50
}

fn default_page_size() -> usize {
    500
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: String::new(),
            api_key: String::new(),
            user_id: None,
            batch_size: default_batch_size(),
            page_size: default_page_size(),
            include_binary_data: true,
            two_way_sync: true,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl SyncConfig {
    /// Pass options as configured
    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            include_binary_data: self.include_binary_data,
            two_way_sync: self.two_way_sync,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigData {
    /// Sync configuration
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Configuration manager
pub struct Config {
    config_dir: PathBuf,
    config_file: PathBuf,
    data: ConfigData,
}

impl Config {
    /// Create a new configuration manager
    ///
    /// Without the `desktop` feature, `config_dir` is required.
    pub fn new(config_dir: Option<PathBuf>) -> NotesResult<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => {
                #[cfg(feature = "desktop")]
                {
                    dirs::config_dir()
                        .unwrap_or_else(|| PathBuf::from("."))
                        .join("notesync")
                }
                #[cfg(not(feature = "desktop"))]
                {
                    return Err(NotesError::Config(
                        "config_dir is required on mobile platforms".to_string(),
                    ));
                }
            }
        };

        fs::create_dir_all(&config_dir)?;
        let config_file = config_dir.join("config.json");

        let loaded = if config_file.exists() {
            match fs::read_to_string(&config_file) {
                Ok(content) => match serde_json::from_str::<ConfigData>(&content) {
                    Ok(data) => Some(data),
                    Err(e) => {
                        tracing::warn!("Ignoring unreadable config file: {}", e);
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!("Could not read config file: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let data = loaded.unwrap_or_default();

        let config = Self {
            config_dir,
            config_file,
            data,
        };

        // Save default config if it doesn't exist
        if !config.config_file.exists() {
            config.save()?;
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> NotesResult<()> {
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.config_file, content)?;
        Ok(())
    }

    /// Get the configuration directory path
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Get sync configuration
    pub fn sync_config(&self) -> &SyncConfig {
        &self.data.sync
    }

    /// Options for a pass as configured
    pub fn sync_options(&self) -> SyncOptions {
        self.data.sync.options()
    }

    /// Owning user of synced rows, if signed in
    pub fn user_id(&self) -> NotesResult<Option<Uuid>> {
        match self.data.sync.user_id.as_deref() {
            Some(id) => Uuid::parse_str(id)
                .map(Some)
                .map_err(|e| NotesError::Config(format!("Invalid user_id: {}", e))),
            None => Ok(None),
        }
    }

    /// Set the owning user
    pub fn set_user_id(&mut self, user_id: Option<Uuid>) -> NotesResult<()> {
        self.data.sync.user_id = user_id.map(|id| id.to_string());
        self.save()
    }

    /// Set the remote backend location
    pub fn set_remote(&mut self, remote_url: &str, api_key: &str) -> NotesResult<()> {
        self.data.sync.remote_url = remote_url.trim_end_matches('/').to_string();
        self.data.sync.api_key = api_key.to_string();
        self.save()
    }

    /// Set the number of records per batch
    pub fn set_batch_size(&mut self, batch_size: usize) -> NotesResult<()> {
        if batch_size == 0 {
            return Err(NotesError::validation("batch_size", "must be at least 1"));
        }
        self.data.sync.batch_size = batch_size;
        self.save()
    }

    /// Get a configuration value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "remote_url" => Some(self.data.sync.remote_url.clone()),
            "user_id" => self.data.sync.user_id.clone(),
            "batch_size" => Some(self.data.sync.batch_size.to_string()),
            "include_binary_data" => Some(self.data.sync.include_binary_data.to_string()),
            "two_way_sync" => Some(self.data.sync.two_way_sync.to_string()),
            _ => None,
        }
    }

    /// Set a configuration value
    pub fn set(&mut self, key: &str, value: &str) -> NotesResult<()> {
        fn parse_bool(key: &str, value: &str) -> NotesResult<bool> {
            value
                .parse::<bool>()
                .map_err(|_| NotesError::Config(format!("{} must be true or false", key)))
        }

        match key {
            "remote_url" => self.data.sync.remote_url = value.trim_end_matches('/').to_string(),
            "user_id" => self.data.sync.user_id = Some(value.to_string()),
            "batch_size" => {
                let size = value
                    .parse::<usize>()
                    .map_err(|_| NotesError::Config("batch_size must be a number".to_string()))?;
                return self.set_batch_size(size);
            }
            "include_binary_data" => {
                self.data.sync.include_binary_data = parse_bool(key, value)?
            }
            "two_way_sync" => self.data.sync.two_way_sync = parse_bool(key, value)?,
            _ => return Err(NotesError::Config(format!("Unknown config key: {}", key))),
        }
        self.save()
    }
}
