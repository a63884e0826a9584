//! Bot configuration loaded from environment variables.
//!
//! Every setting has a default so the bot can start with only `ADMIN_IDS`
//! set. A `.env` file in the working directory is honoured (loaded in
//! `main` before this runs).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use reprise_shared::constants::{
    CONFIRM_TIMEOUT_SECS, DEFAULT_ALLOWED_EXTENSIONS, MAX_BACKUP_FILES, MAX_FILE_SIZE,
    RATE_LIMIT_CEILING, RATE_LIMIT_WINDOW_SECS,
};
use reprise_shared::PrincipalId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ADMIN_IDS is empty, at least one admin is required")]
    NoAdmins,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("cannot create directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Principals allowed to use the bot at startup.
    /// Env: `ADMIN_IDS` (comma-separated numeric ids, `@` prefix tolerated)
    /// Default: none
    pub admin_ids: Vec<PrincipalId>,

    /// Directory holding `database.json`.
    /// Env: `DATA_DIR`
    /// Default: `./data`
    pub data_dir: PathBuf,

    /// Directory downloaded media is written to.
    /// Env: `MEDIA_DIR`
    /// Default: `./media`
    pub media_dir: PathBuf,

    /// Directory for store snapshots.
    /// Env: `BACKUP_DIR`
    /// Default: `./backups`
    pub backup_dir: PathBuf,

    /// Messages per principal per window.
    /// Env: `RATE_LIMIT_PER_MINUTE`
    /// Default: `30`
    pub rate_limit: u32,

    /// Env: `RATE_LIMIT_WINDOW_SECS`
    /// Default: `60`
    pub rate_window: Duration,

    /// Whether the periodic backup job runs.
    /// Env: `AUTO_BACKUP` (true/false)
    /// Default: `true`
    pub auto_backup: bool,

    /// Env: `BACKUP_INTERVAL_HOURS`
    /// Default: `6`
    pub backup_interval: Duration,

    /// Snapshots kept after retention.
    /// Env: `MAX_BACKUP_FILES`
    /// Default: `10`
    pub max_backups: usize,

    /// Env: `MEDIA_CLEANUP_INTERVAL_HOURS`
    /// Default: `24`
    pub media_cleanup_interval: Duration,

    /// Media files older than this are swept regardless of references.
    /// Env: `MEDIA_RETENTION_DAYS`
    /// Default: `30`
    pub media_retention: Duration,

    /// Env: `MAX_FILE_SIZE` (bytes)
    /// Default: 20 MiB
    pub max_file_size: u64,

    /// Lowercase extensions with a leading dot.
    /// Env: `ALLOWED_EXTENSIONS` (comma-separated, dot optional)
    pub allowed_extensions: Vec<String>,

    /// How long a delete confirmation prompt stays up.
    /// Env: `CONFIRM_TIMEOUT_SECS`
    /// Default: `30`
    pub confirm_timeout: Duration,
}

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            admin_ids: Vec::new(),
            data_dir: PathBuf::from("./data"),
            media_dir: PathBuf::from("./media"),
            backup_dir: PathBuf::from("./backups"),
            rate_limit: RATE_LIMIT_CEILING,
            rate_window: Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
            auto_backup: true,
            backup_interval: Duration::from_secs(6 * HOUR),
            max_backups: MAX_BACKUP_FILES,
            media_cleanup_interval: Duration::from_secs(24 * HOUR),
            media_retention: Duration::from_secs(30 * DAY),
            max_file_size: MAX_FILE_SIZE,
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            confirm_timeout: Duration::from_secs(CONFIRM_TIMEOUT_SECS),
        }
    }
}

impl BotConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Invalid values are
    /// logged and replaced by the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("ADMIN_IDS") {
            config.admin_ids = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|s| match PrincipalId::parse(s) {
                    Some(id) => Some(id),
                    None => {
                        tracing::warn!(value = %s, "Ignoring invalid admin id");
                        None
                    }
                })
                .collect();
        }

        if let Some(path) = lookup("DATA_DIR") {
            config.data_dir = PathBuf::from(path);
        }
        if let Some(path) = lookup("MEDIA_DIR") {
            config.media_dir = PathBuf::from(path);
        }
        if let Some(path) = lookup("BACKUP_DIR") {
            config.backup_dir = PathBuf::from(path);
        }

        if let Some(n) = parse_var::<u32>(&lookup, "RATE_LIMIT_PER_MINUTE") {
            config.rate_limit = n;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "RATE_LIMIT_WINDOW_SECS") {
            config.rate_window = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("AUTO_BACKUP") {
            config.auto_backup = val != "false" && val != "0";
        }
        if let Some(hours) = parse_var::<u64>(&lookup, "BACKUP_INTERVAL_HOURS") {
            config.backup_interval = Duration::from_secs(hours * HOUR);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "MAX_BACKUP_FILES") {
            config.max_backups = n;
        }

        if let Some(hours) = parse_var::<u64>(&lookup, "MEDIA_CLEANUP_INTERVAL_HOURS") {
            config.media_cleanup_interval = Duration::from_secs(hours * HOUR);
        }
        if let Some(days) = parse_var::<u64>(&lookup, "MEDIA_RETENTION_DAYS") {
            config.media_retention = Duration::from_secs(days * DAY);
        }

        if let Some(bytes) = parse_var::<u64>(&lookup, "MAX_FILE_SIZE") {
            config.max_file_size = bytes;
        }
        if let Some(raw) = lookup("ALLOWED_EXTENSIONS") {
            let parsed = parse_extensions(&raw);
            if parsed.is_empty() {
                tracing::warn!("ALLOWED_EXTENSIONS is empty, using default");
            } else {
                config.allowed_extensions = parsed;
            }
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "CONFIRM_TIMEOUT_SECS") {
            config.confirm_timeout = Duration::from_secs(secs);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    /// Path of the primary store file.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("database.json")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin_ids.is_empty() {
            return Err(ConfigError::NoAdmins);
        }
        let nonzero = [
            ("RATE_LIMIT_PER_MINUTE", self.rate_limit as u64),
            ("RATE_LIMIT_WINDOW_SECS", self.rate_window.as_secs()),
            ("BACKUP_INTERVAL_HOURS", self.backup_interval.as_secs()),
            ("MAX_BACKUP_FILES", self.max_backups as u64),
            ("MEDIA_CLEANUP_INTERVAL_HOURS", self.media_cleanup_interval.as_secs()),
            ("MAX_FILE_SIZE", self.max_file_size),
            ("CONFIRM_TIMEOUT_SECS", self.confirm_timeout.as_secs()),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }

    /// Create the data, media and backup directories.
    pub async fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [&self.data_dir, &self.media_dir, &self.backup_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| ConfigError::Directory {
                    path: dir.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}

fn parse_extensions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .map(|ext| format!(".{ext}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> BotConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BotConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = BotConfig::default();
        assert_eq!(config.rate_limit, 30);
        assert_eq!(config.rate_window, Duration::from_secs(60));
        assert_eq!(config.max_backups, 10);
        assert_eq!(config.store_path(), PathBuf::from("./data/database.json"));
        assert!(config.allowed_extensions.contains(&".jpg".to_string()));
        assert!(matches!(config.validate(), Err(ConfigError::NoAdmins)));
    }

    #[test]
    fn test_env_overrides() {
        let config = config_from(&[
            ("ADMIN_IDS", "123, @456,,junk"),
            ("DATA_DIR", "/srv/reprise"),
            ("RATE_LIMIT_PER_MINUTE", "12"),
            ("AUTO_BACKUP", "false"),
            ("BACKUP_INTERVAL_HOURS", "2"),
            ("MEDIA_RETENTION_DAYS", "7"),
            ("ALLOWED_EXTENSIONS", "JPG, .png ,"),
        ]);

        assert_eq!(config.admin_ids, vec![PrincipalId(123), PrincipalId(456)]);
        assert_eq!(config.store_path(), PathBuf::from("/srv/reprise/database.json"));
        assert_eq!(config.rate_limit, 12);
        assert!(!config.auto_backup);
        assert_eq!(config.backup_interval, Duration::from_secs(2 * HOUR));
        assert_eq!(config.media_retention, Duration::from_secs(7 * DAY));
        assert_eq!(config.allowed_extensions, vec![".jpg", ".png"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_from(&[
            ("ADMIN_IDS", "1"),
            ("RATE_LIMIT_PER_MINUTE", "lots"),
            ("ALLOWED_EXTENSIONS", " , "),
        ]);
        assert_eq!(config.rate_limit, RATE_LIMIT_CEILING);
        assert_eq!(config.allowed_extensions.len(), DEFAULT_ALLOWED_EXTENSIONS.len());
    }

    #[test]
    fn test_zero_rejected() {
        let config = config_from(&[("ADMIN_IDS", "1"), ("MAX_BACKUP_FILES", "0")]);
        assert!(matches!(config.validate(), Err(ConfigError::Zero("MAX_BACKUP_FILES"))));
    }

    #[tokio::test]
    async fn test_ensure_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = BotConfig {
            data_dir: dir.path().join("data"),
            media_dir: dir.path().join("media"),
            backup_dir: dir.path().join("nested/backups"),
            ..BotConfig::default()
        };
        config.ensure_dirs().await.unwrap();
        assert!(dir.path().join("nested/backups").is_dir());
    }
}
