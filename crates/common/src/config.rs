use crate::error::ImgShardError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// imgshard application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Store root directory (holds the manifest and the category shards)
    pub store_root: PathBuf,

    /// Log directory
    pub log_dir: PathBuf,

    /// Log level
    pub log_level: String,

    /// Default number of results returned by a query
    pub default_top_k: usize,

    /// Upper bound on shard saves running at once during indexing
    pub max_concurrent_writes: usize,

    /// Allowed deviation of an embedding's L2 norm from 1.0 before ingestion warns
    pub norm_tolerance: f32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("./database"),
            log_dir: PathBuf::from("./log"),
            log_level: "info".to_string(),
            default_top_k: 3,
            max_concurrent_writes: 8,
            norm_tolerance: 1e-3,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and .env file
    pub fn from_env() -> Result<Self, ImgShardError> {
        // Load .env file (ignore if not exists)
        let _ = dotenv::dotenv();

        let defaults = Self::default();
        let config = Self {
            store_root: Self::get_env_path("IMGSHARD_STORE_ROOT").unwrap_or(defaults.store_root),
            log_dir: Self::get_env_path("LOG_DIR").unwrap_or(defaults.log_dir),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            default_top_k: Self::get_env_parsed("IMGSHARD_TOP_K")?
                .unwrap_or(defaults.default_top_k),
            max_concurrent_writes: Self::get_env_parsed("IMGSHARD_MAX_CONCURRENT_WRITES")?
                .unwrap_or(defaults.max_concurrent_writes),
            norm_tolerance: Self::get_env_parsed("IMGSHARD_NORM_TOLERANCE")?
                .unwrap_or(defaults.norm_tolerance),
        };

        config.validate()?;

        Ok(config)
    }

    /// Get PathBuf from environment variable
    fn get_env_path(key: &str) -> Option<PathBuf> {
        std::env::var(key).ok().map(PathBuf::from)
    }

    /// Parse an optional environment variable, failing on malformed values
    fn get_env_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ImgShardError> {
        match std::env::var(key) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ImgShardError::config(format!("{} has invalid value '{}'", key, raw))),
            Err(_) => Ok(None),
        }
    }

    /// Create the store root and log directory if missing
    pub fn ensure_directories(&self) -> Result<(), ImgShardError> {
        for dir in [&self.store_root, &self.log_dir] {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    ImgShardError::config(format!(
                        "Failed to create directory {}: {}",
                        dir.display(),
                        e
                    ))
                })?;
            }
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ImgShardError> {
        if self.default_top_k == 0 {
            return Err(ImgShardError::config("Default top-k must be at least 1"));
        }

        if self.max_concurrent_writes == 0 {
            return Err(ImgShardError::config("Concurrent write limit cannot be 0"));
        }

        if !self.norm_tolerance.is_finite() || self.norm_tolerance < 0.0 {
            return Err(ImgShardError::config(
                "Norm tolerance must be a finite, non-negative number",
            ));
        }

        Ok(())
    }
}
