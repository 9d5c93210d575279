//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Runtime parameters of a [`PageCache`](crate::PageCache).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of frames the cache holds.
    pub max_pages: usize,
    /// Cache page size in bytes; an upper bound for every file page size.
    pub page_size: usize,
    /// How long a faulting cursor waits for an evictable frame before the
    /// access fails.
    pub victim_wait: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_pages: 1024,
            page_size: 8192,
            victim_wait: Duration::from_secs(1),
        }
    }
}

impl CacheConfig {
    /// Create a configuration with the given frame count and page size.
    pub fn new(max_pages: usize, page_size: usize) -> Self {
        Self {
            max_pages,
            page_size,
            ..Default::default()
        }
    }

    /// Set the victim wait bound.
    pub fn with_victim_wait(mut self, wait: Duration) -> Self {
        self.victim_wait = wait;
        self
    }

    /// Total payload memory the cache will hold resident.
    pub fn memory_size(&self) -> usize {
        self.max_pages * self.page_size
    }
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OxipagerConfig {
    /// Cache configuration.
    pub cache: Option<CacheConfigSpec>,
}

/// TOML/env view of [`CacheConfig`]; unset fields keep their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfigSpec {
    /// Number of frames.
    pub max_pages: Option<usize>,
    /// Cache page size in bytes.
    pub page_size: Option<usize>,
    /// Victim wait bound in milliseconds.
    pub victim_wait_ms: Option<u64>,
}

impl CacheConfigSpec {
    fn apply_to(&self, config: &mut CacheConfig) {
        if let Some(max_pages) = self.max_pages {
            config.max_pages = max_pages;
        }
        if let Some(page_size) = self.page_size {
            config.page_size = page_size;
        }
        if let Some(ms) = self.victim_wait_ms {
            config.victim_wait = Duration::from_millis(ms);
        }
    }
}

impl OxipagerConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXIPAGER_CONFIG` env var (if set),
    /// then apply `OXIPAGER__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("OXIPAGER_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXIPAGER__") {
                continue;
            }
            let path = key["OXIPAGER__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["cache", "max_pages"] => {
                    self.cache_mut().max_pages = Some(parse_value(&key, &value)?);
                }
                ["cache", "page_size"] => {
                    self.cache_mut().page_size = Some(parse_value(&key, &value)?);
                }
                ["cache", "victim_wait_ms"] => {
                    self.cache_mut().victim_wait_ms = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(())
    }

    /// Build a [`CacheConfig`] using defaults plus overrides.
    pub fn to_cache_config(&self) -> CacheConfig {
        let mut config = CacheConfig::default();
        if let Some(cache) = &self.cache {
            cache.apply_to(&mut config);
        }
        config
    }

    fn cache_mut(&mut self) -> &mut CacheConfigSpec {
        self.cache.get_or_insert_with(CacheConfigSpec::default)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
