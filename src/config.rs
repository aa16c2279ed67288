//! Runtime configuration
//!
//! Settings are read from a TOML file and can be overridden from the
//! environment:
//!
//! ```bash
//! # Larger result cache
//! export TESSERA_CACHE_SIZE=5000
//!
//! # Default timeout for external targets
//! export TESSERA_HTTP_TIMEOUT_MS=2000
//! ```
//!
//! The file is looked up in this order: an explicit path, `TESSERA_CONFIG`,
//! `./tessera.toml`, then `<config dir>/tessera/config.toml`. Without a file
//! the defaults apply.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum nesting of function and component calls
pub const DEFAULT_MAX_CALL_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached results
    pub capacity: usize,
    /// TTL applied when an operation sets `cache` without `cache_ttl`
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_ms: u64,
    /// Base for `endpoint` targets
    pub base_url: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    pub depth: usize,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self { depth: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory that relative Data `source` paths resolve against
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub cache: CacheConfig,
    pub http: HttpConfig,
    pub retry: RetryConfig,
    pub dump: DumpConfig,
    pub data: DataConfig,
    /// Named services for `service` targets
    pub services: BTreeMap<String, String>,
    /// Worker threads for batch commands
    pub workers: usize,
    pub max_call_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            http: HttpConfig::default(),
            retry: RetryConfig::default(),
            dump: DumpConfig::default(),
            data: DataConfig::default(),
            services: BTreeMap::new(),
            workers: num_cpus::get(),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl RuntimeConfig {
    /// Parse TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid tessera configuration")
    }

    /// Load a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Resolve the configuration file and apply environment overrides
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match Self::locate(explicit) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading configuration");
                Self::from_file(&path)?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Some(path) = std::env::var_os("TESSERA_CONFIG") {
            return Some(PathBuf::from(path));
        }
        let local = PathBuf::from("tessera.toml");
        if local.is_file() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("tessera").join("config.toml"))
            .filter(|path| path.is_file())
    }

    /// Apply `TESSERA_CACHE_SIZE` and `TESSERA_HTTP_TIMEOUT_MS`
    pub fn apply_env(&mut self) {
        if let Some(capacity) = env_number("TESSERA_CACHE_SIZE") {
            self.cache.capacity = capacity as usize;
        }
        if let Some(timeout) = env_number("TESSERA_HTTP_TIMEOUT_MS") {
            self.http.timeout_ms = timeout;
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http.timeout_ms)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.default_ttl_secs)
    }

    /// Resolve a Data `source` path against `data.base_dir`
    pub fn data_path(&self, source: &str) -> PathBuf {
        let path = PathBuf::from(source);
        match &self.data.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }
}

fn env_number(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.dump.depth, 3);
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RuntimeConfig::from_toml(
            r#"
            [http]
            base_url = "https://api.example.com"

            [services]
            users = "https://users.example.com/v1"
            "#,
        )
        .unwrap();
        assert_eq!(config.http.base_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.http.timeout_ms, 30_000);
        assert_eq!(config.services["users"], "https://users.example.com/v1");
        assert_eq!(config.cache.default_ttl_secs, 300);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dump]\ndepth = 5\n[data]\nbase_dir = \"/srv/data\"").unwrap();
        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.dump.depth, 5);
        assert_eq!(config.data_path("a.csv"), PathBuf::from("/srv/data/a.csv"));
        assert_eq!(config.data_path("/abs.csv"), PathBuf::from("/abs.csv"));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(RuntimeConfig::from_toml("[cache]\ncapacity = \"lots\"").is_err());
    }
}
