//! Buffer configuration that downstream crates can serialize/deserialize.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Rolling window of history retained per context.
    pub window_ms: u64,

    /// Minimum spacing between two throttled prunes of the same context.
    pub prune_interval_ms: u64,

    /// Minimum spacing between two heartbeat touches of the same context.
    pub touch_interval_ms: u64,

    /// Contexts whose heartbeat is older than this are swept.
    pub stale_context_max_age_ms: u64,

    /// Optional fully-qualified store URI (`memory://`, `file:///var/crashbuf`).
    pub store_uri: Option<String>,

    /// Directory for the log store when no URI is given.
    pub store_dir: String,

    /// Dead bytes a context log must accumulate before it is compacted.
    pub compaction_min_bytes: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            prune_interval_ms: 2_000,
            touch_interval_ms: 30_000,
            stale_context_max_age_ms: 24 * 60 * 60 * 1000,
            store_uri: None,
            store_dir: std::env::temp_dir()
                .join("crashbuf")
                .to_string_lossy()
                .into_owned(),
            compaction_min_bytes: 64 * 1024,
        }
    }
}

/// Storage selection handed to `crashbuf-store`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub uri: Option<String>,
    pub root: String,
    pub compaction_min_bytes: u64,
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self {
            uri: Some("memory://".to_string()),
            root: String::new(),
            compaction_min_bytes: BufferConfig::default().compaction_min_bytes,
        }
    }

    pub fn scheme(&self) -> Option<&str> {
        self.uri
            .as_deref()
            .and_then(|uri| uri.split_once("://"))
            .map(|(scheme, _)| scheme.trim())
            .filter(|s| !s.is_empty())
    }
}

impl BufferConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `CRASHBUF_WINDOW_MS`: rolling window
    /// - `CRASHBUF_PRUNE_INTERVAL_MS`: prune throttle
    /// - `CRASHBUF_TOUCH_INTERVAL_MS`: heartbeat throttle
    /// - `CRASHBUF_STALE_MAX_AGE_MS`: stale sweep age
    /// - `CRASHBUF_STORE_URI`: store URI
    /// - `CRASHBUF_STORE_DIR`: log store directory
    /// - `CRASHBUF_COMPACTION_MIN_BYTES`: log compaction threshold
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_u64("CRASHBUF_WINDOW_MS") {
            cfg.window_ms = v;
        }

        if let Some(v) = env_u64("CRASHBUF_PRUNE_INTERVAL_MS") {
            cfg.prune_interval_ms = v;
        }

        if let Some(v) = env_u64("CRASHBUF_TOUCH_INTERVAL_MS") {
            cfg.touch_interval_ms = v;
        }

        if let Some(v) = env_u64("CRASHBUF_STALE_MAX_AGE_MS") {
            cfg.stale_context_max_age_ms = v;
        }

        if let Ok(s) = std::env::var("CRASHBUF_STORE_URI") {
            cfg.store_uri = Some(s);
        }

        if let Ok(s) = std::env::var("CRASHBUF_STORE_DIR") {
            cfg.store_dir = s;
        }

        if let Some(v) = env_u64("CRASHBUF_COMPACTION_MIN_BYTES") {
            cfg.compaction_min_bytes = v;
        }

        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 {
            return Err(Error::Config("window_ms must be > 0".into()));
        }
        if self.store_dir.trim().is_empty() {
            return Err(Error::Config("store_dir must not be empty".into()));
        }
        Ok(())
    }

    /// Parse a YAML document; missing keys keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Produce a storage configuration snapshot used by the store layer.
    pub fn store_config(&self) -> StoreConfig {
        let scheme = self
            .store_uri
            .as_deref()
            .and_then(|uri| uri.split_once("://"))
            .map(|(scheme, _)| scheme.trim().to_string())
            .filter(|s| !s.is_empty());

        let root = match (scheme.as_deref(), self.store_uri.as_ref()) {
            (Some("file"), Some(uri)) => {
                file_uri_to_path(uri).unwrap_or_else(|| self.store_dir.clone())
            }
            // A bare path is a log store directory.
            (None, Some(path)) if !path.trim().is_empty() => path.trim().to_string(),
            _ => self.store_dir.clone(),
        };

        StoreConfig {
            uri: self.store_uri.clone(),
            root,
            compaction_min_bytes: self.compaction_min_bytes,
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok())
}

fn file_uri_to_path(uri: &str) -> Option<String> {
    let stripped = uri.strip_prefix("file://")?;
    if stripped.is_empty() {
        None
    } else if stripped.starts_with('/') {
        Some(stripped.to_string())
    } else {
        Some(format!("/{}", stripped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_retention_constants() {
        let cfg = BufferConfig::default();
        assert_eq!(cfg.prune_interval_ms, 2_000);
        assert_eq!(cfg.touch_interval_ms, 30_000);
        assert!(cfg.store_uri.is_none());
    }

    #[test]
    fn file_uri_becomes_root() {
        let cfg = BufferConfig {
            store_uri: Some("file:///var/lib/crashbuf".into()),
            ..Default::default()
        };
        let store = cfg.store_config();
        assert_eq!(store.scheme(), Some("file"));
        assert_eq!(store.root, "/var/lib/crashbuf");
    }

    #[test]
    fn memory_uri_keeps_dir() {
        let cfg = BufferConfig {
            store_uri: Some("memory://".into()),
            store_dir: "/tmp/x".into(),
            ..Default::default()
        };
        let store = cfg.store_config();
        assert_eq!(store.scheme(), Some("memory"));
        assert_eq!(store.root, "/tmp/x");
    }

    #[test]
    fn bare_path_is_log_root() {
        let cfg = BufferConfig {
            store_uri: Some("/srv/replay".into()),
            ..Default::default()
        };
        let store = cfg.store_config();
        assert_eq!(store.scheme(), None);
        assert_eq!(store.root, "/srv/replay");
    }

    #[test]
    fn yaml_overrides_only_given_keys() {
        let cfg = BufferConfig::from_yaml_str("window_ms: 5000\nstore_uri: memory://\n").unwrap();
        assert_eq!(cfg.window_ms, 5_000);
        assert_eq!(cfg.store_uri.as_deref(), Some("memory://"));
        assert_eq!(cfg.prune_interval_ms, 2_000);
    }

    #[test]
    fn zero_window_fails_validation() {
        let cfg = BufferConfig {
            window_ms: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        assert!(BufferConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_yaml_is_config_error() {
        let err = BufferConfig::from_yaml_str("window_ms: [not, a, number]").unwrap_err();
        assert!(err.to_string().starts_with("Invalid configuration"));
    }
}
