//! Embedder-facing configuration.
//!
//! The metadata log takes no command line flags and reads no environment
//! variables; the embedding engine builds a [`MetaLogConfig`] (typically
//! deserialized from its own configuration tree) and hands it to
//! [`MetaLog::new`](crate::MetaLog::new).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Configuration for the metadata log writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaLogConfig {
    /// Directory holding the journal files.
    pub dir: PathBuf,

    /// Remove superseded journal files right after a successful rotation.
    /// Disable if the embedder defers collection, e.g. until a backup of
    /// the old epoch has been taken.
    pub gc_on_rotate: bool,
}

impl Default for MetaLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            gc_on_rotate: true,
        }
    }
}

impl MetaLogConfig {
    /// Configuration rooted at `dir` with default policies.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Override the post-rotation garbage collection policy.
    #[must_use]
    pub fn with_gc_on_rotate(mut self, enabled: bool) -> Self {
        self.gc_on_rotate = enabled;
        self
    }
}

/// Log output format, see [`crate::logging`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-friendly output for interactive use.
    #[default]
    Pretty,
    /// Machine-parseable JSON lines.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = MetaLogConfig::default();
        assert_eq!(config.dir, PathBuf::from("."));
        assert!(config.gc_on_rotate);
    }

    #[test]
    fn builder_overrides() {
        let config = MetaLogConfig::new("/var/lib/basalt").with_gc_on_rotate(false);
        assert_eq!(config.dir, PathBuf::from("/var/lib/basalt"));
        assert!(!config.gc_on_rotate);
    }

    #[test]
    fn serde_roundtrip_with_partial_input() {
        let config: MetaLogConfig = serde_json::from_str(r#"{"dir":"/data/meta"}"#).unwrap();
        assert_eq!(config.dir, PathBuf::from("/data/meta"));
        assert!(config.gc_on_rotate, "missing fields fall back to defaults");

        let json = serde_json::to_string(&config).unwrap();
        let back: MetaLogConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dir, config.dir);
    }

    #[test]
    fn log_format_serde_names() {
        assert_eq!(serde_json::to_string(&LogFormat::Pretty).unwrap(), "\"pretty\"");
        assert_eq!(serde_json::to_string(&LogFormat::Json).unwrap(), "\"json\"");
    }
}
