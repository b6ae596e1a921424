//! Config formats, the [`ConfigStore`] boundary and crash-atomic file writes.
//!
//! Every durable write goes through [`write_atomic`]: the payload lands in a
//! hidden temp file next to the target, is synced, and is then renamed over
//! the target. A reader therefore sees either the previous document or the
//! new one, never a truncated file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{ConfigError, HtResult, PersistenceError};

/// Attempts made by [`write_atomic_with_retry`] before giving up.
pub const WRITE_ATTEMPTS: u32 = 2;

/// On-disk encoding of a config or result document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl Default for ConfigFormat {
    fn default() -> Self {
        Self::Yaml
    }
}

impl ConfigFormat {
    /// Infer the format from a file extension (`.yaml`, `.yml`, `.json`).
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("json") => Ok(Self::Json),
            _ => Err(ConfigError::UnsupportedFormat {
                path: path.to_path_buf(),
            }),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
        }
    }

    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, PersistenceError> {
        let encoded = match self {
            Self::Yaml => serde_yaml::to_string(value).map(String::into_bytes).map_err(|e| e.to_string()),
            Self::Json => serde_json::to_vec_pretty(value).map_err(|e| e.to_string()),
        };
        encoded.map_err(|message| PersistenceError::Encode {
            what: format!("{self:?} document"),
            message,
        })
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, String> {
        match self {
            Self::Yaml => serde_yaml::from_slice(bytes).map_err(|e| e.to_string()),
            Self::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    parent.join(format!(".{name}.tmp"))
}

/// Write `bytes` to `path` via temp file + rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = temp_path_for(path);
    let result = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// [`write_atomic`], retried once before the failure is surfaced.
pub fn write_atomic_with_retry(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let mut attempt = 1;
    loop {
        match write_atomic(path, bytes) {
            Ok(()) => return Ok(()),
            Err(source) if attempt >= WRITE_ATTEMPTS => {
                return Err(PersistenceError::WriteFailed {
                    path: path.to_path_buf(),
                    attempts: attempt,
                    source,
                });
            }
            Err(err) => {
                warn!(path = %path.display(), attempt, error = %err, "atomic write failed, retrying");
                attempt += 1;
            }
        }
    }
}

/// Read and decode a document, picking the format from the extension.
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let format = ConfigFormat::from_path(path)?;
    let bytes = fs::read(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => ConfigError::NotFound {
            path: path.to_path_buf(),
        },
        _ => ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        },
    })?;
    format.decode(&bytes).map_err(|message| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

/// Load/save boundary for loosely-typed config mappings.
pub trait ConfigStore: Send + Sync {
    fn load(&self, path: &Path) -> HtResult<serde_json::Value>;

    /// Save `value` at `path`. Implementations must write atomically.
    fn save(&self, value: &serde_json::Value, path: &Path, format: ConfigFormat) -> HtResult<()>;
}

/// Filesystem-backed [`ConfigStore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FileConfigStore;

impl ConfigStore for FileConfigStore {
    fn load(&self, path: &Path) -> HtResult<serde_json::Value> {
        Ok(load_document(path)?)
    }

    fn save(&self, value: &serde_json::Value, path: &Path, format: ConfigFormat) -> HtResult<()> {
        let bytes = format.encode(value)?;
        write_atomic_with_retry(path, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn format_from_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a/b.yaml")).unwrap(), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("b.YML")).unwrap(), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("c.json")).unwrap(), ConfigFormat::Json);
        assert!(matches!(
            ConfigFormat::from_path(Path::new("d.toml")),
            Err(ConfigError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best_params.yaml");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn atomic_write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/results/history.json");
        write_atomic(&path, b"[]").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn retry_surfaces_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        // A directory in the way of the target makes the rename fail every time.
        let path = dir.path().join("blocked");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("occupant"), b"x").unwrap();

        let err = write_atomic_with_retry(&path, b"payload").unwrap_err();
        match err {
            PersistenceError::WriteFailed { attempts, .. } => assert_eq!(attempts, WRITE_ATTEMPTS),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn file_store_round_trip_both_formats() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore;
        let value = json!({"n_trials": 50, "search_space": {"lr0": {"min": 1e-5, "max": 1e-2}}});

        for (name, format) in [("cfg.yaml", ConfigFormat::Yaml), ("cfg.json", ConfigFormat::Json)] {
            let path = dir.path().join(name);
            store.save(&value, &path, format).unwrap();
            assert_eq!(store.load(&path).unwrap(), value);
        }
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let err = load_document::<serde_json::Value>(Path::new("/nonexistent/ht/config.yaml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }
}
