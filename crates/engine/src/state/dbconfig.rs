//! Runtime-config validation record — detects databases created under a
//! different filesystem layout or graph driver.
//!
//! Each tracked field is create-on-first-use: absent fields are recorded in
//! a follow-up write, present fields are compared. Paths compare after
//! symlink resolution when they exist; non-paths compare literally. An empty
//! current value with a non-empty built-in default matches the default, so
//! downstream library default changes do not strand old databases.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::conf::EngineConfig;
use crate::errors::EngineError;
use crate::util::canonical_path;

pub const CFG_OS: &str = "os";
pub const CFG_STATIC_DIR: &str = "static-dir";
pub const CFG_TMP_DIR: &str = "tmp-dir";
pub const CFG_RUN_ROOT: &str = "run-root";
pub const CFG_GRAPH_ROOT: &str = "graph-root";
pub const CFG_GRAPH_DRIVER: &str = "graph-driver-name";
pub const CFG_VOLUME_PATH: &str = "volume-path";

/// The stored per-field mapping. `None` = never recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DBConfig {
    pub os: Option<String>,
    pub static_dir: Option<String>,
    pub tmp_dir: Option<String>,
    pub run_root: Option<String>,
    pub graph_root: Option<String>,
    pub graph_driver: Option<String>,
    pub volume_path: Option<String>,
}

struct Field<'a> {
    name: &'static str,
    stored: &'a Option<String>,
    current: String,
    /// Built-in default absorbed when the current value is empty.
    default: &'static str,
    is_path: bool,
}

/// Compare `stored` against the live configuration.
///
/// Returns the (field name, value) pairs that are missing from the store and
/// should be recorded in a follow-up write transaction. A mismatch yields
/// [`EngineError::DBBadConfig`], downgraded to a warning for path fields when
/// `lenient` is set (reset path).
pub fn compare(
    stored: &DBConfig,
    config: &EngineConfig,
    lenient: bool,
) -> Result<Vec<(&'static str, String)>, EngineError> {
    let fields = [
        Field {
            name: CFG_OS,
            stored: &stored.os,
            current: std::env::consts::OS.to_string(),
            default: "",
            is_path: false,
        },
        Field {
            name: CFG_STATIC_DIR,
            stored: &stored.static_dir,
            current: path_str(&config.static_dir),
            default: "",
            is_path: true,
        },
        Field {
            name: CFG_TMP_DIR,
            stored: &stored.tmp_dir,
            current: path_str(&config.tmp_dir),
            default: "",
            is_path: true,
        },
        Field {
            name: CFG_RUN_ROOT,
            stored: &stored.run_root,
            current: path_str(&config.run_root),
            default: "",
            is_path: true,
        },
        Field {
            name: CFG_GRAPH_ROOT,
            stored: &stored.graph_root,
            current: path_str(&config.graph_root),
            default: "",
            is_path: true,
        },
        Field {
            name: CFG_GRAPH_DRIVER,
            stored: &stored.graph_driver,
            current: config.graph_driver_name.clone(),
            default: "overlay",
            is_path: false,
        },
        Field {
            name: CFG_VOLUME_PATH,
            stored: &stored.volume_path,
            current: path_str(&config.volume_path),
            default: "",
            is_path: true,
        },
    ];

    let mut missing = Vec::new();
    for field in fields {
        match field.stored {
            None => missing.push((field.name, field.current)),
            Some(stored_value) => {
                if field_matches(stored_value, &field) {
                    continue;
                }
                let msg = format!(
                    "database {} \"{}\" does not match our {} \"{}\"",
                    field.name, stored_value, field.name, field.current
                );
                if lenient && field.is_path {
                    tracing::warn!("{}; continuing because reset was requested", msg);
                    continue;
                }
                return Err(EngineError::DBBadConfig(msg));
            }
        }
    }
    Ok(missing)
}

fn field_matches(stored: &str, field: &Field<'_>) -> bool {
    if field.current.is_empty() && !field.default.is_empty() {
        // Absorb downstream default changes: an unset current value matches
        // the built-in default.
        return stored == field.default;
    }
    if field.is_path {
        canonical_path(Path::new(stored)) == canonical_path(Path::new(&field.current))
    } else {
        stored == field.current
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl DBConfig {
    /// Apply a recorded field by name. Used by both backends when writing
    /// the follow-up transaction for missing fields.
    pub fn set_field(&mut self, name: &str, value: String) {
        match name {
            CFG_OS => self.os = Some(value),
            CFG_STATIC_DIR => self.static_dir = Some(value),
            CFG_TMP_DIR => self.tmp_dir = Some(value),
            CFG_RUN_ROOT => self.run_root = Some(value),
            CFG_GRAPH_ROOT => self.graph_root = Some(value),
            CFG_GRAPH_DRIVER => self.graph_driver = Some(value),
            CFG_VOLUME_PATH => self.volume_path = Some(value),
            other => tracing::warn!("ignoring unknown db config field \"{}\"", other),
        }
    }

    pub fn field(&self, name: &str) -> Option<&String> {
        match name {
            CFG_OS => self.os.as_ref(),
            CFG_STATIC_DIR => self.static_dir.as_ref(),
            CFG_TMP_DIR => self.tmp_dir.as_ref(),
            CFG_RUN_ROOT => self.run_root.as_ref(),
            CFG_GRAPH_ROOT => self.graph_root.as_ref(),
            CFG_GRAPH_DRIVER => self.graph_driver.as_ref(),
            CFG_VOLUME_PATH => self.volume_path.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config_with_dirs(root: &Path) -> EngineConfig {
        EngineConfig {
            static_dir: root.join("state"),
            tmp_dir: root.join("tmp"),
            run_root: root.join("run"),
            graph_root: root.join("graph"),
            graph_driver_name: "overlay".to_string(),
            volume_path: root.join("volumes"),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_store_records_all_fields() {
        let config = config_with_dirs(Path::new("/nonexistent/engine"));
        let missing = compare(&DBConfig::default(), &config, false).unwrap();
        assert_eq!(missing.len(), 7);
        assert!(missing.iter().any(|(name, _)| *name == CFG_OS));
    }

    #[test]
    fn test_recorded_fields_match() {
        let config = config_with_dirs(Path::new("/nonexistent/engine"));
        let mut stored = DBConfig::default();
        for (name, value) in compare(&stored, &config, false).unwrap() {
            stored.set_field(name, value);
        }
        assert!(compare(&stored, &config, false).unwrap().is_empty());
    }

    #[test]
    fn test_mismatch_rejected() {
        let config = config_with_dirs(Path::new("/nonexistent/engine"));
        let stored = DBConfig {
            graph_root: Some("/somewhere/else".to_string()),
            ..Default::default()
        };
        match compare(&stored, &config, false) {
            Err(EngineError::DBBadConfig(msg)) => assert!(msg.contains("graph-root")),
            other => panic!("expected DBBadConfig, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_lenient_downgrades_path_mismatch() {
        let config = config_with_dirs(Path::new("/nonexistent/engine"));
        let stored = DBConfig {
            graph_root: Some("/somewhere/else".to_string()),
            ..Default::default()
        };
        assert!(compare(&stored, &config, true).is_ok());
    }

    #[test]
    fn test_empty_current_matches_default() {
        let mut config = config_with_dirs(Path::new("/nonexistent/engine"));
        config.graph_driver_name = String::new();
        let stored = DBConfig {
            graph_driver: Some("overlay".to_string()),
            ..Default::default()
        };
        assert!(compare(&stored, &config, false).is_ok());
    }

    #[test]
    fn test_symlinked_path_matches() {
        let dir = tempfile::TempDir::new().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let mut config = config_with_dirs(dir.path());
        config.graph_root = link;
        let stored = DBConfig {
            graph_root: Some(real.to_string_lossy().into_owned()),
            ..Default::default()
        };
        // Only graph_root is recorded; everything else is missing, which is
        // fine for this check.
        let result = compare(&stored, &config, false);
        assert!(result.is_ok());
        assert!(PathBuf::from(stored.graph_root.unwrap()).exists());
    }
}
