//! Model directory loader
//!
//! Every `*.json` file in the directory holds one model definition.
//! Other files are skipped; unreadable or malformed files fail the load.

use std::fs;
use std::path::Path;

use super::{ConfigError, ConfigResult};
use crate::model::ModelConfig;

/// Load every model definition under `dir`, ordered by file name
pub fn load_model_dir(dir: &Path) -> ConfigResult<Vec<ModelConfig>> {
    let entries = fs::read_dir(dir).map_err(|source| ConfigError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let path = entry.path();

        // Skip non-JSON files
        if path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        paths.push(path);
    }
    paths.sort();

    paths.iter().map(|path| load_model_file(path)).collect()
}

fn load_model_file(path: &Path) -> ConfigResult<ModelConfig> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let config: ModelConfig = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    if config.name.trim().is_empty() {
        return Err(ConfigError::Parse {
            path: path.display().to_string(),
            message: "model name is required".to_string(),
        });
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(name), content).unwrap();
    }

    #[test]
    fn test_loads_json_files_in_name_order() {
        let dir = TempDir::new().unwrap();
        write(&dir, "note.json", r#"{"name": "Note"}"#);
        write(&dir, "account.json", r#"{"name": "Account", "hidden": ["password"]}"#);
        write(&dir, "README.md", "not a model");

        let models = load_model_dir(dir.path()).unwrap();
        let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Account", "Note"]);
        assert_eq!(models[0].hidden, vec!["password".to_string()]);
    }

    #[test]
    fn test_malformed_file_fails() {
        let dir = TempDir::new().unwrap();
        write(&dir, "broken.json", "{ nope");

        let err = load_model_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_name_fails() {
        let dir = TempDir::new().unwrap();
        write(&dir, "anon.json", r#"{"name": ""}"#);

        assert!(load_model_dir(dir.path()).is_err());
    }

    #[test]
    fn test_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let err = load_model_dir(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
