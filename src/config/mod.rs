//! # Configuration
//!
//! Application and datasource configuration, read from a JSON file
//! (`westore.json` by convention), plus loading of the model directory.

mod loader;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use loader::load_model_dir;

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Datasource used by models without an explicit mapping
pub const DEFAULT_DATASOURCE: &str = "db";

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Mount point of the REST surface (default: "/api/v1")
    #[serde(default = "default_rest_api_root")]
    pub rest_api_root: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// HS256 secret for bearer tokens
    #[serde(default)]
    pub jwt_secret_key: String,

    /// Turn off the read-through cache for every model
    #[serde(default)]
    pub disable_cache: bool,

    /// Fail instead of warn when a single-kind relation yields two documents
    #[serde(default)]
    pub strict_single_related_document_check: bool,

    /// Directory of model definitions, relative to the config file
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    #[serde(default)]
    pub datasources: BTreeMap<String, DatasourceConfig>,

    /// Model name to datasource name
    #[serde(default)]
    pub model_datasources: BTreeMap<String, String>,
}

fn default_rest_api_root() -> String {
    "/api/v1".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rest_api_root: default_rest_api_root(),
            host: default_host(),
            port: default_port(),
            jwt_secret_key: String::new(),
            disable_cache: false,
            strict_single_related_document_check: false,
            models_dir: default_models_dir(),
            datasources: BTreeMap::new(),
            model_datasources: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Read a config file. A relative `modelsDir` is resolved against the
    /// file's directory; datasource names default to their map keys.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: AppConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        if config.models_dir.is_relative() {
            if let Some(base) = path.parent() {
                config.models_dir = base.join(&config.models_dir);
            }
        }
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        for (key, datasource) in self.datasources.iter_mut() {
            if datasource.name.is_empty() {
                datasource.name = key.clone();
            }
        }
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.rest_api_root.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "restApiRoot must start with '/': {}",
                self.rest_api_root
            )));
        }
        for (model, datasource) in &self.model_datasources {
            if !self.datasources.contains_key(datasource) {
                return Err(ConfigError::Invalid(format!(
                    "model {model} refers to unknown datasource {datasource}"
                )));
            }
        }
        Ok(())
    }

    /// Datasource name a model is bound to
    pub fn datasource_for(&self, model: &str) -> &str {
        self.model_datasources
            .get(model)
            .map(String::as_str)
            .unwrap_or(DEFAULT_DATASOURCE)
    }

    /// Get the socket address string
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connector implementations selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    DocumentStore,
    MemoryKv,
    Memory,
}

/// One datasource entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceConfig {
    #[serde(default)]
    pub name: String,
    pub connector: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<f32>,
}

impl DatasourceConfig {
    /// Parse the `connector` field; `None` for unknown names
    pub fn connector_kind(&self) -> Option<ConnectorKind> {
        match self.connector.as_str() {
            "documentStore" | "mongodb" => Some(ConnectorKind::DocumentStore),
            "memorykv" => Some(ConnectorKind::MemoryKv),
            "memory" => Some(ConnectorKind::Memory),
            _ => None,
        }
    }
}
