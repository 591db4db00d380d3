//! Stack configuration.
//!
//! Settings live in `Stack.<stack>.toml` under a `[config]` table. Plain
//! values are TOML scalars; secrets are written as `{ secure = "..." }`.
//! Keys may carry a project namespace (`cart-stack:mongo_port`), which is
//! stripped on load.

use crate::sensitive::Sensitive;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No configuration found for stack '{stack}' at {path}")]
    StoreNotFound { stack: String, path: String },

    #[error("Missing required configuration key '{key}' for stack '{stack}'")]
    Missing { key: String, stack: String },

    #[error("Invalid value for configuration key '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Only the position is kept; the parser's message quotes the source
    /// line, which may hold a secret.
    #[error("Failed to parse configuration {}", location(.position))]
    Parse { position: Option<(usize, usize)> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn location(position: &Option<(usize, usize)>) -> String {
    match position {
        Some((line, column)) => format!("at line {}, column {}", line, column),
        None => "(position unknown)".to_string(),
    }
}

/// 1-based line and column of a byte offset
fn line_column(content: &str, offset: usize) -> (usize, usize) {
    let before = &content[..offset.min(content.len())];
    let line = before.matches('\n').count() + 1;
    let column = before.rfind('\n').map_or(before.len(), |nl| before.len() - nl - 1) + 1;
    (line, column)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ConfigValue {
    Secure { secure: Sensitive<String> },
    Plain(toml::Value),
}

#[derive(Debug, Deserialize)]
struct StackFile {
    #[serde(default)]
    config: BTreeMap<String, ConfigValue>,
}

/// Key-value settings scoped to a single stack
#[derive(Debug, Clone)]
pub struct ConfigStore {
    stack: String,
    values: BTreeMap<String, ConfigValue>,
}

impl ConfigStore {
    /// File name holding the settings of `stack`
    pub fn file_name(stack: &str) -> String {
        format!("Stack.{}.toml", stack)
    }

    pub fn path_for(dir: &Path, stack: &str) -> PathBuf {
        dir.join(Self::file_name(stack))
    }

    /// Load the store for `stack` from `dir`
    pub fn load(dir: &Path, stack: &str) -> ConfigResult<Self> {
        let path = Self::path_for(dir, stack);
        if !path.is_file() {
            return Err(ConfigError::StoreNotFound {
                stack: stack.to_string(),
                path: path.display().to_string(),
            });
        }

        debug!(path = %path.display(), "Loading stack configuration");
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(stack, &content)
    }

    pub fn from_toml_str(stack: &str, content: &str) -> ConfigResult<Self> {
        let file: StackFile = toml::from_str(content).map_err(|e| ConfigError::Parse {
            position: e.span().map(|span| line_column(content, span.start)),
        })?;
        let values = file
            .config
            .into_iter()
            .map(|(key, value)| (strip_namespace(&key).to_string(), value))
            .collect();

        Ok(Self {
            stack: stack.to_string(),
            values,
        })
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_secret(&self, key: &str) -> bool {
        matches!(self.values.get(key), Some(ConfigValue::Secure { .. }))
    }

    /// Read a plain string setting
    pub fn require(&self, key: &str) -> ConfigResult<String> {
        match self.lookup(key)? {
            ConfigValue::Secure { secure } => {
                warn!(key = %key, "Secret configuration value read as plain text");
                Ok(secure.expose().clone())
            }
            ConfigValue::Plain(value) => scalar_to_string(key, value),
        }
    }

    /// Read an integer setting; numeric strings are accepted
    pub fn require_int(&self, key: &str) -> ConfigResult<i64> {
        match self.lookup(key)? {
            ConfigValue::Plain(toml::Value::Integer(value)) => Ok(*value),
            ConfigValue::Plain(toml::Value::String(value)) => {
                value
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: key.to_string(),
                        message: format!("expected an integer, found \"{}\"", value),
                    })
            }
            ConfigValue::Secure { .. } => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: "expected an integer, found a secret".to_string(),
            }),
            ConfigValue::Plain(other) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected an integer, found {}", other.type_str()),
            }),
        }
    }

    /// Read an integer setting that must be a usable TCP port
    pub fn require_port(&self, key: &str) -> ConfigResult<u16> {
        let value = self.require_int(key)?;
        match u16::try_from(value) {
            Ok(port) if port != 0 => Ok(port),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{} is not a valid port", value),
            }),
        }
    }

    /// Read a setting as a secret, whether or not it was stored as one
    pub fn require_secret(&self, key: &str) -> ConfigResult<Sensitive<String>> {
        match self.lookup(key)? {
            ConfigValue::Secure { secure } => Ok(secure.clone()),
            ConfigValue::Plain(value) => scalar_to_string(key, value).map(Sensitive::new),
        }
    }

    fn lookup(&self, key: &str) -> ConfigResult<&ConfigValue> {
        self.values.get(key).ok_or_else(|| ConfigError::Missing {
            key: key.to_string(),
            stack: self.stack.clone(),
        })
    }
}

fn strip_namespace(key: &str) -> &str {
    key.rsplit_once(':').map_or(key, |(_, name)| name)
}

fn scalar_to_string(key: &str, value: &toml::Value) -> ConfigResult<String> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a scalar, found {}", other.type_str()),
        }),
    }
}

/// Every setting the cart stack needs, resolved once at startup
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub frontend_port: u16,
    pub backend_port: u16,
    pub mongo_port: u16,
    pub mongo_host: String,
    pub database: String,
    pub node_environment: String,
    pub mongo_username: String,
    pub mongo_password: Sensitive<String>,
}

impl StackConfig {
    pub const REQUIRED_KEYS: [&'static str; 8] = [
        "frontend_port",
        "backend_port",
        "mongo_port",
        "mongo_host",
        "database",
        "node_environment",
        "mongo_username",
        "mongo_password",
    ];

    /// Read all required settings, failing on the first absent or invalid one
    pub fn from_store(store: &ConfigStore) -> ConfigResult<Self> {
        let config = Self {
            frontend_port: store.require_port("frontend_port")?,
            backend_port: store.require_port("backend_port")?,
            mongo_port: store.require_port("mongo_port")?,
            mongo_host: store.require("mongo_host")?,
            database: store.require("database")?,
            node_environment: store.require("node_environment")?,
            mongo_username: store.require("mongo_username")?,
            mongo_password: store.require_secret("mongo_password")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(dir: &Path, stack: &str) -> ConfigResult<Self> {
        Self::from_store(&ConfigStore::load(dir, stack)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let text_fields = [
            ("mongo_host", self.mongo_host.as_str()),
            ("database", self.database.as_str()),
            ("node_environment", self.node_environment.as_str()),
            ("mongo_username", self.mongo_username.as_str()),
            ("mongo_password", self.mongo_password.expose().as_str()),
        ];

        for (key, value) in text_fields {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "value cannot be empty".to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[config]
frontend_port = 3001
backend_port = 3000
mongo_port = 27017
mongo_host = "mongo"
database = "cart"
node_environment = "development"
mongo_username = "admin"
mongo_password = { secure = "s3cr3t" }
"#;

    fn without_key(key: &str) -> String {
        FULL.lines()
            .filter(|line| !line.starts_with(&format!("{} ", key)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_full_config() {
        let store = ConfigStore::from_toml_str("dev", FULL).unwrap();
        let config = StackConfig::from_store(&store).unwrap();

        assert_eq!(config.frontend_port, 3001);
        assert_eq!(config.backend_port, 3000);
        assert_eq!(config.mongo_port, 27017);
        assert_eq!(config.mongo_host, "mongo");
        assert_eq!(config.database, "cart");
        assert_eq!(config.node_environment, "development");
        assert_eq!(config.mongo_username, "admin");
        assert_eq!(config.mongo_password.expose(), "s3cr3t");
    }

    #[test]
    fn test_each_missing_key_aborts() {
        for key in StackConfig::REQUIRED_KEYS {
            let store = ConfigStore::from_toml_str("dev", &without_key(key)).unwrap();
            assert!(!store.contains(key));

            match StackConfig::from_store(&store) {
                Err(ConfigError::Missing { key: missing, stack }) => {
                    assert_eq!(missing, key);
                    assert_eq!(stack, "dev");
                }
                other => panic!("expected Missing for {}, got {:?}", key, other),
            }
        }
    }

    #[test]
    fn test_namespaced_keys() {
        let store = ConfigStore::from_toml_str(
            "dev",
            r#"
[config]
"cart-stack:mongo_port" = 27018
"cart-stack:mongo_host" = "db"
"#,
        )
        .unwrap();
        assert_eq!(store.require_port("mongo_port").unwrap(), 27018);
        assert_eq!(store.require("mongo_host").unwrap(), "db");
    }

    #[test]
    fn test_require_int_accepts_numeric_string() {
        let store =
            ConfigStore::from_toml_str("dev", "[config]\nfrontend_port = \"8080\"\n").unwrap();
        assert_eq!(store.require_int("frontend_port").unwrap(), 8080);
    }

    #[test]
    fn test_require_int_rejects_text() {
        let store =
            ConfigStore::from_toml_str("dev", "[config]\nfrontend_port = \"http\"\n").unwrap();
        assert!(matches!(
            store.require_int("frontend_port"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_require_port_range() {
        let store = ConfigStore::from_toml_str(
            "dev",
            "[config]\nzero = 0\nhuge = 70000\nnegative = -1\nok = 65535\n",
        )
        .unwrap();
        assert!(store.require_port("zero").is_err());
        assert!(store.require_port("huge").is_err());
        assert!(store.require_port("negative").is_err());
        assert_eq!(store.require_port("ok").unwrap(), 65535);
    }

    #[test]
    fn test_require_secret_from_plain_value() {
        let store =
            ConfigStore::from_toml_str("dev", "[config]\nmongo_password = \"plain\"\n").unwrap();
        assert!(!store.is_secret("mongo_password"));
        let secret = store.require_secret("mongo_password").unwrap();
        assert_eq!(secret.expose(), "plain");
    }

    #[test]
    fn test_secret_is_not_in_debug_output() {
        let store = ConfigStore::from_toml_str("dev", FULL).unwrap();
        assert!(store.is_secret("mongo_password"));
        let config = StackConfig::from_store(&store).unwrap();
        assert!(!format!("{:?}", config).contains("s3cr3t"));
    }

    #[test]
    fn test_empty_value_rejected() {
        let content = FULL.replace("mongo_host = \"mongo\"", "mongo_host = \"\"");
        let store = ConfigStore::from_toml_str("dev", &content).unwrap();
        match StackConfig::from_store(&store) {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "mongo_host"),
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(ConfigStore::path_for(dir.path(), "staging"), FULL).unwrap();

        let config = StackConfig::load(dir.path(), "staging").unwrap();
        assert_eq!(config.mongo_username, "admin");

        let missing = StackConfig::load(dir.path(), "prod");
        assert!(matches!(missing, Err(ConfigError::StoreNotFound { .. })));
    }

    #[test]
    fn test_invalid_toml() {
        let result = ConfigStore::from_toml_str("dev", "[config\nbroken");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_parse_error_does_not_quote_secret() {
        let err = ConfigStore::from_toml_str(
            "dev",
            "[config]\nmongo_password = { secure = \"hunter2\" \n",
        )
        .unwrap_err();

        let rendered = err.to_string();
        assert!(!rendered.contains("hunter2"), "{}", rendered);
        assert!(!format!("{:?}", err).contains("hunter2"));
        match err {
            ConfigError::Parse {
                position: Some((line, _)),
            } => assert!(line >= 2),
            other => panic!("expected Parse with a position, got {:?}", other),
        }
    }

    #[test]
    fn test_store_debug_redacts_secure_values() {
        let store = ConfigStore::from_toml_str("dev", FULL).unwrap();
        let rendered = format!("{:?}", store);
        assert!(!rendered.contains("s3cr3t"), "{}", rendered);
        assert!(rendered.contains("mongo_password"));
    }

    #[test]
    fn test_line_column() {
        let content = "[config]\nkey = 1\n";
        assert_eq!(line_column(content, 0), (1, 1));
        assert_eq!(line_column(content, 9), (2, 1));
        assert_eq!(line_column(content, 13), (2, 5));
    }
}
