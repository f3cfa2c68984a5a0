//! Options for opening a [`crate::Connection`].

use serde::{Deserialize, Serialize};
use websql_core::{ConfigError, Error, Result};
use websql_sqlite::{DEFAULT_MAX_SIZE, SqliteConfig, Storage};

/// Version recorded when none is given.
pub const DEFAULT_VERSION: &str = "1.0";

const MISSING_NAME: &str = "WebSQL database name is missing";

/// Database identity and limits.
///
/// Empty values fall back to their defaults: an empty `version` means
/// `"1.0"`, an empty or absent `display_name` means the name, and a zero
/// `max_size` means 50 MiB.
///
/// ```
/// use websql::ConnectionOptions;
///
/// let options = ConnectionOptions::from_json(r#"{"name": "app", "maxSize": 1048576}"#)
///     .unwrap();
/// assert_eq!(options.version(), "1.0");
/// assert_eq!(options.display_name(), "app");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, alias = "display_name", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, alias = "max_size")]
    pub max_size: u64,
    #[serde(default)]
    pub storage: Storage,
    /// Ask the engine for a native abort instead of a failing statement.
    #[serde(default, alias = "native_abort")]
    pub native_abort: bool,
    #[serde(default, alias = "busy_timeout_ms", skip_serializing_if = "Option::is_none")]
    pub busy_timeout_ms: Option<u32>,
}

impl ConnectionOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: DEFAULT_VERSION.to_string(),
            display_name: None,
            max_size: DEFAULT_MAX_SIZE,
            storage: Storage::Memory,
            native_abort: false,
            busy_timeout_ms: None,
        }
    }

    /// Parse options from a JSON object.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid connection options: {e}"),
            })
        })
    }

    pub fn version(&self) -> &str {
        if self.version.is_empty() {
            DEFAULT_VERSION
        } else {
            &self.version
        }
    }

    pub fn display_name(&self) -> &str {
        match self.display_name.as_deref() {
            Some(display) if !display.is_empty() => display,
            _ => &self.name,
        }
    }

    /// The storage quota in bytes.
    pub fn max_size(&self) -> u64 {
        if self.max_size == 0 {
            DEFAULT_MAX_SIZE
        } else {
            self.max_size
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    #[must_use]
    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_size = bytes;
        self
    }

    #[must_use]
    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = storage;
        self
    }

    #[must_use]
    pub fn with_native_abort(mut self, enabled: bool) -> Self {
        self.native_abort = enabled;
        self
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = Some(ms);
        self
    }

    /// Reject options no database can be opened with.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config(ConfigError {
                message: MISSING_NAME.to_string(),
            }));
        }
        Ok(())
    }

    /// Resolve defaults into an engine configuration.
    pub fn to_sqlite_config(&self) -> Result<SqliteConfig> {
        self.validate()?;
        let mut config = SqliteConfig::new(self.name.clone())
            .version(self.version())
            .display_name(self.display_name())
            .max_size(self.max_size())
            .storage(self.storage.clone())
            .native_abort(self.native_abort);
        if let Some(ms) = self.busy_timeout_ms {
            config = config.busy_timeout(ms);
        }
        Ok(config)
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::new(String::new())
    }
}
