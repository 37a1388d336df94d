use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ComposerError;

/// Transaction isolation requested when a connection begins a transaction.
///
/// SQLite has no isolation levels of its own; each level picks the lock that
/// `BEGIN` acquires up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    #[must_use]
    pub fn begin_statement(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "BEGIN DEFERRED",
            IsolationLevel::RepeatableRead => "BEGIN IMMEDIATE",
            IsolationLevel::Serializable => "BEGIN EXCLUSIVE",
        }
    }
}

/// Defaults a [`ConnectionManager`](crate::connection::ConnectionManager) starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Database path, or `:memory:`.
    pub connection_string: String,
    /// Busy timeout in milliseconds.
    pub command_timeout_ms: u64,
    pub isolation_level: IsolationLevel,
    /// Reject calls from any thread other than the creating one.
    pub thread_safety_check: bool,
    /// Keep the native handle open across `close` calls.
    pub keep_open: bool,
    /// Redirect connection state to an entered [`ConnectionScope`](crate::connection::ConnectionScope).
    pub use_ambient_scope: bool,
    /// Run `PRAGMA journal_mode = WAL` when the handle opens.
    pub wal: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connection_string: ":memory:".to_string(),
            command_timeout_ms: 30_000,
            isolation_level: IsolationLevel::default(),
            thread_safety_check: true,
            keep_open: false,
            use_ambient_scope: false,
            wal: false,
        }
    }
}

impl ConnectionSettings {
    #[must_use]
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn builder(connection_string: impl Into<String>) -> ConnectionSettingsBuilder {
        ConnectionSettingsBuilder::new(connection_string)
    }

    /// Load settings from a JSON document; absent keys keep their defaults.
    ///
    /// # Errors
    /// Returns `ComposerError::ConfigError` if the document does not parse.
    pub fn from_json(json: &str) -> Result<Self, ComposerError> {
        Ok(serde_json::from_str(json)?)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Fluent builder for [`ConnectionSettings`].
#[derive(Debug, Clone)]
pub struct ConnectionSettingsBuilder {
    settings: ConnectionSettings,
}

impl ConnectionSettingsBuilder {
    #[must_use]
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            settings: ConnectionSettings::new(connection_string),
        }
    }

    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.settings.command_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.settings.isolation_level = level;
        self
    }

    #[must_use]
    pub fn thread_safety_check(mut self, enabled: bool) -> Self {
        self.settings.thread_safety_check = enabled;
        self
    }

    #[must_use]
    pub fn keep_open(mut self, keep_open: bool) -> Self {
        self.settings.keep_open = keep_open;
        self
    }

    #[must_use]
    pub fn use_ambient_scope(mut self, enabled: bool) -> Self {
        self.settings.use_ambient_scope = enabled;
        self
    }

    #[must_use]
    pub fn wal(mut self, enabled: bool) -> Self {
        self.settings.wal = enabled;
        self
    }

    #[must_use]
    pub fn finish(self) -> ConnectionSettings {
        self.settings
    }
}
