use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use crate::config::ConfigError;
use crate::migrate::MigrationError;
use crate::updater::UpdateError;
use anyhow::Error as AnyhowError;
use rusqlite::Error as SqliteError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use std::io::Error as IoError;

/// A structured application error that can be serialized and reported by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code.
    pub code: String,
    /// Human friendly message that can be shown directly to the operator.
    pub message: String,
    /// Arbitrary key/value pairs that provide additional context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;
pub type Result<T> = AppResult<T>;

impl AppError {
    /// Default code used when an upstream error does not expose a specific code.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    /// Code used for errors created from free-form messages.
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";

    /// Construct a new application error with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    /// Returns the error code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the contextual metadata associated with the error.
    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    /// Returns the nested cause if one is present.
    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Extends the context map with additional key/value pairs.
    pub fn with_contexts<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.context
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets the nested cause for the error.
    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }

            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else if error.is_io() {
            "JSON/IO"
        } else {
            "JSON/ERROR"
        };

        let mut app_error = AppError::new(code, error.to_string());
        let line = error.line();
        if line > 0 {
            app_error = app_error.with_context("line", line.to_string());
        }
        let column = error.column();
        if column > 0 {
            app_error = app_error.with_context("column", column.to_string());
        }
        app_error
    }
}

impl From<SqliteError> for AppError {
    fn from(error: SqliteError) -> Self {
        match error {
            SqliteError::QueryReturnedNoRows => {
                AppError::new("SQLITE/NO_ROWS", "Query returned no rows")
            }
            SqliteError::SqliteFailure(failure, message) => {
                let code = format!("SQLITE/{:?}", failure.code);
                let message = message.unwrap_or_else(|| failure.to_string());
                AppError::new(code, message)
                    .with_context("extended_code", failure.extended_code.to_string())
            }
            SqliteError::InvalidColumnName(name) => AppError::new(
                "SQLITE/INVALID_COLUMN",
                format!("Column not found: {name}"),
            ),
            other => AppError::new("SQLITE/ERROR", other.to_string()),
        }
    }
}

impl From<MigrationError> for AppError {
    fn from(error: MigrationError) -> Self {
        let code = error.code();
        let message = error.to_string();
        match error {
            MigrationError::Database(err) => {
                AppError::new(code, message).with_cause(AppError::from(err))
            }
            MigrationError::NoData { table }
            | MigrationError::NoUniqueData { table }
            | MigrationError::MissingDocumentRoot { table } => {
                AppError::new(code, message).with_context("table", table)
            }
            MigrationError::StorageQueryFailed { query, .. } => {
                AppError::new(code, message).with_context("query", query)
            }
            MigrationError::UidReferenceOverlap {
                table,
                property,
                source_value,
                target_value,
            } => AppError::new(code, message).with_contexts([
                ("table", table),
                ("property", property),
                ("source_value", source_value.to_string()),
                ("target_value", target_value.to_string()),
            ]),
            MigrationError::DeduplicationMismatch { table, tuple } => {
                AppError::new(code, message).with_contexts([("table", table), ("tuple", tuple)])
            }
            MigrationError::FileDoesNotExist { path } => {
                AppError::new(code, message).with_context("path", path)
            }
            MigrationError::NotInDocumentRoot { path, root } => {
                AppError::new(code, message).with_contexts([("path", path), ("root", root)])
            }
        }
    }
}

impl From<UpdateError> for AppError {
    fn from(error: UpdateError) -> Self {
        match error {
            UpdateError::Migration(err) => AppError::from(err),
            UpdateError::ExtensionNotLoaded { ref key } => {
                let key = key.clone();
                AppError::new(error.code(), error.to_string()).with_context("extension", key)
            }
            UpdateError::IncorrectExtensionVersion { ref key, .. } => {
                let key = key.clone();
                AppError::new(error.code(), error.to_string()).with_context("extension", key)
            }
            UpdateError::NoExtensionKey => AppError::new(error.code(), error.to_string()),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(error: ConfigError) -> Self {
        let app_error = AppError::new(error.code(), error.to_string());
        match error {
            ConfigError::Parse(err) => app_error.with_cause(AppError::from(err)),
            ConfigError::Read { source, .. } => app_error.with_cause(AppError::from(source)),
            ConfigError::ZeroLimit { step }
            | ConfigError::EmptyProperties { step }
            | ConfigError::MissingDocumentRoot { step } => {
                app_error.with_context("step", step.to_string())
            }
            _ => app_error,
        }
    }
}
