//! Host-side update runner: prerequisite checks and the process loop.

use std::collections::BTreeMap;
use std::fmt;

use semver::Version;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::db::Storage;
use crate::error::{AppError, AppResult};
use crate::migrate::{Engine, MigrationError};

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("no extension key set for the updater")]
    NoExtensionKey,
    #[error("extension {key} is not loaded")]
    ExtensionNotLoaded { key: String },
    #[error("extension {key} is at version {found}, the updater requires {required} or later")]
    IncorrectExtensionVersion {
        key: String,
        found: Version,
        required: Version,
    },
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

impl UpdateError {
    pub fn code(&self) -> &'static str {
        match self {
            UpdateError::NoExtensionKey => "UPDATE/NO_EXTENSION_KEY",
            UpdateError::ExtensionNotLoaded { .. } => "UPDATE/EXTENSION_NOT_LOADED",
            UpdateError::IncorrectExtensionVersion { .. } => "UPDATE/INCORRECT_VERSION",
            UpdateError::Migration(err) => err.code(),
        }
    }
}

/// Answers which extensions are loaded, and at what version.
pub trait ExtensionRegistry {
    fn version(&self, key: &str) -> Option<Version>;

    fn is_loaded(&self, key: &str) -> bool {
        self.version(key).is_some()
    }
}

/// Fixed registry, usually filled from a plan file.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    loaded: BTreeMap<String, Version>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, version: Version) -> Self {
        self.loaded.insert(key.into(), version);
        self
    }
}

impl FromIterator<(String, Version)> for StaticRegistry {
    fn from_iter<I: IntoIterator<Item = (String, Version)>>(iter: I) -> Self {
        Self {
            loaded: iter.into_iter().collect(),
        }
    }
}

impl ExtensionRegistry for StaticRegistry {
    fn version(&self, key: &str) -> Option<Version> {
        self.loaded.get(key).cloned()
    }
}

/// True when at least one table belonging to extension `key` exists.
pub fn extension_tables_exist(storage: &mut dyn Storage, key: &str) -> Result<bool, UpdateError> {
    let prefix = format!("tx_{key}");
    Ok(storage
        .list_tables()?
        .iter()
        .any(|table| table.starts_with(&prefix)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prerequisites {
    pub extension_key: String,
    /// Extension whose data is migrated; the extension itself when `None`.
    pub source_extension_key: Option<String>,
    pub source_min_version: Version,
    /// Accept an unloaded source extension as long as its tables are still present.
    pub override_source_requirement: bool,
}

impl Prerequisites {
    pub fn new(extension_key: impl Into<String>) -> Self {
        Self {
            extension_key: extension_key.into(),
            source_extension_key: None,
            source_min_version: Version::new(0, 0, 0),
            override_source_requirement: false,
        }
    }

    pub fn source(mut self, key: impl Into<String>, min_version: Version) -> Self {
        self.source_extension_key = Some(key.into());
        self.source_min_version = min_version;
        self
    }

    pub fn override_source_requirement(mut self, enabled: bool) -> Self {
        self.override_source_requirement = enabled;
        self
    }

    pub fn source_key(&self) -> &str {
        self.source_extension_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .unwrap_or(&self.extension_key)
    }

    pub fn check(
        &self,
        registry: &dyn ExtensionRegistry,
        storage: &mut dyn Storage,
    ) -> Result<(), UpdateError> {
        if self.extension_key.is_empty() {
            return Err(UpdateError::NoExtensionKey);
        }
        let source = self.source_key();
        if source == self.extension_key {
            return Ok(());
        }

        let Some(found) = registry.version(source) else {
            if self.override_source_requirement && extension_tables_exist(storage, source)? {
                warn!(
                    target: "extupdate",
                    event = "source_requirement_overridden",
                    extension = source
                );
                return Ok(());
            }
            return Err(UpdateError::ExtensionNotLoaded {
                key: source.to_string(),
            });
        };
        if found < self.source_min_version {
            return Err(UpdateError::IncorrectExtensionVersion {
                key: source.to_string(),
                found,
                required: self.source_min_version.clone(),
            });
        }
        Ok(())
    }
}

pub trait Updater {
    /// Runs one pass of pending work. Returns `true` once nothing is left to do.
    fn process_updates(&mut self, engine: &mut Engine<'_>) -> AppResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// One pass per invocation; the operator reruns until complete.
    Single,
    #[default]
    UntilComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateMessage {
    pub severity: Severity,
    pub title: String,
    pub body: String,
}

impl fmt::Display for UpdateMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title, self.body)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateReport {
    pub passes: u32,
    pub complete: bool,
    pub messages: Vec<UpdateMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
}

impl UpdateReport {
    pub fn push(&mut self, severity: Severity, title: impl Into<String>, body: impl Into<String>) {
        self.messages.push(UpdateMessage {
            severity,
            title: title.into(),
            body: body.into(),
        });
    }

    pub fn failed(&self) -> bool {
        self.messages.iter().any(|m| m.severity == Severity::Error)
    }
}

pub const TITLE_COMPLETE: &str = "Update complete";
pub const TITLE_RUN_AGAIN: &str = "Run updater again";
pub const TITLE_FAILED: &str = "Update failed";

/// Checks prerequisites, then drives `updater` according to `mode`. Failures end up
/// in the report rather than the return value.
pub fn run_update(
    updater: &mut dyn Updater,
    engine: &mut Engine<'_>,
    prerequisites: &Prerequisites,
    registry: &dyn ExtensionRegistry,
    mode: RunMode,
) -> UpdateReport {
    let mut report = UpdateReport::default();
    let outcome = drive(updater, engine, prerequisites, registry, mode, &mut report);
    match outcome {
        Ok(true) => {
            report.complete = true;
            info!(target: "extupdate", event = "update_complete", passes = report.passes);
            report.push(
                Severity::Success,
                TITLE_COMPLETE,
                "The updater has finished all of its tasks, it does not need to run again until the next extension update.",
            );
        }
        Ok(false) => {
            info!(target: "extupdate", event = "update_incomplete", passes = report.passes);
            report.push(
                Severity::Warning,
                TITLE_RUN_AGAIN,
                "Run the updater again to continue updating, until this message disappears.",
            );
        }
        Err(err) => {
            error!(
                target: "extupdate",
                event = "update_failed",
                code = %err.code(),
                error = %err
            );
            report.push(Severity::Error, TITLE_FAILED, err.to_string());
            report.error = Some(err);
        }
    }
    report
}

fn drive(
    updater: &mut dyn Updater,
    engine: &mut Engine<'_>,
    prerequisites: &Prerequisites,
    registry: &dyn ExtensionRegistry,
    mode: RunMode,
    report: &mut UpdateReport,
) -> AppResult<bool> {
    prerequisites.check(registry, engine.storage())?;
    loop {
        report.passes += 1;
        let finished = updater.process_updates(engine)?;
        if finished || mode == RunMode::Single {
            return Ok(finished);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStorage;

    struct Countdown(u32);

    impl Updater for Countdown {
        fn process_updates(&mut self, _engine: &mut Engine<'_>) -> AppResult<bool> {
            self.0 = self.0.saturating_sub(1);
            Ok(self.0 == 0)
        }
    }

    fn storage() -> SqliteStorage {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .connection()
            .execute_batch("CREATE TABLE tx_oldnews_item (uid INTEGER PRIMARY KEY);")
            .unwrap();
        storage
    }

    #[test]
    fn same_source_needs_no_registry() {
        let mut storage = storage();
        Prerequisites::new("news")
            .check(&StaticRegistry::new(), &mut storage)
            .unwrap();
    }

    #[test]
    fn empty_key_is_rejected() {
        let mut storage = storage();
        let err = Prerequisites::new("")
            .check(&StaticRegistry::new(), &mut storage)
            .unwrap_err();
        assert!(matches!(err, UpdateError::NoExtensionKey));
    }

    #[test]
    fn unloaded_source_needs_override_and_tables() {
        let mut storage = storage();
        let prereq = Prerequisites::new("news").source("oldnews", Version::new(1, 0, 0));
        let err = prereq.check(&StaticRegistry::new(), &mut storage).unwrap_err();
        assert!(matches!(err, UpdateError::ExtensionNotLoaded { .. }));

        let prereq = prereq.override_source_requirement(true);
        prereq.check(&StaticRegistry::new(), &mut storage).unwrap();

        let missing = Prerequisites::new("news")
            .source("gone", Version::new(1, 0, 0))
            .override_source_requirement(true);
        assert!(missing.check(&StaticRegistry::new(), &mut storage).is_err());
    }

    #[test]
    fn old_source_version_is_rejected() {
        let mut storage = storage();
        let prereq = Prerequisites::new("news").source("oldnews", Version::new(2, 1, 0));
        let registry = StaticRegistry::new().with("oldnews", Version::new(2, 0, 9));
        let err = prereq.check(&registry, &mut storage).unwrap_err();
        assert_eq!(err.code(), "UPDATE/INCORRECT_VERSION");

        let registry = StaticRegistry::new().with("oldnews", Version::new(2, 1, 0));
        prereq.check(&registry, &mut storage).unwrap();
    }

    #[test]
    fn until_complete_loops_and_single_stops() {
        let mut storage = storage();
        let mut engine = Engine::new(&mut storage);
        let prereq = Prerequisites::new("news");

        let report = run_update(
            &mut Countdown(3),
            &mut engine,
            &prereq,
            &StaticRegistry::new(),
            RunMode::UntilComplete,
        );
        assert!(report.complete);
        assert_eq!(report.passes, 3);
        assert_eq!(report.messages[0].title, TITLE_COMPLETE);

        let report = run_update(
            &mut Countdown(3),
            &mut engine,
            &prereq,
            &StaticRegistry::new(),
            RunMode::Single,
        );
        assert!(!report.complete);
        assert_eq!(report.messages[0].title, TITLE_RUN_AGAIN);
        assert!(!report.failed());
    }

    #[test]
    fn failed_prerequisites_are_reported() {
        let mut storage = storage();
        let mut engine = Engine::new(&mut storage);
        let prereq = Prerequisites::new("news").source("absent", Version::new(1, 0, 0));
        let report = run_update(
            &mut Countdown(1),
            &mut engine,
            &prereq,
            &StaticRegistry::new(),
            RunMode::UntilComplete,
        );
        assert!(report.failed());
        assert_eq!(report.passes, 0);
        assert_eq!(report.messages[0].title, TITLE_FAILED);
        assert_eq!(
            report.error.as_ref().map(AppError::code),
            Some("UPDATE/EXTENSION_NOT_LOADED")
        );
    }
}
