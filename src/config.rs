use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use semver::Version;
use serde::Deserialize;
use thiserror::Error;

use crate::migrate::{ColumnMap, Conditions, PivotSide, PropertyMap, DEFAULT_MARKER};
use crate::updater::{Prerequisites, StaticRegistry};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("plan file not found: {0}")]
    Missing(String),
    #[error("failed to read plan {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse plan: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("plan has no steps")]
    EmptySteps,
    #[error("step {step} has a zero limit")]
    ZeroLimit { step: usize },
    #[error("step {step} maps no properties")]
    EmptyProperties { step: usize },
    #[error("invalid version {value:?} for {key}: {source}")]
    InvalidVersion {
        key: String,
        value: String,
        #[source]
        source: semver::Error,
    },
    #[error("step {step} resolves file paths but the plan has no document_root")]
    MissingDocumentRoot { step: usize },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Missing(_) => "CONFIG/MISSING",
            ConfigError::Read { .. } => "CONFIG/READ",
            ConfigError::Parse(_) => "CONFIG/PARSE",
            ConfigError::EmptySteps => "CONFIG/EMPTY_STEPS",
            ConfigError::ZeroLimit { .. } => "CONFIG/ZERO_LIMIT",
            ConfigError::EmptyProperties { .. } => "CONFIG/EMPTY_PROPERTIES",
            ConfigError::InvalidVersion { .. } => "CONFIG/INVALID_VERSION",
            ConfigError::MissingDocumentRoot { .. } => "CONFIG/MISSING_DOCUMENT_ROOT",
        }
    }
}

fn default_marker() -> String {
    DEFAULT_MARKER.to_string()
}

fn default_flag() -> String {
    "migrated".to_string()
}

fn default_reference_limit() -> usize {
    100
}

fn default_delete_limit() -> usize {
    5000
}

fn default_unique_limit() -> usize {
    10000
}

fn default_strict() -> bool {
    true
}

/// Write each created record's uid back onto the rows holding its value tuple.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssignConfig {
    pub table: String,
    pub property: String,
}

/// Apply a delete-source call's uid map to a referencing column.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemapConfig {
    pub table: String,
    pub property: String,
    #[serde(default = "default_strict")]
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepConfig {
    UniqueRecords {
        source: String,
        target: String,
        properties: ColumnMap,
        #[serde(default)]
        conditions: Conditions,
        #[serde(default = "default_unique_limit")]
        limit: usize,
        #[serde(default)]
        assign: Option<AssignConfig>,
    },
    MigrateWithReferenceUid {
        source: String,
        target: String,
        properties: PropertyMap,
        #[serde(default = "default_marker")]
        reference_property: String,
        #[serde(default)]
        conditions: Conditions,
        #[serde(default = "default_reference_limit")]
        limit: usize,
    },
    MigrateAndDeleteSource {
        source: String,
        target: String,
        properties: PropertyMap,
        #[serde(default = "default_delete_limit")]
        limit: usize,
        #[serde(default)]
        remap: Vec<RemapConfig>,
    },
    MigrateMmWithReferenceUid {
        source: String,
        target: String,
        local: PivotSide,
        foreign: PivotSide,
        #[serde(default)]
        properties: PropertyMap,
        #[serde(default = "default_flag")]
        flag_property: String,
        #[serde(default = "default_reference_limit")]
        limit: usize,
    },
    MigrateMmAndDeleteSource {
        source: String,
        target: String,
        properties: PropertyMap,
        #[serde(default = "default_delete_limit")]
        limit: usize,
    },
    /// Turn a column of file paths into file-object uids.
    ResolveFilePaths {
        table: String,
        path_property: String,
        file_property: String,
        #[serde(default)]
        conditions: Conditions,
        #[serde(default = "default_reference_limit")]
        limit: usize,
    },
    SetProperty {
        table: String,
        property: String,
        value: serde_json::Value,
        #[serde(default)]
        conditions: Conditions,
    },
}

impl StepConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            StepConfig::UniqueRecords { .. } => "unique_records",
            StepConfig::MigrateWithReferenceUid { .. } => "migrate_with_reference_uid",
            StepConfig::MigrateAndDeleteSource { .. } => "migrate_and_delete_source",
            StepConfig::MigrateMmWithReferenceUid { .. } => "migrate_mm_with_reference_uid",
            StepConfig::MigrateMmAndDeleteSource { .. } => "migrate_mm_and_delete_source",
            StepConfig::ResolveFilePaths { .. } => "resolve_file_paths",
            StepConfig::SetProperty { .. } => "set_property",
        }
    }

    fn limit(&self) -> Option<usize> {
        match self {
            StepConfig::UniqueRecords { limit, .. }
            | StepConfig::MigrateWithReferenceUid { limit, .. }
            | StepConfig::MigrateAndDeleteSource { limit, .. }
            | StepConfig::MigrateMmWithReferenceUid { limit, .. }
            | StepConfig::MigrateMmAndDeleteSource { limit, .. }
            | StepConfig::ResolveFilePaths { limit, .. } => Some(*limit),
            StepConfig::SetProperty { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanConfig {
    pub extension: String,
    #[serde(default)]
    pub source_extension: Option<String>,
    #[serde(default)]
    pub source_min_version: Option<String>,
    /// Extension key to installed version.
    #[serde(default)]
    pub loaded_extensions: BTreeMap<String, String>,
    #[serde(default)]
    pub document_root: Option<PathBuf>,
    pub steps: Vec<StepConfig>,
}

impl PlanConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::Missing(path.display().to_string()));
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let plan: PlanConfig = serde_json::from_str(text)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.steps.is_empty() {
            return Err(ConfigError::EmptySteps);
        }
        self.min_version()?;
        self.registry()?;

        for (step, config) in self.steps.iter().enumerate() {
            if config.limit() == Some(0) {
                return Err(ConfigError::ZeroLimit { step });
            }
            let empty = match config {
                StepConfig::UniqueRecords { properties, .. } => properties.is_empty(),
                StepConfig::MigrateAndDeleteSource { properties, .. }
                | StepConfig::MigrateMmAndDeleteSource { properties, .. } => properties.is_empty(),
                _ => false,
            };
            if empty {
                return Err(ConfigError::EmptyProperties { step });
            }
            if matches!(config, StepConfig::ResolveFilePaths { .. }) && self.document_root.is_none()
            {
                return Err(ConfigError::MissingDocumentRoot { step });
            }
        }
        Ok(())
    }

    fn min_version(&self) -> Result<Version, ConfigError> {
        match &self.source_min_version {
            Some(value) => parse_version("source_min_version", value),
            None => Ok(Version::new(0, 0, 0)),
        }
    }

    pub fn prerequisites(
        &self,
        override_source_requirement: bool,
    ) -> Result<Prerequisites, ConfigError> {
        Ok(Prerequisites {
            extension_key: self.extension.clone(),
            source_extension_key: self.source_extension.clone(),
            source_min_version: self.min_version()?,
            override_source_requirement,
        })
    }

    pub fn registry(&self) -> Result<StaticRegistry, ConfigError> {
        self.loaded_extensions
            .iter()
            .map(|(key, value)| Ok((key.clone(), parse_version(key, value)?)))
            .collect()
    }
}

fn parse_version(key: &str, value: &str) -> Result<Version, ConfigError> {
    Version::parse(value).map_err(|source| ConfigError::InvalidVersion {
        key: key.to_string(),
        value: value.to_string(),
        source,
    })
}
