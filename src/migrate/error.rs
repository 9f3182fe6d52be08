use thiserror::Error;

pub type MigrationResult<T> = std::result::Result<T, MigrationError>;

#[derive(Debug, Error)]
pub enum MigrationError {
    /// Nothing left to migrate; hosts treat this as success.
    #[error("no data to migrate from {table}")]
    NoData { table: String },
    /// No value tuples found to build unique records from.
    #[error("no unique data to create records in {table}")]
    NoUniqueData { table: String },
    #[error("storage query failed: {reason} [{query}]")]
    StorageQueryFailed { query: String, reason: String },
    /// A remapped uid would land above the uid it replaces, so later remaps could
    /// overwrite rows that are not migrated yet. Needs operator intervention.
    #[error(
        "uid reference overlap in {table}.{property}: {source_value} would become {target_value}"
    )]
    UidReferenceOverlap {
        table: String,
        property: String,
        source_value: i64,
        target_value: i64,
    },
    #[error("existing record in {table} does not match any expected value tuple: {tuple}")]
    DeduplicationMismatch { table: String, tuple: String },
    #[error("file does not exist: {path}")]
    FileDoesNotExist { path: String },
    #[error("file {path} is not inside document root {root}")]
    NotInDocumentRoot { path: String, root: String },
    #[error("no document root configured to resolve file paths in {table}")]
    MissingDocumentRoot { table: String },
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl MigrationError {
    pub fn query_failed(query: &str, reason: impl std::fmt::Display) -> Self {
        MigrationError::StorageQueryFailed {
            query: query.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for the empty-selection signals that mean the work is already done.
    pub fn is_nothing_to_do(&self) -> bool {
        matches!(
            self,
            MigrationError::NoData { .. } | MigrationError::NoUniqueData { .. }
        )
    }

    /// Errors that must stop the whole update rather than a single step.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrationError::UidReferenceOverlap { .. }
                | MigrationError::DeduplicationMismatch { .. }
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            MigrationError::NoData { .. } => "MIGRATE/NO_DATA",
            MigrationError::NoUniqueData { .. } => "MIGRATE/NO_UNIQUE_DATA",
            MigrationError::StorageQueryFailed { .. } => "MIGRATE/STORAGE_QUERY",
            MigrationError::UidReferenceOverlap { .. } => "MIGRATE/UID_OVERLAP",
            MigrationError::DeduplicationMismatch { .. } => "MIGRATE/DEDUP_MISMATCH",
            MigrationError::FileDoesNotExist { .. } => "FILE/NOT_FOUND",
            MigrationError::NotInDocumentRoot { .. } => "FILE/OUTSIDE_ROOT",
            MigrationError::MissingDocumentRoot { .. } => "FILE/NO_DOCUMENT_ROOT",
            MigrationError::Database(_) => "MIGRATE/DATABASE",
        }
    }
}
