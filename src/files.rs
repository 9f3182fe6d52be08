//! File objects and their attachment to migrated records.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use rusqlite::types::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::db::{Row, Select, Storage, PID, UID};
use crate::migrate::condition::{Condition, Conditions};
use crate::migrate::{MigrationError, MigrationResult};

pub const FILE_TABLE: &str = "sys_file";
pub const FILE_REFERENCE_TABLE: &str = "sys_file_reference";

/// Attach file `file_id` to `table`.`row_id` under `field`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttachment {
    pub file_id: i64,
    pub table: String,
    pub row_id: i64,
    pub field: String,
    pub storage_pid: i64,
}

pub trait FileAttacher {
    /// Returns the identifier of the created reference record.
    fn attach(&mut self, storage: &mut dyn Storage, attachment: &FileAttachment)
        -> MigrationResult<i64>;
}

/// Writes attachments as rows of a file-reference table.
#[derive(Debug, Clone)]
pub struct FileReferences {
    table: String,
}

impl Default for FileReferences {
    fn default() -> Self {
        Self::new(FILE_REFERENCE_TABLE)
    }
}

impl FileReferences {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl FileAttacher for FileReferences {
    fn attach(
        &mut self,
        storage: &mut dyn Storage,
        attachment: &FileAttachment,
    ) -> MigrationResult<i64> {
        let row = Row::new()
            .with("uid_local", attachment.file_id)
            .with("tablenames", attachment.table.clone())
            .with("uid_foreign", attachment.row_id)
            .with("fieldname", attachment.field.clone())
            .with(PID, attachment.storage_pid)
            .with("crdate", chrono::Utc::now().timestamp());
        let uid = storage.insert_one(&self.table, &row)?;
        debug!(
            target: "extupdate",
            event = "file_attached",
            file = attachment.file_id,
            table = %attachment.table,
            row = attachment.row_id,
            field = %attachment.field
        );
        Ok(uid)
    }
}

/// Resolves paths below a document root to file-object identifiers.
#[derive(Debug, Clone)]
pub struct FileIndex {
    document_root: PathBuf,
    table: String,
}

impl FileIndex {
    pub fn new(document_root: impl Into<PathBuf>) -> Self {
        Self {
            document_root: document_root.into(),
            table: FILE_TABLE.to_string(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn document_root(&self) -> &Path {
        &self.document_root
    }

    /// Identifier of the file object for `path`, registering the file when it is new.
    ///
    /// Relative paths are taken from the document root.
    pub fn retrieve_file_by_path(
        &self,
        storage: &mut dyn Storage,
        path: impl AsRef<Path>,
    ) -> MigrationResult<i64> {
        let path = path.as_ref();
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.document_root.join(path)
        };
        let not_found = || MigrationError::FileDoesNotExist {
            path: full.display().to_string(),
        };
        if !full.is_file() {
            return Err(not_found());
        }

        let real = full.canonicalize().map_err(|_| not_found())?;
        let root = self
            .document_root
            .canonicalize()
            .map_err(|_| MigrationError::NotInDocumentRoot {
                path: real.display().to_string(),
                root: self.document_root.display().to_string(),
            })?;
        let relative = real
            .strip_prefix(&root)
            .map_err(|_| MigrationError::NotInDocumentRoot {
                path: real.display().to_string(),
                root: root.display().to_string(),
            })?;
        let identifier = identifier_for(relative);

        let query = Select::from(self.table.as_str())
            .columns(UID)
            .filter(
                Conditions::new()
                    .and("identifier", Condition::equals(identifier.clone()))
                    .to_sql(),
            )
            .limit(1);
        if let Some(uid) = storage.select(&query)?.first().and_then(Row::uid) {
            return Ok(uid);
        }

        let size = real.metadata().map_err(|_| not_found())?.len();
        let sha256 = file_sha256(&real).map_err(|_| not_found())?;
        let name = real
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let row = Row::new()
            .with("identifier", identifier.clone())
            .with("name", name)
            .with("size", Value::Integer(size as i64))
            .with("sha256", sha256);
        let uid = storage.insert_one(&self.table, &row)?;
        debug!(target: "extupdate", event = "file_indexed", uid, identifier = %identifier);
        Ok(uid)
    }
}

fn identifier_for(relative: &Path) -> String {
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    format!("/{}", parts.join("/"))
}

pub fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_use_forward_slashes() {
        let rel = Path::new("fileadmin").join("news").join("a.jpg");
        assert_eq!(identifier_for(&rel), "/fileadmin/news/a.jpg");
    }

    #[test]
    fn file_sha256_hashes_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc123").unwrap();
        let expected = format!("{:x}", Sha256::digest(b"abc123"));
        assert_eq!(file_sha256(&path).unwrap(), expected);
    }
}
