//! Declarative table-to-table migration engine.
//!
//! An [`Engine`] wraps one storage handle and carries the state that must outlive a
//! single batch: resolved value-object identifiers and the file attacher. The
//! operations themselves live in the submodules as `impl Engine` blocks.

pub mod batch;
pub mod condition;
pub mod error;
pub mod pivot;
pub mod progress;
pub mod property_map;
pub mod reference;
pub mod translate;
pub mod unique;
pub mod update;

use tracing::{debug, error, warn};

pub use batch::DeleteSourceOutcome;
pub use condition::{any_of, Condition, Conditions};
pub use error::{MigrationError, MigrationResult};
pub use pivot::PivotSide;
pub use progress::{LogProgress, NoProgress, Progress};
pub use property_map::{ColumnMap, FileReference, PropertyMap, PropertyTarget, ValueReference};
pub use reference::ReferenceCache;
pub use translate::{PendingAttachments, PendingFile, RowTranslator, TranslatedBatch};
pub use unique::UniqueRecords;

use crate::db::{Row, Storage};
use crate::files::{FileAttacher, FileAttachment, FileReferences};

/// Column written on migrated source rows; zero means "not migrated yet".
pub const DEFAULT_MARKER: &str = "new_uid";

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Run every select/insert/mark step inside one storage transaction.
    pub transactional: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            transactional: true,
        }
    }
}

pub struct Engine<'a> {
    storage: &'a mut dyn Storage,
    references: ReferenceCache,
    files: Option<Box<dyn FileAttacher>>,
    options: EngineOptions,
    in_transaction: bool,
}

impl<'a> Engine<'a> {
    /// Engine writing attachments to the default file-reference table.
    pub fn new(storage: &'a mut dyn Storage) -> Self {
        Self {
            storage,
            references: ReferenceCache::new(),
            files: Some(Box::new(FileReferences::default())),
            options: EngineOptions::default(),
            in_transaction: false,
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_file_attacher(mut self, attacher: Box<dyn FileAttacher>) -> Self {
        self.files = Some(attacher);
        self
    }

    /// Pending file references are dropped with a warning instead of attached.
    pub fn without_file_attacher(mut self) -> Self {
        self.files = None;
        self
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    pub fn storage(&mut self) -> &mut dyn Storage {
        &mut *self.storage
    }

    pub fn references(&self) -> &ReferenceCache {
        &self.references
    }

    /// Runs `f` as one unit of work: a transaction when the engine is transactional.
    ///
    /// Nested calls join the enclosing transaction. Reference cache entries added by a
    /// batch that rolls back are forgotten.
    pub fn in_batch<R, F>(&mut self, f: F) -> MigrationResult<R>
    where
        F: FnOnce(&mut Self) -> MigrationResult<R>,
    {
        if !self.options.transactional || self.in_transaction {
            return f(self);
        }

        self.storage.begin()?;
        self.in_transaction = true;
        self.references.begin_batch();
        debug!(target: "extupdate", event = "db_tx_begin");
        let result = f(self);
        self.in_transaction = false;
        match result.and_then(|val| self.storage.commit().map(|()| val)) {
            Ok(val) => {
                self.references.commit_batch();
                debug!(target: "extupdate", event = "db_tx_commit");
                Ok(val)
            }
            Err(e) => {
                self.references.discard_batch();
                if let Err(rb) = self.storage.rollback() {
                    error!(target: "extupdate", event = "db_tx_rollback_failed", error = %rb);
                } else {
                    warn!(target: "extupdate", event = "db_tx_rollback", error = %e);
                }
                Err(e)
            }
        }
    }

    /// Translates `sources` with the engine's reference cache. `map` is the run's copy
    /// and keeps any pruning done on this batch.
    pub(crate) fn translate_rows(
        &mut self,
        map: &mut PropertyMap,
        sources: &[Row],
        pending: &mut PendingAttachments,
    ) -> MigrationResult<TranslatedBatch> {
        let mut translator =
            RowTranslator::new(std::mem::take(map), &mut self.references, pending);
        let batch = translator.translate_rows(&mut *self.storage, sources);
        *map = translator.into_property_map();
        batch
    }

    /// Attaches files registered during translation, now that target ids are known.
    pub(crate) fn attach_pending<I>(
        &mut self,
        table: &str,
        pending: &mut PendingAttachments,
        ids: I,
    ) -> MigrationResult<usize>
    where
        I: IntoIterator<Item = (i64, i64)>,
    {
        if pending.is_empty() {
            return Ok(0);
        }
        let Some(files) = self.files.as_mut() else {
            warn!(
                target: "extupdate",
                event = "file_attach_skipped",
                table,
                pending = pending.len()
            );
            return Ok(0);
        };

        let mut attached = 0;
        for (source_uid, target_uid) in ids {
            for file in pending.take(source_uid) {
                let attachment = FileAttachment {
                    file_id: file.file_id,
                    table: table.to_string(),
                    row_id: target_uid,
                    field: file.field,
                    storage_pid: file.storage_pid,
                };
                files.attach(&mut *self.storage, &attachment)?;
                attached += 1;
            }
        }
        Ok(attached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStorage;

    #[test]
    fn failed_batch_is_rolled_back() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .connection()
            .execute_batch("CREATE TABLE t (uid INTEGER PRIMARY KEY, title TEXT);")
            .unwrap();
        let mut engine = Engine::new(&mut storage);
        let res: MigrationResult<()> = engine.in_batch(|engine| {
            engine
                .storage()
                .insert_one("t", &Row::new().with("title", "a".to_string()))?;
            Err(MigrationError::NoData { table: "t".into() })
        });
        assert!(res.is_err());
        assert_eq!(engine.storage().count("t", "").unwrap(), 0);
    }

    #[test]
    fn nested_batches_share_one_transaction() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .connection()
            .execute_batch("CREATE TABLE t (uid INTEGER PRIMARY KEY, title TEXT);")
            .unwrap();
        let mut engine = Engine::new(&mut storage);
        let res: MigrationResult<()> = engine.in_batch(|engine| {
            engine.in_batch(|engine| {
                engine
                    .storage()
                    .insert_one("t", &Row::new().with("title", "inner".to_string()))
            })?;
            Err(MigrationError::NoData { table: "t".into() })
        });
        assert!(res.is_err());
        assert_eq!(engine.storage().count("t", "").unwrap(), 0);
    }

    #[test]
    fn pending_files_are_dropped_without_attacher() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let mut engine = Engine::new(&mut storage).without_file_attacher();
        let mut pending = PendingAttachments::new();
        pending.register(
            1,
            PendingFile {
                file_id: 3,
                field: "image".into(),
                storage_pid: 0,
            },
        );
        let attached = engine
            .attach_pending("tx_new", &mut pending, [(1, 10)])
            .unwrap();
        assert_eq!(attached, 0);
    }
}
