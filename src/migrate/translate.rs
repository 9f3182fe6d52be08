use std::collections::BTreeMap;

use rusqlite::types::Value;

use super::property_map::{PropertyMap, PropertyTarget};
use super::reference::ReferenceCache;
use super::MigrationResult;
use crate::db::{value_as_i64, Row, Storage, PID};

/// A file to attach to a target row once that row's identifier is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    pub file_id: i64,
    pub field: String,
    pub storage_pid: i64,
}

/// Side channel filled while translating one batch, keyed by source row identifier.
#[derive(Debug, Default)]
pub struct PendingAttachments {
    files: BTreeMap<i64, Vec<PendingFile>>,
}

impl PendingAttachments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source_uid: i64, file: PendingFile) {
        self.files.entry(source_uid).or_default().push(file);
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    pub fn take(&mut self, source_uid: i64) -> Vec<PendingFile> {
        self.files.remove(&source_uid).unwrap_or_default()
    }
}

/// Result of translating a batch: target rows plus the column set to insert.
#[derive(Debug, Default)]
pub struct TranslatedBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// Maps source rows onto target rows following a [`PropertyMap`].
///
/// The translator owns a copy of the map for one run: entries whose source column is
/// missing from a row are dropped so later rows skip them.
pub struct RowTranslator<'a> {
    map: PropertyMap,
    references: &'a mut ReferenceCache,
    attachments: &'a mut PendingAttachments,
}

impl<'a> RowTranslator<'a> {
    pub fn new(
        map: PropertyMap,
        references: &'a mut ReferenceCache,
        attachments: &'a mut PendingAttachments,
    ) -> Self {
        Self {
            map,
            references,
            attachments,
        }
    }

    /// The property map as pruned so far.
    pub fn property_map(&self) -> &PropertyMap {
        &self.map
    }

    pub fn into_property_map(self) -> PropertyMap {
        self.map
    }

    pub fn translate(&mut self, storage: &mut dyn Storage, source: &Row) -> MigrationResult<Row> {
        self.map.retain(|column| source.contains(column));

        let mut target = Row::with_capacity(self.map.len());
        for (column, property) in self.map.entries() {
            let Some(value) = source.get(column) else {
                continue;
            };
            match property {
                PropertyTarget::Copy(target_column) => {
                    target.insert(target_column.clone(), value.clone());
                }
                PropertyTarget::ValueReference(spec) => {
                    let resolved = match value {
                        Value::Null => Value::Null,
                        value => Value::Integer(
                            self.references.resolve(storage, spec, value, source)?,
                        ),
                    };
                    target.insert(spec.target_property.clone(), resolved);
                }
                PropertyTarget::FileReference(spec) => {
                    let file_id = value_as_i64(value).unwrap_or(0);
                    if file_id > 0 {
                        if let Some(source_uid) = source.uid() {
                            self.attachments.register(
                                source_uid,
                                PendingFile {
                                    file_id,
                                    field: spec.target_property.clone(),
                                    storage_pid: source.get_i64(PID).unwrap_or(0),
                                },
                            );
                        }
                    }
                }
            }
        }
        Ok(target)
    }

    pub fn translate_rows(
        &mut self,
        storage: &mut dyn Storage,
        sources: &[Row],
    ) -> MigrationResult<TranslatedBatch> {
        let mut batch = TranslatedBatch {
            columns: Vec::new(),
            rows: Vec::with_capacity(sources.len()),
        };
        for source in sources {
            let row = self.translate(storage, source)?;
            for column in row.columns() {
                if !batch.columns.contains(column) {
                    batch.columns.push(column.clone());
                }
            }
            batch.rows.push(row);
        }
        Ok(batch)
    }
}
