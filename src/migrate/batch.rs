use std::collections::BTreeMap;

use tracing::info;

use super::condition::{Condition, Conditions};
use super::progress::Progress;
use super::property_map::PropertyMap;
use super::translate::PendingAttachments;
use super::{Engine, MigrationError, MigrationResult};
use crate::db::{first_inserted_id, Row, Select, UID};

/// Result of one delete-source call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSourceOutcome {
    pub count: u64,
    /// Source uid to target uid for every row migrated by this call.
    pub uid_map: BTreeMap<i64, i64>,
    /// Whether the source table was truncated instead of trimmed.
    pub truncated: bool,
}

fn source_uid(row: &Row, table: &str) -> MigrationResult<i64> {
    row.uid().ok_or_else(|| {
        MigrationError::query_failed(
            &format!("SELECT * FROM {table}"),
            format!("source row without {UID}"),
        )
    })
}

impl Engine<'_> {
    /// Copies unmarked `source` rows into `target`, writing each new uid into the source
    /// row's `reference_property`. Rows whose marker is non-zero are skipped, which makes
    /// the call resumable. Returns the number of rows migrated.
    #[allow(clippy::too_many_arguments)]
    pub fn migrate_with_reference_uid(
        &mut self,
        source: &str,
        target: &str,
        map: &PropertyMap,
        reference_property: &str,
        conditions: &Conditions,
        limit: usize,
        progress: &mut dyn Progress,
    ) -> MigrationResult<u64> {
        let mut unmarked = Conditions::new().and(reference_property, Condition::equals(0));
        unmarked.extend(conditions);
        let predicate = unmarked.to_sql();

        let total = self.storage.count(source, &predicate)?;
        if total == 0 {
            return Err(MigrationError::NoData {
                table: source.to_string(),
            });
        }
        progress.start(total);

        let mut map = map.clone();
        let mut processed = 0_u64;
        loop {
            let migrated = self.in_batch(|engine| {
                engine.migrate_marked_batch(
                    source,
                    target,
                    &mut map,
                    reference_property,
                    &predicate,
                    limit,
                )
            })?;
            if migrated == 0 {
                break;
            }
            processed += migrated;
            info!(
                target: "extupdate",
                event = "migrate_batch",
                from = source,
                to = target,
                rows = migrated,
                done = processed,
                total
            );
            if !progress.advance(migrated) || processed >= total {
                break;
            }
        }

        info!(
            target: "extupdate",
            event = "migrate_done",
            from = source,
            to = target,
            rows = processed
        );
        Ok(processed)
    }

    fn migrate_marked_batch(
        &mut self,
        source: &str,
        target: &str,
        map: &mut PropertyMap,
        reference_property: &str,
        predicate: &str,
        limit: usize,
    ) -> MigrationResult<u64> {
        let rows = self
            .storage
            .select(&Select::from(source).filter(predicate).limit(limit))?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut pending = PendingAttachments::new();
        let batch = self.translate_rows(map, &rows, &mut pending)?;
        let last = self
            .storage
            .insert_many(target, &batch.columns, &batch.rows)?;
        let first = first_inserted_id(last, rows.len());

        let mut ids = Vec::with_capacity(rows.len());
        for (offset, row) in rows.iter().enumerate() {
            let old_uid = source_uid(row, source)?;
            let new_uid = first + offset as i64;
            let predicate = Conditions::new()
                .and(UID, Condition::equals(old_uid))
                .to_sql();
            self.storage.update(
                source,
                &predicate,
                &Row::new().with(reference_property, new_uid),
            )?;
            ids.push((old_uid, new_uid));
        }
        self.attach_pending(target, &mut pending, ids)?;
        Ok(rows.len() as u64)
    }

    /// Moves up to `limit` rows from `source` to `target` and removes them from the
    /// source. A short selection means the source is drained, so it is truncated.
    ///
    /// Single pass: callers loop until [`MigrationError::NoData`] and apply each
    /// returned uid map before the next call.
    pub fn migrate_and_delete_source(
        &mut self,
        source: &str,
        target: &str,
        map: &PropertyMap,
        limit: usize,
    ) -> MigrationResult<DeleteSourceOutcome> {
        let outcome = self.in_batch(|engine| {
            let rows = engine
                .storage
                .select(&Select::from(source).limit(limit))?;
            if rows.is_empty() {
                return Err(MigrationError::NoData {
                    table: source.to_string(),
                });
            }

            let mut map = map.clone();
            let mut pending = PendingAttachments::new();
            let batch = engine.translate_rows(&mut map, &rows, &mut pending)?;
            let last = engine
                .storage
                .insert_many(target, &batch.columns, &batch.rows)?;
            let first = first_inserted_id(last, rows.len());

            let mut uid_map = BTreeMap::new();
            for (offset, row) in rows.iter().enumerate() {
                uid_map.insert(source_uid(row, source)?, first + offset as i64);
            }
            engine.attach_pending(
                target,
                &mut pending,
                uid_map.iter().map(|(old, new)| (*old, *new)),
            )?;

            let truncated = rows.len() < limit;
            if truncated {
                engine.storage.truncate(source)?;
            } else {
                let predicate = Conditions::new()
                    .and(UID, Condition::is_in(uid_map.keys().copied()))
                    .to_sql();
                engine.storage.delete(source, &predicate)?;
            }

            Ok(DeleteSourceOutcome {
                count: rows.len() as u64,
                uid_map,
                truncated,
            })
        })?;

        info!(
            target: "extupdate",
            event = "migrate_batch",
            from = source,
            to = target,
            rows = outcome.count,
            truncated = outcome.truncated
        );
        Ok(outcome)
    }
}
