use serde::Deserialize;
use tracing::{info, warn};

use super::condition::{all_of, any_of, Condition, Conditions};
use super::progress::Progress;
use super::property_map::PropertyMap;
use super::translate::PendingAttachments;
use super::{Engine, MigrationError, MigrationResult};
use crate::db::{Row, Select};

const UID_LOCAL: &str = "uid_local";
const UID_FOREIGN: &str = "uid_foreign";
const NEW_LOCAL: &str = "new_local";
const NEW_FOREIGN: &str = "new_foreign";
const PIVOT_ORDER: &str = "uid_local ASC, uid_foreign ASC";

/// One endpoint of a pivot table: the already-migrated table and the column holding
/// each row's new uid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PivotSide {
    pub table: String,
    pub new_uid_column: String,
    #[serde(default)]
    pub conditions: Conditions,
}

impl PivotSide {
    pub fn new(table: impl Into<String>, new_uid_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            new_uid_column: new_uid_column.into(),
            conditions: Conditions::new(),
        }
    }

    pub fn with_conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = conditions;
        self
    }
}

/// Exact `(uid_local, uid_foreign)` match for every row.
fn pair_groups(rows: &[Row]) -> Vec<Conditions> {
    rows.iter()
        .map(|row| {
            let mut group = Conditions::new();
            for column in [UID_LOCAL, UID_FOREIGN] {
                if let Some(value) = row.get(column) {
                    group.push(column, Condition::Equals(value.clone()));
                }
            }
            group
        })
        .collect()
}

impl Engine<'_> {
    /// Copies pivot rows whose two endpoints are both migrated, rewriting the pair to
    /// the endpoints' new uids, and flags the copied rows in `flag_property`.
    #[allow(clippy::too_many_arguments)]
    pub fn migrate_mm_with_reference_uid(
        &mut self,
        source: &str,
        target: &str,
        local: &PivotSide,
        foreign: &PivotSide,
        map: &PropertyMap,
        flag_property: &str,
        limit: usize,
        progress: &mut dyn Progress,
    ) -> MigrationResult<u64> {
        let from = format!(
            "{source} mm JOIN {} l ON l.uid = mm.{UID_LOCAL} JOIN {} f ON f.uid = mm.{UID_FOREIGN}",
            local.table, foreign.table
        );
        let columns = format!(
            "mm.*, l.{} AS {NEW_LOCAL}, f.{} AS {NEW_FOREIGN}",
            local.new_uid_column, foreign.new_uid_column
        );
        let flag = format!("mm.{flag_property} = 0");
        let local_new = format!("l.{} > 0", local.new_uid_column);
        let foreign_new = format!("f.{} > 0", foreign.new_uid_column);
        let local_conditions = local.conditions.qualified("l").to_sql();
        let foreign_conditions = foreign.conditions.qualified("f").to_sql();
        let predicate = all_of([
            flag.as_str(),
            local_new.as_str(),
            foreign_new.as_str(),
            local_conditions.as_str(),
            foreign_conditions.as_str(),
        ]);

        let total = self.storage.count(&from, &predicate)?;
        if total == 0 {
            return Err(MigrationError::NoData {
                table: source.to_string(),
            });
        }
        progress.start(total);

        let mut map = map.clone().copy(NEW_LOCAL, UID_LOCAL).copy(NEW_FOREIGN, UID_FOREIGN);
        let query = Select::from(from)
            .columns(columns)
            .filter(predicate)
            .order_by(format!("mm.{UID_LOCAL} ASC, mm.{UID_FOREIGN} ASC"))
            .limit(limit);

        let mut processed = 0_u64;
        loop {
            let migrated = self.in_batch(|engine| {
                let rows = engine.storage.select(&query)?;
                if rows.is_empty() {
                    return Ok(0);
                }
                engine.insert_pivot_rows(target, &mut map, &rows)?;
                let flag_row = Row::new().with(flag_property, 1);
                for flagged in any_of(&pair_groups(&rows)) {
                    engine.storage.update(source, &flagged, &flag_row)?;
                }
                Ok(rows.len() as u64)
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

    /// Moves up to `limit` raw pivot rows and removes them from the source, truncating
    /// it once a short selection shows it is drained.
    pub fn migrate_mm_and_delete_source(
        &mut self,
        source: &str,
        target: &str,
        map: &PropertyMap,
        limit: usize,
    ) -> MigrationResult<u64> {
        let count = self.in_batch(|engine| {
            let rows = engine
                .storage
                .select(&Select::from(source).order_by(PIVOT_ORDER).limit(limit))?;
            if rows.is_empty() {
                return Err(MigrationError::NoData {
                    table: source.to_string(),
                });
            }

            let mut map = map.clone();
            engine.insert_pivot_rows(target, &mut map, &rows)?;
            if rows.len() < limit {
                engine.storage.truncate(source)?;
            } else {
                for moved in any_of(&pair_groups(&rows)) {
                    engine.storage.delete(source, &moved)?;
                }
            }
            Ok(rows.len() as u64)
        })?;

        info!(
            target: "extupdate",
            event = "migrate_batch",
            from = source,
            to = target,
            rows = count
        );
        Ok(count)
    }

    fn insert_pivot_rows(
        &mut self,
        target: &str,
        map: &mut PropertyMap,
        rows: &[Row],
    ) -> MigrationResult<()> {
        let mut pending = PendingAttachments::new();
        let batch = self.translate_rows(map, rows, &mut pending)?;
        if !pending.is_empty() {
            warn!(
                target: "extupdate",
                event = "pivot_file_reference_ignored",
                table = target,
                pending = pending.len()
            );
        }
        self.storage
            .insert_many(target, &batch.columns, &batch.rows)?;
        Ok(())
    }
}
