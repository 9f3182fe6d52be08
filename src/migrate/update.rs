use std::collections::BTreeMap;

use rusqlite::types::Value;
use tracing::{debug, info};

use super::condition::{Condition, Conditions};
use super::{Engine, MigrationError, MigrationResult};
use crate::db::Row;

impl Engine<'_> {
    /// Sets `property` to each value on the rows matching that value's conditions.
    pub fn update_property_by_condition(
        &mut self,
        table: &str,
        property: &str,
        values: &[(Value, Conditions)],
    ) -> MigrationResult<u64> {
        let mut affected = 0;
        for (value, conditions) in values {
            let row = Row::new().with(property, value.clone());
            affected += self.update_table_records(table, &row, conditions)?;
        }
        Ok(affected)
    }

    /// Replaces `property` values per `uid_map` (old value to new value), applying pairs
    /// in ascending old-value order.
    ///
    /// With `strict` set the values are uid references: a pair whose new value is above
    /// its old value could later be overwritten by a remap of that higher uid, so the
    /// whole map is rejected with [`MigrationError::UidReferenceOverlap`] before any
    /// row changes.
    pub fn update_property_by_source_value(
        &mut self,
        table: &str,
        property: &str,
        uid_map: &BTreeMap<i64, i64>,
        strict: bool,
    ) -> MigrationResult<u64> {
        if strict {
            if let Some((old, new)) = uid_map.iter().find(|(old, new)| new > old) {
                return Err(MigrationError::UidReferenceOverlap {
                    table: table.to_string(),
                    property: property.to_string(),
                    source_value: *old,
                    target_value: *new,
                });
            }
        }

        let affected = self.in_batch(|engine| {
            let mut affected = 0;
            for (old, new) in uid_map {
                let conditions = Conditions::new().and(property, Condition::equals(*old));
                affected += engine.update_table_records(
                    table,
                    &Row::new().with(property, *new),
                    &conditions,
                )?;
            }
            Ok(affected)
        })?;
        info!(
            target: "extupdate",
            event = "property_remapped",
            table,
            property,
            pairs = uid_map.len(),
            affected
        );
        Ok(affected)
    }

    /// Plain `UPDATE table SET values WHERE conditions`; no conditions means every row.
    pub fn update_table_records(
        &mut self,
        table: &str,
        values: &Row,
        conditions: &Conditions,
    ) -> MigrationResult<u64> {
        let predicate = conditions.to_sql();
        let affected = self.storage.update(table, &predicate, values)?;
        debug!(target: "extupdate", event = "records_updated", table, affected);
        Ok(affected)
    }
}
