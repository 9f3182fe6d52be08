use std::collections::HashMap;

use rusqlite::types::Value;
use tracing::debug;

use super::condition::Conditions;
use super::property_map::ValueReference;
use super::{MigrationError, MigrationResult};
use crate::db::{value_as_i64, value_to_plain, Row, Select, Storage, UID};

const KEY_SEPARATOR: &str = ";;;";

/// Resolved value-object identifiers, per foreign table and composite value key.
///
/// Lives as long as the engine that owns it. Entries added inside an open batch are
/// journaled and dropped again if that batch rolls back.
#[derive(Debug, Default)]
pub struct ReferenceCache {
    tables: HashMap<String, HashMap<String, i64>>,
    journal: Option<Vec<(String, String)>>,
}

impl ReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, table: &str, key: &str) -> Option<i64> {
        self.tables.get(table).and_then(|keys| keys.get(key)).copied()
    }

    pub(crate) fn begin_batch(&mut self) {
        self.journal = Some(Vec::new());
    }

    pub(crate) fn commit_batch(&mut self) {
        self.journal = None;
    }

    /// Forgets every entry added since [`Self::begin_batch`]; their rows were rolled back.
    pub(crate) fn discard_batch(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for (table, key) in journal {
            if let Some(keys) = self.tables.get_mut(&table) {
                keys.remove(&key);
            }
        }
    }

    /// Identifier of the `spec.foreign_table` row holding `value` (plus the `unique_by`
    /// columns taken from `source_row`), creating that row when none exists.
    pub fn resolve(
        &mut self,
        storage: &mut dyn Storage,
        spec: &ValueReference,
        value: &Value,
        source_row: &Row,
    ) -> MigrationResult<i64> {
        let mut values = Row::with_capacity(1 + spec.unique_by.len());
        values.insert(spec.value_field.clone(), value.clone());
        for column in &spec.unique_by {
            let v = source_row.get(column).cloned().unwrap_or(Value::Null);
            values.insert(column.clone(), v);
        }

        let key = values
            .values()
            .iter()
            .map(value_to_plain)
            .collect::<Vec<_>>()
            .join(KEY_SEPARATOR);
        if let Some(uid) = self.get(&spec.foreign_table, &key) {
            return Ok(uid);
        }

        let query = Select::from(spec.foreign_table.as_str())
            .columns(spec.foreign_field.as_str())
            .filter(Conditions::matching(values.iter()).to_sql())
            .order_by(format!("{UID} DESC"))
            .limit(1);
        let uid = match storage.select(&query)?.into_iter().next() {
            Some(row) => row
                .get(&spec.foreign_field)
                .and_then(value_as_i64)
                .ok_or_else(|| {
                    MigrationError::query_failed(
                        &query.to_sql(),
                        format!("missing field {}", spec.foreign_field),
                    )
                })?,
            None => {
                let uid = storage.insert_one(&spec.foreign_table, &values)?;
                debug!(
                    target: "extupdate",
                    event = "reference_created",
                    table = %spec.foreign_table,
                    uid
                );
                uid
            }
        };

        if let Some(journal) = self.journal.as_mut() {
            journal.push((spec.foreign_table.clone(), key.clone()));
        }
        self.tables
            .entry(spec.foreign_table.clone())
            .or_default()
            .insert(key, uid);
        Ok(uid)
    }
}
