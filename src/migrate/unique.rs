use std::collections::{BTreeMap, HashMap};

use rusqlite::types::Value;
use sha2::{Digest, Sha256};
use tracing::info;

use super::condition::{any_of, Conditions};
use super::property_map::ColumnMap;
use super::{Engine, MigrationError, MigrationResult};
use crate::db::{first_inserted_id, value_to_plain, Row, Select};

const TUPLE_SEPARATOR: &str = "|";

/// Records created or found for a set of distinct value tuples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UniqueRecords {
    /// Target uid to the value tuple, keyed by source column names.
    pub uid_map: BTreeMap<i64, Row>,
    pub inserted: u64,
    pub matched: u64,
}

fn tuple_text(values: &[Value]) -> String {
    values
        .iter()
        .map(value_to_plain)
        .collect::<Vec<_>>()
        .join(TUPLE_SEPARATOR)
}

fn tuple_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

impl Engine<'_> {
    /// Creates one `target` record per distinct tuple of the mapped `source` columns,
    /// reusing target records that already hold a tuple.
    ///
    /// Fails with [`MigrationError::DeduplicationMismatch`] when an existing target
    /// record matched by the lookup does not correspond to any outstanding tuple.
    pub fn create_unique_records_from_values(
        &mut self,
        source: &str,
        target: &str,
        properties: &ColumnMap,
        conditions: &Conditions,
        limit: usize,
    ) -> MigrationResult<UniqueRecords> {
        let columns = properties.sources().collect::<Vec<_>>().join(", ");
        let query = Select::from(source)
            .columns(columns.as_str())
            .filter(conditions.to_sql())
            .group_by(columns.as_str())
            .order_by(columns.as_str())
            .limit(limit);

        let records = self.in_batch(|engine| {
            let tuples = engine.storage.select(&query)?;
            if tuples.is_empty() {
                return Err(MigrationError::NoUniqueData {
                    table: target.to_string(),
                });
            }
            engine.insert_unique_records(target, properties, tuples)
        })?;

        info!(
            target: "extupdate",
            event = "unique_insert",
            from = source,
            to = target,
            inserted = records.inserted,
            matched = records.matched
        );
        Ok(records)
    }

    fn insert_unique_records(
        &mut self,
        target: &str,
        properties: &ColumnMap,
        tuples: Vec<Row>,
    ) -> MigrationResult<UniqueRecords> {
        // Incoming tuples re-keyed by target column, first occurrence of each hash wins.
        let mut remaining: Vec<Option<Row>> = Vec::with_capacity(tuples.len());
        let mut by_hash: HashMap<String, usize> = HashMap::with_capacity(tuples.len());
        for tuple in tuples {
            let values: Vec<_> = properties
                .sources()
                .map(|column| tuple.get(column).cloned().unwrap_or(Value::Null))
                .collect();
            let hash = tuple_hash(&tuple_text(&values));
            if by_hash.contains_key(&hash) {
                continue;
            }
            by_hash.insert(hash, remaining.len());
            remaining.push(Some(properties.targets().zip(values).collect()));
        }

        let groups: Vec<Conditions> = remaining
            .iter()
            .flatten()
            .map(|row| Conditions::matching(row.iter()))
            .collect();
        let mut matches = Vec::new();
        for predicate in any_of(&groups) {
            matches.extend(self.storage.select(&Select::from(target).filter(predicate))?);
        }

        let mut records = UniqueRecords::default();
        for existing in matches {
            let values: Vec<_> = properties
                .targets()
                .map(|column| existing.get(column).cloned().unwrap_or(Value::Null))
                .collect();
            let text = tuple_text(&values);
            let slot = by_hash
                .remove(&tuple_hash(&text))
                .and_then(|idx| remaining[idx].take());
            let (Some(_), Some(uid)) = (slot, existing.uid()) else {
                return Err(MigrationError::DeduplicationMismatch {
                    table: target.to_string(),
                    tuple: text,
                });
            };
            records
                .uid_map
                .insert(uid, properties.sources().zip(values).collect());
            records.matched += 1;
        }

        let to_insert: Vec<Row> = remaining.into_iter().flatten().collect();
        if !to_insert.is_empty() {
            let columns: Vec<String> = properties.targets().map(str::to_string).collect();
            let last = self.storage.insert_many(target, &columns, &to_insert)?;
            let first = first_inserted_id(last, to_insert.len());
            for (offset, row) in to_insert.into_iter().enumerate() {
                let keyed: Row = properties
                    .sources()
                    .zip(row.values().iter().cloned())
                    .collect();
                records.uid_map.insert(first + offset as i64, keyed);
                records.inserted += 1;
            }
        }
        Ok(records)
    }
}
