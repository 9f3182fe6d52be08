//! Updater driven by a declarative JSON plan.

use rusqlite::types::Value;
use tracing::{info, warn};

use crate::config::{PlanConfig, StepConfig};
use crate::db::{value_to_plain, Row, Select, UID};
use crate::error::{AppError, AppResult};
use crate::files::FileIndex;
use crate::migrate::condition::json_to_value;
use crate::migrate::{
    Condition, Conditions, Engine, LogProgress, MigrationError, MigrationResult,
};
use crate::updater::Updater;

/// Marker written into the file column when a path cannot be resolved.
pub const UNRESOLVED_FILE: i64 = -1;

#[derive(Debug, Clone)]
struct PlanStep {
    config: StepConfig,
    complete: bool,
}

/// Runs every incomplete plan step once per pass, in plan order.
#[derive(Debug, Clone)]
pub struct PlanUpdater {
    steps: Vec<PlanStep>,
    files: Option<FileIndex>,
}

impl PlanUpdater {
    pub fn new(plan: &PlanConfig) -> Self {
        Self {
            steps: plan
                .steps
                .iter()
                .cloned()
                .map(|config| PlanStep {
                    config,
                    complete: false,
                })
                .collect(),
            files: plan.document_root.clone().map(FileIndex::new),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|step| step.complete)
    }

    pub fn pending_steps(&self) -> usize {
        self.steps.iter().filter(|step| !step.complete).count()
    }
}

impl Updater for PlanUpdater {
    fn process_updates(&mut self, engine: &mut Engine<'_>) -> AppResult<bool> {
        for (index, step) in self.steps.iter_mut().enumerate() {
            if step.complete {
                continue;
            }
            let kind = step.config.kind();
            match run_step(engine, &step.config, self.files.as_ref()) {
                Ok(done) => step.complete = done,
                Err(err) if err.is_nothing_to_do() => {
                    info!(target: "extupdate", event = "step_nothing_to_do", step = index, kind);
                    step.complete = true;
                }
                Err(err) => {
                    return Err(AppError::from(err)
                        .with_context("step", index.to_string())
                        .with_context("kind", kind));
                }
            }
            if step.complete {
                info!(target: "extupdate", event = "step_complete", step = index, kind);
            }
        }
        Ok(self.is_complete())
    }
}

/// Runs one step; `Ok(true)` when the step has nothing left to do.
fn run_step(
    engine: &mut Engine<'_>,
    config: &StepConfig,
    files: Option<&FileIndex>,
) -> MigrationResult<bool> {
    match config {
        StepConfig::UniqueRecords {
            source,
            target,
            properties,
            conditions,
            limit,
            assign,
        } => {
            let records = engine.create_unique_records_from_values(
                source, target, properties, conditions, *limit,
            )?;
            if (records.inserted + records.matched) as usize >= *limit {
                warn!(
                    target: "extupdate",
                    event = "unique_limit_reached",
                    to = %target,
                    limit = *limit
                );
            }
            if let Some(assign) = assign {
                let values: Vec<(Value, Conditions)> = records
                    .uid_map
                    .iter()
                    .map(|(uid, tuple)| (Value::Integer(*uid), Conditions::matching(tuple.iter())))
                    .collect();
                engine.update_property_by_condition(&assign.table, &assign.property, &values)?;
            }
            Ok(true)
        }
        StepConfig::MigrateWithReferenceUid {
            source,
            target,
            properties,
            reference_property,
            conditions,
            limit,
        } => {
            engine.migrate_with_reference_uid(
                source,
                target,
                properties,
                reference_property,
                conditions,
                *limit,
                &mut LogProgress::new(source.as_str()),
            )?;
            Ok(false)
        }
        StepConfig::MigrateAndDeleteSource {
            source,
            target,
            properties,
            limit,
            remap,
        } => engine.in_batch(|engine| {
            // The source rows are gone once this commits, so remaps commit with it.
            let outcome = engine.migrate_and_delete_source(source, target, properties, *limit)?;
            for remap in remap {
                engine.update_property_by_source_value(
                    &remap.table,
                    &remap.property,
                    &outcome.uid_map,
                    remap.strict,
                )?;
            }
            Ok(outcome.truncated)
        }),
        StepConfig::MigrateMmWithReferenceUid {
            source,
            target,
            local,
            foreign,
            properties,
            flag_property,
            limit,
        } => {
            engine.migrate_mm_with_reference_uid(
                source,
                target,
                local,
                foreign,
                properties,
                flag_property,
                *limit,
                &mut LogProgress::new(source.as_str()),
            )?;
            Ok(false)
        }
        StepConfig::MigrateMmAndDeleteSource {
            source,
            target,
            properties,
            limit,
        } => {
            let count = engine.migrate_mm_and_delete_source(source, target, properties, *limit)?;
            Ok((count as usize) < *limit)
        }
        StepConfig::ResolveFilePaths {
            table,
            path_property,
            file_property,
            conditions,
            limit,
        } => {
            let Some(files) = files else {
                return Err(MigrationError::MissingDocumentRoot {
                    table: table.clone(),
                });
            };
            resolve_file_paths(
                engine,
                files,
                table,
                path_property,
                file_property,
                conditions,
                *limit,
            )
        }
        StepConfig::SetProperty {
            table,
            property,
            value,
            conditions,
        } => {
            let value = json_to_value(value).map_err(|reason| {
                MigrationError::query_failed(&format!("UPDATE {table} SET {property}"), reason)
            })?;
            engine.update_property_by_condition(table, property, &[(value, conditions.clone())])?;
            Ok(true)
        }
    }
}

fn resolve_file_paths(
    engine: &mut Engine<'_>,
    files: &FileIndex,
    table: &str,
    path_property: &str,
    file_property: &str,
    conditions: &Conditions,
    limit: usize,
) -> MigrationResult<bool> {
    let mut pending = Conditions::new()
        .and(file_property, Condition::equals(0))
        .and(path_property, Condition::op("<> %1$s", String::new()));
    pending.extend(conditions);
    let query = Select::from(table)
        .columns(format!("{UID}, {path_property}"))
        .filter(pending.to_sql())
        .limit(limit);

    engine.in_batch(|engine| {
        let rows = engine.storage().select(&query)?;
        let mut resolved = 0_u64;
        for row in &rows {
            let Some(uid) = row.uid() else { continue };
            let path = row
                .get(path_property)
                .map(value_to_plain)
                .unwrap_or_default();
            let file_id = match files.retrieve_file_by_path(engine.storage(), &path) {
                Ok(id) => {
                    resolved += 1;
                    id
                }
                Err(
                    err @ (MigrationError::FileDoesNotExist { .. }
                    | MigrationError::NotInDocumentRoot { .. }),
                ) => {
                    warn!(
                        target: "extupdate",
                        event = "file_path_unresolved",
                        table,
                        uid,
                        error = %err
                    );
                    UNRESOLVED_FILE
                }
                Err(err) => return Err(err),
            };
            let only_this = Conditions::new().and(UID, Condition::equals(uid));
            engine.update_table_records(table, &Row::new().with(file_property, file_id), &only_this)?;
        }
        info!(
            target: "extupdate",
            event = "file_paths_resolved",
            table,
            rows = rows.len(),
            resolved
        );
        Ok(rows.len() < limit)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SqliteStorage, Storage};

    fn plan(steps: &str) -> PlanConfig {
        PlanConfig::from_json(&format!(r#"{{"extension": "news", "steps": {steps}}}"#)).unwrap()
    }

    #[test]
    fn delete_source_step_completes_once_drained() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .connection()
            .execute_batch(
                "CREATE TABLE tx_old (uid INTEGER PRIMARY KEY, title TEXT);
                 CREATE TABLE tx_new (uid INTEGER PRIMARY KEY, title TEXT);
                 INSERT INTO tx_old (title) VALUES ('a'), ('b'), ('c');",
            )
            .unwrap();
        let plan = plan(
            r#"[{"kind": "migrate_and_delete_source", "source": "tx_old", "target": "tx_new",
                 "properties": {"title": "title"}, "limit": 2}]"#,
        );
        let mut updater = PlanUpdater::new(&plan);
        let mut engine = Engine::new(&mut storage);
        assert!(!updater.process_updates(&mut engine).unwrap());
        assert!(updater.process_updates(&mut engine).unwrap());
        assert_eq!(engine.storage().count("tx_new", "").unwrap(), 3);
        assert_eq!(updater.pending_steps(), 0);
    }

    #[test]
    fn rejected_remap_keeps_the_source_rows() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .connection()
            .execute_batch(
                "CREATE TABLE tx_old (uid INTEGER PRIMARY KEY, title TEXT);
                 CREATE TABLE tx_new (uid INTEGER PRIMARY KEY, title TEXT);
                 CREATE TABLE tx_ref (uid INTEGER PRIMARY KEY, item INTEGER);
                 INSERT INTO tx_new (uid, title) VALUES (50, 'existing');
                 INSERT INTO tx_old (uid, title) VALUES (1, 'a'), (2, 'b'), (3, 'c');
                 INSERT INTO tx_ref (item) VALUES (1), (2);",
            )
            .unwrap();
        let plan = plan(
            r#"[{"kind": "migrate_and_delete_source", "source": "tx_old", "target": "tx_new",
                 "properties": {"title": "title"}, "limit": 10,
                 "remap": [{"table": "tx_ref", "property": "item"}]}]"#,
        );
        let mut updater = PlanUpdater::new(&plan);
        let mut engine = Engine::new(&mut storage);
        let err = updater.process_updates(&mut engine).unwrap_err();
        assert_eq!(err.code(), "MIGRATE/UID_OVERLAP");

        assert_eq!(engine.storage().count("tx_old", "").unwrap(), 3);
        assert_eq!(engine.storage().count("tx_new", "").unwrap(), 1);
        assert_eq!(engine.storage().count("tx_ref", "item IN(1,2)").unwrap(), 2);
        assert_eq!(updater.pending_steps(), 1);
    }

    #[test]
    fn file_step_without_document_root_is_a_configuration_error() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let mut plan = PlanConfig::from_json(
            r#"{"extension": "news", "document_root": "/srv/site", "steps": [
                {"kind": "resolve_file_paths", "table": "tx_old", "path_property": "image_path",
                 "file_property": "image"}]}"#,
        )
        .unwrap();
        plan.document_root = None;
        let mut updater = PlanUpdater::new(&plan);
        let mut engine = Engine::new(&mut storage);
        let err = updater.process_updates(&mut engine).unwrap_err();
        assert_eq!(err.code(), "FILE/NO_DOCUMENT_ROOT");
        assert_eq!(err.context().get("table"), Some(&"tx_old".to_string()));
    }

    #[test]
    fn failing_step_carries_its_index() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let plan = plan(
            r#"[{"kind": "set_property", "table": "missing", "property": "p", "value": 1}]"#,
        );
        let mut updater = PlanUpdater::new(&plan);
        let mut engine = Engine::new(&mut storage);
        let err = updater.process_updates(&mut engine).unwrap_err();
        assert_eq!(err.context().get("step"), Some(&"0".to_string()));
        assert_eq!(err.context().get("kind"), Some(&"set_property".to_string()));
    }
}
