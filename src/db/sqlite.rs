use std::path::Path;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use tracing::{debug, info};

use super::{Row, Select, Storage};
use crate::migrate::{MigrationError, MigrationResult};

/// SQLite caps bound parameters per statement; stay under the conservative default.
const MAX_BOUND_PARAMS: usize = 999;

pub fn quote_ident(name: &str) -> String {
    let escaped = name.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    if trimmed.chars().count() > 160 {
        let cut: String = trimmed.chars().take(160).collect();
        format!("{cut}…")
    } else {
        trimmed.to_string()
    }
}

/// [`Storage`] over a single blocking `rusqlite` connection.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> MigrationResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "FULL").ok();
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        info!(target: "extupdate", event = "db_open", path = %path.display());
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> MigrationResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", 1)?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }

    fn insert_chunk(&self, table: &str, columns: &[String], rows: &[Row]) -> MigrationResult<()> {
        let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote_ident(table),
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            vec![placeholders.as_str(); rows.len()].join(", ")
        );
        let params = rows.iter().flat_map(|row| {
            columns
                .iter()
                .map(move |column| row.get(column).cloned().unwrap_or(Value::Null))
        });
        debug!(target: "extupdate", event = "db_insert", table = %table, rows = rows.len());
        self.conn.execute(&sql, params_from_iter(params))?;
        Ok(())
    }
}

impl Storage for SqliteStorage {
    fn count(&mut self, from: &str, predicate: &str) -> MigrationResult<u64> {
        let mut sql = format!("SELECT COUNT(*) FROM {from}");
        if !predicate.trim().is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(predicate);
        }
        debug!(target: "extupdate", event = "db_count", sql = %preview(&sql));
        let count: i64 = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|err| MigrationError::query_failed(&sql, err))?;
        Ok(count.max(0) as u64)
    }

    fn select(&mut self, query: &Select) -> MigrationResult<Vec<Row>> {
        let sql = query.to_sql();
        debug!(target: "extupdate", event = "db_select", sql = %preview(&sql));
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| MigrationError::query_failed(&sql, err))?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let rows = stmt
            .query_map([], |row| {
                let mut out = Row::with_capacity(names.len());
                for (idx, name) in names.iter().enumerate() {
                    out.insert(name.clone(), row.get::<_, Value>(idx)?);
                }
                Ok(out)
            })
            .map_err(|err| MigrationError::query_failed(&sql, err))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| MigrationError::query_failed(&sql, err))?;
        Ok(rows)
    }

    fn insert_many(&mut self, table: &str, columns: &[String], rows: &[Row]) -> MigrationResult<i64> {
        if rows.is_empty() {
            return Ok(self.conn.last_insert_rowid());
        }
        if columns.is_empty() {
            let sql = format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table));
            for _ in rows {
                self.conn.execute(&sql, [])?;
            }
            return Ok(self.conn.last_insert_rowid());
        }
        let per_statement = (MAX_BOUND_PARAMS / columns.len()).max(1);
        for chunk in rows.chunks(per_statement) {
            self.insert_chunk(table, columns, chunk)?;
        }
        Ok(self.conn.last_insert_rowid())
    }

    fn insert_one(&mut self, table: &str, row: &Row) -> MigrationResult<i64> {
        let columns = row.columns().to_vec();
        self.insert_many(table, &columns, std::slice::from_ref(row))
    }

    fn update(&mut self, table: &str, predicate: &str, values: &Row) -> MigrationResult<u64> {
        if values.is_empty() {
            return Ok(0);
        }
        let assignments = values
            .columns()
            .iter()
            .map(|c| format!("{} = ?", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("UPDATE {} SET {}", quote_ident(table), assignments);
        if !predicate.trim().is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(predicate);
        }
        debug!(target: "extupdate", event = "db_update", sql = %preview(&sql));
        let affected = self
            .conn
            .execute(&sql, params_from_iter(values.values().iter()))?;
        Ok(affected as u64)
    }

    fn delete(&mut self, table: &str, predicate: &str) -> MigrationResult<u64> {
        let mut sql = format!("DELETE FROM {}", quote_ident(table));
        if !predicate.trim().is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(predicate);
        }
        debug!(target: "extupdate", event = "db_delete", sql = %preview(&sql));
        let affected = self.conn.execute(&sql, [])?;
        Ok(affected as u64)
    }

    fn truncate(&mut self, table: &str) -> MigrationResult<()> {
        self.conn
            .execute(&format!("DELETE FROM {}", quote_ident(table)), [])?;
        // AUTOINCREMENT tables keep their counter in sqlite_sequence.
        let has_sequence: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence')",
            [],
            |row| row.get(0),
        )?;
        if has_sequence {
            self.conn
                .execute("DELETE FROM sqlite_sequence WHERE name = ?1", [table])?;
        }
        info!(target: "extupdate", event = "db_truncate", table = %table);
        Ok(())
    }

    fn list_tables(&mut self) -> MigrationResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tables)
    }

    fn begin(&mut self) -> MigrationResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> MigrationResult<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> MigrationResult<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> SqliteStorage {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .connection()
            .execute_batch(
                "CREATE TABLE items (uid INTEGER PRIMARY KEY, title TEXT, year INTEGER DEFAULT 0);",
            )
            .unwrap();
        storage
    }

    #[test]
    fn insert_many_returns_last_id_of_contiguous_block() {
        let mut storage = storage();
        let columns = vec!["title".to_string(), "year".to_string()];
        let rows: Vec<Row> = (0..5)
            .map(|i| Row::new().with("title", format!("t{i}")).with("year", 2000 + i))
            .collect();
        let last = storage.insert_many("items", &columns, &rows).unwrap();
        assert_eq!(last, 5);
        let selected = storage.select(&Select::from("items")).unwrap();
        let uids: Vec<i64> = selected.iter().filter_map(Row::uid).collect();
        assert_eq!(uids, vec![1, 2, 3, 4, 5]);
        assert_eq!(selected[4].get("title"), Some(&Value::Text("t4".into())));
    }

    #[test]
    fn insert_many_splits_large_batches() {
        let mut storage = storage();
        let columns = vec!["title".to_string(), "year".to_string()];
        let rows: Vec<Row> = (0..1200)
            .map(|i| Row::new().with("title", format!("t{i}")).with("year", i))
            .collect();
        let last = storage.insert_many("items", &columns, &rows).unwrap();
        assert_eq!(last, 1200);
        assert_eq!(storage.count("items", "").unwrap(), 1200);
    }

    #[test]
    fn rows_without_columns_use_defaults() {
        let mut storage = storage();
        let last = storage
            .insert_many("items", &[], &[Row::new(), Row::new()])
            .unwrap();
        assert_eq!(last, 2);
        assert_eq!(storage.count("items", "year = 0").unwrap(), 2);
    }

    #[test]
    fn truncate_empties_table() {
        let mut storage = storage();
        storage
            .insert_one("items", &Row::new().with("title", "a".to_string()))
            .unwrap();
        storage.truncate("items").unwrap();
        assert_eq!(storage.count("items", "").unwrap(), 0);
    }

    #[test]
    fn broken_select_reports_query() {
        let mut storage = storage();
        let err = storage
            .select(&Select::from("missing_table"))
            .unwrap_err();
        match err {
            MigrationError::StorageQueryFailed { query, .. } => {
                assert!(query.contains("missing_table"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rollback_discards_writes() {
        let mut storage = storage();
        storage.begin().unwrap();
        storage
            .insert_one("items", &Row::new().with("title", "a".to_string()))
            .unwrap();
        storage.rollback().unwrap();
        assert_eq!(storage.count("items", "").unwrap(), 0);
    }
}
