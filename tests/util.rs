#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use extupdate_lib::db::{SqliteStorage, Storage};
use rusqlite::types::Value;

pub const LEGACY_SCHEMA: &str = "\
    CREATE TABLE tx_oldnews_item (\
        uid INTEGER PRIMARY KEY,\
        pid INTEGER NOT NULL DEFAULT 0,\
        title TEXT,\
        category TEXT,\
        image INTEGER NOT NULL DEFAULT 0,\
        new_uid INTEGER NOT NULL DEFAULT 0\
    );\
    CREATE TABLE tx_news_item (\
        uid INTEGER PRIMARY KEY,\
        pid INTEGER NOT NULL DEFAULT 0,\
        headline TEXT,\
        category INTEGER,\
        image INTEGER NOT NULL DEFAULT 0\
    );\
    CREATE TABLE tx_news_category (\
        uid INTEGER PRIMARY KEY,\
        title TEXT\
    );\
    CREATE TABLE sys_file (\
        uid INTEGER PRIMARY KEY,\
        identifier TEXT NOT NULL,\
        name TEXT,\
        size INTEGER,\
        sha256 TEXT\
    );\
    CREATE TABLE sys_file_reference (\
        uid INTEGER PRIMARY KEY,\
        pid INTEGER NOT NULL DEFAULT 0,\
        uid_local INTEGER,\
        tablenames TEXT,\
        uid_foreign INTEGER,\
        fieldname TEXT,\
        crdate INTEGER\
    );\
";

pub fn memory_storage() -> SqliteStorage {
    let storage = SqliteStorage::open_in_memory().expect("open sqlite in memory");
    storage
        .connection()
        .execute_batch(LEGACY_SCHEMA)
        .expect("create legacy schema");
    storage
}

pub fn seed_items(storage: &SqliteStorage, count: usize) {
    let conn = storage.connection();
    for n in 1..=count {
        conn.execute(
            "INSERT INTO tx_oldnews_item (uid, pid, title, category) VALUES (?1, 3, ?2, ?3)",
            rusqlite::params![n as i64, format!("item {n}"), format!("cat {}", n % 3)],
        )
        .unwrap();
    }
}

pub fn column_i64(storage: &SqliteStorage, sql: &str) -> Vec<i64> {
    let mut stmt = storage.connection().prepare(sql).unwrap();
    let rows = stmt
        .query_map([], |row| row.get::<_, i64>(0))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    rows
}

pub fn count(storage: &mut SqliteStorage, table: &str) -> u64 {
    storage.count(table, "").unwrap()
}

pub fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}
