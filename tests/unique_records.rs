#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use extupdate_lib::migrate::{ColumnMap, Condition, Conditions, Engine, MigrationError};
use rusqlite::types::Value;
use util::{column_i64, count, memory_storage, seed_items};

fn categories() -> ColumnMap {
    ColumnMap::new().map("category", "title")
}

#[test]
fn categories_are_created_once_and_written_back() {
    let mut storage = memory_storage();
    seed_items(&storage, 6);
    storage
        .connection()
        .execute_batch("ALTER TABLE tx_oldnews_item ADD COLUMN category_uid INTEGER NOT NULL DEFAULT 0;")
        .unwrap();

    {
        let mut engine = Engine::new(&mut storage);
        let records = engine
            .create_unique_records_from_values(
                "tx_oldnews_item",
                "tx_news_category",
                &categories(),
                &Conditions::new(),
                100,
            )
            .unwrap();
        assert_eq!(records.inserted, 3);
        assert_eq!(records.matched, 0);

        let values: Vec<(Value, Conditions)> = records
            .uid_map
            .iter()
            .map(|(uid, tuple)| (Value::Integer(*uid), Conditions::matching(tuple.iter())))
            .collect();
        let updated = engine
            .update_property_by_condition("tx_oldnews_item", "category_uid", &values)
            .unwrap();
        assert_eq!(updated, 6);
    }

    assert_eq!(count(&mut storage, "tx_news_category"), 3);
    let wrong = column_i64(
        &storage,
        "SELECT COUNT(*) FROM tx_oldnews_item o JOIN tx_news_category c ON c.uid = o.category_uid \
         WHERE c.title <> o.category",
    );
    assert_eq!(wrong, vec![0]);
}

#[test]
fn second_run_reuses_existing_records() {
    let mut storage = memory_storage();
    seed_items(&storage, 3);
    let mut engine = Engine::new(&mut storage);
    engine
        .create_unique_records_from_values(
            "tx_oldnews_item",
            "tx_news_category",
            &categories(),
            &Conditions::new(),
            100,
        )
        .unwrap();
    let again = engine
        .create_unique_records_from_values(
            "tx_oldnews_item",
            "tx_news_category",
            &categories(),
            &Conditions::new(),
            100,
        )
        .unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(again.matched, 3);
    assert_eq!(engine.storage().count("tx_news_category", "").unwrap(), 3);
}

#[test]
fn filtered_out_source_reports_no_unique_data() {
    let mut storage = memory_storage();
    seed_items(&storage, 2);
    let mut engine = Engine::new(&mut storage);
    let none = Conditions::new().and("pid", Condition::equals(99));
    let err = engine
        .create_unique_records_from_values(
            "tx_oldnews_item",
            "tx_news_category",
            &categories(),
            &none,
            100,
        )
        .unwrap_err();
    assert!(matches!(err, MigrationError::NoUniqueData { .. }));
    assert_eq!(err.code(), "MIGRATE/NO_UNIQUE_DATA");
}

#[test]
fn default_limit_handles_thousands_of_tuples() {
    let mut storage = memory_storage();
    storage
        .connection()
        .execute_batch(
            "INSERT INTO tx_oldnews_item (title, category)
                 WITH RECURSIVE n(x) AS (SELECT 0 UNION ALL SELECT x + 1 FROM n WHERE x < 3999)
                 SELECT 'item ' || x, 'cat ' || (x % 2000) FROM n;
             INSERT INTO tx_news_category (title)
                 WITH RECURSIVE n(x) AS (SELECT 0 UNION ALL SELECT x + 1 FROM n WHERE x < 599)
                 SELECT 'cat ' || x FROM n;",
        )
        .unwrap();

    let mut engine = Engine::new(&mut storage);
    let records = engine
        .create_unique_records_from_values(
            "tx_oldnews_item",
            "tx_news_category",
            &categories(),
            &Conditions::new(),
            10_000,
        )
        .unwrap();
    assert_eq!(records.matched, 600);
    assert_eq!(records.inserted, 1400);
    assert_eq!(records.uid_map.len(), 2000);
    assert_eq!(engine.storage().count("tx_news_category", "").unwrap(), 2000);
}
