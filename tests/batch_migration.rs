#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use std::collections::{BTreeMap, BTreeSet};

use extupdate_lib::db::Row;
use extupdate_lib::migrate::{
    Conditions, Engine, MigrationError, NoProgress, PropertyMap, ValueReference,
};
use proptest::prelude::*;
use util::{column_i64, count, memory_storage, seed_items};

fn item_map() -> PropertyMap {
    PropertyMap::new()
        .copy("pid", "pid")
        .copy("title", "headline")
        .value_reference(
            "category",
            ValueReference {
                foreign_table: "tx_news_category".into(),
                foreign_field: "uid".into(),
                value_field: "title".into(),
                target_property: "category".into(),
                unique_by: Vec::new(),
            },
        )
}

#[test]
fn full_run_marks_everything_and_second_run_has_no_data() {
    let mut storage = memory_storage();
    seed_items(&storage, 7);

    {
        let mut engine = Engine::new(&mut storage);
        let migrated = engine
            .migrate_with_reference_uid(
                "tx_oldnews_item",
                "tx_news_item",
                &item_map(),
                "new_uid",
                &Conditions::new(),
                3,
                &mut NoProgress,
            )
            .unwrap();
        assert_eq!(migrated, 7);

        let err = engine
            .migrate_with_reference_uid(
                "tx_oldnews_item",
                "tx_news_item",
                &item_map(),
                "new_uid",
                &Conditions::new(),
                3,
                &mut NoProgress,
            )
            .unwrap_err();
        assert!(matches!(err, MigrationError::NoData { .. }));
        assert!(err.is_nothing_to_do());
    }

    assert_eq!(count(&mut storage, "tx_news_item"), 7);
    // three distinct category values become three value objects
    assert_eq!(count(&mut storage, "tx_news_category"), 3);
    let unmarked = column_i64(
        &storage,
        "SELECT COUNT(*) FROM tx_oldnews_item WHERE new_uid = 0",
    );
    assert_eq!(unmarked, vec![0]);
}

#[test]
fn value_references_point_at_matching_category_rows() {
    let mut storage = memory_storage();
    seed_items(&storage, 4);
    let mut engine = Engine::new(&mut storage);
    engine
        .migrate_with_reference_uid(
            "tx_oldnews_item",
            "tx_news_item",
            &item_map(),
            "new_uid",
            &Conditions::new(),
            10,
            &mut NoProgress,
        )
        .unwrap();
    assert_eq!(engine.references().len(), 3);
    drop(engine);

    let mismatched = column_i64(
        &storage,
        "SELECT COUNT(*) FROM tx_oldnews_item o \
         JOIN tx_news_item n ON n.uid = o.new_uid \
         JOIN tx_news_category c ON c.uid = n.category \
         WHERE c.title <> o.category",
    );
    assert_eq!(mismatched, vec![0]);
}

#[test]
fn delete_source_drains_and_reports_each_uid_map() {
    let mut storage = memory_storage();
    seed_items(&storage, 5);
    let map = PropertyMap::new().copy("title", "headline");

    let mut engine = Engine::new(&mut storage);
    let mut seen = BTreeMap::new();
    loop {
        match engine.migrate_and_delete_source("tx_oldnews_item", "tx_news_item", &map, 2) {
            Ok(outcome) => {
                seen.extend(outcome.uid_map);
                if outcome.truncated {
                    break;
                }
            }
            Err(err) if err.is_nothing_to_do() => break,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    drop(engine);

    assert_eq!(seen.len(), 5);
    assert_eq!(count(&mut storage, "tx_oldnews_item"), 0);
    assert_eq!(count(&mut storage, "tx_news_item"), 5);
}

fn migrated_pairs(total: usize, limit: usize) -> BTreeMap<i64, i64> {
    let mut storage = memory_storage();
    seed_items(&storage, total);
    let map = PropertyMap::new().copy("title", "headline");
    let mut engine = Engine::new(&mut storage);
    engine
        .migrate_with_reference_uid(
            "tx_oldnews_item",
            "tx_news_item",
            &map,
            "new_uid",
            &Conditions::new(),
            limit,
            &mut NoProgress,
        )
        .unwrap();
    drop(engine);

    let mut stmt = storage
        .connection()
        .prepare("SELECT uid, new_uid FROM tx_oldnews_item")
        .unwrap();
    let pairs = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
        .unwrap()
        .collect::<Result<BTreeMap<_, _>, _>>()
        .unwrap();
    pairs
}

proptest! {
    #[test]
    fn uid_map_is_a_bijection_for_any_batch_size(total in 1usize..24, extra in 0usize..2) {
        for limit in [1, total, total + extra + 1] {
            let pairs = migrated_pairs(total, limit);
            prop_assert_eq!(pairs.len(), total);
            let targets: BTreeSet<i64> = pairs.values().copied().collect();
            prop_assert_eq!(targets.len(), total);
            prop_assert!(targets.iter().all(|uid| *uid > 0));
        }
    }
}

fn migrate_items(engine: &mut Engine<'_>) -> Result<u64, MigrationError> {
    engine.migrate_with_reference_uid(
        "tx_oldnews_item",
        "tx_news_item",
        &item_map(),
        "new_uid",
        &Conditions::new(),
        10,
        &mut NoProgress,
    )
}

#[test]
fn rolled_back_batch_does_not_leave_stale_references() {
    let mut storage = memory_storage();
    seed_items(&storage, 3);
    storage
        .connection()
        .execute_batch(
            "UPDATE tx_oldnews_item SET title = 'blocked' WHERE uid = 2;
             CREATE TRIGGER reject_blocked BEFORE INSERT ON tx_news_item
             WHEN NEW.headline = 'blocked'
             BEGIN SELECT RAISE(ABORT, 'blocked headline'); END;",
        )
        .unwrap();

    {
        let mut engine = Engine::new(&mut storage);
        assert!(migrate_items(&mut engine).is_err());
        assert!(engine.references().is_empty());
        assert_eq!(engine.storage().count("tx_news_category", "").unwrap(), 0);

        let fixed = Row::new().with("title", "fixed".to_string());
        engine
            .storage()
            .update("tx_oldnews_item", "uid = 2", &fixed)
            .unwrap();
        assert_eq!(migrate_items(&mut engine).unwrap(), 3);
    }

    assert_eq!(count(&mut storage, "tx_news_category"), 3);
    let dangling = column_i64(
        &storage,
        "SELECT COUNT(*) FROM tx_news_item n LEFT JOIN tx_news_category c ON c.uid = n.category \
         WHERE c.uid IS NULL",
    );
    assert_eq!(dangling, vec![0]);
}
