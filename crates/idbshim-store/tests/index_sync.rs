//! Index creation, backfill, lookup and retirement against SQLite files.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use idbshim_store::fakes::FaultyBackend;
use idbshim_store::telemetry::init_tracing;
use idbshim_store::{
    ConfigHandle, Connection, Factory, IndexOptions, Key, KeyQuery, KeyRange, ShimError,
    ShimResult, SqliteBackend, StoreOptions, TransactionMode, UpgradeContext, Value,
};
use serde_json::json;
use tracing::Level;

const MULTI: IndexOptions = IndexOptions {
    unique: false,
    multi_entry: true,
};

async fn create_people(ctx: UpgradeContext) -> ShimResult<()> {
    let store = ctx
        .connection
        .create_object_store(
            "people",
            StoreOptions {
                key_path: Some("id".into()),
                auto_increment: false,
            },
        )?
        .await?;
    store.put(json!({"id": 1, "tags": ["a", "b"]}), None)?.await?;
    store.put(json!({"id": 2, "tags": ["b", "c"]}), None)?.await?;
    Ok(())
}

async fn add_by_tag(ctx: UpgradeContext) -> ShimResult<()> {
    let store = ctx.transaction.object_store("people")?;
    store.create_index("byTag", "tags", MULTI)?.await?;
    Ok(())
}

async fn no_upgrade(_: UpgradeContext) -> ShimResult<()> {
    Ok(())
}

async fn close(conn: Connection) {
    conn.close();
    tokio::time::timeout(Duration::from_secs(5), conn.closed())
        .await
        .unwrap();
}

fn factory(dir: &tempfile::TempDir) -> Factory {
    init_tracing(false, Level::WARN);
    Factory::new(dir.path(), ConfigHandle::default())
}

async fn open_faulty(path: &Path) -> Arc<FaultyBackend> {
    let sqlite = SqliteBackend::open(path, Duration::from_secs(1)).await.unwrap();
    Arc::new(FaultyBackend::new(Arc::new(sqlite)))
}

fn record_id(value: &Value) -> Option<Key> {
    value.get("id").and_then(|id| Key::from_value(&id))
}

#[tokio::test]
async fn multi_entry_index_backfills_existing_rows() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir);
    close(factory.open("people-db", Some(1), create_people).await.unwrap()).await;

    let conn = factory.open("people-db", Some(2), add_by_tag).await.unwrap();
    let txn = conn.transaction(&["people"], TransactionMode::ReadOnly).unwrap();
    let index = txn.object_store("people").unwrap().index("byTag").unwrap();
    assert!(index.multi_entry());

    assert_eq!(index.count(None).unwrap().await.unwrap(), 4);
    assert_eq!(index.count(Some("b".into())).unwrap().await.unwrap(), 2);
    assert_eq!(index.count(Some("c".into())).unwrap().await.unwrap(), 1);
    assert_eq!(index.count(Some("z".into())).unwrap().await.unwrap(), 0);

    let hit = index.get(Some("b".into())).unwrap().await.unwrap().unwrap();
    let id = record_id(&hit).unwrap();
    assert!(id == Key::from(1) || id == Key::from(2));

    assert_eq!(
        index.get_key(Some("c".into())).unwrap().await.unwrap(),
        Some(Key::from(2))
    );
    assert!(index.get(Some("z".into())).unwrap().await.unwrap().is_none());
    txn.commit().unwrap();
    close(conn).await;
}

#[tokio::test]
async fn rows_without_a_key_are_not_indexed() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir);

    let conn = factory
        .open("mixed", Some(1), |ctx| async move {
            let store = ctx
                .connection
                .create_object_store(
                    "items",
                    StoreOptions {
                        key_path: Some("id".into()),
                        auto_increment: false,
                    },
                )?
                .await?;
            store.put(json!({"id": 1, "size": 3}), None)?.await?;
            store.put(json!({"id": 2}), None)?.await?;
            store.put(json!({"id": 3, "size": {"not": "a key"}}), None)?.await?;
            store.put(json!({"id": 4, "size": 1}), None)?.await?;
            store
                .create_index("bySize", "size", IndexOptions::default())?
                .await?;
            Ok::<(), ShimError>(())
        })
        .await
        .unwrap();

    let txn = conn.transaction(&["items"], TransactionMode::ReadOnly).unwrap();
    let store = txn.object_store("items").unwrap();
    let index = store.index("bySize").unwrap();
    assert_eq!(store.count().unwrap().await.unwrap(), 4);
    assert_eq!(index.count(None).unwrap().await.unwrap(), 2);

    // Index order: the smallest size comes first.
    let first = index.get(None).unwrap().await.unwrap().unwrap();
    assert_eq!(record_id(&first), Some(Key::from(4)));
    txn.commit().unwrap();
    close(conn).await;
}

#[tokio::test]
async fn writes_after_creation_maintain_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir);
    let conn = factory.open("people-db", Some(1), create_people).await.unwrap();
    close(conn).await;
    let conn = factory.open("people-db", Some(2), add_by_tag).await.unwrap();

    let txn = conn.transaction(&["people"], TransactionMode::ReadWrite).unwrap();
    let store = txn.object_store("people").unwrap();
    store
        .put(json!({"id": 3, "tags": ["c", "c", "d"]}), None)
        .unwrap()
        .await
        .unwrap();
    store
        .put(json!({"id": 1, "tags": []}), None)
        .unwrap()
        .await
        .unwrap();
    store.delete(2).unwrap().await.unwrap();

    let index = store.index("byTag").unwrap();
    // Only record 3 remains indexed; duplicates count once.
    assert_eq!(index.count(None).unwrap().await.unwrap(), 2);
    assert_eq!(index.count(Some("b".into())).unwrap().await.unwrap(), 0);
    assert_eq!(
        index.get_key(Some("d".into())).unwrap().await.unwrap(),
        Some(Key::from(3))
    );
    txn.commit().unwrap();
    close(conn).await;
}

#[tokio::test]
async fn multi_entry_lookup_rechecks_pattern_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir);

    let conn = factory
        .open("tags", Some(1), |ctx| async move {
            let store = ctx
                .connection
                .create_object_store(
                    "notes",
                    StoreOptions {
                        key_path: Some("id".into()),
                        auto_increment: false,
                    },
                )?
                .await?;
            store.create_index("byTag", "tags", MULTI)?.await?;
            store.put(json!({"id": 1, "tags": ["B"]}), None)?.await?;
            store.put(json!({"id": 2, "tags": ["b"]}), None)?.await?;
            store.put(json!({"id": 3, "tags": ["abc"]}), None)?.await?;
            store.put(json!({"id": 4, "tags": ["a_c", "xbx"]}), None)?.await?;
            Ok::<(), ShimError>(())
        })
        .await
        .unwrap();

    let txn = conn.transaction(&["notes"], TransactionMode::ReadOnly).unwrap();
    let index = txn.object_store("notes").unwrap().index("byTag").unwrap();

    // LIKE folds ASCII case, so "B" is a candidate for "b" and must be dropped.
    assert_eq!(index.count(Some("b".into())).unwrap().await.unwrap(), 1);
    assert_eq!(
        index.get_key(Some("b".into())).unwrap().await.unwrap(),
        Some(Key::from(2))
    );
    // `_` is escaped in the pattern rather than matching any character.
    assert_eq!(index.count(Some("a_c".into())).unwrap().await.unwrap(), 1);
    assert_eq!(
        index.get_key(Some("a_c".into())).unwrap().await.unwrap(),
        Some(Key::from(4))
    );
    txn.commit().unwrap();
    close(conn).await;
}

#[tokio::test]
async fn ranges_on_plain_and_multi_entry_indexes() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir);

    let conn = factory
        .open("ranges", Some(1), |ctx| async move {
            let store = ctx
                .connection
                .create_object_store(
                    "people",
                    StoreOptions {
                        key_path: Some("id".into()),
                        auto_increment: false,
                    },
                )?
                .await?;
            store
                .create_index("byAge", "age", IndexOptions::default())?
                .await?;
            store.create_index("byScore", "scores", MULTI)?.await?;
            for (id, age, scores) in [(1, 18, vec![1, 5]), (2, 25, vec![7]), (3, 31, vec![5, 9])] {
                store
                    .put(json!({"id": id, "age": age, "scores": scores}), None)?
                    .await?;
            }
            Ok::<(), ShimError>(())
        })
        .await
        .unwrap();

    let txn = conn.transaction(&["people"], TransactionMode::ReadOnly).unwrap();
    let store = txn.object_store("people").unwrap();
    let by_age = store.index("byAge").unwrap();
    let by_score = store.index("byScore").unwrap();

    let adults = KeyQuery::Range(KeyRange::bound(20, 40, false, true).unwrap());
    assert_eq!(by_age.count(Some(adults.clone())).unwrap().await.unwrap(), 2);
    assert_eq!(
        by_age.get_key(Some(adults)).unwrap().await.unwrap(),
        Some(Key::from(2))
    );
    let young = KeyQuery::Range(KeyRange::upper_bound(18, true));
    assert_eq!(by_age.count(Some(young)).unwrap().await.unwrap(), 0);

    let mid = KeyQuery::Range(KeyRange::bound(5, 7, false, false).unwrap());
    assert_eq!(by_score.count(Some(mid)).unwrap().await.unwrap(), 3);
    let high = KeyQuery::Range(KeyRange::lower_bound(8, false));
    assert_eq!(
        by_score.get_key(Some(high)).unwrap().await.unwrap(),
        Some(Key::from(3))
    );
    txn.commit().unwrap();
    close(conn).await;
}

#[tokio::test]
async fn multi_entry_hits_follow_their_first_matching_element() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir);

    let conn = factory
        .open("tags", Some(1), |ctx| async move {
            let store = ctx
                .connection
                .create_object_store(
                    "notes",
                    StoreOptions {
                        key_path: Some("id".into()),
                        auto_increment: false,
                    },
                )?
                .await?;
            store.create_index("byTag", "tags", MULTI)?.await?;
            store.put(json!({"id": 1, "tags": ["z", "a"]}), None)?.await?;
            store.put(json!({"id": 2, "tags": ["b"]}), None)?.await?;
            Ok::<(), ShimError>(())
        })
        .await
        .unwrap();

    let txn = conn.transaction(&["notes"], TransactionMode::ReadOnly).unwrap();
    let index = txn.object_store("notes").unwrap().index("byTag").unwrap();

    // Entries in index order: (a, 1), (b, 2), (z, 1).
    assert_eq!(
        index.get_key(None).unwrap().await.unwrap(),
        Some(Key::from(1))
    );
    let from_b = KeyQuery::Range(KeyRange::lower_bound("b", false));
    assert_eq!(
        index.get_key(Some(from_b.clone())).unwrap().await.unwrap(),
        Some(Key::from(2))
    );
    assert_eq!(index.count(Some(from_b)).unwrap().await.unwrap(), 2);
    let after_b = KeyQuery::Range(KeyRange::lower_bound("b", true));
    assert_eq!(
        index.get_key(Some(after_b)).unwrap().await.unwrap(),
        Some(Key::from(1))
    );
    txn.commit().unwrap();
    close(conn).await;
}

#[tokio::test]
async fn string_ranges_follow_code_unit_order() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir);

    let conn = factory
        .open("names", Some(1), |ctx| async move {
            let store = ctx
                .connection
                .create_object_store(
                    "people",
                    StoreOptions {
                        key_path: Some("id".into()),
                        auto_increment: false,
                    },
                )?
                .await?;
            store
                .create_index("byName", "name", IndexOptions::default())?
                .await?;
            for (id, name) in [(1, "\u{FFFF}"), (2, "\u{1F600}"), (3, "\u{E000}x"), (4, "a")] {
                store.put(json!({"id": id, "name": name}), None)?.await?;
            }
            Ok::<(), ShimError>(())
        })
        .await
        .unwrap();

    let txn = conn.transaction(&["people"], TransactionMode::ReadOnly).unwrap();
    let by_name = txn.object_store("people").unwrap().index("byName").unwrap();

    // As code units the emoji is a surrogate pair, below U+E000.
    let below_high = KeyQuery::Range(KeyRange::upper_bound("\u{E000}", true));
    assert_eq!(by_name.count(Some(below_high)).unwrap().await.unwrap(), 2);
    let up_to_max = KeyQuery::Range(KeyRange::upper_bound("\u{FFFF}", false));
    assert_eq!(by_name.count(Some(up_to_max)).unwrap().await.unwrap(), 4);
    let astral = KeyQuery::Range(KeyRange::lower_bound("\u{10000}", false));
    assert_eq!(
        by_name.get_key(Some(astral.clone())).unwrap().await.unwrap(),
        Some(Key::from(2))
    );
    assert_eq!(by_name.count(Some(astral)).unwrap().await.unwrap(), 3);
    assert_eq!(
        by_name.get_key(Some("\u{FFFF}".into())).unwrap().await.unwrap(),
        Some(Key::from(1))
    );
    txn.commit().unwrap();
    close(conn).await;
}

#[tokio::test]
async fn deleted_index_column_is_reused_and_cleared() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir);

    close(factory.open("people-db", Some(1), create_people).await.unwrap()).await;
    close(factory.open("people-db", Some(2), add_by_tag).await.unwrap()).await;

    let conn = factory
        .open("people-db", Some(3), |ctx| async move {
            let store = ctx.transaction.object_store("people")?;
            store.delete_index("byTag")?.await?;
            assert!(store.index_names().is_empty());
            assert!(matches!(store.index("byTag"), Err(ShimError::NotFound(_))));
            Ok::<(), ShimError>(())
        })
        .await
        .unwrap();
    close(conn).await;

    // The tombstone survived the reopen, so the column is reused instead of
    // added a second time; old multi-entry values must not leak through.
    let conn = factory
        .open("people-db", Some(4), |ctx| async move {
            let store = ctx.transaction.object_store("people")?;
            store.put(json!({"id": 5, "tags": ["q"], "nick": "e"}), None)?.await?;
            store
                .create_index("byTag", "nick", IndexOptions::default())?
                .await?;
            Ok::<(), ShimError>(())
        })
        .await
        .unwrap();

    let txn = conn.transaction(&["people"], TransactionMode::ReadOnly).unwrap();
    let index = txn.object_store("people").unwrap().index("byTag").unwrap();
    assert!(!index.multi_entry());
    assert_eq!(index.count(None).unwrap().await.unwrap(), 1);
    assert_eq!(
        index.get_key(Some("e".into())).unwrap().await.unwrap(),
        Some(Key::from(5))
    );
    txn.commit().unwrap();
    close(conn).await;
}

#[tokio::test]
async fn unique_index_rejects_conflicting_writes() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir);

    let conn = factory
        .open("users", Some(1), |ctx| async move {
            let store = ctx
                .connection
                .create_object_store(
                    "users",
                    StoreOptions {
                        key_path: Some("id".into()),
                        auto_increment: false,
                    },
                )?
                .await?;
            store
                .create_index(
                    "byEmail",
                    "email",
                    IndexOptions {
                        unique: true,
                        multi_entry: false,
                    },
                )?
                .await?;
            store
                .put(json!({"id": 1, "email": "ada@example.com"}), None)?
                .await?;
            Ok::<(), ShimError>(())
        })
        .await
        .unwrap();

    let txn = conn.transaction(&["users"], TransactionMode::ReadWrite).unwrap();
    let store = txn.object_store("users").unwrap();
    // Rewriting the same record keeps its own entry.
    store
        .put(json!({"id": 1, "email": "ada@example.com", "v": 2}), None)
        .unwrap()
        .await
        .unwrap();
    let err = store
        .put(json!({"id": 2, "email": "ada@example.com"}), None)
        .unwrap()
        .await
        .unwrap_err();
    assert!(matches!(err, ShimError::Constraint(_)));
    assert!(!txn.is_active());
    close(conn).await;
}

#[tokio::test]
async fn unique_index_over_duplicates_fails_to_build() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir);
    close(factory.open("people-db", Some(1), create_people).await.unwrap()).await;

    let err = factory
        .open("people-db", Some(2), |ctx| async move {
            let store = ctx.transaction.object_store("people")?;
            store
                .create_index(
                    "firstTag",
                    "tags.length",
                    IndexOptions {
                        unique: true,
                        multi_entry: false,
                    },
                )?
                .await?;
            Ok::<(), ShimError>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ShimError::Constraint(_)));

    let conn = factory.open("people-db", None, no_upgrade).await.unwrap();
    assert_eq!(conn.version(), 1);
    close(conn).await;
}

#[tokio::test]
async fn backfill_failure_aborts_index_creation() {
    init_tracing(false, Level::WARN);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("people.sqlite");
    let factory = Factory::new(dir.path(), ConfigHandle::default());

    let backend = open_faulty(&path).await;
    let conn = factory
        .open_with_backend("people", backend.clone(), Some(1), create_people)
        .await
        .unwrap();
    close(conn).await;

    let backend = open_faulty(&path).await;
    backend.fail_on("SET \"I_by^Tag\" = ?");
    let err = factory
        .open_with_backend("people", backend.clone(), Some(2), add_by_tag)
        .await
        .unwrap_err();
    match &err {
        ShimError::Backend { context, message } => {
            assert_eq!(context, "Could not create index \"byTag\"");
            assert!(message.contains("injected failure"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(backend.executed().iter().any(|sql| sql == "ROLLBACK"));

    // The column addition was rolled back with the upgrade.
    let backend = open_faulty(&path).await;
    let conn = factory
        .open_with_backend("people", backend, Some(2), add_by_tag)
        .await
        .unwrap();
    let txn = conn.transaction(&["people"], TransactionMode::ReadOnly).unwrap();
    let index = txn.object_store("people").unwrap().index("byTag").unwrap();
    assert_eq!(index.count(None).unwrap().await.unwrap(), 4);
    txn.commit().unwrap();
    close(conn).await;
}
