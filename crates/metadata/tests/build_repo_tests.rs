//! Build repository behavior against a temporary SQLite database.

use mirror_core::{BuildHashes, BuildId};
use mirror_metadata::{
    BuildFilter, BuildOrder, BuildRepo, BuildUpsert, MetadataStore, Patch, SqliteStore,
};
use std::sync::Arc;
use tempfile::TempDir;

async fn open_store() -> (SqliteStore, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("mirror.db"), None)
        .await
        .unwrap();
    (store, dir)
}

fn build(device: &str, version: &str, filename: &str, date: &str) -> BuildUpsert {
    BuildUpsert {
        filename: filename.to_string(),
        device: device.to_string(),
        version: version.to_string(),
        date: date.to_string(),
        size: 1024,
        hashes: BuildHashes::compute(filename.as_bytes()),
        signature_valid: true,
        available_upstream: Some(true),
        local_path: Patch::Set(format!("{device}/{version}/{filename}")),
        remote_url: Patch::Keep,
    }
}

#[tokio::test]
async fn upsert_inserts_then_updates_same_row() {
    let (store, _dir) = open_store().await;

    let first = store
        .upsert_build(&build("oneplus3", "20.0", "a.zip", "20240101"))
        .await
        .unwrap();
    assert_eq!(first.local_path.as_deref(), Some("oneplus3/20.0/a.zip"));
    assert!(first.remote_url.is_none());
    assert!(first.available_upstream);

    let promoted = store
        .upsert_build(&BuildUpsert::storage_patch(
            &first,
            Patch::Keep,
            Patch::Set("https://cdn/a.zip".to_string()),
        ))
        .await
        .unwrap();
    assert_eq!(promoted.id, first.id);
    assert_eq!(promoted.local_path, first.local_path);
    assert_eq!(promoted.remote_url.as_deref(), Some("https://cdn/a.zip"));
    assert!(promoted.available_upstream, "None keeps the stored flag");

    let pruned = store
        .upsert_build(&BuildUpsert::storage_patch(
            &promoted,
            Patch::Clear,
            Patch::Keep,
        ))
        .await
        .unwrap();
    assert!(pruned.local_path.is_none());
    assert_eq!(pruned.remote_url.as_deref(), Some("https://cdn/a.zip"));

    let all = store.list_builds(&BuildFilter::default()).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn insert_with_keep_patches_leaves_columns_empty() {
    let (store, _dir) = open_store().await;
    let mut upsert = build("bacon", "18.1", "b.zip", "20230101");
    upsert.local_path = Patch::Keep;
    upsert.available_upstream = None;

    let row = store.upsert_build(&upsert).await.unwrap();
    assert!(row.local_path.is_none());
    assert!(!row.available_upstream);
    assert!(row.availability().is_superseded());
}

#[tokio::test]
async fn same_filename_with_new_hash_is_a_new_build() {
    let (store, _dir) = open_store().await;
    let original = build("bacon", "18.1", "b.zip", "20230101");
    let mut republished = original.clone();
    republished.hashes = BuildHashes::compute(b"different bytes");

    let a = store.upsert_build(&original).await.unwrap();
    let b = store.upsert_build(&republished).await.unwrap();
    assert_ne!(a.id, b.id);
}

#[tokio::test]
async fn find_build_and_identity() {
    let (store, _dir) = open_store().await;
    let upsert = build("oneplus3", "20.0", "a.zip", "20240101");
    let row = store.upsert_build(&upsert).await.unwrap();

    let found = store.find_build(row.build_id()).await.unwrap().unwrap();
    assert_eq!(found.filename, "a.zip");
    assert!(store.find_build(BuildId::new(9999)).await.unwrap().is_none());

    let by_identity = store
        .find_build_by_identity("oneplus3", "20.0", "a.zip", &upsert.hashes.sha256)
        .await
        .unwrap();
    assert_eq!(by_identity.map(|r| r.id), Some(row.id));

    let stored = store
        .find_stored_by_sha256(&upsert.hashes.sha256)
        .await
        .unwrap();
    assert_eq!(stored.map(|r| r.id), Some(row.id));
}

#[tokio::test]
async fn list_orders_by_availability_then_date() {
    let (store, _dir) = open_store().await;

    let old_local = store
        .upsert_build(&build("d", "1", "old.zip", "20240101"))
        .await
        .unwrap();
    let new_local = store
        .upsert_build(&build("d", "1", "new.zip", "20240301"))
        .await
        .unwrap();
    let remote = store
        .upsert_build(&build("d", "1", "remote.zip", "20230101"))
        .await
        .unwrap();
    store
        .upsert_build(&BuildUpsert::storage_patch(
            &remote,
            Patch::Clear,
            Patch::Set("https://cdn/remote.zip".to_string()),
        ))
        .await
        .unwrap();
    let mut superseded = build("d", "1", "gone.zip", "20250101");
    superseded.local_path = Patch::Keep;
    let superseded = store.upsert_build(&superseded).await.unwrap();

    let ids: Vec<i64> = store
        .list_builds(&BuildFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![remote.id, new_local.id, old_local.id, superseded.id]);

    let stored: Vec<i64> = store
        .list_builds(&BuildFilter::stored_in("d", "1"))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(stored, vec![new_local.id, old_local.id]);

    let not_stored = store
        .list_builds(&BuildFilter {
            stored: Some(false),
            order: BuildOrder::Newest,
            ..BuildFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(not_stored.len(), 2);
}

#[tokio::test]
async fn stored_groups_and_upstream_devices() {
    let (store, _dir) = open_store().await;
    store
        .upsert_build(&build("a", "1", "x.zip", "20240101"))
        .await
        .unwrap();
    store
        .upsert_build(&build("a", "2", "y.zip", "20240101"))
        .await
        .unwrap();
    let mut gone = build("b", "1", "z.zip", "20240101");
    gone.local_path = Patch::Keep;
    gone.available_upstream = Some(false);
    store.upsert_build(&gone).await.unwrap();

    assert_eq!(
        store.stored_groups().await.unwrap(),
        vec![
            ("a".to_string(), "1".to_string()),
            ("a".to_string(), "2".to_string())
        ]
    );
    assert_eq!(store.upstream_devices().await.unwrap(), vec!["a"]);
}

#[tokio::test]
async fn set_upstream_availability_replaces_flags() {
    let (store, _dir) = open_store().await;
    store
        .upsert_build(&build("a", "1", "x.zip", "20240101"))
        .await
        .unwrap();
    store
        .upsert_build(&build("a", "1", "y.zip", "20240102"))
        .await
        .unwrap();

    let flagged = store
        .set_upstream_availability("a", &["y.zip".to_string()])
        .await
        .unwrap();
    assert_eq!(flagged, 1);

    let rows = store.list_builds(&BuildFilter::default()).await.unwrap();
    for row in rows {
        assert_eq!(row.available_upstream, row.filename == "y.zip");
    }
}

#[tokio::test]
async fn statistics_on_empty_and_populated_store() {
    let (store, _dir) = open_store().await;

    let empty = store.statistics().await.unwrap();
    assert_eq!(empty.build_count_known, 0);
    assert_eq!(empty.build_size_average, None);

    store
        .upsert_build(&build("a", "1", "x.zip", "20240101"))
        .await
        .unwrap();
    let mut other = build("b", "2", "y.zip", "20240101");
    other.size = 3072;
    other.local_path = Patch::Keep;
    store.upsert_build(&other).await.unwrap();

    let stats = store.statistics().await.unwrap();
    assert_eq!(stats.build_count_known, 2);
    assert_eq!(stats.build_size_known, 4096);
    assert_eq!(stats.build_count_stored, 1);
    assert_eq!(stats.build_size_stored, 1024);
    assert_eq!(stats.device_count, 2);
    assert_eq!(stats.device_version_count, 2);
    assert_eq!(stats.build_size_average, Some(2048.0));
}

#[tokio::test]
async fn concurrent_upserts_converge_on_one_row() {
    let (store, _dir) = open_store().await;
    let store: Arc<dyn MetadataStore> = Arc::new(store);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .upsert_build(&build("a", "1", "x.zip", "20240101"))
                .await
                .unwrap()
                .id
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
}
