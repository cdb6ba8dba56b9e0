//! Content store behaviour under concurrent writers and readers

mod common;

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tilecraft::{CacheKey, ContentStore, Fingerprint};
use tilecraft::utils::file_stamp;

fn payload() -> Vec<u8> {
    (0..256 * 1024).map(|i| (i % 251) as u8).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_observe_a_partial_entry() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("archive.mbtiles");
    let expected = payload();
    tokio::fs::write(&source, &expected).await.unwrap();

    let store = ContentStore::new(dir.path().join("cache")).with_commit_delay(Duration::from_millis(50));
    let key = CacheKey::new("tiles:race:0,0,1,1").with_extension("mbtiles");
    let expected = Arc::new(expected);

    let mut writers = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let key = key.clone();
        let source = source.clone();
        writers.push(tokio::spawn(async move { store.try_put(&key, &source).await }));
    }

    let mut readers = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let key = key.clone();
        let expected = Arc::clone(&expected);
        readers.push(tokio::spawn(async move {
            let mut complete_reads = 0u32;
            for _ in 0..40 {
                if let Some(path) = store.get(&key).await {
                    let content = tokio::fs::read(&path).await.unwrap();
                    assert_eq!(content.len(), expected.len(), "partial entry observed");
                    assert!(content == *expected, "corrupted entry observed");
                    complete_reads += 1;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            complete_reads
        }));
    }

    for writer in writers {
        let path = writer.await.unwrap().unwrap();
        assert_eq!(path, store.entry_path(&key));
    }
    for reader in readers {
        reader.await.unwrap();
    }

    // One entry and no leftover temp files
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(store.root()).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    assert_eq!(names, vec![key.file_name()]);
    assert_eq!(store.size().await.unwrap(), expected.len() as u64);
}

#[tokio::test]
async fn derived_keys_follow_input_stamps() {
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("raw.osm");
    tokio::fs::write(&raw, common::OSM_XML).await.unwrap();

    let key = |stamp| {
        Fingerprint::new("features:water:0,0,1,1")
            .input("raw", stamp)
            .param("zoom", 14)
            .finish()
    };

    let first = key(file_stamp(&raw).await.unwrap());
    let again = key(file_stamp(&raw).await.unwrap());
    assert_eq!(first, again);

    tokio::fs::write(&raw, format!("{}\n<!-- refreshed -->", common::OSM_XML))
        .await
        .unwrap();
    let changed = key(file_stamp(&raw).await.unwrap());
    assert_ne!(first, changed);
}

#[tokio::test]
async fn cache_failure_falls_back_to_the_source() {
    let dir = TempDir::new().unwrap();
    // A regular file where the store root should be makes every write fail
    let blocked_root = dir.path().join("not-a-dir");
    tokio::fs::write(&blocked_root, b"x").await.unwrap();
    let source = dir.path().join("layer.geojson");
    tokio::fs::write(&source, common::WATER_GEOJSON).await.unwrap();

    let store = ContentStore::new(&blocked_root);
    let key = CacheKey::new("features:water").with_extension("geojson");

    assert!(store.try_put(&key, &source).await.is_err());
    assert_eq!(store.put(&key, &source).await, source);
    assert!(store.get(&key).await.is_none());
}
