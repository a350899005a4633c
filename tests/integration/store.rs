use std::time::Duration;

use scatter_core::ObjectId;
use scatter_services::{
    parse_peer_list, peer_string_lists, publish_peer_list, PeerListKind, StoreError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::*;

/// Write through one cache, wipe it, read back through the remote.
#[tokio::test]
async fn test_http_round_trip_after_clearing_cache() -> Result<()> {
    init_tracing();
    let server = start_dav_server().await?;
    let store = node_store(&server)?;
    let id = ObjectId::random();

    let mut w = store.create_wo(&id)?;
    w.write_all(b"hello").await?;
    w.close().await?;
    assert!(server.root.join(scatter_services::remote::object_path(&id)).is_file());

    store.clear_local();
    assert_eq!(store.local_count(), 0);

    let mut r = store.open_ro(&id, Duration::from_secs(5)).await?;
    let mut text = String::new();
    r.read_to_string(&mut text).await?;
    assert_eq!(text, "hello");
    assert_eq!(store.local_count(), 1);

    let _ = std::fs::remove_dir_all(store.local_root());
    Ok(())
}

#[tokio::test]
async fn test_second_node_sees_object_and_mtime() -> Result<()> {
    init_tracing();
    let server = start_dav_server().await?;
    let a = node_store(&server)?;
    let b = node_store(&server)?;
    let id = ObjectId::random();

    assert!(!b.exists(&id).await?);
    assert_eq!(b.get_mtime(&id).await?, None);

    assert!(a.put(&id, b"shared").await?);
    assert!(b.exists(&id).await?, "remote HEAD finds it");
    assert!(b.get_mtime(&id).await?.is_some(), "Last-Modified is parsed");
    assert_eq!(&b.load(&id, Duration::from_secs(5)).await?[..], b"shared");

    // Same id, second writer: no-op rather than an error.
    assert!(!b.put(&id, b"shared").await?);

    for s in [&a, &b] {
        let _ = std::fs::remove_dir_all(s.local_root());
    }
    Ok(())
}

#[tokio::test]
async fn test_reader_waits_for_upload() -> Result<()> {
    init_tracing();
    let server = start_dav_server().await?;
    let producer = node_store(&server)?;
    let consumer = node_store(&server)?;
    let id = ObjectId::random();

    let upload = {
        let producer = producer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            producer.put(&id, b"eventually").await
        })
    };
    let data = consumer.load(&id, Duration::from_secs(5)).await?;
    assert_eq!(&data[..], b"eventually");
    assert!(upload.await??);

    for s in [&producer, &consumer] {
        let _ = std::fs::remove_dir_all(s.local_root());
    }
    Ok(())
}

#[tokio::test]
async fn test_missing_object_times_out() -> Result<()> {
    init_tracing();
    let server = start_dav_server().await?;
    let store = node_store(&server)?;
    let err = store
        .open_ro(&ObjectId::random(), Duration::from_millis(300))
        .await
        .err()
        .context("open_ro should time out")?;
    assert!(matches!(err, StoreError::Timeout { .. }), "{err}");
    let _ = std::fs::remove_dir_all(store.local_root());
    Ok(())
}

#[tokio::test]
async fn test_erase_is_idempotent_over_http() -> Result<()> {
    init_tracing();
    let server = start_dav_server().await?;
    let store = node_store(&server)?;
    let id = ObjectId::random();
    store.put(&id, b"short-lived").await?;

    store.erase(&id).await?;
    assert!(!store.exists(&id).await?);
    store.erase(&id).await?;

    let _ = std::fs::remove_dir_all(store.local_root());
    Ok(())
}

#[tokio::test]
async fn test_upload_failure_leaves_nothing_behind() -> Result<()> {
    init_tracing();
    let server = start_dav_server().await?;
    // The server only serves /objects; everything else is refused.
    let elsewhere = server.url.replace("/objects", "/elsewhere");
    let store = ObjectStore::new(temp_dir("node"), Some(RemoteBackend::http(&elsewhere)?))?;
    let id = ObjectId::random();

    let mut w = store.create_wo(&id)?;
    w.write_all(b"lost").await?;
    assert!(matches!(w.close().await, Err(StoreError::Remote(_))));
    assert!(!store.local_path(&id).exists(), "local copy rolled back");

    let _ = std::fs::remove_dir_all(store.local_root());
    Ok(())
}

#[tokio::test]
async fn test_peer_lists_through_remote() -> Result<()> {
    init_tracing();
    let server = start_dav_server().await?;
    let publisher = node_store(&server)?;
    let reader = node_store(&server)?;

    let workers = vec!["10.1.0.1:7000".parse()?, "10.1.0.2:7000".parse()?];
    publish_peer_list(&publisher, PeerListKind::Worker, &workers).await?;
    publish_peer_list(&publisher, PeerListKind::Client, &["10.1.0.9:6000".parse()?]).await?;

    let lists = peer_string_lists(&reader, Duration::from_secs(5)).await?;
    assert_eq!(lists.clients, vec!["10.1.0.9:6000".to_string()]);
    assert_eq!(parse_peer_list(&lists.workers.join("\n"))?, workers);

    // Republishing replaces the list, and readers see the new one.
    publish_peer_list(&publisher, PeerListKind::Worker, &workers[..1]).await?;
    let lists = peer_string_lists(&reader, Duration::from_secs(5)).await?;
    assert_eq!(lists.workers, vec!["10.1.0.1:7000".to_string()]);

    for s in [&publisher, &reader] {
        let _ = std::fs::remove_dir_all(s.local_root());
    }
    Ok(())
}
