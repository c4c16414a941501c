//! Shard sync between a master file server and a rank over TCP

mod common;

use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tpi_node::model::synthetic::tiny_architecture;
use tpi_node::model::{rank_dir, RankShardManifest};
use tpi_node::sync::{ShardFileServer, SyncClient, SyncOptions, TcpConnector};
use tpi_node::NodeError;

async fn start_server(split_dir: &Path, world_size: usize) -> String {
    let listener = ShardFileServer::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(ShardFileServer::new(split_dir, world_size).run(listener));
    addr
}

fn file_count() -> usize {
    tiny_architecture().num_layers + 2
}

#[tokio::test]
async fn test_second_sync_downloads_nothing() {
    let dir = TempDir::new().unwrap();
    let split = common::tiny_split(dir.path(), 2);
    let addr = start_server(&split, 2).await;
    let local = dir.path().join("rank1").join("node_1");

    let client = SyncClient::new(TcpConnector::new(&addr), 1, &local, SyncOptions::default());
    let first = client.sync().await.unwrap();
    assert_eq!(first.downloaded, file_count());
    assert!(first.bytes > 0);

    let master = RankShardManifest::load(&rank_dir(&split, 1)).unwrap();
    assert_eq!(RankShardManifest::load(&local).unwrap(), master);
    for entry in &master.files {
        assert_eq!(
            std::fs::read(local.join(&entry.file)).unwrap(),
            std::fs::read(rank_dir(&split, 1).join(&entry.file)).unwrap()
        );
    }

    let second = client.sync().await.unwrap();
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.skipped, file_count());
}

#[tokio::test]
async fn test_force_download_refetches_everything() {
    let dir = TempDir::new().unwrap();
    let split = common::tiny_split(dir.path(), 2);
    let addr = start_server(&split, 2).await;
    let local = dir.path().join("node_1");

    SyncClient::new(TcpConnector::new(&addr), 1, &local, SyncOptions::default())
        .sync()
        .await
        .unwrap();

    let forced = SyncOptions {
        force_download: true,
        ..Default::default()
    };
    let report = SyncClient::new(TcpConnector::new(&addr), 1, &local, forced)
        .sync()
        .await
        .unwrap();
    assert_eq!(report.downloaded, file_count());
    assert_eq!(report.skipped, 0);
}

#[tokio::test]
async fn test_concurrent_ranks_sync_from_one_server() {
    let dir = TempDir::new().unwrap();
    let split = common::tiny_split(dir.path(), 2);
    let addr = start_server(&split, 2).await;

    let handles: Vec<_> = (0..2)
        .map(|rank| {
            let client = SyncClient::new(
                TcpConnector::new(&addr),
                rank,
                dir.path().join("workers").join(format!("node_{}", rank)),
                SyncOptions::default(),
            );
            tokio::spawn(async move { client.sync().await })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().downloaded, file_count());
    }
}

#[tokio::test]
async fn test_unreachable_master_leaves_no_files() {
    let dir = TempDir::new().unwrap();
    // bind then drop to get a port nobody listens on
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let local = dir.path().join("node_1");
    let options = SyncOptions {
        retries: 2,
        timeout: Duration::from_millis(500),
        backoff: Duration::from_millis(10),
        ..Default::default()
    };

    let err = SyncClient::new(TcpConnector::new(&addr), 1, &local, options)
        .sync()
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::ShardFetch(_)), "{:?}", err);

    let leftovers = match std::fs::read_dir(&local) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    };
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_corrupt_master_file_fails_sync_without_leftovers() {
    let dir = TempDir::new().unwrap();
    let split = common::tiny_split(dir.path(), 2);
    // the master's copy no longer matches its manifest
    let served = rank_dir(&split, 1).join("layer_001.shard");
    let mut bytes = std::fs::read(&served).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x01;
    std::fs::write(&served, bytes).unwrap();

    let addr = start_server(&split, 2).await;
    let local = dir.path().join("node_1");
    let err = SyncClient::new(TcpConnector::new(&addr), 1, &local, SyncOptions::default())
        .sync()
        .await
        .unwrap_err();
    match &err {
        NodeError::ChecksumMismatch { file, expected, actual } => {
            assert_eq!(file, "layer_001.shard");
            assert_ne!(expected, actual);
        }
        other => panic!("expected a checksum mismatch, got {:?}", other),
    }

    let mut names: Vec<String> = std::fs::read_dir(&local)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["embed.shard", "layer_000.shard"]);
}
