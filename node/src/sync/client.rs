//! Shard sync client (non-master ranks)
//!
//! Reconciles the local `node_{rank}/` directory against the master's rank
//! manifest. Downloads land in a `.part` file, are hashed while streaming and
//! only renamed into place once the checksum matches.

use super::protocol::{read_cbor_message, write_cbor_message, SyncRequest, SyncResponse};
use super::server::ShardFileServer;
use crate::errors::{NodeError, Result};
use crate::model::writer::file_checksum;
use crate::model::{RankShardManifest, ShardFileEntry};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

/// Opens a fresh stream to the shard file server
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    async fn connect(&self) -> io::Result<Self::Stream>;

    /// Human-readable address for logs and errors
    fn describe(&self) -> String;
}

/// TCP connection to the master's file port
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn describe(&self) -> String {
        self.addr.clone()
    }
}

/// In-process connector: each connect spawns a server task on a duplex pipe
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    server: ShardFileServer,
}

impl InMemoryConnector {
    pub fn new(server: ShardFileServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> io::Result<DuplexStream> {
        let (client, conn) = tokio::io::duplex(256 * 1024);
        let server = self.server.clone();
        let peer = std::net::SocketAddr::from(([127, 0, 0, 1], 0));
        tokio::spawn(async move {
            if let Err(e) = server.serve_connection(conn, peer).await {
                debug!(error = %e, "In-memory sync connection ended");
            }
        });
        Ok(client)
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

/// Sync client settings
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Re-download every file regardless of local checksums
    pub force_download: bool,
    /// Attempts per request for transport failures
    pub retries: u32,
    /// Bound on connect and on each frame read
    pub timeout: Duration,
    /// Base delay between attempts (grows linearly)
    pub backoff: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            force_download: false,
            retries: 3,
            timeout: Duration::from_secs(10),
            backoff: Duration::from_millis(200),
        }
    }
}

/// What a sync run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub downloaded: usize,
    pub skipped: usize,
    pub removed: usize,
    pub bytes: u64,
}

/// Removes the partial download unless committed
struct PartFile {
    path: PathBuf,
    committed: bool,
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Sync client for one rank
pub struct SyncClient<C: Connector> {
    connector: C,
    rank: usize,
    local_dir: PathBuf,
    options: SyncOptions,
}

impl<C: Connector> SyncClient<C> {
    /// `local_dir` is this rank's shard directory (`.../node_{rank}`)
    pub fn new(connector: C, rank: usize, local_dir: impl Into<PathBuf>, options: SyncOptions) -> Self {
        Self {
            connector,
            rank,
            local_dir: local_dir.into(),
            options,
        }
    }

    async fn connect(&self) -> Result<C::Stream> {
        match tokio::time::timeout(self.options.timeout, self.connector.connect()).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(NodeError::ShardFetch(format!(
                "master {} unreachable: {}",
                self.connector.describe(),
                e
            ))),
            Err(_) => Err(NodeError::ShardFetch(format!(
                "connect to {} timed out after {:?}",
                self.connector.describe(),
                self.options.timeout
            ))),
        }
    }

    async fn recv(&self, stream: &mut C::Stream) -> Result<SyncResponse> {
        match tokio::time::timeout(self.options.timeout, read_cbor_message(stream)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(NodeError::ShardFetch(format!("transfer failed: {}", e))),
            Err(_) => Err(NodeError::ShardFetch(format!(
                "no response within {:?}",
                self.options.timeout
            ))),
        }
    }

    async fn send(&self, stream: &mut C::Stream, request: &SyncRequest) -> Result<()> {
        write_cbor_message(stream, request)
            .await
            .map_err(|e| NodeError::ShardFetch(format!("request failed: {}", e)))
    }

    async fn pause(&self, attempt: u32) {
        tokio::time::sleep(self.options.backoff * attempt).await;
    }

    /// Fetch this rank's manifest, retrying transport failures
    pub async fn fetch_manifest(&self) -> Result<RankShardManifest> {
        let attempts = self.options.retries.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.try_fetch_manifest().await {
                Ok(m) => return Ok(m),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(rank = self.rank, attempt, error = %e, "Manifest fetch failed, retrying");
                    last_err = Some(e);
                    self.pause(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| NodeError::ShardFetch("no attempts made".to_string())))
    }

    async fn try_fetch_manifest(&self) -> Result<RankShardManifest> {
        let mut stream = self.connect().await?;
        self.send(&mut stream, &SyncRequest::Manifest { rank: self.rank })
            .await?;
        match self.recv(&mut stream).await? {
            SyncResponse::Manifest(m) if m.rank == self.rank => Ok(m),
            SyncResponse::Manifest(m) => Err(NodeError::Network(format!(
                "asked for rank {} manifest, got rank {}",
                self.rank, m.rank
            ))),
            SyncResponse::NotFound { what } => Err(NodeError::Network(format!(
                "master has no {}",
                what
            ))),
            SyncResponse::Error { message } => Err(NodeError::ShardFetch(message)),
            other => Err(NodeError::Network(format!(
                "unexpected response to manifest request: {:?}",
                other
            ))),
        }
    }

    /// Reconcile local shards with the master; returns what was done
    #[instrument(skip(self), fields(rank = self.rank, master = %self.connector.describe()))]
    pub async fn sync(&self) -> Result<SyncReport> {
        let manifest = self.fetch_manifest().await?;
        tokio::fs::create_dir_all(&self.local_dir).await?;

        let mut report = SyncReport::default();
        for entry in &manifest.files {
            let path = self.local_dir.join(&entry.file);
            if !self.options.force_download && self.is_current(&path, &entry.checksum).await {
                debug!(file = %entry.file, "Local shard up to date");
                report.skipped += 1;
                continue;
            }
            report.bytes += self.download(entry).await?;
            report.downloaded += 1;
        }

        report.removed = self.remove_stale(&manifest).await?;
        manifest.save(&self.local_dir)?;

        info!(
            downloaded = report.downloaded,
            skipped = report.skipped,
            removed = report.removed,
            bytes = report.bytes,
            "Shard sync complete"
        );
        Ok(report)
    }

    async fn is_current(&self, path: &Path, checksum: &str) -> bool {
        if !path.is_file() {
            return false;
        }
        let path = path.to_path_buf();
        match tokio::task::spawn_blocking(move || file_checksum(&path)).await {
            Ok(Ok(actual)) => actual == checksum,
            _ => false,
        }
    }

    /// Download one file. Transport failures retry up to `retries` times;
    /// a checksum mismatch is re-fetched once before it is fatal.
    async fn download(&self, entry: &ShardFileEntry) -> Result<u64> {
        let attempts = self.options.retries.max(1);
        let mut mismatches = 0;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_download(entry).await {
                Ok(bytes) => return Ok(bytes),
                Err(e @ NodeError::ChecksumMismatch { .. }) => {
                    mismatches += 1;
                    if mismatches > 1 {
                        return Err(e);
                    }
                    warn!(file = %entry.file, error = %e, "Checksum mismatch, re-fetching");
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(file = %entry.file, attempt, error = %e, "Download failed, retrying");
                    self.pause(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_download(&self, entry: &ShardFileEntry) -> Result<u64> {
        let final_path = self.local_dir.join(&entry.file);
        let mut part = PartFile {
            path: self.local_dir.join(format!(".{}.part", entry.file)),
            committed: false,
        };

        let mut stream = self.connect().await?;
        self.send(
            &mut stream,
            &SyncRequest::File {
                rank: self.rank,
                file: entry.file.clone(),
            },
        )
        .await?;

        let mut out = tokio::fs::File::create(&part.path).await?;
        let mut hasher = Sha256::new();
        let mut received = 0u64;
        loop {
            match self.recv(&mut stream).await? {
                SyncResponse::FileChunk { offset, data, last } => {
                    if offset != received {
                        return Err(NodeError::ShardFetch(format!(
                            "{}: chunk at offset {} but {} bytes received",
                            entry.file, offset, received
                        )));
                    }
                    hasher.update(&data);
                    out.write_all(&data).await?;
                    received += data.len() as u64;
                    if last {
                        break;
                    }
                }
                SyncResponse::NotFound { what } => {
                    return Err(NodeError::Network(format!("master has no {}", what)));
                }
                SyncResponse::Error { message } => return Err(NodeError::ShardFetch(message)),
                other => {
                    return Err(NodeError::Network(format!(
                        "unexpected response to file request: {:?}",
                        other
                    )))
                }
            }
        }
        out.flush().await?;
        out.sync_all().await?;
        drop(out);

        let actual = hex::encode(hasher.finalize());
        if actual != entry.checksum {
            return Err(NodeError::ChecksumMismatch {
                file: entry.file.clone(),
                expected: entry.checksum.clone(),
                actual,
            });
        }

        tokio::fs::rename(&part.path, &final_path).await?;
        part.committed = true;
        debug!(file = %entry.file, bytes = received, "Shard downloaded");
        Ok(received)
    }

    /// Delete shard files that this rank no longer owns
    async fn remove_stale(&self, manifest: &RankShardManifest) -> Result<usize> {
        let wanted: HashSet<&str> = manifest.files.iter().map(|f| f.file.as_str()).collect();
        let mut removed = 0;
        let mut dir = tokio::fs::read_dir(&self.local_dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let name = name.to_string_lossy();
            let is_shard = name.ends_with(".shard") || name.ends_with(".part");
            if is_shard && !wanted.contains(name.as_ref()) {
                tokio::fs::remove_file(item.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
