//! Shard file server (master rank)
//!
//! Each accepted connection is served on its own task, so a slow download
//! never blocks other ranks. A bad request ends that connection only.

use super::protocol::{read_cbor_message, write_cbor_message, SyncRequest, SyncResponse, CHUNK_SIZE};
use crate::errors::Result;
use crate::model::{rank_dir, RankShardManifest};
use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, instrument, warn};

/// Serves rank manifests and shard files from a split directory
#[derive(Debug, Clone)]
pub struct ShardFileServer {
    split_dir: PathBuf,
    world_size: usize,
}

impl ShardFileServer {
    pub fn new(split_dir: impl Into<PathBuf>, world_size: usize) -> Self {
        Self {
            split_dir: split_dir.into(),
            world_size,
        }
    }

    /// Bind the listening socket
    pub async fn bind(addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Shard file server listening");
        Ok(listener)
    }

    /// Accept loop; runs until the listener fails
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream, peer).await {
                    warn!(%peer, error = %e, "Sync connection closed with error");
                }
            });
        }
    }

    /// Serve requests on one connection until the client hangs up
    #[instrument(skip(self, stream), fields(split_dir = %self.split_dir.display()))]
    pub async fn serve_connection<S>(&self, mut stream: S, peer: SocketAddr) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let request: SyncRequest = match read_cbor_message(&mut stream).await {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("Client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            self.handle(&mut stream, request).await?;
        }
    }

    async fn handle<S>(&self, stream: &mut S, request: SyncRequest) -> io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        match request {
            SyncRequest::Ping => write_cbor_message(stream, &SyncResponse::Pong).await,
            SyncRequest::Manifest { rank } => {
                let response = self.manifest_response(rank);
                write_cbor_message(stream, &response).await
            }
            SyncRequest::File { rank, file } => self.stream_file(stream, rank, &file).await,
        }
    }

    fn manifest_response(&self, rank: usize) -> SyncResponse {
        if rank >= self.world_size {
            return SyncResponse::NotFound {
                what: format!("rank {}", rank),
            };
        }
        match RankShardManifest::load(&rank_dir(&self.split_dir, rank)) {
            Ok(m) => {
                info!(rank, files = m.files.len(), "Serving rank manifest");
                SyncResponse::Manifest(m)
            }
            Err(e) => SyncResponse::NotFound {
                what: format!("manifest for rank {}: {}", rank, e),
            },
        }
    }

    /// Resolve a file name inside a rank directory, refusing anything else
    fn resolve(&self, rank: usize, file: &str) -> Option<PathBuf> {
        if rank >= self.world_size {
            return None;
        }
        let name = Path::new(file);
        let mut components = name.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return None,
        }
        let path = rank_dir(&self.split_dir, rank).join(name);
        path.is_file().then_some(path)
    }

    async fn stream_file<S>(&self, stream: &mut S, rank: usize, file: &str) -> io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let Some(path) = self.resolve(rank, file) else {
            warn!(rank, file, "Requested shard not found");
            let response = SyncResponse::NotFound {
                what: format!("{} for rank {}", file, rank),
            };
            return write_cbor_message(stream, &response).await;
        };

        let mut handle = match File::open(&path).await {
            Ok(h) => h,
            Err(e) => {
                let response = SyncResponse::Error {
                    message: format!("open {}: {}", file, e),
                };
                return write_cbor_message(stream, &response).await;
            }
        };

        let size = handle.metadata().await?.len();
        let mut offset = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = read_full(&mut handle, &mut buf).await?;
            let last = offset + n as u64 >= size || n < buf.len();
            let chunk = SyncResponse::FileChunk {
                offset,
                data: buf[..n].to_vec(),
                last,
            };
            write_cbor_message(stream, &chunk).await?;
            offset += n as u64;
            if last {
                break;
            }
        }

        info!(rank, file, bytes = offset, "Shard file served");
        Ok(())
    }
}

/// Fill `buf` as far as the file allows
async fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
