//! Shard sync wire protocol
//!
//! Requests and responses are closed enums sent as length-prefixed CBOR
//! frames (u32 big-endian length, then the CBOR payload).

use crate::model::RankShardManifest;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (64MB)
pub const MESSAGE_SIZE_LIMIT: usize = 64 * 1024 * 1024;

/// Bytes per file chunk streamed by the server
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Client to file server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncRequest {
    /// Shard manifest (with checksums) for a rank
    Manifest { rank: usize },
    /// Byte stream of one shard file of a rank
    File { rank: usize, file: String },
    Ping,
}

/// File server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncResponse {
    Manifest(RankShardManifest),
    /// One piece of a file; `last` closes the stream
    FileChunk {
        offset: u64,
        data: Vec<u8>,
        last: bool,
    },
    /// Unknown rank or file
    NotFound { what: String },
    /// Server-side failure while serving a known resource
    Error { message: String },
    Pong,
}

/// Read a length-prefixed CBOR message from an async stream
pub async fn read_cbor_message<T, M>(io: &mut T) -> io::Result<M>
where
    T: AsyncRead + Unpin,
    M: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MESSAGE_SIZE_LIMIT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message size {} exceeds limit {}", len, MESSAGE_SIZE_LIMIT),
        ));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;

    ciborium::from_reader(&buf[..]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write a length-prefixed CBOR message to an async stream
pub async fn write_cbor_message<T, M>(io: &mut T, message: &M) -> io::Result<()>
where
    T: AsyncWrite + Unpin,
    M: Serialize,
{
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if buf.len() > MESSAGE_SIZE_LIMIT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Message size {} exceeds limit {}",
                buf.len(),
                MESSAGE_SIZE_LIMIT
            ),
        ));
    }

    let len = buf.len() as u32;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(&buf).await?;
    io.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_cbor_roundtrip() {
        let req = SyncRequest::File {
            rank: 3,
            file: "layer_007.shard".to_string(),
        };

        let mut write_buf = Vec::new();
        write_cbor_message(&mut write_buf, &req).await.unwrap();

        let mut read_buf = Cursor::new(write_buf);
        let decoded: SyncRequest = read_cbor_message(&mut read_buf).await.unwrap();
        assert_eq!(req, decoded);
    }

    #[tokio::test]
    async fn test_chunk_bytes_survive() {
        let resp = SyncResponse::FileChunk {
            offset: 42,
            data: (0..=255u8).collect(),
            last: true,
        };
        let mut buf = Vec::new();
        write_cbor_message(&mut buf, &resp).await.unwrap();
        let decoded: SyncResponse = read_cbor_message(&mut Cursor::new(buf)).await.unwrap();
        assert_eq!(resp, decoded);
    }

    #[tokio::test]
    async fn test_read_size_limit_enforcement() {
        let mut write_buf = Vec::new();
        write_cbor_message(&mut write_buf, &SyncRequest::Ping).await.unwrap();

        let large_len: u32 = (MESSAGE_SIZE_LIMIT + 1) as u32;
        write_buf[0..4].copy_from_slice(&large_len.to_be_bytes());

        let mut read_buf = Cursor::new(write_buf);
        let result: io::Result<SyncRequest> = read_cbor_message(&mut read_buf).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_malformed_cbor() {
        let mut buf = Vec::new();
        let len: u32 = 10;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&[0xFF; 10]);

        let mut read_buf = Cursor::new(buf);
        let result: io::Result<SyncRequest> = read_cbor_message(&mut read_buf).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_incomplete_read() {
        let mut buf = Vec::new();
        let len: u32 = 100;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&[0x01, 0x02, 0x03]);

        let mut read_buf = Cursor::new(buf);
        let result: io::Result<SyncRequest> = read_cbor_message(&mut read_buf).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }
}
