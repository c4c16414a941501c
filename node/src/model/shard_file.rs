//! Binary shard file codec
//!
//! Layout (little-endian):
//! `TPISHRD\0` | u32 version | u32 tensor count | per tensor:
//! u32 name len | name | u8 dtype | u32 ndim | u64 dims.. | u64 byte len | bytes

use super::manifest::DType;
use crate::errors::{NodeError, Result};
use std::fs;
use std::path::Path;

pub const SHARD_MAGIC: &[u8; 8] = b"TPISHRD\0";
pub const SHARD_VERSION: u32 = 1;

/// Upper bound on tensor name length accepted when decoding
const MAX_NAME_LEN: usize = 4096;

/// One tensor slice stored in a shard file
#[derive(Debug, Clone, PartialEq)]
pub struct ShardTensor {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl ShardTensor {
    /// Decode the payload to f32
    pub fn to_f32(&self) -> Result<Vec<f32>> {
        self.dtype.decode(&self.data)
    }
}

/// Contents of one `.shard` file
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShardFile {
    pub tensors: Vec<ShardTensor>,
}

impl ShardFile {
    pub fn encode(&self) -> Vec<u8> {
        let payload: usize = self.tensors.iter().map(|t| t.data.len() + t.name.len() + 64).sum();
        let mut buf = Vec::with_capacity(16 + payload);
        buf.extend_from_slice(SHARD_MAGIC);
        buf.extend_from_slice(&SHARD_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.tensors.len() as u32).to_le_bytes());
        for t in &self.tensors {
            buf.extend_from_slice(&(t.name.len() as u32).to_le_bytes());
            buf.extend_from_slice(t.name.as_bytes());
            buf.push(t.dtype.tag());
            buf.extend_from_slice(&(t.shape.len() as u32).to_le_bytes());
            for &d in &t.shape {
                buf.extend_from_slice(&(d as u64).to_le_bytes());
            }
            buf.extend_from_slice(&(t.data.len() as u64).to_le_bytes());
            buf.extend_from_slice(&t.data);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Cursor { bytes, pos: 0 };

        if r.take(8)? != SHARD_MAGIC {
            return Err(NodeError::ShardLoad("bad shard magic".to_string()));
        }
        let version = r.u32()?;
        if version != SHARD_VERSION {
            return Err(NodeError::ShardLoad(format!(
                "unsupported shard version {}",
                version
            )));
        }

        let count = r.u32()? as usize;
        let mut tensors = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let name_len = r.u32()? as usize;
            if name_len > MAX_NAME_LEN {
                return Err(NodeError::ShardLoad(format!(
                    "tensor name length {} exceeds limit",
                    name_len
                )));
            }
            let name = String::from_utf8(r.take(name_len)?.to_vec())
                .map_err(|e| NodeError::ShardLoad(format!("tensor name is not utf-8: {}", e)))?;
            let tag = r.u8()?;
            let dtype = DType::from_tag(tag)
                .ok_or_else(|| NodeError::ShardLoad(format!("unknown dtype tag {}", tag)))?;
            let ndim = r.u32()? as usize;
            let mut shape = Vec::with_capacity(ndim.min(8));
            for _ in 0..ndim {
                shape.push(r.u64()? as usize);
            }
            let len = r.u64()? as usize;
            let expected = shape.iter().product::<usize>() * dtype.size();
            if len != expected {
                return Err(NodeError::ShardLoad(format!(
                    "{}: {} bytes stored for shape {:?} ({} expected)",
                    name, len, shape, expected
                )));
            }
            let data = r.take(len)?.to_vec();
            tensors.push(ShardTensor {
                name,
                dtype,
                shape,
                data,
            });
        }

        if r.pos != bytes.len() {
            return Err(NodeError::ShardLoad(format!(
                "{} trailing bytes after last tensor",
                bytes.len() - r.pos
            )));
        }
        Ok(Self { tensors })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            NodeError::ShardLoad(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::decode(&bytes)
    }

    pub fn tensor(&self, name: &str) -> Option<&ShardTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Total payload bytes
    pub fn data_bytes(&self) -> usize {
        self.tensors.iter().map(|t| t.data.len()).sum()
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.bytes.len());
        match end {
            Some(end) => {
                let out = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(NodeError::ShardLoad(format!(
                "truncated shard: wanted {} bytes at offset {}, file has {}",
                n,
                self.pos,
                self.bytes.len()
            ))),
        }
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }
}
