//! Full-precision model description and weight file access
//!
//! A model directory holds `manifest.json` (architecture plus a tensor index)
//! and a flat little-endian `weights.bin` that the index points into.

use crate::errors::{NodeError, Result};
use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// File name of the model manifest inside a model directory
pub const MODEL_MANIFEST_FILE: &str = "manifest.json";

/// File name of the packed weights inside a model directory
pub const WEIGHTS_FILE: &str = "weights.bin";

/// Element type of a stored tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DType {
    F32,
    F16,
    BF16,
}

impl DType {
    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }

    /// Stable tag used by the shard file format
    pub fn tag(&self) -> u8 {
        match self {
            DType::F32 => 0,
            DType::F16 => 1,
            DType::BF16 => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(DType::F32),
            1 => Some(DType::F16),
            2 => Some(DType::BF16),
            _ => None,
        }
    }

    /// Decode little-endian raw bytes into f32 values
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        if bytes.len() % self.size() != 0 {
            return Err(NodeError::ShardLoad(format!(
                "{} bytes is not a whole number of {:?} elements",
                bytes.len(),
                self
            )));
        }

        let values = match self {
            DType::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DType::F16 => bytes
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            DType::BF16 => bytes
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
        };
        Ok(values)
    }

    /// Encode f32 values into little-endian bytes of this dtype
    pub fn encode(&self, values: &[f32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() * self.size());
        for &v in values {
            match self {
                DType::F32 => out.extend_from_slice(&v.to_le_bytes()),
                DType::F16 => out.extend_from_slice(&f16::from_f32(v).to_le_bytes()),
                DType::BF16 => out.extend_from_slice(&bf16::from_f32(v).to_le_bytes()),
            }
        }
        out
    }
}

/// Decoder-only transformer architecture (Llama family)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArchitecture {
    pub num_layers: usize,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    /// 0 means the model declares no limit
    #[serde(default)]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
}

fn default_rms_norm_eps() -> f32 {
    1e-5
}

fn default_rope_theta() -> f32 {
    10_000.0
}

impl ModelArchitecture {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Query heads sharing one key/value head
    pub fn kv_group_size(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }

    /// Internal consistency of the head layout
    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 || self.hidden_size == 0 || self.vocab_size == 0 {
            return Err(NodeError::PartitionConfig(
                "num_layers, hidden_size and vocab_size must be non-zero".to_string(),
            ));
        }
        if self.num_attention_heads == 0 || self.num_key_value_heads == 0 {
            return Err(NodeError::PartitionConfig(
                "attention head counts must be non-zero".to_string(),
            ));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(NodeError::PartitionConfig(format!(
                "hidden_size {} is not divisible by {} attention heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(NodeError::PartitionConfig(format!(
                "{} attention heads cannot be grouped over {} key/value heads",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        Ok(())
    }

    /// Clamp a requested generation length to what the model supports.
    ///
    /// Negative requests mean "as long as the model allows"; a hard cap
    /// applies when the model declares no position limit.
    pub fn adjust_length(&self, requested: i64) -> usize {
        const MAX_LENGTH: usize = 10_000;
        let limit = self.max_position_embeddings;
        if requested < 0 {
            if limit > 0 {
                limit
            } else {
                MAX_LENGTH
            }
        } else if limit > 0 && requested as usize > limit {
            limit
        } else {
            requested as usize
        }
    }
}

/// One tensor in the packed weights file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    /// Byte offset into `weights.bin`
    pub offset: u64,
}

impl TensorInfo {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.numel() * self.dtype.size()
    }
}

/// Immutable description of the full model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub architecture: ModelArchitecture,
    pub tensors: Vec<TensorInfo>,
}

impl ModelManifest {
    pub fn load(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join(MODEL_MANIFEST_FILE);
        let content = fs::read_to_string(&path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read model manifest");
            e
        })?;
        let manifest: Self = serde_json::from_str(&content)?;
        manifest.architecture.validate()?;
        Ok(manifest)
    }

    pub fn save(&self, model_dir: &Path) -> Result<()> {
        fs::create_dir_all(model_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(model_dir.join(MODEL_MANIFEST_FILE), json)?;
        Ok(())
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Total size of all weights in bytes
    pub fn total_bytes(&self) -> u64 {
        self.tensors.iter().map(|t| t.byte_len() as u64).sum()
    }
}

/// Random access reader over `weights.bin`
pub struct WeightReader {
    path: PathBuf,
    file: File,
    len: u64,
}

impl WeightReader {
    pub fn open(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join(WEIGHTS_FILE);
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self { path, file, len })
    }

    /// Read the raw bytes of one tensor
    pub fn read(&mut self, info: &TensorInfo) -> Result<Vec<u8>> {
        let end = info.offset + info.byte_len() as u64;
        if end > self.len {
            return Err(NodeError::PartitionConfig(format!(
                "tensor {} spans bytes {}..{} but {} has only {} bytes",
                info.name,
                info.offset,
                end,
                self.path.display(),
                self.len
            )));
        }
        let mut buf = vec![0u8; info.byte_len()];
        self.file.seek(SeekFrom::Start(info.offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}
