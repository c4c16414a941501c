//! Where resident shards come from
//!
//! [`LayerSource`] is a blocking interface; the window scheduler calls it
//! from `spawn_blocking` so disk reads overlap with compute.

use crate::errors::{NodeError, Result};
use crate::inference::tensor_ops::Tensor2D;
use crate::model::writer::sha256_hex;
use crate::model::{RankShardManifest, ShardFile, ShardGroup};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Deserialised weights of one shard file, ready for compute
#[derive(Debug)]
pub struct LayerShard {
    pub group: ShardGroup,
    tensors: HashMap<String, Tensor2D>,
    size_bytes: u64,
}

impl LayerShard {
    /// Decode every tensor to f32. Vectors become single-row matrices.
    pub fn from_file(group: ShardGroup, file: ShardFile) -> Result<Self> {
        let mut tensors = HashMap::with_capacity(file.tensors.len());
        let mut size_bytes = 0u64;
        for t in file.tensors {
            let values = t.to_f32()?;
            let (rows, cols) = match t.shape.as_slice() {
                [n] => (1, *n),
                [r, c] => (*r, *c),
                other => {
                    return Err(NodeError::ShardLoad(format!(
                        "{}: unsupported tensor rank {:?}",
                        t.name, other
                    )))
                }
            };
            size_bytes += (values.len() * std::mem::size_of::<f32>()) as u64;
            let matrix = Tensor2D::new(values, rows, cols)
                .map_err(|e| NodeError::ShardLoad(format!("{}: {}", t.name, e)))?;
            tensors.insert(t.name, matrix);
        }
        Ok(Self {
            group,
            tensors,
            size_bytes,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Tensor2D> {
        self.tensors.get(name)
    }

    pub fn matrix(&self, name: &str) -> Result<&Tensor2D> {
        self.tensors.get(name).ok_or_else(|| {
            NodeError::ShardLoad(format!("{:?} shard has no tensor {}", self.group, name))
        })
    }

    pub fn vector(&self, name: &str) -> Result<&[f32]> {
        let t = self.matrix(name)?;
        if t.rows != 1 {
            return Err(NodeError::ShardLoad(format!(
                "{} is {}x{}, expected a vector",
                name, t.rows, t.cols
            )));
        }
        Ok(&t.data)
    }

    /// Decoded bytes held in memory
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }
}

/// Provider of per-group shards for one rank
pub trait LayerSource: Send + Sync + 'static {
    fn num_layers(&self) -> usize;

    /// Read and deserialise one shard. Blocking.
    fn load(&self, group: ShardGroup) -> Result<LayerShard>;
}

/// Reads shards from this rank's local directory, verifying each file
/// against the rank manifest at read time
#[derive(Debug, Clone)]
pub struct DiskLayerSource {
    dir: PathBuf,
    manifest: RankShardManifest,
}

impl DiskLayerSource {
    pub fn new(dir: impl Into<PathBuf>, manifest: RankShardManifest) -> Self {
        Self {
            dir: dir.into(),
            manifest,
        }
    }

    /// Open a rank directory using the manifest stored in it
    pub fn open(dir: &Path) -> Result<Self> {
        let manifest = RankShardManifest::load(dir)
            .map_err(|e| NodeError::ShardLoad(format!("{}: {}", dir.display(), e)))?;
        Ok(Self::new(dir, manifest))
    }

    pub fn manifest(&self) -> &RankShardManifest {
        &self.manifest
    }
}

impl LayerSource for DiskLayerSource {
    fn num_layers(&self) -> usize {
        self.manifest.architecture.num_layers
    }

    fn load(&self, group: ShardGroup) -> Result<LayerShard> {
        let entry = self.manifest.entry(group).ok_or_else(|| {
            NodeError::ShardLoad(format!("rank manifest lists no {:?} shard", group))
        })?;
        let path = self.dir.join(&entry.file);
        let bytes = fs::read(&path)
            .map_err(|e| NodeError::ShardLoad(format!("{}: {}", path.display(), e)))?;

        let actual = sha256_hex(&bytes);
        if actual != entry.checksum {
            return Err(NodeError::ShardLoad(format!(
                "{} is corrupt: checksum {} does not match manifest {}",
                path.display(),
                actual,
                entry.checksum
            )));
        }

        let file = ShardFile::decode(&bytes)?;
        for spec in &entry.tensors {
            match file.tensor(&spec.name) {
                Some(t) if t.shape == spec.shard_shape => {}
                _ => {
                    return Err(NodeError::ShardLoad(format!(
                        "{} does not hold {} with shape {:?}",
                        path.display(),
                        spec.name,
                        spec.shard_shape
                    )))
                }
            }
        }

        LayerShard::from_file(group, file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::split_policy::SplitPolicy;
    use crate::model::synthetic::{generate_model, tiny_architecture};
    use crate::model::{build_partition, rank_dir, write_shards, DType};
    use tempfile::TempDir;

    fn split() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let model_dir = dir.path().join("model");
        let split_dir = dir.path().join("split");
        let manifest = generate_model(&model_dir, &tiny_architecture(), DType::BF16, 9).unwrap();
        let partition = build_partition(&manifest, 2, &SplitPolicy::llama()).unwrap();
        write_shards(&model_dir, &manifest, &partition, &split_dir, false).unwrap();
        (dir, rank_dir(&split_dir, 1))
    }

    #[test]
    fn test_load_layer_shard() {
        let (_dir, node) = split();
        let source = DiskLayerSource::open(&node).unwrap();
        assert_eq!(source.num_layers(), 4);

        let shard = source.load(ShardGroup::Layer(2)).unwrap();
        let q = shard.matrix("model.layers.2.self_attn.q_proj.weight").unwrap();
        assert_eq!((q.rows, q.cols), (16, 32));
        assert_eq!(
            shard.vector("model.layers.2.input_layernorm.weight").unwrap().len(),
            32
        );
        assert!(shard.size_bytes() > 0);
        assert!(shard.matrix("model.layers.3.mlp.up_proj.weight").is_err());
    }

    #[test]
    fn test_corrupt_file_is_shard_load_error() {
        let (_dir, node) = split();
        let source = DiskLayerSource::open(&node).unwrap();
        let path = node.join("layer_001.shard");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            source.load(ShardGroup::Layer(1)),
            Err(NodeError::ShardLoad(_))
        ));
        fs::remove_file(node.join("layer_002.shard")).unwrap();
        assert!(matches!(
            source.load(ShardGroup::Layer(2)),
            Err(NodeError::ShardLoad(_))
        ));
    }
}
