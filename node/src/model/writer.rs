//! Shard writer
//!
//! Materialises a partition into `node_{rank}/` directories on the master.
//! Every shard file is written atomically and listed in the rank's
//! `manifest.json` together with its SHA-256 checksum. Files whose current
//! contents already hash to the expected checksum are left untouched.

use super::manifest::{ModelArchitecture, ModelManifest, WeightReader, MODEL_MANIFEST_FILE, WEIGHTS_FILE};
use super::partition::{extract_slice, Partition, ShardSpec};
use super::shard_file::{ShardFile, ShardTensor};
use super::split_policy::ShardGroup;
use crate::errors::{NodeError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Per-rank manifest file name
pub const RANK_MANIFEST_FILE: &str = "manifest.json";

/// Whole-partition record written at the split root
pub const PARTITION_FILE: &str = "partition.json";

/// Identity of the model a split was cut from
pub const SOURCE_FILE: &str = "source.json";

/// Bytes hashed from each end of the weights file
const SAMPLE_BYTES: u64 = 1 << 20;

/// Directory holding one rank's shards
pub fn rank_dir(split_dir: &Path, rank: usize) -> PathBuf {
    split_dir.join(format!("node_{}", rank))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Streamed SHA-256 of a file on disk
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Cheap fingerprint of a model directory.
///
/// Hashes the model manifest in full and the first and last MiB of the
/// weights, so a changed architecture, dtype or re-generated weights
/// invalidate an existing split without reading the whole checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSource {
    pub manifest_checksum: String,
    pub weights_size: u64,
    pub weights_sample: String,
}

impl SplitSource {
    pub fn of_model(model_dir: &Path) -> Result<Self> {
        let manifest_checksum = sha256_hex(&fs::read(model_dir.join(MODEL_MANIFEST_FILE))?);
        let mut file = File::open(model_dir.join(WEIGHTS_FILE))?;
        let weights_size = file.metadata()?.len();

        let mut hasher = Sha256::new();
        let mut head = Vec::new();
        (&mut file).take(SAMPLE_BYTES).read_to_end(&mut head)?;
        hasher.update(&head);
        if weights_size > SAMPLE_BYTES {
            let tail_start = weights_size.saturating_sub(SAMPLE_BYTES).max(SAMPLE_BYTES);
            file.seek(SeekFrom::Start(tail_start))?;
            let mut tail = Vec::new();
            file.read_to_end(&mut tail)?;
            hasher.update(&tail);
        }

        Ok(Self {
            manifest_checksum,
            weights_size,
            weights_sample: hex::encode(hasher.finalize()),
        })
    }
}

/// One shard file owned by a rank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardFileEntry {
    pub file: String,
    pub group: ShardGroup,
    pub checksum: String,
    pub size: u64,
    pub tensors: Vec<ShardSpec>,
}

/// Everything one rank needs to know about its shard files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankShardManifest {
    pub rank: usize,
    pub world_size: usize,
    pub architecture: ModelArchitecture,
    /// Ordered: embed, layer_000.., output
    pub files: Vec<ShardFileEntry>,
}

impl RankShardManifest {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(RANK_MANIFEST_FILE);
        let content = fs::read_to_string(&path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read rank manifest");
            e
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Atomic save (temp file + rename)
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join(RANK_MANIFEST_FILE);
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(self)?)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    pub fn entry(&self, group: ShardGroup) -> Option<&ShardFileEntry> {
        self.files.iter().find(|f| f.group == group)
    }

    pub fn file(&self, name: &str) -> Option<&ShardFileEntry> {
        self.files.iter().find(|f| f.file == name)
    }

    /// Largest transformer-layer shard in bytes
    pub fn max_layer_bytes(&self) -> u64 {
        self.files
            .iter()
            .filter(|f| matches!(f.group, ShardGroup::Layer(_)))
            .map(|f| f.size)
            .max()
            .unwrap_or(0)
    }

    /// Embedding plus output shard bytes
    pub fn edge_bytes(&self) -> u64 {
        self.files
            .iter()
            .filter(|f| !matches!(f.group, ShardGroup::Layer(_)))
            .map(|f| f.size)
            .sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Outcome of a writer run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub written: usize,
    pub unchanged: usize,
    pub bytes_written: u64,
}

/// Write every rank's shard files and manifests under `split_dir`.
///
/// With `overwrite` false, files already holding identical bytes are kept.
pub fn write_shards(
    model_dir: &Path,
    manifest: &ModelManifest,
    partition: &Partition,
    split_dir: &Path,
    overwrite: bool,
) -> Result<(Vec<RankShardManifest>, WriteReport)> {
    let mut reader = WeightReader::open(model_dir)?;
    let mut report = WriteReport::default();

    let grouped: Vec<BTreeMap<ShardGroup, Vec<&ShardSpec>>> =
        partition.ranks.iter().map(|r| r.by_group()).collect();
    let mut entries: Vec<Vec<ShardFileEntry>> = vec![Vec::new(); partition.world_size];

    for r in 0..partition.world_size {
        fs::create_dir_all(rank_dir(split_dir, r))?;
    }

    // every rank has the same group set, so walk groups once and read each
    // full tensor a single time
    let groups: Vec<ShardGroup> = grouped
        .first()
        .map(|g| g.keys().copied().collect())
        .unwrap_or_default();

    for group in groups {
        let mut files: Vec<ShardFile> = vec![ShardFile::default(); partition.world_size];
        let names: Vec<String> = grouped[0][&group].iter().map(|s| s.name.clone()).collect();

        for name in &names {
            let info = manifest.tensor(name).ok_or_else(|| {
                NodeError::PartitionConfig(format!("{} missing from model manifest", name))
            })?;
            let full = reader.read(info)?;
            for (rank, file) in files.iter_mut().enumerate() {
                let spec = grouped[rank]
                    .get(&group)
                    .and_then(|specs| specs.iter().find(|s| &s.name == name))
                    .ok_or_else(|| {
                        NodeError::PartitionConfig(format!("rank {} has no slice of {}", rank, name))
                    })?;
                file.tensors.push(ShardTensor {
                    name: name.clone(),
                    dtype: spec.dtype,
                    shape: spec.shard_shape.clone(),
                    data: extract_slice(spec, &full)?,
                });
            }
        }

        for (rank, file) in files.into_iter().enumerate() {
            let bytes = file.encode();
            let checksum = sha256_hex(&bytes);
            let path = rank_dir(split_dir, rank).join(group.file_name());

            let unchanged = !overwrite
                && path.exists()
                && file_checksum(&path).map(|c| c == checksum).unwrap_or(false);
            if unchanged {
                report.unchanged += 1;
            } else {
                let temp_path = path.with_extension("shard.tmp");
                fs::write(&temp_path, &bytes)?;
                fs::rename(&temp_path, &path)?;
                report.written += 1;
                report.bytes_written += bytes.len() as u64;
            }
            debug!(rank, file = %group.file_name(), unchanged, "Shard file ready");

            entries[rank].push(ShardFileEntry {
                file: group.file_name(),
                group,
                checksum,
                size: bytes.len() as u64,
                tensors: grouped[rank][&group].iter().map(|s| (*s).clone()).collect(),
            });
        }
    }

    let manifests: Vec<RankShardManifest> = entries
        .into_iter()
        .enumerate()
        .map(|(rank, files)| RankShardManifest {
            rank,
            world_size: partition.world_size,
            architecture: partition.architecture.clone(),
            files,
        })
        .collect();

    for m in &manifests {
        m.save(&rank_dir(split_dir, m.rank))?;
    }
    fs::write(
        split_dir.join(PARTITION_FILE),
        serde_json::to_string_pretty(partition)?,
    )?;
    fs::write(
        split_dir.join(SOURCE_FILE),
        serde_json::to_string_pretty(&SplitSource::of_model(model_dir)?)?,
    )?;

    info!(
        split_dir = %split_dir.display(),
        world_size = partition.world_size,
        written = report.written,
        unchanged = report.unchanged,
        bytes = report.bytes_written,
        "Shards written"
    );

    Ok((manifests, report))
}

/// True if `split_dir` holds a rank manifest for every rank of a
/// `world_size` split
pub fn split_exists(split_dir: &Path, world_size: usize) -> bool {
    (0..world_size).all(|r| {
        RankShardManifest::load(&rank_dir(split_dir, r))
            .map(|m| m.rank == r && m.world_size == world_size)
            .unwrap_or(false)
    })
}

/// True if `split_dir` was cut from the model in `model_dir` with exactly
/// `partition`, so writing it again would change nothing
pub fn split_is_current(split_dir: &Path, model_dir: &Path, partition: &Partition) -> bool {
    if !split_exists(split_dir, partition.world_size) {
        return false;
    }
    let stored_partition = fs::read_to_string(split_dir.join(PARTITION_FILE))
        .ok()
        .and_then(|c| serde_json::from_str::<Partition>(&c).ok());
    if stored_partition.as_ref() != Some(partition) {
        debug!(split_dir = %split_dir.display(), "Stored partition differs");
        return false;
    }
    let stored_source = fs::read_to_string(split_dir.join(SOURCE_FILE))
        .ok()
        .and_then(|c| serde_json::from_str::<SplitSource>(&c).ok());
    match (stored_source, SplitSource::of_model(model_dir)) {
        (Some(stored), Ok(current)) => stored == current,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::partition::build_partition;
    use crate::model::split_policy::SplitPolicy;
    use crate::model::synthetic::{generate_model, tiny_architecture};
    use crate::model::manifest::DType;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_rewrite_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let model_dir = dir.path().join("model");
        let split_dir = dir.path().join("split");
        let manifest = generate_model(&model_dir, &tiny_architecture(), DType::F32, 7).unwrap();
        let partition = build_partition(&manifest, 2, &SplitPolicy::llama()).unwrap();

        let (first, report) =
            write_shards(&model_dir, &manifest, &partition, &split_dir, false).unwrap();
        let layers = manifest.architecture.num_layers;
        assert_eq!(report.written, 2 * (layers + 2));
        assert!(split_exists(&split_dir, 2));

        let node1 = rank_dir(&split_dir, 1);
        let loaded = RankShardManifest::load(&node1).unwrap();
        assert_eq!(loaded, first[1]);
        assert_eq!(loaded.files[0].group, ShardGroup::Embed);
        assert_eq!(loaded.files.last().unwrap().group, ShardGroup::Output);
        for entry in &loaded.files {
            assert_eq!(file_checksum(&node1.join(&entry.file)).unwrap(), entry.checksum);
        }

        let (second, report) =
            write_shards(&model_dir, &manifest, &partition, &split_dir, false).unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(second, first);

        let (_, report) = write_shards(&model_dir, &manifest, &partition, &split_dir, true).unwrap();
        assert_eq!(report.written, 2 * (layers + 2));
    }

    #[test]
    fn test_split_is_keyed_on_its_inputs() {
        let dir = TempDir::new().unwrap();
        let model_dir = dir.path().join("model");
        let split_dir = dir.path().join("split");
        let policy = SplitPolicy::llama();
        let manifest = generate_model(&model_dir, &tiny_architecture(), DType::F32, 7).unwrap();
        let two = build_partition(&manifest, 2, &policy).unwrap();
        let one = build_partition(&manifest, 1, &policy).unwrap();

        assert!(!split_is_current(&split_dir, &model_dir, &two));
        write_shards(&model_dir, &manifest, &two, &split_dir, false).unwrap();
        assert!(split_is_current(&split_dir, &model_dir, &two));

        // node_0 exists, but it belongs to a two-rank split
        assert!(!split_exists(&split_dir, 1));
        assert!(!split_is_current(&split_dir, &model_dir, &one));

        // same shapes, new weights
        generate_model(&model_dir, &tiny_architecture(), DType::F32, 8).unwrap();
        assert!(!split_is_current(&split_dir, &model_dir, &two));

        let bf16 = generate_model(&model_dir, &tiny_architecture(), DType::BF16, 7).unwrap();
        let bf16_two = build_partition(&bf16, 2, &policy).unwrap();
        assert!(!split_is_current(&split_dir, &model_dir, &bf16_two));
        write_shards(&model_dir, &bf16, &bf16_two, &split_dir, false).unwrap();
        assert!(split_is_current(&split_dir, &model_dir, &bf16_two));
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
