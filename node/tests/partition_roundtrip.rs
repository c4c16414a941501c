//! Shards written for every rank reassemble into the original tensors

use std::collections::HashMap;
use tempfile::TempDir;
use tpi_node::model::manifest::WeightReader;
use tpi_node::model::partition::reassemble;
use tpi_node::model::synthetic::{generate_model_with, tiny_architecture};
use tpi_node::model::writer::file_checksum;
use tpi_node::model::{
    build_partition, rank_dir, write_shards, DType, RankShardManifest, ShardFile, SplitPolicy,
};
use tpi_node::NodeError;

#[test]
fn test_shards_reassemble_to_original_weights() {
    let dir = TempDir::new().unwrap();
    let model_dir = dir.path().join("model");
    let split_dir = dir.path().join("split");
    let manifest =
        generate_model_with(&model_dir, &tiny_architecture(), DType::F16, 3, true).unwrap();

    for world_size in [1, 2] {
        let partition = build_partition(&manifest, world_size, &SplitPolicy::llama()).unwrap();
        let out = split_dir.join(format!("tp{}", world_size));
        write_shards(&model_dir, &manifest, &partition, &out, false).unwrap();

        // name -> (spec, bytes) per rank, read back from disk
        let mut slices: HashMap<String, Vec<_>> = HashMap::new();
        for rank in 0..world_size {
            let dir = rank_dir(&out, rank);
            let rank_manifest = RankShardManifest::load(&dir).unwrap();
            assert_eq!(rank_manifest.rank, rank);
            for entry in &rank_manifest.files {
                let path = dir.join(&entry.file);
                assert_eq!(file_checksum(&path).unwrap(), entry.checksum);
                let file = ShardFile::read(&path).unwrap();
                for spec in &entry.tensors {
                    let stored = file.tensor(&spec.name).unwrap();
                    assert_eq!(stored.shape, spec.shard_shape);
                    slices
                        .entry(spec.name.clone())
                        .or_default()
                        .push((spec.clone(), stored.data.clone()));
                }
            }
        }

        let mut reader = WeightReader::open(&model_dir).unwrap();
        assert_eq!(slices.len(), manifest.tensors.len());
        for info in &manifest.tensors {
            let parts = &slices[&info.name];
            assert_eq!(parts.len(), world_size, "{}", info.name);
            let full = match parts[0].0.axis {
                Some(_) => {
                    let refs: Vec<_> = parts.iter().map(|(s, b)| (s, b.as_slice())).collect();
                    reassemble(&refs).unwrap()
                }
                // replicated: every rank holds the full tensor
                None => {
                    assert!(parts.iter().all(|(_, b)| b == &parts[0].1));
                    parts[0].1.clone()
                }
            };
            assert_eq!(full, reader.read(info).unwrap(), "{}", info.name);
        }
    }
}

#[test]
fn test_more_ranks_than_kv_heads_is_rejected() {
    let dir = TempDir::new().unwrap();
    let arch = tiny_architecture();
    let manifest = generate_model_with(dir.path(), &arch, DType::F32, 3, false).unwrap();

    let err = build_partition(&manifest, arch.num_key_value_heads + 1, &SplitPolicy::llama())
        .unwrap_err();
    assert!(matches!(err, NodeError::PartitionConfig(_)));
}

#[test]
fn test_resplit_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let model_dir = dir.path().join("model");
    let split_dir = dir.path().join("split");
    let manifest =
        generate_model_with(&model_dir, &tiny_architecture(), DType::BF16, 9, false).unwrap();
    let partition = build_partition(&manifest, 2, &SplitPolicy::llama()).unwrap();

    let (first, report) = write_shards(&model_dir, &manifest, &partition, &split_dir, false).unwrap();
    assert_eq!(report.unchanged, 0);
    let (second, report) =
        write_shards(&model_dir, &manifest, &partition, &split_dir, false).unwrap();
    assert_eq!(report.written, 0);
    assert_eq!(first, second);
}
