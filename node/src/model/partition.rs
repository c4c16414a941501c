//! Partition manifest builder
//!
//! Pure function of (model manifest, world size, split policy). Slice
//! boundaries are contiguous blocks along the split axis; when the units do
//! not divide evenly the lowest ranks take one extra unit each.

use super::manifest::{DType, ModelArchitecture, ModelManifest};
use super::split_policy::{ShardGroup, SplitPolicy, SplitRule, SplitUnit, TensorRole};
use crate::errors::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// One rank's slice of one tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub name: String,
    pub group: ShardGroup,
    pub role: TensorRole,
    pub dtype: DType,
    pub full_shape: Vec<usize>,
    /// `None` for replicated tensors
    pub axis: Option<usize>,
    /// Element range along `axis`
    pub start: usize,
    pub end: usize,
    pub shard_shape: Vec<usize>,
}

impl ShardSpec {
    pub fn byte_len(&self) -> usize {
        self.shard_shape.iter().product::<usize>() * self.dtype.size()
    }
}

/// Every slice owned by one rank, ordered by (group, tensor name)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankPartition {
    pub rank: usize,
    pub specs: Vec<ShardSpec>,
}

impl RankPartition {
    /// Specs grouped by destination file
    pub fn by_group(&self) -> BTreeMap<ShardGroup, Vec<&ShardSpec>> {
        let mut groups: BTreeMap<ShardGroup, Vec<&ShardSpec>> = BTreeMap::new();
        for spec in &self.specs {
            groups.entry(spec.group).or_default().push(spec);
        }
        groups
    }

    pub fn spec(&self, name: &str) -> Option<&ShardSpec> {
        self.specs.iter().find(|s| s.name == name)
    }
}

/// Partition of the whole model over `world_size` ranks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub world_size: usize,
    pub architecture: ModelArchitecture,
    pub ranks: Vec<RankPartition>,
}

/// Split `units` into `world` contiguous blocks, remainder to the lowest ranks
pub fn even_ranges(units: usize, world: usize) -> Vec<(usize, usize)> {
    let base = units / world;
    let rem = units % world;
    let mut ranges = Vec::with_capacity(world);
    let mut start = 0;
    for r in 0..world {
        let len = base + usize::from(r < rem);
        ranges.push((start, start + len));
        start += len;
    }
    ranges
}

fn scaled(ranges: Vec<(usize, usize)>, factor: usize) -> Vec<(usize, usize)> {
    ranges
        .into_iter()
        .map(|(s, e)| (s * factor, e * factor))
        .collect()
}

/// Element ranges along the split axis for every rank
fn axis_ranges(
    name: &str,
    rule: &SplitRule,
    arch: &ModelArchitecture,
    axis_len: usize,
    world: usize,
) -> Result<Vec<(usize, usize)>> {
    let head_dim = arch.head_dim();
    let mismatch = |expected: usize, what: &str| {
        NodeError::PartitionConfig(format!(
            "{}: split axis has {} elements, expected {} ({})",
            name, axis_len, expected, what
        ))
    };

    match rule.unit {
        SplitUnit::Element => {
            if axis_len < world {
                return Err(NodeError::PartitionConfig(format!(
                    "{}: split axis of {} elements cannot be dealt to {} ranks",
                    name, axis_len, world
                )));
            }
            Ok(even_ranges(axis_len, world))
        }
        SplitUnit::QueryHead => {
            let expected = arch.num_attention_heads * head_dim;
            if axis_len != expected {
                return Err(mismatch(expected, "query heads x head_dim"));
            }
            // query heads follow their key/value group so no group straddles ranks
            let group_width = arch.kv_group_size() * head_dim;
            Ok(scaled(even_ranges(arch.num_key_value_heads, world), group_width))
        }
        SplitUnit::KvHead => {
            let expected = arch.num_key_value_heads * head_dim;
            if axis_len != expected {
                return Err(mismatch(expected, "key/value heads x head_dim"));
            }
            Ok(scaled(even_ranges(arch.num_key_value_heads, world), head_dim))
        }
        SplitUnit::FusedHead => {
            if axis_len % head_dim != 0 {
                return Err(NodeError::PartitionConfig(format!(
                    "{}: {} rows would split mid-head (head_dim {})",
                    name, axis_len, head_dim
                )));
            }
            let heads = axis_len / head_dim;
            if heads < world {
                return Err(NodeError::PartitionConfig(format!(
                    "{}: {} head blocks cannot be dealt to {} ranks",
                    name, heads, world
                )));
            }
            Ok(scaled(even_ranges(heads, world), head_dim))
        }
    }
}

/// Compute the per-rank shard layout for a model
pub fn build_partition(
    manifest: &ModelManifest,
    world_size: usize,
    policy: &SplitPolicy,
) -> Result<Partition> {
    let arch = &manifest.architecture;
    if world_size == 0 {
        return Err(NodeError::PartitionConfig(
            "world_size must be at least 1".to_string(),
        ));
    }
    arch.validate()?;
    if arch.num_key_value_heads < world_size {
        return Err(NodeError::PartitionConfig(format!(
            "{} key/value heads cannot be split over {} ranks",
            arch.num_key_value_heads, world_size
        )));
    }

    let mut ranks: Vec<RankPartition> = (0..world_size)
        .map(|rank| RankPartition {
            rank,
            specs: Vec::new(),
        })
        .collect();

    for tensor in &manifest.tensors {
        let group = ShardGroup::of(&tensor.name)?;
        if let ShardGroup::Layer(i) = group {
            if i >= arch.num_layers {
                return Err(NodeError::PartitionConfig(format!(
                    "{} refers to layer {} but the model has {} layers",
                    tensor.name, i, arch.num_layers
                )));
            }
        }
        let rule = policy.rule_for(&tensor.name)?;
        let axis = rule.role.axis(tensor.shape.len());

        let ranges = match axis {
            Some(a) => {
                let axis_len = *tensor.shape.get(a).ok_or_else(|| {
                    NodeError::PartitionConfig(format!(
                        "{} has shape {:?}, no axis {}",
                        tensor.name, tensor.shape, a
                    ))
                })?;
                axis_ranges(&tensor.name, rule, arch, axis_len, world_size)?
            }
            None => vec![(0, tensor.shape.first().copied().unwrap_or(1)); world_size],
        };

        for (rank, (start, end)) in ranges.into_iter().enumerate() {
            let mut shard_shape = tensor.shape.clone();
            if let Some(a) = axis {
                shard_shape[a] = end - start;
            }
            ranks[rank].specs.push(ShardSpec {
                name: tensor.name.clone(),
                group,
                role: rule.role,
                dtype: tensor.dtype,
                full_shape: tensor.shape.clone(),
                axis,
                start,
                end,
                shard_shape,
            });
        }
        debug!(tensor = %tensor.name, role = ?rule.role, ?axis, "Partitioned tensor");
    }

    for rank in &mut ranks {
        rank.specs
            .sort_by(|a, b| (a.group, &a.name).cmp(&(b.group, &b.name)));
    }

    info!(
        world_size,
        tensors = manifest.tensors.len(),
        layers = arch.num_layers,
        "Built partition manifest"
    );

    Ok(Partition {
        world_size,
        architecture: arch.clone(),
        ranks,
    })
}

/// (outer blocks, bytes per unit along axis) for a contiguous row-major tensor
fn strides(shape: &[usize], axis: usize, elem: usize) -> (usize, usize) {
    let outer: usize = shape[..axis].iter().product();
    let inner: usize = shape[axis + 1..].iter().product::<usize>() * elem;
    (outer, inner)
}

/// Cut one rank's slice out of the full tensor bytes
pub fn extract_slice(spec: &ShardSpec, full: &[u8]) -> Result<Vec<u8>> {
    let elem = spec.dtype.size();
    let expected = spec.full_shape.iter().product::<usize>() * elem;
    if full.len() != expected {
        return Err(NodeError::PartitionConfig(format!(
            "{}: got {} bytes, shape {:?} needs {}",
            spec.name,
            full.len(),
            spec.full_shape,
            expected
        )));
    }

    let Some(axis) = spec.axis else {
        return Ok(full.to_vec());
    };

    let dim = spec.full_shape[axis];
    let (outer, inner) = strides(&spec.full_shape, axis, elem);
    let mut out = Vec::with_capacity(spec.byte_len());
    for o in 0..outer {
        let base = o * dim * inner;
        out.extend_from_slice(&full[base + spec.start * inner..base + spec.end * inner]);
    }
    Ok(out)
}

/// Rebuild the full tensor from every rank's slice (concatenation along the axis)
pub fn reassemble(parts: &[(&ShardSpec, &[u8])]) -> Result<Vec<u8>> {
    let (first, first_bytes) = parts
        .first()
        .ok_or_else(|| NodeError::PartitionConfig("no shards to reassemble".to_string()))?;

    let Some(axis) = first.axis else {
        return Ok(first_bytes.to_vec());
    };

    let mut ordered: Vec<&(&ShardSpec, &[u8])> = parts.iter().collect();
    ordered.sort_by_key(|(s, _)| s.start);

    let dim = first.full_shape[axis];
    let mut cursor = 0;
    for (spec, _) in &ordered {
        if spec.start != cursor {
            return Err(NodeError::PartitionConfig(format!(
                "{}: shards leave a gap at {}",
                first.name, cursor
            )));
        }
        cursor = spec.end;
    }
    if cursor != dim {
        return Err(NodeError::PartitionConfig(format!(
            "{}: shards cover {} of {} elements",
            first.name, cursor, dim
        )));
    }

    let elem = first.dtype.size();
    let (outer, inner) = strides(&first.full_shape, axis, elem);
    let mut out = Vec::with_capacity(outer * dim * inner);
    for o in 0..outer {
        for (spec, bytes) in &ordered {
            let width = (spec.end - spec.start) * inner;
            out.extend_from_slice(&bytes[o * width..(o + 1) * width]);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::manifest::TensorInfo;

    fn arch(layers: usize, hidden: usize, heads: usize, kv_heads: usize) -> ModelArchitecture {
        ModelArchitecture {
            num_layers: layers,
            hidden_size: hidden,
            num_attention_heads: heads,
            num_key_value_heads: kv_heads,
            intermediate_size: hidden * 2,
            vocab_size: 100,
            rms_norm_eps: 1e-5,
            rope_theta: 10_000.0,
            max_position_embeddings: 0,
            eos_token_id: None,
        }
    }

    fn tensor(name: &str, shape: Vec<usize>) -> TensorInfo {
        TensorInfo {
            name: name.to_string(),
            shape,
            dtype: DType::F32,
            offset: 0,
        }
    }

    #[test]
    fn test_even_ranges_remainder_to_lowest() {
        assert_eq!(even_ranges(10, 3), vec![(0, 4), (4, 7), (7, 10)]);
        assert_eq!(even_ranges(8, 4), vec![(0, 2), (2, 4), (4, 6), (6, 8)]);
    }

    #[test]
    fn test_fused_qkv_scenario() {
        let manifest = ModelManifest {
            architecture: arch(32, 4096, 32, 32),
            tensors: vec![tensor(
                "model.layers.0.self_attn.qkv_proj.weight",
                vec![12288, 4096],
            )],
        };
        let partition = build_partition(&manifest, 4, &SplitPolicy::llama()).unwrap();

        for (r, rank) in partition.ranks.iter().enumerate() {
            let spec = &rank.specs[0];
            assert_eq!(spec.shard_shape, vec![3072, 4096]);
            assert_eq!((spec.start, spec.end), (r * 3072, (r + 1) * 3072));
            assert_eq!(spec.start % 128, 0);
            assert_eq!((spec.end - spec.start) / 128, 24);
        }
    }

    #[test]
    fn test_gqa_query_follows_kv_groups() {
        // 8 query heads over 2 kv heads, head_dim 4
        let manifest = ModelManifest {
            architecture: arch(1, 32, 8, 2),
            tensors: vec![
                tensor("model.layers.0.self_attn.q_proj.weight", vec![32, 32]),
                tensor("model.layers.0.self_attn.k_proj.weight", vec![8, 32]),
                tensor("model.layers.0.self_attn.o_proj.weight", vec![32, 32]),
            ],
        };
        let p = build_partition(&manifest, 2, &SplitPolicy::llama()).unwrap();
        let q = p.ranks[1].spec("model.layers.0.self_attn.q_proj.weight").unwrap();
        let k = p.ranks[1].spec("model.layers.0.self_attn.k_proj.weight").unwrap();
        let o = p.ranks[1].spec("model.layers.0.self_attn.o_proj.weight").unwrap();
        assert_eq!((q.start, q.end), (16, 32));
        assert_eq!((k.start, k.end), (4, 8));
        assert_eq!(o.axis, Some(1));
        assert_eq!(o.shard_shape, vec![32, 16]);
    }

    #[test]
    fn test_more_ranks_than_kv_heads_fails() {
        let manifest = ModelManifest {
            architecture: arch(1, 32, 8, 2),
            tensors: vec![],
        };
        assert!(matches!(
            build_partition(&manifest, 4, &SplitPolicy::llama()),
            Err(NodeError::PartitionConfig(_))
        ));
        assert!(build_partition(&manifest, 0, &SplitPolicy::llama()).is_err());
    }

    #[test]
    fn test_mid_head_split_fails() {
        let manifest = ModelManifest {
            architecture: arch(1, 32, 8, 8),
            tensors: vec![tensor("model.layers.0.self_attn.qkv_proj.weight", vec![90, 32])],
        };
        assert!(matches!(
            build_partition(&manifest, 2, &SplitPolicy::llama()),
            Err(NodeError::PartitionConfig(_))
        ));
    }

    #[test]
    fn test_replicated_and_deterministic() {
        let manifest = ModelManifest {
            architecture: arch(2, 16, 4, 4),
            tensors: vec![
                tensor("model.layers.1.input_layernorm.weight", vec![16]),
                tensor("model.layers.0.mlp.up_proj.weight", vec![32, 16]),
                tensor("model.embed_tokens.weight", vec![100, 16]),
            ],
        };
        let a = build_partition(&manifest, 3, &SplitPolicy::llama()).unwrap();
        let b = build_partition(&manifest, 3, &SplitPolicy::llama()).unwrap();
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );

        let rank2 = &a.ranks[2];
        assert_eq!(rank2.specs[0].group, ShardGroup::Embed);
        let norm = rank2.spec("model.layers.1.input_layernorm.weight").unwrap();
        assert_eq!(norm.axis, None);
        assert_eq!(norm.shard_shape, vec![16]);
        let embed = rank2.spec("model.embed_tokens.weight").unwrap();
        assert_eq!((embed.start, embed.end), (67, 100));
        assert_eq!(rank2.by_group().len(), 3);
    }

    #[test]
    fn test_layernorm_biases_are_replicated() {
        let manifest = ModelManifest {
            architecture: arch(1, 16, 4, 4),
            tensors: vec![
                tensor("model.layers.0.input_layernorm.bias", vec![16]),
                tensor("model.layers.0.post_attention_layernorm.bias", vec![16]),
                tensor("model.norm.bias", vec![16]),
            ],
        };
        let partition = build_partition(&manifest, 2, &SplitPolicy::llama()).unwrap();
        for rank in &partition.ranks {
            for spec in &rank.specs {
                assert_eq!(spec.axis, None, "{}", spec.name);
                assert_eq!(spec.shard_shape, vec![16]);
            }
        }
        assert_eq!(
            partition.ranks[1].spec("model.norm.bias").unwrap().group,
            ShardGroup::Output
        );
    }

    #[test]
    fn test_slice_and_reassemble_bit_exact() {
        let manifest = ModelManifest {
            architecture: arch(1, 8, 2, 2),
            tensors: vec![tensor("model.layers.0.mlp.down_proj.weight", vec![8, 16])],
        };
        let p = build_partition(&manifest, 2, &SplitPolicy::llama()).unwrap();
        let values: Vec<f32> = (0..128).map(|i| i as f32 * 0.37 - 3.0).collect();
        let full = DType::F32.encode(&values);

        let slices: Vec<(ShardSpec, Vec<u8>)> = p
            .ranks
            .iter()
            .map(|r| {
                let spec = r.specs[0].clone();
                let bytes = extract_slice(&spec, &full).unwrap();
                (spec, bytes)
            })
            .collect();
        // row-parallel: each rank holds 8 of 16 columns in every row
        assert_eq!(slices[0].1.len(), 8 * 8 * 4);
        let first_row = DType::F32.decode(&slices[1].1[..32]).unwrap();
        assert_eq!(first_row, values[8..16].to_vec());

        let parts: Vec<(&ShardSpec, &[u8])> =
            slices.iter().map(|(s, b)| (s, b.as_slice())).collect();
        assert_eq!(reassemble(&parts).unwrap(), full);
        assert!(reassemble(&parts[..1]).is_err());
    }
}
