//! Per-tensor split rules
//!
//! Attention and MLP projections use the column-then-row pairing so every
//! block needs exactly one cross-rank reduction. Weights are stored as
//! `[out_features, in_features]`, so column-parallel layers split axis 0 and
//! row-parallel layers split axis 1.

use crate::errors::{NodeError, Result};
use serde::{Deserialize, Serialize};

/// How a tensor is distributed across ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorRole {
    /// Output features split; partial outputs stay local
    ColumnParallel,
    /// Input features split; partial outputs are summed across ranks
    RowParallel,
    /// Vocabulary rows split
    VocabParallel,
    /// Full copy on every rank
    Replicated,
}

impl TensorRole {
    /// Split axis for a tensor of the given rank (number of dims)
    pub fn axis(&self, ndim: usize) -> Option<usize> {
        match self {
            TensorRole::ColumnParallel | TensorRole::VocabParallel => Some(0),
            TensorRole::RowParallel if ndim >= 2 => Some(1),
            TensorRole::RowParallel | TensorRole::Replicated => None,
        }
    }
}

/// Granularity of the blocks dealt out to ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitUnit {
    /// Single elements along the axis (MLP, vocabulary)
    Element,
    /// Query heads, dealt in whole key/value groups
    QueryHead,
    /// Key/value heads
    KvHead,
    /// Rows of a fused q/k/v projection, in `head_dim` blocks
    FusedHead,
}

/// Rule matching tensors by name suffix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitRule {
    pub suffix: String,
    pub role: TensorRole,
    pub unit: SplitUnit,
}

impl SplitRule {
    fn new(suffix: &str, role: TensorRole, unit: SplitUnit) -> Self {
        Self {
            suffix: suffix.to_string(),
            role,
            unit,
        }
    }
}

/// Where a tensor lives in the per-rank file layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ShardGroup {
    /// Token embedding
    Embed,
    /// Everything under `model.layers.{i}.`
    Layer(usize),
    /// Final norm and LM head
    Output,
}

impl ShardGroup {
    /// Shard file name for this group
    pub fn file_name(&self) -> String {
        match self {
            ShardGroup::Embed => "embed.shard".to_string(),
            ShardGroup::Layer(i) => format!("layer_{:03}.shard", i),
            ShardGroup::Output => "output.shard".to_string(),
        }
    }

    /// Slot in one token's forward pass: embed, layers in order, output
    pub fn pass_position(&self, num_layers: usize) -> usize {
        match self {
            ShardGroup::Embed => 0,
            ShardGroup::Layer(i) => i + 1,
            ShardGroup::Output => num_layers + 1,
        }
    }

    pub fn at_pass_position(position: usize, num_layers: usize) -> Option<Self> {
        match position {
            0 => Some(ShardGroup::Embed),
            p if p <= num_layers => Some(ShardGroup::Layer(p - 1)),
            p if p == num_layers + 1 => Some(ShardGroup::Output),
            _ => None,
        }
    }

    /// Every group of a model in pass order
    pub fn pass_order(num_layers: usize) -> Vec<Self> {
        (0..num_layers + 2)
            .filter_map(|p| Self::at_pass_position(p, num_layers))
            .collect()
    }

    /// Group a tensor name belongs to
    pub fn of(name: &str) -> Result<Self> {
        if let Some(rest) = name.strip_prefix("model.layers.") {
            let idx = rest.split('.').next().unwrap_or_default();
            return idx.parse::<usize>().map(ShardGroup::Layer).map_err(|_| {
                NodeError::PartitionConfig(format!("bad layer index in tensor name {}", name))
            });
        }
        if name.starts_with("model.embed_tokens.") {
            return Ok(ShardGroup::Embed);
        }
        if name.starts_with("model.norm.") || name.starts_with("lm_head.") {
            return Ok(ShardGroup::Output);
        }
        Err(NodeError::PartitionConfig(format!(
            "tensor {} does not belong to embed, layer or output groups",
            name
        )))
    }
}

/// Ordered rule list; first matching suffix wins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitPolicy {
    pub rules: Vec<SplitRule>,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self::llama()
    }
}

impl SplitPolicy {
    /// Rules for Llama-style checkpoints
    pub fn llama() -> Self {
        use SplitUnit::*;
        use TensorRole::*;

        let mut rules = Vec::new();
        for kind in ["weight", "bias"] {
            rules.push(SplitRule::new(&format!("self_attn.q_proj.{kind}"), ColumnParallel, QueryHead));
            rules.push(SplitRule::new(&format!("self_attn.k_proj.{kind}"), ColumnParallel, KvHead));
            rules.push(SplitRule::new(&format!("self_attn.v_proj.{kind}"), ColumnParallel, KvHead));
            rules.push(SplitRule::new(&format!("self_attn.qkv_proj.{kind}"), ColumnParallel, FusedHead));
            rules.push(SplitRule::new(&format!("mlp.gate_proj.{kind}"), ColumnParallel, Element));
            rules.push(SplitRule::new(&format!("mlp.up_proj.{kind}"), ColumnParallel, Element));
        }
        rules.push(SplitRule::new("self_attn.o_proj.weight", RowParallel, QueryHead));
        rules.push(SplitRule::new("mlp.down_proj.weight", RowParallel, Element));
        // reduced outputs get the bias once, so it is kept whole
        rules.push(SplitRule::new("self_attn.o_proj.bias", Replicated, Element));
        rules.push(SplitRule::new("mlp.down_proj.bias", Replicated, Element));
        rules.push(SplitRule::new("embed_tokens.weight", VocabParallel, Element));
        rules.push(SplitRule::new("lm_head.weight", VocabParallel, Element));
        rules.push(SplitRule::new("norm.weight", Replicated, Element));
        rules.push(SplitRule::new("norm.bias", Replicated, Element));

        Self { rules }
    }

    /// Rule for a tensor name, or `PartitionConfig` if nothing matches
    pub fn rule_for(&self, name: &str) -> Result<&SplitRule> {
        self.rules
            .iter()
            .find(|r| name.ends_with(&r.suffix))
            .ok_or_else(|| {
                NodeError::PartitionConfig(format!("no split rule matches tensor {}", name))
            })
    }
}
