//! Per-rank layer math for the tensor-parallel forward pass
//!
//! Every function here works on this rank's slice of the weights only and
//! returns a *partial* result. The session sums partials across ranks.
//!
//! ```text
//! hidden [s, h] (identical on every rank)
//!   │ rms_norm ─ q/k/v (local heads) ─ RoPE ─ KV append ─ attention
//!   │ o_proj rows for local heads            ──▶ partial [s, h]  ── all-reduce
//!   ▼
//! hidden += attn
//!   │ rms_norm ─ gate/up (local columns) ─ silu(gate) * up
//!   │ down_proj rows for local columns       ──▶ partial [s, h]  ── all-reduce
//!   ▼
//! hidden += mlp
//! ```

use super::kv_cache::LayerKVCache;
use super::tensor_ops::{
    apply_rope, causal_attention, embed_vocab_slice, linear, rms_norm, silu, Tensor2D,
};
use crate::errors::{NodeError, Result};
use crate::memory::LayerShard;
use crate::model::partition::even_ranges;
use crate::model::ModelArchitecture;

/// Checkpoint tensor names of one decoder layer
#[derive(Debug, Clone)]
pub struct LayerNames {
    pub input_norm: String,
    pub q_proj: String,
    pub k_proj: String,
    pub v_proj: String,
    pub q_bias: String,
    pub k_bias: String,
    pub v_bias: String,
    pub o_proj: String,
    pub o_bias: String,
    pub post_norm: String,
    pub gate_proj: String,
    pub up_proj: String,
    pub down_proj: String,
    pub gate_bias: String,
    pub up_bias: String,
    pub down_bias: String,
}

impl LayerNames {
    pub fn new(layer: usize) -> Self {
        let p = format!("model.layers.{}", layer);
        Self {
            input_norm: format!("{p}.input_layernorm.weight"),
            q_proj: format!("{p}.self_attn.q_proj.weight"),
            k_proj: format!("{p}.self_attn.k_proj.weight"),
            v_proj: format!("{p}.self_attn.v_proj.weight"),
            q_bias: format!("{p}.self_attn.q_proj.bias"),
            k_bias: format!("{p}.self_attn.k_proj.bias"),
            v_bias: format!("{p}.self_attn.v_proj.bias"),
            o_proj: format!("{p}.self_attn.o_proj.weight"),
            o_bias: format!("{p}.self_attn.o_proj.bias"),
            post_norm: format!("{p}.post_attention_layernorm.weight"),
            gate_proj: format!("{p}.mlp.gate_proj.weight"),
            up_proj: format!("{p}.mlp.up_proj.weight"),
            down_proj: format!("{p}.mlp.down_proj.weight"),
            gate_bias: format!("{p}.mlp.gate_proj.bias"),
            up_bias: format!("{p}.mlp.up_proj.bias"),
            down_bias: format!("{p}.mlp.down_proj.bias"),
        }
    }
}

pub const EMBED_TOKENS: &str = "model.embed_tokens.weight";
pub const FINAL_NORM: &str = "model.norm.weight";
pub const LM_HEAD: &str = "lm_head.weight";

/// Key/value width this rank caches per layer
pub fn local_kv_dim(arch: &ModelArchitecture, rank: usize, world_size: usize) -> usize {
    let (start, end) = even_ranges(arch.num_key_value_heads, world_size)[rank];
    (end - start) * arch.head_dim()
}

/// Projection plus its optional bias slice
fn project(shard: &LayerShard, x: &Tensor2D, weight: &str, bias: &str) -> Result<Tensor2D> {
    let mut out = linear(x, shard.matrix(weight)?)?;
    if let Some(b) = shard.get(bias) {
        out.add_row_vector(&b.data)?;
    }
    Ok(out)
}

/// Attention block for the local heads, through this rank's o_proj rows.
///
/// Appends the new keys/values to `cache`. `add_bias` adds the replicated
/// o_proj bias; exactly one rank must pass `true`.
pub fn attention_partial(
    shard: &LayerShard,
    arch: &ModelArchitecture,
    names: &LayerNames,
    hidden: &Tensor2D,
    cache: &mut LayerKVCache,
    add_bias: bool,
) -> Result<Tensor2D> {
    let head_dim = arch.head_dim();
    let start_pos = cache.seq_len();
    let positions: Vec<usize> = (start_pos..start_pos + hidden.rows).collect();

    let x = rms_norm(hidden, shard.vector(&names.input_norm)?, arch.rms_norm_eps)?;
    let q = project(shard, &x, &names.q_proj, &names.q_bias)?;
    let k = project(shard, &x, &names.k_proj, &names.k_bias)?;
    let v = project(shard, &x, &names.v_proj, &names.v_bias)?;

    let local_heads = q.cols / head_dim;
    let local_kv_heads = k.cols / head_dim;

    let q = apply_rope(&q, &positions, head_dim, arch.rope_theta)?;
    let k = apply_rope(&k, &positions, head_dim, arch.rope_theta)?;
    cache.update(&k, &v)?;

    let mut out = if local_heads == 0 {
        // more ranks than kv heads: this rank holds no attention slice
        Tensor2D::zeros(hidden.rows, arch.hidden_size)
    } else {
        let attn = causal_attention(
            &q,
            cache.keys(),
            cache.values(),
            local_heads,
            local_kv_heads,
            head_dim,
            start_pos,
        )?;
        linear(&attn, shard.matrix(&names.o_proj)?)?
    };

    if add_bias {
        if let Some(b) = shard.get(&names.o_bias) {
            out.add_row_vector(&b.data)?;
        }
    }
    Ok(out)
}

/// SwiGLU MLP over this rank's intermediate columns
pub fn mlp_partial(
    shard: &LayerShard,
    arch: &ModelArchitecture,
    names: &LayerNames,
    hidden: &Tensor2D,
    add_bias: bool,
) -> Result<Tensor2D> {
    let x = rms_norm(hidden, shard.vector(&names.post_norm)?, arch.rms_norm_eps)?;
    let gate = project(shard, &x, &names.gate_proj, &names.gate_bias)?;
    let up = project(shard, &x, &names.up_proj, &names.up_bias)?;
    let act = silu(&gate).mul(&up)?;

    let mut out = linear(&act, shard.matrix(&names.down_proj)?)?;
    if add_bias {
        if let Some(b) = shard.get(&names.down_bias) {
            out.add_row_vector(&b.data)?;
        }
    }
    Ok(out)
}

/// This rank's contiguous range of vocabulary ids.
///
/// The embed and output shards are window entries, so they are passed in
/// per call and their slice shape is checked on every use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VocabSlice {
    pub start: usize,
    pub end: usize,
}

impl VocabSlice {
    pub fn new(arch: &ModelArchitecture, rank: usize, world_size: usize) -> Self {
        let (start, end) = even_ranges(arch.vocab_size, world_size)[rank];
        Self { start, end }
    }

    fn matrix<'a>(
        &self,
        shard: &'a LayerShard,
        name: &str,
        arch: &ModelArchitecture,
    ) -> Result<&'a Tensor2D> {
        let t = shard.matrix(name)?;
        if t.rows != self.end - self.start || t.cols != arch.hidden_size {
            return Err(NodeError::ShardLoad(format!(
                "{} slice is {}x{}, expected {}x{} for vocab ids {}..{}",
                name,
                t.rows,
                t.cols,
                self.end - self.start,
                arch.hidden_size,
                self.start,
                self.end
            )));
        }
        Ok(t)
    }

    /// Embedding rows for ids in this slice, zeros elsewhere
    pub fn embed_partial(
        &self,
        embed: &LayerShard,
        arch: &ModelArchitecture,
        tokens: &[u32],
    ) -> Result<Tensor2D> {
        let table = self.matrix(embed, EMBED_TOKENS, arch)?;
        Ok(embed_vocab_slice(table, self.start, tokens))
    }

    /// Logits for this slice from the last hidden row
    pub fn logits_partial(
        &self,
        output: &LayerShard,
        arch: &ModelArchitecture,
        hidden: &Tensor2D,
    ) -> Result<Vec<f32>> {
        let head = self.matrix(output, LM_HEAD, arch)?;
        let last = hidden.last_row();
        let x = rms_norm(&last, output.vector(FINAL_NORM)?, arch.rms_norm_eps)?;
        Ok(linear(&x, head)?.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DiskLayerSource, LayerSource};
    use crate::model::split_policy::SplitPolicy;
    use crate::model::synthetic::{generate_model_with, tiny_architecture};
    use crate::model::{build_partition, rank_dir, write_shards, DType, ShardGroup};
    use tempfile::TempDir;

    fn sources(world: usize, bias: bool) -> (TempDir, Vec<DiskLayerSource>) {
        let dir = TempDir::new().unwrap();
        let model_dir = dir.path().join("model");
        let split_dir = dir.path().join("split");
        let manifest =
            generate_model_with(&model_dir, &tiny_architecture(), DType::F32, 5, bias).unwrap();
        let partition = build_partition(&manifest, world, &SplitPolicy::llama()).unwrap();
        write_shards(&model_dir, &manifest, &partition, &split_dir, false).unwrap();
        let sources = (0..world)
            .map(|r| DiskLayerSource::open(&rank_dir(&split_dir, r)).unwrap())
            .collect();
        (dir, sources)
    }

    fn hidden(rows: usize) -> Tensor2D {
        let h = tiny_architecture().hidden_size;
        Tensor2D::new(
            (0..rows * h).map(|i| ((i % 7) as f32 - 3.0) * 0.1).collect(),
            rows,
            h,
        )
        .unwrap()
    }

    fn assert_close(a: &Tensor2D, b: &Tensor2D) {
        assert_eq!((a.rows, a.cols), (b.rows, b.cols));
        for (x, y) in a.data.iter().zip(&b.data) {
            assert!((x - y).abs() < 1e-4, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_partials_sum_to_single_rank_result() {
        let arch = tiny_architecture();
        let names = LayerNames::new(1);
        let (_a, single) = sources(1, true);
        let (_b, split) = sources(2, true);
        let x = hidden(3);

        let full_shard = single[0].load(ShardGroup::Layer(1)).unwrap();
        let mut full_cache = LayerKVCache::new(1, local_kv_dim(&arch, 0, 1));
        let attn = attention_partial(&full_shard, &arch, &names, &x, &mut full_cache, true).unwrap();
        let mlp = mlp_partial(&full_shard, &arch, &names, &x, true).unwrap();

        let mut attn_sum = Tensor2D::zeros(3, arch.hidden_size);
        let mut mlp_sum = Tensor2D::zeros(3, arch.hidden_size);
        for (rank, source) in split.iter().enumerate() {
            let shard = source.load(ShardGroup::Layer(1)).unwrap();
            let mut cache = LayerKVCache::new(1, local_kv_dim(&arch, rank, 2));
            let a = attention_partial(&shard, &arch, &names, &x, &mut cache, rank == 0).unwrap();
            let m = mlp_partial(&shard, &arch, &names, &x, rank == 0).unwrap();
            attn_sum = attn_sum.add(&a).unwrap();
            mlp_sum = mlp_sum.add(&m).unwrap();
            assert_eq!(cache.seq_len(), 3);
        }

        assert_close(&attn_sum, &attn);
        assert_close(&mlp_sum, &mlp);
    }

    #[test]
    fn test_edge_slices_cover_vocab() {
        let arch = tiny_architecture();
        let (_d, split) = sources(2, false);
        let tokens = [0u32, 47, 48, 95];

        let mut embedded = Tensor2D::zeros(tokens.len(), arch.hidden_size);
        let mut logits = Vec::new();
        for (rank, source) in split.iter().enumerate() {
            let slice = VocabSlice::new(&arch, rank, 2);
            assert_eq!(slice.start, rank * 48);
            let embed = source.load(ShardGroup::Embed).unwrap();
            let output = source.load(ShardGroup::Output).unwrap();
            embedded = embedded
                .add(&slice.embed_partial(&embed, &arch, &tokens).unwrap())
                .unwrap();
            logits.extend(slice.logits_partial(&output, &arch, &hidden(2)).unwrap());
        }

        assert_eq!(logits.len(), arch.vocab_size);
        // every token found exactly one owner
        for row in 0..tokens.len() {
            assert!(embedded.row(row).iter().any(|v| *v != 0.0));
        }
    }

    #[test]
    fn test_slice_from_other_world_size_is_rejected() {
        let arch = tiny_architecture();
        let (_d, split) = sources(2, false);
        let embed = split[0].load(ShardGroup::Embed).unwrap();
        let whole = VocabSlice::new(&arch, 0, 1);
        assert!(matches!(
            whole.embed_partial(&embed, &arch, &[1]),
            Err(NodeError::ShardLoad(_))
        ));
    }

    #[test]
    fn test_local_dims() {
        let arch = tiny_architecture();
        assert_eq!(local_kv_dim(&arch, 0, 1), 16);
        assert_eq!(local_kv_dim(&arch, 1, 2), 8);
        assert_eq!(VocabSlice::new(&arch, 1, 2), VocabSlice { start: 48, end: 96 });
    }
}
