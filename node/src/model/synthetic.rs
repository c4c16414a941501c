//! Deterministic random Llama-shaped model
//!
//! Used by `tpi init-model` and by tests. Same architecture, dtype and seed
//! always produce byte-identical `weights.bin`.

use super::manifest::{DType, ModelArchitecture, ModelManifest, TensorInfo, WEIGHTS_FILE};
use crate::errors::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Small architecture that runs in milliseconds
pub fn tiny_architecture() -> ModelArchitecture {
    ModelArchitecture {
        num_layers: 4,
        hidden_size: 32,
        num_attention_heads: 4,
        num_key_value_heads: 2,
        intermediate_size: 64,
        vocab_size: 96,
        rms_norm_eps: 1e-5,
        rope_theta: 10_000.0,
        max_position_embeddings: 256,
        eos_token_id: None,
    }
}

/// Tensor names and shapes in checkpoint order
fn tensor_layout(arch: &ModelArchitecture, attention_bias: bool) -> Vec<(String, Vec<usize>)> {
    let h = arch.hidden_size;
    let kv = arch.num_key_value_heads * arch.head_dim();
    let ff = arch.intermediate_size;

    let mut layout = vec![("model.embed_tokens.weight".to_string(), vec![arch.vocab_size, h])];
    for i in 0..arch.num_layers {
        let p = format!("model.layers.{}", i);
        layout.push((format!("{p}.input_layernorm.weight"), vec![h]));
        layout.push((format!("{p}.self_attn.q_proj.weight"), vec![h, h]));
        layout.push((format!("{p}.self_attn.k_proj.weight"), vec![kv, h]));
        layout.push((format!("{p}.self_attn.v_proj.weight"), vec![kv, h]));
        layout.push((format!("{p}.self_attn.o_proj.weight"), vec![h, h]));
        if attention_bias {
            layout.push((format!("{p}.self_attn.q_proj.bias"), vec![h]));
            layout.push((format!("{p}.self_attn.k_proj.bias"), vec![kv]));
            layout.push((format!("{p}.self_attn.v_proj.bias"), vec![kv]));
            layout.push((format!("{p}.self_attn.o_proj.bias"), vec![h]));
        }
        layout.push((format!("{p}.post_attention_layernorm.weight"), vec![h]));
        layout.push((format!("{p}.mlp.gate_proj.weight"), vec![ff, h]));
        layout.push((format!("{p}.mlp.up_proj.weight"), vec![ff, h]));
        layout.push((format!("{p}.mlp.down_proj.weight"), vec![h, ff]));
    }
    layout.push(("model.norm.weight".to_string(), vec![h]));
    layout.push(("lm_head.weight".to_string(), vec![arch.vocab_size, h]));
    layout
}

/// Write a random model without biases
pub fn generate_model(
    model_dir: &Path,
    arch: &ModelArchitecture,
    dtype: DType,
    seed: u64,
) -> Result<ModelManifest> {
    generate_model_with(model_dir, arch, dtype, seed, false)
}

/// Write a random model into `model_dir` (`manifest.json` + `weights.bin`)
pub fn generate_model_with(
    model_dir: &Path,
    arch: &ModelArchitecture,
    dtype: DType,
    seed: u64,
    attention_bias: bool,
) -> Result<ModelManifest> {
    arch.validate()?;
    fs::create_dir_all(model_dir)?;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = BufWriter::new(File::create(model_dir.join(WEIGHTS_FILE))?);
    let mut tensors = Vec::new();
    let mut offset = 0u64;

    for (name, shape) in tensor_layout(arch, attention_bias) {
        let numel: usize = shape.iter().product();
        let values: Vec<f32> = if name.ends_with("norm.weight") {
            (0..numel).map(|_| 1.0 + rng.gen_range(-0.1f32..0.1)).collect()
        } else {
            // keep activations O(1) through the stack
            let fan_in = *shape.last().unwrap_or(&1) as f32;
            let scale = if name.contains("embed_tokens") {
                1.0
            } else {
                1.0 / fan_in.sqrt()
            };
            (0..numel).map(|_| rng.gen_range(-scale..scale)).collect()
        };

        let bytes = dtype.encode(&values);
        out.write_all(&bytes)?;
        tensors.push(TensorInfo {
            name,
            shape,
            dtype,
            offset,
        });
        offset += bytes.len() as u64;
    }
    out.flush()?;

    let manifest = ModelManifest {
        architecture: arch.clone(),
        tensors,
    };
    manifest.save(model_dir)?;

    info!(
        model_dir = %model_dir.display(),
        layers = arch.num_layers,
        bytes = offset,
        "Synthetic model written"
    );
    Ok(manifest)
}
