//! KV cache for the local attention heads
//!
//! Each rank caches keys and values only for its own key/value heads. Cache
//! entries live for the whole generation session and are independent of
//! whether the layer's weights are currently resident.

use super::tensor_ops::Tensor2D;
use crate::errors::{NodeError, Result};

/// Key-Value cache for a single attention layer
#[derive(Debug, Clone)]
pub struct LayerKVCache {
    /// Cached keys: [seq_len, local_kv_heads * head_dim]
    keys: Tensor2D,
    /// Cached values: [seq_len, local_kv_heads * head_dim]
    values: Tensor2D,
    pub layer_idx: usize,
}

impl LayerKVCache {
    pub fn new(layer_idx: usize, kv_dim: usize) -> Self {
        Self {
            keys: Tensor2D::zeros(0, kv_dim),
            values: Tensor2D::zeros(0, kv_dim),
            layer_idx,
        }
    }

    /// Append keys and values for new positions
    pub fn update(&mut self, new_keys: &Tensor2D, new_values: &Tensor2D) -> Result<()> {
        if new_keys.rows != new_values.rows
            || new_keys.cols != self.keys.cols
            || new_values.cols != self.values.cols
        {
            return Err(NodeError::Execution(format!(
                "KV cache update shape mismatch on layer {}: keys {}x{}, values {}x{}, cache width {}",
                self.layer_idx,
                new_keys.rows,
                new_keys.cols,
                new_values.rows,
                new_values.cols,
                self.keys.cols
            )));
        }

        self.keys.data.extend_from_slice(&new_keys.data);
        self.keys.rows += new_keys.rows;
        self.values.data.extend_from_slice(&new_values.data);
        self.values.rows += new_values.rows;
        Ok(())
    }

    pub fn keys(&self) -> &Tensor2D {
        &self.keys
    }

    pub fn values(&self) -> &Tensor2D {
        &self.values
    }

    pub fn seq_len(&self) -> usize {
        self.keys.rows
    }

    pub fn clear(&mut self) {
        self.keys = Tensor2D::zeros(0, self.keys.cols);
        self.values = Tensor2D::zeros(0, self.values.cols);
    }

    /// Truncate cache to a specific length
    pub fn truncate(&mut self, max_len: usize) {
        if self.seq_len() <= max_len {
            return;
        }
        let keep = max_len * self.keys.cols;
        self.keys.data.truncate(keep);
        self.keys.rows = max_len;
        self.values.data.truncate(keep);
        self.values.rows = max_len;
    }

    /// Get memory usage in bytes
    pub fn memory_usage(&self) -> usize {
        (self.keys.data.len() + self.values.data.len()) * std::mem::size_of::<f32>()
    }
}

/// Full KV cache for all layers on one rank
#[derive(Debug, Clone)]
pub struct KVCache {
    layers: Vec<LayerKVCache>,
}

impl KVCache {
    pub fn new(num_layers: usize, kv_dim: usize) -> Self {
        Self {
            layers: (0..num_layers)
                .map(|i| LayerKVCache::new(i, kv_dim))
                .collect(),
        }
    }

    pub fn layer(&self, layer_idx: usize) -> Option<&LayerKVCache> {
        self.layers.get(layer_idx)
    }

    pub fn layer_mut(&mut self, layer_idx: usize) -> Result<&mut LayerKVCache> {
        self.layers
            .get_mut(layer_idx)
            .ok_or_else(|| NodeError::Execution(format!("Invalid layer index: {}", layer_idx)))
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Positions cached so far (layer 0 is updated first in every pass)
    pub fn seq_len(&self) -> usize {
        self.layers.first().map(|l| l.seq_len()).unwrap_or(0)
    }

    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.clear();
        }
    }

    pub fn truncate(&mut self, max_len: usize) {
        for layer in &mut self.layers {
            layer.truncate(max_len);
        }
    }

    pub fn memory_usage(&self) -> usize {
        self.layers.iter().map(|l| l.memory_usage()).sum()
    }
}
