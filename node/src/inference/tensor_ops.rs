//! Tensor operations for the tensor-parallel forward pass
//!
//! Weights are stored `[out_features, in_features]` (checkpoint order), so
//! [`linear`] computes `x @ W^T`. All reductions run in a fixed order so the
//! same inputs always give bit-identical outputs.

use crate::errors::{NodeError, Result};

/// 2D Tensor for transformer computations
///
/// Shape convention: [sequence_length, features]
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor2D {
    /// Row-major data storage
    pub data: Vec<f32>,
    pub rows: usize,
    pub cols: usize,
}

impl Tensor2D {
    pub fn new(data: Vec<f32>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(NodeError::Execution(format!(
                "Data length {} doesn't match shape {}x{}={}",
                data.len(),
                rows,
                cols,
                rows * cols
            )));
        }
        Ok(Self { data, rows, cols })
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    pub fn row(&self, row: usize) -> &[f32] {
        let start = row * self.cols;
        &self.data[start..start + self.cols]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element-wise addition
    pub fn add(&self, other: &Tensor2D) -> Result<Tensor2D> {
        self.zip_with(other, "add", |a, b| a + b)
    }

    /// Element-wise multiplication (Hadamard product)
    pub fn mul(&self, other: &Tensor2D) -> Result<Tensor2D> {
        self.zip_with(other, "mul", |a, b| a * b)
    }

    fn zip_with(&self, other: &Tensor2D, op: &str, f: impl Fn(f32, f32) -> f32) -> Result<Tensor2D> {
        if self.rows != other.rows || self.cols != other.cols {
            return Err(NodeError::Execution(format!(
                "Shape mismatch for {}: {}x{} vs {}x{}",
                op, self.rows, self.cols, other.rows, other.cols
            )));
        }
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| f(a, b))
            .collect();
        Ok(Tensor2D {
            data,
            rows: self.rows,
            cols: self.cols,
        })
    }

    /// Add a bias vector to every row
    pub fn add_row_vector(&mut self, bias: &[f32]) -> Result<()> {
        if bias.len() != self.cols {
            return Err(NodeError::Execution(format!(
                "Bias length {} doesn't match {} columns",
                bias.len(),
                self.cols
            )));
        }
        for row in self.data.chunks_exact_mut(self.cols) {
            for (x, b) in row.iter_mut().zip(bias) {
                *x += b;
            }
        }
        Ok(())
    }

    /// Keep only the last row
    pub fn last_row(&self) -> Tensor2D {
        let start = self.data.len().saturating_sub(self.cols);
        Tensor2D {
            data: self.data[start..].to_vec(),
            rows: usize::from(self.rows > 0),
            cols: self.cols,
        }
    }
}

// ============== Matrix Operations ==============

/// Linear projection: x[m, in] @ W[out, in]^T -> [m, out]
pub fn linear(x: &Tensor2D, weight: &Tensor2D) -> Result<Tensor2D> {
    if x.cols != weight.cols {
        return Err(NodeError::Execution(format!(
            "Linear shape mismatch: {}x{} @ ({}x{})^T",
            x.rows, x.cols, weight.rows, weight.cols
        )));
    }

    let mut result = Vec::with_capacity(x.rows * weight.rows);
    for i in 0..x.rows {
        let xi = x.row(i);
        for o in 0..weight.rows {
            let wo = weight.row(o);
            let mut sum = 0.0f32;
            for k in 0..xi.len() {
                sum += xi[k] * wo[k];
            }
            result.push(sum);
        }
    }

    Ok(Tensor2D {
        data: result,
        rows: x.rows,
        cols: weight.rows,
    })
}

// ============== Activation Functions ==============

/// SiLU (Sigmoid Linear Unit) / Swish activation
///
/// silu(x) = x * sigmoid(x)
pub fn silu(tensor: &Tensor2D) -> Tensor2D {
    let data: Vec<f32> = tensor
        .data
        .iter()
        .map(|&x| x * (1.0 / (1.0 + (-x).exp())))
        .collect();

    Tensor2D {
        data,
        rows: tensor.rows,
        cols: tensor.cols,
    }
}

// ============== Normalization ==============

/// RMS Layer Normalization
///
/// RMSNorm(x) = x / sqrt(mean(x^2) + eps) * gamma
pub fn rms_norm(tensor: &Tensor2D, gamma: &[f32], eps: f32) -> Result<Tensor2D> {
    if tensor.cols != gamma.len() {
        return Err(NodeError::Execution(format!(
            "RMS norm dimension mismatch: tensor cols {} vs gamma {}",
            tensor.cols,
            gamma.len()
        )));
    }

    let mut result = Vec::with_capacity(tensor.data.len());
    for row in 0..tensor.rows {
        let row_data = tensor.row(row);
        let mean_sq: f32 = row_data.iter().map(|x| x * x).sum::<f32>() / tensor.cols as f32;
        let rms = (mean_sq + eps).sqrt();
        for (i, &x) in row_data.iter().enumerate() {
            result.push((x / rms) * gamma[i]);
        }
    }

    Ok(Tensor2D {
        data: result,
        rows: tensor.rows,
        cols: tensor.cols,
    })
}

// ============== Softmax ==============

/// Numerically stable softmax of one row, in place
pub fn softmax_in_place(values: &mut [f32]) {
    let max_val = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

// ============== Embedding Operations ==============

/// Embedding rows for the ids that fall in this rank's vocabulary slice.
///
/// `table` holds rows `vocab_start..vocab_start + table.rows`; ids outside
/// that range produce zero rows so the cross-rank sum yields the full lookup.
pub fn embed_vocab_slice(table: &Tensor2D, vocab_start: usize, tokens: &[u32]) -> Tensor2D {
    let mut out = Tensor2D::zeros(tokens.len(), table.cols);
    for (i, &token) in tokens.iter().enumerate() {
        let id = token as usize;
        if id >= vocab_start && id < vocab_start + table.rows {
            let dst = i * table.cols;
            out.data[dst..dst + table.cols].copy_from_slice(table.row(id - vocab_start));
        }
    }
    out
}

// ============== Rotary Position Embedding (RoPE) ==============

/// Apply rotary position embedding to every head in `tensor`
///
/// Rotates dimension pairs (d, d + head_dim/2) within each head.
pub fn apply_rope(
    tensor: &Tensor2D,
    positions: &[usize],
    head_dim: usize,
    base: f32,
) -> Result<Tensor2D> {
    if tensor.rows != positions.len() {
        return Err(NodeError::Execution(format!(
            "RoPE position count {} doesn't match sequence length {}",
            positions.len(),
            tensor.rows
        )));
    }
    if head_dim == 0 || tensor.cols % head_dim != 0 || head_dim % 2 != 0 {
        return Err(NodeError::Execution(format!(
            "RoPE needs an even head_dim dividing {} columns, got {}",
            tensor.cols, head_dim
        )));
    }

    let mut result = tensor.data.clone();
    let half_dim = head_dim / 2;
    let inv_freq: Vec<f32> = (0..half_dim)
        .map(|i| 1.0 / base.powf(i as f32 * 2.0 / head_dim as f32))
        .collect();

    for (seq_idx, &pos) in positions.iter().enumerate() {
        let pos_f = pos as f32;
        for (d, freq) in inv_freq.iter().enumerate() {
            let angle = pos_f * freq;
            let (sin_val, cos_val) = angle.sin_cos();
            for col_base in (0..tensor.cols).step_by(head_dim) {
                let idx1 = seq_idx * tensor.cols + col_base + d;
                let idx2 = idx1 + half_dim;
                let x1 = tensor.data[idx1];
                let x2 = tensor.data[idx2];
                result[idx1] = x1 * cos_val - x2 * sin_val;
                result[idx2] = x1 * sin_val + x2 * cos_val;
            }
        }
    }

    Ok(Tensor2D {
        data: result,
        rows: tensor.rows,
        cols: tensor.cols,
    })
}

// ============== Attention ==============

/// Causal grouped-query attention over this rank's local heads.
///
/// `q` is `[s, n_heads * head_dim]` for the new positions starting at
/// `start_pos`; `keys`/`values` are `[start_pos + s, n_kv_heads * head_dim]`
/// (cache plus new rows). Query head `h` reads key/value head `h / group`.
pub fn causal_attention(
    q: &Tensor2D,
    keys: &Tensor2D,
    values: &Tensor2D,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    start_pos: usize,
) -> Result<Tensor2D> {
    if n_kv_heads == 0 || n_heads % n_kv_heads != 0 {
        return Err(NodeError::Execution(format!(
            "{} query heads cannot share {} kv heads",
            n_heads, n_kv_heads
        )));
    }
    if q.cols != n_heads * head_dim
        || keys.cols != n_kv_heads * head_dim
        || values.cols != keys.cols
        || keys.rows != values.rows
        || keys.rows != start_pos + q.rows
    {
        return Err(NodeError::Execution(format!(
            "Attention shape mismatch: q {}x{}, k {}x{}, v {}x{}, start {}",
            q.rows, q.cols, keys.rows, keys.cols, values.rows, values.cols, start_pos
        )));
    }

    let group = n_heads / n_kv_heads;
    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut out = Tensor2D::zeros(q.rows, q.cols);
    let mut scores = Vec::with_capacity(keys.rows);

    for i in 0..q.rows {
        let visible = start_pos + i + 1;
        for h in 0..n_heads {
            let kv = h / group;
            let q_off = i * q.cols + h * head_dim;
            let qh = &q.data[q_off..q_off + head_dim];

            scores.clear();
            for t in 0..visible {
                let k_off = t * keys.cols + kv * head_dim;
                let kh = &keys.data[k_off..k_off + head_dim];
                let dot: f32 = qh.iter().zip(kh).map(|(a, b)| a * b).sum();
                scores.push(dot * scale);
            }
            softmax_in_place(&mut scores);

            let o_off = i * out.cols + h * head_dim;
            for (t, &w) in scores.iter().enumerate() {
                let v_off = t * values.cols + kv * head_dim;
                for d in 0..head_dim {
                    out.data[o_off + d] += w * values.data[v_off + d];
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor2d_creation() {
        let t = Tensor2D::new(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
        assert_eq!(t.get(0, 0), 1.0);
        assert_eq!(t.get(1, 1), 4.0);
        assert!(Tensor2D::new(vec![1.0], 2, 2).is_err());
    }

    #[test]
    fn test_linear_uses_out_in_layout() {
        // x [1,3], W [2,3]
        let x = Tensor2D::new(vec![1.0, 2.0, 3.0], 1, 3).unwrap();
        let w = Tensor2D::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], 2, 3).unwrap();
        let y = linear(&x, &w).unwrap();
        assert_eq!((y.rows, y.cols), (1, 2));
        assert_eq!(y.data, vec![1.0, 6.0]);
    }

    #[test]
    fn test_row_split_partials_sum_to_full() {
        let x = Tensor2D::new(vec![0.5, -1.0, 2.0, 4.0], 1, 4).unwrap();
        let w = Tensor2D::new((0..8).map(|i| i as f32).collect(), 2, 4).unwrap();
        let full = linear(&x, &w).unwrap();

        let left_x = Tensor2D::new(vec![0.5, -1.0], 1, 2).unwrap();
        let right_x = Tensor2D::new(vec![2.0, 4.0], 1, 2).unwrap();
        let left_w = Tensor2D::new(vec![0.0, 1.0, 4.0, 5.0], 2, 2).unwrap();
        let right_w = Tensor2D::new(vec![2.0, 3.0, 6.0, 7.0], 2, 2).unwrap();
        let sum = linear(&left_x, &left_w)
            .unwrap()
            .add(&linear(&right_x, &right_w).unwrap())
            .unwrap();
        assert_eq!(sum, full);
    }

    #[test]
    fn test_silu() {
        let t = Tensor2D::new(vec![0.0, 1.0], 1, 2).unwrap();
        let r = silu(&t);
        assert_eq!(r.data[0], 0.0);
        assert!((r.data[1] - 0.731_058_6).abs() < 1e-5);
    }

    #[test]
    fn test_rms_norm() {
        let t = Tensor2D::new(vec![3.0, 4.0], 1, 2).unwrap();
        let r = rms_norm(&t, &[1.0, 2.0], 0.0).unwrap();
        let rms = (12.5f32).sqrt();
        assert!((r.data[0] - 3.0 / rms).abs() < 1e-6);
        assert!((r.data[1] - 8.0 / rms).abs() < 1e-6);
        assert!(rms_norm(&t, &[1.0], 0.0).is_err());
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let mut v = vec![1.0, 2.0, 3.0, 1000.0];
        softmax_in_place(&mut v);
        assert!((v.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(v[3] > 0.99);
    }

    #[test]
    fn test_embed_vocab_slice() {
        // rows for ids 4..6
        let table = Tensor2D::new(vec![1.0, 1.0, 2.0, 2.0], 2, 2).unwrap();
        let out = embed_vocab_slice(&table, 4, &[0, 5, 4]);
        assert_eq!(out.data, vec![0.0, 0.0, 2.0, 2.0, 1.0, 1.0]);
    }

    #[test]
    fn test_rope_position_zero_is_identity() {
        let t = Tensor2D::new(vec![1.0, 2.0, 3.0, 4.0], 1, 4).unwrap();
        let r = apply_rope(&t, &[0], 4, 10_000.0).unwrap();
        assert_eq!(r, t);
        let moved = apply_rope(&t, &[3], 4, 10_000.0).unwrap();
        assert_ne!(moved, t);
        assert!(apply_rope(&t, &[0, 1], 4, 10_000.0).is_err());
    }

    #[test]
    fn test_attention_single_position_returns_value() {
        // one token, 2 query heads sharing one kv head, head_dim 2
        let q = Tensor2D::new(vec![1.0, 0.0, 0.0, 1.0], 1, 4).unwrap();
        let k = Tensor2D::new(vec![0.3, 0.7], 1, 2).unwrap();
        let v = Tensor2D::new(vec![5.0, -5.0], 1, 2).unwrap();
        let out = causal_attention(&q, &k, &v, 2, 1, 2, 0).unwrap();
        assert_eq!(out.data, vec![5.0, -5.0, 5.0, -5.0]);
    }

    #[test]
    fn test_attention_is_causal() {
        let q = Tensor2D::new(vec![1.0, 1.0, 1.0, 1.0], 2, 2).unwrap();
        let k = Tensor2D::new(vec![1.0, 0.0, 0.0, 1.0], 2, 2).unwrap();
        let v = Tensor2D::new(vec![1.0, 1.0, 9.0, 9.0], 2, 2).unwrap();
        let out = causal_attention(&q, &k, &v, 1, 1, 2, 0).unwrap();
        // first position only sees itself
        assert_eq!(out.row(0), &[1.0, 1.0]);
        assert!(out.row(1)[0] > 1.0);
        assert!(causal_attention(&q, &k, &v, 1, 1, 2, 1).is_err());
    }
}
