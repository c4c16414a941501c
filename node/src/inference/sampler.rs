//! Next-token selection on the master rank

use super::job::GenerationConfig;
use super::tensor_ops::softmax_in_place;
use crate::errors::{NodeError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Picks the next token from full-vocabulary logits
pub trait Sampler: Send {
    fn sample(&mut self, logits: &[f32]) -> Result<u32>;
}

/// Temperature, top-k and top-p sampling with a seeded generator.
/// Temperature 0 is greedy argmax.
pub struct TopKTopPSampler {
    temperature: f32,
    top_k: usize,
    top_p: f32,
    rng: StdRng,
}

impl TopKTopPSampler {
    pub fn new(temperature: f32, top_k: usize, top_p: f32, seed: u64) -> Self {
        Self {
            temperature,
            top_k,
            top_p,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_config(config: &GenerationConfig) -> Self {
        Self::new(config.temperature, config.top_k, config.top_p, config.seed)
    }
}

/// Index of the largest logit; ties go to the lowest id
pub fn argmax(logits: &[f32]) -> Result<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in logits.iter().enumerate() {
        if v.is_nan() {
            return Err(NodeError::Execution(format!("logit {} is NaN", i)));
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i as u32)
        .ok_or_else(|| NodeError::Execution("cannot sample from empty logits".to_string()))
}

impl Sampler for TopKTopPSampler {
    fn sample(&mut self, logits: &[f32]) -> Result<u32> {
        if self.temperature <= 0.0 {
            return argmax(logits);
        }
        // rejects NaN and empty input
        argmax(logits)?;

        let mut candidates: Vec<(u32, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &v)| (i as u32, v / self.temperature))
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        if self.top_k > 0 && self.top_k < candidates.len() {
            candidates.truncate(self.top_k);
        }

        let mut probs: Vec<f32> = candidates.iter().map(|c| c.1).collect();
        softmax_in_place(&mut probs);

        if self.top_p < 1.0 {
            let mut cumulative = 0.0;
            let mut keep = probs.len();
            for (i, p) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative >= self.top_p {
                    keep = i + 1;
                    break;
                }
            }
            probs.truncate(keep);
            candidates.truncate(keep);
        }

        let total: f32 = probs.iter().sum();
        let mut draw = self.rng.gen::<f32>() * total;
        for (candidate, p) in candidates.iter().zip(&probs) {
            if draw < *p {
                return Ok(candidate.0);
            }
            draw -= p;
        }
        // rounding left the draw past the last bucket
        Ok(candidates[candidates.len() - 1].0)
    }
}
