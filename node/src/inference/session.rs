//! Tensor-parallel generation session
//!
//! One [`GenerationSession`] runs per rank. All ranks execute the same
//! sequence of collectives for the same request, which keeps them in
//! lockstep without a separate barrier:
//!
//! ```text
//! per token:
//!   window.advance(embed) ─ vocab slice ─ all-reduce
//!   for layer in 0..L:
//!       window.advance(layer)
//!       attention partial ─ all-reduce ─ residual
//!       mlp partial + cancel vote ─ all-reduce ─ residual
//!   window.advance(output) ─ final norm ─ lm_head slice ─ gather to rank 0
//!   sample ─ broadcast
//! ```
//!
//! Embed and output shards pass through the memory window like layers, so
//! the window bounds every resident shard.
//!
//! Every failure inside the loop is reported as [`NodeError::Session`]
//! naming the rank, token and layer. The memory window and KV cache are
//! released on every exit path.

use super::forward_pass::{
    attention_partial, local_kv_dim, mlp_partial, LayerNames, VocabSlice,
};
use super::job::{GenerationOutput, GenerationRequest, StopReason};
use super::kv_cache::KVCache;
use super::sampler::{Sampler, TopKTopPSampler};
use super::stats::SessionStats;
use super::tensor_ops::Tensor2D;
use crate::collective::{Collective, CollectiveOp, CollectiveTag};
use crate::errors::{NodeError, Result};
use crate::memory::{LayerSource, WindowConfig, WindowScheduler};
use crate::model::{ModelArchitecture, ShardGroup};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument};

/// Shared flag that asks a running session to stop.
///
/// Any rank may set it; the decision is taken collectively at the next MLP
/// all-reduce so all ranks stop after the same layer.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Result of one forward pass over all layers
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// Full-vocabulary logits for the last position on rank 0, `None` elsewhere
    Logits(Option<Vec<f32>>),
    /// Ranks agreed to stop; the pass ended early
    Cancelled,
}

fn in_session(rank: usize, token: usize, layer: Option<usize>) -> impl Fn(NodeError) -> NodeError {
    move |e| match e {
        NodeError::Session { .. } => e,
        other => NodeError::Session {
            rank,
            token,
            layer,
            source: Box::new(other),
        },
    }
}

/// Per-rank driver of the generation loop
pub struct GenerationSession {
    arch: ModelArchitecture,
    window: WindowScheduler,
    collective: Collective,
    cache: KVCache,
    vocab: VocabSlice,
    names: Vec<LayerNames>,
    cancel: CancelHandle,
}

impl GenerationSession {
    pub fn new(
        arch: ModelArchitecture,
        source: Arc<dyn LayerSource>,
        collective: Collective,
        window: WindowConfig,
    ) -> Result<Self> {
        arch.validate()?;
        if source.num_layers() != arch.num_layers {
            return Err(NodeError::Config(format!(
                "shard source has {} layers, architecture declares {}",
                source.num_layers(),
                arch.num_layers
            )));
        }
        let rank = collective.rank();
        let world = collective.world_size();
        let window = WindowScheduler::new(source, window)?;
        let cache = KVCache::new(arch.num_layers, local_kv_dim(&arch, rank, world));
        let names = (0..arch.num_layers).map(LayerNames::new).collect();
        let vocab = VocabSlice::new(&arch, rank, world);

        Ok(Self {
            arch,
            window,
            collective,
            cache,
            vocab,
            names,
            cancel: CancelHandle::new(),
        })
    }

    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    pub fn architecture(&self) -> &ModelArchitecture {
        &self.arch
    }

    /// Handle that cancels this session from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn window(&self) -> &WindowScheduler {
        &self.window
    }

    pub fn kv_cache(&self) -> &KVCache {
        &self.cache
    }

    /// Run one request to completion on this rank
    #[instrument(skip(self, request), fields(session_id = %request.session_id, rank = self.rank()))]
    pub async fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationOutput> {
        let rank = self.rank();
        info!(
            session_id = %request.session_id,
            rank,
            world_size = self.collective.world_size(),
            prompt_tokens = request.prompt_tokens.len(),
            max_new_tokens = request.config.max_new_tokens,
            window_size = self.window.window_size(),
            "Generation started"
        );

        let stats = SessionStats::new();
        let result = self.run(request, &stats).await;
        let summary = stats.summary(self.window.stats());
        self.window.stats().log_summary();
        self.reset().await;

        match result {
            Ok((tokens, stop_reason)) => {
                info!(
                    session_id = %request.session_id,
                    rank,
                    generated = tokens.len(),
                    stop_reason = ?stop_reason,
                    "Generation finished"
                );
                summary.print_summary();
                Ok(GenerationOutput {
                    session_id: request.session_id,
                    tokens,
                    stop_reason,
                    stats: summary,
                })
            }
            Err(e) => {
                error!(session_id = %request.session_id, rank, error = %e, "Generation failed");
                Err(e)
            }
        }
    }

    /// Free resident shards and the KV cache
    pub async fn reset(&mut self) {
        self.window.release_all().await;
        self.cache.clear();
        self.cancel.reset();
    }

    async fn run(
        &mut self,
        request: &GenerationRequest,
        stats: &SessionStats,
    ) -> Result<(Vec<u32>, StopReason)> {
        let rank = self.rank();
        let prompt = &request.prompt_tokens;
        let max_new = self
            .check_prompt(prompt, request.config.max_new_tokens)
            .map_err(in_session(rank, 0, None))?;
        stats.record_prompt(prompt.len());

        let mut sampler = (rank == 0).then(|| TopKTopPSampler::from_config(&request.config));
        let mut generated = Vec::with_capacity(max_new);
        let mut input = prompt.clone();

        for step in 0..max_new {
            let logits = match self.forward(&input, step, stats).await? {
                PassOutcome::Logits(logits) => logits,
                PassOutcome::Cancelled => {
                    info!(rank, token = step, "Generation cancelled");
                    return Ok((generated, StopReason::Cancelled));
                }
            };

            let token = self
                .next_token(step, sampler.as_mut(), logits)
                .await
                .map_err(in_session(rank, step, None))?;
            stats.record_token();
            generated.push(token);
            debug!(rank, step, token, "Token selected");

            if self.arch.eos_token_id == Some(token) {
                return Ok((generated, StopReason::Eos));
            }
            input = vec![token];
        }
        Ok((generated, StopReason::Length))
    }

    /// Clamp the generation length so positions stay within the model
    fn check_prompt(&self, prompt: &[u32], max_new: usize) -> Result<usize> {
        if prompt.is_empty() {
            return Err(NodeError::Execution("prompt is empty".to_string()));
        }
        if let Some(bad) = prompt.iter().find(|&&t| t as usize >= self.arch.vocab_size) {
            return Err(NodeError::Execution(format!(
                "prompt token {} outside vocabulary of {}",
                bad, self.arch.vocab_size
            )));
        }
        let limit = self.arch.max_position_embeddings;
        if limit == 0 {
            return Ok(max_new);
        }
        if prompt.len() >= limit {
            return Err(NodeError::Execution(format!(
                "prompt of {} tokens leaves no room within {} positions",
                prompt.len(),
                limit
            )));
        }
        Ok(max_new.min(limit - prompt.len()))
    }

    /// Rank 0 samples, everyone receives the same token
    async fn next_token(
        &self,
        step: usize,
        sampler: Option<&mut TopKTopPSampler>,
        logits: Option<Vec<f32>>,
    ) -> Result<u32> {
        let chosen = match (sampler, logits) {
            (Some(sampler), Some(logits)) => Some(vec![sampler.sample(&logits)? as f32]),
            _ => None,
        };
        let tag = CollectiveTag::new(step, CollectiveTag::OUTPUT_LAYER, CollectiveOp::Broadcast, 0);
        let token = self.collective.broadcast(tag, 0, chosen).await?;
        match token.as_slice() {
            [t] if *t >= 0.0 && (*t as usize) < self.arch.vocab_size => Ok(*t as u32),
            other => Err(NodeError::Network(format!(
                "broadcast token is not a vocabulary id: {:?}",
                other
            ))),
        }
    }

    async fn all_reduce(
        &self,
        stats: &SessionStats,
        tag: CollectiveTag,
        data: Vec<f32>,
    ) -> Result<Vec<f32>> {
        let started = Instant::now();
        let out = self.collective.all_reduce_sum(tag, data).await?;
        stats.record_allreduce(started.elapsed().as_micros() as u64);
        Ok(out)
    }

    /// Forward `tokens` (the prompt, or the last sampled token) through
    /// every layer, appending to the KV cache
    pub async fn forward(
        &mut self,
        tokens: &[u32],
        step: usize,
        stats: &SessionStats,
    ) -> Result<PassOutcome> {
        let rank = self.rank();
        let mut hidden = self
            .embed(tokens, step, stats)
            .await
            .map_err(in_session(rank, step, None))?;

        for layer in 0..self.arch.num_layers {
            let cancelled = self
                .layer_pass(layer, step, &mut hidden, stats)
                .await
                .map_err(in_session(rank, step, Some(layer)))?;
            stats.record_layer();
            if cancelled {
                return Ok(PassOutcome::Cancelled);
            }
        }

        self.output(step, &hidden)
            .await
            .map(PassOutcome::Logits)
            .map_err(in_session(rank, step, None))
    }

    async fn embed(&self, tokens: &[u32], step: usize, stats: &SessionStats) -> Result<Tensor2D> {
        let shard = self.window.advance(ShardGroup::Embed).await?;
        let partial = self.vocab.embed_partial(&shard, &self.arch, tokens)?;
        drop(shard);
        let tag = CollectiveTag::new(step, CollectiveTag::EMBED_LAYER, CollectiveOp::AllReduce, 0);
        let summed = self.all_reduce(stats, tag, partial.data).await?;
        Tensor2D::new(summed, tokens.len(), self.arch.hidden_size)
    }

    /// One decoder layer; returns whether the ranks voted to cancel
    async fn layer_pass(
        &mut self,
        layer: usize,
        step: usize,
        hidden: &mut Tensor2D,
        stats: &SessionStats,
    ) -> Result<bool> {
        let lead = self.rank() == 0;
        let shard = self.window.advance(ShardGroup::Layer(layer)).await?;
        let names = &self.names[layer];

        let attn = {
            let cache = self.cache.layer_mut(layer)?;
            attention_partial(&shard, &self.arch, names, hidden, cache, lead)?
        };
        let tag = CollectiveTag::new(step, layer as u32, CollectiveOp::AllReduce, 0);
        let attn = self.all_reduce(stats, tag, attn.data).await?;
        *hidden = hidden.add(&Tensor2D::new(attn, hidden.rows, hidden.cols)?)?;

        let mlp = mlp_partial(&shard, &self.arch, names, hidden, lead)?;
        let mut buf = mlp.data;
        buf.push(if self.cancel.is_cancelled() { 1.0 } else { 0.0 });
        let tag = CollectiveTag::new(step, layer as u32, CollectiveOp::AllReduce, 1);
        let mut reduced = self.all_reduce(stats, tag, buf).await?;
        let votes = reduced.pop().unwrap_or(0.0);
        *hidden = hidden.add(&Tensor2D::new(reduced, hidden.rows, hidden.cols)?)?;

        Ok(votes > 0.5)
    }

    async fn output(&self, step: usize, hidden: &Tensor2D) -> Result<Option<Vec<f32>>> {
        let shard = self.window.advance(ShardGroup::Output).await?;
        let partial = self.vocab.logits_partial(&shard, &self.arch, hidden)?;
        drop(shard);
        let tag = CollectiveTag::new(step, CollectiveTag::OUTPUT_LAYER, CollectiveOp::Gather, 0);
        let gathered = self.collective.gather(tag, 0, partial).await?;
        Ok(gathered.map(|parts| parts.concat()))
    }
}
