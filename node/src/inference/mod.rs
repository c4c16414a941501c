//! Tensor-parallel inference on one rank
//!
//! Each rank holds a slice of every layer, computes partial results for its
//! slice and combines them with its peers through collectives:
//!
//! - [`GenerationSession`]: drives the token loop and the layer loop
//! - [`forward_pass`]: per-layer math on local weight slices
//! - [`KVCache`]: keys/values for the local attention heads
//! - [`Sampler`]: next-token choice on rank 0
//! - [`SessionStats`]: counters reported with every result

pub mod forward_pass;
pub mod job;
pub mod kv_cache;
pub mod sampler;
pub mod session;
pub mod stats;
pub mod tensor_ops;

pub use job::{GenerationConfig, GenerationOutput, GenerationRequest, StopReason};
pub use kv_cache::{KVCache, LayerKVCache};
pub use sampler::{Sampler, TopKTopPSampler};
pub use session::{CancelHandle, GenerationSession, PassOutcome};
pub use stats::{SessionStats, SessionSummary};
pub use tensor_ops::Tensor2D;
