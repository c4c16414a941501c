//! Generation request and result types

use super::stats::SessionSummary;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configuration for token generation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    /// Tokens to generate after the prompt (already clamped to the model)
    pub max_new_tokens: usize,

    /// Sampling temperature (0.0 = greedy)
    pub temperature: f32,

    /// Keep only the k most likely tokens (0 = disabled)
    pub top_k: usize,

    /// Top-p (nucleus) sampling threshold
    pub top_p: f32,

    /// Seed for the master's sampler
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 32,
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            seed: 0,
        }
    }
}

/// A generation request; every rank runs the same one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub session_id: Uuid,

    /// Input prompt tokens (already tokenized)
    pub prompt_tokens: Vec<u32>,

    pub config: GenerationConfig,
}

impl GenerationRequest {
    pub fn new(prompt_tokens: Vec<u32>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            prompt_tokens,
            config: GenerationConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    /// Ranks must agree on the session id so collective logs line up
    pub fn with_session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The model produced its end-of-sequence token
    Eos,
    /// `max_new_tokens` reached
    Length,
    /// A rank requested cancellation
    Cancelled,
}

/// Result of a generation session, identical on every rank
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub session_id: Uuid,

    /// Generated tokens, excluding the prompt
    pub tokens: Vec<u32>,

    pub stop_reason: StopReason,

    pub stats: SessionSummary,
}

impl GenerationOutput {
    pub fn completion_tokens(&self) -> usize {
        self.tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_config_default_is_greedy() {
        let config = GenerationConfig::default();
        assert_eq!(config.temperature, 0.0);
        assert_eq!(config.top_k, 0);
        assert_eq!(config.top_p, 1.0);
    }

    #[test]
    fn test_request_builders() {
        let id = Uuid::new_v4();
        let request = GenerationRequest::new(vec![1, 2, 3])
            .with_config(GenerationConfig {
                max_new_tokens: 5,
                ..Default::default()
            })
            .with_session_id(id);

        assert_eq!(request.session_id, id);
        assert_eq!(request.prompt_tokens.len(), 3);
        assert_eq!(request.config.max_new_tokens, 5);
    }

    #[test]
    fn test_stop_reason_serializes() {
        let json = serde_json::to_string(&StopReason::Eos).unwrap();
        assert_eq!(json, "\"Eos\"");
    }
}
