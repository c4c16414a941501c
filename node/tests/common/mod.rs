//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tpi_node::collective::{Collective, MemoryTransport, Transport};
use tpi_node::inference::{GenerationConfig, GenerationOutput, GenerationRequest, GenerationSession};
use tpi_node::memory::{DiskLayerSource, WindowConfig};
use tpi_node::model::synthetic::{generate_model_with, tiny_architecture};
use tpi_node::model::{build_partition, rank_dir, write_shards, DType, ModelArchitecture, SplitPolicy};
use tpi_node::Result;

pub const SEED: u64 = 11;

/// Write a synthetic model under `root/model` and split it into `root/split`
pub fn split_model(root: &Path, arch: &ModelArchitecture, world_size: usize) -> PathBuf {
    let model_dir = root.join("model");
    let split_dir = root.join("split");
    let manifest = generate_model_with(&model_dir, arch, DType::F32, SEED, true).unwrap();
    let partition = build_partition(&manifest, world_size, &SplitPolicy::llama()).unwrap();
    write_shards(&model_dir, &manifest, &partition, &split_dir, false).unwrap();
    split_dir
}

pub fn tiny_split(root: &Path, world_size: usize) -> PathBuf {
    split_model(root, &tiny_architecture(), world_size)
}

/// One session per rank over an in-process mesh
pub fn sessions(
    split_dir: &Path,
    world_size: usize,
    window_size: usize,
    timeout: Duration,
) -> Vec<GenerationSession> {
    MemoryTransport::mesh(world_size)
        .into_iter()
        .enumerate()
        .map(|(rank, transport)| {
            let source = DiskLayerSource::open(&rank_dir(split_dir, rank)).unwrap();
            let arch = source.manifest().architecture.clone();
            let transport: Arc<dyn Transport> = Arc::new(transport);
            let window = WindowConfig {
                window_size,
                trace: true,
                ..Default::default()
            };
            GenerationSession::new(arch, Arc::new(source), Collective::new(transport, timeout), window)
                .unwrap()
        })
        .collect()
}

pub fn greedy_request(prompt: Vec<u32>, max_new_tokens: usize) -> GenerationRequest {
    GenerationRequest::new(prompt).with_config(GenerationConfig {
        max_new_tokens,
        ..Default::default()
    })
}

/// Run the same request on every rank concurrently; sessions are handed
/// back so tests can inspect window and cache state afterwards
pub async fn generate_all(
    sessions: Vec<GenerationSession>,
    request: &GenerationRequest,
) -> Vec<(GenerationSession, Result<GenerationOutput>)> {
    let handles: Vec<_> = sessions
        .into_iter()
        .map(|mut session| {
            let request = request.clone();
            tokio::spawn(async move {
                let result = session.generate(&request).await;
                (session, result)
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}
