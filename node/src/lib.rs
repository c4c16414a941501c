//! Tensor-parallel LLM inference node
//!
//! A model is partitioned once on the master into per-rank shard files.
//! Every rank syncs its shards from the master, then all ranks run the
//! decoder together: each holds a slice of every layer and combines its
//! partial results with peers through collectives, while a bounded window
//! keeps only a few layers resident at a time.

pub mod collective;
pub mod config;
pub mod errors;
pub mod inference;
pub mod memory;
pub mod model;
pub mod observability;
pub mod preflight;
pub mod sync;

pub use collective::{Collective, MemoryTransport, RendezvousConfig, TcpTransport, Transport};
pub use config::{node_home, NodeConfig};
pub use errors::{NodeError, Result};
pub use inference::{
    CancelHandle, GenerationConfig, GenerationOutput, GenerationRequest, GenerationSession,
    SessionSummary, StopReason,
};
pub use memory::{DiskLayerSource, LayerSource, WindowConfig, WindowScheduler, WindowStats};
pub use model::{
    build_partition, write_shards, ModelArchitecture, ModelManifest, Partition,
    RankShardManifest, SplitPolicy,
};
pub use observability::{init_production_logging, init_simple_logging};
pub use preflight::{format_bytes, parse_memory_string, HostMemory, MemoryEstimate};
pub use sync::{ShardFileServer, SyncClient, SyncOptions, SyncReport, TcpConnector};
