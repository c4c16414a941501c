//! Model weights: description, partitioning and per-rank shard files
//!
//! ```text
//! manifest.json + weights.bin
//!        │  build_partition(world_size, SplitPolicy)
//!        ▼
//! Partition ── write_shards ──▶ split/node_{r}/{embed,layer_NNN,output}.shard
//!                                split/node_{r}/manifest.json (checksums)
//! ```

pub mod manifest;
pub mod partition;
pub mod shard_file;
pub mod split_policy;
pub mod synthetic;
pub mod writer;

pub use manifest::{DType, ModelArchitecture, ModelManifest, TensorInfo};
pub use partition::{build_partition, Partition, RankPartition, ShardSpec};
pub use shard_file::{ShardFile, ShardTensor};
pub use split_policy::{ShardGroup, SplitPolicy, TensorRole};
pub use writer::{rank_dir, write_shards, RankShardManifest, ShardFileEntry};
