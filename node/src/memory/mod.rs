//! Bounded residency of layer shards
//!
//! - [`LayerSource`]: blocking loader for one rank's shard files
//! - [`WindowScheduler`]: keeps at most `window_size` shards (embed, layers,
//!   output) resident and prefetches ahead of the execution cursor

pub mod source;
pub mod window;

pub use source::{DiskLayerSource, LayerShard, LayerSource};
pub use window::{
    LayerState, LayerStateKind, LoadFailure, WindowConfig, WindowEvent, WindowScheduler,
    WindowStats,
};
