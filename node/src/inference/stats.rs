//! Generation session statistics

use crate::memory::WindowStats;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Live counters for one generation session
#[derive(Debug)]
pub struct SessionStats {
    pub prompt_tokens: AtomicU64,
    pub generated_tokens: AtomicU64,
    pub allreduce_operations: AtomicU64,
    pub total_allreduce_time_us: AtomicU64,
    pub layers_processed: AtomicU64,
    pub first_token_ms: AtomicU64,
    pub start_time: Instant,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            prompt_tokens: AtomicU64::new(0),
            generated_tokens: AtomicU64::new(0),
            allreduce_operations: AtomicU64::new(0),
            total_allreduce_time_us: AtomicU64::new(0),
            layers_processed: AtomicU64::new(0),
            first_token_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_prompt(&self, tokens: usize) {
        self.prompt_tokens.store(tokens as u64, Ordering::Relaxed);
    }

    /// Record a generated token; the first one also fixes time-to-first-token
    pub fn record_token(&self) {
        if self.generated_tokens.fetch_add(1, Ordering::Relaxed) == 0 {
            self.first_token_ms
                .store(self.start_time.elapsed().as_millis() as u64, Ordering::Relaxed);
        }
    }

    pub fn record_allreduce(&self, duration_us: u64) {
        self.allreduce_operations.fetch_add(1, Ordering::Relaxed);
        self.total_allreduce_time_us
            .fetch_add(duration_us, Ordering::Relaxed);
    }

    pub fn record_layer(&self) {
        self.layers_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Average all-reduce latency in milliseconds
    pub fn avg_allreduce_latency_ms(&self) -> f64 {
        let ops = self.allreduce_operations.load(Ordering::Relaxed);
        if ops == 0 {
            return 0.0;
        }
        self.total_allreduce_time_us.load(Ordering::Relaxed) as f64 / ops as f64 / 1000.0
    }

    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.start_time.elapsed().as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.generated_tokens.load(Ordering::Relaxed) as f64 / secs
    }

    /// Freeze the counters, folding in the memory window's
    pub fn summary(&self, window: &WindowStats) -> SessionSummary {
        SessionSummary {
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            generated_tokens: self.generated_tokens.load(Ordering::Relaxed),
            elapsed_ms: self.start_time.elapsed().as_millis() as u64,
            time_to_first_token_ms: self.first_token_ms.load(Ordering::Relaxed),
            allreduce_operations: self.allreduce_operations.load(Ordering::Relaxed),
            avg_allreduce_latency_ms: self.avg_allreduce_latency_ms(),
            layers_processed: self.layers_processed.load(Ordering::Relaxed),
            shard_loads: window.loads(),
            window_stalls: window.stalls.load(Ordering::Relaxed),
            window_hits: window.hits.load(Ordering::Relaxed),
            evictions: window.evictions.load(Ordering::Relaxed),
            peak_resident_shards: window.peak_resident_shards(),
            peak_resident_bytes: window.peak_resident_bytes(),
            max_shard_bytes: window.max_shard_bytes(),
        }
    }
}

/// Snapshot of a finished session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub prompt_tokens: u64,
    pub generated_tokens: u64,
    pub elapsed_ms: u64,
    pub time_to_first_token_ms: u64,
    pub allreduce_operations: u64,
    pub avg_allreduce_latency_ms: f64,
    pub layers_processed: u64,
    pub shard_loads: u64,
    pub window_stalls: u64,
    pub window_hits: u64,
    pub evictions: u64,
    pub peak_resident_shards: u64,
    pub peak_resident_bytes: u64,
    pub max_shard_bytes: u64,
}

impl SessionSummary {
    pub fn tokens_per_second(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return 0.0;
        }
        self.generated_tokens as f64 / (self.elapsed_ms as f64 / 1000.0)
    }

    pub fn print_summary(&self) {
        info!(
            prompt_tokens = self.prompt_tokens,
            generated_tokens = self.generated_tokens,
            ttft_ms = self.time_to_first_token_ms,
            tokens_per_second = format!("{:.2}", self.tokens_per_second()),
            allreduce_ops = self.allreduce_operations,
            avg_allreduce_latency_ms = format!("{:.3}", self.avg_allreduce_latency_ms),
            shard_loads = self.shard_loads,
            window_stalls = self.window_stalls,
            peak_resident_shards = self.peak_resident_shards,
            peak_resident_bytes = self.peak_resident_bytes,
            "Session statistics"
        );
    }

    /// Write the summary as JSON
    pub fn save_to_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }
}
