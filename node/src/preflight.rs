//! Host memory check before a rank starts loading shards

use crate::errors::{NodeError, Result};
use crate::model::{RankShardManifest, ShardFileEntry};
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Memory of the host, detected with `sysinfo`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMemory {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl HostMemory {
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        Self {
            total_bytes: sys.total_memory(),
            available_bytes: sys.available_memory(),
        }
    }
}

/// Expected peak shard memory of one rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEstimate {
    pub window_size: usize,
    /// Largest shard of any group; embed and output are window entries too
    pub max_shard_bytes: u64,
}

impl MemoryEstimate {
    /// Sizes after decoding to f32, which is what the window holds
    pub fn from_manifest(manifest: &RankShardManifest, window_size: usize) -> Self {
        let decoded = |entry: &ShardFileEntry| -> u64 {
            entry
                .tensors
                .iter()
                .map(|t| t.shard_shape.iter().product::<usize>() as u64 * 4)
                .sum()
        };
        Self {
            window_size,
            max_shard_bytes: manifest.files.iter().map(decoded).max().unwrap_or(0),
        }
    }

    /// window_size x largest shard
    pub fn peak_bytes(&self) -> u64 {
        (self.window_size as u64).saturating_mul(self.max_shard_bytes)
    }

    pub fn fits(&self, host: &HostMemory) -> bool {
        self.peak_bytes() <= host.available_bytes
    }
}

/// Parse a memory size like "7GB", "512MiB" or raw bytes.
///
/// GB/MB/KB are decimal; GiB/MiB/KiB are binary.
pub fn parse_memory_string(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    const UNITS: [(&str, f64); 6] = [
        ("GIB", 1_073_741_824.0),
        ("MIB", 1_048_576.0),
        ("KIB", 1_024.0),
        ("GB", 1_000_000_000.0),
        ("MB", 1_000_000.0),
        ("KB", 1_000.0),
    ];

    for (suffix, scale) in UNITS {
        if let Some(number) = s.strip_suffix(suffix) {
            let value: f64 = number
                .trim()
                .parse()
                .map_err(|_| NodeError::Config(format!("Invalid memory format: {}", s)))?;
            if value < 0.0 {
                return Err(NodeError::Config(format!("Invalid memory format: {}", s)));
            }
            return Ok((value * scale) as u64);
        }
    }

    s.parse::<u64>().map_err(|_| {
        NodeError::Config(format!(
            "Invalid memory format: {}. Use format like '7GB', '7GiB', '512MB', or bytes",
            s
        ))
    })
}

/// Format bytes as human-readable string (SI units)
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_000_000_000 {
        format!("{:.1} GB", bytes as f64 / 1_000_000_000.0)
    } else if bytes >= 1_000_000 {
        format!("{:.1} MB", bytes as f64 / 1_000_000.0)
    } else if bytes >= 1_000 {
        format!("{:.1} KB", bytes as f64 / 1_000.0)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_bytes() {
        let estimate = MemoryEstimate {
            window_size: 3,
            max_shard_bytes: 100,
        };
        assert_eq!(estimate.peak_bytes(), 300);
        assert!(estimate.fits(&HostMemory {
            total_bytes: 1000,
            available_bytes: 300
        }));
        assert!(!estimate.fits(&HostMemory {
            total_bytes: 1000,
            available_bytes: 299
        }));
    }

    #[test]
    fn test_detect_reports_memory() {
        let host = HostMemory::detect();
        assert!(host.total_bytes > 0);
        assert!(host.available_bytes <= host.total_bytes);
    }

    #[test]
    fn test_parse_memory_string() {
        assert_eq!(parse_memory_string("7GB").unwrap(), 7_000_000_000);
        assert_eq!(parse_memory_string("7.5 gb").unwrap(), 7_500_000_000);
        assert_eq!(parse_memory_string("1GiB").unwrap(), 1_073_741_824);
        assert_eq!(parse_memory_string("512MiB").unwrap(), 536_870_912);
        assert_eq!(parse_memory_string("1024KB").unwrap(), 1_024_000);
        assert_eq!(parse_memory_string("1000000").unwrap(), 1_000_000);
    }

    #[test]
    fn test_parse_memory_string_invalid() {
        assert!(parse_memory_string("invalid").is_err());
        assert!(parse_memory_string("7XB").is_err());
        assert!(parse_memory_string("-1GB").is_err());
        assert!(parse_memory_string("").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(7_000_000_000), "7.0 GB");
        assert_eq!(format_bytes(512_000_000), "512.0 MB");
        assert_eq!(format_bytes(1_000), "1.0 KB");
        assert_eq!(format_bytes(500), "500 bytes");
    }
}
