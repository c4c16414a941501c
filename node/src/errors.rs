use thiserror::Error;

/// Errors that can occur on an inference node.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Model manifest and world size are incompatible (pre-flight, fatal)
    #[error("Partition config error: {0}")]
    PartitionConfig(String),

    /// Network or transport failure while fetching shards from the master
    #[error("Shard fetch error: {0}")]
    ShardFetch(String),

    /// Shard bytes do not hash to the checksum in the rank manifest
    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// Local shard file missing or corrupt at read time
    #[error("Shard load error: {0}")]
    ShardLoad(String),

    /// A peer rank did not arrive at a collective in time
    #[error("Collective timeout in {context} after {waited_ms} ms")]
    CollectiveTimeout { context: String, waited_ms: u64 },

    /// Resident shards would exceed the configured memory budget
    #[error(
        "Out of memory: resident shards need {requested} bytes, budget is {budget} bytes \
         (reduce window_size, currently {window_size})"
    )]
    OutOfMemory {
        requested: u64,
        budget: u64,
        window_size: usize,
    },

    /// IO error occurred (file operations, sockets, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error (connection failed, protocol error, etc.)
    #[error("Network error: {0}")]
    Network(String),

    /// Numeric or shape error during the forward pass
    #[error("Execution error: {0}")]
    Execution(String),

    /// Failure inside a generation session, tagged with where it happened
    #[error("Rank {rank} failed at token {token}, {}: {source}", describe_layer(.layer))]
    Session {
        rank: usize,
        token: usize,
        layer: Option<usize>,
        #[source]
        source: Box<NodeError>,
    },
}

fn describe_layer(layer: &Option<usize>) -> String {
    match layer {
        Some(l) => format!("layer {}", l),
        None => "outside layer loop".to_string(),
    }
}

impl NodeError {
    /// Transient failures the sync client may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::ShardFetch(_) | NodeError::ChecksumMismatch { .. } | NodeError::Io(_)
        )
    }

    /// Strip any `Session` wrapping.
    pub fn root(&self) -> &NodeError {
        match self {
            NodeError::Session { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

impl From<toml::ser::Error> for NodeError {
    fn from(e: toml::ser::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for NodeError {
    fn from(e: toml::de::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}
