//! tpi - tensor-parallel inference node
//!
//! ## Commands
//!
//! ### Model preparation (master)
//! - `init-model` - Write a small random model for demos and tests
//! - `split` - Partition a model and write per-rank shard files
//! - `inspect` - Show a rank manifest or the partition summary
//!
//! ### Shard distribution
//! - `serve` - Run the shard file server
//! - `sync` - Fetch this rank's shards from the master once
//!
//! ### Inference
//! - `run` - Full node: split/serve or sync, rendezvous, then generate

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tpi_node::collective::{CollectiveOp, CollectiveTag};
use tpi_node::model::synthetic::{generate_model_with, tiny_architecture};
use tpi_node::model::writer::{split_exists, split_is_current, PARTITION_FILE};
use tpi_node::model::{rank_dir, DType};
use tpi_node::{
    build_partition, format_bytes, init_production_logging, init_simple_logging,
    parse_memory_string, write_shards, Collective, DiskLayerSource, GenerationConfig,
    GenerationOutput, GenerationRequest, GenerationSession, HostMemory, MemoryEstimate, ModelManifest, NodeConfig,
    Partition, RankShardManifest, RendezvousConfig, ShardFileServer, SplitPolicy, SyncClient,
    SyncOptions, TcpConnector, TcpTransport, Transport, WindowConfig,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Bound on rendezvous and on waiting for every rank to finish syncing
const STARTUP_TIMEOUT: Duration = Duration::from_secs(600);

/// Tensor-parallel LLM inference node
#[derive(Parser, Debug)]
#[command(name = "tpi")]
#[command(about = "Tensor-parallel LLM inference with a bounded layer window", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a small random model (manifest.json + weights.bin)
    InitModel {
        /// Output model directory
        #[arg(short, long)]
        out: PathBuf,

        /// Storage dtype (f32, f16, bf16)
        #[arg(long, default_value = "f32", value_parser = parse_dtype)]
        dtype: DType,

        /// RNG seed for the weights
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Override the number of decoder layers
        #[arg(long)]
        num_layers: Option<usize>,

        /// Add q/k/v/o biases
        #[arg(long)]
        attention_bias: bool,
    },

    /// Partition a model and write per-rank shard files
    Split {
        #[command(flatten)]
        node: NodeArgs,
    },

    /// Show a rank manifest, or the partition summary without --rank
    Inspect {
        /// Split directory
        #[arg(short, long)]
        split_dir: PathBuf,

        #[arg(short, long)]
        rank: Option<usize>,
    },

    /// Run the shard file server
    Serve {
        #[command(flatten)]
        node: NodeArgs,

        /// Log level (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },

    /// Fetch this rank's shards from the master once
    Sync {
        #[command(flatten)]
        node: NodeArgs,

        /// Log level
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },

    /// Run a full node and generate from a prompt
    Run {
        #[command(flatten)]
        node: NodeArgs,

        /// Prompt as token ids (rank 0 only), e.g. 1,2,3
        #[arg(long, value_delimiter = ',')]
        prompt_ids: Option<Vec<u32>>,

        /// Write the session statistics as JSON
        #[arg(long)]
        stats_out: Option<PathBuf>,

        /// Log directory (default ~/.tpi/logs)
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Log level
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },
}

/// Node settings shared by several commands; flags override the config file
#[derive(Args, Debug, Default)]
struct NodeArgs {
    /// Config file (default ~/.tpi/node.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    rank: Option<usize>,

    #[arg(long)]
    world_size: Option<usize>,

    #[arg(long)]
    master_addr: Option<String>,

    #[arg(long)]
    master_port: Option<u16>,

    #[arg(long)]
    file_port: Option<u16>,

    #[arg(long)]
    model_dir: Option<PathBuf>,

    #[arg(long)]
    split_dir: Option<PathBuf>,

    /// Layers resident at once (at least 2)
    #[arg(long)]
    window_size: Option<usize>,

    /// Re-download every shard
    #[arg(long)]
    force_download: bool,

    /// Re-split even if shards exist
    #[arg(long)]
    resplit: bool,

    /// Tokens to generate; negative means the model's limit
    #[arg(long, allow_hyphen_values = true)]
    length: Option<i64>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    top_p: Option<f32>,

    #[arg(long)]
    collective_timeout_ms: Option<u64>,

    /// Resident layer ceiling (e.g. "8GiB", "512MB", or bytes)
    #[arg(long)]
    memory_budget: Option<String>,
}

impl NodeArgs {
    /// Config file merged with flags, validated
    fn resolve(&self) -> Result<NodeConfig> {
        let path = self.config.clone().unwrap_or_else(NodeConfig::default_path);
        let mut config = NodeConfig::load_or_default(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        if let Some(v) = self.rank {
            config.rank = v;
        }
        if let Some(v) = self.world_size {
            config.world_size = v;
        }
        if let Some(v) = &self.master_addr {
            config.master_addr = v.clone();
        }
        if let Some(v) = self.master_port {
            config.master_port = v;
        }
        if let Some(v) = self.file_port {
            config.file_port = v;
        }
        if let Some(v) = &self.model_dir {
            config.model_dir = v.clone();
        }
        if let Some(v) = &self.split_dir {
            config.split_dir = Some(v.clone());
        }
        if let Some(v) = self.window_size {
            config.window_size = v;
        }
        config.force_download |= self.force_download;
        config.resplit |= self.resplit;
        if let Some(v) = self.length {
            config.length = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if let Some(v) = self.temperature {
            config.temperature = v;
        }
        if let Some(v) = self.top_k {
            config.top_k = v;
        }
        if let Some(v) = self.top_p {
            config.top_p = v;
        }
        if let Some(v) = self.collective_timeout_ms {
            config.collective_timeout_ms = v;
        }
        if let Some(v) = &self.memory_budget {
            config.memory_budget_bytes = Some(parse_memory_string(v)?);
        }

        config.validate().context("Invalid node configuration")?;
        Ok(config)
    }
}

fn parse_dtype(s: &str) -> std::result::Result<DType, String> {
    match s.to_ascii_lowercase().as_str() {
        "f32" => Ok(DType::F32),
        "f16" => Ok(DType::F16),
        "bf16" => Ok(DType::BF16),
        other => Err(format!("unknown dtype '{}', expected f32, f16 or bf16", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::InitModel {
            out,
            dtype,
            seed,
            num_layers,
            attention_bias,
        } => {
            init_simple_logging("info")?;
            cmd_init_model(&out, dtype, seed, num_layers, attention_bias)?;
        }

        Commands::Split { node } => {
            init_simple_logging("info")?;
            let config = node.resolve()?;
            cmd_split(&config)?;
        }

        Commands::Inspect { split_dir, rank } => {
            // No logging for inspect (pure display)
            cmd_inspect(&split_dir, rank)?;
        }

        Commands::Serve { node, log_level } => {
            init_production_logging(&log_level, None)?;
            let config = node.resolve()?;
            cmd_serve(&config).await?;
        }

        Commands::Sync { node, log_level } => {
            init_simple_logging(&log_level)?;
            let config = node.resolve()?;
            cmd_sync(&config).await?;
        }

        Commands::Run {
            node,
            prompt_ids,
            stats_out,
            log_dir,
            log_level,
        } => {
            init_production_logging(&log_level, log_dir)?;
            let config = node.resolve()?;
            cmd_run(&config, prompt_ids, stats_out).await?;
        }
    }

    Ok(())
}

/// Write a synthetic model
fn cmd_init_model(
    out: &Path,
    dtype: DType,
    seed: u64,
    num_layers: Option<usize>,
    attention_bias: bool,
) -> Result<()> {
    let mut arch = tiny_architecture();
    if let Some(n) = num_layers {
        arch.num_layers = n;
    }

    let manifest = generate_model_with(out, &arch, dtype, seed, attention_bias)
        .with_context(|| format!("Failed to write model to {}", out.display()))?;

    println!("Model written to {}", out.display());
    println!("  Layers:     {}", arch.num_layers);
    println!("  Hidden:     {}", arch.hidden_size);
    println!(
        "  Heads:      {} ({} kv)",
        arch.num_attention_heads, arch.num_key_value_heads
    );
    println!("  Vocab:      {}", arch.vocab_size);
    println!("  Tensors:    {}", manifest.tensors.len());
    println!("  Size:       {}", format_bytes(manifest.total_bytes()));
    Ok(())
}

/// Partition the model and write shards; skipped when the split on disk
/// was cut from the same model for the same world size and `resplit` is off
fn split_model(config: &NodeConfig) -> Result<()> {
    let split_dir = config.split_dir();
    let manifest = ModelManifest::load(&config.model_dir).with_context(|| {
        format!("Failed to load model from {}", config.model_dir.display())
    })?;
    let partition = build_partition(&manifest, config.world_size, &SplitPolicy::llama())
        .context("Failed to partition model")?;
    if !config.resplit && split_is_current(&split_dir, &config.model_dir, &partition) {
        info!(split_dir = %split_dir.display(), "Existing split is current, skipping partition");
        return Ok(());
    }

    let (_, report) = write_shards(
        &config.model_dir,
        &manifest,
        &partition,
        &split_dir,
        config.resplit,
    )
    .context("Failed to write shards")?;

    info!(
        split_dir = %split_dir.display(),
        world_size = config.world_size,
        written = report.written,
        unchanged = report.unchanged,
        bytes = report.bytes_written,
        "Model split"
    );
    Ok(())
}

fn cmd_split(config: &NodeConfig) -> Result<()> {
    split_model(config)?;

    let split_dir = config.split_dir();
    for rank in 0..config.world_size {
        let manifest = RankShardManifest::load(&rank_dir(&split_dir, rank))
            .with_context(|| format!("Failed to read manifest of rank {}", rank))?;
        println!(
            "node_{}: {} files, {}",
            rank,
            manifest.files.len(),
            format_bytes(manifest.total_bytes())
        );
    }
    Ok(())
}

fn cmd_inspect(split_dir: &Path, rank: Option<usize>) -> Result<()> {
    match rank {
        Some(rank) => {
            let dir = rank_dir(split_dir, rank);
            let manifest = RankShardManifest::load(&dir)
                .with_context(|| format!("Failed to read manifest in {}", dir.display()))?;

            println!("\nRank {} of {}", manifest.rank, manifest.world_size);
            println!("=============");
            for entry in &manifest.files {
                println!(
                    "\n  {:<18} {:>10}  {}",
                    entry.file,
                    format_bytes(entry.size),
                    &entry.checksum[..entry.checksum.len().min(16)]
                );
                for spec in &entry.tensors {
                    let axis = spec
                        .axis
                        .map(|a| format!("axis {} [{}..{})", a, spec.start, spec.end))
                        .unwrap_or_else(|| "replicated".to_string());
                    println!("    {:<48} {:?} {}", spec.name, spec.shard_shape, axis);
                }
            }
            println!("\n  Layer max:   {}", format_bytes(manifest.max_layer_bytes()));
            println!("  Edge shards: {}", format_bytes(manifest.edge_bytes()));
        }
        None => {
            let path = split_dir.join(PARTITION_FILE);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let partition: Partition = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;

            let arch = &partition.architecture;
            println!("\nPartition over {} ranks", partition.world_size);
            println!("======================");
            println!(
                "  Model: {} layers, hidden {}, {} heads ({} kv), vocab {}",
                arch.num_layers,
                arch.hidden_size,
                arch.num_attention_heads,
                arch.num_key_value_heads,
                arch.vocab_size
            );
            for rank in &partition.ranks {
                let bytes: usize = rank.specs.iter().map(|s| s.byte_len()).sum();
                println!(
                    "  node_{}: {} tensors, {}",
                    rank.rank,
                    rank.specs.len(),
                    format_bytes(bytes as u64)
                );
            }
        }
    }
    println!();
    Ok(())
}

async fn cmd_serve(config: &NodeConfig) -> Result<()> {
    let split_dir = config.split_dir();
    if !split_exists(&split_dir, config.world_size) {
        bail!(
            "No split for {} ranks in {}; run `tpi split` first",
            config.world_size,
            split_dir.display()
        );
    }

    let listener = ShardFileServer::bind(&format!("0.0.0.0:{}", config.file_port))
        .await
        .context("Failed to bind shard file server")?;
    let server = ShardFileServer::new(split_dir, config.world_size);

    tokio::select! {
        result = server.run(listener) => result.context("Shard file server stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down shard file server"),
    }
    Ok(())
}

async fn sync_shards(config: &NodeConfig) -> Result<()> {
    let connector = TcpConnector::new(config.file_server_addr());
    let options = SyncOptions {
        force_download: config.force_download,
        retries: config.fetch_retries,
        timeout: config.fetch_timeout(),
        ..Default::default()
    };
    let local_dir = rank_dir(&config.split_dir(), config.rank);
    let client = SyncClient::new(connector, config.rank, &local_dir, options);

    let report = client
        .sync()
        .await
        .with_context(|| format!("Failed to sync shards from {}", config.file_server_addr()))?;
    info!(
        rank = config.rank,
        downloaded = report.downloaded,
        skipped = report.skipped,
        removed = report.removed,
        bytes = report.bytes,
        "Shards in sync"
    );
    Ok(())
}

async fn cmd_sync(config: &NodeConfig) -> Result<()> {
    if config.is_master() {
        bail!("Rank 0 reads its shards in place; sync runs on the other ranks");
    }
    sync_shards(config).await
}

/// Warn when a full memory window will not fit in free memory
fn preflight(manifest: &RankShardManifest, config: &NodeConfig) {
    let estimate = MemoryEstimate::from_manifest(manifest, config.window_size);
    let host = HostMemory::detect();
    if estimate.fits(&host) {
        info!(
            peak = %format_bytes(estimate.peak_bytes()),
            available = %format_bytes(host.available_bytes),
            "Memory preflight passed"
        );
    } else {
        warn!(
            peak = %format_bytes(estimate.peak_bytes()),
            available = %format_bytes(host.available_bytes),
            window_size = config.window_size,
            "Memory window may not fit in available memory; consider a smaller window_size"
        );
    }
}

/// Request fields every rank needs, sent from rank 0 as f32 values:
/// 16 session id bytes, max_new_tokens, then the prompt ids
fn encode_request(request: &GenerationRequest) -> Result<Vec<f32>> {
    let mut payload: Vec<f32> = request.session_id.as_bytes().iter().map(|&b| b as f32).collect();
    payload.push(exact_f32(request.config.max_new_tokens as u64, "max_new_tokens")?);
    for &t in &request.prompt_tokens {
        payload.push(exact_f32(t as u64, "prompt token")?);
    }
    Ok(payload)
}

fn decode_request(payload: &[f32]) -> Result<(Uuid, usize, Vec<u32>)> {
    if payload.len() < 17 {
        bail!("Request broadcast too short: {} values", payload.len());
    }
    let id = payload[..16]
        .iter()
        .map(|&v| {
            let b = exact_u32(v, "session id byte")?;
            u8::try_from(b).context("Session id byte out of range")
        })
        .collect::<Result<Vec<u8>>>()?;
    let session_id = Uuid::from_slice(&id).context("Bad session id in request broadcast")?;
    let max_new = exact_u32(payload[16], "max_new_tokens")? as usize;
    let prompt = payload[17..]
        .iter()
        .map(|&v| exact_u32(v, "prompt token"))
        .collect::<Result<Vec<u32>>>()?;
    Ok((session_id, max_new, prompt))
}

/// Integers above 2^24 do not survive a trip through f32
const F32_EXACT_LIMIT: u64 = 1 << 24;

fn exact_f32(value: u64, what: &str) -> Result<f32> {
    if value >= F32_EXACT_LIMIT {
        bail!("{} {} is too large to broadcast exactly", what, value);
    }
    Ok(value as f32)
}

fn exact_u32(value: f32, what: &str) -> Result<u32> {
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value as u64 >= F32_EXACT_LIMIT {
        bail!("Request broadcast carries invalid {}: {}", what, value);
    }
    Ok(value as u32)
}

/// Keep rank 0's file server up after its session, successful or not,
/// until `shutdown` resolves
async fn keep_serving(
    mut server: JoinHandle<tpi_node::Result<()>>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    info!("Shard file server stays up for later sessions; interrupt to stop");
    tokio::select! {
        _ = shutdown => {
            server.abort();
            info!("Shard file server stopped");
            Ok(())
        }
        joined = &mut server => match joined {
            Ok(result) => result.context("Shard file server failed"),
            Err(e) => bail!("Shard file server task ended: {}", e),
        },
    }
}

async fn cmd_run(
    config: &NodeConfig,
    prompt_ids: Option<Vec<u32>>,
    stats_out: Option<PathBuf>,
) -> Result<()> {
    let server = if config.is_master() {
        let prompt = prompt_ids.as_deref().unwrap_or_default();
        if prompt.is_empty() {
            bail!("Rank 0 needs a prompt: --prompt-ids 1,2,3");
        }
        split_model(config)?;
        let listener = ShardFileServer::bind(&format!("0.0.0.0:{}", config.file_port))
            .await
            .context("Failed to bind shard file server")?;
        let server = ShardFileServer::new(config.split_dir(), config.world_size);
        Some(tokio::spawn(server.run(listener)))
    } else {
        None
    };

    let result = match run_session(config, prompt_ids).await {
        Ok(output) => report_output(config, &output, stats_out),
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        error!(rank = config.rank, "Session failed: {:#}", e);
    }

    if let Some(server) = server {
        keep_serving(server, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    }
    result
}

/// Rendezvous, sync, then generate one request on this rank
async fn run_session(
    config: &NodeConfig,
    prompt_ids: Option<Vec<u32>>,
) -> Result<GenerationOutput> {
    let local_dir = rank_dir(&config.split_dir(), config.rank);

    let transport = TcpTransport::connect(RendezvousConfig {
        rank: config.rank,
        world_size: config.world_size,
        master_addr: config.master_addr.clone(),
        master_port: config.master_port,
        timeout: STARTUP_TIMEOUT,
    })
    .await
    .context("Rendezvous with the other ranks failed")?;
    let transport: Arc<dyn Transport> = Arc::new(transport);

    if !config.is_master() {
        sync_shards(config).await?;
    }

    let source = DiskLayerSource::open(&local_dir)
        .with_context(|| format!("Failed to open shards in {}", local_dir.display()))?;
    preflight(source.manifest(), config);
    let arch = source.manifest().architecture.clone();

    // every rank has its shards; rank 0 hands out the request
    let startup = Collective::new(Arc::clone(&transport), STARTUP_TIMEOUT);
    let tag = |op| CollectiveTag::new(0, CollectiveTag::EMBED_LAYER, op, 0);
    startup
        .barrier(tag(CollectiveOp::Barrier))
        .await
        .context("Ranks did not all become ready")?;

    let outgoing = match prompt_ids.filter(|_| config.is_master()) {
        Some(prompt) => {
            let gen_config = GenerationConfig {
                max_new_tokens: arch.adjust_length(config.length),
                ..Default::default()
            };
            Some(encode_request(&GenerationRequest::new(prompt).with_config(gen_config))?)
        }
        None => None,
    };
    let payload = startup
        .broadcast(tag(CollectiveOp::Broadcast), 0, outgoing)
        .await
        .context("Failed to receive the request from rank 0")?;
    let (session_id, max_new_tokens, prompt) = decode_request(&payload)?;

    let request = GenerationRequest::new(prompt)
        .with_session_id(session_id)
        .with_config(GenerationConfig {
            max_new_tokens,
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            seed: config.seed,
        });

    let collective = Collective::new(transport, config.collective_timeout());
    let window = WindowConfig {
        window_size: config.window_size,
        memory_budget: config.memory_budget_bytes,
        trace: false,
    };
    let mut session = GenerationSession::new(arch, Arc::new(source), collective, window)
        .context("Failed to start generation session")?;

    let cancel = session.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current layer");
            cancel.cancel();
        }
    });

    let result = session.generate(&request).await;
    interrupt.abort();
    result.context("Generation failed")
}

/// Print rank 0's token ids and save the statistics
fn report_output(
    config: &NodeConfig,
    output: &GenerationOutput,
    stats_out: Option<PathBuf>,
) -> Result<()> {
    if config.is_master() {
        let ids: Vec<String> = output.tokens.iter().map(|t| t.to_string()).collect();
        println!("{}", ids.join(" "));
    }
    info!(
        session_id = %output.session_id,
        tokens = output.completion_tokens(),
        stop_reason = ?output.stop_reason,
        "Done"
    );

    if let Some(path) = stats_out {
        output
            .stats
            .save_to_file(&path)
            .with_context(|| format!("Failed to write stats to {}", path.display()))?;
    }
    Ok(())
}
