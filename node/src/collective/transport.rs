//! Point-to-point links between ranks
//!
//! A [`Transport`] moves tagged `f32` frames between ranks of one session.
//! Sends never block on the receiver: every inbound link is drained into an
//! unbounded queue, so ring steps where all ranks send before receiving
//! cannot deadlock.

use crate::errors::{NodeError, Result};
use crate::sync::protocol::{read_cbor_message, write_cbor_message};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Kind of collective a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectiveOp {
    AllReduce,
    AllGather,
    Gather,
    Broadcast,
    Barrier,
}

/// Identifies one collective call within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectiveTag {
    pub token: u32,
    pub layer: u32,
    pub op: CollectiveOp,
    /// Distinguishes collectives of the same op at the same (token, layer)
    pub seq: u32,
}

impl CollectiveTag {
    /// Layer value for collectives in the embedding stage
    pub const EMBED_LAYER: u32 = 0xFFFF_FFFE;
    /// Layer value for collectives in the output stage
    pub const OUTPUT_LAYER: u32 = 0xFFFF_FFFF;

    pub fn new(token: usize, layer: u32, op: CollectiveOp, seq: u32) -> Self {
        Self {
            token: token as u32,
            layer,
            op,
            seq,
        }
    }
}

/// Unit of transfer between two ranks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub tag: CollectiveTag,
    /// Step inside the collective (ring steps, or 0)
    pub step: u32,
    pub data: Vec<f32>,
}

/// Ordered, reliable frame delivery between ranks
#[async_trait]
pub trait Transport: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    async fn send(&self, peer: usize, frame: Frame) -> Result<()>;

    /// Next frame from `peer`, waiting as long as it takes
    async fn recv(&self, peer: usize) -> Result<Frame>;
}

type Inbox = Mutex<mpsc::UnboundedReceiver<Frame>>;

fn peer_check(rank: usize, world: usize, peer: usize) -> Result<()> {
    if peer >= world || peer == rank {
        return Err(NodeError::Network(format!(
            "rank {} has no link to rank {}",
            rank, peer
        )));
    }
    Ok(())
}

async fn recv_from(inboxes: &[Option<Inbox>], rank: usize, peer: usize) -> Result<Frame> {
    let inbox = inboxes
        .get(peer)
        .and_then(Option::as_ref)
        .ok_or_else(|| NodeError::Network(format!("rank {} has no link to rank {}", rank, peer)))?;
    inbox
        .lock()
        .await
        .recv()
        .await
        .ok_or_else(|| NodeError::Network(format!("link from rank {} closed", peer)))
}

/// In-process endpoints connected by channels
pub struct MemoryTransport {
    rank: usize,
    world_size: usize,
    outboxes: Vec<Option<mpsc::UnboundedSender<Frame>>>,
    inboxes: Vec<Option<Inbox>>,
}

impl MemoryTransport {
    /// `n` fully connected endpoints, indexed by rank
    pub fn mesh(n: usize) -> Vec<MemoryTransport> {
        let mut outboxes: Vec<Vec<Option<mpsc::UnboundedSender<Frame>>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
        let mut inboxes: Vec<Vec<Option<Inbox>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();

        for from in 0..n {
            for to in 0..n {
                if from == to {
                    continue;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                outboxes[from][to] = Some(tx);
                inboxes[to][from] = Some(Mutex::new(rx));
            }
        }

        outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (outboxes, inboxes))| MemoryTransport {
                rank,
                world_size: n,
                outboxes,
                inboxes,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn send(&self, peer: usize, frame: Frame) -> Result<()> {
        peer_check(self.rank, self.world_size, peer)?;
        let tx = self.outboxes[peer]
            .as_ref()
            .ok_or_else(|| NodeError::Network(format!("no link to rank {}", peer)))?;
        tx.send(frame)
            .map_err(|_| NodeError::Network(format!("rank {} is gone", peer)))
    }

    async fn recv(&self, peer: usize) -> Result<Frame> {
        peer_check(self.rank, self.world_size, peer)?;
        recv_from(&self.inboxes, self.rank, peer).await
    }
}

/// Messages exchanged while ranks find each other
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Rendezvous {
    /// Rank announces itself and the port of its mesh listener
    Join { rank: usize, port: u16 },
    /// Master answers with every rank's mesh address, indexed by rank
    Peers { addrs: Vec<String> },
    /// First frame on a mesh link, sent by the dialer
    Hello { rank: usize },
    /// Master refuses a join
    Reject { reason: String },
}

/// Where and how to rendezvous
#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    pub rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
    /// Bound on the whole rendezvous plus mesh setup
    pub timeout: Duration,
}

/// Full mesh of TCP links, one per peer
pub struct TcpTransport {
    rank: usize,
    world_size: usize,
    writers: Vec<Option<Mutex<OwnedWriteHalf>>>,
    inboxes: Vec<Option<Inbox>>,
    readers: Vec<JoinHandle<()>>,
}

impl TcpTransport {
    /// Rendezvous through the master and build the mesh. Rank 0 binds
    /// `0.0.0.0:master_port`; every other rank dials it.
    #[instrument(skip(config), fields(rank = config.rank, world_size = config.world_size))]
    pub async fn connect(config: RendezvousConfig) -> Result<Self> {
        if config.rank == 0 {
            let listener = TcpListener::bind(("0.0.0.0", config.master_port)).await?;
            Self::host(listener, config).await
        } else {
            Self::join(config).await
        }
    }

    /// Rank 0 side, on an already bound rendezvous listener
    pub async fn host(listener: TcpListener, config: RendezvousConfig) -> Result<Self> {
        let mesh = TcpListener::bind("0.0.0.0:0").await?;
        let mesh_port = mesh.local_addr()?.port();
        let world = config.world_size;
        let deadline = Instant::now() + config.timeout;

        let mut addrs: Vec<Option<String>> = vec![None; world];
        addrs[0] = Some(format!("{}:{}", config.master_addr, mesh_port));
        let mut joined: Vec<(usize, TcpStream)> = Vec::with_capacity(world.saturating_sub(1));

        while joined.len() + 1 < world {
            let (mut stream, peer) =
                with_deadline(deadline, "waiting for ranks to join", listener.accept()).await??;
            let msg: Rendezvous =
                with_deadline(deadline, "reading join", read_cbor_message(&mut stream)).await??;
            match msg {
                Rendezvous::Join { rank, port }
                    if rank > 0 && rank < world && addrs[rank].is_none() =>
                {
                    info!(rank, peer = %peer, "Rank joined");
                    addrs[rank] = Some(format!("{}:{}", peer.ip(), port));
                    joined.push((rank, stream));
                }
                other => {
                    warn!(peer = %peer, message = ?other, "Rejected rendezvous message");
                    let reject = Rendezvous::Reject {
                        reason: format!("unexpected {:?} for world size {}", other, world),
                    };
                    let _ = write_cbor_message(&mut stream, &reject).await;
                }
            }
        }

        let addrs: Vec<String> = addrs.into_iter().flatten().collect();
        let peers = Rendezvous::Peers { addrs: addrs.clone() };
        for (_, stream) in joined.iter_mut() {
            write_cbor_message(stream, &peers).await?;
        }
        info!(world_size = world, "All ranks joined");

        Self::build_mesh(0, world, mesh, &addrs, deadline).await
    }

    /// Non-master side: announce ourselves, wait for the address list
    pub async fn join(config: RendezvousConfig) -> Result<Self> {
        let mesh = TcpListener::bind("0.0.0.0:0").await?;
        let mesh_port = mesh.local_addr()?.port();
        let deadline = Instant::now() + config.timeout;
        let master = format!("{}:{}", config.master_addr, config.master_port);

        // the master may not be listening yet
        let mut stream = loop {
            match TcpStream::connect(&master).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!(master = %master, error = %e, "Master not reachable yet");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(e) => {
                    return Err(NodeError::Network(format!(
                        "cannot reach master {}: {}",
                        master, e
                    )))
                }
            }
        };

        write_cbor_message(
            &mut stream,
            &Rendezvous::Join {
                rank: config.rank,
                port: mesh_port,
            },
        )
        .await?;

        let reply: Rendezvous = with_deadline(
            deadline,
            "waiting for peer list",
            read_cbor_message(&mut stream),
        )
        .await??;
        let addrs = match reply {
            Rendezvous::Peers { addrs } if addrs.len() == config.world_size => addrs,
            Rendezvous::Reject { reason } => {
                return Err(NodeError::Network(format!("master rejected join: {}", reason)))
            }
            other => {
                return Err(NodeError::Network(format!(
                    "unexpected rendezvous reply {:?}",
                    other
                )))
            }
        };

        Self::build_mesh(config.rank, config.world_size, mesh, &addrs, deadline).await
    }

    /// Lower ranks dial higher ones; the dialer identifies itself with `Hello`
    async fn build_mesh(
        rank: usize,
        world: usize,
        mesh: TcpListener,
        addrs: &[String],
        deadline: Instant,
    ) -> Result<Self> {
        let mut streams: Vec<Option<TcpStream>> = (0..world).map(|_| None).collect();

        for (peer, addr) in addrs.iter().enumerate().skip(rank + 1) {
            let mut stream =
                with_deadline(deadline, "dialing peer", TcpStream::connect(addr.as_str()))
                    .await?
                    .map_err(|e| {
                        NodeError::Network(format!("cannot dial rank {} at {}: {}", peer, addr, e))
                    })?;
            stream.set_nodelay(true)?;
            write_cbor_message(&mut stream, &Rendezvous::Hello { rank }).await?;
            streams[peer] = Some(stream);
        }

        for _ in 0..rank {
            let (mut stream, addr) =
                with_deadline(deadline, "accepting peers", mesh.accept()).await??;
            stream.set_nodelay(true)?;
            let hello: Rendezvous =
                with_deadline(deadline, "reading hello", read_cbor_message(&mut stream)).await??;
            match hello {
                Rendezvous::Hello { rank: peer } if peer < rank && streams[peer].is_none() => {
                    streams[peer] = Some(stream);
                }
                other => {
                    return Err(NodeError::Network(format!(
                        "unexpected handshake {:?} from {}",
                        other, addr
                    )))
                }
            }
        }

        let mut writers = Vec::with_capacity(world);
        let mut inboxes = Vec::with_capacity(world);
        let mut readers = Vec::new();
        for (peer, stream) in streams.into_iter().enumerate() {
            match stream {
                Some(stream) => {
                    let (mut read_half, write_half) = stream.into_split();
                    let (tx, rx) = mpsc::unbounded_channel();
                    readers.push(tokio::spawn(async move {
                        loop {
                            match read_cbor_message::<_, Frame>(&mut read_half).await {
                                Ok(frame) => {
                                    if tx.send(frame).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    debug!(peer, error = %e, "Peer link closed");
                                    break;
                                }
                            }
                        }
                    }));
                    writers.push(Some(Mutex::new(write_half)));
                    inboxes.push(Some(Mutex::new(rx)));
                }
                None => {
                    writers.push(None);
                    inboxes.push(None);
                }
            }
        }

        info!(rank, world_size = world, "Collective mesh established");
        Ok(Self {
            rank,
            world_size: world,
            writers,
            inboxes,
            readers,
        })
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn send(&self, peer: usize, frame: Frame) -> Result<()> {
        peer_check(self.rank, self.world_size, peer)?;
        let writer = self.writers[peer]
            .as_ref()
            .ok_or_else(|| NodeError::Network(format!("no link to rank {}", peer)))?;
        let mut writer = writer.lock().await;
        write_cbor_message(&mut *writer, &frame)
            .await
            .map_err(|e| NodeError::Network(format!("send to rank {} failed: {}", peer, e)))
    }

    async fn recv(&self, peer: usize) -> Result<Frame> {
        peer_check(self.rank, self.world_size, peer)?;
        recv_from(&self.inboxes, self.rank, peer).await
    }
}

async fn with_deadline<F: std::future::Future>(
    deadline: Instant,
    what: &str,
    fut: F,
) -> Result<F::Output> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    tokio::time::timeout(remaining, fut)
        .await
        .map_err(|_| NodeError::Network(format!("rendezvous timed out {}", what)))
}
