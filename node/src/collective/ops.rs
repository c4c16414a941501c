//! Collectives over a [`Transport`]
//!
//! The all-reduce is the bandwidth-optimal ring: split the buffer into one
//! chunk per rank, reduce-scatter for n-1 steps, then all-gather for n-1
//! steps. Every receive is bounded by the collective timeout so a rank that
//! never arrives turns into [`NodeError::CollectiveTimeout`] on its peers
//! instead of a hang.

use super::transport::{CollectiveOp, CollectiveTag, Frame, Transport};
use crate::errors::{NodeError, Result};
use crate::model::partition::even_ranges;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Collective operations for one rank
#[derive(Clone)]
pub struct Collective {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl Collective {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn world_size(&self) -> usize {
        self.transport.world_size()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn send(&self, peer: usize, tag: CollectiveTag, step: u32, data: Vec<f32>) -> Result<()> {
        self.transport.send(peer, Frame { tag, step, data }).await
    }

    /// Receive the frame for (`tag`, `step`) from `peer`
    async fn recv(&self, peer: usize, tag: CollectiveTag, step: u32) -> Result<Vec<f32>> {
        let started = Instant::now();
        let frame = tokio::time::timeout(self.timeout, self.transport.recv(peer))
            .await
            .map_err(|_| NodeError::CollectiveTimeout {
                context: format!(
                    "{:?} token {} layer {} step {} waiting on rank {}",
                    tag.op,
                    tag.token,
                    describe_layer(tag.layer),
                    step,
                    peer
                ),
                waited_ms: started.elapsed().as_millis() as u64,
            })??;

        if frame.tag != tag || frame.step != step {
            return Err(NodeError::Network(format!(
                "protocol error: rank {} expected {:?} step {} from rank {}, got {:?} step {}",
                self.rank(),
                tag,
                step,
                peer,
                frame.tag,
                frame.step
            )));
        }
        Ok(frame.data)
    }

    /// Element-wise sum of `data` across all ranks; every rank gets the
    /// same result
    pub async fn all_reduce_sum(&self, tag: CollectiveTag, data: Vec<f32>) -> Result<Vec<f32>> {
        let n = self.world_size();
        if n == 1 {
            return Ok(data);
        }
        let tag = CollectiveTag {
            op: CollectiveOp::AllReduce,
            ..tag
        };
        let me = self.rank();
        let right = (me + 1) % n;
        let left = (me + n - 1) % n;
        let bounds = even_ranges(data.len(), n);
        let mut buf = data;

        // reduce-scatter: afterwards rank i holds the full sum of chunk (i+1) % n
        for step in 0..(n - 1) {
            let send_idx = (me + n - step) % n;
            let recv_idx = (me + n - step - 1) % n;
            let (s, e) = bounds[send_idx];
            self.send(right, tag, step as u32, buf[s..e].to_vec()).await?;

            let incoming = self.recv(left, tag, step as u32).await?;
            let (s, e) = bounds[recv_idx];
            if incoming.len() != e - s {
                return Err(chunk_mismatch(tag, e - s, incoming.len()));
            }
            for (dst, v) in buf[s..e].iter_mut().zip(&incoming) {
                *dst += v;
            }
        }
        trace!(?tag, "Reduce-scatter complete");

        for step in 0..(n - 1) {
            let send_idx = (me + n - step + 1) % n;
            let recv_idx = (me + n - step) % n;
            let wire_step = (n - 1 + step) as u32;
            let (s, e) = bounds[send_idx];
            self.send(right, tag, wire_step, buf[s..e].to_vec()).await?;

            let incoming = self.recv(left, tag, wire_step).await?;
            let (s, e) = bounds[recv_idx];
            if incoming.len() != e - s {
                return Err(chunk_mismatch(tag, e - s, incoming.len()));
            }
            buf[s..e].copy_from_slice(&incoming);
        }
        trace!(?tag, len = buf.len(), "All-reduce complete");

        Ok(buf)
    }

    /// Every rank's buffer, in rank order, on every rank
    pub async fn all_gather(&self, tag: CollectiveTag, data: Vec<f32>) -> Result<Vec<Vec<f32>>> {
        let tag = CollectiveTag {
            op: CollectiveOp::AllGather,
            ..tag
        };
        self.exchange_all(tag, data).await
    }

    async fn exchange_all(&self, tag: CollectiveTag, data: Vec<f32>) -> Result<Vec<Vec<f32>>> {
        let n = self.world_size();
        let me = self.rank();
        for peer in (0..n).filter(|&p| p != me) {
            self.send(peer, tag, 0, data.clone()).await?;
        }
        let mut out = Vec::with_capacity(n);
        for peer in 0..n {
            if peer == me {
                out.push(data.clone());
            } else {
                out.push(self.recv(peer, tag, 0).await?);
            }
        }
        Ok(out)
    }

    /// Collect every rank's buffer on `root`, in rank order. Other ranks
    /// get `None`.
    pub async fn gather(
        &self,
        tag: CollectiveTag,
        root: usize,
        data: Vec<f32>,
    ) -> Result<Option<Vec<Vec<f32>>>> {
        let tag = CollectiveTag {
            op: CollectiveOp::Gather,
            ..tag
        };
        let me = self.rank();
        if me != root {
            self.send(root, tag, 0, data).await?;
            return Ok(None);
        }

        let mut out = Vec::with_capacity(self.world_size());
        for peer in 0..self.world_size() {
            if peer == me {
                out.push(data.clone());
            } else {
                out.push(self.recv(peer, tag, 0).await?);
            }
        }
        Ok(Some(out))
    }

    /// Copy `root`'s buffer to every rank. Only `root` passes `Some`.
    pub async fn broadcast(
        &self,
        tag: CollectiveTag,
        root: usize,
        data: Option<Vec<f32>>,
    ) -> Result<Vec<f32>> {
        let tag = CollectiveTag {
            op: CollectiveOp::Broadcast,
            ..tag
        };
        let me = self.rank();
        if me == root {
            let data = data.ok_or_else(|| {
                NodeError::Execution("broadcast root has nothing to send".to_string())
            })?;
            for peer in (0..self.world_size()).filter(|&p| p != me) {
                self.send(peer, tag, 0, data.clone()).await?;
            }
            Ok(data)
        } else {
            self.recv(root, tag, 0).await
        }
    }

    /// Wait until every rank reaches the same tag
    pub async fn barrier(&self, tag: CollectiveTag) -> Result<()> {
        let tag = CollectiveTag {
            op: CollectiveOp::Barrier,
            ..tag
        };
        self.exchange_all(tag, vec![self.rank() as f32]).await?;
        debug!(?tag, "Barrier passed");
        Ok(())
    }
}

fn describe_layer(layer: u32) -> String {
    match layer {
        CollectiveTag::EMBED_LAYER => "embed".to_string(),
        CollectiveTag::OUTPUT_LAYER => "output".to_string(),
        l => l.to_string(),
    }
}

fn chunk_mismatch(tag: CollectiveTag, expected: usize, got: usize) -> NodeError {
    NodeError::Network(format!(
        "protocol error in {:?}: chunk of {} values, expected {}",
        tag, got, expected
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::transport::MemoryTransport;

    fn collectives(n: usize, timeout_ms: u64) -> Vec<Collective> {
        MemoryTransport::mesh(n)
            .into_iter()
            .map(|t| Collective::new(Arc::new(t), Duration::from_millis(timeout_ms)))
            .collect()
    }

    fn tag() -> CollectiveTag {
        CollectiveTag::new(3, 1, CollectiveOp::AllReduce, 0)
    }

    #[tokio::test]
    async fn test_all_reduce_sums_across_ranks() {
        for n in [1usize, 2, 3, 4] {
            let handles: Vec<_> = collectives(n, 2000)
                .into_iter()
                .map(|c| {
                    tokio::spawn(async move {
                        // 7 values: chunks are uneven for every n > 1
                        let data: Vec<f32> =
                            (0..7).map(|i| (c.rank() * 10 + i) as f32).collect();
                        c.all_reduce_sum(tag(), data).await
                    })
                })
                .collect();

            let expected: Vec<f32> = (0..7)
                .map(|i| (0..n).map(|r| (r * 10 + i) as f32).sum())
                .collect();
            for h in handles {
                assert_eq!(h.await.unwrap().unwrap(), expected, "world size {}", n);
            }
        }
    }

    #[tokio::test]
    async fn test_all_reduce_shorter_than_world() {
        let handles: Vec<_> = collectives(4, 2000)
            .into_iter()
            .map(|c| tokio::spawn(async move { c.all_reduce_sum(tag(), vec![1.0, 2.0]).await }))
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), vec![4.0, 8.0]);
        }
    }

    #[tokio::test]
    async fn test_gather_and_broadcast() {
        let handles: Vec<_> = collectives(3, 2000)
            .into_iter()
            .map(|c| {
                tokio::spawn(async move {
                    let gathered = c.gather(tag(), 0, vec![c.rank() as f32; 2]).await?;
                    let token = gathered.map(|parts| vec![parts.concat().iter().sum::<f32>()]);
                    c.broadcast(tag(), 0, token).await
                })
            })
            .collect();
        for h in handles {
            // 0+0+1+1+2+2
            assert_eq!(h.await.unwrap().unwrap(), vec![6.0]);
        }
    }

    #[tokio::test]
    async fn test_all_gather_rank_order() {
        let handles: Vec<_> = collectives(3, 2000)
            .into_iter()
            .map(|c| tokio::spawn(async move { c.all_gather(tag(), vec![c.rank() as f32]).await }))
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), vec![vec![0.0], vec![1.0], vec![2.0]]);
        }
    }

    #[tokio::test]
    async fn test_missing_rank_times_out_on_every_peer() {
        let mut ranks = collectives(3, 100);
        let absent = ranks.pop().unwrap();
        let handles: Vec<_> = ranks
            .into_iter()
            .map(|c| tokio::spawn(async move { c.barrier(tag()).await }))
            .collect();
        for h in handles {
            assert!(matches!(
                h.await.unwrap(),
                Err(NodeError::CollectiveTimeout { .. })
            ));
        }
        drop(absent);
    }

    #[tokio::test]
    async fn test_tag_mismatch_is_protocol_error() {
        let mut ranks = collectives(2, 1000);
        let r1 = ranks.pop().unwrap();
        let r0 = ranks.pop().unwrap();
        let other = CollectiveTag::new(4, 1, CollectiveOp::AllReduce, 0);
        let a = tokio::spawn(async move { r0.all_reduce_sum(tag(), vec![1.0]).await });
        let b = tokio::spawn(async move { r1.all_reduce_sum(other, vec![1.0]).await });
        assert!(matches!(a.await.unwrap(), Err(NodeError::Network(_))));
        assert!(matches!(b.await.unwrap(), Err(NodeError::Network(_))));
    }
}
