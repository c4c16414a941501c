//! Memory window scheduler
//!
//! Keeps at most `window_size` shards resident per rank. A token's pass
//! visits `embed, layer 0 .. layer L-1, output`; the window after
//! `advance(g)` covers the next `window_size` slots of that order taken
//! modulo `L + 2`, so the tail of one token's pass prefetches the head of
//! the next. Edge shards are window entries like any layer.
//!
//! Per-slot state lives in a tagged table behind a mutex. Loads run on the
//! blocking pool and carry the epoch and ticket they were issued under; a load
//! that finishes after its slot was evicted, or after `release_all`, is
//! dropped without touching the table.

use super::source::{LayerShard, LayerSource};
use crate::errors::{NodeError, Result};
use crate::model::ShardGroup;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why a load ended without a resident shard
#[derive(Debug, Clone, PartialEq)]
pub enum LoadFailure {
    Load(String),
    OutOfMemory { requested: u64, budget: u64 },
}

/// State of one slot's shard
#[derive(Debug, Clone)]
pub enum LayerState {
    Idle,
    Loading { ticket: u64 },
    Resident(Arc<LayerShard>),
    Evicted,
    Failed(LoadFailure),
}

/// Tag-only view of [`LayerState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerStateKind {
    Idle,
    Loading,
    Resident,
    Evicted,
    Failed,
}

impl LayerState {
    pub fn kind(&self) -> LayerStateKind {
        match self {
            LayerState::Idle => LayerStateKind::Idle,
            LayerState::Loading { .. } => LayerStateKind::Loading,
            LayerState::Resident(_) => LayerStateKind::Resident,
            LayerState::Evicted => LayerStateKind::Evicted,
            LayerState::Failed(_) => LayerStateKind::Failed,
        }
    }

    fn needs_load(&self) -> bool {
        matches!(
            self,
            LayerState::Idle | LayerState::Evicted
        )
    }
}

/// Scheduler decisions, recorded in issue order when tracing is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    Advance(ShardGroup),
    /// Demand load issued by `advance` for the requested group
    Load(ShardGroup),
    /// Background load for a later slot in the window
    Prefetch(ShardGroup),
    Evict(ShardGroup),
    ReleaseAll,
}

/// Window configuration
#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub window_size: usize,
    /// Defensive ceiling on resident shard bytes; `window_size` is the
    /// policy, this only turns a broken invariant into an error
    pub memory_budget: Option<u64>,
    pub trace: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size: 2,
            memory_budget: None,
            trace: false,
        }
    }
}

/// Counters for one scheduler
#[derive(Debug, Default)]
pub struct WindowStats {
    pub demand_loads: AtomicU64,
    pub prefetches: AtomicU64,
    /// advance found the shard already resident
    pub hits: AtomicU64,
    /// advance had to wait for a load
    pub stalls: AtomicU64,
    pub stall_time_us: AtomicU64,
    pub evictions: AtomicU64,
    /// loads finished after their slot left the window
    pub discarded_loads: AtomicU64,
    pub peak_resident_shards: AtomicU64,
    pub peak_resident_bytes: AtomicU64,
    /// largest single shard seen, edge shards included
    pub max_shard_bytes: AtomicU64,
}

impl WindowStats {
    pub fn peak_resident_shards(&self) -> u64 {
        self.peak_resident_shards.load(Ordering::Relaxed)
    }

    pub fn peak_resident_bytes(&self) -> u64 {
        self.peak_resident_bytes.load(Ordering::Relaxed)
    }

    pub fn max_shard_bytes(&self) -> u64 {
        self.max_shard_bytes.load(Ordering::Relaxed)
    }

    pub fn loads(&self) -> u64 {
        self.demand_loads.load(Ordering::Relaxed) + self.prefetches.load(Ordering::Relaxed)
    }

    pub fn log_summary(&self) {
        info!(
            demand_loads = self.demand_loads.load(Ordering::Relaxed),
            prefetches = self.prefetches.load(Ordering::Relaxed),
            hits = self.hits.load(Ordering::Relaxed),
            stalls = self.stalls.load(Ordering::Relaxed),
            stall_ms = self.stall_time_us.load(Ordering::Relaxed) / 1000,
            evictions = self.evictions.load(Ordering::Relaxed),
            peak_shards = self.peak_resident_shards(),
            peak_bytes = self.peak_resident_bytes(),
            "Memory window statistics"
        );
    }
}

struct Inner {
    states: Vec<LayerState>,
    epoch: u64,
    next_ticket: u64,
    resident_bytes: u64,
    /// (ms since scheduler start, resident bytes) after every change
    history: Vec<(u64, u64)>,
    trace: Vec<WindowEvent>,
    handles: Vec<JoinHandle<()>>,
}

impl Inner {
    fn resident_count(&self) -> usize {
        self.states
            .iter()
            .filter(|s| matches!(s, LayerState::Resident(_)))
            .count()
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded sliding window of resident shards for one rank
pub struct WindowScheduler {
    inner: Arc<Mutex<Inner>>,
    source: Arc<dyn LayerSource>,
    config: WindowConfig,
    num_layers: usize,
    /// `num_layers + 2`: embed and output bracket the layers
    slots: usize,
    version: Arc<watch::Sender<u64>>,
    stats: Arc<WindowStats>,
    started: Instant,
}

impl WindowScheduler {
    pub fn new(source: Arc<dyn LayerSource>, config: WindowConfig) -> Result<Self> {
        if config.window_size < 2 {
            return Err(NodeError::Config(format!(
                "window_size must be at least 2, got {}",
                config.window_size
            )));
        }
        let num_layers = source.num_layers();
        if num_layers == 0 {
            return Err(NodeError::Config("model has no layers".to_string()));
        }
        let slots = num_layers + 2;
        let (version, _) = watch::channel(0u64);

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                states: vec![LayerState::Idle; slots],
                epoch: 0,
                next_ticket: 0,
                resident_bytes: 0,
                history: Vec::new(),
                trace: Vec::new(),
                handles: Vec::new(),
            })),
            source,
            config,
            num_layers,
            slots,
            version: Arc::new(version),
            stats: Arc::new(WindowStats::default()),
            started: Instant::now(),
        })
    }

    pub fn window_size(&self) -> usize {
        self.config.window_size
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn stats(&self) -> &Arc<WindowStats> {
        &self.stats
    }

    fn group(&self, slot: usize) -> ShardGroup {
        ShardGroup::at_pass_position(slot, self.num_layers).unwrap_or(ShardGroup::Output)
    }

    fn slot(&self, group: ShardGroup) -> Result<usize> {
        let slot = group.pass_position(self.num_layers);
        if ShardGroup::at_pass_position(slot, self.num_layers) != Some(group) {
            return Err(NodeError::Execution(format!(
                "{:?} is beyond a model of {} layers",
                group, self.num_layers
            )));
        }
        Ok(slot)
    }

    fn window_slots(&self, slot: usize) -> Vec<usize> {
        let span = self.config.window_size.min(self.slots);
        (0..span).map(|k| (slot + k) % self.slots).collect()
    }

    /// Groups in the window that starts at `group`, in prefetch order
    pub fn window_for(&self, group: ShardGroup) -> Vec<ShardGroup> {
        match self.slot(group) {
            Ok(slot) => self
                .window_slots(slot)
                .into_iter()
                .map(|s| self.group(s))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Make `group` resident and return its shard.
    ///
    /// Evicts every slot outside the new window first, then issues the
    /// demand load (if needed) and prefetches for the rest of the window.
    /// Blocks only when `group` is not yet resident.
    pub async fn advance(&self, group: ShardGroup) -> Result<Arc<LayerShard>> {
        let target = self.slot(group)?;
        let mut rx = self.version.subscribe();
        let window = self.window_slots(target);

        {
            let mut inner = lock(&self.inner);
            if self.config.trace {
                inner.trace.push(WindowEvent::Advance(group));
            }

            let keep: HashSet<usize> = window.iter().copied().collect();
            for idx in 0..self.slots {
                if keep.contains(&idx) {
                    continue;
                }
                self.evict_locked(&mut inner, idx);
            }

            for (pos, &idx) in window.iter().enumerate() {
                if !inner.states[idx].needs_load() {
                    continue;
                }
                let event = if pos == 0 {
                    self.stats.demand_loads.fetch_add(1, Ordering::Relaxed);
                    WindowEvent::Load(self.group(idx))
                } else {
                    self.stats.prefetches.fetch_add(1, Ordering::Relaxed);
                    WindowEvent::Prefetch(self.group(idx))
                };
                if self.config.trace {
                    inner.trace.push(event);
                }
                self.spawn_load_locked(&mut inner, idx);
            }
        }

        let mut stall_started: Option<Instant> = None;
        loop {
            {
                let inner = lock(&self.inner);
                match &inner.states[target] {
                    LayerState::Resident(shard) => {
                        match stall_started {
                            Some(t) => {
                                self.stats.stalls.fetch_add(1, Ordering::Relaxed);
                                self.stats
                                    .stall_time_us
                                    .fetch_add(t.elapsed().as_micros() as u64, Ordering::Relaxed);
                            }
                            None => {
                                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        return Ok(Arc::clone(shard));
                    }
                    LayerState::Failed(failure) => {
                        return Err(self.failure_error(group, failure));
                    }
                    LayerState::Loading { .. } => {}
                    LayerState::Idle | LayerState::Evicted => {
                        return Err(NodeError::Execution(format!(
                            "{:?} left the window while advance was waiting",
                            group
                        )));
                    }
                }
            }
            stall_started.get_or_insert_with(Instant::now);
            rx.changed()
                .await
                .map_err(|_| NodeError::Execution("window scheduler dropped".to_string()))?;
        }
    }

    fn failure_error(&self, group: ShardGroup, failure: &LoadFailure) -> NodeError {
        match failure {
            LoadFailure::Load(msg) => NodeError::ShardLoad(format!("{:?}: {}", group, msg)),
            LoadFailure::OutOfMemory { requested, budget } => NodeError::OutOfMemory {
                requested: *requested,
                budget: *budget,
                window_size: self.config.window_size,
            },
        }
    }

    fn evict_locked(&self, inner: &mut Inner, idx: usize) {
        let previous = std::mem::replace(&mut inner.states[idx], LayerState::Evicted);
        match previous {
            LayerState::Resident(shard) => {
                inner.resident_bytes = inner.resident_bytes.saturating_sub(shard.size_bytes());
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.record_history(inner);
                if self.config.trace {
                    inner.trace.push(WindowEvent::Evict(self.group(idx)));
                }
                debug!(group = ?self.group(idx), "Evicted shard");
            }
            LayerState::Loading { .. } => {
                // the in-flight load sees a stale ticket and drops its result
                if self.config.trace {
                    inner.trace.push(WindowEvent::Evict(self.group(idx)));
                }
            }
            LayerState::Failed(f) => {
                // keep failures sticky until release_all
                inner.states[idx] = LayerState::Failed(f);
            }
            LayerState::Idle => inner.states[idx] = LayerState::Idle,
            LayerState::Evicted => {}
        }
    }

    fn record_history(&self, inner: &mut Inner) {
        let at = self.started.elapsed().as_millis() as u64;
        let bytes = inner.resident_bytes;
        inner.history.push((at, bytes));
    }

    fn spawn_load_locked(&self, inner: &mut Inner, idx: usize) {
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        inner.states[idx] = LayerState::Loading { ticket };
        let epoch = inner.epoch;
        let group = self.group(idx);

        let shared = Arc::clone(&self.inner);
        let source = Arc::clone(&self.source);
        let version = Arc::clone(&self.version);
        let stats = Arc::clone(&self.stats);
        let budget = self.config.memory_budget;
        let started = self.started;

        let handle = tokio::task::spawn_blocking(move || {
            let result = source.load(group);

            let mut inner = lock(&shared);
            let current = matches!(inner.states[idx], LayerState::Loading { ticket: t } if t == ticket);
            if inner.epoch != epoch || !current {
                stats.discarded_loads.fetch_add(1, Ordering::Relaxed);
                debug!(group = ?group, "Discarded stale shard load");
                return;
            }

            let next = match result {
                Ok(shard) => {
                    let size = shard.size_bytes();
                    let requested = inner.resident_bytes + size;
                    match budget {
                        Some(budget) if requested > budget => {
                            warn!(group = ?group, requested, budget, "Resident shards exceed memory budget");
                            LayerState::Failed(LoadFailure::OutOfMemory { requested, budget })
                        }
                        _ => {
                            inner.resident_bytes = requested;
                            stats.max_shard_bytes.fetch_max(size, Ordering::Relaxed);
                            stats
                                .peak_resident_bytes
                                .fetch_max(requested, Ordering::Relaxed);
                            LayerState::Resident(Arc::new(shard))
                        }
                    }
                }
                Err(e) => {
                    warn!(group = ?group, error = %e, "Shard failed to load");
                    LayerState::Failed(LoadFailure::Load(e.to_string()))
                }
            };
            inner.states[idx] = next;

            let resident = inner.resident_count() as u64;
            stats.peak_resident_shards.fetch_max(resident, Ordering::Relaxed);
            let at = started.elapsed().as_millis() as u64;
            let bytes = inner.resident_bytes;
            inner.history.push((at, bytes));
            drop(inner);

            version.send_modify(|v| *v += 1);
        });

        inner.handles.retain(|h| !h.is_finished());
        inner.handles.push(handle);
    }

    /// Free every resident shard and cancel in-flight loads.
    ///
    /// Waits for outstanding blocking reads so their buffers are gone when
    /// this returns.
    pub async fn release_all(&self) {
        let handles = {
            let mut inner = lock(&self.inner);
            inner.epoch += 1;
            for state in inner.states.iter_mut() {
                *state = LayerState::Idle;
            }
            inner.resident_bytes = 0;
            self.record_history(&mut inner);
            if self.config.trace {
                inner.trace.push(WindowEvent::ReleaseAll);
            }
            std::mem::take(&mut inner.handles)
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.version.send_modify(|v| *v += 1);
        debug!("Memory window released");
    }

    pub fn state(&self, group: ShardGroup) -> Option<LayerStateKind> {
        let slot = self.slot(group).ok()?;
        lock(&self.inner).states.get(slot).map(LayerState::kind)
    }

    /// Groups currently resident, in pass order
    pub fn resident_groups(&self) -> Vec<ShardGroup> {
        lock(&self.inner)
            .states
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, LayerState::Resident(_)))
            .map(|(i, _)| self.group(i))
            .collect()
    }

    /// Slots resident or loading
    pub fn occupied_slots(&self) -> usize {
        lock(&self.inner)
            .states
            .iter()
            .filter(|s| matches!(s, LayerState::Resident(_) | LayerState::Loading { .. }))
            .count()
    }

    pub fn resident_bytes(&self) -> u64 {
        lock(&self.inner).resident_bytes
    }

    pub fn trace(&self) -> Vec<WindowEvent> {
        lock(&self.inner).trace.clone()
    }

    /// Resident-byte samples `(ms since start, bytes)`
    pub fn memory_history(&self) -> Vec<(u64, u64)> {
        lock(&self.inner).history.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ShardFile, ShardTensor, DType};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Synthetic shards of fixed size with optional latency and failure
    struct FakeSource {
        layers: usize,
        delay: Duration,
        /// extra latency for everything but the embedding
        slow_tail: Duration,
        fail: Option<ShardGroup>,
        loads: AtomicUsize,
    }

    impl FakeSource {
        fn new(layers: usize) -> Self {
            Self {
                layers,
                delay: Duration::ZERO,
                slow_tail: Duration::ZERO,
                fail: None,
                loads: AtomicUsize::new(0),
            }
        }
    }

    impl LayerSource for FakeSource {
        fn num_layers(&self) -> usize {
            self.layers
        }

        fn load(&self, group: ShardGroup) -> Result<LayerShard> {
            std::thread::sleep(self.delay);
            if group != ShardGroup::Embed {
                std::thread::sleep(self.slow_tail);
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail == Some(group) {
                return Err(NodeError::ShardLoad("corrupt".to_string()));
            }
            let tag = group.pass_position(self.layers) as f32;
            let file = ShardFile {
                tensors: vec![ShardTensor {
                    name: group.file_name(),
                    dtype: DType::F32,
                    shape: vec![4],
                    data: DType::F32.encode(&[tag; 4]),
                }],
            };
            LayerShard::from_file(group, file)
        }
    }

    fn scheduler(source: FakeSource, window_size: usize) -> WindowScheduler {
        WindowScheduler::new(
            Arc::new(source),
            WindowConfig {
                window_size,
                memory_budget: None,
                trace: true,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_window_size_must_be_two() {
        let result = WindowScheduler::new(
            Arc::new(FakeSource::new(4)),
            WindowConfig {
                window_size: 1,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(NodeError::Config(_))));
    }

    #[tokio::test]
    async fn test_advance_returns_requested_shard() {
        let s = scheduler(FakeSource::new(3), 2);
        let shard = s.advance(ShardGroup::Layer(1)).await.unwrap();
        assert_eq!(shard.group, ShardGroup::Layer(1));
        assert_eq!(shard.vector("layer_001.shard").unwrap(), &[2.0; 4]);

        let output = s.advance(ShardGroup::Output).await.unwrap();
        assert_eq!(output.vector("output.shard").unwrap(), &[4.0; 4]);
        assert!(s.advance(ShardGroup::Layer(3)).await.is_err());
        assert!(s.advance(ShardGroup::Layer(4)).await.is_err());
    }

    #[tokio::test]
    async fn test_window_wraps_to_next_token() {
        use ShardGroup::*;
        let s = scheduler(FakeSource::new(5), 3);
        assert_eq!(s.window_for(Layer(3)), vec![Layer(3), Layer(4), Output]);
        assert_eq!(s.window_for(Layer(4)), vec![Layer(4), Output, Embed]);
        assert_eq!(s.window_for(Embed), vec![Embed, Layer(0), Layer(1)]);

        let big = scheduler(FakeSource::new(2), 8);
        assert_eq!(big.window_for(Output), vec![Output, Embed, Layer(0), Layer(1)]);
    }

    #[tokio::test]
    async fn test_edge_shards_share_the_window() {
        use ShardGroup::*;
        let s = scheduler(FakeSource::new(3), 2);
        for group in ShardGroup::pass_order(3) {
            s.advance(group).await.unwrap();
            assert!(s.occupied_slots() <= 2);
        }
        // output evicted layer 2 and prefetched the next token's embedding
        assert_eq!(s.state(Layer(2)), Some(LayerStateKind::Evicted));
        assert!(s.window_for(Output).contains(&Embed));
        assert!(s.stats().peak_resident_shards() <= 2);
    }

    #[tokio::test]
    async fn test_failed_load_is_shard_load_error() {
        let mut source = FakeSource::new(4);
        source.fail = Some(ShardGroup::Layer(2));
        let s = scheduler(source, 2);
        s.advance(ShardGroup::Embed).await.unwrap();
        s.advance(ShardGroup::Layer(0)).await.unwrap();
        s.advance(ShardGroup::Layer(1)).await.unwrap();
        assert!(matches!(
            s.advance(ShardGroup::Layer(2)).await,
            Err(NodeError::ShardLoad(_))
        ));
    }

    #[tokio::test]
    async fn test_budget_assertion_reports_out_of_memory() {
        let s = WindowScheduler::new(
            Arc::new(FakeSource::new(4)),
            WindowConfig {
                window_size: 2,
                memory_budget: Some(20),
                trace: false,
            },
        )
        .unwrap();
        // each shard holds 16 bytes; two resident shards need 32
        let mut saw_oom = false;
        for group in ShardGroup::pass_order(4) {
            match s.advance(group).await {
                Ok(_) => {}
                Err(NodeError::OutOfMemory { window_size, .. }) => {
                    assert_eq!(window_size, 2);
                    saw_oom = true;
                    break;
                }
                Err(e) => panic!("unexpected {}", e),
            }
        }
        assert!(saw_oom);
    }

    #[tokio::test]
    async fn test_release_all_frees_everything() {
        let mut source = FakeSource::new(6);
        source.slow_tail = Duration::from_millis(50);
        let s = scheduler(source, 3);
        s.advance(ShardGroup::Embed).await.unwrap();
        s.release_all().await;

        assert!(s.resident_groups().is_empty());
        assert_eq!(s.resident_bytes(), 0);
        assert_eq!(s.occupied_slots(), 0);
        for group in ShardGroup::pass_order(6) {
            assert_eq!(s.state(group), Some(LayerStateKind::Idle));
        }
        // prefetches issued before release were dropped
        assert!(s.stats().discarded_loads.load(Ordering::Relaxed) >= 1);
        assert_eq!(s.trace().last(), Some(&WindowEvent::ReleaseAll));
    }

    #[tokio::test]
    async fn test_slow_disk_stalls_then_hits() {
        let mut source = FakeSource::new(4);
        source.delay = Duration::from_millis(30);
        let s = scheduler(source, 2);
        s.advance(ShardGroup::Embed).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        s.advance(ShardGroup::Layer(0)).await.unwrap();

        let stats = s.stats();
        assert_eq!(stats.stalls.load(Ordering::Relaxed), 1);
        assert_eq!(stats.hits.load(Ordering::Relaxed), 1);
    }
}
