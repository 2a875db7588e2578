//! Block-lifecycle queue.
//!
//! A single actor task owns every [`BlockState`]. Callers talk to it through a
//! cloneable [`QueueHandle`]: each operation sends a request carrying a
//! oneshot reply channel and awaits the answer, which gives linearizable
//! observations of the shared state without a lock. Request channels are
//! bounded, so producers are throttled to the actor's processing rate.
//!
//! Unknown block numbers never produce errors; every operation answers
//! `false` / `None` instead. The same holds once the actor has stopped: sends
//! and reply receives fail and the handle reports "not applied", so no caller
//! is left blocked after shutdown.

mod state;

use std::collections::BTreeMap;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

pub use state::{
    BlockPhase, BlockState, DELAY_WRAP_SECS, GOLDEN_RATIO, INITIAL_DELAY, next_delay,
};

// =============================================================================
// Configuration
// =============================================================================

/// Default capacity for per-block request channels.
pub const DEFAULT_REQUEST_CAPACITY: usize = 128;

/// Default capacity for aggregate and work-dispatch query channels.
pub const DEFAULT_QUERY_CAPACITY: usize = 1;

/// Configuration for the block queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Blocks required on top of a block before it can be confirmed.
    pub confirmation_depth: u64,
    /// Capacity of the per-block operation channel.
    pub request_capacity: usize,
    /// Capacity of the head, stat and next channels.
    pub query_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            confirmation_depth: 0,
            request_capacity: DEFAULT_REQUEST_CAPACITY,
            query_capacity: DEFAULT_QUERY_CAPACITY,
        }
    }
}

impl QueueConfig {
    pub fn with_confirmation_depth(confirmation_depth: u64) -> Self {
        Self {
            confirmation_depth,
            ..Default::default()
        }
    }
}

/// Parse a configured confirmation depth.
///
/// Absence or an unparsable value means no confirmation delay.
pub fn parse_confirmation_depth(raw: Option<&str>) -> u64 {
    raw.and_then(|s| s.trim().parse::<u64>().ok()).unwrap_or(0)
}

/// Whether a block is deep enough below the head to be confirmed.
///
/// `latest − depth ≥ number`, and never while `latest < depth`.
pub fn can_be_confirmed(latest: u64, depth: u64, number: u64) -> bool {
    match latest.checked_sub(depth) {
        Some(confirmed_head) => confirmed_head >= number,
        None => false,
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Per-block operations answered with a boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockOp {
    Put,
    CanPublish,
    Published,
    Inserted,
    UnconfirmedFailed,
    UnconfirmedDone,
    ConfirmedFailed,
    ConfirmedDone,
    CanBeConfirmed,
}

#[derive(Debug)]
struct BlockRequest {
    op: BlockOp,
    number: u64,
    reply: oneshot::Sender<bool>,
}

#[derive(Debug)]
struct LatestRequest {
    number: u64,
    reply: oneshot::Sender<bool>,
}

#[derive(Debug)]
struct StatRequest {
    reply: oneshot::Sender<QueueStat>,
}

/// Processing phase a poller asks work for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unconfirmed,
    Confirmed,
}

impl Phase {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Phase::Unconfirmed => "unconfirmed",
            Phase::Confirmed => "confirmed",
        }
    }
}

#[derive(Debug)]
struct NextRequest {
    phase: Phase,
    reply: oneshot::Sender<Option<u64>>,
}

/// Point-in-time aggregate counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStat {
    pub unconfirmed_progress: u64,
    pub unconfirmed_waiting: u64,
    pub confirmed_progress: u64,
    pub confirmed_waiting: u64,
    pub total: u64,
    /// Blocks fully processed.
    pub done: u64,
    /// Distinct blocks persisted at least once.
    pub inserted: u64,
    /// Last chain head reported through [`QueueHandle::latest`].
    pub latest: u64,
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable client side of the queue actor.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    block_tx: mpsc::Sender<BlockRequest>,
    latest_tx: mpsc::Sender<LatestRequest>,
    stat_tx: mpsc::Sender<StatRequest>,
    next_tx: mpsc::Sender<NextRequest>,
}

impl QueueHandle {
    async fn block_request(&self, op: BlockOp, number: u64) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .block_tx
            .send(BlockRequest { op, number, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Start tracking a block. Returns `false` if it is already tracked.
    pub async fn put(&self, number: u64) -> bool {
        self.block_request(BlockOp::Put, number).await
    }

    /// Whether the block is tracked and not yet published.
    pub async fn can_publish(&self, number: u64) -> bool {
        self.block_request(BlockOp::CanPublish, number).await
    }

    /// Mark the block as published.
    pub async fn published(&self, number: u64) -> bool {
        self.block_request(BlockOp::Published, number).await
    }

    /// Record that the block's records were persisted.
    pub async fn inserted(&self, number: u64) -> bool {
        self.block_request(BlockOp::Inserted, number).await
    }

    pub async fn unconfirmed_failed(&self, number: u64) -> bool {
        self.block_request(BlockOp::UnconfirmedFailed, number).await
    }

    pub async fn unconfirmed_done(&self, number: u64) -> bool {
        self.block_request(BlockOp::UnconfirmedDone, number).await
    }

    pub async fn confirmed_failed(&self, number: u64) -> bool {
        self.block_request(BlockOp::ConfirmedFailed, number).await
    }

    pub async fn confirmed_done(&self, number: u64) -> bool {
        self.block_request(BlockOp::ConfirmedDone, number).await
    }

    /// Whether the recorded head is at least `confirmation_depth` past the
    /// block.
    pub async fn can_be_confirmed(&self, number: u64) -> bool {
        self.block_request(BlockOp::CanBeConfirmed, number).await
    }

    /// Record the chain head. Regressions are rejected with `false`.
    pub async fn latest(&self, number: u64) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .latest_tx
            .send(LatestRequest { number, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Aggregate counts. A stopped queue reports zeroes.
    pub async fn stat(&self) -> QueueStat {
        let (reply, rx) = oneshot::channel();
        if self.stat_tx.send(StatRequest { reply }).await.is_err() {
            return QueueStat::default();
        }
        rx.await.unwrap_or_default()
    }

    async fn next(&self, phase: Phase) -> Option<u64> {
        let (reply, rx) = oneshot::channel();
        self.next_tx.send(NextRequest { phase, reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Claim the lowest-numbered block due for an unconfirmed retry.
    pub async fn unconfirmed_next(&self) -> Option<u64> {
        self.next(Phase::Unconfirmed).await
    }

    /// Claim the lowest-numbered block due for confirmed processing.
    pub async fn confirmed_next(&self) -> Option<u64> {
        self.next(Phase::Confirmed).await
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Owner of all block states. Only the actor task touches it.
#[derive(Debug)]
pub struct BlockProcessorQueue {
    blocks: BTreeMap<u64, BlockState>,
    latest_block: u64,
    confirmation_depth: u64,
    total_inserted: u64,
}

impl BlockProcessorQueue {
    pub fn new(confirmation_depth: u64) -> Self {
        Self {
            blocks: BTreeMap::new(),
            latest_block: 0,
            confirmation_depth,
            total_inserted: 0,
        }
    }

    /// Start the actor task.
    ///
    /// The actor exits when `shutdown` flips to `true` (or its sender is
    /// dropped) or when every handle has been dropped.
    pub fn spawn(
        config: QueueConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (QueueHandle, JoinHandle<()>) {
        let (block_tx, block_rx) = mpsc::channel(config.request_capacity.max(1));
        let (latest_tx, latest_rx) = mpsc::channel(config.query_capacity.max(1));
        let (stat_tx, stat_rx) = mpsc::channel(config.query_capacity.max(1));
        let (next_tx, next_rx) = mpsc::channel(config.query_capacity.max(1));

        let queue = Self::new(config.confirmation_depth);
        let task = tokio::spawn(queue.run(
            Receivers {
                block_rx,
                latest_rx,
                stat_rx,
                next_rx,
            },
            shutdown,
        ));

        let handle = QueueHandle {
            block_tx,
            latest_tx,
            stat_tx,
            next_tx,
        };
        (handle, task)
    }

    async fn run(mut self, mut rx: Receivers, mut shutdown: watch::Receiver<bool>) {
        debug!(depth = self.confirmation_depth, "Block queue started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(req) = rx.block_rx.recv() => {
                    let result = self.apply(req.op, req.number, Instant::now());
                    let _ = req.reply.send(result);
                }
                Some(req) = rx.latest_rx.recv() => {
                    let _ = req.reply.send(self.set_latest(req.number));
                }
                Some(req) = rx.stat_rx.recv() => {
                    let _ = req.reply.send(self.stat());
                }
                Some(req) = rx.next_rx.recv() => {
                    let _ = req.reply.send(self.next(req.phase, Instant::now()));
                }
                else => break,
            }
        }

        debug!(blocks = self.blocks.len(), "Block queue stopped");
    }

    fn apply(&mut self, op: BlockOp, number: u64, now: Instant) -> bool {
        trace!(block = number, ?op, "Queue request");

        match op {
            BlockOp::Put => self.put(number, now),
            BlockOp::CanBeConfirmed => self.can_be_confirmed(number),
            BlockOp::CanPublish => self.blocks.get(&number).is_some_and(|b| !b.published),
            BlockOp::Inserted => {
                let mut first_insert = false;
                let applied = self.update(number, |block| {
                    first_insert = !block.inserted;
                    block.inserted = true;
                });
                if first_insert {
                    self.total_inserted += 1;
                }
                applied
            }
            BlockOp::Published => self.update(number, |block| block.published = true),
            BlockOp::UnconfirmedFailed => self.update(number, |block| {
                block.unconfirmed_progress = false;
                block.set_delay();
                block.set_last_attempted(now);
            }),
            BlockOp::UnconfirmedDone => self.update(number, |block| {
                block.unconfirmed_progress = false;
                block.unconfirmed_done = true;
                block.reset_delay();
                block.set_last_attempted(now);
            }),
            BlockOp::ConfirmedFailed => self.update(number, |block| {
                block.confirmed_progress = false;
                block.set_delay();
                block.set_last_attempted(now);
            }),
            BlockOp::ConfirmedDone => self.update(number, |block| {
                block.confirmed_progress = false;
                block.confirmed_done = true;
                block.reset_delay();
            }),
        }
    }

    /// Apply `f` to a tracked block. Returns `false` for unknown blocks.
    fn update(&mut self, number: u64, f: impl FnOnce(&mut BlockState)) -> bool {
        match self.blocks.get_mut(&number) {
            Some(block) => {
                f(block);
                true
            }
            None => false,
        }
    }

    fn put(&mut self, number: u64, now: Instant) -> bool {
        if self.blocks.contains_key(&number) {
            return false;
        }
        self.blocks.insert(number, BlockState::new(now));
        true
    }

    fn can_be_confirmed(&self, number: u64) -> bool {
        can_be_confirmed(self.latest_block, self.confirmation_depth, number)
    }

    fn set_latest(&mut self, number: u64) -> bool {
        if number < self.latest_block {
            debug!(
                reported = number,
                latest = self.latest_block,
                "Ignoring chain head regression"
            );
            return false;
        }
        self.latest_block = number;
        true
    }

    fn next(&mut self, phase: Phase, now: Instant) -> Option<u64> {
        let latest = self.latest_block;
        let depth = self.confirmation_depth;

        let (number, block) = self.blocks.iter_mut().find(|(number, block)| {
            block.can_attempt(now)
                && match phase {
                    Phase::Unconfirmed => block.awaits_unconfirmed(),
                    Phase::Confirmed => {
                        block.awaits_confirmed() && can_be_confirmed(latest, depth, **number)
                    }
                }
        })?;

        match phase {
            Phase::Unconfirmed => block.unconfirmed_progress = true,
            Phase::Confirmed => block.confirmed_progress = true,
        }
        block.set_last_attempted(now);
        Some(*number)
    }

    fn stat(&self) -> QueueStat {
        let mut stat = QueueStat {
            total: self.blocks.len() as u64,
            inserted: self.total_inserted,
            latest: self.latest_block,
            ..Default::default()
        };

        for block in self.blocks.values() {
            match block.phase() {
                BlockPhase::UnconfirmedInProgress => stat.unconfirmed_progress += 1,
                BlockPhase::UnconfirmedWaiting => stat.unconfirmed_waiting += 1,
                BlockPhase::ConfirmedInProgress => stat.confirmed_progress += 1,
                BlockPhase::ConfirmedWaiting => stat.confirmed_waiting += 1,
                BlockPhase::ConfirmedDone => stat.done += 1,
            }
        }

        stat
    }
}

struct Receivers {
    block_rx: mpsc::Receiver<BlockRequest>,
    latest_rx: mpsc::Receiver<LatestRequest>,
    stat_rx: mpsc::Receiver<StatRequest>,
    next_rx: mpsc::Receiver<NextRequest>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn spawn_queue(depth: u64) -> (QueueHandle, watch::Sender<bool>, JoinHandle<()>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) =
            BlockProcessorQueue::spawn(QueueConfig::with_confirmation_depth(depth), shutdown_rx);
        (handle, shutdown_tx, task)
    }

    #[test]
    fn test_parse_confirmation_depth_defaults_to_zero() {
        assert_eq!(parse_confirmation_depth(None), 0);
        assert_eq!(parse_confirmation_depth(Some("")), 0);
        assert_eq!(parse_confirmation_depth(Some("twelve")), 0);
        assert_eq!(parse_confirmation_depth(Some("-3")), 0);
        assert_eq!(parse_confirmation_depth(Some(" 12 ")), 12);
    }

    #[test]
    fn test_can_be_confirmed_is_monotonic_in_latest() {
        for depth in [0u64, 1, 5, 12] {
            for number in [0u64, 1, 7, 20] {
                let mut confirmed = false;
                for latest in 0..64 {
                    let now = can_be_confirmed(latest, depth, number);
                    assert!(!confirmed || now, "regressed at latest={latest}");
                    if latest < depth {
                        assert!(!now);
                    }
                    confirmed = now;
                }
            }
        }
    }

    #[test]
    fn test_put_twice_keeps_first_state() {
        let now = Instant::now();
        let mut queue = BlockProcessorQueue::new(0);
        assert!(queue.put(7, now));
        let first = queue.blocks[&7].clone();

        assert!(!queue.put(7, now + Duration::from_secs(30)));
        assert_eq!(queue.blocks[&7], first);
    }

    #[test]
    fn test_unknown_block_never_applies() {
        let now = Instant::now();
        let mut queue = BlockProcessorQueue::new(0);
        for op in [
            BlockOp::CanPublish,
            BlockOp::Published,
            BlockOp::Inserted,
            BlockOp::UnconfirmedFailed,
            BlockOp::UnconfirmedDone,
            BlockOp::ConfirmedFailed,
            BlockOp::ConfirmedDone,
        ] {
            assert!(!queue.apply(op, 42, now), "{op:?} applied to unknown block");
        }
        assert!(queue.blocks.is_empty());
    }

    #[test]
    fn test_failure_grows_delay_success_resets_it() {
        let now = Instant::now();
        let mut queue = BlockProcessorQueue::new(0);
        queue.put(1, now);

        queue.apply(BlockOp::UnconfirmedFailed, 1, now);
        queue.apply(BlockOp::UnconfirmedFailed, 1, now);
        assert_eq!(queue.blocks[&1].delay, Duration::from_secs(3));

        queue.apply(BlockOp::UnconfirmedDone, 1, now);
        assert_eq!(queue.blocks[&1].delay, INITIAL_DELAY);
        assert_eq!(queue.blocks[&1].phase(), BlockPhase::ConfirmedWaiting);
    }

    #[test]
    fn test_confirmed_done_is_distinct_from_failed() {
        let now = Instant::now();
        let mut queue = BlockProcessorQueue::new(0);
        queue.put(1, now);
        queue.apply(BlockOp::UnconfirmedDone, 1, now);

        queue.apply(BlockOp::ConfirmedFailed, 1, now);
        assert_eq!(queue.blocks[&1].phase(), BlockPhase::ConfirmedWaiting);
        assert_eq!(queue.blocks[&1].delay, Duration::from_secs(2));

        queue.apply(BlockOp::ConfirmedDone, 1, now);
        assert_eq!(queue.blocks[&1].phase(), BlockPhase::ConfirmedDone);
        assert_eq!(queue.stat().done, 1);
    }

    #[test]
    fn test_inserted_counts_distinct_blocks() {
        let now = Instant::now();
        let mut queue = BlockProcessorQueue::new(0);
        queue.put(1, now);
        queue.put(2, now);
        assert!(queue.apply(BlockOp::Inserted, 1, now));
        assert!(queue.apply(BlockOp::Inserted, 1, now));
        assert!(queue.apply(BlockOp::Inserted, 2, now));
        assert_eq!(queue.stat().inserted, 2);
    }

    #[test]
    fn test_latest_rejects_regression() {
        let mut queue = BlockProcessorQueue::new(0);
        assert!(queue.set_latest(10));
        assert!(queue.set_latest(10));
        assert!(!queue.set_latest(9));
        assert_eq!(queue.latest_block, 10);
        assert!(queue.set_latest(11));
    }

    #[tokio::test]
    async fn test_publish_then_done_scenario() {
        let (queue, _shutdown, _task) = spawn_queue(0);

        assert!(queue.put(100).await);
        assert!(queue.can_publish(100).await);
        assert!(queue.published(100).await);
        assert!(!queue.can_publish(100).await);
        assert!(queue.unconfirmed_done(100).await);

        let stat = queue.stat().await;
        assert_eq!(stat.total, 1);
        assert_eq!(stat.unconfirmed_progress, 0);
        assert_eq!(stat.confirmed_progress, 0);
        assert_eq!(stat.unconfirmed_waiting, 0);
        assert_eq!(stat.confirmed_waiting, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_next_waits_for_backoff() {
        let (queue, _shutdown, _task) = spawn_queue(0);

        assert!(queue.put(5).await);
        assert!(queue.put(3).await);
        // Both blocks are owned by their first attempt.
        assert_eq!(queue.unconfirmed_next().await, None);

        assert!(queue.unconfirmed_failed(5).await);
        assert!(queue.unconfirmed_failed(3).await);
        assert_eq!(queue.unconfirmed_next().await, None);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(queue.unconfirmed_next().await, Some(3));
        assert_eq!(queue.unconfirmed_next().await, Some(5));
        // Claimed blocks are in flight and cannot be handed out twice.
        assert_eq!(queue.unconfirmed_next().await, None);

        let stat = queue.stat().await;
        assert_eq!(stat.unconfirmed_progress, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_next_respects_depth() {
        let (queue, _shutdown, _task) = spawn_queue(2);

        for n in [8, 9] {
            assert!(queue.put(n).await);
            assert!(queue.unconfirmed_done(n).await);
        }
        tokio::time::advance(Duration::from_secs(1)).await;

        assert_eq!(queue.confirmed_next().await, None);
        assert!(!queue.can_be_confirmed(8).await);

        assert!(queue.latest(10).await);
        assert!(queue.can_be_confirmed(8).await);
        assert!(!queue.can_be_confirmed(9).await);
        assert_eq!(queue.confirmed_next().await, Some(8));
        assert_eq!(queue.confirmed_next().await, None);

        assert!(queue.latest(11).await);
        assert_eq!(queue.confirmed_next().await, Some(9));

        assert!(queue.confirmed_done(8).await);
        assert!(queue.confirmed_failed(9).await);
        let stat = queue.stat().await;
        assert_eq!(stat.done, 1);
        assert_eq!(stat.confirmed_waiting, 1);
        assert_eq!(stat.latest, 11);
    }

    #[tokio::test]
    async fn test_stopped_queue_answers_not_applied() {
        let (queue, shutdown, task) = spawn_queue(0);
        assert!(queue.put(1).await);

        shutdown.send(true).unwrap();
        task.await.unwrap();

        assert!(!queue.put(2).await);
        assert!(!queue.can_publish(1).await);
        assert!(!queue.latest(5).await);
        assert_eq!(queue.unconfirmed_next().await, None);
        assert_eq!(queue.stat().await, QueueStat::default());
    }
}
