//! Block ingestion pipeline.
//!
//! Drives every block through the queue's lifecycle: the head follower puts
//! new blocks and processes them in the unconfirmed phase, while two pollers
//! pull retries and confirmation work from the queue.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, info_span, instrument, trace, warn};

use crate::error::{IndexerError, IndexerResult};
use crate::metrics::{
    ProcessingTimer, record_block_processed, record_block_retry, record_published,
    record_queue_stat,
};
use crate::models::{BlockPackage, Topic};
use crate::ports::{BlockSource, Broker, Repositories};
use crate::queue::{Phase, QueueHandle};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// First block to ingest when nothing is stored yet.
    pub start_block: u64,
    /// Maximum blocks processed concurrently.
    pub concurrency: usize,
    /// Chain head polling interval.
    pub poll_interval: Duration,
    /// How often the retry and confirmation pollers ask the queue for work.
    pub retry_interval: Duration,
    /// Interval of the progress log.
    pub stat_interval: Duration,
    /// Time allowed for in-flight blocks to finish on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            concurrency: 8,
            poll_interval: Duration::from_secs(2),
            retry_interval: Duration::from_millis(500),
            stat_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Ingestion pipeline over a chain source, storage and a broker.
///
/// # Flow
///
/// 1. Poll the chain head, record it with `Latest` and `Put` every new block
/// 2. Unconfirmed phase: fetch, persist, publish once, mark done
/// 3. Failed blocks come back through `UnconfirmedNext` after their backoff
/// 4. Confirmed phase: once deep enough, re-fetch and replace the stored
///    block if its hash changed; never republish
pub struct Pipeline<S: BlockSource, R: Repositories, B: Broker + ?Sized> {
    config: PipelineConfig,
    block_source: Arc<S>,
    repositories: Arc<R>,
    broker: Arc<B>,
    queue: QueueHandle,
    permits: Arc<Semaphore>,
}

impl<S: BlockSource, R: Repositories, B: Broker + ?Sized> Clone for Pipeline<S, R, B> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            block_source: Arc::clone(&self.block_source),
            repositories: Arc::clone(&self.repositories),
            broker: Arc::clone(&self.broker),
            queue: self.queue.clone(),
            permits: Arc::clone(&self.permits),
        }
    }
}

impl<S, R, B> Pipeline<S, R, B>
where
    S: BlockSource + 'static,
    R: Repositories + 'static,
    B: Broker + ?Sized + 'static,
{
    pub fn new(
        config: PipelineConfig,
        block_source: Arc<S>,
        repositories: Arc<R>,
        broker: Arc<B>,
        queue: QueueHandle,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            config,
            block_source,
            repositories,
            broker,
            queue,
            permits,
        }
    }

    /// Run until shutdown is requested.
    #[instrument(skip_all, fields(start = self.config.start_block))]
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> IndexerResult<()> {
        info!("⛓️  Starting block pipeline");

        let mut next = self.resume_point().await?;
        info!(block = next, "Resuming ingestion");

        let retry = tokio::spawn(
            self.clone()
                .poll_phase(Phase::Unconfirmed, shutdown_rx.clone())
                .instrument(info_span!("retry_poller")),
        );
        let confirm = tokio::spawn(
            self.clone()
                .poll_phase(Phase::Confirmed, shutdown_rx.clone())
                .instrument(info_span!("confirmation_poller")),
        );

        let mut head_ticker = tokio::time::interval(self.config.poll_interval);
        head_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stat_ticker = tokio::time::interval(self.config.stat_interval);
        stat_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = head_ticker.tick() => {
                    match self.follow_head(&mut next, &shutdown_rx).await {
                        Ok(()) | Err(IndexerError::ShutdownRequested) => {}
                        Err(e) => warn!(error = %e, "⚠️  Failed to follow chain head"),
                    }
                }
                _ = stat_ticker.tick() => self.report_progress().await,
            }
        }

        debug!("Shutdown requested");
        for (name, poller) in [("retry", retry), ("confirmation", confirm)] {
            if let Err(e) = poller.await {
                warn!(poller = name, error = %e, "Poller task failed");
            }
        }
        self.drain().await;
        Ok(())
    }

    /// Next block to put: after the highest stored block, never before the
    /// configured start.
    pub async fn resume_point(&self) -> IndexerResult<u64> {
        let stored = self.repositories.blocks().latest_block_number().await?;
        Ok(stored.map_or(self.config.start_block, |latest| {
            self.config.start_block.max(latest.saturating_add(1))
        }))
    }

    /// Put and start every block between `next` and the chain head.
    async fn follow_head(
        &self,
        next: &mut u64,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> IndexerResult<()> {
        let head = self.block_source.latest_block_number().await?;
        if !self.queue.latest(head).await {
            debug!(head, "Chain head not recorded");
        }

        while *next <= head {
            if *shutdown_rx.borrow() {
                return Err(IndexerError::ShutdownRequested);
            }

            let number = *next;
            let permit = self.acquire_or_shutdown(shutdown_rx.clone()).await?;
            if self.queue.put(number).await {
                self.spawn_block(Phase::Unconfirmed, number, permit);
            } else {
                trace!(block = number, "Block already queued");
            }
            *next += 1;
        }
        Ok(())
    }

    /// Ask the queue for due work of one phase until shutdown.
    async fn poll_phase(self, phase: Phase, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }

            loop {
                if *shutdown_rx.borrow() {
                    return;
                }
                // Acquire first so a claimed block is never left waiting.
                let Ok(permit) = self.acquire_or_shutdown(shutdown_rx.clone()).await else {
                    return;
                };
                let claimed = match phase {
                    Phase::Unconfirmed => self.queue.unconfirmed_next().await,
                    Phase::Confirmed => self.queue.confirmed_next().await,
                };
                let Some(number) = claimed else {
                    break;
                };
                trace!(block = number, phase = phase.as_str(), "Claimed block");
                self.spawn_block(phase, number, permit);
            }
        }
    }

    /// Wait for a free worker slot, giving up once shutdown is requested.
    async fn acquire_or_shutdown(
        &self,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> IndexerResult<OwnedSemaphorePermit> {
        if *shutdown_rx.borrow_and_update() {
            return Err(IndexerError::ShutdownRequested);
        }

        let permits = Arc::clone(&self.permits);
        tokio::select! {
            permit = permits.acquire_owned() => {
                permit.map_err(|_| IndexerError::ShutdownRequested)
            }
            _ = shutdown_rx.wait_for(|stop| *stop) => Err(IndexerError::ShutdownRequested),
        }
    }

    fn spawn_block(&self, phase: Phase, number: u64, permit: OwnedSemaphorePermit) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match phase {
                Phase::Unconfirmed => pipeline.process_unconfirmed(number).await,
                Phase::Confirmed => pipeline.process_confirmed(number).await,
            }
        });
    }

    /// Wait for in-flight blocks, bounded by the shutdown grace period.
    async fn drain(&self) {
        let all = u32::try_from(self.config.concurrency.max(1)).unwrap_or(u32::MAX);
        match tokio::time::timeout(self.config.shutdown_grace, self.permits.acquire_many(all)).await
        {
            Ok(_) => debug!("In-flight blocks finished"),
            Err(_) => warn!("⚠️  In-flight blocks did not finish in time"),
        }
    }

    // =========================================================================
    // Unconfirmed phase
    // =========================================================================

    #[instrument(skip(self))]
    async fn process_unconfirmed(&self, number: u64) {
        let _timer = ProcessingTimer::new();

        match self.index_block(number).await {
            Ok(published) => {
                self.queue.unconfirmed_done(number).await;
                record_block_processed(Phase::Unconfirmed.as_str(), "done");
                debug!(published, "⛓️  Block indexed");
            }
            Err(e) => {
                self.queue.unconfirmed_failed(number).await;
                record_block_processed(Phase::Unconfirmed.as_str(), "failed");
                record_block_retry(Phase::Unconfirmed.as_str());
                warn!(error = %e, "❌ Block processing failed, will retry");
            }
        }
    }

    /// Fetch, persist and publish a block. Returns whether this attempt
    /// published it.
    async fn index_block(&self, number: u64) -> IndexerResult<bool> {
        let package = self.block_source.fetch_block(number).await?;
        trace!(
            transactions = package.transactions.len(),
            events = package.events.len(),
            "Fetched block"
        );

        self.repositories.persist_block_atomic(&package).await?;
        if !self.queue.inserted(number).await {
            return Err(IndexerError::QueueRejected {
                operation: "inserted",
                block: number,
            });
        }

        if !self.queue.can_publish(number).await {
            return Ok(false);
        }
        self.publish(&package).await;
        self.queue.published(number).await;
        Ok(true)
    }

    /// Publish a block with its transactions and events. Publishing is
    /// fire-and-forget; failures are logged.
    async fn publish(&self, package: &BlockPackage) {
        self.publish_records(Topic::Block, std::slice::from_ref(&package.block))
            .await;
        self.publish_records(Topic::Transaction, &package.transactions)
            .await;
        self.publish_records(Topic::Event, &package.events).await;
    }

    async fn publish_records<T: Serialize>(&self, topic: Topic, records: &[T]) {
        let mut published = 0;
        for record in records {
            let payload = match serde_json::to_string(record) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Failed to encode record");
                    continue;
                }
            };
            match self.broker.publish(topic, payload).await {
                Ok(()) => published += 1,
                Err(e) => warn!(topic = %topic, error = %e, "⚠️  Failed to publish record"),
            }
        }
        record_published(topic.as_str(), published);
    }

    // =========================================================================
    // Confirmed phase
    // =========================================================================

    #[instrument(skip(self))]
    async fn process_confirmed(&self, number: u64) {
        let _timer = ProcessingTimer::new();

        match self.confirm_block(number).await {
            Ok(replaced) => {
                self.queue.confirmed_done(number).await;
                record_block_processed(Phase::Confirmed.as_str(), "done");
                if replaced {
                    info!("🔄 Block replaced at confirmation");
                } else {
                    trace!("Block confirmed");
                }
            }
            Err(e) => {
                self.queue.confirmed_failed(number).await;
                record_block_processed(Phase::Confirmed.as_str(), "failed");
                record_block_retry(Phase::Confirmed.as_str());
                warn!(error = %e, "❌ Block confirmation failed, will retry");
            }
        }
    }

    /// Re-fetch a block and replace the stored copy if the chain changed it.
    /// Returns whether the block was replaced.
    async fn confirm_block(&self, number: u64) -> IndexerResult<bool> {
        let package = self.block_source.fetch_block(number).await?;
        let stored = self.repositories.blocks().get_block(number).await?;

        let replaced = stored.is_none_or(|block| block.hash != package.block.hash);
        if replaced {
            self.repositories.persist_block_atomic(&package).await?;
            self.queue.inserted(number).await;
        }
        Ok(replaced)
    }

    async fn report_progress(&self) {
        let stat = self.queue.stat().await;
        record_queue_stat(&stat);
        info!(
            latest = stat.latest,
            total = stat.total,
            inserted = stat.inserted,
            done = stat.done,
            unconfirmed_progress = stat.unconfirmed_progress,
            unconfirmed_waiting = stat.unconfirmed_waiting,
            confirmed_progress = stat.confirmed_progress,
            confirmed_waiting = stat.confirmed_waiting,
            "📊 Pipeline progress"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
