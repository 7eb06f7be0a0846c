//! Capture endpoint: one region, its wait queue and its counters.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::QueueConfig;
use crate::enqueue::{enqueue_batch, BatchParams, EnqueueOutcome};
use crate::error::RegionError;
use crate::layout::TxQueue;
use crate::packet::{batch_len, PacketBuffer};
use crate::reader::RxReader;
use crate::region::{RegionState, SharedRegion};
use crate::wake::{Notifier, WaitQueue, WakeCoordinator};

/// Per-endpoint counters, updated without locks.
#[derive(Debug, Default)]
pub struct QueueStats {
    recv: AtomicU64,
    lost: AtomicU64,
    drop: AtomicU64,
    wake: AtomicU64,
    fault: AtomicU64,
}

/// A point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Packets committed to the rx queue.
    pub recv: u64,
    /// Packets that found the queue full or the region unpublished.
    pub lost: u64,
    /// Packets abandoned after a copy fault.
    pub drop: u64,
    /// Consumer wake-ups issued.
    pub wake: u64,
    /// Batches cut short by a copy fault.
    pub fault: u64,
}

impl QueueStats {
    fn record(&self, outcome: &EnqueueOutcome) {
        self.recv
            .fetch_add(outcome.committed as u64, Ordering::Relaxed);
        if outcome.fault {
            self.fault.fetch_add(1, Ordering::Relaxed);
            self.drop.fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        } else {
            self.lost.fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            recv: self.recv.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            drop: self.drop.load(Ordering::Relaxed),
            wake: self.wake.load(Ordering::Relaxed),
            fault: self.fault.load(Ordering::Relaxed),
        }
    }
}

/// A capture endpoint.
///
/// Producers call [`enqueue`](Self::enqueue) from any thread. One consumer
/// at a time holds the [`RxReader`] returned by [`reader`](Self::reader).
pub struct Endpoint {
    id: u32,
    config: Mutex<QueueConfig>,
    region: SharedRegion,
    waitq: Arc<WaitQueue>,
    notifier: Arc<dyn Notifier>,
    reader_claimed: AtomicBool,
    stats: QueueStats,
}

impl Endpoint {
    /// An endpoint whose consumer runs in this process.
    pub fn new(id: u32, config: QueueConfig) -> Self {
        let waitq = Arc::new(WaitQueue::new());
        let notifier: Arc<dyn Notifier> = waitq.clone();
        Self::build(id, config, waitq, notifier)
    }

    /// An endpoint that wakes its consumer through `notifier`, typically a
    /// [`Doorbell`](crate::Doorbell) to another process.
    pub fn with_notifier(id: u32, config: QueueConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self::build(id, config, Arc::new(WaitQueue::new()), notifier)
    }

    fn build(
        id: u32,
        config: QueueConfig,
        waitq: Arc<WaitQueue>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            id,
            config: Mutex::new(config),
            region: SharedRegion::new(),
            waitq,
            notifier,
            reader_claimed: AtomicBool::new(false),
            stats: QueueStats::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> QueueConfig {
        self.config.lock().clone()
    }

    /// Replace the configuration used by the next enable.
    ///
    /// Refused while the queues are published or still draining.
    pub fn reconfigure(&self, config: QueueConfig) -> Result<(), RegionError> {
        let mut current = self.config.lock();
        if matches!(
            self.region.state(),
            RegionState::Published | RegionState::Draining
        ) {
            return Err(RegionError::Busy);
        }
        config.validate()?;
        *current = config;
        Ok(())
    }

    /// Allocate and publish the queues. Returns `Ok(false)` if they already
    /// are.
    pub fn enable(&self, user_addr: Option<NonZeroUsize>) -> Result<bool, RegionError> {
        let config = self.config.lock();
        let enabled = self.region.enable(&config, user_addr)?;
        if enabled {
            tracing::debug!(id = self.id, "endpoint enabled");
        }
        Ok(enabled)
    }

    /// Unpublish and free the queues. Returns `false` if they were not
    /// enabled.
    ///
    /// Never waits on readers or producers: if any is still inside after the
    /// grace period, the last one to leave frees the queues.
    pub fn disable(&self) -> bool {
        let grace = self.config.lock().grace_period;
        let disabled = self.region.disable(grace);
        if disabled {
            tracing::debug!(id = self.id, "endpoint disabled");
        }
        disabled
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.region.state() == RegionState::Published
    }

    /// Enqueue the packets of `batch` selected by `mask`, steered to `gid`.
    pub fn enqueue<P: PacketBuffer>(&self, batch: &[P], mask: u64, gid: u32) -> EnqueueOutcome {
        let Some(guard) = self.region.enter() else {
            let outcome = EnqueueOutcome {
                committed: 0,
                dropped: batch_len(mask, batch.len()),
                fault: false,
            };
            self.stats.record(&outcome);
            return outcome;
        };

        let params = BatchParams {
            caplen: guard.caplen(),
            gid,
            tstamp: guard.tstamp(),
        };
        let wake = WakeCoordinator::new(guard.wake_policy(), &*self.notifier, &self.stats.wake);
        let outcome = enqueue_batch(&guard.rx(), batch, mask, &params, &wake);
        self.stats.record(&outcome);
        outcome
    }

    /// The consumer handle, or `None` while another one is alive.
    pub fn reader(&self) -> Option<RxReader<'_>> {
        self.reader_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let commit_timeout = self.config.lock().commit_timeout;
        Some(RxReader::claimed(
            &self.region,
            &self.waitq,
            commit_timeout,
            &self.reader_claimed,
        ))
    }

    /// Run `f` over tx queue `n` while the region is published.
    pub fn tx_queue<R>(&self, n: usize, f: impl FnOnce(&TxQueue<'_>) -> R) -> Option<R> {
        let guard = self.region.enter()?;
        let tx = guard.tx(n)?;
        Some(f(&tx))
    }

    #[inline]
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    #[inline]
    pub fn wait_queue(&self) -> &WaitQueue {
        &self.waitq
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.disable();
    }
}
