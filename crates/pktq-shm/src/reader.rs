//! Consumer side of the rx queue.
//!
//! The single consumer drains the queue by swapping sub-buffers: it
//! installs `(index + 1, 0)` in the index word, which sends every later
//! reservation to the other sub-buffer, and then reads the frozen one.
//! A reservation taken just before the swap may still be writing, so each
//! slot is waited on until its commit byte carries the frozen index.
//!
//! A slot that never commits in time is skipped as lost, but its producer
//! stays registered on the sub-buffer. The swap that would hand that
//! sub-buffer back to producers waits for it, so a late write can only land
//! in the cycle it reserved.

use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::layout::{RxQueue, SlotHeader};
use crate::region::{RegionGuard, SharedRegion};
use crate::wake::{CancelToken, WaitQueue, WaitResult};

/// Busy-polls of a commit byte or writer count before the reader starts
/// yielding.
const COMMIT_SPINS: u32 = 128;

/// The consumer of one rx queue.
pub struct RxReader<'a> {
    region: &'a SharedRegion,
    waitq: &'a WaitQueue,
    commit_timeout: Duration,
    claim: Option<&'a AtomicBool>,
}

impl<'a> RxReader<'a> {
    pub fn new(region: &'a SharedRegion, waitq: &'a WaitQueue, commit_timeout: Duration) -> Self {
        Self {
            region,
            waitq,
            commit_timeout,
            claim: None,
        }
    }

    /// A reader that releases `claim` when dropped.
    pub(crate) fn claimed(
        region: &'a SharedRegion,
        waitq: &'a WaitQueue,
        commit_timeout: Duration,
        claim: &'a AtomicBool,
    ) -> Self {
        Self {
            region,
            waitq,
            commit_timeout,
            claim: Some(claim),
        }
    }

    /// Swap sub-buffers and return the one just frozen.
    ///
    /// `None` when the region is not published, or when a producer is
    /// still writing into the sub-buffer this swap would hand out after
    /// `commit_timeout`. Nothing is swapped then and a later read retries.
    /// The batch must be dropped before the next read, which would hand its
    /// sub-buffer back to the producers.
    pub fn read(&mut self) -> Option<RxBatch<'_>> {
        let guard = self.region.enter()?;
        let rx = guard.rx_for_region();
        RxBatch::swap(rx, Some(guard), self.commit_timeout)
    }

    /// Slots reserved in the active sub-buffer, capped at its capacity.
    pub fn pending(&self) -> u32 {
        self.region.enter().map_or(0, |guard| {
            let rx = guard.rx();
            rx.index().count().min(rx.size())
        })
    }

    /// Park until something is pending, a producer wakes us, `timeout`
    /// elapses or `cancel` fires.
    pub fn wait(&self, timeout: Duration, cancel: Option<&CancelToken>) -> WaitResult {
        self.waitq
            .wait_until(timeout, cancel, || self.pending() > 0)
    }
}

impl Drop for RxReader<'_> {
    fn drop(&mut self) {
        if let Some(claim) = self.claim {
            claim.store(false, Ordering::Release);
        }
    }
}

/// A frozen sub-buffer.
pub struct RxBatch<'a> {
    _guard: Option<RegionGuard<'a>>,
    rx: RxQueue<'a>,
    index: u8,
    len: u32,
    lost: u32,
    commit_timeout: Duration,
}

impl<'a> RxBatch<'a> {
    /// Swap sub-buffers of a queue mapped by another party.
    ///
    /// The caller must be the queue's only consumer. `None` under the same
    /// stalled-producer condition as [`RxReader::read`].
    pub fn from_queue(rx: RxQueue<'a>, commit_timeout: Duration) -> Option<Self> {
        Self::swap(rx, None, commit_timeout)
    }

    fn swap(
        rx: RxQueue<'a>,
        guard: Option<RegionGuard<'a>>,
        commit_timeout: Duration,
    ) -> Option<Self> {
        // Only this consumer moves the index, so `next` is what the swap
        // below installs.
        let next = rx.index().next().selector();
        if !wait_for(commit_timeout, || rx.writers(next) == 0) {
            tracing::warn!(
                selector = next,
                writers = rx.writers(next),
                "producers still writing into the next sub-buffer, swap postponed"
            );
            return None;
        }

        let prev = rx.header().data.swap_next();
        Some(Self {
            _guard: guard,
            rx,
            index: prev.index(),
            len: prev.count().min(rx.size()),
            lost: 0,
            commit_timeout,
        })
    }

    /// Queue index the frozen slots were committed under.
    #[inline]
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Slots reserved in the frozen sub-buffer.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reserved slots skipped because they were never committed.
    #[inline]
    pub fn lost(&self) -> u32 {
        self.lost
    }

    /// Committed slots, in reservation order.
    pub fn slots(&mut self) -> Slots<'_, 'a> {
        Slots {
            batch: self,
            next: 0,
        }
    }
}

/// Iterator over the committed slots of an [`RxBatch`].
pub struct Slots<'b, 'a> {
    batch: &'b mut RxBatch<'a>,
    next: u32,
}

impl<'b> Iterator for Slots<'b, '_> {
    type Item = SlotView<'b>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.batch.len {
            let n = self.next as usize;
            self.next += 1;

            let rx = &self.batch.rx;
            let selector = (self.batch.index & 1) as usize;
            // SAFETY: `n < len <= size`; the batch guard keeps the region
            // mapped for `'b`.
            let header = unsafe { &*rx.slot_ptr(selector, n) };
            let index = self.batch.index;
            if !wait_for(self.batch.commit_timeout, || header.is_committed(index)) {
                self.batch.lost += 1;
                continue;
            }

            let caplen = (header.caplen as usize).min(rx.payload_capacity());
            let data = unsafe { slice::from_raw_parts(rx.payload_ptr(selector, n), caplen) };
            return Some(SlotView { header, data });
        }
        None
    }
}

/// Spin, then yield, until `ready` or `timeout`.
fn wait_for(timeout: Duration, mut ready: impl FnMut() -> bool) -> bool {
    for _ in 0..COMMIT_SPINS {
        if ready() {
            return true;
        }
        std::hint::spin_loop();
    }

    let deadline = Instant::now() + timeout;
    loop {
        if ready() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::yield_now();
    }
}

/// One committed packet.
pub struct SlotView<'b> {
    header: &'b SlotHeader,
    data: &'b [u8],
}

impl<'b> SlotView<'b> {
    /// Stored payload bytes.
    #[inline]
    pub fn data(&self) -> &'b [u8] {
        self.data
    }

    /// Length of the packet on the wire.
    #[inline]
    pub fn len(&self) -> usize {
        self.header.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.header.len == 0
    }

    #[inline]
    pub fn caplen(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn timestamp(&self) -> Duration {
        self.header.timestamp()
    }

    #[inline]
    pub fn mark(&self) -> u32 {
        self.header.mark
    }

    #[inline]
    pub fn gid(&self) -> u32 {
        self.header.gid
    }

    #[inline]
    pub fn vlan_tci(&self) -> u16 {
        self.header.vlan_tci
    }

    #[inline]
    pub fn if_index(&self) -> u8 {
        self.header.if_index
    }

    #[inline]
    pub fn hw_queue(&self) -> u8 {
        self.header.hw_queue
    }
}

impl std::fmt::Debug for SlotView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotView")
            .field("len", &self.len())
            .field("caplen", &self.caplen())
            .field("mark", &self.mark())
            .field("gid", &self.gid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::enqueue::{enqueue_batch, BatchParams};
    use crate::layout::{PackedIndex, RegionView, SlotMeta, INITIAL_INDEX};
    use crate::packet::{Packet, PacketMeta};
    use crate::wake::{WakeCoordinator, WakePolicy};
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_millis(5);

    fn region(rx_size: u32) -> SharedRegion {
        let region = SharedRegion::new();
        let config = QueueConfig {
            rx_size,
            rx_caplen: 96,
            tx_size: 2,
            tx_max_len: 64,
            ..Default::default()
        };
        region.enable(&config, None).unwrap();
        region
    }

    fn push(region: &SharedRegion, notifier: &WaitQueue, marks: &[u32]) -> u32 {
        let guard = region.enter().unwrap();
        let wakes = AtomicU64::new(0);
        let coord = WakeCoordinator::new(WakePolicy::eager(), notifier, &wakes);
        let batch: Vec<Packet> = marks
            .iter()
            .map(|&mark| {
                Packet::linear(vec![mark as u8; 70]).with_meta(PacketMeta {
                    mark,
                    ..Default::default()
                })
            })
            .collect();
        let params = BatchParams {
            caplen: guard.caplen(),
            gid: 1,
            tstamp: false,
        };
        enqueue_batch(&guard.rx(), &batch, u64::MAX, &params, &coord).committed
    }

    fn drain(reader: &mut RxReader<'_>) -> (Vec<u32>, u32) {
        let mut batch = reader.read().unwrap();
        let marks: Vec<u32> = batch
            .slots()
            .map(|slot| {
                assert!(slot.data().iter().all(|&b| b == slot.mark() as u8));
                slot.mark()
            })
            .collect();
        (marks, batch.lost())
    }

    #[test]
    fn test_read_empty_swaps() {
        let region = region(8);
        let waitq = WaitQueue::new();
        let mut reader = RxReader::new(&region, &waitq, TIMEOUT);

        let batch = reader.read().unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.index(), INITIAL_INDEX);
        drop(batch);

        let rx = region.enter().unwrap().rx().index();
        assert_eq!(rx, PackedIndex::new(INITIAL_INDEX + 1, 0));
    }

    #[test]
    fn test_read_alternates_sub_buffers() {
        let region = region(8);
        let waitq = WaitQueue::new();
        let mut reader = RxReader::new(&region, &waitq, TIMEOUT);

        push(&region, &waitq, &[1, 2, 3]);
        assert_eq!(reader.pending(), 3);
        assert_eq!(drain(&mut reader), (vec![1, 2, 3], 0));
        assert_eq!(reader.pending(), 0);

        push(&region, &waitq, &[4, 5]);
        let batch = reader.read().unwrap();
        assert_eq!(batch.index(), INITIAL_INDEX + 1);
        assert_eq!(batch.len(), 2);
        drop(batch);

        push(&region, &waitq, &[6]);
        assert_eq!(drain(&mut reader), (vec![6], 0));
    }

    #[test]
    fn test_read_caps_at_capacity() {
        let region = region(4);
        let waitq = WaitQueue::new();
        let mut reader = RxReader::new(&region, &waitq, TIMEOUT);

        assert_eq!(push(&region, &waitq, &[1, 2, 3, 4, 5, 6]), 4);
        let (marks, lost) = drain(&mut reader);
        assert_eq!(marks, vec![1, 2, 3, 4]);
        assert_eq!(lost, 0);
    }

    #[test]
    fn test_uncommitted_slots_are_lost() {
        let region = region(8);
        let waitq = WaitQueue::new();
        let mut reader = RxReader::new(&region, &waitq, TIMEOUT);

        push(&region, &waitq, &[1]);
        // A producer that reserved and never committed.
        region.enter().unwrap().rx().header().data.reserve(2);
        push(&region, &waitq, &[4]);

        let (marks, lost) = drain(&mut reader);
        assert_eq!(marks, vec![1, 4]);
        assert_eq!(lost, 2);
    }

    #[test]
    fn test_late_writer_cannot_tear_next_cycle() {
        let region = region(4);
        let waitq = WaitQueue::new();
        let mut reader = RxReader::new(&region, &waitq, TIMEOUT);
        let guard = region.enter().unwrap();
        let rx = guard.rx();

        // A producer that reserved a slot and stalls before writing it.
        let (prev, stalled) = rx.begin_write(1).unwrap();
        assert_eq!(prev, PackedIndex::new(INITIAL_INDEX, 0));
        assert_eq!(drain(&mut reader), (vec![], 1));

        // Its sub-buffer is next in line and must not be handed out yet.
        push(&region, &waitq, &[0x11]);
        assert!(reader.read().is_none());
        assert_eq!(rx.index(), PackedIndex::new(INITIAL_INDEX + 1, 1));

        // The late write lands in the cycle it reserved.
        let slot = prev.count() as usize;
        unsafe {
            rx.payload_ptr(prev.selector(), slot).write_bytes(0xee, 70);
            let hdr = rx.slot_ptr(prev.selector(), slot);
            SlotHeader::write_meta(
                hdr,
                &SlotMeta {
                    mark: 0xee,
                    len: 70,
                    caplen: 70,
                    ..Default::default()
                },
            );
            SlotHeader::commit(hdr, prev.index());
        }
        drop(stalled);

        assert_eq!(drain(&mut reader), (vec![0x11], 0));
        push(&region, &waitq, &[0x22]);
        // `drain` checks every payload byte against the mark.
        assert_eq!(drain(&mut reader), (vec![0x22], 0));
    }

    #[test]
    fn test_stale_slots_never_reappear() {
        let region = region(4);
        let waitq = WaitQueue::new();
        let mut reader = RxReader::new(&region, &waitq, TIMEOUT);

        // Fill both sub-buffers once, then cycle the index through a full
        // wrap with smaller batches.
        for round in 0..300u32 {
            let n = if round < 2 { 4 } else { (round % 3) as usize };
            let marks: Vec<u32> = (0..n as u32).map(|i| round * 4 + i).collect();
            push(&region, &waitq, &marks);
            let (got, lost) = drain(&mut reader);
            assert_eq!(got, marks, "round {}", round);
            assert_eq!(lost, 0);
        }
    }

    #[test]
    fn test_read_after_disable() {
        let region = region(4);
        let waitq = WaitQueue::new();
        let mut reader = RxReader::new(&region, &waitq, TIMEOUT);
        region.disable(Duration::ZERO);
        assert!(reader.read().is_none());
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn test_wait_wakes_on_commit() {
        let region = Arc::new(region(16));
        let waitq = Arc::new(WaitQueue::new());

        let producer = {
            let region = region.clone();
            let waitq = waitq.clone();
            thread::spawn(move || {
                while waitq.waiters() == 0 {
                    thread::yield_now();
                }
                push(&region, &waitq, &[9])
            })
        };

        let mut reader = RxReader::new(&region, &waitq, TIMEOUT);
        let result = reader.wait(Duration::from_secs(5), None);
        assert!(matches!(result, WaitResult::Woken | WaitResult::Ready));
        assert_eq!(producer.join().unwrap(), 1);
        assert_eq!(drain(&mut reader), (vec![9], 0));
    }

    #[test]
    fn test_wait_times_out_when_idle() {
        let region = region(4);
        let waitq = WaitQueue::new();
        let reader = RxReader::new(&region, &waitq, TIMEOUT);
        assert_eq!(
            reader.wait(Duration::from_millis(10), None),
            WaitResult::TimedOut
        );
    }

    #[test]
    fn test_companion_reads_through_region_view() {
        let region = region(8);
        let waitq = WaitQueue::new();
        push(&region, &waitq, &[7, 8]);

        let (base, len) = region.mapping().unwrap();
        let view = unsafe { RegionView::from_raw(base as *mut u8, len).unwrap() };
        assert_eq!(view.geometry(), region.geometry().unwrap());

        let mut batch = RxBatch::from_queue(view.rx(), TIMEOUT).unwrap();
        let marks: Vec<u32> = batch.slots().map(|s| s.mark()).collect();
        assert_eq!(marks, vec![7, 8]);
    }
}
