//! Multi-producer disjoint-buffer enqueue.
//!
//! Any number of producers append into the active rx sub-buffer at once.
//! Each batch costs one `fetch_add` on the index word, which hands the
//! producer a private range of slots; after that every slot is filled
//! without further coordination and published by a release store of its
//! commit byte.

use std::slice;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CopyError;
use crate::layout::{RxQueue, SlotHeader, SlotMeta, COPY_BLOCK, VLAN_TAG_PRESENT};
use crate::packet::{batch_len, selected, PacketBuffer};
use crate::wake::WakeCoordinator;

/// What happened to one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// Slots published to the consumer.
    pub committed: u32,
    /// Selected packets that were not published.
    pub dropped: u32,
    /// A packet copy failed and the batch was abandoned.
    pub fault: bool,
}

impl EnqueueOutcome {
    fn rejected(total: u32) -> Self {
        Self {
            committed: 0,
            dropped: total,
            fault: false,
        }
    }
}

/// Per-batch producer parameters.
#[derive(Debug, Clone, Copy)]
pub struct BatchParams {
    /// Maximum payload bytes stored per packet.
    pub caplen: usize,
    /// Group the batch was steered to.
    pub gid: u32,
    /// Store timestamps in slot headers.
    pub tstamp: bool,
}

/// Append the packets of `batch` selected by `mask` to the rx queue.
///
/// At most `rx.size()` slots are committed per sub-buffer cycle. A batch
/// that runs past the end stops there, wakes the consumer and reports the
/// rest as dropped. Nothing is reserved when the queue is already full.
///
/// A failed payload copy abandons the batch and reports it as a whole:
/// `committed` is zero and every selected packet is `dropped`, even though
/// slots published before the fault stay readable.
pub fn enqueue_batch<P: PacketBuffer>(
    rx: &RxQueue<'_>,
    batch: &[P],
    mask: u64,
    params: &BatchParams,
    wake: &WakeCoordinator<'_>,
) -> EnqueueOutcome {
    let total = batch_len(mask, batch.len());
    if total == 0 {
        return EnqueueOutcome::default();
    }

    let size = rx.size();
    if rx.index().count() >= size {
        return EnqueueOutcome::rejected(total);
    }

    let Some((prev, _writer)) = rx.begin_write(total) else {
        tracing::debug!(total, "sub-buffer frozen before registration, batch lost");
        return EnqueueOutcome::rejected(total);
    };
    let index = prev.index();
    let selector = prev.selector();
    let capacity = rx.payload_capacity();
    let caplen = params.caplen.min(capacity);

    let mut offset = prev.count();
    let mut committed = 0;

    for n in selected(mask, batch.len()) {
        if offset >= size {
            wake.on_overflow();
            return EnqueueOutcome {
                committed,
                dropped: total - committed,
                fault: false,
            };
        }

        let pkt = &batch[n];
        let bytes = pkt.len().min(caplen);

        // SAFETY: `offset < size`, the reservation gives this producer
        // exclusive use of the slot and `_writer` keeps the consumer from
        // handing the sub-buffer out again before we are done.
        let (hdr, dst) = unsafe {
            let slot = offset as usize;
            (
                rx.slot_ptr(selector, slot),
                slice::from_raw_parts_mut(rx.payload_ptr(selector, slot), capacity),
            )
        };

        if let Err(err) = copy_payload(pkt, dst, bytes) {
            tracing::warn!(
                %err,
                len = pkt.len(),
                bytes,
                published = committed,
                "packet copy failed, abandoning batch"
            );
            return EnqueueOutcome {
                committed: 0,
                dropped: total,
                fault: true,
            };
        }

        let meta = SlotMeta {
            tstamp: params.tstamp.then(|| capture_time(pkt)).flatten(),
            mark: pkt.mark(),
            gid: params.gid,
            len: pkt.len().min(u16::MAX as usize) as u16,
            caplen: bytes as u16,
            vlan_tci: pkt.vlan_tci() & !VLAN_TAG_PRESENT,
            if_index: (pkt.if_index() & 0xff) as u8,
            hw_queue: (pkt.rx_queue() & 0xff) as u8,
        };

        unsafe {
            SlotHeader::write_meta(hdr, &meta);
            SlotHeader::commit(hdr, index);
        }
        committed += 1;

        wake.on_commit(offset);
        offset += 1;
    }

    EnqueueOutcome {
        committed,
        dropped: 0,
        fault: false,
    }
}

/// Copy `bytes` of payload into `dst`.
///
/// Short linear payloads are copied as one fixed block when both sides have
/// room for it; the bytes past `bytes` are never read by the consumer.
fn copy_payload<P: PacketBuffer>(pkt: &P, dst: &mut [u8], bytes: usize) -> Result<(), CopyError> {
    match pkt.linear_data() {
        Some(data) => {
            let n = if bytes < COPY_BLOCK && data.len() >= COPY_BLOCK && dst.len() >= COPY_BLOCK {
                COPY_BLOCK
            } else {
                bytes
            };
            let src = data.get(..n).ok_or(CopyError::Short {
                wanted: n,
                available: data.len(),
            })?;
            dst[..n].copy_from_slice(src);
            Ok(())
        }
        None => pkt.copy_bits(0, &mut dst[..bytes]),
    }
}

fn capture_time<P: PacketBuffer>(pkt: &P) -> Option<std::time::Duration> {
    pkt.timestamp()
        .or_else(|| SystemTime::now().duration_since(UNIX_EPOCH).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::layout::{PackedIndex, INITIAL_INDEX};
    use crate::packet::{Packet, PacketMeta};
    use crate::region::SharedRegion;
    use crate::wake::{Notifier, WakePolicy};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    struct Recorder {
        woken: AtomicUsize,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                woken: AtomicUsize::new(0),
            }
        }
    }

    impl Notifier for Recorder {
        fn has_waiters(&self) -> bool {
            true
        }

        fn wake(&self) {
            self.woken.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn region(rx_size: u32, caplen: u32) -> SharedRegion {
        let region = SharedRegion::new();
        let config = QueueConfig {
            rx_size,
            rx_caplen: caplen,
            tx_size: 2,
            tx_max_len: 64,
            ..Default::default()
        };
        region.enable(&config, None).unwrap();
        region
    }

    fn params(caplen: usize) -> BatchParams {
        BatchParams {
            caplen,
            gid: 7,
            tstamp: false,
        }
    }

    fn slot<'a>(rx: &RxQueue<'a>, selector: usize, n: usize) -> &'a SlotHeader {
        unsafe { &*rx.slot_ptr(selector, n) }
    }

    fn payload<'a>(rx: &RxQueue<'a>, selector: usize, n: usize, len: usize) -> &'a [u8] {
        unsafe { slice::from_raw_parts(rx.payload_ptr(selector, n), len) }
    }

    #[test]
    fn test_commits_batch_in_order() {
        let region = region(8, 96);
        let guard = region.enter().unwrap();
        let rx = guard.rx();
        let notifier = Recorder::new();
        let wakes = AtomicU64::new(0);
        let coord = WakeCoordinator::new(WakePolicy::new(8192), &notifier, &wakes);

        let batch: Vec<Packet> = (0..3u8)
            .map(|i| {
                Packet::linear(vec![i; 70]).with_meta(PacketMeta {
                    if_index: 0x102,
                    rx_queue: 3,
                    vlan_tci: VLAN_TAG_PRESENT | 42,
                    mark: 100 + i as u32,
                    timestamp: None,
                })
            })
            .collect();

        let out = enqueue_batch(&rx, &batch, u64::MAX, &params(96), &coord);
        assert_eq!(
            out,
            EnqueueOutcome {
                committed: 3,
                dropped: 0,
                fault: false
            }
        );
        assert_eq!(rx.index(), PackedIndex::new(INITIAL_INDEX, 3));

        for i in 0..3 {
            let hdr = slot(&rx, 1, i);
            assert!(hdr.is_committed(INITIAL_INDEX));
            assert_eq!(hdr.len, 70);
            assert_eq!(hdr.caplen, 70);
            assert_eq!(hdr.gid, 7);
            assert_eq!(hdr.mark, 100 + i as u32);
            assert_eq!(hdr.vlan_tci, 42);
            assert_eq!(hdr.if_index, 0x02);
            assert_eq!(hdr.hw_queue, 3);
            assert_eq!(hdr.timestamp(), Duration::ZERO);
            assert!(payload(&rx, 1, i, 70).iter().all(|&b| b == i as u8));
        }
        // The other sub-buffer is untouched.
        assert!(!slot(&rx, 0, 0).is_committed(INITIAL_INDEX));
        // Offset 0 lands on the wake interval.
        assert_eq!(wakes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_batch_overflows_capacity() {
        let region = region(4, 96);
        let guard = region.enter().unwrap();
        let rx = guard.rx();
        assert_eq!(rx.slot_size(), 128);
        let notifier = Recorder::new();
        let wakes = AtomicU64::new(0);
        let coord = WakeCoordinator::new(WakePolicy::new(8192), &notifier, &wakes);

        let batch: Vec<Packet> = (0..6u8).map(|i| Packet::linear(vec![i; 60])).collect();
        let out = enqueue_batch(&rx, &batch, u64::MAX, &params(96), &coord);

        assert_eq!(out.committed, 4);
        assert_eq!(out.dropped, 2);
        assert!(!out.fault);
        for i in 0..4 {
            assert!(slot(&rx, 1, i).is_committed(INITIAL_INDEX));
            assert_eq!(payload(&rx, 1, i, 60)[0], i as u8);
        }
        // Periodic wake at offset 0 plus the overflow wake at the 5th packet.
        assert_eq!(notifier.woken.load(Ordering::Relaxed), 2);
        assert_eq!(rx.writers(1), 0);
    }

    #[test]
    fn test_full_queue_rejects_without_reserving() {
        let region = region(4, 96);
        let guard = region.enter().unwrap();
        let rx = guard.rx();
        let notifier = Recorder::new();
        let wakes = AtomicU64::new(0);
        let coord = WakeCoordinator::new(WakePolicy::new(8192), &notifier, &wakes);

        let batch: Vec<Packet> = (0..4u8).map(|i| Packet::linear(vec![i; 60])).collect();
        assert_eq!(
            enqueue_batch(&rx, &batch, u64::MAX, &params(96), &coord).committed,
            4
        );

        let before = rx.index();
        let out = enqueue_batch(&rx, &batch[..2], u64::MAX, &params(96), &coord);
        assert_eq!(out, EnqueueOutcome::rejected(2));
        assert_eq!(rx.index(), before);
    }

    #[test]
    fn test_empty_mask_is_noop() {
        let region = region(4, 96);
        let guard = region.enter().unwrap();
        let rx = guard.rx();
        let notifier = Recorder::new();
        let wakes = AtomicU64::new(0);
        let coord = WakeCoordinator::new(WakePolicy::eager(), &notifier, &wakes);

        let batch = vec![Packet::linear(vec![1; 10])];
        let out = enqueue_batch(&rx, &batch, 0, &params(96), &coord);
        assert_eq!(out, EnqueueOutcome::default());
        assert_eq!(rx.index().count(), 0);
        assert_eq!(wakes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_sparse_mask() {
        let region = region(8, 96);
        let guard = region.enter().unwrap();
        let rx = guard.rx();
        let notifier = Recorder::new();
        let wakes = AtomicU64::new(0);
        let coord = WakeCoordinator::new(WakePolicy::new(8192), &notifier, &wakes);

        let batch: Vec<Packet> = (0..4u8).map(|i| Packet::linear(vec![i; 80])).collect();
        let out = enqueue_batch(&rx, &batch, 0b1010, &params(96), &coord);
        assert_eq!(out.committed, 2);
        assert_eq!(rx.index().count(), 2);
        assert_eq!(payload(&rx, 1, 0, 80)[0], 1);
        assert_eq!(payload(&rx, 1, 1, 80)[0], 3);
    }

    #[test]
    fn test_caplen_truncates() {
        let region = region(4, 96);
        let guard = region.enter().unwrap();
        let rx = guard.rx();
        let notifier = Recorder::new();
        let wakes = AtomicU64::new(0);
        let coord = WakeCoordinator::new(WakePolicy::new(8192), &notifier, &wakes);

        let bytes: Vec<u8> = (0..200u8).collect();
        let batch = vec![Packet::linear(bytes.clone())];
        enqueue_batch(&rx, &batch, 1, &params(96), &coord);

        let hdr = slot(&rx, 1, 0);
        assert_eq!(hdr.len, 200);
        assert_eq!(hdr.caplen, 96);
        assert_eq!(payload(&rx, 1, 0, 96), &bytes[..96]);
    }

    #[test]
    fn test_short_linear_copies_fixed_block() {
        let region = region(4, 96);
        let guard = region.enter().unwrap();
        let rx = guard.rx();
        let notifier = Recorder::new();
        let wakes = AtomicU64::new(0);
        let coord = WakeCoordinator::new(WakePolicy::new(8192), &notifier, &wakes);

        let capacity = rx.payload_capacity();
        for n in 0..2 {
            unsafe { std::ptr::write_bytes(rx.payload_ptr(1, n), 0xaa, capacity) };
        }

        // 10 bytes + 54 tailroom: one 64-byte block.
        // 10 bytes, no tailroom: exactly 10 bytes.
        let batch = vec![
            Packet::with_tailroom(&[1; 10], 54),
            Packet::linear(vec![2; 10]),
        ];
        enqueue_batch(&rx, &batch, u64::MAX, &params(96), &coord);

        let with_tail = payload(&rx, 1, 0, capacity);
        assert!(with_tail[..10].iter().all(|&b| b == 1));
        assert!(with_tail[10..COPY_BLOCK].iter().all(|&b| b == 0));
        assert!(with_tail[COPY_BLOCK..].iter().all(|&b| b == 0xaa));
        assert_eq!(slot(&rx, 1, 0).caplen, 10);

        let exact = payload(&rx, 1, 1, capacity);
        assert!(exact[..10].iter().all(|&b| b == 2));
        assert!(exact[10..].iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn test_fragmented_payload() {
        let region = region(4, 96);
        let guard = region.enter().unwrap();
        let rx = guard.rx();
        let notifier = Recorder::new();
        let wakes = AtomicU64::new(0);
        let coord = WakeCoordinator::new(WakePolicy::new(8192), &notifier, &wakes);

        let batch = vec![Packet::fragmented(vec![vec![1; 30], vec![2; 30], vec![3; 30]])];
        enqueue_batch(&rx, &batch, 1, &params(96), &coord);

        let data = payload(&rx, 1, 0, 90);
        assert!(data[..30].iter().all(|&b| b == 1));
        assert!(data[30..60].iter().all(|&b| b == 2));
        assert!(data[60..].iter().all(|&b| b == 3));
        assert_eq!(slot(&rx, 1, 0).caplen, 90);
    }

    #[test]
    fn test_copy_fault_abandons_rest_of_batch() {
        let region = region(8, 96);
        let guard = region.enter().unwrap();
        let rx = guard.rx();
        let notifier = Recorder::new();
        let wakes = AtomicU64::new(0);
        let coord = WakeCoordinator::new(WakePolicy::new(8192), &notifier, &wakes);

        let batch = vec![
            Packet::linear(vec![1; 40]),
            Packet::fragmented(vec![vec![0; 10]]).with_declared_len(40),
            Packet::linear(vec![3; 40]),
        ];
        let out = enqueue_batch(&rx, &batch, u64::MAX, &params(96), &coord);
        assert_eq!(
            out,
            EnqueueOutcome {
                committed: 0,
                dropped: 3,
                fault: true
            }
        );
        // Published before the fault, but not reported.
        assert!(slot(&rx, 1, 0).is_committed(INITIAL_INDEX));
        assert!(!slot(&rx, 1, 1).is_committed(INITIAL_INDEX));
        assert!(!slot(&rx, 1, 2).is_committed(INITIAL_INDEX));        assert_eq!(rx.writers(1), 0);
    }

    #[test]
    fn test_timestamps_only_when_enabled() {
        let region = region(4, 96);
        let guard = region.enter().unwrap();
        let rx = guard.rx();
        let notifier = Recorder::new();
        let wakes = AtomicU64::new(0);
        let coord = WakeCoordinator::new(WakePolicy::new(8192), &notifier, &wakes);

        let stamp = Duration::new(1_700_000_000, 123);
        let batch = vec![Packet::linear(vec![0; 20]).with_meta(PacketMeta {
            timestamp: Some(stamp),
            ..Default::default()
        })];

        enqueue_batch(&rx, &batch, 1, &params(96), &coord);
        assert_eq!(slot(&rx, 1, 0).timestamp(), Duration::ZERO);

        let with_ts = BatchParams {
            tstamp: true,
            ..params(96)
        };
        enqueue_batch(&rx, &batch, 1, &with_ts, &coord);
        assert_eq!(slot(&rx, 1, 1).timestamp(), stamp);
    }

    #[test]
    fn test_periodic_wake_interval() {
        let region = region(64, 32);
        let guard = region.enter().unwrap();
        let rx = guard.rx();
        let notifier = Recorder::new();
        let wakes = AtomicU64::new(0);
        let coord = WakeCoordinator::new(WakePolicy::new(16), &notifier, &wakes);

        let batch: Vec<Packet> = (0..8u8).map(|i| Packet::linear(vec![i; 8])).collect();
        for _ in 0..8 {
            enqueue_batch(&rx, &batch, u64::MAX, &params(32), &coord);
        }
        // Offsets 0, 16, 32, 48.
        assert_eq!(wakes.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_two_producers_share_small_queue() {
        let region = Arc::new(region(4, 96));
        let mut handles = Vec::new();
        for t in 0..2u8 {
            let region = region.clone();
            handles.push(thread::spawn(move || {
                let guard = region.enter().unwrap();
                let rx = guard.rx();
                let notifier = Recorder::new();
                let wakes = AtomicU64::new(0);
                let coord = WakeCoordinator::new(WakePolicy::new(8192), &notifier, &wakes);
                let batch: Vec<Packet> = (0..3).map(|_| Packet::linear(vec![t; 64])).collect();
                enqueue_batch(&rx, &batch, u64::MAX, &params(96), &coord).committed
            }));
        }
        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(total <= 4);

        let guard = region.enter().unwrap();
        let rx = guard.rx();
        let committed = (0..4)
            .filter(|&i| slot(&rx, 1, i).is_committed(INITIAL_INDEX))
            .count();
        assert_eq!(committed as u32, total);
    }

    #[test]
    fn test_concurrent_producers_never_tear_slots() {
        const THREADS: usize = 8;
        const BATCHES: usize = 16;
        const BATCH: usize = 8;
        let size = (THREADS * BATCHES * BATCH) as u32;
        let region = Arc::new(region(size, 128));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let region = region.clone();
                thread::spawn(move || {
                    let guard = region.enter().unwrap();
                    let rx = guard.rx();
                    let notifier = Recorder::new();
                    let wakes = AtomicU64::new(0);
                    let coord = WakeCoordinator::new(WakePolicy::new(64), &notifier, &wakes);
                    let mut committed = 0;
                    for b in 0..BATCHES {
                        let batch: Vec<Packet> = (0..BATCH)
                            .map(|i| {
                                let tag = ((t * BATCHES + b) * BATCH + i) as u32;
                                Packet::linear(vec![tag as u8; 100]).with_meta(PacketMeta {
                                    mark: tag,
                                    ..Default::default()
                                })
                            })
                            .collect();
                        committed +=
                            enqueue_batch(&rx, &batch, u64::MAX, &params(128), &coord).committed;
                    }
                    committed
                })
            })
            .collect();

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, size);

        let guard = region.enter().unwrap();
        let rx = guard.rx();
        let mut seen = vec![false; size as usize];
        for i in 0..size as usize {
            let hdr = slot(&rx, 1, i);
            assert!(hdr.is_committed(INITIAL_INDEX));
            let tag = hdr.mark as usize;
            assert!(!seen[tag], "packet {} stored twice", tag);
            seen[tag] = true;
            let data = payload(&rx, 1, i, 100);
            assert!(data.iter().all(|&b| b == tag as u8), "torn slot {}", i);
        }
        assert!(seen.iter().all(|&s| s));
    }
}
