//! pktq-testkit: Conformance scenarios for pktq region backings.
//!
//! Provides the `BackingFactory` trait and shared scenarios that every way of
//! backing a queue region must pass.
//!
//! # Usage
//!
//! Each backing implements `BackingFactory` and runs the shared scenarios:
//!
//! ```ignore
//! use pktq_testkit::{BackingFactory, TestError};
//!
//! struct AnonymousFactory;
//!
//! impl BackingFactory for AnonymousFactory {
//!     type Guard = ();
//!
//!     fn configure(base: QueueConfig) -> Result<(QueueConfig, ()), TestError> {
//!         Ok((base, ()))
//!     }
//! }
//!
//! #[test]
//! fn anonymous_batch_overflow() {
//!     pktq_testkit::run_batch_overflow::<AnonymousFactory>();
//! }
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use pktq_shm::{
    Endpoint, Packet, PacketMeta, QueueConfig, RegionError, RegionState, RxReader,
};

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Endpoint creation failed.
    Setup(String),
    /// Enabling the region failed.
    Region(RegionError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Region(e) => write!(f, "region error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<RegionError> for TestError {
    fn from(e: RegionError) -> Self {
        TestError::Region(e)
    }
}

/// Factory trait for backing a region under test.
pub trait BackingFactory {
    /// Whatever must outlive the endpoint (a temporary directory, say).
    type Guard;

    /// Point `base` at this backing.
    fn configure(base: QueueConfig) -> Result<(QueueConfig, Self::Guard), TestError>;
}

fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<(), TestError> {
    if cond {
        Ok(())
    } else {
        Err(TestError::Assertion(msg()))
    }
}

fn small_config(rx_size: u32) -> QueueConfig {
    QueueConfig {
        rx_size,
        rx_caplen: 96,
        tx_size: 4,
        tx_max_len: 128,
        grace_period: Duration::from_millis(1),
        commit_timeout: Duration::from_millis(50),
        ..Default::default()
    }
}

fn endpoint<F: BackingFactory>(base: QueueConfig) -> Result<(F::Guard, Endpoint), TestError> {
    let (config, guard) = F::configure(base)?;
    let ep = Endpoint::new(0, config);
    if !ep.enable(None)? {
        return Err(TestError::Setup("fresh endpoint was already enabled".into()));
    }
    Ok((guard, ep))
}

fn tagged(tag: u32, len: usize) -> Packet {
    Packet::linear(vec![tag as u8; len]).with_meta(PacketMeta {
        mark: tag,
        ..Default::default()
    })
}

fn reader(ep: &Endpoint) -> Result<RxReader<'_>, TestError> {
    ep.reader()
        .ok_or_else(|| TestError::Setup("reader already claimed".into()))
}

/// Drain one sub-buffer; returns the marks read and the slots lost.
fn drain(reader: &mut RxReader<'_>) -> Result<(Vec<u32>, u32), TestError> {
    let mut batch = reader
        .read()
        .ok_or_else(|| TestError::Assertion("no batch: region unpublished or swap postponed".into()))?;
    let mut marks = Vec::with_capacity(batch.len() as usize);
    for slot in batch.slots() {
        let tag = slot.mark() as u8;
        ensure(slot.data().iter().all(|&b| b == tag), || {
            format!("torn payload in packet {}", slot.mark())
        })?;
        marks.push(slot.mark());
    }
    Ok((marks, batch.lost()))
}

// ============================================================================
// Test scenarios
// ============================================================================

/// Enable, double enable, disable, double disable, re-enable.
pub fn run_enable_disable_roundtrip<F: BackingFactory>() {
    if let Err(e) = run_enable_disable_roundtrip_inner::<F>() {
        panic!("run_enable_disable_roundtrip failed: {}", e);
    }
}

fn run_enable_disable_roundtrip_inner<F: BackingFactory>() -> Result<(), TestError> {
    let (_guard, ep) = endpoint::<F>(small_config(8))?;

    ensure(!ep.enable(None)?, || "second enable was not a no-op".into())?;
    ensure(ep.region().state() == RegionState::Published, || {
        "region not published after enable".into()
    })?;

    ensure(ep.disable(), || "disable reported nothing to do".into())?;
    ensure(!ep.disable(), || "second disable was not a no-op".into())?;
    ensure(ep.region().state() == RegionState::Freed, || {
        "region not freed after disable".into()
    })?;
    ensure(ep.region().mapping().is_none(), || {
        "mapping survived disable".into()
    })?;

    ensure(ep.enable(None)?, || "re-enable did nothing".into())?;
    let out = ep.enqueue(&[tagged(1, 60)], 1, 0);
    ensure(out.committed == 1, || format!("re-enabled enqueue: {:?}", out))?;
    Ok(())
}

/// Capacity 4, slot size 128, a batch of 6: the first 4 are committed.
pub fn run_batch_overflow<F: BackingFactory>() {
    if let Err(e) = run_batch_overflow_inner::<F>() {
        panic!("run_batch_overflow failed: {}", e);
    }
}

fn run_batch_overflow_inner<F: BackingFactory>() -> Result<(), TestError> {
    let (_guard, ep) = endpoint::<F>(small_config(4))?;
    let geometry = ep
        .region()
        .geometry()
        .ok_or_else(|| TestError::Setup("no geometry".into()))?;
    ensure(geometry.rx_slot_size == 128, || {
        format!("slot size {}", geometry.rx_slot_size)
    })?;

    let batch: Vec<Packet> = (0..6).map(|t| tagged(t, 60)).collect();
    let out = ep.enqueue(&batch, u64::MAX, 0);
    ensure(out.committed == 4 && out.dropped == 2, || {
        format!("expected 4 committed, 2 dropped, got {:?}", out)
    })?;

    // Full now: nothing is reserved.
    let out = ep.enqueue(&batch[..1], 1, 0);
    ensure(out.committed == 0 && out.dropped == 1, || {
        format!("full queue accepted {:?}", out)
    })?;

    let mut reader = reader(&ep)?;
    let (marks, lost) = drain(&mut reader)?;
    ensure(marks == vec![0, 1, 2, 3], || format!("read {:?}", marks))?;
    ensure(lost == 0, || format!("{} slots lost", lost))?;
    Ok(())
}

/// Two producers, batches of 3, capacity 4: at most 4 land, no overlap.
pub fn run_two_producers_small_queue<F: BackingFactory>() {
    if let Err(e) = run_two_producers_small_queue_inner::<F>() {
        panic!("run_two_producers_small_queue failed: {}", e);
    }
}

fn run_two_producers_small_queue_inner<F: BackingFactory>() -> Result<(), TestError> {
    let (_guard, ep) = endpoint::<F>(small_config(4))?;

    let committed: u32 = thread::scope(|s| {
        let handles: Vec<_> = (0..2u32)
            .map(|p| {
                let ep = &ep;
                s.spawn(move || {
                    let batch: Vec<Packet> = (0..3).map(|i| tagged(p * 3 + i, 70)).collect();
                    ep.enqueue(&batch, u64::MAX, 0).committed
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap_or(0)).sum()
    });
    ensure(committed <= 4, || format!("{} committed into 4 slots", committed))?;

    let mut reader = reader(&ep)?;
    let (marks, lost) = drain(&mut reader)?;
    ensure(marks.len() as u32 == committed, || {
        format!("read {} of {} committed", marks.len(), committed)
    })?;
    let unique: HashSet<u32> = marks.iter().copied().collect();
    ensure(unique.len() == marks.len(), || format!("duplicates in {:?}", marks))?;
    ensure(lost == 0, || format!("{} slots lost", lost))?;
    Ok(())
}

/// Many producers and a live consumer: every committed packet is read
/// exactly once and never torn.
pub fn run_concurrent_producers_consumer<F: BackingFactory>() {
    if let Err(e) = run_concurrent_producers_consumer_inner::<F>() {
        panic!("run_concurrent_producers_consumer failed: {}", e);
    }
}

fn run_concurrent_producers_consumer_inner<F: BackingFactory>() -> Result<(), TestError> {
    const PRODUCERS: u32 = 4;
    const BATCHES: u32 = 200;
    const BATCH: u32 = 8;

    let (_guard, ep) = endpoint::<F>(QueueConfig {
        wake_interval: 16,
        commit_timeout: Duration::from_secs(1),
        ..small_config(256)
    })?;
    let done = AtomicBool::new(false);

    let (seen, lost) = thread::scope(|s| -> Result<(HashSet<u32>, u32), TestError> {
        for p in 0..PRODUCERS {
            let ep = &ep;
            s.spawn(move || {
                for b in 0..BATCHES {
                    let batch: Vec<Packet> = (0..BATCH)
                        .map(|i| tagged((p * BATCHES + b) * BATCH + i, 80))
                        .collect();
                    ep.enqueue(&batch, u64::MAX, p);
                }
            });
        }

        let consumer = s.spawn(|| -> Result<(HashSet<u32>, u32), TestError> {
            let mut reader = reader(&ep)?;
            let mut seen = HashSet::new();
            let mut lost = 0;
            loop {
                let finished = done.load(Ordering::Acquire);
                let (marks, l) = drain(&mut reader)?;
                lost += l;
                for mark in marks {
                    ensure(seen.insert(mark), || format!("packet {} read twice", mark))?;
                }
                if finished {
                    return Ok((seen, lost));
                }
                reader.wait(Duration::from_millis(1), None);
            }
        });

        // Every packet ends up counted exactly once, committed or lost.
        let total = (PRODUCERS * BATCHES * BATCH) as u64;
        loop {
            let stats = ep.stats();
            if stats.recv + stats.lost >= total {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        done.store(true, Ordering::Release);

        consumer
            .join()
            .map_err(|_| TestError::Setup("consumer panicked".into()))?
    })?;

    let stats = ep.stats();
    ensure(lost == 0, || format!("{} reserved slots never committed", lost))?;
    ensure(seen.len() as u64 == stats.recv, || {
        format!("read {} packets, {} committed", seen.len(), stats.recv)
    })?;
    ensure(stats.fault == 0, || "unexpected copy fault".into())?;
    tracing::debug!(recv = stats.recv, lost = stats.lost, "concurrent scenario done");
    Ok(())
}

/// Slots from earlier cycles of a sub-buffer never show up again, across a
/// full wrap of the 8-bit queue index.
pub fn run_stale_slots_invisible<F: BackingFactory>() {
    if let Err(e) = run_stale_slots_invisible_inner::<F>() {
        panic!("run_stale_slots_invisible failed: {}", e);
    }
}

fn run_stale_slots_invisible_inner<F: BackingFactory>() -> Result<(), TestError> {
    let (_guard, ep) = endpoint::<F>(small_config(4))?;
    let mut reader = reader(&ep)?;

    for round in 0..600u32 {
        let n = if round < 2 { 4 } else { round % 4 };
        let batch: Vec<Packet> = (0..n).map(|i| tagged(round * 4 + i, 64)).collect();
        ep.enqueue(&batch, u64::MAX, 0);

        let (marks, lost) = drain(&mut reader)?;
        let expected: Vec<u32> = (0..n).map(|i| round * 4 + i).collect();
        ensure(marks == expected, || {
            format!("round {}: expected {:?}, read {:?}", round, expected, marks)
        })?;
        ensure(lost == 0, || format!("round {}: {} lost", round, lost))?;
    }
    Ok(())
}

/// Slot headers carry the packet's metadata.
pub fn run_metadata_preserved<F: BackingFactory>() {
    if let Err(e) = run_metadata_preserved_inner::<F>() {
        panic!("run_metadata_preserved failed: {}", e);
    }
}

fn run_metadata_preserved_inner<F: BackingFactory>() -> Result<(), TestError> {
    let (_guard, ep) = endpoint::<F>(QueueConfig {
        tstamp: true,
        ..small_config(8)
    })?;

    let stamp = Duration::new(1_700_000_000, 42);
    let pkt = Packet::fragmented(vec![vec![0xab; 100], vec![0xab; 100]]).with_meta(PacketMeta {
        if_index: 7,
        rx_queue: 2,
        vlan_tci: 0x1000 | 100,
        mark: 0xab,
        timestamp: Some(stamp),
    });
    ep.enqueue(&[pkt], 1, 9);

    let mut reader = reader(&ep)?;
    let mut batch = reader
        .read()
        .ok_or_else(|| TestError::Assertion("no batch: region unpublished or swap postponed".into()))?;
    let slot = batch
        .slots()
        .next()
        .ok_or_else(|| TestError::Assertion("no slot committed".into()))?;

    ensure(slot.len() == 200, || format!("len {}", slot.len()))?;
    ensure(slot.caplen() == 96, || format!("caplen {}", slot.caplen()))?;
    ensure(slot.data().iter().all(|&b| b == 0xab), || "payload".into())?;
    ensure(slot.timestamp() == stamp, || format!("{:?}", slot.timestamp()))?;
    ensure(slot.gid() == 9, || format!("gid {}", slot.gid()))?;
    ensure(slot.if_index() == 7, || format!("if_index {}", slot.if_index()))?;
    ensure(slot.hw_queue() == 2, || format!("hw_queue {}", slot.hw_queue()))?;
    ensure(slot.vlan_tci() == 100, || format!("vlan_tci {}", slot.vlan_tci()))?;
    Ok(())
}

/// Disabling while producers hammer the queue: nothing faults, nothing is
/// committed afterwards, and the endpoint comes back on re-enable.
pub fn run_disable_under_load<F: BackingFactory>() {
    if let Err(e) = run_disable_under_load_inner::<F>() {
        panic!("run_disable_under_load failed: {}", e);
    }
}

fn run_disable_under_load_inner<F: BackingFactory>() -> Result<(), TestError> {
    let (_guard, ep) = endpoint::<F>(QueueConfig {
        grace_period: Duration::from_millis(5),
        ..small_config(64)
    })?;
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        for p in 0..4 {
            let ep = &ep;
            let stop = &stop;
            s.spawn(move || {
                let batch: Vec<Packet> = (0..8).map(|i| tagged(p * 8 + i, 64)).collect();
                while !stop.load(Ordering::Acquire) {
                    ep.enqueue(&batch, u64::MAX, 0);
                    // Drain so the queue keeps accepting.
                    if let Some(mut reader) = ep.reader() {
                        if let Some(mut batch) = reader.read() {
                            batch.slots().for_each(drop);
                        }
                    }
                }
            });
        }

        thread::sleep(Duration::from_millis(10));
        let disabled = ep.disable();
        stop.store(true, Ordering::Release);
        ensure(disabled, || "disable under load did nothing".into())
    })?;

    ensure(ep.region().in_flight() == 0, || "guards outlived disable".into())?;
    let out = ep.enqueue(&[tagged(1, 64)], 1, 0);
    ensure(out.committed == 0 && out.dropped == 1, || {
        format!("disabled endpoint accepted {:?}", out)
    })?;

    ep.enable(None)?;
    let out = ep.enqueue(&[tagged(1, 64)], 1, 0);
    ensure(out.committed == 1, || format!("re-enabled endpoint: {:?}", out))?;
    ensure(ep.stats().fault == 0, || "unexpected copy fault".into())?;
    Ok(())
}
