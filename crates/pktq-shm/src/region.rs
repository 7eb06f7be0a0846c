//! Shared region lifecycle.
//!
//! A [`SharedRegion`] owns the memory behind one rx queue and
//! [`MAX_TX_QUEUES`] tx queues. Its state moves
//! `Uninitialized → Published → Draining → Freed`, and back to `Published`
//! on a later enable.
//!
//! Producers and readers never hold the memory directly: they call
//! [`SharedRegion::enter`], which counts them in-flight and hands out a
//! [`RegionGuard`] only while the region is `Published`. Disable unpublishes
//! every header pointer and sleeps the grace period. The memory is released
//! right there if nobody is inside, otherwise by the last guard to leave.

use std::fs::{self, OpenOptions};
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::config::{Backing, QueueConfig};
use crate::error::RegionError;
use crate::layout::{
    RegionGeometry, RegionHeader, RxQueue, RxQueueHeader, TxQueue, TxQueueHeader, MAX_TX_QUEUES,
};
use crate::wake::WakePolicy;

/// Huge page size assumed when rounding user-address mappings.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Lifecycle state of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionState {
    Uninitialized = 0,
    Published = 1,
    Draining = 2,
    Freed = 3,
}

impl RegionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Published,
            2 => Self::Draining,
            3 => Self::Freed,
            _ => Self::Uninitialized,
        }
    }
}

// =============================================================================
// Backing memory
// =============================================================================

/// Anonymous huge-page mapping placed at a caller-chosen address.
struct HugePageMap {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory owned by this value.
unsafe impl Send for HugePageMap {}

impl HugePageMap {
    #[cfg(target_os = "linux")]
    fn map(addr: NonZeroUsize, len: usize) -> io::Result<Self> {
        let len = len.div_ceil(HUGE_PAGE_SIZE) * HUGE_PAGE_SIZE;

        // SAFETY: MAP_FIXED_NOREPLACE never clobbers an existing mapping.
        let ptr = unsafe {
            libc::mmap(
                addr.get() as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED
                    | libc::MAP_ANONYMOUS
                    | libc::MAP_HUGETLB
                    | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        if ptr as usize != addr.get() {
            // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
            unsafe { libc::munmap(ptr, len) };
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "requested address is not available",
            ));
        }

        Ok(Self {
            // SAFETY: mmap succeeded at a non-zero address
            ptr: unsafe { NonNull::new_unchecked(ptr.cast()) },
            len,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn map(_addr: NonZeroUsize, _len: usize) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "huge page mappings require Linux",
        ))
    }
}

impl Drop for HugePageMap {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if ret != 0 {
            tracing::warn!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

/// A file-backed mapping a companion process can open by path.
struct SharedFile {
    mmap: MmapMut,
    path: PathBuf,
}

impl SharedFile {
    fn create(path: &Path, size: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size as u64)?;

        // SAFETY: the file was just sized to `size` and is owned by us.
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        Ok(Self {
            mmap,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for SharedFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("failed to remove {}: {}", self.path.display(), e);
        }
    }
}

enum RegionMemory {
    Anonymous(MmapMut),
    Shared(SharedFile),
    HugePages(HugePageMap),
}

impl RegionMemory {
    fn allocate(backing: &Backing, user_addr: Option<NonZeroUsize>, size: usize) -> io::Result<Self> {
        if let Some(addr) = user_addr {
            return HugePageMap::map(addr, size).map(Self::HugePages);
        }
        match backing {
            Backing::Anonymous => MmapOptions::new().len(size).map_anon().map(Self::Anonymous),
            Backing::Shared { path } => SharedFile::create(path, size).map(Self::Shared),
        }
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            Self::Anonymous(mmap) => mmap.as_mut_ptr(),
            Self::Shared(file) => file.mmap.as_mut_ptr(),
            Self::HugePages(map) => map.ptr.as_ptr(),
        }
    }

    fn base_addr(&self) -> usize {
        match self {
            Self::Anonymous(mmap) => mmap.as_ptr() as usize,
            Self::Shared(file) => file.mmap.as_ptr() as usize,
            Self::HugePages(map) => map.ptr.as_ptr() as usize,
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Anonymous(mmap) => mmap.len(),
            Self::Shared(file) => file.mmap.len(),
            Self::HugePages(map) => map.len,
        }
    }
}

struct Mapped {
    memory: RegionMemory,
    geometry: RegionGeometry,
}

/// Per-queue options producers read on every batch.
///
/// Written before the header pointers are published; the release store of
/// the pointers orders them.
#[derive(Default)]
struct RxOptions {
    caplen: AtomicU32,
    tstamp: AtomicBool,
    wake_interval: AtomicU32,
}

// =============================================================================
// SharedRegion
// =============================================================================

/// Shared memory region backing an endpoint's queues.
pub struct SharedRegion {
    state: AtomicU8,
    in_flight: AtomicUsize,
    /// Set once the grace period is over: the last guard out frees.
    free_on_leave: AtomicBool,
    rx_header: AtomicPtr<RxQueueHeader>,
    tx_headers: [AtomicPtr<TxQueueHeader>; MAX_TX_QUEUES],
    tx_bases: [AtomicPtr<u8>; MAX_TX_QUEUES],
    options: RxOptions,
    mapped: Mutex<Option<Mapped>>,
}

impl Default for SharedRegion {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedRegion {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RegionState::Uninitialized as u8),
            in_flight: AtomicUsize::new(0),
            free_on_leave: AtomicBool::new(false),
            rx_header: AtomicPtr::new(ptr::null_mut()),
            tx_headers: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            tx_bases: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            options: RxOptions::default(),
            mapped: Mutex::new(None),
        }
    }

    #[inline]
    pub fn state(&self) -> RegionState {
        RegionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Allocate, initialise and publish the region.
    ///
    /// Returns `Ok(false)` without touching anything if a region already
    /// exists, including one still draining. With `user_addr`, memory is mapped from huge pages at that
    /// address; otherwise `config.backing` decides.
    pub fn enable(
        &self,
        config: &QueueConfig,
        user_addr: Option<NonZeroUsize>,
    ) -> Result<bool, RegionError> {
        let mut mapped = self.mapped.lock();
        if mapped.is_some() {
            return Ok(false);
        }

        config.validate()?;
        let geometry = config.geometry();
        let size = geometry.total_size_checked()?;

        let mut memory = RegionMemory::allocate(&config.backing, user_addr, size)
            .map_err(|source| RegionError::Alloc { size, source })?;
        let base = memory.as_mut_ptr();

        // SAFETY: `base` points to at least `size` fresh, page-aligned bytes
        // that no other context can see yet.
        unsafe {
            let header = base.cast::<RegionHeader>();
            ptr::addr_of_mut!((*header).rx).write(RxQueueHeader::new(
                geometry.rx_size as u32,
                geometry.rx_slot_size as u32,
            ));
            for n in 0..MAX_TX_QUEUES {
                ptr::addr_of_mut!((*header).tx[n]).write(TxQueueHeader::new(
                    geometry.tx_size as u32,
                    config.tx_max_len,
                    geometry.tx_slot_size as u32,
                ));
                self.tx_bases[n].store(base.add(geometry.tx_offset(n)), Ordering::Relaxed);
            }
        }

        self.options.caplen.store(config.rx_caplen, Ordering::Relaxed);
        self.options.tstamp.store(config.tstamp, Ordering::Relaxed);
        self.options
            .wake_interval
            .store(config.wake_interval, Ordering::Relaxed);

        // Publish: anyone who sees a non-null pointer sees initialised headers.
        let header = base.cast::<RegionHeader>();
        unsafe {
            self.rx_header
                .store(ptr::addr_of_mut!((*header).rx), Ordering::Release);
            for n in 0..MAX_TX_QUEUES {
                self.tx_headers[n].store(ptr::addr_of_mut!((*header).tx[n]), Ordering::Release);
            }
        }
        self.state
            .store(RegionState::Published as u8, Ordering::SeqCst);

        tracing::debug!(
            rx_size = geometry.rx_size,
            rx_slot_size = geometry.rx_slot_size,
            caplen = config.rx_caplen,
            rx_bytes = geometry.rx_bytes(),
            "rx queue enabled"
        );
        tracing::debug!(
            tx_size = geometry.tx_size,
            tx_slot_size = geometry.tx_slot_size,
            max_len = config.tx_max_len,
            tx_bytes = geometry.tx_queue_bytes() * MAX_TX_QUEUES,
            "tx queues enabled"
        );

        *mapped = Some(Mapped { memory, geometry });
        Ok(true)
    }

    /// Unpublish, sleep the grace period, then release the memory.
    ///
    /// Guards still alive after the grace period keep the memory mapped; the
    /// last one to drop frees it and the region stays `Draining` until then.
    /// Returns `false` if there was nothing to disable.
    pub fn disable(&self, grace_period: Duration) -> bool {
        {
            let mapped = self.mapped.lock();
            if mapped.is_none() || self.state() != RegionState::Published {
                return false;
            }
            self.state
                .store(RegionState::Draining as u8, Ordering::SeqCst);
            self.rx_header.store(ptr::null_mut(), Ordering::Release);
            for n in 0..MAX_TX_QUEUES {
                self.tx_headers[n].store(ptr::null_mut(), Ordering::Release);
                self.tx_bases[n].store(ptr::null_mut(), Ordering::Relaxed);
            }
        }

        thread::sleep(grace_period);
        self.free_on_leave.store(true, Ordering::SeqCst);
        if !self.try_free() {
            tracing::debug!(
                users = self.in_flight(),
                "region in use after grace period, free deferred to last guard"
            );
        }
        true
    }

    /// Free a draining region nobody is inside. Returns whether it is freed.
    fn try_free(&self) -> bool {
        let mut mapped = self.mapped.lock();
        match self.state() {
            RegionState::Freed => return true,
            RegionState::Draining => {}
            _ => return false,
        }
        if self.in_flight.load(Ordering::SeqCst) != 0 {
            return false;
        }
        drop(mapped.take());
        self.free_on_leave.store(false, Ordering::SeqCst);
        self.state.store(RegionState::Freed as u8, Ordering::SeqCst);
        tracing::debug!("rx/tx queues disabled");
        true
    }

    /// Drop one in-flight reference. The last one out after a disable's
    /// grace period frees the region.
    fn leave(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.free_on_leave.load(Ordering::SeqCst) {
            self.try_free();
        }
    }

    /// Enter the region, or `None` unless it is `Published`.
    ///
    /// No memory is touched when this returns `None`.
    pub fn enter(&self) -> Option<RegionGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.state.load(Ordering::SeqCst) != RegionState::Published as u8 {
            self.leave();
            return None;
        }
        let Some(rx) = NonNull::new(self.rx_header.load(Ordering::Acquire)) else {
            self.leave();
            return None;
        };
        Some(RegionGuard { region: self, rx })
    }

    /// Number of live guards.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn geometry(&self) -> Option<RegionGeometry> {
        self.mapped.lock().as_ref().map(|m| m.geometry)
    }

    /// Base address and length of the current mapping.
    pub fn mapping(&self) -> Option<(usize, usize)> {
        self.mapped
            .lock()
            .as_ref()
            .map(|m| (m.memory.base_addr(), m.memory.len()))
    }

    /// Whether the rx header pointer is currently published.
    pub fn is_published(&self) -> bool {
        !self.rx_header.load(Ordering::Acquire).is_null()
    }

    /// Whether any tx header pointer is currently published.
    pub fn any_tx_published(&self) -> bool {
        self.tx_headers
            .iter()
            .any(|p| !p.load(Ordering::Acquire).is_null())
    }
}

// =============================================================================
// RegionGuard
// =============================================================================

/// Proof that the region stays mapped for `'a`.
///
/// A disable that races with a live guard leaves the memory to be freed
/// when the guard drops.
pub struct RegionGuard<'a> {
    region: &'a SharedRegion,
    rx: NonNull<RxQueueHeader>,
}

impl<'a> RegionGuard<'a> {
    /// The rx queue.
    pub fn rx(&self) -> RxQueue<'_> {
        self.rx_for_region()
    }

    /// The rx queue, valid for as long as this guard is kept alive.
    ///
    /// Lets a guard be stored next to the view it protects.
    pub(crate) fn rx_for_region(&self) -> RxQueue<'a> {
        // SAFETY: the header sits at offset 0 of the region and is followed
        // by its slot storage; the in-flight count keeps it mapped.
        unsafe {
            let base = self
                .rx
                .cast::<u8>()
                .as_ptr()
                .add(core::mem::size_of::<RegionHeader>());
            RxQueue::from_raw(self.rx.as_ptr(), NonNull::new_unchecked(base))
        }
    }

    /// Tx queue `n`, if published.
    pub fn tx(&self, n: usize) -> Option<TxQueue<'_>> {
        let header = self.region.tx_headers.get(n)?.load(Ordering::Acquire);
        let base = NonNull::new(self.region.tx_bases[n].load(Ordering::Relaxed))?;
        if header.is_null() {
            return None;
        }
        // SAFETY: published pointers stay valid while the guard is held.
        Some(unsafe { TxQueue::from_raw(header, base) })
    }

    #[inline]
    pub fn caplen(&self) -> usize {
        self.region.options.caplen.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn tstamp(&self) -> bool {
        self.region.options.tstamp.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn wake_policy(&self) -> WakePolicy {
        WakePolicy::new(self.region.options.wake_interval.load(Ordering::Relaxed))
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        self.region.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{PackedIndex, INITIAL_INDEX};
    use std::sync::Arc;

    fn small_config() -> QueueConfig {
        QueueConfig {
            rx_size: 8,
            rx_caplen: 96,
            tx_size: 4,
            tx_max_len: 120,
            grace_period: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_enable_initialises_headers() {
        let region = SharedRegion::new();
        assert_eq!(region.state(), RegionState::Uninitialized);
        assert!(region.enter().is_none());

        assert!(region.enable(&small_config(), None).unwrap());
        assert_eq!(region.state(), RegionState::Published);

        let guard = region.enter().unwrap();
        let rx = guard.rx();
        assert_eq!(rx.index(), PackedIndex::new(INITIAL_INDEX, 0));
        assert_eq!(rx.size(), 8);
        assert_eq!(rx.slot_size(), 128);

        for n in 0..MAX_TX_QUEUES {
            let tx = guard.tx(n).unwrap();
            assert_eq!(tx.size(), 4);
            assert_eq!(tx.header().size_mask, 3);
            assert_eq!(tx.max_len(), 120);
            assert_eq!(tx.slot_size(), 128);
            assert_eq!(tx.header().producer.index.load(Ordering::Relaxed), 0);
            assert_eq!(tx.header().consumer.index.load(Ordering::Relaxed), 0);
        }
        assert!(guard.tx(MAX_TX_QUEUES).is_none());
    }

    #[test]
    fn test_tx_bases_follow_rx_storage() {
        let region = SharedRegion::new();
        let config = small_config();
        region.enable(&config, None).unwrap();
        let (base, len) = region.mapping().unwrap();
        let geometry = config.geometry();
        assert!(len >= geometry.total_size_checked().unwrap());

        let guard = region.enter().unwrap();
        for n in 0..MAX_TX_QUEUES {
            let tx = guard.tx(n).unwrap();
            assert_eq!(tx.base().as_ptr() as usize, base + geometry.tx_offset(n));
        }
    }

    #[test]
    fn test_enable_twice_is_noop() {
        let region = SharedRegion::new();
        assert!(region.enable(&small_config(), None).unwrap());
        let first = region.mapping();

        {
            let guard = region.enter().unwrap();
            guard.rx().header().data.reserve(3);
        }

        let other = QueueConfig {
            rx_size: 64,
            ..small_config()
        };
        assert!(!region.enable(&other, None).unwrap());
        assert_eq!(region.mapping(), first);

        let guard = region.enter().unwrap();
        assert_eq!(guard.rx().size(), 8);
        assert_eq!(guard.rx().index().count(), 3);
    }

    #[test]
    fn test_disable_unpublishes_and_frees() {
        let region = SharedRegion::new();
        region.enable(&small_config(), None).unwrap();
        assert!(region.is_published());

        assert!(region.disable(Duration::ZERO));
        assert_eq!(region.state(), RegionState::Freed);
        assert!(!region.is_published());
        assert!(!region.any_tx_published());
        assert!(region.mapping().is_none());
        assert!(region.enter().is_none());

        // Second disable does nothing.
        assert!(!region.disable(Duration::ZERO));
        assert_eq!(region.state(), RegionState::Freed);
    }

    #[test]
    fn test_reenable_after_disable() {
        let region = SharedRegion::new();
        region.enable(&small_config(), None).unwrap();
        region.disable(Duration::ZERO);
        assert!(region.enable(&small_config(), None).unwrap());
        assert_eq!(region.state(), RegionState::Published);
        assert_eq!(
            region.enter().unwrap().rx().index(),
            PackedIndex::new(INITIAL_INDEX, 0)
        );
    }

    #[test]
    fn test_disable_defers_free_to_last_guard() {
        let region = SharedRegion::new();
        region.enable(&small_config(), None).unwrap();
        let mapping = region.mapping();

        let guard = region.enter().unwrap();
        assert!(region.disable(Duration::ZERO));
        assert_eq!(region.state(), RegionState::Draining);
        assert!(region.enter().is_none());

        // Still mapped, and not reusable, while the guard lives.
        assert_eq!(guard.rx().size(), 8);
        assert_eq!(region.mapping(), mapping);
        assert!(!region.enable(&small_config(), None).unwrap());
        assert!(!region.disable(Duration::ZERO));

        drop(guard);
        assert_eq!(region.state(), RegionState::Freed);
        assert_eq!(region.in_flight(), 0);
        assert!(region.mapping().is_none());
        assert!(region.enable(&small_config(), None).unwrap());
    }

    #[test]
    fn test_guard_released_during_grace_period() {
        let region = Arc::new(SharedRegion::new());
        region.enable(&small_config(), None).unwrap();

        let guard_held = Arc::new(std::sync::Barrier::new(2));
        let holder = {
            let region = region.clone();
            let guard_held = guard_held.clone();
            thread::spawn(move || {
                let guard = region.enter().unwrap();
                guard_held.wait();
                thread::sleep(Duration::from_millis(10));
                assert_eq!(guard.rx().size(), 8);
            })
        };

        guard_held.wait();
        assert!(region.disable(Duration::from_millis(100)));
        holder.join().unwrap();
        assert_eq!(region.state(), RegionState::Freed);
        assert!(region.mapping().is_none());
    }

    #[test]
    fn test_enter_refused_while_draining() {
        let region = Arc::new(SharedRegion::new());
        region.enable(&small_config(), None).unwrap();

        let disabler = {
            let region = region.clone();
            thread::spawn(move || region.disable(Duration::from_millis(100)))
        };

        while region.state() == RegionState::Published {
            thread::yield_now();
        }
        assert!(region.enter().is_none());
        assert!(disabler.join().unwrap());
    }

    #[test]
    fn test_invalid_config_leaves_region_unconfigured() {
        let region = SharedRegion::new();
        let config = QueueConfig {
            rx_size: 0,
            ..small_config()
        };
        assert!(matches!(
            region.enable(&config, None),
            Err(RegionError::Layout(_))
        ));
        assert_eq!(region.state(), RegionState::Uninitialized);
        assert!(region.mapping().is_none());
    }

    #[test]
    fn test_occupied_user_addr_leaves_region_unconfigured() {
        let config = small_config();
        let occupied = MmapOptions::new()
            .len(config.region_size().unwrap())
            .map_anon()
            .unwrap();
        let addr = NonZeroUsize::new(occupied.as_ptr() as usize).unwrap();

        let region = SharedRegion::new();
        assert!(matches!(
            region.enable(&config, Some(addr)),
            Err(RegionError::Alloc { .. })
        ));
        assert_eq!(region.state(), RegionState::Uninitialized);
        assert!(region.mapping().is_none());
        assert!(region.enter().is_none());

        // The failed attempt does not block a regular enable.
        assert!(region.enable(&config, None).unwrap());
    }

    #[test]
    fn test_user_addr_maps_huge_pages_there() {
        let config = small_config();
        let addr = NonZeroUsize::new(0x7e00_0000_0000).unwrap();
        let region = SharedRegion::new();
        match region.enable(&config, Some(addr)) {
            Ok(enabled) => {
                assert!(enabled);
                let (base, len) = region.mapping().unwrap();
                assert_eq!(base, addr.get());
                assert_eq!(len % HUGE_PAGE_SIZE, 0);
                assert_eq!(region.enter().unwrap().rx().size(), 8);
                assert!(region.disable(Duration::ZERO));
                assert!(region.mapping().is_none());
            }
            // No huge pages reserved on this machine.
            Err(RegionError::Alloc { .. }) => {
                assert_eq!(region.state(), RegionState::Uninitialized);
                assert!(region.mapping().is_none());
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn test_shared_file_backing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pktq-test-region");
        let config = QueueConfig {
            backing: Backing::Shared { path: path.clone() },
            ..small_config()
        };

        let region = SharedRegion::new();
        region.enable(&config, None).unwrap();
        assert!(path.exists());
        assert_eq!(
            fs::metadata(&path).unwrap().len() as usize,
            config.region_size().unwrap()
        );

        region.disable(Duration::ZERO);
        assert!(!path.exists());
    }
}
