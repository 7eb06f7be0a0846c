//! Shared region layout definitions.
//!
//! This module defines the `repr(C)` structures that make up the queue
//! region. Producer and consumer interpret the same raw bytes, so every
//! structure carries a compile-time size assertion.
//!
//! # Memory Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  Rx Queue Header (64 bytes: index word, size, slot_size, writers)    │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Tx Queue Headers (MAX_TX_QUEUES × 192 bytes)                        │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Rx Slots, sub-buffer 0 (rx_size × rx_slot_size)                     │
//! │  Rx Slots, sub-buffer 1 (rx_size × rx_slot_size)                     │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Tx Slots, queue 0..MAX_TX_QUEUES (tx_size × tx_slot_size each)      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Rx slot
//!
//! Every receive slot is a 32-byte [`SlotHeader`] followed by up to
//! `slot_size - 32` bytes of payload. The `commit` byte is written last.

use std::ptr::{self, addr_of_mut, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use crate::error::LayoutError;

/// Number of transmit queues carried by every region.
pub const MAX_TX_QUEUES: usize = 4;

/// Size of the per-slot receive header.
pub const SLOT_HEADER_SIZE: usize = 32;

/// Size of the length prefix at the start of every transmit slot.
pub const TX_SLOT_HEADER_SIZE: usize = 8;

/// Bits reserved for the occupancy count in the packed index word.
pub const COUNT_BITS: u32 = 24;

/// Mask selecting the occupancy count.
pub const COUNT_MASK: u32 = (1 << COUNT_BITS) - 1;

/// Queue index stored in a freshly enabled region.
pub const INITIAL_INDEX: u8 = 1;

/// Largest accepted rx sub-buffer capacity.
///
/// Leaves headroom in the 24-bit count for reservations that race past
/// capacity before the pre-check sees the queue full.
pub const MAX_RX_QUEUE_SIZE: u32 = 1 << 20;

/// Payloads shorter than this are copied as one fixed block when the
/// source buffer has enough readable bytes.
pub const COPY_BLOCK: usize = 64;

/// VLAN tag-present bit, stripped before the tci is stored.
pub const VLAN_TAG_PRESENT: u16 = 0x1000;

/// Round `n` up to a multiple of 8.
#[inline]
pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Bytes per rx slot for a given capture length.
#[inline]
pub const fn rx_slot_size(caplen: usize) -> usize {
    align8(SLOT_HEADER_SIZE + caplen)
}

/// Bytes per tx slot for a given maximum packet length.
#[inline]
pub const fn tx_slot_size(max_len: usize) -> usize {
    align8(TX_SLOT_HEADER_SIZE + max_len)
}

// =============================================================================
// Index packing
// =============================================================================

/// A decoded snapshot of the rx index word.
///
/// The high 8 bits hold the queue index, a generation counter bumped on
/// every consumer swap. Its low bit selects the active sub-buffer. The low
/// 24 bits hold the number of slots reserved in that sub-buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PackedIndex(u32);

impl PackedIndex {
    #[inline]
    pub const fn new(index: u8, count: u32) -> Self {
        Self(((index as u32) << COUNT_BITS) | (count & COUNT_MASK))
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Queue index (generation) of the active sub-buffer.
    #[inline]
    pub const fn index(self) -> u8 {
        (self.0 >> COUNT_BITS) as u8
    }

    /// Slots reserved so far in the active sub-buffer.
    #[inline]
    pub const fn count(self) -> u32 {
        self.0 & COUNT_MASK
    }

    /// Which of the two sub-buffers is active (0 or 1).
    #[inline]
    pub const fn selector(self) -> usize {
        (self.index() & 1) as usize
    }

    /// The value installed by a swap: next index, empty count.
    #[inline]
    pub const fn next(self) -> Self {
        Self::new(self.index().wrapping_add(1), 0)
    }
}

/// The atomic rx index word.
///
/// Index and count live in one integer so a reservation observes both with
/// a single read-modify-write.
#[repr(transparent)]
pub struct IndexWord(AtomicU32);

impl IndexWord {
    pub const fn new(initial: PackedIndex) -> Self {
        Self(AtomicU32::new(initial.raw()))
    }

    #[inline]
    pub fn load(&self) -> PackedIndex {
        PackedIndex(self.0.load(Ordering::Acquire))
    }

    /// Reserve `n` slots and return the word as it was before the add.
    ///
    /// The caller owns offsets `[prev.count(), prev.count() + n)` of
    /// sub-buffer `prev.selector()`.
    #[inline]
    pub fn reserve(&self, n: u32) -> PackedIndex {
        PackedIndex(self.0.fetch_add(n, Ordering::AcqRel))
    }

    /// Advance to the next index with an empty count, returning the
    /// previous word.
    ///
    /// Only the single consumer may call this. The load and the swap are
    /// separate operations: producers change only the count bits in between,
    /// and the swap discards the count anyway, so the index read by the load
    /// is still current when the swap lands. A second concurrent swapper
    /// would break this and skip an index.
    #[inline]
    pub fn swap_next(&self) -> PackedIndex {
        let current = self.load();
        let prev = PackedIndex(self.0.swap(current.next().raw(), Ordering::SeqCst));
        debug_assert_eq!(prev.index(), current.index(), "concurrent swap_next");
        prev
    }
}

// =============================================================================
// Queue headers
// =============================================================================

/// Receive queue header (64 bytes).
#[repr(C, align(64))]
pub struct RxQueueHeader {
    /// Packed (index, count).
    pub data: IndexWord,
    /// Slots per sub-buffer.
    pub size: u32,
    /// Bytes per slot, header included.
    pub slot_size: u32,
    /// Producers registered on each sub-buffer, see [`RxQueue::begin_write`].
    pub writers: [AtomicU32; 2],
    pub _pad: [u8; 44],
}

const _: () = assert!(core::mem::size_of::<RxQueueHeader>() == 64);

impl RxQueueHeader {
    pub fn new(size: u32, slot_size: u32) -> Self {
        Self {
            data: IndexWord::new(PackedIndex::new(INITIAL_INDEX, 0)),
            size,
            slot_size,
            writers: [AtomicU32::new(0), AtomicU32::new(0)],
            _pad: [0; 44],
        }
    }
}

/// One side of a transmit queue, alone on its cache line.
#[repr(C, align(64))]
pub struct TxCursor {
    pub index: AtomicU32,
    pub cache: u32,
    pub _pad: [u8; 56],
}

const _: () = assert!(core::mem::size_of::<TxCursor>() == 64);

impl TxCursor {
    pub const fn new() -> Self {
        Self {
            index: AtomicU32::new(0),
            cache: 0,
            _pad: [0; 56],
        }
    }
}

impl Default for TxCursor {
    fn default() -> Self {
        Self::new()
    }
}

/// Transmit queue header (192 bytes).
///
/// Single-producer single-consumer; only the layout lives here.
#[repr(C, align(64))]
pub struct TxQueueHeader {
    pub producer: TxCursor,
    pub consumer: TxCursor,
    /// `size - 1`; `size` is a power of two.
    pub size_mask: u32,
    pub max_len: u32,
    pub size: u32,
    pub slot_size: u32,
    pub _pad: [u8; 48],
}

const _: () = assert!(core::mem::size_of::<TxQueueHeader>() == 192);

impl TxQueueHeader {
    pub fn new(size: u32, max_len: u32, slot_size: u32) -> Self {
        Self {
            producer: TxCursor::new(),
            consumer: TxCursor::new(),
            size_mask: size - 1,
            max_len,
            size,
            slot_size,
            _pad: [0; 48],
        }
    }
}

/// All queue headers, at offset 0 of the region.
#[repr(C, align(64))]
pub struct RegionHeader {
    pub rx: RxQueueHeader,
    pub tx: [TxQueueHeader; MAX_TX_QUEUES],
}

const _: () = assert!(core::mem::size_of::<RegionHeader>() == 64 + 192 * MAX_TX_QUEUES);

// =============================================================================
// Slot codec
// =============================================================================

/// Per-packet header at the start of every rx slot (32 bytes).
#[repr(C)]
pub struct SlotHeader {
    pub tstamp_sec: u32,
    pub tstamp_nsec: u32,
    /// Opaque per-packet annotation.
    pub mark: u32,
    /// Group the packet was steered to.
    pub gid: u32,
    /// Original length on the wire.
    pub len: u16,
    /// Bytes stored in the slot.
    pub caplen: u16,
    pub vlan_tci: u16,
    pub if_index: u8,
    pub hw_queue: u8,
    /// Set last, to the queue index active at reservation time.
    pub commit: AtomicU8,
    pub _reserved: [u8; 7],
}

const _: () = assert!(core::mem::size_of::<SlotHeader>() == SLOT_HEADER_SIZE);

/// Metadata written into a slot header before it is committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotMeta {
    /// `None` leaves the timestamp words untouched.
    pub tstamp: Option<Duration>,
    pub mark: u32,
    pub gid: u32,
    pub len: u16,
    pub caplen: u16,
    pub vlan_tci: u16,
    pub if_index: u8,
    pub hw_queue: u8,
}

impl SlotHeader {
    /// Write every field except `commit`.
    ///
    /// # Safety
    ///
    /// `hdr` must point to a slot reserved by the caller and not yet
    /// committed for the current index.
    pub unsafe fn write_meta(hdr: *mut SlotHeader, meta: &SlotMeta) {
        unsafe {
            if let Some(ts) = meta.tstamp {
                addr_of_mut!((*hdr).tstamp_sec).write(ts.as_secs() as u32);
                addr_of_mut!((*hdr).tstamp_nsec).write(ts.subsec_nanos());
            }
            addr_of_mut!((*hdr).mark).write(meta.mark);
            addr_of_mut!((*hdr).gid).write(meta.gid);
            addr_of_mut!((*hdr).len).write(meta.len);
            addr_of_mut!((*hdr).caplen).write(meta.caplen);
            addr_of_mut!((*hdr).vlan_tci).write(meta.vlan_tci);
            addr_of_mut!((*hdr).if_index).write(meta.if_index);
            addr_of_mut!((*hdr).hw_queue).write(meta.hw_queue);
        }
    }

    /// Publish the slot. Every prior write to the slot happens-before a
    /// consumer's acquire load that observes `index`.
    ///
    /// # Safety
    ///
    /// `hdr` must point to a valid slot header.
    #[inline]
    pub unsafe fn commit(hdr: *const SlotHeader, index: u8) {
        unsafe { (*hdr).commit.store(index, Ordering::Release) }
    }

    /// Whether this slot was committed under `index`.
    #[inline]
    pub fn is_committed(&self, index: u8) -> bool {
        self.commit.load(Ordering::Acquire) == index
    }

    /// Capture timestamp as stored.
    #[inline]
    pub fn timestamp(&self) -> Duration {
        Duration::new(self.tstamp_sec as u64, self.tstamp_nsec)
    }
}

// =============================================================================
// Geometry
// =============================================================================

/// Sizes and offsets of every sub-structure in a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionGeometry {
    pub rx_size: usize,
    pub rx_slot_size: usize,
    pub tx_size: usize,
    pub tx_slot_size: usize,
}

impl RegionGeometry {
    /// Offset of the first rx slot.
    #[inline]
    pub const fn rx_offset(&self) -> usize {
        core::mem::size_of::<RegionHeader>()
    }

    /// Bytes used by both rx sub-buffers.
    #[inline]
    pub const fn rx_bytes(&self) -> usize {
        2 * self.rx_size * self.rx_slot_size
    }

    /// Bytes used by one tx queue.
    #[inline]
    pub const fn tx_queue_bytes(&self) -> usize {
        self.tx_size * self.tx_slot_size
    }

    /// Offset of tx queue `n`'s slot storage.
    #[inline]
    pub const fn tx_offset(&self, n: usize) -> usize {
        self.rx_offset() + self.rx_bytes() + self.tx_queue_bytes() * n
    }

    /// Total region size, with overflow checking.
    pub fn total_size_checked(&self) -> Result<usize, LayoutError> {
        let rx = self
            .rx_size
            .checked_mul(self.rx_slot_size)
            .and_then(|n| n.checked_mul(2))
            .ok_or(LayoutError::Overflow)?;
        let tx = self
            .tx_size
            .checked_mul(self.tx_slot_size)
            .and_then(|n| n.checked_mul(MAX_TX_QUEUES))
            .ok_or(LayoutError::Overflow)?;
        self.rx_offset()
            .checked_add(rx)
            .and_then(|n| n.checked_add(tx))
            .ok_or(LayoutError::Overflow)
    }

    /// Read the geometry back out of an initialised header.
    pub fn from_header(header: &RegionHeader) -> Self {
        Self {
            rx_size: header.rx.size as usize,
            rx_slot_size: header.rx.slot_size as usize,
            tx_size: header.tx[0].size as usize,
            tx_slot_size: header.tx[0].slot_size as usize,
        }
    }
}

// =============================================================================
// Queue views
// =============================================================================

/// A view of the rx queue inside a mapped region.
#[derive(Clone, Copy)]
pub struct RxQueue<'a> {
    header: &'a RxQueueHeader,
    base: NonNull<u8>,
    size: u32,
    slot_size: u32,
}

// SAFETY: producers write disjoint reserved slots and publish them through
// atomics; the header is only accessed through atomics or immutable fields.
unsafe impl Send for RxQueue<'_> {}
unsafe impl Sync for RxQueue<'_> {}

impl<'a> RxQueue<'a> {
    /// Create a view from raw pointers.
    ///
    /// # Safety
    ///
    /// - `header` must point to an initialised `RxQueueHeader`.
    /// - `base` must point to `2 × size × slot_size` bytes of slot storage.
    /// - Both must stay valid for `'a`.
    pub unsafe fn from_raw(header: *const RxQueueHeader, base: NonNull<u8>) -> Self {
        let header = unsafe { &*header };
        Self {
            header,
            base,
            size: header.size,
            slot_size: header.slot_size,
        }
    }

    #[inline]
    pub fn header(&self) -> &'a RxQueueHeader {
        self.header
    }

    /// Slots per sub-buffer.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    /// Payload bytes available after the slot header.
    #[inline]
    pub fn payload_capacity(&self) -> usize {
        self.slot_size as usize - SLOT_HEADER_SIZE
    }

    #[inline]
    pub fn index(&self) -> PackedIndex {
        self.header.data.load()
    }

    /// Reserve `n` slots and register as a writer of their sub-buffer.
    ///
    /// Returns the word before the reservation together with the
    /// registration, which must be held until the last slot is committed.
    /// `None` when the consumer froze the sub-buffer before the registration
    /// landed: the reserved slots must then be left untouched, and the
    /// consumer counts them as lost.
    pub fn begin_write(&self, n: u32) -> Option<(PackedIndex, WriterGuard<'a>)> {
        let prev = self.header.data.reserve(n);
        let writers = &self.header.writers[prev.selector()];
        writers.fetch_add(1, Ordering::SeqCst);
        let guard = WriterGuard { writers };
        // Registered before any freeze of this index, so the consumer waits
        // for us before it hands the sub-buffer out again.
        let still_active = self.header.data.0.load(Ordering::SeqCst) >> COUNT_BITS;
        (still_active == prev.index() as u32).then_some((prev, guard))
    }

    /// Producers registered on sub-buffer `selector`.
    #[inline]
    pub fn writers(&self, selector: usize) -> u32 {
        self.header.writers[selector].load(Ordering::SeqCst)
    }

    /// Address of slot `slot` in sub-buffer `selector`.
    ///
    /// # Safety
    ///
    /// `selector` must be 0 or 1 and `slot` must be below `size`.
    #[inline]
    pub unsafe fn slot_ptr(&self, selector: usize, slot: usize) -> *mut SlotHeader {
        debug_assert!(selector < 2 && slot < self.size as usize);
        let offset = (selector * self.size as usize + slot) * self.slot_size as usize;
        unsafe { self.base.as_ptr().add(offset).cast() }
    }

    /// Payload area that follows a slot header.
    ///
    /// # Safety
    ///
    /// Same as [`slot_ptr`](Self::slot_ptr); the caller must own the slot.
    #[inline]
    pub unsafe fn payload_ptr(&self, selector: usize, slot: usize) -> *mut u8 {
        unsafe { self.slot_ptr(selector, slot).cast::<u8>().add(SLOT_HEADER_SIZE) }
    }
}

/// A producer's registration on one rx sub-buffer. Dropping it tells the
/// consumer the producer is done writing there.
pub struct WriterGuard<'a> {
    writers: &'a AtomicU32,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.writers.fetch_sub(1, Ordering::Release);
    }
}

/// A view of one tx queue: its header and slot storage.
#[derive(Clone, Copy)]
pub struct TxQueue<'a> {
    header: &'a TxQueueHeader,
    base: NonNull<u8>,
}

unsafe impl Send for TxQueue<'_> {}
unsafe impl Sync for TxQueue<'_> {}

impl<'a> TxQueue<'a> {
    /// # Safety
    ///
    /// `header` must point to an initialised `TxQueueHeader` whose slot
    /// storage starts at `base`; both valid for `'a`.
    pub unsafe fn from_raw(header: *const TxQueueHeader, base: NonNull<u8>) -> Self {
        Self {
            header: unsafe { &*header },
            base,
        }
    }

    #[inline]
    pub fn header(&self) -> &'a TxQueueHeader {
        self.header
    }

    /// Start of this queue's slot storage.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.header.size
    }

    #[inline]
    pub fn max_len(&self) -> u32 {
        self.header.max_len
    }

    #[inline]
    pub fn slot_size(&self) -> u32 {
        self.header.slot_size
    }
}

/// Consumer-side view over a region mapped by some other party.
///
/// A companion process maps the same shared file and builds its reader from
/// this view; geometry is read back from the headers and checked against the
/// mapping length.
pub struct RegionView<'a> {
    header: &'a RegionHeader,
    base: NonNull<u8>,
    geometry: RegionGeometry,
}

impl<'a> RegionView<'a> {
    /// # Safety
    ///
    /// `ptr` must point to `len` readable and writable bytes holding an
    /// enabled region, valid for `'a`.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Result<Self, LayoutError> {
        let base = NonNull::new(ptr).ok_or(LayoutError::Misaligned {
            align: core::mem::align_of::<RegionHeader>(),
        })?;
        let align = core::mem::align_of::<RegionHeader>();
        if (ptr as usize) % align != 0 {
            return Err(LayoutError::Misaligned { align });
        }
        let header_len = core::mem::size_of::<RegionHeader>();
        if len < header_len {
            return Err(LayoutError::RegionTooSmall {
                needed: header_len,
                available: len,
            });
        }

        let header = unsafe { &*(ptr as *const RegionHeader) };
        let geometry = RegionGeometry::from_header(header);
        if geometry.rx_size == 0 || geometry.rx_slot_size < SLOT_HEADER_SIZE {
            return Err(LayoutError::InvalidConfig("rx header is not initialised"));
        }
        let needed = geometry.total_size_checked()?;
        if len < needed {
            return Err(LayoutError::RegionTooSmall {
                needed,
                available: len,
            });
        }

        Ok(Self {
            header,
            base,
            geometry,
        })
    }

    #[inline]
    pub fn geometry(&self) -> RegionGeometry {
        self.geometry
    }

    pub fn rx(&self) -> RxQueue<'a> {
        // SAFETY: geometry was validated against the mapping length.
        unsafe {
            let slots = NonNull::new_unchecked(self.base.as_ptr().add(self.geometry.rx_offset()));
            RxQueue::from_raw(ptr::addr_of!(self.header.rx), slots)
        }
    }

    pub fn tx(&self, n: usize) -> Option<TxQueue<'a>> {
        let header = self.header.tx.get(n)?;
        // SAFETY: as above.
        unsafe {
            let slots = NonNull::new_unchecked(self.base.as_ptr().add(self.geometry.tx_offset(n)));
            Some(TxQueue::from_raw(header, slots))
        }
    }
}
