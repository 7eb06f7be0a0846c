//! Producer-side packet buffers.
//!
//! The enqueue engine only sees packets through [`PacketBuffer`]. A batch is
//! a slice of buffers plus a `u64` bitmask selecting which entries take part,
//! so at most 64 packets go through one reservation.

use std::time::Duration;

use crate::error::CopyError;

/// Largest number of packets in one batch (one bit per entry).
pub const MAX_BATCH: usize = 64;

/// A captured packet as seen by the enqueue engine.
pub trait PacketBuffer {
    /// Length of the packet on the wire.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contiguous packet bytes, possibly followed by readable tailroom.
    ///
    /// `None` when the payload is fragmented; the engine then falls back to
    /// [`copy_bits`](Self::copy_bits).
    fn linear_data(&self) -> Option<&[u8]>;

    /// Copy `dst.len()` bytes starting at `offset`, walking fragments.
    fn copy_bits(&self, offset: usize, dst: &mut [u8]) -> Result<(), CopyError>;

    /// Index of the receiving device.
    fn if_index(&self) -> u32;

    /// Hardware receive queue the packet arrived on.
    fn rx_queue(&self) -> u16;

    fn vlan_tci(&self) -> u16;

    /// Opaque annotation stored as the slot's mark.
    fn mark(&self) -> u32;

    /// Arrival time since the Unix epoch, if the device stamped it.
    fn timestamp(&self) -> Option<Duration>;
}

/// Mask with the low `len` bits set.
#[inline]
pub fn valid_mask(len: usize) -> u64 {
    if len >= MAX_BATCH {
        u64::MAX
    } else {
        (1u64 << len) - 1
    }
}

/// Number of entries of a `len`-long batch selected by `mask`.
#[inline]
pub fn batch_len(mask: u64, len: usize) -> u32 {
    (mask & valid_mask(len)).count_ones()
}

/// Indices selected by `mask`, in increasing order.
pub fn selected(mask: u64, len: usize) -> impl Iterator<Item = usize> {
    let mut bits = mask & valid_mask(len);
    std::iter::from_fn(move || {
        if bits == 0 {
            return None;
        }
        let n = bits.trailing_zeros() as usize;
        bits &= bits - 1;
        Some(n)
    })
}

/// Metadata carried alongside a packet's bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketMeta {
    pub if_index: u32,
    pub rx_queue: u16,
    pub vlan_tci: u16,
    pub mark: u32,
    pub timestamp: Option<Duration>,
}

#[derive(Debug, Clone)]
enum Payload {
    /// `buf[..len]` is the packet; anything after is tailroom.
    Linear { buf: Vec<u8>, len: usize },
    Fragmented(Vec<Vec<u8>>),
}

/// An owned packet buffer.
#[derive(Debug, Clone)]
pub struct Packet {
    payload: Payload,
    meta: PacketMeta,
    /// Overrides the length reported to the engine.
    declared_len: Option<usize>,
}

impl Packet {
    /// A contiguous packet with no tailroom.
    pub fn linear(bytes: impl Into<Vec<u8>>) -> Self {
        let buf = bytes.into();
        let len = buf.len();
        Self {
            payload: Payload::Linear { buf, len },
            meta: PacketMeta::default(),
            declared_len: None,
        }
    }

    /// A contiguous packet followed by `tailroom` readable zero bytes.
    pub fn with_tailroom(bytes: &[u8], tailroom: usize) -> Self {
        let mut buf = Vec::with_capacity(bytes.len() + tailroom);
        buf.extend_from_slice(bytes);
        buf.resize(bytes.len() + tailroom, 0);
        Self {
            payload: Payload::Linear {
                buf,
                len: bytes.len(),
            },
            meta: PacketMeta::default(),
            declared_len: None,
        }
    }

    /// A packet split across several fragments.
    pub fn fragmented(frags: Vec<Vec<u8>>) -> Self {
        Self {
            payload: Payload::Fragmented(frags),
            meta: PacketMeta::default(),
            declared_len: None,
        }
    }

    pub fn with_meta(mut self, meta: PacketMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Report `len` bytes even if fewer are stored, as a corrupted source
    /// buffer would.
    pub fn with_declared_len(mut self, len: usize) -> Self {
        self.declared_len = Some(len);
        self
    }

    pub fn meta(&self) -> &PacketMeta {
        &self.meta
    }

    fn stored_len(&self) -> usize {
        match &self.payload {
            Payload::Linear { len, .. } => *len,
            Payload::Fragmented(frags) => frags.iter().map(Vec::len).sum(),
        }
    }
}

impl PacketBuffer for Packet {
    fn len(&self) -> usize {
        self.declared_len.unwrap_or_else(|| self.stored_len())
    }

    fn linear_data(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Linear { buf, .. } => Some(buf),
            Payload::Fragmented(_) => None,
        }
    }

    fn copy_bits(&self, offset: usize, dst: &mut [u8]) -> Result<(), CopyError> {
        let available = self.stored_len();
        let wanted = offset + dst.len();
        if wanted > available {
            return Err(CopyError::Short { wanted, available });
        }

        match &self.payload {
            Payload::Linear { buf, .. } => {
                dst.copy_from_slice(&buf[offset..wanted]);
            }
            Payload::Fragmented(frags) => {
                let mut skip = offset;
                let mut written = 0;
                for frag in frags {
                    if written == dst.len() {
                        break;
                    }
                    if skip >= frag.len() {
                        skip -= frag.len();
                        continue;
                    }
                    let src = &frag[skip..];
                    skip = 0;
                    let n = src.len().min(dst.len() - written);
                    dst[written..written + n].copy_from_slice(&src[..n]);
                    written += n;
                }
            }
        }
        Ok(())
    }

    fn if_index(&self) -> u32 {
        self.meta.if_index
    }

    fn rx_queue(&self) -> u16 {
        self.meta.rx_queue
    }

    fn vlan_tci(&self) -> u16 {
        self.meta.vlan_tci
    }

    fn mark(&self) -> u32 {
        self.meta.mark
    }

    fn timestamp(&self) -> Option<Duration> {
        self.meta.timestamp
    }
}
