//! pktq: batched lock-free packet capture queues over shared memory.
//!
//! # Quick Start
//!
//! Create an endpoint, enable its queues, enqueue from any number of
//! threads and drain from one reader:
//!
//! ```ignore
//! use pktq::prelude::*;
//!
//! let endpoint = Endpoint::new(0, QueueConfig::default());
//! endpoint.enable(None)?;
//!
//! // Producer side: a batch and a mask selecting which entries to enqueue.
//! let batch = vec![Packet::linear(frame_bytes)];
//! let outcome = endpoint.enqueue(&batch, u64::MAX, 0);
//!
//! // Consumer side: swap sub-buffers and walk the committed slots.
//! let mut reader = endpoint.reader().expect("single reader");
//! if let Some(mut batch) = reader.read() {
//!     for slot in batch.slots() {
//!         handle(slot.data());
//!     }
//! }
//! ```
//!
//! # Backings
//!
//! Region memory comes from:
//!
//! - **anonymous** (default): private memory of this process
//! - **shared file**: a named file under `/dev/shm` a reader process maps
//!   itself, see [`RegionView`]
//! - **huge pages** at a caller-chosen address, by passing `user_addr` to
//!   [`Endpoint::enable`]
//!
//! A reader in another process is woken through a [`Doorbell`] installed with
//! [`Endpoint::with_notifier`].

pub use pktq_shm::{
    batch_len, enqueue_batch, selected, Backing, BatchParams, CancelToken, CopyError, Doorbell,
    Endpoint, EnqueueOutcome, LayoutError, Notifier, Packet, PacketBuffer, PacketMeta,
    QueueConfig, QueueStats, RegionError, RegionGeometry, RegionGuard, RegionState, RegionView,
    RxBatch, RxQueue, RxReader, SharedRegion, SlotView, StatsSnapshot, TxQueue, WaitQueue,
    WaitResult, WakeCoordinator, WakePolicy, MAX_BATCH, MAX_TX_QUEUES,
};

/// Region layout, for readers that map the region themselves.
pub use pktq_shm::layout;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use pktq::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Endpoint, EnqueueOutcome, Packet, PacketBuffer, PacketMeta, QueueConfig, RegionError,
        RxReader, WaitResult,
    };
}
