//! pktq-shm: batched multi-producer packet capture queues over shared memory.
//!
//! Captured packets move from any number of producer threads into a single
//! consumer through one memory region, with no lock on the enqueue path.
//! The region holds one receive queue and [`MAX_TX_QUEUES`] transmit queues.
//!
//! # Receive queue
//!
//! The receive queue is a pair of sub-buffers behind one atomic index word
//! (8-bit queue index, 24-bit occupancy). A producer reserves a whole batch
//! with a single `fetch_add`, fills its private slots and publishes each one
//! by storing the queue index into the slot's commit byte. The consumer
//! swaps sub-buffers by bumping the index and reads the one it froze.
//!
//! ```text
//!            producers                                  consumer
//!   ┌──────────┐ ┌──────────┐                      ┌──────────────┐
//!   │ batch A  │ │ batch B  │   fetch_add(n)       │   RxReader   │
//!   └────┬─────┘ └────┬─────┘ ─────────────┐       └──────┬───────┘
//!        │            │                    ▼              │ swap_next()
//!        ▼            ▼          ┌───────────────────┐    │
//!   ┌──────────────────────┐     │ index:8 │ count:24│◄───┘
//!   │ sub-buffer (index&1) │     └───────────────────┘
//!   │ slot │ slot │ slot … │  commit = index (release)
//!   └──────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! [`SharedRegion`] owns the memory. Producers and readers enter it through
//! an in-flight counted [`RegionGuard`]; disable unpublishes, waits out the
//! grace period and every guard, then frees.
//!
//! # Wake-ups
//!
//! Producers never block. They wake a parked consumer when a batch overflows
//! the active sub-buffer and every [`WakePolicy::interval`] slots, through a
//! [`Notifier`]: a [`WaitQueue`] in-process or a [`Doorbell`] across
//! processes.

mod config;
pub mod doorbell;
mod endpoint;
mod enqueue;
mod error;
pub mod layout;
mod packet;
mod reader;
mod region;
mod wake;

pub use config::{
    Backing, QueueConfig, DEFAULT_CAPLEN, DEFAULT_COMMIT_TIMEOUT, DEFAULT_GRACE_PERIOD,
    DEFAULT_RX_QUEUE_SIZE, DEFAULT_TX_MAX_LEN, DEFAULT_TX_QUEUE_SIZE, DEFAULT_WAKE_INTERVAL,
};
pub use doorbell::Doorbell;
pub use endpoint::{Endpoint, QueueStats, StatsSnapshot};
pub use enqueue::{enqueue_batch, BatchParams, EnqueueOutcome};
pub use error::{CopyError, LayoutError, RegionError};
pub use layout::{
    IndexWord, PackedIndex, RegionGeometry, RegionHeader, RegionView, RxQueue, RxQueueHeader,
    SlotHeader, SlotMeta, TxQueue, TxQueueHeader, WriterGuard, MAX_RX_QUEUE_SIZE, MAX_TX_QUEUES,
};
pub use packet::{batch_len, selected, Packet, PacketBuffer, PacketMeta, MAX_BATCH};
pub use reader::{RxBatch, RxReader, SlotView, Slots};
pub use region::{RegionGuard, RegionState, SharedRegion, HUGE_PAGE_SIZE};
pub use wake::{CancelToken, Notifier, WaitQueue, WaitResult, WakeCoordinator, WakePolicy};
