//! Endpoint configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::LayoutError;
use crate::layout::{self, RegionGeometry, MAX_RX_QUEUE_SIZE};

/// Default rx slots per sub-buffer.
pub const DEFAULT_RX_QUEUE_SIZE: u32 = 4096;

/// Default capture length (a full Ethernet frame).
pub const DEFAULT_CAPLEN: u32 = 1514;

/// Default tx slots per queue (power of 2).
pub const DEFAULT_TX_QUEUE_SIZE: u32 = 1024;

/// Default maximum tx packet length.
pub const DEFAULT_TX_MAX_LEN: u32 = 1514;

/// Default number of committed slots between periodic consumer wake-ups.
pub const DEFAULT_WAKE_INTERVAL: u32 = 8192;

/// Default delay between unpublishing a region and freeing it.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Default time a reader waits for a reserved slot to be committed.
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_millis(10);

/// Where region memory comes from when no user address is given.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Backing {
    /// Private anonymous memory owned by this process.
    #[default]
    Anonymous,
    /// A named file (typically under `/dev/shm`) that a companion process
    /// maps to read the queues. Created on enable, removed on disable.
    Shared { path: PathBuf },
}

/// Queue geometry and behaviour, captured when an endpoint is enabled.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Rx slots per sub-buffer.
    pub rx_size: u32,
    /// Maximum payload bytes stored per packet.
    pub rx_caplen: u32,
    /// Store capture timestamps in slot headers.
    pub tstamp: bool,
    /// Committed slots between periodic wake-ups (power of 2).
    pub wake_interval: u32,
    /// Tx slots per queue (power of 2).
    pub tx_size: u32,
    /// Maximum tx packet length.
    pub tx_max_len: u32,
    pub backing: Backing,
    pub grace_period: Duration,
    pub commit_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            rx_size: DEFAULT_RX_QUEUE_SIZE,
            rx_caplen: DEFAULT_CAPLEN,
            tstamp: false,
            wake_interval: DEFAULT_WAKE_INTERVAL,
            tx_size: DEFAULT_TX_QUEUE_SIZE,
            tx_max_len: DEFAULT_TX_MAX_LEN,
            backing: Backing::Anonymous,
            grace_period: DEFAULT_GRACE_PERIOD,
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.rx_size == 0 {
            return Err(LayoutError::InvalidConfig("rx_size must be > 0"));
        }
        if self.rx_size > MAX_RX_QUEUE_SIZE {
            return Err(LayoutError::InvalidConfig("rx_size exceeds MAX_RX_QUEUE_SIZE"));
        }
        if self.rx_caplen == 0 || self.rx_caplen > u16::MAX as u32 {
            return Err(LayoutError::InvalidConfig("rx_caplen must be in 1..=65535"));
        }
        if !self.wake_interval.is_power_of_two() {
            return Err(LayoutError::InvalidConfig(
                "wake_interval must be non-zero power of 2",
            ));
        }
        if !self.tx_size.is_power_of_two() {
            return Err(LayoutError::InvalidConfig("tx_size must be non-zero power of 2"));
        }
        if self.tx_max_len == 0 {
            return Err(LayoutError::InvalidConfig("tx_max_len must be > 0"));
        }
        self.geometry().total_size_checked()?;
        Ok(())
    }

    #[inline]
    pub fn rx_slot_size(&self) -> usize {
        layout::rx_slot_size(self.rx_caplen as usize)
    }

    #[inline]
    pub fn tx_slot_size(&self) -> usize {
        layout::tx_slot_size(self.tx_max_len as usize)
    }

    pub fn geometry(&self) -> RegionGeometry {
        RegionGeometry {
            rx_size: self.rx_size as usize,
            rx_slot_size: self.rx_slot_size(),
            tx_size: self.tx_size as usize,
            tx_slot_size: self.tx_slot_size(),
        }
    }

    /// Total bytes a region with this configuration occupies.
    pub fn region_size(&self) -> Result<usize, LayoutError> {
        self.geometry().total_size_checked()
    }
}
