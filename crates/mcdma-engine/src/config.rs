//! Device configuration.

use crate::completion::CompletionMode;
use mcdma_hal::DmaError;

/// How channel identities are claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Per-direction software bitmaps; no hardware tables involved.
    Static,
    /// The COI/FCOI/L2P hardware-table protocol behind the device's
    /// arbitration lock.
    Dynamic,
}

/// The data interface variant the IP was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    /// Byte stream with SOF/EOF framing (AVST).
    Streaming,
    /// Flat memory-mapped transfers addressed per request (AVMM).
    MemoryMapped,
}

/// Selects a channel at acquisition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelId {
    /// Any free channel.
    Any,
    /// A specific channel number.
    Index(u32),
}

/// Device-wide configuration, fixed at open time.
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// Number of channels exposed by the device.
    pub num_channels: u32,
    /// Descriptors per hardware ring page, including the terminating link
    /// slot. Must be a power of two.
    pub desc_per_page: u32,
    /// Ring pages per queue. Must be a power of two, at most
    /// [`DeviceConfig::MAX_PAGES`].
    pub pages_per_queue: u32,
    /// Completion-detection strategy for every queue on this device.
    pub completion_mode: CompletionMode,
    /// Data interface variant.
    pub interface: Interface,
    /// Channel allocation mode.
    pub alloc_mode: AllocMode,
    /// Streaming payload size hint programmed per queue, in bytes.
    pub payload_size: u32,
    /// Write-back batch delay programmed per queue.
    pub batch_delay: u32,
    /// Polls of the reset register before reporting [`DmaError::ResetTimeout`].
    pub reset_wait: u32,
    /// Polls of the head pointer during the ring-end tail workaround.
    pub head_move_wait: u32,
    /// Attempts at the hardware arbitration lock before reporting
    /// [`DmaError::HardwareLockTimeout`].
    pub lock_wait: u32,
}

impl DeviceConfig {
    /// Largest supported ring page count.
    pub const MAX_PAGES: u32 = 64;

    /// Streaming payload alignment for non-EOF descriptors.
    pub const STREAM_ALIGN: u32 = 64;

    /// Maximum transferrable unit on the streaming interface: 1500-byte
    /// payload plus Ethernet header and CRC.
    pub const MTU_LEN: u32 = 1518;

    /// Validates the ring geometry and mode combination.
    ///
    /// # Errors
    ///
    /// [`DmaError::InvalidGeometry`] if a page or channel count is zero or
    /// not a power of two, or the page count exceeds the hardware maximum.
    pub fn validate(&self) -> Result<(), DmaError> {
        if self.num_channels == 0
            || !self.desc_per_page.is_power_of_two()
            || !self.pages_per_queue.is_power_of_two()
            || self.pages_per_queue > Self::MAX_PAGES
        {
            return Err(DmaError::InvalidGeometry);
        }
        Ok(())
    }

    /// Ring length in descriptor slots.
    #[must_use]
    pub const fn queue_len(&self) -> u32 {
        self.desc_per_page * self.pages_per_queue
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            num_channels: 512,
            desc_per_page: 128,
            pages_per_queue: 32,
            completion_mode: CompletionMode::WriteBack,
            interface: Interface::Streaming,
            alloc_mode: AllocMode::Static,
            payload_size: 4096,
            batch_delay: 1,
            reset_wait: 2048,
            head_move_wait: 100_000,
            lock_wait: 2048,
        }
    }
}
