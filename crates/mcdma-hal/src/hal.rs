//! The hardware access trait consumed by the queue engine.

use crate::error::DmaError;
use crate::resource::DmaRegion;

/// One direction of a DMA channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host.
    Rx,
    /// Host to device.
    Tx,
}

impl Direction {
    /// Returns the opposite direction.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Rx => Self::Tx,
            Self::Tx => Self::Rx,
        }
    }
}

/// Selects one of the device's register windows.
///
/// The queue CSR window holds the per-queue register banks (256 bytes per
/// queue); the global CSR window holds the device identity, the channel
/// arbitration registers, and the allocation tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrWindow {
    /// Per-queue control/status registers.
    Queue,
    /// Device-global control/status registers and allocation tables.
    Global,
}

/// An interrupt-backed event handle.
///
/// On a userspace backend this wraps an eventfd; in the simulator it is an
/// opaque token. The engine only creates handles, registers them against
/// interrupt vectors, and passes them to [`HardwareAccess::wait_events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

impl EventHandle {
    /// Creates an event handle from a raw backend value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw backend value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// Hardware services consumed by the queue engine.
///
/// Implemented by each backend (userspace mapped windows, kernel port,
/// simulator) and handed to the engine at device-open time. The engine
/// performs no I/O and no memory management outside this trait.
pub trait HardwareAccess: Send + Sync {
    /// Reads a 32-bit register at `offset` within `window`.
    fn read32(&self, window: CsrWindow, offset: u64) -> u32;

    /// Writes a 32-bit register at `offset` within `window`.
    fn write32(&self, window: CsrWindow, offset: u64, value: u32);

    /// Allocates `len` bytes of pinned, physically contiguous DMA memory.
    ///
    /// The returned region is zeroed.
    fn alloc_dma(&self, len: usize) -> Result<DmaRegion, DmaError>;

    /// Frees a region previously returned by [`alloc_dma`](Self::alloc_dma).
    ///
    /// # Safety
    ///
    /// The caller must ensure no in-flight DMA references the region and
    /// that `region` matches a previous allocation from this backend.
    unsafe fn free_dma(&self, region: DmaRegion);

    /// Creates a new event handle for interrupt delivery.
    fn create_event(&self) -> Result<EventHandle, DmaError>;

    /// Registers `event` to fire when interrupt vector `vector` asserts.
    fn register_event(&self, vector: u16, event: EventHandle) -> Result<(), DmaError>;

    /// Waits up to `timeout_ms` milliseconds for any of `events` to fire.
    ///
    /// Fired handles are written into `fired`; returns the number written
    /// (0 on timeout). Events for a given handle are only ever delivered to
    /// waiters that passed that handle.
    fn wait_events(
        &self,
        events: &[EventHandle],
        fired: &mut [EventHandle],
        timeout_ms: u32,
    ) -> Result<usize, DmaError>;
}
