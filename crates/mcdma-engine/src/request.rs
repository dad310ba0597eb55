//! Application-facing transfer requests.

use bitflags::bitflags;
use mcdma_hal::PhysAddr;

pub use mcdma_hal::Direction;

bitflags! {
    /// Directions requested when acquiring a channel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Directions: u8 {
        /// Device-to-host queue.
        const RX = 1 << 0;
        /// Host-to-device queue.
        const TX = 1 << 1;
    }
}

impl Directions {
    /// Returns `true` if the set includes `dir`.
    #[must_use]
    pub const fn has(self, dir: Direction) -> bool {
        match dir {
            Direction::Rx => self.contains(Self::RX),
            Direction::Tx => self.contains(Self::TX),
        }
    }
}

impl From<Direction> for Directions {
    fn from(dir: Direction) -> Self {
        match dir {
            Direction::Rx => Self::RX,
            Direction::Tx => Self::TX,
        }
    }
}

bitflags! {
    /// Streaming framing flags carried on a request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestFlags: u32 {
        /// Start of file.
        const SOF = 1 << 0;
        /// End of file.
        const EOF = 1 << 1;
    }
}

/// A DMA transfer request.
///
/// Ownership of the request -- and of the buffer it points at -- transfers
/// to the queue at prepare time and back to the caller when the request is
/// returned by a completion poll. The buffer must not be touched while
/// hardware owns it.
#[derive(Debug)]
pub struct Request {
    /// Host-virtual buffer pointer; not dereferenced by the engine.
    pub buf: *mut u8,
    /// Pinned physical address of the buffer.
    pub phys: PhysAddr,
    /// Transfer length in bytes.
    pub len: u32,
    /// Streaming SOF/EOF flags: set by the caller on transmit, decoded
    /// from the descriptor on receive completion.
    pub flags: RequestFlags,
    /// Receive payload count reported by hardware on EOF completion.
    pub payload_len: u64,
    /// Device-side source address (memory-mapped interface, receive).
    pub src: u64,
    /// Device-side destination address (memory-mapped interface, transmit).
    pub dest: u64,
    /// Small metadata word: caller-supplied on transmit, device-reported
    /// on receive.
    pub metadata: u64,
    /// Free-use token for the caller to correlate completions.
    pub user: usize,
}

// SAFETY: The buffer pointer is a plain address into a pinned pool; the
// engine never dereferences it, and buffer ownership is handed over
// wholesale with the request.
unsafe impl Send for Request {}

impl Request {
    /// Creates a request over a pinned buffer.
    #[must_use]
    pub fn new(buf: *mut u8, phys: PhysAddr, len: u32) -> Self {
        Self {
            buf,
            phys,
            len,
            flags: RequestFlags::empty(),
            payload_len: 0,
            src: 0,
            dest: 0,
            metadata: 0,
            user: 0,
        }
    }

    /// Sets the streaming flags, builder-style.
    #[must_use]
    pub fn with_flags(mut self, flags: RequestFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the correlation token, builder-style.
    #[must_use]
    pub fn with_user(mut self, user: usize) -> Self {
        self.user = user;
        self
    }
}
