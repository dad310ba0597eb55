//! Engine error types.

use core::fmt;

/// Errors reported by the MCDMA engine and its hardware backends.
///
/// The first group is returned synchronously from the call site that
/// detected the condition and is never retried internally. The second group
/// describes hardware-detected runtime faults surfaced through the
/// completion path; of those, `TidError` and the fetch errors trigger the
/// channel reset-and-reconfigure sequence, while `CompletionTimeout` is
/// cleared in-register and only reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// DMA-able memory could not be obtained.
    AllocationFailure,
    /// The requested ring geometry is unsupported (page count not a power
    /// of two, or above the hardware maximum).
    InvalidGeometry,
    /// No free descriptor slot is available on the queue.
    QueueFull,
    /// Protocol misuse on the streaming interface, e.g. EOF without an
    /// open SOF.
    InvalidSequence,
    /// The request length is zero or violates the streaming alignment
    /// rules for non-EOF descriptors.
    InvalidLength,
    /// No channel can be claimed: the bitmap or occupancy table is
    /// exhausted, or the requested channel is already owned.
    ChannelUnavailable,
    /// The hardware arbitration lock could not be taken within the retry
    /// budget.
    HardwareLockTimeout,
    /// The hardware reported dropped transactions on this queue.
    TidError,
    /// The hardware reported a completion timeout on this queue.
    CompletionTimeout,
    /// The hardware failed to fetch a descriptor.
    DescriptorFetchError,
    /// The hardware failed to fetch payload data.
    DataFetchError,
    /// The queue reset register did not deassert within the wait budget.
    ResetTimeout,
    /// The backend does not implement the requested operation (e.g. event
    /// waits on a backend without interrupt plumbing).
    Unsupported,
}

impl DmaError {
    /// Returns `true` for hardware faults that require the owning channel
    /// to go through the reset-and-reconfigure sequence.
    #[must_use]
    pub const fn requires_reset(self) -> bool {
        matches!(
            self,
            Self::TidError | Self::DescriptorFetchError | Self::DataFetchError
        )
    }
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailure => f.write_str("DMA memory allocation failed"),
            Self::InvalidGeometry => f.write_str("unsupported ring geometry"),
            Self::QueueFull => f.write_str("no free descriptor slot"),
            Self::InvalidSequence => f.write_str("EOF without open SOF"),
            Self::InvalidLength => f.write_str("invalid request length"),
            Self::ChannelUnavailable => f.write_str("no channel available"),
            Self::HardwareLockTimeout => f.write_str("hardware lock not granted"),
            Self::TidError => f.write_str("hardware dropped transactions"),
            Self::CompletionTimeout => f.write_str("hardware completion timeout"),
            Self::DescriptorFetchError => f.write_str("descriptor fetch failed"),
            Self::DataFetchError => f.write_str("data fetch failed"),
            Self::ResetTimeout => f.write_str("queue reset did not deassert"),
            Self::Unsupported => f.write_str("operation not supported by backend"),
        }
    }
}
