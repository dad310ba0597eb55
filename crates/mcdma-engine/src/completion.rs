//! Completion detection and the per-poll hardware error scan.
//!
//! Three interchangeable strategies, selected per device at configuration
//! time and fixed for a queue's lifetime:
//!
//! - **Write-back**: hardware writes its consumed-head counter into a
//!   DMA-mapped host cell at its own cadence; the tracker reads that cell
//!   with acquire ordering and never touches a register.
//! - **Register-poll**: the tracker reads the completed-pointer register on
//!   every poll.
//! - **MSI-X**: the caller blocks in [`crate::poll::PollSet::wait`] and, on
//!   wakeup, polls exactly as in write-back mode; hardware errors reach the
//!   queue's error callback.
//!
//! The consumed-head counter is a 16-bit rolling value independent of the
//! ring length: a poll that finds the ring-relative head unchanged must
//! compare the raw counter as well, because a full lap of the ring looks
//! identical to no progress otherwise.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering, fence};

use mcdma_hal::DmaError;

use crate::desc::MAX_LEN;
use crate::queue::Queue;
use crate::regs;
use crate::request::{Direction, Request, RequestFlags};
use crate::ring::SlotIndex;

/// Descriptor-completion reporting strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Hardware writes the consumed head into a host memory cell.
    WriteBack,
    /// Software reads the completed-pointer register.
    RegisterPoll,
    /// Interrupt-driven: block on an event, then read as in write-back.
    Msix,
}

/// A hardware error surfaced to the caller's error callback, with enough
/// context to decide policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorEvent {
    /// Channel the error was detected on.
    pub channel: u32,
    /// Queue direction the error was detected on.
    pub direction: Direction,
    /// The detected condition.
    pub error: DmaError,
}

/// Caller-supplied error-aware callback.
pub type ErrorCallback = Box<dyn FnMut(&ErrorEvent) + Send>;

impl Queue {
    /// Registers the error callback invoked when the per-poll scan or an
    /// interrupt wakeup detects a hardware error on this queue.
    pub fn set_error_handler(&mut self, handler: ErrorCallback) {
        self.on_error = Some(handler);
    }

    pub(crate) fn fire_error(&mut self, error: DmaError) {
        let event = ErrorEvent {
            channel: self.channel_id,
            direction: self.dir,
            error,
        };
        if let Some(handler) = self.on_error.as_mut() {
            handler(&event);
        }
    }

    /// Reads the raw consumed-head value, error bits included.
    ///
    /// In write-back and MSI-X modes this is an acquire load from the
    /// DMA-mapped cell; in register-poll mode it is a register read.
    pub(crate) fn raw_head(&self) -> u32 {
        match self.mode {
            CompletionMode::RegisterPoll => {
                let v = self.reg_read(regs::Q_COMPLETED_POINTER);
                fence(Ordering::Acquire);
                v
            }
            CompletionMode::WriteBack | CompletionMode::Msix => self.wb_cell_raw(),
        }
    }

    /// Acquire load of the write-back cell, regardless of mode.
    pub(crate) fn wb_cell_raw(&self) -> u32 {
        let ptr = self.wb_cell.virt().cast::<AtomicU32>();
        // SAFETY: the cell is a live, 4-byte-aligned DMA allocation owned
        // by this queue; hardware writes it concurrently, which is exactly
        // what the atomic acquire load is for.
        unsafe { &*ptr }.load(Ordering::Acquire)
    }

    /// The hardware-consumed counter with error bits masked off.
    pub(crate) fn head_count(&self) -> u32 {
        self.raw_head() & 0xFFFF
    }

    /// Number of descriptor slots hardware has consumed since the last
    /// poll, in ring slots (link slots included).
    ///
    /// Returns `qlen` when the ring-relative head matches the software
    /// head but the raw counter advanced: the ring lapped exactly once
    /// since the last poll.
    pub(crate) fn consumed_count(&mut self) -> u32 {
        let qlen = self.qlen();
        let raw = self.head_count();
        let ring_head = SlotIndex::new(raw % qlen, qlen);

        let consumed = if ring_head == self.head && raw != self.processed_head {
            qlen
        } else {
            ring_head.distance_from(self.head, qlen)
        };
        self.processed_head = raw;
        consumed
    }

    /// Harvests up to `max` completed requests into `out`, in submission
    /// order, skipping link and invalid descriptors.
    fn harvest(&mut self, out: &mut Vec<Request>, max: usize) -> usize {
        let qlen = self.qlen();
        let mut remaining = self.consumed_count();
        let mut taken = 0;
        let mut pos = self.head;

        while remaining > 0 {
            let d = self.ring.read(pos);
            if d.link() || d.desc_invalid() {
                // Consumed by hardware, but carries no payload.
                pos = pos.step(qlen);
                remaining -= 1;
                continue;
            }
            if taken >= max {
                break;
            }
            let Some(mut request) = self.ring.take_slot(pos) else {
                log::error!(
                    "channel {} {:?}: completed slot {} has no context",
                    self.channel_id,
                    self.dir,
                    pos.as_u32()
                );
                break;
            };
            if self.dir == Direction::Rx {
                request.flags = RequestFlags::empty();
                if d.sof() {
                    request.flags |= RequestFlags::SOF;
                }
                if d.eof() {
                    request.flags |= RequestFlags::EOF;
                    // A payload count of zero stands for the full 1 MiB.
                    request.payload_len = match d.rx_pyld_cnt() {
                        0 => u64::from(MAX_LEN),
                        n => u64::from(n),
                    };
                }
                request.metadata = d.src();
            }
            out.push(request);
            taken += 1;
            pos = pos.step(qlen);
            remaining -= 1;
        }

        self.head = pos;
        self.stats.processed += taken as u64;
        taken
    }

    /// Scans the queue's error registers and the consumed-head error bits.
    ///
    /// Drop counts are accumulated into the cumulative statistics and the
    /// counter register is cleared; the completion-timeout latch is
    /// cleared in-register. Returns the highest-priority condition found.
    pub(crate) fn scan_errors(&mut self) -> Option<DmaError> {
        let drop_reg = self.reg_read(regs::Q_DATA_DRP_ERR_CTR);
        if drop_reg & regs::DROP_PRESENT_BIT != 0 {
            let drops = drop_reg & 0xFFFF;
            self.stats.data_drops += u64::from(drops);
            self.stats.tid_errors += 1;
            self.reg_write(regs::Q_DATA_DRP_ERR_CTR, drop_reg & regs::DROP_CLEAR_MASK);
            return Some(DmaError::TidError);
        }

        let cpl_timeout = self.reg_read(regs::Q_CPL_TIMEOUT);
        let raw = self.wb_cell_raw();
        let desc_fetch = raw & regs::CONSUMED_HEAD_DESC_FETCH_ERR != 0;
        let data_fetch = raw & regs::CONSUMED_HEAD_DATA_FETCH_ERR != 0;

        if cpl_timeout & 1 != 0 {
            self.reg_write(regs::Q_CPL_TIMEOUT, cpl_timeout & !1);
            self.stats.completion_timeouts += 1;
            return Some(DmaError::CompletionTimeout);
        }
        if desc_fetch {
            self.stats.fetch_errors += 1;
            return Some(DmaError::DescriptorFetchError);
        }
        if data_fetch {
            self.stats.fetch_errors += 1;
            return Some(DmaError::DataFetchError);
        }
        None
    }

    /// Polls for completed requests.
    ///
    /// Appends up to `max` completed requests to `out` and returns how
    /// many were appended. The per-poll error scan runs after the
    /// harvest; a detected hardware error is delivered to the error
    /// callback and returned.
    ///
    /// # Errors
    ///
    /// [`DmaError::TidError`], [`DmaError::DescriptorFetchError`],
    /// [`DmaError::DataFetchError`] -- the caller (or the owning
    /// [`crate::channel::Channel`]) must run the reset sequence.
    /// [`DmaError::CompletionTimeout`] is cleared and reported through the
    /// callback only; it does not fail the poll.
    pub fn poll(&mut self, out: &mut Vec<Request>, max: usize) -> Result<usize, DmaError> {
        let taken = self.harvest(out, max);
        match self.scan_errors() {
            None => Ok(taken),
            Some(DmaError::CompletionTimeout) => {
                self.fire_error(DmaError::CompletionTimeout);
                Ok(taken)
            }
            Some(error) => {
                self.fire_error(error);
                Err(error)
            }
        }
    }
}
