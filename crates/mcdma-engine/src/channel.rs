//! Channel lifecycle: a receive/transmit queue pair sharing one channel id.
//!
//! States: `Reserved -> Configured -> Active <-> Resetting -> Released`.
//! A channel is reserved by the allocator, configured when its queues are
//! programmed, active while serving requests, and may be reset and
//! reconfigured on a fatal per-descriptor error without losing its
//! identity or its cumulative counters.

use alloc::sync::Arc;
use alloc::vec::Vec;

use mcdma_hal::DmaError;

use crate::device::DeviceShared;
use crate::queue::Queue;
use crate::request::{Direction, Directions, Request};

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Identity claimed, queues not yet programmed.
    Reserved,
    /// Queues programmed; no request submitted yet.
    Configured,
    /// Serving requests.
    Active,
    /// Undergoing the reset-and-reconfigure sequence.
    Resetting,
    /// Identity returned to the allocator.
    Released,
}

/// A claimed DMA channel: its id, its queues, and (in dynamic allocation
/// mode) the physical channel its logical id maps to.
pub struct Channel {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) id: u32,
    pub(crate) phys_chan: Option<u32>,
    /// Directions reserved with the allocator; released on teardown even
    /// if queue configuration never finished.
    pub(crate) dirs: Directions,
    pub(crate) rx: Option<Queue>,
    pub(crate) tx: Option<Queue>,
    pub(crate) state: ChannelState,
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("phys_chan", &self.phys_chan)
            .field("dirs", &self.dirs)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// The channel id (logical id in dynamic allocation mode).
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The physical channel this logical id maps to, when dynamically
    /// allocated.
    #[must_use]
    pub fn phys_chan(&self) -> Option<u32> {
        self.phys_chan
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// The directions this channel was acquired for.
    #[must_use]
    pub fn directions(&self) -> Directions {
        self.dirs
    }

    /// Returns the queue for `dir`.
    ///
    /// # Errors
    ///
    /// [`DmaError::ChannelUnavailable`] when the channel was not acquired
    /// for that direction.
    pub fn queue(&mut self, dir: Direction) -> Result<&mut Queue, DmaError> {
        let queue = match dir {
            Direction::Rx => self.rx.as_mut(),
            Direction::Tx => self.tx.as_mut(),
        };
        queue.ok_or(DmaError::ChannelUnavailable)
    }

    pub(crate) fn queue_ref(&self, dir: Direction) -> Result<&Queue, DmaError> {
        let queue = match dir {
            Direction::Rx => self.rx.as_ref(),
            Direction::Tx => self.tx.as_ref(),
        };
        queue.ok_or(DmaError::ChannelUnavailable)
    }

    /// Prepares a request on the queue for `dir`.
    ///
    /// # Errors
    ///
    /// As [`Queue::prepare`]; the request rides back with the error.
    pub fn prepare(&mut self, dir: Direction, request: Request) -> Result<(), (DmaError, Request)> {
        let queue = match self.queue(dir) {
            Ok(q) => q,
            Err(e) => return Err((e, request)),
        };
        queue.prepare(request)?;
        self.state = ChannelState::Active;
        Ok(())
    }

    /// Submits prepared requests on the queue for `dir`.
    ///
    /// # Errors
    ///
    /// [`DmaError::ChannelUnavailable`] for an unacquired direction.
    pub fn submit(&mut self, dir: Direction) -> Result<(), DmaError> {
        self.queue(dir)?.submit();
        Ok(())
    }

    /// Prepares and submits in one call.
    ///
    /// # Errors
    ///
    /// As [`Channel::prepare`].
    pub fn start(&mut self, dir: Direction, request: Request) -> Result<(), (DmaError, Request)> {
        self.prepare(dir, request)?;
        // prepare() established that the direction exists.
        let _ = self.submit(dir);
        Ok(())
    }

    /// Polls for completed requests on `dir`, appending up to `max` to
    /// `out`.
    ///
    /// Hardware faults that require recovery (`TidError`, fetch errors)
    /// run the reset-and-reconfigure sequence here: requests still on the
    /// ring are appended to `out` unfinished (their accounting is
    /// preserved), the queue is reprogrammed with its counters intact, and
    /// the error is returned after the callback fired.
    ///
    /// # Errors
    ///
    /// The detected hardware error, or [`DmaError::ResetTimeout`] if
    /// recovery itself failed.
    pub fn poll(
        &mut self,
        dir: Direction,
        out: &mut Vec<Request>,
        max: usize,
    ) -> Result<usize, DmaError> {
        let queue = self.queue(dir)?;
        match queue.poll(out, max) {
            Ok(n) => Ok(n),
            Err(error) if error.requires_reset() => {
                let orphans = self.reset(dir)?;
                out.extend(orphans);
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Runs the reset-and-reconfigure sequence on one queue.
    ///
    /// Returns the requests that were still in flight; cumulative
    /// counters survive.
    ///
    /// # Errors
    ///
    /// [`DmaError::ResetTimeout`] when the reset register does not
    /// deassert, or [`DmaError::ChannelUnavailable`] for an unacquired
    /// direction.
    pub fn reset(&mut self, dir: Direction) -> Result<Vec<Request>, DmaError> {
        self.state = ChannelState::Resetting;
        let channel_id = self.id;
        let queue = self.queue(dir)?;
        queue.reset_hw()?;
        let orphans = queue.ring.reinit();
        queue.program_csr();
        queue.stats.resets += 1;
        self.state = ChannelState::Configured;
        log::warn!(
            "channel {channel_id} {dir:?} reset, {} in-flight requests returned",
            orphans.len()
        );
        Ok(orphans)
    }

    /// Releases the channel: disables and resets its queues, frees ring
    /// memory, and returns the identity to the allocator.
    ///
    /// Returns any requests that were still in flight.
    pub fn release(mut self) -> Vec<Request> {
        self.teardown()
    }

    fn teardown(&mut self) -> Vec<Request> {
        let mut orphans = Vec::new();
        for queue in [self.rx.as_mut(), self.tx.as_mut()].into_iter().flatten() {
            queue.shutdown();
            orphans.append(&mut queue.ring.reinit());
        }
        self.rx = None;
        self.tx = None;
        if self.state != ChannelState::Released {
            self.state = ChannelState::Released;
            self.shared
                .release_identity(self.id, self.phys_chan, self.dirs);
        }
        orphans
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.state != ChannelState::Released {
            self.teardown();
        }
    }
}
