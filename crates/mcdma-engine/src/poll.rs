//! Multiplexed event wait for MSI-X completion mode.
//!
//! Each queue configured for MSI-X owns one event handle, registered
//! against its channel/direction interrupt vector. A [`PollSet`] collects
//! the handles a polling context cares about and blocks in the backend's
//! multiplexed wait. An event for a channel/direction is only ever
//! delivered to a set that added that channel/direction.
//!
//! Waking is a hint, not a result: after a wakeup the caller polls the
//! indicated queue, which computes the real completion count and runs the
//! error scan exactly as in write-back mode.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use mcdma_hal::{DmaError, EventHandle};

use crate::channel::Channel;
use crate::device::DeviceShared;
use crate::request::Direction;

/// A wakeup delivered by [`PollSet::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    /// Channel the interrupt fired for.
    pub channel: u32,
    /// Queue direction the interrupt fired for.
    pub direction: Direction,
}

struct PollEntry {
    event: EventHandle,
    channel: u32,
    direction: Direction,
}

/// A set of queue completion events waited on together.
pub struct PollSet {
    shared: Arc<DeviceShared>,
    entries: Vec<PollEntry>,
}

impl PollSet {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Self {
        Self {
            shared,
            entries: Vec::new(),
        }
    }

    /// Adds a channel's queue for `dir` to the set.
    ///
    /// # Errors
    ///
    /// [`DmaError::ChannelUnavailable`] for an unacquired direction, or
    /// [`DmaError::Unsupported`] when the queue has no event (not in
    /// MSI-X mode).
    pub fn add(&mut self, channel: &Channel, dir: Direction) -> Result<(), DmaError> {
        let queue = channel.queue_ref(dir)?;
        let event = queue.event.ok_or(DmaError::Unsupported)?;
        self.entries.push(PollEntry {
            event,
            channel: channel.id(),
            direction: dir,
        });
        Ok(())
    }

    /// Number of registered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Blocks for up to `timeout_ms` and appends a [`PollEvent`] for each
    /// fired handle to `out`.
    ///
    /// Returns the number of events delivered; 0 means the wait timed
    /// out.
    ///
    /// # Errors
    ///
    /// [`DmaError::Unsupported`] when the backend has no event plumbing.
    pub fn wait(&self, out: &mut Vec<PollEvent>, timeout_ms: u32) -> Result<usize, DmaError> {
        if self.entries.is_empty() {
            return Ok(0);
        }
        let handles: Vec<EventHandle> = self.entries.iter().map(|e| e.event).collect();
        let mut fired = vec![EventHandle::from_raw(0); handles.len()];
        let n = self
            .shared
            .hw
            .wait_events(&handles, &mut fired, timeout_ms)?;

        let mut delivered = 0;
        for handle in &fired[..n] {
            if let Some(entry) = self.entries.iter().find(|e| e.event == *handle) {
                out.push(PollEvent {
                    channel: entry.channel,
                    direction: entry.direction,
                });
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}
