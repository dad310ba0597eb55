//! Userspace backend over caller-provided mapped windows and pinned memory.
//!
//! The OS resource layer (UIO/VFIO or equivalent) maps the BARs, pins a
//! memory pool, and translates its physical address once; this backend only
//! consumes the results. Interrupt plumbing is likewise injected through
//! [`EventOps`] -- a backend built without it simply reports
//! [`DmaError::Unsupported`] for event operations, which restricts the
//! engine to the write-back and register-poll completion modes.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::DmaError;
use crate::hal::{CsrWindow, EventHandle, HardwareAccess};
use crate::resource::{DmaRegion, MmioWindow, PinnedPool};

/// Allocation alignment for DMA carve-outs.
const DMA_ALIGN: usize = 4096;

/// Maximum number of live allocations tracked by the pool.
const MAX_ALLOCATIONS: usize = 128;

/// Caller-supplied interrupt-event plumbing.
///
/// The function pointers wrap whatever the resource layer uses to create
/// eventfds, bind them to MSI-X vectors, and perform a multiplexed wait.
#[derive(Clone, Copy)]
pub struct EventOps {
    /// Creates a new event handle.
    pub create: fn() -> Result<EventHandle, DmaError>,
    /// Binds an event handle to an interrupt vector.
    pub register: fn(u16, EventHandle) -> Result<(), DmaError>,
    /// Waits for any of the given handles, filling `fired`.
    pub wait: fn(&[EventHandle], &mut [EventHandle], u32) -> Result<usize, DmaError>,
}

/// One tracked carve-out of the pinned pool.
#[derive(Clone, Copy)]
struct PoolSlot {
    offset: usize,
    len: usize,
    in_use: bool,
}

/// Pool allocation state.
struct PoolState {
    /// Bump pointer for fresh carve-outs.
    next: usize,
    slots: [PoolSlot; MAX_ALLOCATIONS],
}

/// A [`HardwareAccess`] backend over pre-mapped BAR windows and a pinned
/// memory pool.
pub struct MappedDevice {
    queue_window: MmioWindow,
    global_window: MmioWindow,
    pool: PinnedPool,
    state: spin::Mutex<PoolState>,
    events: Option<EventOps>,
    /// Set once an out-of-bounds register access has been reported, so a
    /// misprogrammed loop does not flood the log.
    access_fault: AtomicBool,
}

impl MappedDevice {
    /// Creates a backend from mapped windows and a pinned pool.
    ///
    /// `events` may be `None` when no interrupt plumbing is available; the
    /// engine then refuses MSI-X completion mode with
    /// [`DmaError::Unsupported`].
    #[must_use]
    pub fn new(
        queue_window: MmioWindow,
        global_window: MmioWindow,
        pool: PinnedPool,
        events: Option<EventOps>,
    ) -> Self {
        Self {
            queue_window,
            global_window,
            pool,
            state: spin::Mutex::new(PoolState {
                next: 0,
                slots: [PoolSlot {
                    offset: 0,
                    len: 0,
                    in_use: false,
                }; MAX_ALLOCATIONS],
            }),
            events,
            access_fault: AtomicBool::new(false),
        }
    }

    fn window(&self, window: CsrWindow) -> &MmioWindow {
        match window {
            CsrWindow::Queue => &self.queue_window,
            CsrWindow::Global => &self.global_window,
        }
    }

    fn report_fault(&self, window: CsrWindow, offset: u64) {
        if !self.access_fault.swap(true, Ordering::Relaxed) {
            log::error!("register access out of window: {window:?} offset {offset:#x}");
        }
    }
}

const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

impl HardwareAccess for MappedDevice {
    fn read32(&self, window: CsrWindow, offset: u64) -> u32 {
        match self.window(window).ptr_at(offset) {
            // SAFETY: ptr_at bounds-checked the offset against the mapped
            // window; device registers are read with volatile semantics.
            Some(ptr) => unsafe { core::ptr::read_volatile(ptr.cast::<u32>()) },
            None => {
                self.report_fault(window, offset);
                0
            }
        }
    }

    fn write32(&self, window: CsrWindow, offset: u64, value: u32) {
        match self.window(window).ptr_at(offset) {
            // SAFETY: as in read32.
            Some(ptr) => unsafe { core::ptr::write_volatile(ptr.cast::<u32>(), value) },
            None => self.report_fault(window, offset),
        }
    }

    fn alloc_dma(&self, len: usize) -> Result<DmaRegion, DmaError> {
        if len == 0 {
            return Err(DmaError::AllocationFailure);
        }
        let len = align_up(len, DMA_ALIGN);
        let region = self.pool.region();
        let mut state = self.state.lock();

        // First fit over retired carve-outs before growing the pool.
        let mut reuse = None;
        for (i, slot) in state.slots.iter().enumerate() {
            if !slot.in_use && slot.len >= len {
                reuse = Some(i);
                break;
            }
        }
        let offset = if let Some(i) = reuse {
            state.slots[i].in_use = true;
            state.slots[i].offset
        } else {
            let offset = align_up(state.next, DMA_ALIGN);
            if offset + len > region.len() {
                return Err(DmaError::AllocationFailure);
            }
            let slot = state
                .slots
                .iter_mut()
                .find(|s| !s.in_use && s.len == 0)
                .ok_or(DmaError::AllocationFailure)?;
            *slot = PoolSlot {
                offset,
                len,
                in_use: true,
            };
            state.next = offset + len;
            offset
        };
        drop(state);

        let virt = region.ptr_at(offset).ok_or(DmaError::AllocationFailure)?;
        // SAFETY: the carve-out lies inside the pinned pool region, whose
        // virt/phys views were established at pool creation.
        let out = unsafe { DmaRegion::new(virt, region.phys().add(offset as u64), len) };
        // SAFETY: out.virt() points at `len` valid bytes of the pool.
        unsafe { core::ptr::write_bytes(out.virt(), 0, len) };
        Ok(out)
    }

    unsafe fn free_dma(&self, region: DmaRegion) {
        let base = self.pool.region().phys().as_u64();
        let offset = region.phys().as_u64().wrapping_sub(base) as usize;
        let mut state = self.state.lock();
        if let Some(slot) = state
            .slots
            .iter_mut()
            .find(|s| s.in_use && s.offset == offset)
        {
            slot.in_use = false;
        } else {
            log::warn!("free of unknown DMA region at {}", region.phys());
        }
    }

    fn create_event(&self) -> Result<EventHandle, DmaError> {
        let ops = self.events.as_ref().ok_or(DmaError::Unsupported)?;
        (ops.create)()
    }

    fn register_event(&self, vector: u16, event: EventHandle) -> Result<(), DmaError> {
        let ops = self.events.as_ref().ok_or(DmaError::Unsupported)?;
        (ops.register)(vector, event)
    }

    fn wait_events(
        &self,
        events: &[EventHandle],
        fired: &mut [EventHandle],
        timeout_ms: u32,
    ) -> Result<usize, DmaError> {
        let ops = self.events.as_ref().ok_or(DmaError::Unsupported)?;
        (ops.wait)(events, fired, timeout_ms)
    }
}
