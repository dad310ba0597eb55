//! The descriptor ring and its software slot context.

use alloc::sync::Arc;
use alloc::vec::Vec;

use mcdma_hal::{DmaError, DmaRegion, HardwareAccess, PhysAddr};

use crate::desc::{DESC_SIZE, Descriptor};
use crate::request::Request;

/// A position in a descriptor ring.
///
/// All ring arithmetic goes through this newtype so the wraparound and
/// link-skip logic lives in one place instead of being re-derived at every
/// call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotIndex(u32);

impl SlotIndex {
    /// The ring origin.
    pub const ZERO: Self = Self(0);

    /// Creates a slot index, reducing `raw` into the ring.
    #[must_use]
    pub const fn new(raw: u32, qlen: u32) -> Self {
        Self(raw % qlen)
    }

    /// Returns the raw slot number.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the slot number as a container index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the next slot, wrapping at `qlen`.
    #[must_use]
    pub const fn step(self, qlen: u32) -> Self {
        Self((self.0 + 1) % qlen)
    }

    /// Returns the previous slot, wrapping at `qlen`.
    #[must_use]
    pub const fn back(self, qlen: u32) -> Self {
        Self((self.0 + qlen - 1) % qlen)
    }

    /// Returns the number of steps from `from` to `self`, wrapping at
    /// `qlen`.
    #[must_use]
    pub const fn distance_from(self, from: Self, qlen: u32) -> u32 {
        (self.0 + qlen - from.0) % qlen
    }

    /// Returns `true` if this slot is the last slot of the ring.
    #[must_use]
    pub const fn is_ring_end(self, qlen: u32) -> bool {
        self.0 == qlen - 1
    }
}

/// A fixed-size circular buffer of hardware descriptors plus the parallel
/// slot-context array mapping ring positions to in-flight requests.
///
/// The last descriptor of every page carries the `link` flag and points at
/// the physical base of the next page; the last page links back to the
/// ring origin.
pub struct DescriptorRing {
    hw: Arc<dyn HardwareAccess>,
    mem: DmaRegion,
    qlen: u32,
    desc_per_page: u32,
    slots: Vec<Option<Request>>,
}

impl DescriptorRing {
    /// Allocates and initializes a ring of `pages * desc_per_page`
    /// descriptors in DMA memory.
    ///
    /// # Errors
    ///
    /// [`DmaError::AllocationFailure`] if DMA memory cannot be obtained.
    pub fn new(
        hw: Arc<dyn HardwareAccess>,
        pages: u32,
        desc_per_page: u32,
    ) -> Result<Self, DmaError> {
        let qlen = pages * desc_per_page;
        let mem = hw.alloc_dma(qlen as usize * DESC_SIZE)?;

        let mut slots = Vec::new();
        if slots.try_reserve_exact(qlen as usize).is_err() {
            // SAFETY: mem was just allocated from hw and is unused.
            unsafe { hw.free_dma(mem) };
            return Err(DmaError::AllocationFailure);
        }
        slots.resize_with(qlen as usize, || None);

        let mut ring = Self {
            hw,
            mem,
            qlen,
            desc_per_page,
            slots,
        };
        ring.chain_pages();
        Ok(ring)
    }

    /// Ring length in descriptor slots, link slots included.
    #[must_use]
    pub const fn qlen(&self) -> u32 {
        self.qlen
    }

    /// Physical base address of the ring, as programmed into the start
    /// address registers.
    #[must_use]
    pub const fn phys(&self) -> PhysAddr {
        self.mem.phys()
    }

    /// Writes the per-page link descriptors. All other descriptors are
    /// left zeroed (the allocation is zero-filled).
    fn chain_pages(&mut self) {
        let mut page_end = self.desc_per_page;
        while page_end <= self.qlen {
            let idx = SlotIndex::new(page_end - 1, self.qlen);
            let mut link = Descriptor::zeroed();
            link.set_link(true);
            let target = if page_end == self.qlen {
                self.mem.phys()
            } else {
                self.mem.phys().add(u64::from(page_end) * DESC_SIZE as u64)
            };
            link.set_src(target.as_u64());
            self.write(idx, &link);
            page_end += self.desc_per_page;
        }
    }

    /// Reads the descriptor at `idx`.
    #[must_use]
    pub fn read(&self, idx: SlotIndex) -> Descriptor {
        debug_assert!(idx.as_u32() < self.qlen);
        let ptr = self
            .mem
            .ptr_at(idx.index() * DESC_SIZE)
            .expect("slot within ring")
            .cast::<[u8; DESC_SIZE]>();
        // SAFETY: the pointer is within the ring allocation; hardware may
        // update the descriptor concurrently, so the read is volatile.
        Descriptor::from_bytes(unsafe { core::ptr::read_volatile(ptr) })
    }

    /// Writes the descriptor at `idx`.
    pub fn write(&mut self, idx: SlotIndex, desc: &Descriptor) {
        debug_assert!(idx.as_u32() < self.qlen);
        let ptr = self
            .mem
            .ptr_at(idx.index() * DESC_SIZE)
            .expect("slot within ring")
            .cast::<[u8; DESC_SIZE]>();
        // SAFETY: as in read; hardware reads descriptors via DMA, so the
        // write is volatile.
        unsafe { core::ptr::write_volatile(ptr, *desc.as_bytes()) };
    }

    /// Records the in-flight request for `idx`.
    pub fn put_slot(&mut self, idx: SlotIndex, request: Request) {
        self.slots[idx.index()] = Some(request);
    }

    /// Takes the in-flight request recorded for `idx`, if any.
    pub fn take_slot(&mut self, idx: SlotIndex) -> Option<Request> {
        self.slots[idx.index()].take()
    }

    /// Re-zeros every descriptor, re-chains the pages, and drains all
    /// outstanding requests so no accounting is lost across a reset.
    pub fn reinit(&mut self) -> Vec<Request> {
        for i in 0..self.qlen {
            self.write(SlotIndex::new(i, self.qlen), &Descriptor::zeroed());
        }
        self.chain_pages();
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

impl Drop for DescriptorRing {
    fn drop(&mut self) {
        // SAFETY: the owning queue disables and resets the hardware before
        // the ring is dropped, so no DMA references the allocation.
        unsafe { self.hw.free_dma(self.mem) };
    }
}

// SAFETY: The ring is a single-owner structure; the DMA region it wraps is
// only shared with the device, which is reached through volatile access.
unsafe impl Send for DescriptorRing {}
