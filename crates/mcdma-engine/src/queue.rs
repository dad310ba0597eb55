//! One direction of one channel: the prepare/submit path.
//!
//! A queue is single-producer and single-consumer: the thread that calls
//! [`Queue::prepare`]/[`Queue::submit`] for a direction must be the thread
//! that polls its completions. No internal locking protects the ring
//! indices. The receive and transmit queues of a channel are independent
//! and may be driven by different threads.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering, fence};

use mcdma_hal::{CsrWindow, DmaError, DmaRegion, EventHandle, HardwareAccess};

use crate::completion::{CompletionMode, ErrorCallback};
use crate::config::{DeviceConfig, Interface};
use crate::desc::{Descriptor, MAX_LEN};
use crate::regs;
use crate::request::{Direction, Request, RequestFlags};
use crate::ring::{DescriptorRing, SlotIndex};
use crate::stats::QueueStats;

/// MSI-X vector for a queue's completion interrupt.
#[must_use]
pub(crate) const fn msix_vector(channel_id: u32, dir: Direction) -> u16 {
    let base = (channel_id * 4) as u16;
    match dir {
        Direction::Tx => base,
        Direction::Rx => base + 2,
    }
}

/// One direction of a channel: descriptor ring, head/tail bookkeeping, and
/// the completion-mode selector.
pub struct Queue {
    pub(crate) hw: Arc<dyn HardwareAccess>,
    pub(crate) config: DeviceConfig,
    pub(crate) channel_id: u32,
    pub(crate) dir: Direction,
    /// Base offset of this queue's CSR bank.
    pub(crate) bank: u64,
    pub(crate) ring: DescriptorRing,
    /// DMA cell the hardware writes its consumed head into.
    pub(crate) wb_cell: DmaRegion,
    pub(crate) mode: CompletionMode,
    /// Software-consumed ring position.
    pub(crate) head: SlotIndex,
    /// Software-produced ring position.
    pub(crate) tail: SlotIndex,
    /// Raw hardware counter observed by the previous poll.
    pub(crate) processed_head: u32,
    /// Tail value last flushed to the tail register.
    pub(crate) processed_tail: u32,
    /// Rolling descriptor index, independent of ring position.
    pub(crate) didx: u16,
    /// Streaming SOF-open state: set by a SOF request, cleared by EOF.
    pub(crate) sof_open: bool,
    /// Set after each submit; the first descriptor of the next batch
    /// carries the completion-signal flags.
    pub(crate) batch_done: bool,
    /// didx of the first descriptor of the current batch.
    pub(crate) first_didx: u16,
    /// Completion event handle (MSI-X mode).
    pub(crate) event: Option<EventHandle>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) stats: QueueStats,
}

impl Queue {
    /// Allocates the ring and write-back cell for a queue and programs its
    /// CSR bank.
    ///
    /// # Errors
    ///
    /// [`DmaError::AllocationFailure`] if DMA memory cannot be obtained,
    /// [`DmaError::ResetTimeout`] if the queue does not come out of reset,
    /// or an event-registration error in MSI-X mode.
    pub(crate) fn new(
        hw: Arc<dyn HardwareAccess>,
        config: DeviceConfig,
        channel_id: u32,
        dir: Direction,
    ) -> Result<Self, DmaError> {
        let ring = DescriptorRing::new(hw.clone(), config.pages_per_queue, config.desc_per_page)?;
        let wb_cell = hw.alloc_dma(64)?;

        let mut queue = Self {
            bank: regs::queue_bank_base(channel_id, dir),
            mode: config.completion_mode,
            hw,
            config,
            channel_id,
            dir,
            ring,
            wb_cell,
            head: SlotIndex::ZERO,
            tail: SlotIndex::ZERO,
            processed_head: 0,
            processed_tail: 0,
            didx: 0,
            sof_open: false,
            batch_done: true,
            first_didx: 0,
            event: None,
            on_error: None,
            stats: QueueStats::default(),
        };

        if queue.mode == CompletionMode::Msix {
            let event = queue.hw.create_event()?;
            queue
                .hw
                .register_event(msix_vector(channel_id, dir), event)?;
            queue.event = Some(event);
        }

        queue.reset_hw()?;
        queue.program_csr();
        log::debug!("channel {channel_id} {dir:?} queue configured, qlen {}", queue.qlen());
        Ok(queue)
    }

    /// Ring length in descriptor slots.
    #[must_use]
    pub fn qlen(&self) -> u32 {
        self.ring.qlen()
    }

    /// Direction served by this queue.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.dir
    }

    /// Cumulative statistics; preserved across resets.
    #[must_use]
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Cumulative dropped-transaction count reported by hardware.
    #[must_use]
    pub fn drop_count(&self) -> u64 {
        self.stats.data_drops
    }

    pub(crate) fn reg_read(&self, reg: u64) -> u32 {
        self.hw.read32(CsrWindow::Queue, self.bank + reg)
    }

    pub(crate) fn reg_write(&self, reg: u64, value: u32) {
        self.hw.write32(CsrWindow::Queue, self.bank + reg, value);
    }

    /// Asserts the queue reset register and waits for hardware to deassert
    /// it, then clears the drop counter.
    pub(crate) fn reset_hw(&mut self) -> Result<(), DmaError> {
        self.reg_write(regs::Q_RESET, 1);
        let mut waited = 0;
        while self.reg_read(regs::Q_RESET) != 0 {
            waited += 1;
            if waited >= self.config.reset_wait {
                log::error!(
                    "channel {} {:?} queue reset did not deassert",
                    self.channel_id,
                    self.dir
                );
                return Err(DmaError::ResetTimeout);
            }
            core::hint::spin_loop();
        }
        self.reg_write(regs::Q_DATA_DRP_ERR_CTR, 0);
        Ok(())
    }

    /// Programs the CSR bank and resets the software ring state. The
    /// cumulative statistics are deliberately left untouched.
    pub(crate) fn program_csr(&mut self) {
        let qlen = self.qlen();

        // A stale counter or error bits in the write-back cell must not
        // survive a reprogram.
        let cell = self.wb_cell.virt().cast::<AtomicU32>();
        // SAFETY: the cell is this queue's live, aligned DMA allocation.
        unsafe { &*cell }.store(0, Ordering::Release);

        self.reg_write(regs::Q_START_ADDR_L, self.ring.phys().lo());
        self.reg_write(regs::Q_START_ADDR_H, self.ring.phys().hi());
        self.reg_write(regs::Q_SIZE, qlen.trailing_zeros());
        self.reg_write(regs::Q_TAIL_POINTER, 0);
        self.reg_write(regs::Q_CONSUMED_HEAD_ADDR_L, self.wb_cell.phys().lo());
        self.reg_write(regs::Q_CONSUMED_HEAD_ADDR_H, self.wb_cell.phys().hi());
        self.reg_write(regs::Q_BATCH_DELAY, self.config.batch_delay);
        if self.config.interface == Interface::Streaming {
            self.reg_write(regs::Q_PAYLOAD_SIZE, aligned_payload(self.config.payload_size));
        }

        let mut ctrl = regs::QueueCtrl::ENABLE;
        match self.mode {
            CompletionMode::WriteBack => ctrl |= regs::QueueCtrl::WB_EN,
            CompletionMode::RegisterPoll => {}
            CompletionMode::Msix => {
                ctrl |= regs::QueueCtrl::WB_EN | regs::QueueCtrl::INTR_EN;
            }
        }
        // The receive engine reports through the write-back cell in every
        // mode.
        if self.dir == Direction::Rx {
            ctrl |= regs::QueueCtrl::WB_EN;
        }
        self.reg_write(regs::Q_CTRL, ctrl.bits());

        self.head = SlotIndex::ZERO;
        self.tail = SlotIndex::ZERO;
        self.processed_head = 0;
        self.processed_tail = 0;
        self.didx = 0;
        self.sof_open = false;
        self.batch_done = true;
        self.first_didx = 0;
    }

    /// Free descriptor slots available for new requests.
    ///
    /// Computed from the rolling 16-bit counters rather than the ring
    /// positions: `didx` counts every slot ever produced (payload and
    /// link alike) and the consumed head counts every slot hardware has
    /// retired, so their difference is the exact outstanding slot count
    /// even when the ring is completely full and tail equals head.
    #[must_use]
    pub fn free_slots(&self) -> u32 {
        let outstanding = u32::from(self.didx.wrapping_sub(self.head_count() as u16));
        self.qlen().saturating_sub(outstanding)
    }

    /// Prepares a request: populates the next descriptor and advances the
    /// software tail without notifying hardware.
    ///
    /// # Errors
    ///
    /// [`DmaError::QueueFull`], [`DmaError::InvalidLength`], or
    /// [`DmaError::InvalidSequence`] (EOF without an open SOF). The
    /// rejected request is handed back with the error, so a request is
    /// never lost.
    pub fn prepare(&mut self, request: Request) -> Result<(), (DmaError, Request)> {
        let qlen = self.qlen();
        let streaming = self.config.interface == Interface::Streaming;

        if request.len == 0 || request.len >= MAX_LEN {
            return Err((DmaError::InvalidLength, request));
        }
        if streaming && self.dir == Direction::Tx {
            // Every non-final streaming descriptor must carry a full bus
            // beat; only EOF (or an MTU-sized frame) may be ragged.
            if request.len != DeviceConfig::MTU_LEN
                && request.len % DeviceConfig::STREAM_ALIGN != 0
                && !request.flags.contains(RequestFlags::EOF)
            {
                return Err((DmaError::InvalidLength, request));
            }
            if request.flags.contains(RequestFlags::EOF)
                && !request.flags.contains(RequestFlags::SOF)
                && !self.sof_open
            {
                log::error!(
                    "channel {} tx: EOF without open SOF",
                    self.channel_id
                );
                return Err((DmaError::InvalidSequence, request));
            }
        }

        // A link descriptor at the tail is skipped transparently, so the
        // request may need two slots.
        let at_link = self.ring.read(self.tail).link();
        let needed = if at_link { 2 } else { 1 };
        if self.free_slots() < needed {
            return Err((DmaError::QueueFull, request));
        }

        if at_link {
            // The link slot still consumes a descriptor index.
            self.didx = self.didx.wrapping_add(1);
            let mut link = self.ring.read(self.tail);
            link.set_didx(self.didx);
            self.ring.write(self.tail, &link);
            self.tail = self.tail.step(qlen);
        }

        let mut d = Descriptor::zeroed();
        match self.dir {
            Direction::Rx => {
                d.set_src(request.src);
                d.set_dest(request.phys.as_u64());
            }
            Direction::Tx => {
                d.set_src(request.phys.as_u64());
                d.set_dest(request.dest);
                if streaming {
                    if request.metadata != 0 {
                        d.set_dest(request.metadata);
                    }
                    if request.flags.contains(RequestFlags::SOF) {
                        d.set_sof(true);
                        self.sof_open = true;
                    }
                    if request.flags.contains(RequestFlags::EOF) {
                        d.set_eof(true);
                        self.sof_open = false;
                    }
                }
            }
        }
        d.set_len(request.len);
        d.set_pad_len(0);
        self.didx = self.didx.wrapping_add(1);
        d.set_didx(self.didx);

        // Only the first descriptor of a batch requests a completion
        // signal here; submit() marks the last one.
        if self.batch_done {
            d.set_wb_en(self.mode == CompletionMode::WriteBack);
            d.set_msix_en(self.mode == CompletionMode::Msix);
            self.batch_done = false;
            self.first_didx = self.didx;
        }

        self.ring.write(self.tail, &d);

        // Publish the descriptor before the slot context and tail move.
        fence(Ordering::Release);

        self.ring.put_slot(self.tail, request);
        self.tail = self.tail.step(qlen);
        Ok(())
    }

    /// Prepares requests from the front of `requests` until the queue
    /// fills or a request is rejected; prepared requests are removed.
    ///
    /// Returns the number prepared.
    ///
    /// # Errors
    ///
    /// The first prepare error, with the failing request put back at the
    /// front of `requests`. Requests already prepared stay on the ring.
    pub fn prepare_batch(&mut self, requests: &mut VecDeque<Request>) -> Result<usize, DmaError> {
        let mut prepared = 0;
        while let Some(request) = requests.pop_front() {
            match self.prepare(request) {
                Ok(()) => prepared += 1,
                Err((err, request)) => {
                    requests.push_front(request);
                    return Err(err);
                }
            }
        }
        Ok(prepared)
    }

    /// Flushes prepared descriptors to hardware by writing the tail
    /// register.
    ///
    /// Marks the last descriptor of the batch for completion signaling and
    /// applies the ring-end duplicate-tail workaround: a tail write that
    /// repeats the last slot value is silently ignored by the hardware, so
    /// the wrapped out-of-range value is written first and the head
    /// pointer is polled (bounded) until it reaches a page boundary.
    pub fn submit(&mut self) {
        let qlen = self.qlen();
        let last = self.tail.back(qlen);
        let mut d = self.ring.read(last);
        if self.mode != CompletionMode::RegisterPoll {
            d.set_wb_en(true);
        }
        d.set_msix_en(self.mode == CompletionMode::Msix);
        self.ring.write(last, &d);

        if self.tail.as_u32() == self.processed_tail && self.tail.is_ring_end(qlen) {
            self.reg_write(regs::Q_TAIL_POINTER, qlen);
            let mut spins = 0;
            while spins < self.config.head_move_wait {
                let head = self.reg_read(regs::Q_HEAD_POINTER);
                if head % self.config.desc_per_page == 0 {
                    break;
                }
                spins += 1;
            }
        }

        fence(Ordering::Release);
        self.reg_write(regs::Q_TAIL_POINTER, self.tail.as_u32());
        log::trace!(
            "channel {} {:?} flush tail {} didx {}..{}",
            self.channel_id,
            self.dir,
            self.tail.as_u32(),
            self.first_didx,
            self.didx
        );
        self.processed_tail = self.tail.as_u32();
        self.batch_done = true;
        self.first_didx = self.didx;
        self.stats.tail_updates += 1;
    }

    /// Prepares a request and submits it in one call.
    ///
    /// # Errors
    ///
    /// As [`Queue::prepare`].
    pub fn start(&mut self, request: Request) -> Result<(), (DmaError, Request)> {
        self.prepare(request)?;
        self.submit();
        Ok(())
    }

    /// Disables and resets the queue hardware; called on release.
    pub(crate) fn shutdown(&mut self) {
        self.reg_write(regs::Q_CTRL, 0);
        if self.reset_hw().is_err() {
            log::warn!(
                "channel {} {:?} queue reset timed out during release",
                self.channel_id,
                self.dir
            );
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        // SAFETY: shutdown() has disabled and reset the queue (release
        // path), or the queue never went active; either way no DMA
        // references the write-back cell.
        unsafe { self.hw.free_dma(self.wb_cell) };
    }
}

/// Rounds the streaming payload hint up to the interface alignment.
#[must_use]
fn aligned_payload(payload: u32) -> u32 {
    let align = DeviceConfig::STREAM_ALIGN;
    payload.div_ceil(align) * align
}
