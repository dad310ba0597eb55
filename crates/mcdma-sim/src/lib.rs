//! Register-level software model of the MCDMA IP.
//!
//! Implements [`HardwareAccess`] with a behavioral model of the device:
//! per-queue CSR banks that consume descriptors when the tail pointer
//! moves, consumed-head write-back with the 16-bit rolling counter, MSI-X
//! event delivery, drop/fetch/timeout error injection, and the global
//! window with the arbitration lock and the COI/FCOI/L2P tables.
//!
//! The model reproduces the hardware quirk the driver works around: a
//! tail-pointer write that repeats the previously written value is
//! ignored.
//!
//! By default descriptors complete as soon as the tail is written. With
//! `auto_complete` off, completion is driven explicitly through
//! [`SimDevice::complete`], which is what the wraparound and batching
//! tests use.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec;
use alloc::vec::Vec;

use mcdma_hal::{CsrWindow, Direction, DmaError, DmaRegion, EventHandle, HardwareAccess, PhysAddr};
use spin::Mutex;

// ---------------------------------------------------------------------------
// Register map (device side)
// ---------------------------------------------------------------------------

const QUEUE_BANK_SIZE: u64 = 256;
const TX_BANK_BASE: u64 = 512 << 10;

const Q_CTRL: u64 = 0x00;
const Q_START_ADDR_L: u64 = 0x08;
const Q_START_ADDR_H: u64 = 0x0C;
const Q_SIZE: u64 = 0x10;
const Q_TAIL_POINTER: u64 = 0x14;
const Q_HEAD_POINTER: u64 = 0x18;
const Q_COMPLETED_POINTER: u64 = 0x1C;
const Q_CONSUMED_HEAD_ADDR_L: u64 = 0x20;
const Q_CONSUMED_HEAD_ADDR_H: u64 = 0x24;
const Q_BATCH_DELAY: u64 = 0x28;
const Q_DATA_DRP_ERR_CTR: u64 = 0x40;
const Q_PAYLOAD_SIZE: u64 = 0x44;
const Q_RESET: u64 = 0x48;
const Q_CPL_TIMEOUT: u64 = 0x4C;

const CTRL_ENABLE: u32 = 1 << 0;
const CTRL_WB_EN: u32 = 1 << 8;
const CTRL_INTR_EN: u32 = 1 << 9;

const PING: u64 = 0x0000;
const BUSY: u64 = 0x0004;
const LOCK: u64 = 0x0008;
const DEVICE_ID: u64 = 0x000C;

/// Base of the simulated physical address space.
const PHYS_BASE: u64 = 0x4000_0000;

const DESC_SIZE: usize = 32;

/// A fetch-error kind injectable into the consumed-head report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchError {
    /// Descriptor fetch failed (consumed-head bit 31).
    Descriptor,
    /// Data fetch failed (consumed-head bit 30).
    Data,
}

/// One streaming segment scripted for a receive queue.
#[derive(Debug, Clone, Copy)]
pub struct RxSegment {
    /// Report start-of-file on this descriptor.
    pub sof: bool,
    /// Report end-of-file on this descriptor.
    pub eof: bool,
    /// Payload count reported on EOF (0 encodes the full 1 MiB).
    pub payload: u32,
}

/// Simulated device identity and geometry.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Channels exposed by the model.
    pub num_channels: u32,
    /// Descriptors per ring page (the driver's page geometry).
    pub desc_per_page: u32,
    /// Physical function number reported by the ping register.
    pub pf: u16,
    /// Virtual function number reported by the ping register.
    pub vf: u16,
    /// Whether the ping register reports a VF.
    pub vf_active: bool,
    /// Complete descriptors as soon as the tail is written.
    pub auto_complete: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            num_channels: 8,
            desc_per_page: 128,
            pf: 0,
            vf: 0,
            vf_active: false,
            auto_complete: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Model state
// ---------------------------------------------------------------------------

struct Chunk {
    phys: u64,
    len: usize,
    mem: Box<[u8]>,
    live: bool,
}

#[derive(Default)]
struct QueueBank {
    ctrl: u32,
    start_addr_l: u32,
    start_addr_h: u32,
    size_log2: u32,
    batch_delay: u32,
    payload_size: u32,
    wb_addr_l: u32,
    wb_addr_h: u32,
    /// Rolling consumed counter, mod 65536.
    consumed: u32,
    /// Current ring slot the engine will fetch next.
    hw_pos: u32,
    /// Last accepted tail value; a repeated write is ignored.
    last_tail_write: u32,
    /// Accepted tail values not yet fully consumed, oldest first.
    pending_targets: VecDeque<u32>,
    drop_reg: u32,
    cpl_timeout: u32,
    reset_held: bool,
    wb_error_bits: u32,
    /// Every tail write observed, accepted or not (for tests).
    tail_writes: Vec<u32>,
    rx_script: VecDeque<RxSegment>,
}

impl QueueBank {
    fn qlen(&self) -> u32 {
        1 << self.size_log2
    }

    fn start_addr(&self) -> u64 {
        u64::from(self.start_addr_l) | (u64::from(self.start_addr_h) << 32)
    }

    fn wb_addr(&self) -> u64 {
        u64::from(self.wb_addr_l) | (u64::from(self.wb_addr_h) << 32)
    }
}

#[derive(Default)]
struct GlobalRegs {
    busy: bool,
    lock_value: u32,
    device_id_echo: u32,
    /// When set, the next lock attempt is won by this foreign identity.
    contend_with: Option<u32>,
    /// COI, FCOI, and L2P words, keyed by window offset.
    table_regs: BTreeMap<u64, u32>,
}

#[derive(Default)]
struct EventState {
    next_handle: u64,
    vectors: BTreeMap<u16, u64>,
    pending: Vec<u64>,
}

struct SimState {
    chunks: Vec<Chunk>,
    next_phys: u64,
    queues: BTreeMap<(u32, u8), QueueBank>,
    global: GlobalRegs,
    events: EventState,
}

/// The simulated MCDMA device.
pub struct SimDevice {
    config: SimConfig,
    state: Mutex<SimState>,
}

const fn dir_code(dir: Direction) -> u8 {
    match dir {
        Direction::Rx => 0,
        Direction::Tx => 1,
    }
}

const fn msix_vector(chan: u32, dir: Direction) -> u16 {
    let base = (chan * 4) as u16;
    match dir {
        Direction::Tx => base,
        Direction::Rx => base + 2,
    }
}

fn desc_word(bytes: &[u8; DESC_SIZE], idx: usize) -> u32 {
    let off = idx * 4;
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn set_desc_word(bytes: &mut [u8; DESC_SIZE], idx: usize, value: u32) {
    let off = idx * 4;
    bytes[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

impl SimDevice {
    /// Creates a model with the given identity and geometry.
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimState {
                chunks: Vec::new(),
                next_phys: PHYS_BASE,
                queues: BTreeMap::new(),
                global: GlobalRegs::default(),
                events: EventState::default(),
            }),
        }
    }

    /// Completes up to `budget` descriptor slots on a queue; returns the
    /// number consumed. Use with `auto_complete` off to stage partial
    /// completions.
    pub fn complete(&self, chan: u32, dir: Direction, budget: u32) -> u32 {
        let mut state = self.state.lock();
        state.process(chan, dir, budget)
    }

    /// Scripts the framing the receive engine reports for the next
    /// descriptors of a queue.
    pub fn push_rx_segment(&self, chan: u32, dir: Direction, segment: RxSegment) {
        let mut state = self.state.lock();
        state.bank(chan, dir).rx_script.push_back(segment);
    }

    /// Latches a drop event: the drop counter register reports `count`
    /// drops until the driver clears it.
    pub fn inject_drops(&self, chan: u32, dir: Direction, count: u16) {
        let mut state = self.state.lock();
        state.bank(chan, dir).drop_reg = (1 << 20) | u32::from(count);
    }

    /// Injects a fetch error into the queue's consumed-head report and
    /// pushes a write-back so the driver observes it.
    pub fn inject_fetch_error(&self, chan: u32, dir: Direction, kind: FetchError) {
        let mut state = self.state.lock();
        let bit = match kind {
            FetchError::Descriptor => 1 << 31,
            FetchError::Data => 1 << 30,
        };
        state.bank(chan, dir).wb_error_bits |= bit;
        state.write_back(chan, dir);
    }

    /// Latches the completion-timeout status bit.
    pub fn inject_completion_timeout(&self, chan: u32, dir: Direction) {
        let mut state = self.state.lock();
        state.bank(chan, dir).cpl_timeout |= 1;
    }

    /// Holds the queue reset register asserted (the driver's bounded wait
    /// will expire).
    pub fn hold_reset(&self, chan: u32, dir: Direction, held: bool) {
        let mut state = self.state.lock();
        state.bank(chan, dir).reset_held = held;
    }

    /// Sets the arbitration busy register.
    pub fn set_busy(&self, busy: bool) {
        self.state.lock().global.busy = busy;
    }

    /// Makes the next lock attempt lose to a foreign function: the
    /// device-id echo reports `device_id` instead of the caller's.
    pub fn contend_next_lock(&self, device_id: u32) {
        self.state.lock().global.contend_with = Some(device_id);
    }

    /// Reads a global-window register as the engine would.
    #[must_use]
    pub fn global_reg(&self, offset: u64) -> u32 {
        self.read32(CsrWindow::Global, offset)
    }

    /// Every tail-pointer write a queue has seen, accepted or ignored.
    #[must_use]
    pub fn tail_writes(&self, chan: u32, dir: Direction) -> Vec<u32> {
        let mut state = self.state.lock();
        state.bank(chan, dir).tail_writes.clone()
    }
}

impl SimState {
    fn bank(&mut self, chan: u32, dir: Direction) -> &mut QueueBank {
        self.queues.entry((chan, dir_code(dir))).or_default()
    }

    fn phys_ptr(&mut self, phys: u64, len: usize) -> Option<*mut u8> {
        self.chunks
            .iter_mut()
            .find(|c| c.live && phys >= c.phys && phys + len as u64 <= c.phys + c.len as u64)
            .map(|c| {
                let off = (phys - c.phys) as usize;
                // Chunk memory is boxed and lives as long as the model.
                unsafe { c.mem.as_mut_ptr().add(off) }
            })
    }

    fn phys_read_desc(&mut self, phys: u64) -> Option<[u8; DESC_SIZE]> {
        let ptr = self.phys_ptr(phys, DESC_SIZE)?;
        let mut bytes = [0u8; DESC_SIZE];
        // SAFETY: phys_ptr bounds-checked the range within a live chunk.
        unsafe { core::ptr::copy_nonoverlapping(ptr, bytes.as_mut_ptr(), DESC_SIZE) };
        Some(bytes)
    }

    fn phys_write_desc(&mut self, phys: u64, bytes: &[u8; DESC_SIZE]) {
        if let Some(ptr) = self.phys_ptr(phys, DESC_SIZE) {
            // SAFETY: as in phys_read_desc.
            unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, DESC_SIZE) };
        }
    }

    fn phys_write_u32(&mut self, phys: u64, value: u32) {
        if let Some(ptr) = self.phys_ptr(phys, 4) {
            // SAFETY: as in phys_read_desc; the engine reads this cell
            // with an atomic acquire load.
            unsafe { core::ptr::write_volatile(ptr.cast::<u32>(), value) };
        }
    }

    /// Pushes the consumed-head value (plus injected error bits) into the
    /// queue's write-back cell when write-back is enabled.
    fn write_back(&mut self, chan: u32, dir: Direction) {
        let bank = self.bank(chan, dir);
        if bank.ctrl & CTRL_WB_EN == 0 {
            return;
        }
        let addr = bank.wb_addr();
        let value = (bank.consumed & 0xFFFF) | bank.wb_error_bits;
        if addr != 0 {
            self.phys_write_u32(addr, value);
        }
    }

    /// Consumes descriptor slots from the hardware position toward the
    /// pending tail targets, oldest first.
    fn process(&mut self, chan: u32, dir: Direction, budget: u32) -> u32 {
        let bank = self.bank(chan, dir);
        if bank.ctrl & CTRL_ENABLE == 0 || bank.reset_held {
            return 0;
        }
        let qlen = bank.qlen();
        let ring_base = bank.start_addr();
        let intr_enabled = bank.ctrl & CTRL_INTR_EN != 0;

        let mut fired_vector = None;
        let mut done = 0;
        while done < budget {
            let next = {
                let bank = self.bank(chan, dir);
                // Drain targets the fetch position has already reached;
                // the next one still outstanding drives consumption.
                while bank
                    .pending_targets
                    .front()
                    .is_some_and(|&t| bank.hw_pos == t % qlen)
                {
                    bank.pending_targets.pop_front();
                }
                bank.pending_targets
                    .front()
                    .map(|_| (bank.hw_pos, bank.consumed))
            };
            let Some((pos, consumed)) = next else {
                break;
            };
            let desc_phys = ring_base + u64::from(pos) * DESC_SIZE as u64;
            if let Some(mut bytes) = self.phys_read_desc(desc_phys) {
                let word7 = desc_word(&bytes, 7);
                let is_link = word7 & (1 << 31) != 0;
                let is_invalid = word7 & (1 << 30) != 0;
                if !is_link && !is_invalid {
                    if dir == Direction::Rx {
                        let segment = self
                            .bank(chan, dir)
                            .rx_script
                            .pop_front()
                            .unwrap_or(RxSegment {
                                sof: true,
                                eof: true,
                                payload: desc_word(&bytes, 4) & 0xF_FFFF,
                            });
                        let mut word6 = segment.payload & 0xF_FFFF;
                        if segment.sof {
                            word6 |= 1 << 30;
                        }
                        if segment.eof {
                            word6 |= 1 << 31;
                        }
                        set_desc_word(&mut bytes, 6, word6);
                        self.phys_write_desc(desc_phys, &bytes);
                    }
                    let msix_en = desc_word(&bytes, 5) & (1 << 16) != 0;
                    if intr_enabled && msix_en {
                        fired_vector = Some(msix_vector(chan, dir));
                    }
                }
            }
            let bank = self.bank(chan, dir);
            bank.hw_pos = (pos + 1) % qlen;
            bank.consumed = (consumed + 1) & 0xFFFF;
            done += 1;
        }

        if done > 0 {
            self.write_back(chan, dir);
            if let Some(vector) = fired_vector {
                if let Some(&handle) = self.events.vectors.get(&vector) {
                    if !self.events.pending.contains(&handle) {
                        self.events.pending.push(handle);
                    }
                }
            }
        }
        done
    }
}

impl HardwareAccess for SimDevice {
    fn read32(&self, window: CsrWindow, offset: u64) -> u32 {
        let mut state = self.state.lock();
        match window {
            CsrWindow::Queue => {
                let (dir, rel) = if offset >= TX_BANK_BASE {
                    (Direction::Tx, offset - TX_BANK_BASE)
                } else {
                    (Direction::Rx, offset)
                };
                let chan = (rel / QUEUE_BANK_SIZE) as u32;
                let reg = rel % QUEUE_BANK_SIZE;
                let bank = state.bank(chan, dir);
                match reg {
                    Q_CTRL => bank.ctrl,
                    Q_START_ADDR_L => bank.start_addr_l,
                    Q_START_ADDR_H => bank.start_addr_h,
                    Q_SIZE => bank.size_log2,
                    Q_TAIL_POINTER => bank.last_tail_write,
                    Q_HEAD_POINTER | Q_COMPLETED_POINTER => bank.consumed & 0xFFFF,
                    Q_CONSUMED_HEAD_ADDR_L => bank.wb_addr_l,
                    Q_CONSUMED_HEAD_ADDR_H => bank.wb_addr_h,
                    Q_BATCH_DELAY => bank.batch_delay,
                    Q_DATA_DRP_ERR_CTR => bank.drop_reg,
                    Q_PAYLOAD_SIZE => bank.payload_size,
                    Q_RESET => u32::from(bank.reset_held),
                    Q_CPL_TIMEOUT => bank.cpl_timeout,
                    _ => 0,
                }
            }
            CsrWindow::Global => match offset {
                PING => {
                    let mut v = u32::from(self.config.vf);
                    v |= u32::from(self.config.pf & 0x7) << 16;
                    if self.config.vf_active {
                        v |= 1 << 20;
                    }
                    v
                }
                BUSY => u32::from(state.global.busy),
                LOCK => state.global.lock_value,
                DEVICE_ID => state.global.device_id_echo,
                other => state.global.table_regs.get(&other).copied().unwrap_or(0),
            },
        }
    }

    fn write32(&self, window: CsrWindow, offset: u64, value: u32) {
        let mut state = self.state.lock();
        match window {
            CsrWindow::Queue => {
                let (dir, rel) = if offset >= TX_BANK_BASE {
                    (Direction::Tx, offset - TX_BANK_BASE)
                } else {
                    (Direction::Rx, offset)
                };
                let chan = (rel / QUEUE_BANK_SIZE) as u32;
                let reg = rel % QUEUE_BANK_SIZE;
                match reg {
                    Q_CTRL => state.bank(chan, dir).ctrl = value,
                    Q_START_ADDR_L => state.bank(chan, dir).start_addr_l = value,
                    Q_START_ADDR_H => state.bank(chan, dir).start_addr_h = value,
                    Q_SIZE => state.bank(chan, dir).size_log2 = value,
                    Q_TAIL_POINTER => {
                        let accepted = {
                            let bank = state.bank(chan, dir);
                            bank.tail_writes.push(value);
                            // A repeat of the previous tail value is
                            // dropped by the hardware.
                            if value == bank.last_tail_write {
                                false
                            } else {
                                bank.last_tail_write = value;
                                bank.pending_targets.push_back(value);
                                true
                            }
                        };
                        if accepted && self.config.auto_complete {
                            state.process(chan, dir, u32::MAX);
                        }
                    }
                    Q_CONSUMED_HEAD_ADDR_L => state.bank(chan, dir).wb_addr_l = value,
                    Q_CONSUMED_HEAD_ADDR_H => state.bank(chan, dir).wb_addr_h = value,
                    Q_BATCH_DELAY => state.bank(chan, dir).batch_delay = value,
                    Q_DATA_DRP_ERR_CTR => state.bank(chan, dir).drop_reg = value,
                    Q_PAYLOAD_SIZE => state.bank(chan, dir).payload_size = value,
                    Q_RESET => {
                        let bank = state.bank(chan, dir);
                        if value != 0 && !bank.reset_held {
                            bank.hw_pos = 0;
                            bank.consumed = 0;
                            bank.pending_targets.clear();
                            bank.last_tail_write = 0;
                            bank.wb_error_bits = 0;
                            bank.ctrl = 0;
                        }
                    }
                    Q_CPL_TIMEOUT => state.bank(chan, dir).cpl_timeout = value,
                    _ => {}
                }
            }
            CsrWindow::Global => match offset {
                LOCK => {
                    state.global.lock_value = value;
                    if value & 1 != 0 {
                        if state.global.busy {
                            // Lock attempts while busy are not granted.
                        } else if let Some(foreign) = state.global.contend_with.take() {
                            state.global.device_id_echo = foreign;
                        } else {
                            let vf = (value >> 1) & 0x7FF;
                            let pf = (value >> 12) & 0x7;
                            let vf_active = value & (1 << 15) != 0;
                            let mut echo = vf;
                            echo |= pf << 16;
                            if vf_active {
                                echo |= 1 << 20;
                            }
                            state.global.device_id_echo = echo;
                        }
                    } else {
                        state.global.device_id_echo = 0;
                    }
                }
                BUSY | PING | DEVICE_ID => {}
                other => {
                    state.global.table_regs.insert(other, value);
                }
            },
        }
    }

    fn alloc_dma(&self, len: usize) -> Result<DmaRegion, DmaError> {
        if len == 0 {
            return Err(DmaError::AllocationFailure);
        }
        let len = len.div_ceil(4096) * 4096;
        let mut state = self.state.lock();
        let phys = state.next_phys;
        state.next_phys += len as u64;
        let mut mem = vec![0u8; len].into_boxed_slice();
        let virt = mem.as_mut_ptr();
        state.chunks.push(Chunk {
            phys,
            len,
            mem,
            live: true,
        });
        // SAFETY: the chunk's boxed memory is kept alive (never
        // deallocated) for the model's lifetime, and phys uniquely
        // identifies it within the model.
        Ok(unsafe { DmaRegion::new(virt, PhysAddr::new(phys), len) })
    }

    unsafe fn free_dma(&self, region: DmaRegion) {
        let mut state = self.state.lock();
        if let Some(chunk) = state
            .chunks
            .iter_mut()
            .find(|c| c.phys == region.phys().as_u64() && c.live)
        {
            // The memory is retired but kept allocated so a straggling
            // model-side write cannot touch freed memory.
            chunk.live = false;
        } else {
            log::warn!("free of unknown simulated region at {}", region.phys());
        }
    }

    fn create_event(&self) -> Result<EventHandle, DmaError> {
        let mut state = self.state.lock();
        state.events.next_handle += 1;
        Ok(EventHandle::from_raw(state.events.next_handle))
    }

    fn register_event(&self, vector: u16, event: EventHandle) -> Result<(), DmaError> {
        let mut state = self.state.lock();
        state.events.vectors.insert(vector, event.as_raw());
        Ok(())
    }

    fn wait_events(
        &self,
        events: &[EventHandle],
        fired: &mut [EventHandle],
        _timeout_ms: u32,
    ) -> Result<usize, DmaError> {
        let mut state = self.state.lock();
        let mut n = 0;
        state.events.pending.retain(|&handle| {
            let wanted = events.iter().any(|e| e.as_raw() == handle);
            if wanted && n < fired.len() {
                fired[n] = EventHandle::from_raw(handle);
                n += 1;
                false
            } else {
                true
            }
        });
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dma_allocations_are_disjoint_and_zeroed() {
        let sim = SimDevice::new(SimConfig::default());
        let a = sim.alloc_dma(100).expect("alloc");
        let b = sim.alloc_dma(100).expect("alloc");
        assert_ne!(a.phys(), b.phys());
        // SAFETY: region returned by the model, fully mapped.
        let first = unsafe { core::ptr::read(a.virt()) };
        assert_eq!(first, 0);
    }

    #[test]
    fn duplicate_tail_write_is_ignored() {
        let sim = SimDevice::new(SimConfig::default());
        sim.write32(CsrWindow::Queue, Q_SIZE, 7);
        sim.write32(CsrWindow::Queue, Q_CTRL, CTRL_ENABLE);
        sim.write32(CsrWindow::Queue, Q_TAIL_POINTER, 5);
        sim.write32(CsrWindow::Queue, Q_TAIL_POINTER, 5);
        sim.write32(CsrWindow::Queue, Q_TAIL_POINTER, 6);
        assert_eq!(sim.tail_writes(0, Direction::Rx), vec![5, 5, 6]);
        // The repeated 5 must not have re-armed processing state.
        assert_eq!(sim.read32(CsrWindow::Queue, Q_TAIL_POINTER), 6);
    }

    #[test]
    fn lock_echo_reflects_writer_identity() {
        let sim = SimDevice::new(SimConfig {
            pf: 2,
            ..SimConfig::default()
        });
        let pattern = 1 | (2 << 12);
        sim.write32(CsrWindow::Global, LOCK, pattern);
        assert_eq!(sim.read32(CsrWindow::Global, DEVICE_ID), 2 << 16);
        sim.write32(CsrWindow::Global, LOCK, 0);
        assert_eq!(sim.read32(CsrWindow::Global, DEVICE_ID), 0);
    }

    #[test]
    fn contended_lock_reports_foreign_identity() {
        let sim = SimDevice::new(SimConfig::default());
        sim.contend_next_lock(0xDEAD);
        sim.write32(CsrWindow::Global, LOCK, 1);
        assert_eq!(sim.read32(CsrWindow::Global, DEVICE_ID), 0xDEAD);
        // The following attempt succeeds.
        sim.write32(CsrWindow::Global, LOCK, 1);
        assert_eq!(sim.read32(CsrWindow::Global, DEVICE_ID), 0);
    }
}
