//! The dynamic channel allocation protocol over the device's shared
//! COI/FCOI/L2P tables.
//!
//! The tables live in device hardware, not host memory, and are shared by
//! every function (PF or VF) on the device. Mutation is arbitrated by a
//! hardware compare-and-claim primitive: software observes the busy
//! register as ready, writes its identity pattern into the lock register,
//! and confirms that the device-id echo register reflects that identity
//! before treating the lock as held. A process-local mutex additionally
//! serializes the whole sequence per device context; the hardware
//! primitive is the only protection across processes and VMs.
//!
//! Table invariant: every physical channel bit set in COI has exactly one
//! FCOI entry naming its owner, and exactly one L2P entry of that owner
//! mapping some logical channel to it. Acquisition sequences are ordered
//! so a failure before the final table write leaves no visible allocation.

use alloc::sync::Arc;

use mcdma_hal::{CsrWindow, DmaError, HardwareAccess};

use super::FunctionId;
use crate::regs;

/// Owner of all access to the shared allocation tables.
pub struct AllocationTables {
    hw: Arc<dyn HardwareAccess>,
    ident: FunctionId,
    num_channels: u32,
    lock_wait: u32,
}

/// Proof that the hardware arbitration lock is held; releases on drop.
pub struct TableLock<'a> {
    tables: &'a AllocationTables,
}

impl Drop for TableLock<'_> {
    fn drop(&mut self) {
        self.tables.hw.write32(CsrWindow::Global, regs::LOCK, 0);
    }
}

impl AllocationTables {
    /// Creates the table accessor for one device context.
    #[must_use]
    pub fn new(
        hw: Arc<dyn HardwareAccess>,
        ident: FunctionId,
        num_channels: u32,
        lock_wait: u32,
    ) -> Self {
        Self {
            hw,
            ident,
            num_channels,
            lock_wait,
        }
    }

    fn read(&self, offset: u64) -> u32 {
        self.hw.read32(CsrWindow::Global, offset)
    }

    fn write(&self, offset: u64, value: u32) {
        self.hw.write32(CsrWindow::Global, offset, value);
    }

    /// Takes the hardware arbitration lock.
    ///
    /// `num_chan` is advertised to the device in the lock pattern during
    /// bulk acquisition (0 otherwise).
    ///
    /// # Errors
    ///
    /// [`DmaError::HardwareLockTimeout`] if the busy register never
    /// clears, or the device-id echo never reflects this function, within
    /// the retry budget.
    pub fn lock(&self, num_chan: u16) -> Result<TableLock<'_>, DmaError> {
        let ident = self.ident;
        let pattern = regs::lock_pattern(ident.pf, ident.vf, ident.vf_active, num_chan);

        for _ in 0..self.lock_wait {
            if self.read(regs::BUSY) != 0 {
                core::hint::spin_loop();
                continue;
            }
            self.write(regs::LOCK, pattern);
            if self.read(regs::DEVICE_ID) == ident.device_id() {
                return Ok(TableLock { tables: self });
            }
            // Another function won the claim; drop our pattern and retry.
            self.write(regs::LOCK, 0);
            core::hint::spin_loop();
        }
        log::error!("allocation lock not granted within budget");
        Err(DmaError::HardwareLockTimeout)
    }

    /// Scans the COI bitmap for a clear bit and sets it.
    ///
    /// # Errors
    ///
    /// [`DmaError::ChannelUnavailable`] when every bit is set.
    fn claim_free_channel(&self, _lock: &TableLock<'_>) -> Result<u32, DmaError> {
        let words = self.num_channels.div_ceil(32);
        for w in 0..words {
            let offset = regs::COI_BASE + u64::from(w) * 4;
            let reg = self.read(offset);
            if reg == u32::MAX {
                continue;
            }
            for bit in 0..32 {
                let chan = w * 32 + bit;
                if chan >= self.num_channels {
                    break;
                }
                if reg & (1 << bit) == 0 {
                    self.write(offset, reg | (1 << bit));
                    return Ok(chan);
                }
            }
        }
        Err(DmaError::ChannelUnavailable)
    }

    /// Clears a physical channel's COI bit.
    fn clear_channel(&self, _lock: &TableLock<'_>, phys_chan: u32) {
        let offset = regs::COI_BASE + u64::from(phys_chan / 32) * 4;
        let reg = self.read(offset);
        self.write(offset, reg & !(1 << (phys_chan % 32)));
    }

    /// Updates one 16-bit half of a packed table register, leaving the
    /// sibling half untouched.
    fn write_half(&self, offset: u64, high_half: bool, value: u16) {
        let reg = self.read(offset);
        let reg = if high_half {
            (reg & 0x0000_FFFF) | (u32::from(value) << 16)
        } else {
            (reg & 0xFFFF_0000) | u32::from(value)
        };
        self.write(offset, reg);
    }

    /// Writes a physical channel's FCOI ownership entry.
    fn set_fcoi(&self, _lock: &TableLock<'_>, phys_chan: u32, entry: u16) {
        self.write_half(regs::fcoi_offset(phys_chan), phys_chan % 2 == 1, entry);
    }

    /// Writes this function's L2P entry for a logical channel.
    fn set_l2p(&self, _lock: &TableLock<'_>, logical: u32, value: u16) {
        let offset = self.ident.l2p_base() + u64::from(logical / 2) * 4;
        self.write_half(offset, logical % 2 == 1, value);
    }

    /// Claims a physical channel and binds it to `logical` in this
    /// function's L2P region.
    ///
    /// The COI bit is taken first; the FCOI and L2P writes cannot fail, so
    /// an error from the scan leaves no visible allocation.
    ///
    /// # Errors
    ///
    /// [`DmaError::HardwareLockTimeout`] or
    /// [`DmaError::ChannelUnavailable`].
    pub fn acquire(&self, logical: u32) -> Result<u32, DmaError> {
        let lock = self.lock(0)?;
        let phys_chan = self.claim_free_channel(&lock)?;
        self.set_fcoi(&lock, phys_chan, self.ident.fcoi_entry());
        self.set_l2p(&lock, logical, phys_chan as u16);
        drop(lock);
        log::debug!("channel allocated logical {logical} physical {phys_chan}");
        Ok(phys_chan)
    }

    /// Releases the physical channel bound to `logical`, clearing only
    /// this function's packed table halves.
    ///
    /// # Errors
    ///
    /// [`DmaError::HardwareLockTimeout`].
    pub fn release(&self, logical: u32, phys_chan: u32) -> Result<(), DmaError> {
        let lock = self.lock(0)?;
        self.clear_channel(&lock, phys_chan);
        self.set_fcoi(&lock, phys_chan, 0);
        self.set_l2p(&lock, logical, 0);
        Ok(())
    }

    /// Counts clear COI bits.
    ///
    /// # Errors
    ///
    /// [`DmaError::HardwareLockTimeout`].
    pub fn available(&self) -> Result<u32, DmaError> {
        let _lock = self.lock(0)?;
        let words = self.num_channels.div_ceil(32);
        let mut count = 0;
        for w in 0..words {
            let reg = self.read(regs::COI_BASE + u64::from(w) * 4);
            for bit in 0..32 {
                let chan = w * 32 + bit;
                if chan >= self.num_channels {
                    break;
                }
                if reg & (1 << bit) == 0 {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Walks this function's entire L2P region under the lock and
    /// releases every mapped channel.
    ///
    /// `confirm(logical, phys)` tells whether the device context really
    /// has `logical` bound to `phys` (and may clear its own bookkeeping
    /// when it does). The confirmation matters because a table entry of
    /// zero is ambiguous: logical 0 mapped to physical 0 reads exactly
    /// like an empty slot, so the first entry is never skipped on a zero
    /// read.
    ///
    /// Returns the number of channels released.
    ///
    /// # Errors
    ///
    /// [`DmaError::HardwareLockTimeout`].
    pub fn release_all(
        &self,
        mut confirm: impl FnMut(u32, u32) -> bool,
    ) -> Result<u32, DmaError> {
        let lock = self.lock(0)?;
        let words = regs::L2P_TABLE_SIZE / 4;
        let mut released = 0;

        for w in 0..words {
            let offset = self.ident.l2p_base() + w * 4;
            let reg = self.read(offset);
            if reg == 0 && w != 0 {
                continue;
            }
            for (half, value) in [(false, reg & 0xFFFF), (true, reg >> 16)] {
                let phys_chan = value;
                let logical = (w * 2 + u64::from(half)) as u32;
                if !confirm(logical, phys_chan) {
                    continue;
                }
                self.clear_channel(&lock, phys_chan);
                self.set_fcoi(&lock, phys_chan, 0);
                self.set_l2p(&lock, logical, 0);
                released += 1;
            }
        }
        Ok(released)
    }
}
