//! Channel identity allocation.
//!
//! Two modes: a static per-direction software bitmap, and the dynamic
//! hardware-table protocol that claims physical channels from the device's
//! shared COI/FCOI/L2P tables under its arbitration lock.

pub mod bitmap;
pub mod tables;

pub use bitmap::BitmapAllocator;
pub use tables::AllocationTables;

use crate::regs;
use mcdma_hal::{CsrWindow, HardwareAccess};

/// The PCI function identity of this device instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FunctionId {
    /// Physical function number.
    pub pf: u16,
    /// Virtual function number; meaningful only when `vf_active`.
    pub vf: u16,
    /// `true` when this instance is a virtual function.
    pub vf_active: bool,
}

impl FunctionId {
    /// Reads the function identity from the device's ping register.
    #[must_use]
    pub fn read_from(hw: &dyn HardwareAccess) -> Self {
        let reg = hw.read32(CsrWindow::Global, regs::PING);
        let vf_active = regs::ping_vf_active(reg);
        Self {
            pf: regs::ping_pf(reg),
            vf: if vf_active { regs::ping_vf(reg) } else { 0 },
            vf_active,
        }
    }

    /// The 16-bit FCOI ownership entry for this function.
    #[must_use]
    pub const fn fcoi_entry(self) -> u16 {
        regs::fcoi_entry(self.pf, self.vf, self.vf_active)
    }

    /// The device-id pattern the lock echo register must reflect while
    /// this function holds the lock.
    #[must_use]
    pub const fn device_id(self) -> u32 {
        regs::device_id_pattern(self.pf, self.vf, self.vf_active)
    }

    /// Base offset of this function's L2P region.
    #[must_use]
    pub const fn l2p_base(self) -> u64 {
        regs::l2p_region_base(self.pf, self.vf, !self.vf_active)
    }
}
