//! Register offsets and bit sets for the queue and global CSR windows.
//!
//! Each queue owns a 256-byte register bank inside the queue CSR window;
//! receive banks start at the window base, transmit banks at a fixed
//! 512 KiB offset. The global CSR window carries device identity, the
//! channel-arbitration registers, and the COI/FCOI/L2P allocation tables.

use bitflags::bitflags;

use crate::request::Direction;

// ---------------------------------------------------------------------------
// Queue CSR bank layout
// ---------------------------------------------------------------------------

/// Size of one queue's register bank.
pub const QUEUE_BANK_SIZE: u64 = 256;

/// Offset of the transmit banks within the queue CSR window.
pub const TX_BANK_BASE: u64 = 512 << 10;

/// Returns the base offset of a queue's register bank.
#[must_use]
pub const fn queue_bank_base(channel_id: u32, dir: Direction) -> u64 {
    let bank = channel_id as u64 * QUEUE_BANK_SIZE;
    match dir {
        Direction::Rx => bank,
        Direction::Tx => TX_BANK_BASE + bank,
    }
}

// Per-queue registers, as offsets within the queue's bank.

/// Queue control.
pub const Q_CTRL: u64 = 0x00;
/// Ring base address, low half.
pub const Q_START_ADDR_L: u64 = 0x08;
/// Ring base address, high half.
pub const Q_START_ADDR_H: u64 = 0x0C;
/// Ring size as log2 of the descriptor count.
pub const Q_SIZE: u64 = 0x10;
/// Tail pointer (software-produced slot index).
pub const Q_TAIL_POINTER: u64 = 0x14;
/// Head pointer (hardware fetch position).
pub const Q_HEAD_POINTER: u64 = 0x18;
/// Completed pointer (hardware-consumed count, register-poll mode).
pub const Q_COMPLETED_POINTER: u64 = 0x1C;
/// Consumed-head write-back address, low half.
pub const Q_CONSUMED_HEAD_ADDR_L: u64 = 0x20;
/// Consumed-head write-back address, high half.
pub const Q_CONSUMED_HEAD_ADDR_H: u64 = 0x24;
/// Write-back batching delay.
pub const Q_BATCH_DELAY: u64 = 0x28;
/// Data-drop error counter; see [`DROP_PRESENT_BIT`].
pub const Q_DATA_DRP_ERR_CTR: u64 = 0x40;
/// Expected receive payload size (streaming interface).
pub const Q_PAYLOAD_SIZE: u64 = 0x44;
/// Queue reset; write 1 to assert, hardware clears on completion.
pub const Q_RESET: u64 = 0x48;
/// Completion-timeout status; low bit is cleared by software.
pub const Q_CPL_TIMEOUT: u64 = 0x4C;

/// Bit set in [`Q_DATA_DRP_ERR_CTR`] when drops are pending; the low 16
/// bits then hold the drop count.
pub const DROP_PRESENT_BIT: u32 = 1 << 20;

/// Mask clearing the drop-present bit and the drop count.
pub const DROP_CLEAR_MASK: u32 = !0x0010_FFFF;

/// Error bits reported in the high nibble of the consumed head.
pub const CONSUMED_HEAD_DESC_FETCH_ERR: u32 = 1 << 31;
/// Data-fetch error bit in the consumed head.
pub const CONSUMED_HEAD_DATA_FETCH_ERR: u32 = 1 << 30;
/// Mask of all error bits carried in the consumed head.
pub const CONSUMED_HEAD_ERR_MASK: u32 = 0xF000_0000;

bitflags! {
    /// Queue control register flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueCtrl: u32 {
        /// Queue enable.
        const ENABLE = 1 << 0;
        /// Consumed-head write-back enable.
        const WB_EN = 1 << 8;
        /// Completion interrupt enable.
        const INTR_EN = 1 << 9;
    }
}

// ---------------------------------------------------------------------------
// Global CSR window
// ---------------------------------------------------------------------------

/// Device identity ("ping") register.
pub const PING: u64 = 0x0000;
/// Arbitration busy register; must read 0 before a lock attempt.
pub const BUSY: u64 = 0x0004;
/// Arbitration lock register.
pub const LOCK: u64 = 0x0008;
/// Device-id echo register; reflects the lock holder.
pub const DEVICE_ID: u64 = 0x000C;

/// Channel-occupancy (COI) bitmap base.
pub const COI_BASE: u64 = 0x8000;
/// Function-channel-ownership (FCOI) table base.
pub const FCOI_BASE: u64 = 0x1_0000;
/// Logical-to-physical table base for physical functions.
pub const L2P_PF_BASE: u64 = 0x1_8000;
/// Logical-to-physical table base for virtual functions.
pub const L2P_VF_BASE: u64 = 0x2_0000;

/// Channels mapped per L2P region (two 16-bit entries per register).
pub const L2P_CHANNELS_PER_FUNC: u64 = 256;
/// Size in bytes of one function's L2P region.
pub const L2P_TABLE_SIZE: u64 = (L2P_CHANNELS_PER_FUNC / 2) * 4;
/// Virtual functions per physical function in the L2P layout.
pub const VFS_PER_PF: u64 = 32;

// Ping register fields: vf:u16 | pf:u3 | rsvd | vfactive:u1 (bit 20).

/// Extracts the VF number from the ping register.
#[must_use]
pub const fn ping_vf(reg: u32) -> u16 {
    (reg & 0xFFFF) as u16
}

/// Extracts the PF number from the ping register.
#[must_use]
pub const fn ping_pf(reg: u32) -> u16 {
    ((reg >> 16) & 0x7) as u16
}

/// Extracts the VF-active flag from the ping register.
#[must_use]
pub const fn ping_vf_active(reg: u32) -> bool {
    reg & (1 << 20) != 0
}

// Lock register fields: lock:u1 | vf:u11 | pf:u3 | vfactive:u1 | nchan:u16.

/// Builds the lock-register pattern for a lock attempt.
#[must_use]
pub const fn lock_pattern(pf: u16, vf: u16, vf_active: bool, num_chan: u16) -> u32 {
    let mut v = 1; // lock bit
    v |= ((vf as u32) & 0x7FF) << 1;
    v |= ((pf as u32) & 0x7) << 12;
    if vf_active {
        v |= 1 << 15;
    }
    v | ((num_chan as u32) << 16)
}

/// Builds the expected device-id echo for a lock holder, in the ping
/// register's field layout.
#[must_use]
pub const fn device_id_pattern(pf: u16, vf: u16, vf_active: bool) -> u32 {
    let mut v = (vf as u32) & 0xFFFF;
    v |= ((pf as u32) & 0x7) << 16;
    if vf_active {
        v |= 1 << 20;
    }
    v
}

// FCOI entry fields (16-bit packed): vf:u11 | pf:u3 | vfactive:u1 | alloc:u1.

/// Builds the 16-bit FCOI ownership entry for a function.
#[must_use]
pub const fn fcoi_entry(pf: u16, vf: u16, vf_active: bool) -> u16 {
    let mut v = vf & 0x7FF;
    v |= (pf & 0x7) << 11;
    if vf_active {
        v |= 1 << 14;
    }
    v | (1 << 15) // allocated
}

/// Returns the FCOI register offset holding the entry for `phys_chan`.
#[must_use]
pub const fn fcoi_offset(phys_chan: u32) -> u64 {
    FCOI_BASE + (phys_chan as u64 / 2) * 4
}

/// Returns the base offset of a function's L2P region.
#[must_use]
pub const fn l2p_region_base(pf: u16, vf: u16, is_pf: bool) -> u64 {
    if is_pf {
        L2P_PF_BASE + pf as u64 * L2P_TABLE_SIZE
    } else {
        L2P_VF_BASE + (pf as u64 * VFS_PER_PF + vf as u64) * L2P_TABLE_SIZE
    }
}
