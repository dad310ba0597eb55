//! Hardware access contract for the MCDMA queue engine.
//!
//! The queue engine is written once against the [`HardwareAccess`] trait and
//! runs unchanged over any backend that can provide three things:
//!
//! - **Registers** -- 32-bit reads and writes into the device's queue and
//!   global CSR windows ([`CsrWindow`]).
//! - **DMA memory** -- pinned, physically contiguous allocations with a
//!   host-virtual and a bus-physical view ([`DmaRegion`]).
//! - **Events** -- creation and registration of interrupt-backed event
//!   handles plus a multiplexed timed wait ([`EventHandle`]).
//!
//! Two backends exist today: [`MappedDevice`], which works over
//! caller-provided memory-mapped BAR windows and a pinned memory pool
//! (the userspace configuration), and the register-level device model in
//! `mcdma-sim` used by the test suites. A kernel-resident port implements
//! the same trait over its own MMIO mapping and DMA allocator.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod error;
pub mod hal;
pub mod mapped;
pub mod resource;

pub use addr::PhysAddr;
pub use error::DmaError;
pub use hal::{CsrWindow, Direction, EventHandle, HardwareAccess};
pub use mapped::{EventOps, MappedDevice};
pub use resource::{DmaRegion, MmioWindow, PinnedPool};
