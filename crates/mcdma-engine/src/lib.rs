//! Multi-channel DMA queue engine.
//!
//! Drives a hardware-scheduled, multi-channel PCIe DMA IP through the
//! [`mcdma_hal::HardwareAccess`] contract:
//!
//! - [`ring`] -- the binary descriptor ring and its software slot context.
//! - [`queue`] -- one direction of one channel: prepare/submit over the ring.
//! - [`completion`] -- the three completion-detection strategies
//!   (write-back cell, register poll, interrupt event) and the per-poll
//!   hardware error scan.
//! - [`channel`] -- a receive/transmit queue pair sharing a channel id,
//!   with the reset-and-reconfigure recovery sequence.
//! - [`challoc`] -- channel identity allocation: a static per-direction
//!   bitmap, or the dynamic hardware-table protocol (COI/FCOI/L2P behind
//!   the device's arbitration lock).
//! - [`device`] -- the device context owning configuration, identity, and
//!   the global allocation mutex.
//! - [`poll`] -- the multiplexed event wait used by MSI-X completion mode.
//!
//! The engine performs no blocking operation other than
//! [`poll::PollSet::wait`], imposes no threading model, and never panics on
//! hardware-reported errors; see the crate-level concurrency notes on
//! [`queue::Queue`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod challoc;
pub mod channel;
pub mod completion;
pub mod config;
pub mod desc;
pub mod device;
pub mod poll;
pub mod queue;
pub mod regs;
pub mod request;
pub mod ring;
pub mod stats;

pub use challoc::{AllocationTables, FunctionId};
pub use channel::{Channel, ChannelState};
pub use completion::{CompletionMode, ErrorEvent};
pub use config::{AllocMode, ChannelId, DeviceConfig, Interface};
pub use device::Device;
pub use mcdma_hal::DmaError;
pub use poll::{PollEvent, PollSet};
pub use queue::Queue;
pub use request::{Direction, Directions, Request, RequestFlags};
pub use stats::QueueStats;
