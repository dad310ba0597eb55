//! The device context: configuration, identity, and channel management.

use alloc::sync::Arc;
use alloc::vec::Vec;

use mcdma_hal::{DmaError, HardwareAccess};
use spin::Mutex;

use crate::challoc::{AllocationTables, BitmapAllocator, FunctionId};
use crate::channel::{Channel, ChannelState};
use crate::config::{AllocMode, ChannelId, DeviceConfig};
use crate::poll::PollSet;
use crate::queue::Queue;
use crate::regs;
use crate::request::{Direction, Directions};

/// One logical channel's allocation record (dynamic mode).
#[derive(Debug, Clone, Copy, Default)]
struct LogicalSlot {
    /// A physical channel is claimed in the hardware tables.
    reserved: bool,
    /// A [`Channel`] object currently owns this slot.
    bound: bool,
    /// The claimed physical channel.
    phys_chan: u32,
}

/// Channel allocation state, guarded by the device mutex.
enum AllocState {
    /// Per-direction software bitmaps.
    Static(BitmapAllocator),
    /// Hardware-table protocol plus the logical-channel records.
    Dynamic {
        tables: AllocationTables,
        slots: Vec<LogicalSlot>,
    },
}

/// State shared between the device handle and its channels.
pub(crate) struct DeviceShared {
    pub(crate) hw: Arc<dyn HardwareAccess>,
    pub(crate) config: DeviceConfig,
    pub(crate) ident: FunctionId,
    /// Serializes the channel bitmaps (static mode) or the entire
    /// acquire/release table sequence including the hardware lock dance
    /// (dynamic mode). Never held across queue I/O.
    alloc: Mutex<AllocState>,
}

impl DeviceShared {
    /// Returns a channel identity to the allocator; called from channel
    /// teardown.
    pub(crate) fn release_identity(&self, id: u32, phys_chan: Option<u32>, dirs: Directions) {
        match &mut *self.alloc.lock() {
            AllocState::Static(bitmap) => bitmap.free(id, dirs),
            AllocState::Dynamic { tables, slots } => {
                if let Some(phys) = phys_chan {
                    if let Err(error) = tables.release(id, phys) {
                        log::error!("channel {id} table release failed: {error}");
                        return;
                    }
                }
                if let Some(slot) = slots.get_mut(id as usize) {
                    *slot = LogicalSlot::default();
                }
            }
        }
    }
}

/// An open MCDMA device: the unit of initialization and teardown.
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    /// Opens a device over a hardware backend.
    ///
    /// In dynamic allocation mode the function identity (PF/VF) is read
    /// from the device's ping register at open time.
    ///
    /// # Errors
    ///
    /// [`DmaError::InvalidGeometry`] for an unsupported configuration.
    pub fn open(hw: Arc<dyn HardwareAccess>, config: DeviceConfig) -> Result<Self, DmaError> {
        config.validate()?;

        let (ident, alloc) = match config.alloc_mode {
            AllocMode::Static => (
                FunctionId::default(),
                AllocState::Static(BitmapAllocator::new(config.num_channels)),
            ),
            AllocMode::Dynamic => {
                let ident = FunctionId::read_from(hw.as_ref());
                let logical_max = config
                    .num_channels
                    .min(regs::L2P_CHANNELS_PER_FUNC as u32);
                let tables = AllocationTables::new(
                    hw.clone(),
                    ident,
                    config.num_channels,
                    config.lock_wait,
                );
                let mut slots = Vec::new();
                slots.resize_with(logical_max as usize, LogicalSlot::default);
                (ident, AllocState::Dynamic { tables, slots })
            }
        };

        log::info!(
            "device open: {} channels, {:?} completion, pf {} vf {} vf_active {}",
            config.num_channels,
            config.completion_mode,
            ident.pf,
            ident.vf,
            ident.vf_active
        );

        Ok(Self {
            shared: Arc::new(DeviceShared {
                hw,
                config,
                ident,
                alloc: Mutex::new(alloc),
            }),
        })
    }

    /// Number of channels the device exposes.
    #[must_use]
    pub fn num_channels(&self) -> u32 {
        self.shared.config.num_channels
    }

    /// The function identity read at open time.
    #[must_use]
    pub fn function_id(&self) -> FunctionId {
        self.shared.ident
    }

    /// Acquires a channel and configures a queue for each requested
    /// direction.
    ///
    /// In dynamic mode a specific [`ChannelId::Index`] must have been
    /// pre-acquired with [`Device::acquire_many`]; [`ChannelId::Any`]
    /// binds a pre-acquired channel when one is free and otherwise claims
    /// a fresh one from the hardware tables.
    ///
    /// # Errors
    ///
    /// [`DmaError::ChannelUnavailable`] when no identity can be claimed,
    /// plus any queue-configuration error ([`DmaError::AllocationFailure`],
    /// [`DmaError::ResetTimeout`], ...). On a configuration error the
    /// claimed identity is released again.
    pub fn channel(&self, id: ChannelId, dirs: Directions) -> Result<Channel, DmaError> {
        if dirs.is_empty() {
            return Err(DmaError::ChannelUnavailable);
        }

        let (logical, phys_chan) = self.claim_identity(id, dirs)?;

        let mut channel = Channel {
            shared: self.shared.clone(),
            id: logical,
            phys_chan,
            dirs,
            rx: None,
            tx: None,
            state: ChannelState::Reserved,
        };

        for dir in [Direction::Rx, Direction::Tx] {
            if !dirs.has(dir) {
                continue;
            }
            // Dropping the half-built channel on error returns the
            // identity to the allocator.
            let queue = Queue::new(self.shared.hw.clone(), self.shared.config, logical, dir)?;
            match dir {
                Direction::Rx => channel.rx = Some(queue),
                Direction::Tx => channel.tx = Some(queue),
            }
        }

        channel.state = ChannelState::Configured;
        Ok(channel)
    }

    fn claim_identity(
        &self,
        id: ChannelId,
        dirs: Directions,
    ) -> Result<(u32, Option<u32>), DmaError> {
        match &mut *self.shared.alloc.lock() {
            AllocState::Static(bitmap) => {
                let cid = match id {
                    ChannelId::Any => bitmap
                        .find_free(dirs)
                        .ok_or(DmaError::ChannelUnavailable)?,
                    ChannelId::Index(cid) => {
                        if !bitmap.is_available(cid, dirs) {
                            return Err(DmaError::ChannelUnavailable);
                        }
                        cid
                    }
                };
                bitmap.reserve(cid, dirs);
                Ok((cid, None))
            }
            AllocState::Dynamic { tables, slots } => match id {
                ChannelId::Index(cid) => {
                    let slot = slots
                        .get_mut(cid as usize)
                        .ok_or(DmaError::ChannelUnavailable)?;
                    if !slot.reserved || slot.bound {
                        return Err(DmaError::ChannelUnavailable);
                    }
                    slot.bound = true;
                    Ok((cid, Some(slot.phys_chan)))
                }
                ChannelId::Any => {
                    if let Some(cid) = slots.iter().position(|s| s.reserved && !s.bound) {
                        slots[cid].bound = true;
                        return Ok((cid as u32, Some(slots[cid].phys_chan)));
                    }
                    let cid = slots
                        .iter()
                        .position(|s| !s.reserved)
                        .ok_or(DmaError::ChannelUnavailable)?;
                    let phys = tables.acquire(cid as u32)?;
                    slots[cid] = LogicalSlot {
                        reserved: true,
                        bound: true,
                        phys_chan: phys,
                    };
                    Ok((cid as u32, Some(phys)))
                }
            },
        }
    }

    /// Bulk pre-acquires `count` physical channels from the hardware
    /// tables (dynamic mode); bind them later with
    /// [`ChannelId::Index`].
    ///
    /// Returns the number actually acquired.
    ///
    /// # Errors
    ///
    /// [`DmaError::Unsupported`] in static mode,
    /// [`DmaError::ChannelUnavailable`] when fewer than `count` channels
    /// are free, or a lock error when nothing could be acquired.
    pub fn acquire_many(&self, count: u32) -> Result<u32, DmaError> {
        let mut guard = self.shared.alloc.lock();
        let AllocState::Dynamic { tables, slots } = &mut *guard else {
            return Err(DmaError::Unsupported);
        };

        if tables.available()? < count {
            return Err(DmaError::ChannelUnavailable);
        }

        let mut acquired = 0;
        for _ in 0..count {
            let Some(cid) = slots.iter().position(|s| !s.reserved) else {
                break;
            };
            match tables.acquire(cid as u32) {
                Ok(phys) => {
                    slots[cid] = LogicalSlot {
                        reserved: true,
                        bound: false,
                        phys_chan: phys,
                    };
                    acquired += 1;
                }
                Err(error) if acquired == 0 => return Err(error),
                Err(error) => {
                    log::warn!("bulk acquire stopped early: {error}");
                    break;
                }
            }
        }
        Ok(acquired)
    }

    /// Counts channels currently claimable.
    ///
    /// # Errors
    ///
    /// A hardware-lock error in dynamic mode.
    pub fn available_channels(&self) -> Result<u32, DmaError> {
        match &mut *self.shared.alloc.lock() {
            AllocState::Static(bitmap) => Ok(bitmap.available(Directions::RX | Directions::TX)),
            AllocState::Dynamic { tables, .. } => tables.available(),
        }
    }

    /// Releases every channel this function holds.
    ///
    /// In dynamic mode this walks the function's L2P region under the
    /// hardware lock and clears every confirmed entry; traffic must be
    /// stopped and [`Channel`] objects dropped first.
    ///
    /// Returns the number of channels released.
    ///
    /// # Errors
    ///
    /// A hardware-lock error in dynamic mode.
    pub fn release_all(&self) -> Result<u32, DmaError> {
        match &mut *self.shared.alloc.lock() {
            AllocState::Static(bitmap) => {
                bitmap.clear();
                Ok(0)
            }
            AllocState::Dynamic { tables, slots } => {
                let released = tables.release_all(|logical, phys| {
                    match slots.get_mut(logical as usize) {
                        Some(slot) if slot.reserved && slot.phys_chan == phys => {
                            *slot = LogicalSlot::default();
                            true
                        }
                        _ => false,
                    }
                })?;
                Ok(released)
            }
        }
    }

    /// Creates an empty poll set for MSI-X completion waits.
    #[must_use]
    pub fn poll_set(&self) -> PollSet {
        PollSet::new(self.shared.clone())
    }

    /// Closes the device context.
    ///
    /// Channels must be released first; the backing resources (mapped
    /// windows, pinned pool) belong to the resource layer and outlive the
    /// context.
    pub fn close(self) {
        log::info!("device closed");
    }
}
