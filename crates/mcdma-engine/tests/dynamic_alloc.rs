//! Dynamic channel allocation protocol tests over the simulated tables.

use std::sync::Arc;

use mcdma_engine::{
    AllocMode, ChannelId, CompletionMode, Device, DeviceConfig, Directions, DmaError, Interface,
    regs,
};
use mcdma_sim::{SimConfig, SimDevice};

fn device_config(num_channels: u32) -> DeviceConfig {
    DeviceConfig {
        num_channels,
        desc_per_page: 128,
        pages_per_queue: 1,
        completion_mode: CompletionMode::WriteBack,
        interface: Interface::Streaming,
        alloc_mode: AllocMode::Dynamic,
        reset_wait: 256,
        head_move_wait: 256,
        lock_wait: 64,
        ..DeviceConfig::default()
    }
}

fn open(sim_config: SimConfig, num_channels: u32) -> (Arc<SimDevice>, Device) {
    let sim = Arc::new(SimDevice::new(sim_config));
    let device = Device::open(sim.clone(), device_config(num_channels)).expect("device open");
    (sim, device)
}

#[test]
fn acquire_publishes_all_three_tables() {
    let (sim, device) = open(SimConfig::default(), 8);

    let channel = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("channel");
    assert_eq!(channel.phys_chan(), Some(0));

    // COI bit set, FCOI low half owned by PF0 with the allocated flag,
    // lock released afterwards.
    assert_eq!(sim.global_reg(regs::COI_BASE) & 1, 1);
    let fcoi = sim.global_reg(regs::FCOI_BASE);
    assert_eq!(fcoi & 0xFFFF, u32::from(device.function_id().fcoi_entry()));
    assert_eq!(sim.global_reg(regs::LOCK), 0);

    drop(channel);
    assert_eq!(sim.global_reg(regs::COI_BASE) & 1, 0);
    assert_eq!(sim.global_reg(regs::FCOI_BASE) & 0xFFFF, 0);
}

#[test]
fn exhaustion_reports_channel_unavailable() {
    let (_sim, device) = open(SimConfig::default(), 4);

    let mut held: Vec<_> = (0..4)
        .map(|i| {
            device
                .channel(ChannelId::Any, Directions::TX)
                .unwrap_or_else(|e| panic!("channel {i}: {e}"))
        })
        .collect();

    assert_eq!(
        device
            .channel(ChannelId::Any, Directions::TX)
            .expect_err("tables are full"),
        DmaError::ChannelUnavailable
    );

    // Releasing one makes a channel claimable again, and the reacquired
    // physical channel is the freed one.
    let second = held.remove(1);
    let freed_phys = second.phys_chan();
    drop(second);
    let again = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("reacquire");
    assert_eq!(again.phys_chan(), freed_phys);
    drop(held);
}

#[test]
fn releasing_low_half_preserves_high_half_byte_for_byte() {
    let (sim, device) = open(SimConfig::default(), 8);

    let low = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("low half");
    let high = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("high half");
    assert_eq!(low.phys_chan(), Some(0));
    assert_eq!(high.phys_chan(), Some(1));

    let fcoi_before = sim.global_reg(regs::FCOI_BASE);
    let l2p_base = device.function_id().l2p_base();
    let l2p_before = sim.global_reg(l2p_base);
    assert_ne!(fcoi_before >> 16, 0, "high half must be populated");

    drop(low);

    let fcoi_after = sim.global_reg(regs::FCOI_BASE);
    let l2p_after = sim.global_reg(l2p_base);
    assert_eq!(fcoi_after & 0xFFFF, 0, "low half must be cleared");
    assert_eq!(
        fcoi_after >> 16,
        fcoi_before >> 16,
        "sibling FCOI entry was disturbed"
    );
    assert_eq!(
        l2p_after >> 16,
        l2p_before >> 16,
        "sibling L2P entry was disturbed"
    );
    // And the sibling channel's COI bit survives.
    assert_eq!(sim.global_reg(regs::COI_BASE) & 0b10, 0b10);
}

#[test]
fn bulk_acquire_then_bind_specific_logicals() {
    let (_sim, device) = open(SimConfig::default(), 8);

    assert_eq!(device.available_channels().expect("census"), 8);
    assert_eq!(device.acquire_many(3).expect("bulk acquire"), 3);
    assert_eq!(device.available_channels().expect("census"), 5);

    let bound = device
        .channel(ChannelId::Index(0), Directions::TX)
        .expect("bind pre-acquired");
    assert_eq!(bound.phys_chan(), Some(0));

    // A logical channel that was never pre-acquired cannot be bound.
    assert_eq!(
        device
            .channel(ChannelId::Index(6), Directions::TX)
            .expect_err("not pre-acquired"),
        DmaError::ChannelUnavailable
    );

    // Binding the same logical twice is refused.
    assert_eq!(
        device
            .channel(ChannelId::Index(0), Directions::TX)
            .expect_err("already bound"),
        DmaError::ChannelUnavailable
    );
}

#[test]
fn bulk_acquire_beyond_capacity_is_refused() {
    let (_sim, device) = open(SimConfig::default(), 4);
    assert_eq!(
        device.acquire_many(5).expect_err("only 4 channels exist"),
        DmaError::ChannelUnavailable
    );
    // Nothing was claimed by the failed attempt.
    assert_eq!(device.available_channels().expect("census"), 4);
}

#[test]
fn release_all_walks_the_l2p_region() {
    let (sim, device) = open(SimConfig::default(), 8);

    assert_eq!(device.acquire_many(3).expect("bulk acquire"), 3);
    assert_ne!(sim.global_reg(regs::COI_BASE), 0);

    assert_eq!(device.release_all().expect("release all"), 3);
    assert_eq!(sim.global_reg(regs::COI_BASE), 0);
    assert_eq!(sim.global_reg(regs::FCOI_BASE), 0);
    assert_eq!(device.available_channels().expect("census"), 8);

    // An empty region releases nothing and does not error, even though
    // its first entry reads zero.
    assert_eq!(device.release_all().expect("empty release all"), 0);
}

#[test]
fn busy_hardware_times_out_the_lock() {
    let (sim, device) = open(SimConfig::default(), 8);
    sim.set_busy(true);
    assert_eq!(
        device
            .channel(ChannelId::Any, Directions::TX)
            .expect_err("busy never clears"),
        DmaError::HardwareLockTimeout
    );
    sim.set_busy(false);
    assert!(device.channel(ChannelId::Any, Directions::TX).is_ok());
}

#[test]
fn lost_lock_arbitration_is_retried() {
    let (sim, device) = open(SimConfig::default(), 8);
    // First attempt loses to a foreign function; the retry wins.
    sim.contend_next_lock(0xBEEF);
    assert!(device.channel(ChannelId::Any, Directions::TX).is_ok());
}

#[test]
fn vf_uses_its_own_l2p_region() {
    let (sim, device) = open(
        SimConfig {
            pf: 0,
            vf: 1,
            vf_active: true,
            ..SimConfig::default()
        },
        8,
    );

    let ident = device.function_id();
    assert!(ident.vf_active);
    assert_eq!(ident.vf, 1);

    let a = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("first");
    let b = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("second");
    assert_eq!(a.phys_chan(), Some(0));
    assert_eq!(b.phys_chan(), Some(1));

    // Logical 1 -> physical 1 sits in the high half of the VF region's
    // first word; the PF region is untouched.
    let vf_word = sim.global_reg(ident.l2p_base());
    assert_eq!(vf_word >> 16, 1);
    assert_eq!(sim.global_reg(regs::L2P_PF_BASE), 0);
}
