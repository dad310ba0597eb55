//! Queue engine integration tests over the simulated device.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use mcdma_engine::{
    AllocMode, ChannelId, CompletionMode, Device, DeviceConfig, Direction, Directions, DmaError,
    Interface, Request, RequestFlags,
};
use mcdma_hal::HardwareAccess;
use mcdma_sim::{FetchError, SimConfig, SimDevice};

fn device_config() -> DeviceConfig {
    DeviceConfig {
        num_channels: 8,
        desc_per_page: 128,
        pages_per_queue: 1,
        completion_mode: CompletionMode::WriteBack,
        interface: Interface::Streaming,
        alloc_mode: AllocMode::Static,
        reset_wait: 256,
        head_move_wait: 256,
        lock_wait: 64,
        ..DeviceConfig::default()
    }
}

fn open(sim_config: SimConfig, config: DeviceConfig) -> (Arc<SimDevice>, Device) {
    let sim = Arc::new(SimDevice::new(sim_config));
    let device = Device::open(sim.clone(), config).expect("device open");
    (sim, device)
}

fn request(sim: &SimDevice, len: u32, user: usize) -> Request {
    let region = sim.alloc_dma(len.max(64) as usize).expect("buffer");
    Request::new(region.virt(), region.phys(), len).with_user(user)
}

#[test]
fn single_page_sof_eof_scenario() {
    let (sim, device) = open(SimConfig::default(), device_config());
    let mut channel = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("channel");

    for i in 0..127 {
        let mut r = request(&sim, 64, i);
        if i == 0 {
            r.flags |= RequestFlags::SOF;
        }
        if i == 126 {
            r.flags |= RequestFlags::EOF;
        }
        channel
            .prepare(Direction::Tx, r)
            .unwrap_or_else(|(e, _)| panic!("prepare {i}: {e}"));
    }
    channel.submit(Direction::Tx).expect("submit");

    let mut done = Vec::new();
    let n = channel
        .poll(Direction::Tx, &mut done, 127)
        .expect("poll");
    assert_eq!(n, 127);
    assert_eq!(done.len(), 127);
    for (i, r) in done.iter().enumerate() {
        assert_eq!(r.user, i, "completions out of order");
    }
}

#[test]
fn queue_full_after_127_requests_on_one_page() {
    let (sim, device) = open(
        SimConfig {
            auto_complete: false,
            ..SimConfig::default()
        },
        device_config(),
    );
    let mut channel = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("channel");

    for i in 0..127 {
        let r = request(&sim, 64, i);
        channel
            .prepare(Direction::Tx, r)
            .unwrap_or_else(|(e, _)| panic!("prepare {i}: {e}"));
    }
    let overflow = request(&sim, 64, 127);
    let (err, returned) = channel
        .prepare(Direction::Tx, overflow)
        .expect_err("128th request must not fit");
    assert_eq!(err, DmaError::QueueFull);
    assert_eq!(returned.user, 127);

    // Complete everything; the count harvested equals the count prepared.
    channel.submit(Direction::Tx).expect("submit");
    sim.complete(channel.id(), Direction::Tx, u32::MAX);
    let mut done = Vec::new();
    let n = channel
        .poll(Direction::Tx, &mut done, usize::MAX)
        .expect("poll");
    assert_eq!(n, 127);
}

#[test]
fn wraparound_three_laps_loses_nothing() {
    let (sim, device) = open(SimConfig::default(), device_config());
    let mut channel = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("channel");

    let total = 127 * 3;
    let mut harvested = Vec::new();
    let mut next = 0;
    while next < total || harvested.len() < total {
        while next < total && channel.queue(Direction::Tx).expect("queue").free_slots() >= 2 {
            let r = request(&sim, 64, next);
            channel
                .prepare(Direction::Tx, r)
                .unwrap_or_else(|(e, _)| panic!("prepare {next}: {e}"));
            next += 1;
        }
        channel.submit(Direction::Tx).expect("submit");
        channel
            .poll(Direction::Tx, &mut harvested, usize::MAX)
            .expect("poll");
    }

    assert_eq!(harvested.len(), total);
    for (i, r) in harvested.iter().enumerate() {
        assert_eq!(r.user, i, "completion {i} out of order");
    }
}

#[test]
fn full_ring_batch_uses_tail_workaround() {
    let (sim, device) = open(SimConfig::default(), device_config());
    let mut channel = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("channel");
    let id = channel.id();

    // First batch parks the tail on the last slot of the ring.
    for i in 0..127 {
        let r = request(&sim, 64, i);
        channel
            .prepare(Direction::Tx, r)
            .unwrap_or_else(|(e, _)| panic!("prepare {i}: {e}"));
    }
    channel.submit(Direction::Tx).expect("submit");
    let mut done = Vec::new();
    assert_eq!(
        channel
            .poll(Direction::Tx, &mut done, usize::MAX)
            .expect("poll"),
        127
    );

    // The second full batch wraps the tail back onto the same slot value;
    // a plain rewrite would be ignored by the hardware.
    for i in 127..254 {
        let r = request(&sim, 64, i);
        channel
            .prepare(Direction::Tx, r)
            .unwrap_or_else(|(e, _)| panic!("prepare {i}: {e}"));
    }
    channel.submit(Direction::Tx).expect("submit");

    let writes = sim.tail_writes(id, Direction::Tx);
    let qlen: u32 = 128;
    assert_eq!(
        &writes[writes.len() - 2..],
        &[qlen, qlen - 1][..],
        "expected the wrapped tail value before the true tail, got {writes:?}"
    );

    done.clear();
    assert_eq!(
        channel
            .poll(Direction::Tx, &mut done, usize::MAX)
            .expect("poll"),
        127
    );
    for (i, r) in done.iter().enumerate() {
        assert_eq!(r.user, 127 + i);
    }
}

#[test]
fn full_lap_reports_qlen_not_zero() {
    let (sim, device) = open(
        SimConfig {
            auto_complete: false,
            ..SimConfig::default()
        },
        device_config(),
    );
    let mut channel = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("channel");
    let id = channel.id();

    for i in 0..127 {
        let r = request(&sim, 64, i);
        channel.prepare(Direction::Tx, r).map_err(|(e, _)| e).expect("prepare");
    }
    channel.submit(Direction::Tx).expect("submit");
    sim.complete(id, Direction::Tx, u32::MAX);
    let mut done = Vec::new();
    channel
        .poll(Direction::Tx, &mut done, usize::MAX)
        .expect("poll");
    assert_eq!(done.len(), 127);

    // Second full batch: after hardware consumes all 128 slots the
    // ring-relative head lands exactly where the software head already
    // is. Only the raw counter reveals the lap.
    for i in 0..127 {
        let r = request(&sim, 64, 1000 + i);
        channel.prepare(Direction::Tx, r).map_err(|(e, _)| e).expect("prepare");
    }
    channel.submit(Direction::Tx).expect("submit");
    sim.complete(id, Direction::Tx, u32::MAX);

    done.clear();
    let n = channel
        .poll(Direction::Tx, &mut done, usize::MAX)
        .expect("poll");
    assert_eq!(n, 127, "a full lap must not read as no progress");
}

#[test]
fn eof_without_sof_is_rejected() {
    let (sim, device) = open(SimConfig::default(), device_config());
    let mut channel = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("channel");

    let r = request(&sim, 64, 0).with_flags(RequestFlags::EOF);
    let (err, _) = channel
        .prepare(Direction::Tx, r)
        .expect_err("EOF without SOF");
    assert_eq!(err, DmaError::InvalidSequence);

    // A balanced SOF .. EOF pair across several requests is accepted.
    let r = request(&sim, 64, 1).with_flags(RequestFlags::SOF);
    channel.prepare(Direction::Tx, r).map_err(|(e, _)| e).expect("SOF");
    let r = request(&sim, 64, 2);
    channel.prepare(Direction::Tx, r).map_err(|(e, _)| e).expect("mid");
    let r = request(&sim, 64, 3).with_flags(RequestFlags::EOF);
    channel.prepare(Direction::Tx, r).map_err(|(e, _)| e).expect("EOF");

    // A single-request file carries both flags.
    let r = request(&sim, 64, 4).with_flags(RequestFlags::SOF | RequestFlags::EOF);
    channel.prepare(Direction::Tx, r).map_err(|(e, _)| e).expect("SOF|EOF");

    // The EOF above closed the file again.
    let r = request(&sim, 64, 5).with_flags(RequestFlags::EOF);
    let (err, _) = channel
        .prepare(Direction::Tx, r)
        .expect_err("file is closed");
    assert_eq!(err, DmaError::InvalidSequence);
}

#[test]
fn invalid_lengths_are_rejected() {
    let (sim, device) = open(SimConfig::default(), device_config());
    let mut channel = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("channel");

    let r = request(&sim, 0, 0);
    let (err, _) = channel.prepare(Direction::Tx, r).expect_err("zero length");
    assert_eq!(err, DmaError::InvalidLength);

    // A ragged length is only allowed on the final descriptor of a file.
    let r = request(&sim, 100, 1);
    let (err, _) = channel
        .prepare(Direction::Tx, r)
        .expect_err("ragged non-EOF");
    assert_eq!(err, DmaError::InvalidLength);

    let r = request(&sim, 100, 2).with_flags(RequestFlags::SOF | RequestFlags::EOF);
    channel
        .prepare(Direction::Tx, r)
        .map_err(|(e, _)| e)
        .expect("ragged EOF is fine");
}

#[test]
fn register_poll_mode_completes() {
    let config = DeviceConfig {
        completion_mode: CompletionMode::RegisterPoll,
        ..device_config()
    };
    let (sim, device) = open(SimConfig::default(), config);
    let mut channel = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("channel");

    for i in 0..32 {
        let r = request(&sim, 64, i);
        channel.prepare(Direction::Tx, r).map_err(|(e, _)| e).expect("prepare");
    }
    channel.submit(Direction::Tx).expect("submit");

    let mut done = Vec::new();
    let n = channel
        .poll(Direction::Tx, &mut done, usize::MAX)
        .expect("poll");
    assert_eq!(n, 32);
}

#[test]
fn rx_completion_decodes_framing() {
    let (sim, device) = open(
        SimConfig {
            auto_complete: false,
            ..SimConfig::default()
        },
        device_config(),
    );
    let mut channel = device
        .channel(ChannelId::Any, Directions::RX)
        .expect("channel");
    let id = channel.id();

    sim.push_rx_segment(
        id,
        Direction::Rx,
        mcdma_sim::RxSegment {
            sof: true,
            eof: false,
            payload: 0,
        },
    );
    sim.push_rx_segment(
        id,
        Direction::Rx,
        mcdma_sim::RxSegment {
            sof: false,
            eof: true,
            payload: 4096,
        },
    );

    for i in 0..2 {
        let r = request(&sim, 4096, i);
        channel.prepare(Direction::Rx, r).map_err(|(e, _)| e).expect("prepare");
    }
    channel.submit(Direction::Rx).expect("submit");
    sim.complete(id, Direction::Rx, u32::MAX);

    let mut done = Vec::new();
    channel
        .poll(Direction::Rx, &mut done, usize::MAX)
        .expect("poll");
    assert_eq!(done.len(), 2);
    assert!(done[0].flags.contains(RequestFlags::SOF));
    assert!(!done[0].flags.contains(RequestFlags::EOF));
    assert!(done[1].flags.contains(RequestFlags::EOF));
    assert_eq!(done[1].payload_len, 4096);
}

#[test]
fn msix_mode_delivers_events_to_the_registered_set() {
    let config = DeviceConfig {
        completion_mode: CompletionMode::Msix,
        ..device_config()
    };
    let (sim, device) = open(SimConfig::default(), config);
    let mut channel = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("channel");

    let mut set = device.poll_set();
    set.add(&channel, Direction::Tx).expect("add");

    let r = request(&sim, 64, 0).with_flags(RequestFlags::SOF | RequestFlags::EOF);
    channel.start(Direction::Tx, r).map_err(|(e, _)| e).expect("start");

    let mut events = Vec::new();
    let n = set.wait(&mut events, 100).expect("wait");
    assert_eq!(n, 1);
    assert_eq!(events[0].channel, channel.id());
    assert_eq!(events[0].direction, Direction::Tx);

    let mut done = Vec::new();
    assert_eq!(
        channel
            .poll(Direction::Tx, &mut done, usize::MAX)
            .expect("poll"),
        1
    );

    // No further events without new completions.
    events.clear();
    assert_eq!(set.wait(&mut events, 0).expect("wait"), 0);
}

#[test]
fn tid_error_resets_queue_and_keeps_counters_monotonic() {
    let (sim, device) = open(SimConfig::default(), device_config());
    let mut channel = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("channel");
    let id = channel.id();

    let seen = Arc::new(AtomicU32::new(0));
    let seen_in_cb = seen.clone();
    channel
        .queue(Direction::Tx)
        .expect("queue")
        .set_error_handler(Box::new(move |event| {
            assert_eq!(event.error, DmaError::TidError);
            assert_eq!(event.direction, Direction::Tx);
            seen_in_cb.fetch_add(1, Ordering::Relaxed);
        }));

    let r = request(&sim, 64, 0).with_flags(RequestFlags::SOF | RequestFlags::EOF);
    channel.start(Direction::Tx, r).map_err(|(e, _)| e).expect("start");

    sim.inject_drops(id, Direction::Tx, 5);
    let mut done = Vec::new();
    let err = channel
        .poll(Direction::Tx, &mut done, usize::MAX)
        .expect_err("drops must surface");
    assert_eq!(err, DmaError::TidError);
    assert_eq!(seen.load(Ordering::Relaxed), 1);

    let stats = *channel.queue(Direction::Tx).expect("queue").stats();
    assert_eq!(stats.data_drops, 5);
    assert_eq!(stats.resets, 1);

    // The queue is reconfigured and serviceable; counters only grow.
    let r = request(&sim, 64, 1).with_flags(RequestFlags::SOF | RequestFlags::EOF);
    channel.start(Direction::Tx, r).map_err(|(e, _)| e).expect("start after reset");
    done.clear();
    assert_eq!(
        channel
            .poll(Direction::Tx, &mut done, usize::MAX)
            .expect("poll"),
        1
    );

    sim.inject_drops(id, Direction::Tx, 3);
    let _ = channel.poll(Direction::Tx, &mut done, usize::MAX);
    let after = *channel.queue(Direction::Tx).expect("queue").stats();
    assert!(after.data_drops >= stats.data_drops);
    assert_eq!(after.data_drops, 8);
    assert_eq!(after.resets, 2);
}

#[test]
fn completion_timeout_is_reported_but_does_not_reset() {
    let (sim, device) = open(SimConfig::default(), device_config());
    let mut channel = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("channel");
    let id = channel.id();

    let seen = Arc::new(AtomicU32::new(0));
    let seen_in_cb = seen.clone();
    channel
        .queue(Direction::Tx)
        .expect("queue")
        .set_error_handler(Box::new(move |event| {
            assert_eq!(event.error, DmaError::CompletionTimeout);
            seen_in_cb.fetch_add(1, Ordering::Relaxed);
        }));

    sim.inject_completion_timeout(id, Direction::Tx);
    let mut done = Vec::new();
    channel
        .poll(Direction::Tx, &mut done, usize::MAX)
        .expect("timeout does not fail the poll");
    assert_eq!(seen.load(Ordering::Relaxed), 1);
    assert_eq!(channel.queue(Direction::Tx).expect("queue").stats().resets, 0);

    // The latch was cleared in-register; no repeat report.
    channel
        .poll(Direction::Tx, &mut done, usize::MAX)
        .expect("poll");
    assert_eq!(seen.load(Ordering::Relaxed), 1);
}

#[test]
fn fetch_error_recovers_and_returns_in_flight_requests() {
    let (sim, device) = open(
        SimConfig {
            auto_complete: false,
            ..SimConfig::default()
        },
        device_config(),
    );
    let mut channel = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("channel");
    let id = channel.id();

    for i in 0..4 {
        let r = request(&sim, 64, i);
        channel.prepare(Direction::Tx, r).map_err(|(e, _)| e).expect("prepare");
    }
    channel.submit(Direction::Tx).expect("submit");

    sim.inject_fetch_error(id, Direction::Tx, FetchError::Descriptor);
    let mut done = Vec::new();
    let err = channel
        .poll(Direction::Tx, &mut done, usize::MAX)
        .expect_err("fetch error");
    assert_eq!(err, DmaError::DescriptorFetchError);

    // The four in-flight requests came back through the reset drain.
    assert_eq!(done.len(), 4);
    assert_eq!(channel.queue(Direction::Tx).expect("queue").stats().resets, 1);

    // Recovery cleared the reported error.
    done.clear();
    assert_eq!(
        channel
            .poll(Direction::Tx, &mut done, usize::MAX)
            .expect("clean after reset"),
        0
    );
}

#[test]
fn reset_timeout_when_hardware_stays_asserted() {
    let (sim, device) = open(
        SimConfig {
            auto_complete: false,
            ..SimConfig::default()
        },
        device_config(),
    );
    let mut channel = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("channel");
    let id = channel.id();

    sim.hold_reset(id, Direction::Tx, true);
    assert_eq!(
        channel.reset(Direction::Tx).expect_err("reset must time out"),
        DmaError::ResetTimeout
    );
}

#[test]
fn static_channel_identity_round_trip() {
    let (_sim, device) = open(SimConfig::default(), device_config());

    let a = device
        .channel(ChannelId::Any, Directions::RX | Directions::TX)
        .expect("first");
    let b = device
        .channel(ChannelId::Any, Directions::RX | Directions::TX)
        .expect("second");
    assert_ne!(a.id(), b.id());

    let freed = a.id();
    drop(a);
    let c = device
        .channel(ChannelId::Index(freed), Directions::RX | Directions::TX)
        .expect("reacquire released id");
    assert_eq!(c.id(), freed);

    // The id still held by `b` stays claimed.
    assert!(
        device
            .channel(ChannelId::Index(b.id()), Directions::RX)
            .is_err()
    );
}

#[test]
fn memory_mapped_interface_skips_stream_validation() {
    let config = DeviceConfig {
        interface: Interface::MemoryMapped,
        ..device_config()
    };
    let (sim, device) = open(SimConfig::default(), config);
    let mut channel = device
        .channel(ChannelId::Any, Directions::TX)
        .expect("channel");

    // Ragged lengths are fine on the memory-mapped interface.
    let mut r = request(&sim, 100, 0);
    r.dest = 0x10_0000;
    channel.start(Direction::Tx, r).map_err(|(e, _)| e).expect("start");

    let mut done = Vec::new();
    assert_eq!(
        channel
            .poll(Direction::Tx, &mut done, usize::MAX)
            .expect("poll"),
        1
    );
}
