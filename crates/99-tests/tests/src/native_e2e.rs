#![cfg(all(test, not(target_arch = "wasm32")))]

use flash_tunnel::{FlashBackend, FlashTunnelClient, FlashTunnelServer, MemFlash};
use hosted_framing::{
    BootupEvent, BootupInfo, Capabilities, FirmwareInfo, IfType, PacketType, HEADER_LEN,
};
use net_channel::{NetChannel, NetChannelConfig, NET_ADDRESS};
use parking_lot::Mutex;
use runtime_native::{LoopbackLink, RunningLink};
use shmem_ipc::{
    Delivery, FnClient, IpcClient, IpcConfig, IpcEndpoint, IpcError, Outbound, Priority,
    SubmitPolicy,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const STREAM_ADDRESS: u32 = 3;

/// Records the little-endian sequence number at the start of each buffer.
fn sequence_recorder(seen: Arc<Mutex<Vec<u32>>>) -> Arc<dyn IpcClient> {
    Arc::new(FnClient::new(move |_, delivery| {
        if let Delivery::Buffer(view) = delivery {
            let bytes: [u8; 4] = view.as_slice()[..4].try_into().unwrap();
            seen.lock().push(u32::from_le_bytes(bytes));
        }
    }))
}

fn silent_sender() -> Arc<dyn IpcClient> {
    Arc::new(FnClient::new(|_, _| {}))
}

fn send_seq(endpoint: &IpcEndpoint, address: u32, priority: Priority, seq: u32) {
    let mut buffer = endpoint.alloc().expect("alloc payload");
    buffer.fill_from(&seq.to_le_bytes()).unwrap();
    endpoint
        .submit(address, priority, Outbound::Owned(buffer))
        .expect("submit payload");
}

fn wait_for(what: &str, timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn blocking_link(start: u32) -> RunningLink {
    let config = IpcConfig {
        submit_policy: SubmitPolicy::Block,
        ..IpcConfig::default()
    };
    LoopbackLink::with_cursor(&config, start)
        .expect("build link")
        .start()
        .expect("start workers")
}

#[test]
fn native_link_flood_across_cursor_wrap() {
    const TARGET: u32 = 10_000;
    let link = blocking_link(u32::MAX - 100);
    let seen = Arc::new(Mutex::new(Vec::with_capacity(TARGET as usize)));
    link.host()
        .register(STREAM_ADDRESS, sequence_recorder(Arc::clone(&seen)))
        .unwrap();
    link.device()
        .register(STREAM_ADDRESS, silent_sender())
        .unwrap();

    for seq in 0..TARGET {
        send_seq(link.device(), STREAM_ADDRESS, Priority::Low, seq);
    }

    wait_for("all payloads", Duration::from_secs(10), || {
        seen.lock().len() == TARGET as usize
    });
    let device_pool = Arc::clone(link.device().pool());
    wait_for("reclaim", Duration::from_secs(5), || {
        device_pool.available() == device_pool.slot_count() as usize
    });

    let seen = seen.lock();
    assert!(seen.iter().copied().eq(0..TARGET), "payloads out of order");
    let device = link.device().metrics();
    let host = link.host().metrics();
    assert_eq!(device.published, u64::from(TARGET));
    assert_eq!(device.reclaimed, u64::from(TARGET));
    assert_eq!(host.delivered, u64::from(TARGET));
    assert_eq!(host.dropped, 0);
    assert_eq!(device.unknown_address, 0);
    drop(seen);
    link.shutdown();
}

#[test]
fn native_link_runs_both_directions_at_once() {
    const TARGET: u32 = 2_000;
    let link = blocking_link(0);
    let to_host = Arc::new(Mutex::new(Vec::new()));
    let to_device = Arc::new(Mutex::new(Vec::new()));
    link.host()
        .register(STREAM_ADDRESS, sequence_recorder(Arc::clone(&to_host)))
        .unwrap();
    link.device()
        .register(STREAM_ADDRESS, sequence_recorder(Arc::clone(&to_device)))
        .unwrap();

    thread::scope(|scope| {
        scope.spawn(|| {
            for seq in 0..TARGET {
                send_seq(link.device(), STREAM_ADDRESS, Priority::Mid, seq);
            }
        });
        for seq in 0..TARGET {
            send_seq(link.host(), STREAM_ADDRESS, Priority::Mid, seq);
        }
    });

    wait_for("both streams", Duration::from_secs(10), || {
        to_host.lock().len() == TARGET as usize && to_device.lock().len() == TARGET as usize
    });
    assert!(to_host.lock().iter().copied().eq(0..TARGET));
    assert!(to_device.lock().iter().copied().eq(0..TARGET));
    link.shutdown();
}

#[test]
fn stepped_link_delivers_high_lane_first() {
    let mut link = LoopbackLink::new(&IpcConfig::default())
        .unwrap()
        .into_stepped();
    let seen = Arc::new(Mutex::new(Vec::new()));
    link.host
        .register(STREAM_ADDRESS, sequence_recorder(Arc::clone(&seen)))
        .unwrap();
    link.device.register(STREAM_ADDRESS, silent_sender()).unwrap();

    for (priority, base) in [(Priority::Low, 300), (Priority::Mid, 200), (Priority::High, 100)] {
        for i in 0..3 {
            send_seq(&link.device, STREAM_ADDRESS, priority, base + i);
        }
    }
    link.run_until_idle();

    assert_eq!(
        *seen.lock(),
        vec![100, 101, 102, 200, 201, 202, 300, 301, 302]
    );
    assert_eq!(link.device.pool().available(), link.device.pool().slot_count() as usize);
}

#[test]
fn stepped_link_rejects_then_recovers_when_lanes_fill() {
    let config = IpcConfig {
        lane_capacity: 2,
        ..IpcConfig::default()
    };
    let mut link = LoopbackLink::new(&config).unwrap().into_stepped();
    let probes = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&probes);
    link.host
        .register(
            STREAM_ADDRESS,
            Arc::new(FnClient::new(move |_, delivery| {
                if matches!(delivery, Delivery::Probe) {
                    *counter.lock() += 1;
                }
            })),
        )
        .unwrap();

    let device = Arc::clone(&link.device);
    device.submit(STREAM_ADDRESS, Priority::Low, Outbound::Probe).unwrap();
    device.submit(STREAM_ADDRESS, Priority::Low, Outbound::Probe).unwrap();
    let rejected = device
        .submit(STREAM_ADDRESS, Priority::Low, Outbound::Probe)
        .unwrap_err();
    assert!(matches!(
        rejected.reason,
        IpcError::QueueFull {
            lane: Priority::Low,
            capacity: 2
        }
    ));
    assert!(matches!(rejected.payload, Outbound::Probe));
    // Other lanes are unaffected.
    device.submit(STREAM_ADDRESS, Priority::High, Outbound::Probe).unwrap();

    link.run_until_idle();
    assert_eq!(*probes.lock(), 3);

    device.submit(STREAM_ADDRESS, Priority::Low, rejected.payload).unwrap();
    link.run_until_idle();
    assert_eq!(*probes.lock(), 4);
    assert_eq!(device.metrics().rejected, 1);
}

#[test]
fn unregistered_address_is_counted_not_delivered() {
    let mut link = LoopbackLink::new(&IpcConfig::default())
        .unwrap()
        .into_stepped();
    link.device
        .submit(STREAM_ADDRESS, Priority::Mid, Outbound::Probe)
        .unwrap();
    link.run_until_idle();

    let host = link.host.metrics();
    assert_eq!(host.unknown_address, 1);
    assert_eq!(host.dropped, 1);
    assert_eq!(host.probes, 0);
}

#[test]
fn net_channel_skips_malformed_frames() {
    let mut link = LoopbackLink::new(&IpcConfig::default())
        .unwrap()
        .into_stepped();
    let device = NetChannel::attach(Arc::clone(&link.device), NetChannelConfig::default()).unwrap();
    let host = NetChannel::attach(Arc::clone(&link.host), NetChannelConfig::default()).unwrap();

    // Shorter than a payload header.
    let mut garbage = link.device.alloc().unwrap();
    garbage.fill_from(&[0xFF; HEADER_LEN - 2]).unwrap();
    link.device
        .submit(NET_ADDRESS, Priority::Low, Outbound::Owned(garbage))
        .unwrap();
    device
        .write(IfType::Sta, 0, PacketType::Data, b"after garbage")
        .unwrap();
    link.run_until_idle();

    let frame = host.try_read().unwrap().expect("valid frame delivered");
    assert_eq!(frame.data, b"after garbage");
    assert_eq!(frame.header.if_type, IfType::Sta);
    assert!(host.try_read().unwrap().is_none());
    assert_eq!(host.stats().malformed, 1);
    assert_eq!(host.stats().received, 1);
}

#[test]
fn net_channel_reads_follow_lane_priority() {
    let mut link = LoopbackLink::new(&IpcConfig::default())
        .unwrap()
        .into_stepped();
    let device = NetChannel::attach(Arc::clone(&link.device), NetChannelConfig::default()).unwrap();
    let host = NetChannel::attach(Arc::clone(&link.host), NetChannelConfig::default()).unwrap();

    device.write(IfType::Sta, 0, PacketType::Data, b"wifi").unwrap();
    device.write(IfType::Hci, 0, PacketType::Data, b"bt").unwrap();
    device
        .write(IfType::Internal, 0, PacketType::Event, b"ctrl")
        .unwrap();
    link.run_until_idle();

    let order: Vec<Vec<u8>> = std::iter::from_fn(|| host.try_read().unwrap())
        .map(|frame| frame.data)
        .collect();
    assert_eq!(order, vec![b"ctrl".to_vec(), b"bt".to_vec(), b"wifi".to_vec()]);
}

#[test]
fn bootup_event_reaches_the_host() {
    let mut link = LoopbackLink::new(&IpcConfig::default())
        .unwrap()
        .into_stepped();
    let device = NetChannel::attach(Arc::clone(&link.device), NetChannelConfig::default()).unwrap();
    let host = NetChannel::attach(Arc::clone(&link.host), NetChannelConfig::default()).unwrap();

    let info = BootupInfo {
        chip_id: Some(0x09),
        capabilities: Some(Capabilities::WLAN_SPI | Capabilities::BT_SPI),
        raw_tp: Some(true),
        firmware: Some(FirmwareInfo {
            major1: 0,
            major2: 7,
            minor: 12,
            last_reset_reason: 3,
        }),
        ..BootupInfo::default()
    };
    device.send_bootup_event(info.clone()).unwrap();
    link.run_until_idle();

    let frame = host.try_read().unwrap().expect("bootup frame");
    assert_eq!(frame.if_type(), IfType::Internal);
    assert_eq!(frame.lane(), Priority::High);
    assert_eq!(frame.header.packet_type, PacketType::Event);
    let event = BootupEvent::decode(&frame.data).unwrap();
    assert_eq!(event.status, 0);
    assert_eq!(event.info, info);
}

#[test]
fn flash_tunnel_runs_each_command_once() {
    let link = LoopbackLink::new(&IpcConfig::default()).unwrap();
    let flash = Arc::new(MemFlash::new(16 * 1024));
    let server = FlashTunnelServer::attach(link.device(), flash.clone()).unwrap();
    let link = link.start().unwrap();
    let client = FlashTunnelClient::connect(Arc::clone(link.host()), Duration::from_secs(5)).unwrap();

    let image: Vec<u8> = (0..3000u32).map(|i| (i * 13 % 256) as u8).collect();
    client.write(0x400, &image).unwrap();
    let mut back = vec![0u8; image.len()];
    client.read(0x400, &mut back).unwrap();
    assert_eq!(back, image);
    client.erase(0x400, 0x100).unwrap();

    let mut head = [0u8; 0x100];
    flash.read(0x400, &mut head).unwrap();
    assert!(head.iter().all(|&b| b == 0xFF));
    assert_eq!(flash.snapshot()[0x500..0x400 + 3000], image[0x100..]);

    let stats = server.stats();
    assert_eq!(stats.blocks_issued, 1);
    // Three write windows, three read windows, one erase.
    assert_eq!(stats.executed, 7);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.abandoned, 0);
    drop(client);
    link.shutdown();
}

// Slow tests: heavy workloads, marked #[ignore] and prefixed with "slow_".
#[test]
#[ignore]
fn slow_stress_mixed_lanes_across_wrap() {
    const TARGET: u32 = 200_000;
    let link = blocking_link(u32::MAX - 5_000);
    let seen = Arc::new(Mutex::new(Vec::with_capacity(TARGET as usize)));
    link.host()
        .register(STREAM_ADDRESS, sequence_recorder(Arc::clone(&seen)))
        .unwrap();
    link.device()
        .register(STREAM_ADDRESS, silent_sender())
        .unwrap();

    let lanes = [Priority::High, Priority::Mid, Priority::Low];
    for seq in 0..TARGET {
        send_seq(link.device(), STREAM_ADDRESS, lanes[seq as usize % 3], seq);
    }
    wait_for("all payloads", Duration::from_secs(120), || {
        seen.lock().len() == TARGET as usize
    });

    let mut sorted = seen.lock().clone();
    sorted.sort_unstable();
    assert!(sorted.into_iter().eq(0..TARGET), "payload lost or duplicated");
    // Within one lane delivery stays FIFO.
    for lane in 0..3 {
        let lane_seqs: Vec<u32> = seen
            .lock()
            .iter()
            .copied()
            .filter(|seq| seq % 3 == lane)
            .collect();
        assert!(lane_seqs.windows(2).all(|pair| pair[0] < pair[1]));
    }
    link.shutdown();
}
