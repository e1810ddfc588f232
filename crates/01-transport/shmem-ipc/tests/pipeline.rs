//! Endpoint behaviour against a hand-driven peer.
//!
//! The host endpoint is real; the device side is just the raw ring ends, so
//! each test decides exactly when the peer consumes or publishes.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use shmem_ipc::{
    Delivery, EndpointWiring, EndpointWorkers, FnClient, IpcClient, IpcConfig, IpcEndpoint,
    IpcError, Outbound, Priority, SubmitPolicy,
};
use shmem_transport::{
    BufferPool, DoorbellRegister, LoopbackDoorbell, PoolDirectory, RingConsumer, RingEntry,
    RingProducer, ShmemLayout, Side,
};

const NET: u32 = 1;

#[derive(Default)]
struct Recorder {
    received: Mutex<Vec<(u32, Option<Vec<u8>>)>>,
    done: Mutex<Vec<(u32, Vec<u8>)>>,
}

impl IpcClient for Recorder {
    fn on_receive(&self, address: u32, delivery: Delivery<'_>) {
        let bytes = match delivery {
            Delivery::Probe => None,
            Delivery::Buffer(view) => Some(view.as_slice().to_vec()),
        };
        self.received.lock().push((address, bytes));
    }

    fn on_transmit_done(&self, address: u32, payload: Outbound) {
        let bytes = payload
            .into_handle()
            .map(|handle| handle.as_slice().to_vec())
            .unwrap_or_default();
        self.done.lock().push((address, bytes));
    }
}

struct Harness {
    host: Arc<IpcEndpoint>,
    workers: EndpointWorkers,
    peer_tx: RingProducer,
    peer_rx: RingConsumer,
    peer_pool: Arc<BufferPool>,
    to_peer: Arc<LoopbackDoorbell>,
    recorder: Arc<Recorder>,
}

impl Harness {
    fn new(config: IpcConfig) -> Self {
        let layout = ShmemLayout::new(config.ring_capacity).expect("layout");
        let pool = BufferPool::new(config.pool_config(1)).expect("host pool");
        let peer_pool = BufferPool::new(config.pool_config(2)).expect("peer pool");
        let mut pools = PoolDirectory::new();
        pools.insert(Arc::clone(&peer_pool)).expect("insert peer pool");

        let to_peer = Arc::new(LoopbackDoorbell::new(Arc::new(DoorbellRegister::new())));
        let from_peer = Arc::new(DoorbellRegister::new());
        let (host, workers) = IpcEndpoint::new(
            &config,
            &layout,
            Side::Host,
            pool,
            pools,
            EndpointWiring {
                outbound: to_peer.clone(),
                inbound: from_peer,
            },
        )
        .expect("host endpoint");
        let (peer_tx, peer_rx) = layout.claim(Side::Device).expect("device rings");

        let recorder = Arc::new(Recorder::default());
        host.register(NET, recorder.clone()).expect("register");
        Self {
            host,
            workers,
            peer_tx,
            peer_rx,
            peer_pool,
            to_peer,
            recorder,
        }
    }

    fn send(&self, priority: Priority, bytes: &[u8]) {
        let mut buffer = self.host.alloc().expect("alloc");
        buffer.fill_from(bytes).expect("fill");
        self.host
            .submit(NET, priority, Outbound::Owned(buffer))
            .expect("submit");
    }

    /// Consumes up to `limit` entries as the peer, returning their payloads.
    fn peer_consume(&mut self, limit: usize) -> Vec<Vec<u8>> {
        let pools = self.host.pools().clone();
        let mut out = Vec::new();
        for entry in self.peer_rx.drain().take(limit) {
            let view = pools.resolve(entry.pointer).expect("resolve host buffer");
            out.push(view.as_slice().to_vec());
        }
        out
    }

    fn done(&self) -> Vec<Vec<u8>> {
        self.recorder
            .done
            .lock()
            .iter()
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }
}

fn frames(items: &[&str]) -> Vec<Vec<u8>> {
    items.iter().map(|s| s.as_bytes().to_vec()).collect()
}

fn small_ring() -> IpcConfig {
    IpcConfig {
        ring_capacity: 4,
        ..IpcConfig::default()
    }
}

#[test]
fn lanes_drain_in_strict_priority_then_fifo() {
    let mut h = Harness::new(IpcConfig::default());
    h.send(Priority::Low, b"low-1");
    h.send(Priority::Mid, b"mid-1");
    h.send(Priority::Low, b"low-2");
    h.send(Priority::High, b"high-1");
    h.send(Priority::Mid, b"mid-2");

    let stats = h.workers.tx.drain_once();
    assert_eq!(stats.published, 5);
    assert!(stats.doorbell_rung);
    assert_eq!(h.to_peer.register().raised(), 1, "one doorbell per batch");

    assert_eq!(
        h.peer_consume(usize::MAX),
        frames(&["high-1", "mid-1", "mid-2", "low-1", "low-2"])
    );
}

#[test]
fn reclaim_waits_for_the_peer_read_cursor() {
    let mut h = Harness::new(IpcConfig::default());
    h.send(Priority::Low, b"a");
    h.send(Priority::Low, b"b");

    let stats = h.workers.tx.drain_once();
    assert_eq!((stats.published, stats.reclaimed), (2, 0));
    assert_eq!(h.workers.tx.in_flight(), 2);
    assert!(h.done().is_empty());

    assert_eq!(h.workers.tx.drain_once().reclaimed, 0);
    assert!(h.done().is_empty());

    h.peer_consume(1);
    assert_eq!(h.workers.tx.drain_once().reclaimed, 1);
    assert_eq!(h.done(), vec![b"a".to_vec()]);

    h.peer_consume(1);
    assert_eq!(h.workers.tx.drain_once().reclaimed, 1);
    assert_eq!(h.workers.tx.drain_once().reclaimed, 0, "reclaimed at most once");
    assert_eq!(h.done(), vec![b"a".to_vec(), b"b".to_vec()]);
    assert_eq!(h.workers.tx.in_flight(), 0);
}

#[test]
fn full_ring_holds_the_rest_on_the_lanes() {
    let mut h = Harness::new(small_ring());
    for i in 0..6u8 {
        h.send(Priority::Low, &[i]);
    }

    assert_eq!(h.workers.tx.drain_once().published, 4);
    assert_eq!(h.host.submitter().queued(), [0, 0, 2]);
    assert_eq!(h.workers.tx.drain_once().published, 0);

    assert_eq!(h.peer_consume(usize::MAX), vec![vec![0], vec![1], vec![2], vec![3]]);
    let stats = h.workers.tx.drain_once();
    assert_eq!((stats.reclaimed, stats.published), (4, 2));
    assert_eq!(h.peer_consume(usize::MAX), vec![vec![4], vec![5]]);
}

#[test]
fn full_lane_rejects_and_recovers() {
    let config = IpcConfig {
        lane_capacity: 2,
        ..small_ring()
    };
    let mut h = Harness::new(config);
    h.send(Priority::Mid, b"1");
    h.send(Priority::Mid, b"2");

    let mut extra = h.host.alloc().expect("alloc");
    extra.fill_from(b"3").expect("fill");
    let rejected = h
        .host
        .submit(NET, Priority::Mid, Outbound::Owned(extra))
        .expect_err("lane is full");
    assert_eq!(
        rejected.reason,
        IpcError::QueueFull {
            lane: Priority::Mid,
            capacity: 2
        }
    );
    let extra = rejected.payload.into_handle().expect("payload handed back");
    assert_eq!(extra.as_slice(), b"3");
    assert_eq!(h.host.metrics().rejected, 1);

    h.workers.tx.drain_once();
    h.host
        .submit(NET, Priority::Mid, Outbound::Owned(extra))
        .expect("lane has room again");
    h.workers.tx.drain_once();
    assert_eq!(h.peer_consume(usize::MAX), frames(&["1", "2", "3"]));
}

#[test]
fn address_outside_the_table_is_rejected() {
    let h = Harness::new(IpcConfig::default());
    let rejected = h
        .host
        .submit(9, Priority::High, Outbound::Probe)
        .expect_err("no such slot");
    assert_eq!(
        rejected.reason,
        IpcError::InvalidAddress {
            address: 9,
            slots: 4
        }
    );
    assert!(matches!(rejected.payload, Outbound::Probe));
    assert!(matches!(
        h.host.register(4, Arc::new(Recorder::default())),
        Err(IpcError::InvalidAddress { .. })
    ));
}

#[test]
fn blocking_submit_waits_for_lane_space() {
    let config = IpcConfig {
        lane_capacity: 1,
        submit_policy: SubmitPolicy::Block,
        ..IpcConfig::default()
    };
    let mut h = Harness::new(config);
    h.host
        .submit(NET, Priority::Low, Outbound::Probe)
        .expect("first fits");

    let submitter = h.host.submitter();
    let blocked = thread::spawn(move || submitter.submit(NET, Priority::Low, Outbound::Probe));
    thread::sleep(Duration::from_millis(50));
    assert!(!blocked.is_finished(), "second submit parks on the full lane");

    h.workers.tx.drain_once();
    blocked
        .join()
        .expect("submitter thread")
        .expect("submit after space freed");
    h.workers.tx.drain_once();
    assert_eq!(h.peer_rx.pending(), 2);
}

#[test]
fn close_releases_blocked_submitters() {
    let config = IpcConfig {
        lane_capacity: 1,
        submit_policy: SubmitPolicy::Block,
        ..IpcConfig::default()
    };
    let h = Harness::new(config);
    h.host
        .submit(NET, Priority::Low, Outbound::Probe)
        .expect("first fits");

    let submitter = h.host.submitter();
    let blocked = thread::spawn(move || submitter.submit(NET, Priority::Low, Outbound::Probe));
    thread::sleep(Duration::from_millis(20));
    h.host.close();
    let result = blocked.join().expect("submitter thread");
    assert_eq!(result.map_err(|r| r.reason), Err(IpcError::Closed));
}

#[test]
fn bad_descriptor_is_dropped_and_the_batch_continues() {
    let mut h = Harness::new(IpcConfig::default());

    let mut first = h.peer_pool.acquire().expect("peer buffer");
    first.fill_from(b"first").expect("fill");
    let empty = h.peer_pool.acquire().expect("peer buffer");
    let stale = {
        let gone = h.peer_pool.acquire().expect("peer buffer");
        gone.buffer_ref()
    };
    let mut last = h.peer_pool.acquire().expect("peer buffer");
    last.fill_from(b"last").expect("fill");

    for pointer in [
        first.buffer_ref(),
        empty.buffer_ref(),
        stale,
        last.buffer_ref(),
    ] {
        assert!(h.peer_tx.try_publish(RingEntry {
            address: NET,
            pointer
        }));
    }
    assert!(h.peer_tx.try_publish(RingEntry {
        address: NET,
        pointer: shmem_transport::BufferRef::NULL,
    }));

    let stats = h.workers.rx.dispatch_pending();
    assert_eq!((stats.delivered, stats.probes, stats.dropped), (2, 1, 2));
    let received = h.recorder.received.lock().clone();
    assert_eq!(
        received,
        vec![
            (NET, Some(b"first".to_vec())),
            (NET, Some(b"last".to_vec())),
            (NET, None),
        ]
    );
    assert_eq!(h.peer_tx.in_flight(), 0, "every entry consumed");
    assert_eq!(h.host.metrics().dropped, 2);
}

#[test]
fn unregistered_address_is_consumed_and_counted() {
    let mut h = Harness::new(IpcConfig::default());
    assert!(h.peer_tx.try_publish(RingEntry {
        address: 3,
        pointer: shmem_transport::BufferRef::NULL,
    }));

    let stats = h.workers.rx.dispatch_pending();
    assert_eq!(stats.dropped, 1);
    assert_eq!(h.host.metrics().unknown_address, 1);
    assert_eq!(h.peer_tx.acknowledged(), h.peer_tx.published());
}

#[test]
fn rx_batch_rings_the_ack_doorbell() {
    let mut h = Harness::new(IpcConfig::default());
    assert!(h.peer_tx.try_publish(RingEntry {
        address: NET,
        pointer: shmem_transport::BufferRef::NULL,
    }));
    h.workers.rx.dispatch_pending();
    assert_eq!(h.to_peer.register().raised(), 1);

    h.workers.rx.dispatch_pending();
    assert_eq!(h.to_peer.register().raised(), 1, "empty batch stays quiet");
}

#[test]
fn closure_client_sees_probes() {
    let mut h = Harness::new(IpcConfig::default());
    let probes = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&probes);
    h.host
        .register(
            2,
            Arc::new(FnClient::new(move |_, delivery| {
                if matches!(delivery, Delivery::Probe) {
                    *counter.lock() += 1;
                }
            })),
        )
        .expect("register");

    for _ in 0..3 {
        assert!(h.peer_tx.try_publish(RingEntry {
            address: 2,
            pointer: shmem_transport::BufferRef::NULL,
        }));
    }
    assert_eq!(h.workers.rx.dispatch_pending().probes, 3);
    assert_eq!(*probes.lock(), 3);
}
