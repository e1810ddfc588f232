//! Receive side: drains the inbound ring and routes each descriptor.

use std::sync::Arc;

use shmem_transport::{Doorbell, PoolDirectory, RingConsumer, RingEntry, Side, Wake, WakeSignal};

use crate::metrics::{IpcEvent, IpcMetrics};
use crate::registry::{ClientRegistry, Delivery};
use crate::runtime::ServiceEngine;

/// Outcome of one [`RxDispatcher::dispatch_pending`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxStats {
    pub delivered: usize,
    pub probes: usize,
    pub dropped: usize,
}

impl RxStats {
    pub fn total(&self) -> usize {
        self.delivered + self.probes + self.dropped
    }
}

/// Sole owner of the inbound ring.
pub struct RxDispatcher {
    side: Side,
    consumer: RingConsumer,
    registry: Arc<ClientRegistry>,
    pools: PoolDirectory,
    wake: Arc<WakeSignal>,
    ack: Option<Arc<dyn Doorbell>>,
    metrics: Arc<IpcMetrics>,
}

impl RxDispatcher {
    pub(crate) fn new(
        side: Side,
        consumer: RingConsumer,
        registry: Arc<ClientRegistry>,
        pools: PoolDirectory,
        wake: Arc<WakeSignal>,
        ack: Option<Arc<dyn Doorbell>>,
        metrics: Arc<IpcMetrics>,
    ) -> Self {
        Self {
            side,
            consumer,
            registry,
            pools,
            wake,
            ack,
            metrics,
        }
    }

    /// Dispatches until the ring is observed empty.
    ///
    /// A malformed descriptor is logged and dropped; the rest of the batch
    /// is still delivered.
    pub fn dispatch_pending(&mut self) -> RxStats {
        let Self {
            side,
            consumer,
            registry,
            pools,
            ack,
            metrics,
            ..
        } = self;

        let mut stats = RxStats::default();
        loop {
            let before = stats.total();
            for entry in consumer.drain() {
                route(*side, registry, pools, entry, &mut stats);
            }
            if stats.total() == before {
                break;
            }
        }

        if stats.total() > 0 {
            metrics.record_n(IpcEvent::Delivered, stats.delivered as u64);
            metrics.record_n(IpcEvent::Probe, stats.probes as u64);
            metrics.record_n(IpcEvent::Dropped, stats.dropped as u64);
            tracing::debug!(
                side = side.label(),
                delivered = stats.delivered,
                probes = stats.probes,
                dropped = stats.dropped,
                "rx batch"
            );
            if let Some(ack) = ack {
                ack.ring();
            }
        }
        stats
    }
}

fn route(
    side: Side,
    registry: &ClientRegistry,
    pools: &PoolDirectory,
    entry: RingEntry,
    stats: &mut RxStats,
) {
    let RingEntry { address, pointer } = entry;
    if pointer.is_null() {
        if registry.dispatch_receive(address, Delivery::Probe) {
            stats.probes += 1;
        } else {
            stats.dropped += 1;
        }
        return;
    }

    match pools.resolve(pointer) {
        Ok(view) if view.is_empty() => {
            tracing::warn!(side = side.label(), address, ?pointer, "dropping zero-length descriptor");
            stats.dropped += 1;
        }
        Ok(view) => {
            if registry.dispatch_receive(address, Delivery::Buffer(view)) {
                stats.delivered += 1;
            } else {
                stats.dropped += 1;
            }
        }
        Err(err) => {
            tracing::warn!(side = side.label(), address, %err, "dropping unresolvable descriptor");
            stats.dropped += 1;
        }
    }
}

impl ServiceEngine for RxDispatcher {
    fn poll(&mut self) -> usize {
        self.dispatch_pending().total()
    }

    fn name(&self) -> &'static str {
        match self.side {
            Side::Device => "ipc-rx-device",
            Side::Host => "ipc-rx-host",
        }
    }

    fn wait(&mut self) -> Wake {
        self.wake.wait()
    }
}
