//! One side of the link, bundled as an explicit context object.
//!
//! An [`IpcEndpoint`] owns everything a processor needs to talk over the
//! shared window: its client table, the submit side of the transmit
//! pipeline, its buffer pool, the directory used to resolve incoming
//! pointers and the interrupt line of its incoming doorbell. The two
//! workers that own the rings are returned separately as
//! [`EndpointWorkers`] so the caller decides how to run them.

use std::sync::Arc;

use shmem_transport::{
    BufferHandle, BufferPool, Doorbell, DoorbellLatch, IrqLine, PoolDirectory, ShmemLayout, Side,
    WakeSignal,
};

use crate::config::IpcConfig;
use crate::dispatcher::RxDispatcher;
use crate::error::{IpcError, IpcResult, Rejected};
use crate::lanes::Priority;
use crate::metrics::{IpcMetrics, IpcMetricsSnapshot};
use crate::pipeline::{Outbound, TxQueue, TxSubmitter, TxWorker};
use crate::registry::{ClientRegistry, IpcClient};
use crate::runtime::WorkerRuntime;

/// Doorbells attached to one endpoint.
pub struct EndpointWiring {
    /// Raises the peer's interrupt.
    pub outbound: Arc<dyn Doorbell>,
    /// The register the peer raises to interrupt us.
    pub inbound: Arc<dyn DoorbellLatch>,
}

/// The two ring owners of an endpoint.
pub struct EndpointWorkers {
    pub tx: TxWorker,
    pub rx: RxDispatcher,
}

impl EndpointWorkers {
    /// Collects both workers into a hand-stepped runtime.
    pub fn into_runtime(self) -> WorkerRuntime {
        let mut runtime = WorkerRuntime::new();
        runtime.register(self.tx);
        runtime.register(self.rx);
        runtime
    }
}

pub struct IpcEndpoint {
    side: Side,
    config: IpcConfig,
    registry: Arc<ClientRegistry>,
    submitter: TxSubmitter,
    tx_queue: Arc<TxQueue>,
    pool: Arc<BufferPool>,
    pools: PoolDirectory,
    rx_wake: Arc<WakeSignal>,
    irq: Arc<IrqLine>,
    metrics: Arc<IpcMetrics>,
}

impl std::fmt::Debug for IpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcEndpoint")
            .field("side", &self.side)
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .finish()
    }
}

impl IpcEndpoint {
    /// Builds `side`'s endpoint over `layout`.
    ///
    /// `pool` is where this side allocates outgoing buffers; `pools` must map
    /// every pool whose references may arrive on the inbound ring (it gains
    /// `pool` if missing).
    pub fn new(
        config: &IpcConfig,
        layout: &Arc<ShmemLayout>,
        side: Side,
        pool: Arc<BufferPool>,
        mut pools: PoolDirectory,
        wiring: EndpointWiring,
    ) -> IpcResult<(Arc<Self>, EndpointWorkers)> {
        config.validate()?;
        if layout.capacity() != config.ring_capacity {
            return Err(IpcError::config(format!(
                "layout holds {} entries per ring, configuration expects {}",
                layout.capacity(),
                config.ring_capacity
            )));
        }
        if pools.get(pool.id()).is_none() {
            pools.insert(Arc::clone(&pool))?;
        }

        let (producer, consumer) = layout.claim(side)?;
        let metrics = Arc::new(IpcMetrics::new());
        let registry = Arc::new(ClientRegistry::new(config.client_slots));
        let tx_wake = Arc::new(WakeSignal::new());
        let rx_wake = Arc::new(WakeSignal::new());
        let irq = Arc::new(IrqLine::new(
            wiring.inbound,
            Arc::clone(&rx_wake),
            Some(Arc::clone(&tx_wake)),
        ));

        let tx_queue = TxQueue::new(
            config.lane_capacity,
            config.submit_policy,
            config.client_slots,
            tx_wake,
            Arc::clone(&metrics),
        );
        let tx = TxWorker::new(
            side,
            Arc::clone(&tx_queue),
            producer,
            config.reclaim_capacity(),
            Arc::clone(&registry),
            Arc::clone(&wiring.outbound),
        );
        let rx = RxDispatcher::new(
            side,
            consumer,
            Arc::clone(&registry),
            pools.clone(),
            Arc::clone(&rx_wake),
            config.ack_doorbell.then_some(wiring.outbound),
            Arc::clone(&metrics),
        );

        tracing::debug!(
            side = side.label(),
            ring_capacity = config.ring_capacity,
            lane_capacity = config.lane_capacity,
            "ipc endpoint ready"
        );
        let endpoint = Arc::new(Self {
            side,
            config: config.clone(),
            registry,
            submitter: TxSubmitter::new(Arc::clone(&tx_queue)),
            tx_queue,
            pool,
            pools,
            rx_wake,
            irq,
            metrics,
        });
        Ok((endpoint, EndpointWorkers { tx, rx }))
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn register(&self, address: u32, client: Arc<dyn IpcClient>) -> IpcResult<()> {
        self.registry.register(address, client).map(|_| ())
    }

    pub fn unregister(&self, address: u32) -> IpcResult<Option<Arc<dyn IpcClient>>> {
        self.registry.unregister(address)
    }

    /// Unregisters `client` from `address` unless someone replaced it meanwhile.
    pub fn unregister_client(&self, address: u32, client: &Arc<dyn IpcClient>) -> IpcResult<bool> {
        self.registry.unregister_client(address, client)
    }

    pub fn submit(&self, address: u32, priority: Priority, payload: Outbound) -> Result<(), Rejected> {
        self.submitter.submit(address, priority, payload)
    }

    /// Cloneable submit handle for clients that need to send from callbacks.
    pub fn submitter(&self) -> TxSubmitter {
        self.submitter.clone()
    }

    /// Allocates an outgoing buffer from this side's pool.
    pub fn alloc(&self) -> IpcResult<BufferHandle> {
        Ok(self.pool.acquire()?)
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Every pool whose references this side can resolve.
    pub fn pools(&self) -> &PoolDirectory {
        &self.pools
    }

    /// Interrupt service routine for the incoming doorbell.
    pub fn irq(&self) -> &Arc<IrqLine> {
        &self.irq
    }

    pub fn metrics(&self) -> IpcMetricsSnapshot {
        IpcMetricsSnapshot {
            unknown_address: self.registry.unknown_address_count(),
            ..self.metrics.snapshot()
        }
    }

    /// Stops the workers and fails pending and future submits with `Closed`.
    pub fn close(&self) {
        self.tx_queue.close();
        self.rx_wake.close();
    }
}
