#![deny(missing_docs)]
//! In-process link harness shared by integration tests, demos and the CLI.
//!
//! Both processors live in one address space: a single [`ShmemLayout`] holds
//! the two rings, each side gets its own buffer pool, and each direction's
//! doorbell is an atomic register whose "interrupt" is delivered straight
//! into the peer's [`IrqLine`](shmem_transport::IrqLine).

use std::sync::Arc;

use shmem_ipc::{
    EndpointWiring, EndpointWorkers, IpcConfig, IpcEndpoint, IpcResult, ServiceEngine, WorkerRuntime,
    WorkerSet,
};
use shmem_transport::{
    BufferPool, DoorbellRegister, LoopbackDoorbell, PoolDirectory, ShmemLayout, Side,
};

/// Pool id stamped into host-owned buffer references.
pub const HOST_POOL_ID: u8 = 1;
/// Pool id stamped into device-owned buffer references.
pub const DEVICE_POOL_ID: u8 = 2;

/// Both endpoints of a loopback link, with their workers not yet running.
pub struct LoopbackLink {
    layout: Arc<ShmemLayout>,
    host: Arc<IpcEndpoint>,
    device: Arc<IpcEndpoint>,
    host_workers: EndpointWorkers,
    device_workers: EndpointWorkers,
}

impl LoopbackLink {
    /// Builds a link where both sides use `config`.
    pub fn new(config: &IpcConfig) -> IpcResult<Self> {
        Self::with_cursor(config, 0)
    }

    /// Builds a link whose ring cursors start at `start`.
    pub fn with_cursor(config: &IpcConfig, start: u32) -> IpcResult<Self> {
        config.validate()?;
        let layout = ShmemLayout::new_with_cursor(config.ring_capacity, start)?;

        let host_pool = BufferPool::new(config.pool_config(HOST_POOL_ID))?;
        let device_pool = BufferPool::new(config.pool_config(DEVICE_POOL_ID))?;
        let mut pools = PoolDirectory::new();
        pools.insert(Arc::clone(&host_pool))?;
        pools.insert(Arc::clone(&device_pool))?;

        let to_device = Arc::new(LoopbackDoorbell::new(Arc::new(DoorbellRegister::new())));
        let to_host = Arc::new(LoopbackDoorbell::new(Arc::new(DoorbellRegister::new())));

        let (host, host_workers) = IpcEndpoint::new(
            config,
            &layout,
            Side::Host,
            host_pool,
            pools.clone(),
            EndpointWiring {
                outbound: to_device.clone(),
                inbound: to_host.register().clone(),
            },
        )?;
        let (device, device_workers) = IpcEndpoint::new(
            config,
            &layout,
            Side::Device,
            device_pool,
            pools,
            EndpointWiring {
                outbound: to_host.clone(),
                inbound: to_device.register().clone(),
            },
        )?;
        to_device.connect(Arc::clone(device.irq()));
        to_host.connect(Arc::clone(host.irq()));

        tracing::debug!(
            ring_capacity = config.ring_capacity,
            start,
            "loopback link assembled"
        );
        Ok(Self {
            layout,
            host,
            device,
            host_workers,
            device_workers,
        })
    }

    /// The shared window.
    pub fn layout(&self) -> &Arc<ShmemLayout> {
        &self.layout
    }

    /// Host-side endpoint.
    pub fn host(&self) -> &Arc<IpcEndpoint> {
        &self.host
    }

    /// Device-side endpoint.
    pub fn device(&self) -> &Arc<IpcEndpoint> {
        &self.device
    }

    /// Spawns the four worker threads.
    pub fn start(self) -> IpcResult<RunningLink> {
        let host = WorkerSet::spawn(self.host, self.host_workers)?;
        let device = WorkerSet::spawn(self.device, self.device_workers)?;
        Ok(RunningLink { host, device })
    }

    /// Keeps the workers on the caller's thread for deterministic stepping.
    pub fn into_stepped(self) -> SteppedLink {
        SteppedLink {
            host: self.host,
            device: self.device,
            host_workers: self.host_workers,
            device_workers: self.device_workers,
        }
    }
}

/// A link whose workers run on background threads.
pub struct RunningLink {
    host: WorkerSet,
    device: WorkerSet,
}

impl RunningLink {
    /// Host-side endpoint.
    pub fn host(&self) -> &Arc<IpcEndpoint> {
        self.host.endpoint()
    }

    /// Device-side endpoint.
    pub fn device(&self) -> &Arc<IpcEndpoint> {
        self.device.endpoint()
    }

    /// Closes both endpoints and joins every worker.
    pub fn shutdown(self) {
        let RunningLink { host, device } = self;
        host.shutdown();
        device.shutdown();
    }
}

/// A link whose workers are stepped by hand.
pub struct SteppedLink {
    /// Host-side endpoint.
    pub host: Arc<IpcEndpoint>,
    /// Device-side endpoint.
    pub device: Arc<IpcEndpoint>,
    /// Host ring owners.
    pub host_workers: EndpointWorkers,
    /// Device ring owners.
    pub device_workers: EndpointWorkers,
}

impl SteppedLink {
    /// Polls all four workers until a full round does no work; returns the
    /// total work done.
    pub fn run_until_idle(&mut self) -> usize {
        let mut total = 0;
        loop {
            let work = self.host_workers.tx.poll()
                + self.device_workers.rx.poll()
                + self.device_workers.tx.poll()
                + self.host_workers.rx.poll();
            if work == 0 {
                return total;
            }
            total += work;
        }
    }

    /// Moves the workers into a hand-stepped runtime per side.
    pub fn into_runtimes(self) -> (WorkerRuntime, WorkerRuntime) {
        (
            self.host_workers.into_runtime(),
            self.device_workers.into_runtime(),
        )
    }
}
