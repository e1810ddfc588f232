//! Host side: asks the device to run flash operations on its behalf.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use shmem_ipc::{Delivery, IpcClient, IpcEndpoint, Outbound, Priority, Rejected};
use shmem_transport::{spin_until, BufferRef, SpinBudget, SpinStep};

use crate::block::{FlashCode, FlashCommandBlock, HandshakeState, FLASH_DATA_WINDOW};
use crate::error::{FlashError, FlashResult};
use crate::FLASH_ADDRESS;

/// Receives the command block the device hands out.
#[derive(Default)]
struct BlockSlot {
    block: Mutex<Option<BufferRef>>,
    arrived: Condvar,
}

impl IpcClient for BlockSlot {
    fn on_receive(&self, _address: u32, delivery: Delivery<'_>) {
        match delivery {
            Delivery::Buffer(view) => {
                *self.block.lock() = Some(view.buffer_ref());
                self.arrived.notify_all();
            }
            Delivery::Probe => tracing::debug!("ignoring probe on the flash tunnel"),
        }
    }
}

/// Tunnel client bound to one endpoint.
///
/// Operations are serialized; the command block carries one at a time.
pub struct FlashTunnelClient {
    endpoint: Arc<IpcEndpoint>,
    slot: Arc<BlockSlot>,
    budget: SpinBudget,
    exchange: Mutex<()>,
}

impl std::fmt::Debug for FlashTunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashTunnelClient")
            .field("block", &*self.slot.block.lock())
            .finish()
    }
}

impl FlashTunnelClient {
    /// Registers at [`FLASH_ADDRESS`], probes the device and waits up to
    /// `timeout` for the command block.
    pub fn connect(endpoint: Arc<IpcEndpoint>, timeout: Duration) -> FlashResult<Self> {
        let slot = Arc::new(BlockSlot::default());
        endpoint.register(FLASH_ADDRESS, slot.clone())?;
        endpoint
            .submit(FLASH_ADDRESS, Priority::High, Outbound::Probe)
            .map_err(Rejected::into_reason)?;

        let deadline = Instant::now() + timeout;
        {
            let mut block = slot.block.lock();
            while block.is_none() {
                if slot.arrived.wait_until(&mut block, deadline).timed_out() {
                    break;
                }
            }
            if block.is_none() {
                drop(block);
                let client: Arc<dyn IpcClient> = slot.clone();
                endpoint.unregister_client(FLASH_ADDRESS, &client)?;
                return Err(FlashError::ConnectTimeout(timeout));
            }
        }
        tracing::debug!("flash tunnel connected");

        let budget = endpoint.config().handshake.budget();
        Ok(Self {
            endpoint,
            slot,
            budget,
            exchange: Mutex::new(()),
        })
    }

    /// Erases `size` bytes at `addr`.
    pub fn erase(&self, addr: u32, size: u32) -> FlashResult<()> {
        self.execute(FlashCode::Erase, addr, size, |_| {}, |_| {})
    }

    /// Reads `out.len()` bytes starting at `addr`, one window at a time.
    pub fn read(&self, addr: u32, out: &mut [u8]) -> FlashResult<()> {
        let mut offset = 0;
        for chunk in out.chunks_mut(FLASH_DATA_WINDOW) {
            let len = chunk.len() as u32;
            self.execute(
                FlashCode::Read,
                addr + offset,
                len,
                |_| {},
                |block| block.read_data(chunk),
            )?;
            offset += len;
        }
        Ok(())
    }

    /// Writes `data` starting at `addr`, one window at a time.
    pub fn write(&self, addr: u32, data: &[u8]) -> FlashResult<()> {
        let mut offset = 0;
        for chunk in data.chunks(FLASH_DATA_WINDOW) {
            let len = chunk.len() as u32;
            self.execute(
                FlashCode::Write,
                addr + offset,
                len,
                |block| block.write_data(chunk),
                |_| {},
            )?;
            offset += len;
        }
        Ok(())
    }

    fn execute(
        &self,
        code: FlashCode,
        addr: u32,
        size: u32,
        prepare: impl FnOnce(&FlashCommandBlock),
        collect: impl FnOnce(&FlashCommandBlock),
    ) -> FlashResult<()> {
        let _turn = self.exchange.lock();
        let buffer = (*self.slot.block.lock()).ok_or(FlashError::NotConnected)?;
        let view = self.endpoint.pools().resolve(buffer)?;
        let block = view.block::<FlashCommandBlock>()?;

        block.code.store(code as u32, Ordering::Relaxed);
        block.addr.store(addr, Ordering::Relaxed);
        block.size.store(size, Ordering::Relaxed);
        prepare(block);
        block.set_remote(HandshakeState::Idle);
        self.endpoint
            .submit(FLASH_ADDRESS, Priority::High, Outbound::Peer(buffer))
            .map_err(Rejected::into_reason)?;

        let outcome = self.handshake(block);
        block.set_remote(HandshakeState::Idle);
        outcome?;

        if block.result.load(Ordering::Acquire) != 0 {
            return Err(FlashError::DeviceFailed { code, addr });
        }
        collect(block);
        tracing::trace!(?code, addr, size, "flash command complete");
        Ok(())
    }

    fn handshake(&self, block: &FlashCommandBlock) -> FlashResult<()> {
        spin_until(&self.budget, || match HandshakeState::from_u32(block.local()) {
            Some(HandshakeState::Ready) => SpinStep::Done(()),
            Some(_) => SpinStep::Continue,
            None => SpinStep::Abort(block.local()),
        })
        .map_err(|err| FlashError::from_spin(err, HandshakeState::Ready.label()))?;

        block.set_remote(HandshakeState::Ready);

        spin_until(&self.budget, || match HandshakeState::from_u32(block.local()) {
            Some(HandshakeState::Done) => SpinStep::Done(()),
            Some(HandshakeState::Ready) => SpinStep::Continue,
            _ => SpinStep::Abort(block.local()),
        })
        .map_err(|err| FlashError::from_spin(err, HandshakeState::Done.label()))
    }
}

impl Drop for FlashTunnelClient {
    fn drop(&mut self) {
        let client: Arc<dyn IpcClient> = self.slot.clone();
        if let Err(err) = self.endpoint.unregister_client(FLASH_ADDRESS, &client) {
            tracing::debug!(%err, "flash tunnel already gone");
        }
    }
}
