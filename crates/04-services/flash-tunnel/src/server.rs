//! Device side: owns the flash controller and answers tunnel commands.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use shmem_ipc::{Delivery, IpcClient, IpcEndpoint, IpcResult, Outbound, Priority, TxSubmitter};
use shmem_transport::{spin_until, BufferHandle, BufferPool, BufferView, SpinBudget, SpinStep};

use crate::backend::FlashBackend;
use crate::block::{FlashCode, FlashCommandBlock, HandshakeState, FLASH_DATA_WINDOW};
use crate::error::FlashError;
use crate::FLASH_ADDRESS;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Command blocks handed out in answer to a probe.
    pub blocks_issued: u64,
    /// Operations run against the backend.
    pub executed: u64,
    /// Operations that reported failure.
    pub failed: u64,
    /// Commands abandoned because the host never became ready.
    pub abandoned: u64,
}

pub struct FlashTunnelServer {
    submitter: TxSubmitter,
    pool: Arc<BufferPool>,
    backend: Arc<dyn FlashBackend>,
    budget: SpinBudget,
    /// The block after its first trip; kept so the slot stays allocated.
    block: Mutex<Option<BufferHandle>>,
    issued: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
}

impl std::fmt::Debug for FlashTunnelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashTunnelServer")
            .field("stats", &self.stats())
            .finish()
    }
}

impl FlashTunnelServer {
    /// Registers a server on `endpoint` at [`FLASH_ADDRESS`].
    pub fn attach(
        endpoint: &Arc<IpcEndpoint>,
        backend: Arc<dyn FlashBackend>,
    ) -> IpcResult<Arc<Self>> {
        let server = Arc::new(Self {
            submitter: endpoint.submitter(),
            pool: Arc::clone(endpoint.pool()),
            backend,
            budget: endpoint.config().handshake.budget(),
            block: Mutex::new(None),
            issued: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        });
        endpoint.register(FLASH_ADDRESS, server.clone())?;
        Ok(server)
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            blocks_issued: self.issued.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Answers a probe with a fresh command block.
    fn issue_block(&self) {
        let mut handle = match self.pool.acquire() {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(%err, "no buffer for a flash command block");
                return;
            }
        };
        match handle.block::<FlashCommandBlock>() {
            Ok(block) => block.reset(),
            Err(err) => {
                tracing::error!(%err, "flash command block does not fit a pool slot");
                return;
            }
        }
        if let Err(err) = handle.set_len(std::mem::size_of::<FlashCommandBlock>()) {
            tracing::error!(%err, "flash command block does not fit a pool slot");
            return;
        }

        match self
            .submitter
            .submit(FLASH_ADDRESS, Priority::High, Outbound::Owned(handle))
        {
            Ok(()) => {
                self.issued.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("flash command block issued");
            }
            Err(rejected) => {
                tracing::error!(reason = %rejected.reason, "failed to issue flash command block")
            }
        }
    }

    /// Runs one command negotiated through `block`.
    fn serve(&self, block: &FlashCommandBlock) {
        block.set_local(HandshakeState::Ready);

        let awaited = spin_until(&self.budget, || {
            let raw = block.remote();
            match HandshakeState::from_u32(raw) {
                Some(HandshakeState::Ready) => SpinStep::Done(()),
                Some(HandshakeState::Idle) => SpinStep::Continue,
                _ => SpinStep::Abort(raw),
            }
        });
        if let Err(err) = awaited {
            let err = FlashError::from_spin(err, HandshakeState::Ready.label());
            self.abandoned.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%err, "host never became ready, command not executed");
            block.set_local(HandshakeState::Idle);
            return;
        }

        let code = block.code.load(Ordering::Acquire);
        let addr = block.addr.load(Ordering::Acquire);
        let size = block.size.load(Ordering::Acquire);
        let outcome = self.execute(block, code, addr, size);
        self.executed.fetch_add(1, Ordering::Relaxed);
        let result = match outcome {
            Ok(()) => 0,
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(code, addr, size, %err, "flash command failed");
                1
            }
        };
        block.result.store(result, Ordering::Release);
        block.set_local(HandshakeState::Done);
        tracing::trace!(code, addr, size, result, "flash command done");
    }

    fn execute(
        &self,
        block: &FlashCommandBlock,
        code: u32,
        addr: u32,
        size: u32,
    ) -> Result<(), FlashError> {
        let code = FlashCode::from_u32(code).ok_or(FlashError::UnexpectedState {
            awaited: "a flash command code",
            value: code,
        })?;
        let len = size as usize;
        if code != FlashCode::Erase && len > FLASH_DATA_WINDOW {
            return Err(FlashError::WindowExceeded {
                len,
                window: FLASH_DATA_WINDOW,
            });
        }
        match code {
            FlashCode::Erase => self.backend.erase(addr, size),
            FlashCode::Read => block.with_data_mut(len, |out| self.backend.read(addr, out)),
            FlashCode::Write => block.with_data_mut(len, |data| self.backend.write(addr, data)),
        }
    }
}

impl IpcClient for FlashTunnelServer {
    fn on_receive(&self, _address: u32, delivery: Delivery<'_>) {
        match delivery {
            Delivery::Probe => self.issue_block(),
            Delivery::Buffer(view) => self.serve_view(view),
        }
    }

    fn on_transmit_done(&self, _address: u32, payload: Outbound) {
        if let Some(handle) = payload.into_handle() {
            if let Some(previous) = self.block.lock().replace(handle) {
                tracing::debug!(buffer = ?previous.buffer_ref(), "replacing earlier flash command block");
            }
        }
    }
}

impl FlashTunnelServer {
    fn serve_view(&self, view: BufferView<'_>) {
        match view.block::<FlashCommandBlock>() {
            Ok(block) => self.serve(block),
            Err(err) => tracing::warn!(%err, "flash delivery is not a command block"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemFlash;
    use runtime_native::LoopbackLink;
    use shmem_ipc::{HandshakeConfig, IpcConfig};
    use std::thread;
    use std::time::Duration;

    fn config(timeout_ms: u64) -> IpcConfig {
        IpcConfig {
            handshake: HandshakeConfig {
                timeout_ms,
                ..HandshakeConfig::default()
            },
            ..IpcConfig::default()
        }
    }

    fn block_pool() -> (Arc<BufferPool>, BufferHandle) {
        let pool = BufferPool::new(config(10).pool_config(3)).unwrap();
        let handle = pool.acquire().unwrap();
        handle.block::<FlashCommandBlock>().unwrap().reset();
        (pool, handle)
    }

    fn server(timeout_ms: u64, flash: Arc<MemFlash>) -> (LoopbackLink, Arc<FlashTunnelServer>) {
        let link = LoopbackLink::new(&config(timeout_ms)).unwrap();
        let server = FlashTunnelServer::attach(link.device(), flash).unwrap();
        (link, server)
    }

    #[test]
    fn host_that_never_gets_ready_blocks_the_operation() {
        let flash = Arc::new(MemFlash::new(64));
        let (_link, server) = server(20, Arc::clone(&flash));
        let (_pool, handle) = block_pool();
        let block = handle.block::<FlashCommandBlock>().unwrap();
        block.code.store(FlashCode::Erase as u32, Ordering::Relaxed);
        block.addr.store(0, Ordering::Relaxed);
        block.size.store(4, Ordering::Relaxed);
        flash.write(0, &[1, 2, 3, 4]).unwrap();

        server.serve(block);

        assert_eq!(block.local(), HandshakeState::Idle as u32);
        assert_eq!(flash.snapshot()[..4], [1, 2, 3, 4]);
        assert_eq!(server.stats().abandoned, 1);
        assert_eq!(server.stats().executed, 0);
    }

    #[test]
    fn garbage_remote_state_aborts_without_executing() {
        let flash = Arc::new(MemFlash::new(64));
        let (_link, server) = server(1000, Arc::clone(&flash));
        let (_pool, handle) = block_pool();
        let block = handle.block::<FlashCommandBlock>().unwrap();
        block.remote_state.store(9, Ordering::Release);

        server.serve(block);

        assert_eq!(block.local(), HandshakeState::Idle as u32);
        assert_eq!(server.stats().abandoned, 1);
    }

    #[test]
    fn ready_host_gets_the_operation_done_exactly_once() {
        let flash = Arc::new(MemFlash::new(64));
        let (_link, server) = server(1000, Arc::clone(&flash));
        let (_pool, handle) = block_pool();
        let block = handle.block::<FlashCommandBlock>().unwrap();
        block.code.store(FlashCode::Write as u32, Ordering::Relaxed);
        block.addr.store(16, Ordering::Relaxed);
        block.size.store(3, Ordering::Relaxed);
        block.write_data(&[7, 8, 9]);

        thread::scope(|scope| {
            scope.spawn(|| server.serve(block));
            while block.local() != HandshakeState::Ready as u32 {
                thread::sleep(Duration::from_millis(1));
            }
            block.set_remote(HandshakeState::Ready);
        });

        assert_eq!(block.local(), HandshakeState::Done as u32);
        assert_eq!(block.result.load(Ordering::Acquire), 0);
        assert_eq!(flash.snapshot()[16..19], [7, 8, 9]);
        assert_eq!(server.stats().executed, 1);
    }

    #[test]
    fn unknown_command_code_reports_failure() {
        let flash = Arc::new(MemFlash::new(64));
        let (_link, server) = server(1000, flash);
        let (_pool, handle) = block_pool();
        let block = handle.block::<FlashCommandBlock>().unwrap();
        block.code.store(42, Ordering::Relaxed);
        block.set_remote(HandshakeState::Ready);

        server.serve(block);

        assert_eq!(block.local(), HandshakeState::Done as u32);
        assert_eq!(block.result.load(Ordering::Acquire), 1);
        assert_eq!(server.stats().failed, 1);
    }
}
