//! Worker loops.
//!
//! Each side runs two engines, the transmit pipeline and the receive
//! dispatcher. [`WorkerSet`] gives each its own thread that alternates
//! `poll` and a blocking `wait`; [`WorkerRuntime`] steps them by hand on the
//! caller's thread, which keeps tests deterministic.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use shmem_transport::Wake;

use crate::endpoint::{EndpointWorkers, IpcEndpoint};
use crate::error::{IpcError, IpcResult};

pub trait ServiceEngine: Send {
    /// Does all currently available work; returns how much was done.
    fn poll(&mut self) -> usize;
    fn name(&self) -> &'static str;
    /// Blocks until there may be more work.
    fn wait(&mut self) -> Wake;
    /// Runs once after the engine's signal closes.
    fn finish(&mut self) {}
}

/// Drives an engine until its wake signal closes.
pub fn run_engine(engine: &mut dyn ServiceEngine) {
    tracing::debug!(engine = engine.name(), "worker started");
    loop {
        engine.poll();
        if engine.wait() == Wake::Closed {
            break;
        }
    }
    engine.finish();
    tracing::debug!(engine = engine.name(), "worker stopped");
}

/// Hand-stepped set of engines.
pub struct WorkerRuntime {
    engines: Vec<Box<dyn ServiceEngine>>,
}

impl Default for WorkerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRuntime {
    pub fn new() -> Self {
        Self {
            engines: Vec::new(),
        }
    }

    pub fn register<E>(&mut self, engine: E)
    where
        E: ServiceEngine + 'static,
    {
        self.engines.push(Box::new(engine));
    }

    /// Polls every engine once.
    pub fn run_tick(&mut self) -> usize {
        let mut work = 0;
        for engine in self.engines.iter_mut() {
            work += engine.poll();
        }
        work
    }

    /// Ticks until a tick does no work or `max_ticks` is reached; returns the
    /// total work done.
    pub fn run_until_idle(&mut self, max_ticks: usize) -> usize {
        let mut total = 0;
        for _ in 0..max_ticks {
            let work = self.run_tick();
            if work == 0 {
                break;
            }
            total += work;
        }
        total
    }
}

/// Worker threads of one endpoint. Dropping the set closes the endpoint and
/// joins the threads.
pub struct WorkerSet {
    endpoint: Arc<IpcEndpoint>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerSet {
    pub fn spawn(endpoint: Arc<IpcEndpoint>, workers: EndpointWorkers) -> IpcResult<Self> {
        let EndpointWorkers { tx, rx } = workers;
        let mut set = Self {
            endpoint,
            handles: Vec::with_capacity(2),
        };
        set.spawn_engine(Box::new(tx))?;
        set.spawn_engine(Box::new(rx))?;
        Ok(set)
    }

    fn spawn_engine(&mut self, mut engine: Box<dyn ServiceEngine>) -> IpcResult<()> {
        let handle = thread::Builder::new()
            .name(engine.name().to_string())
            .spawn(move || run_engine(engine.as_mut()))
            .map_err(|err| IpcError::Spawn(err.to_string()))?;
        self.handles.push(handle);
        Ok(())
    }

    pub fn endpoint(&self) -> &Arc<IpcEndpoint> {
        &self.endpoint
    }

    /// Closes the endpoint and waits for both workers to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.endpoint.close();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("ipc worker panicked");
            }
        }
    }
}

impl Drop for WorkerSet {
    fn drop(&mut self) {
        self.stop();
    }
}
