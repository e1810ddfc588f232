//! Address-indexed table of logical channels.
//!
//! Every descriptor carries a client address. The registry maps it to the
//! client that owns the channel and invokes that client's callbacks. Lookups
//! clone the client out under a read lock, so callbacks always run with no
//! lock held and may themselves submit or (un)register.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use shmem_transport::BufferView;

use crate::error::{IpcError, IpcResult};
use crate::pipeline::Outbound;

/// What arrived for a client.
#[derive(Debug)]
pub enum Delivery<'a> {
    /// A descriptor with a null pointer: a bare signal.
    Probe,
    /// A resolved, non-empty buffer. Valid only for the duration of the callback.
    Buffer(BufferView<'a>),
}

/// A logical channel multiplexed over the link.
pub trait IpcClient: Send + Sync {
    /// Called on the receive worker for every descriptor addressed to us.
    fn on_receive(&self, address: u32, delivery: Delivery<'_>);

    /// Called on the transmit worker once the peer has consumed a descriptor
    /// we submitted. The payload is handed back; dropping it frees the buffer.
    fn on_transmit_done(&self, address: u32, payload: Outbound) {
        let _ = address;
        drop(payload);
    }
}

type TransmitDoneFn = Box<dyn Fn(u32, Outbound) + Send + Sync>;

/// Closure-backed [`IpcClient`].
pub struct FnClient<R> {
    receive: R,
    transmit_done: Option<TransmitDoneFn>,
}

impl<R> FnClient<R>
where
    R: Fn(u32, Delivery<'_>) + Send + Sync,
{
    pub fn new(receive: R) -> Self {
        Self {
            receive,
            transmit_done: None,
        }
    }

    pub fn on_transmit_done(mut self, f: impl Fn(u32, Outbound) + Send + Sync + 'static) -> Self {
        self.transmit_done = Some(Box::new(f));
        self
    }
}

impl<R> IpcClient for FnClient<R>
where
    R: Fn(u32, Delivery<'_>) + Send + Sync,
{
    fn on_receive(&self, address: u32, delivery: Delivery<'_>) {
        (self.receive)(address, delivery)
    }

    fn on_transmit_done(&self, address: u32, payload: Outbound) {
        if let Some(f) = &self.transmit_done {
            f(address, payload);
        }
    }
}

pub struct ClientRegistry {
    slots: RwLock<Vec<Option<Arc<dyn IpcClient>>>>,
    unknown: AtomicU64,
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<usize> = self
            .slots
            .read()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect();
        f.debug_struct("ClientRegistry")
            .field("registered", &registered)
            .field("unknown", &self.unknown_address_count())
            .finish()
    }
}

impl ClientRegistry {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: RwLock::new((0..slot_count).map(|_| None).collect()),
            unknown: AtomicU64::new(0),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.read().len()
    }

    pub fn check_address(&self, address: u32) -> IpcResult<()> {
        let slots = self.slot_count();
        if (address as usize) < slots {
            Ok(())
        } else {
            Err(IpcError::InvalidAddress { address, slots })
        }
    }

    /// Installs `client` at `address`, returning whatever was there before.
    pub fn register(
        &self,
        address: u32,
        client: Arc<dyn IpcClient>,
    ) -> IpcResult<Option<Arc<dyn IpcClient>>> {
        self.check_address(address)?;
        let previous = self.slots.write()[address as usize].replace(client);
        if previous.is_some() {
            tracing::debug!(address, "replaced registered client");
        }
        Ok(previous)
    }

    pub fn unregister(&self, address: u32) -> IpcResult<Option<Arc<dyn IpcClient>>> {
        self.check_address(address)?;
        Ok(self.slots.write()[address as usize].take())
    }

    /// Clears `address` only if `client` is still the one registered there.
    pub fn unregister_client(&self, address: u32, client: &Arc<dyn IpcClient>) -> IpcResult<bool> {
        self.check_address(address)?;
        let mut slots = self.slots.write();
        let slot = &mut slots[address as usize];
        let matches = slot
            .as_ref()
            .is_some_and(|current| same_client(current, client));
        if matches {
            slot.take();
        }
        Ok(matches)
    }

    pub fn lookup(&self, address: u32) -> Option<Arc<dyn IpcClient>> {
        self.slots.read().get(address as usize)?.clone()
    }

    /// Routes a delivery; returns `false` (after logging) if nobody listens.
    pub fn dispatch_receive(&self, address: u32, delivery: Delivery<'_>) -> bool {
        match self.lookup(address) {
            Some(client) => {
                client.on_receive(address, delivery);
                true
            }
            None => {
                self.unknown.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(address, ?delivery, "no client registered, dropping delivery");
                false
            }
        }
    }

    /// Returns a reclaimed payload to its submitter. Unclaimed payloads are dropped.
    pub fn dispatch_transmit_done(&self, address: u32, payload: Outbound) -> bool {
        match self.lookup(address) {
            Some(client) => {
                client.on_transmit_done(address, payload);
                true
            }
            None => {
                self.unknown.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(address, ?payload, "no client registered, releasing payload");
                false
            }
        }
    }

    /// Deliveries and completions that found no client.
    pub fn unknown_address_count(&self) -> u64 {
        self.unknown.load(Ordering::Relaxed)
    }
}

fn same_client(a: &Arc<dyn IpcClient>, b: &Arc<dyn IpcClient>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
