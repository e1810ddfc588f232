//! Priority transmit pipeline with deferred reclaim.
//!
//! Any thread may [`TxSubmitter::submit`] a descriptor onto one of three
//! bounded lanes. A single [`TxWorker`] owns the outbound ring: each pass it
//! first returns every payload the peer has finished with, then moves lane
//! heads (highest lane first) into the ring until the ring is full or the
//! lanes are empty, and finally rings the peer's doorbell once if anything
//! was published. Published payloads wait in the reclaim queue, in publish
//! order, until the peer's read cursor moves past them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use shmem_transport::{
    seq_delta, BufferHandle, BufferRef, Doorbell, RingEntry, RingProducer, Side, Wake, WakeSignal,
};

use crate::error::{IpcError, Rejected};
use crate::lanes::{Priority, PriorityLanes};
use crate::metrics::{IpcEvent, IpcMetrics};
use crate::registry::ClientRegistry;
use crate::runtime::ServiceEngine;

/// Payload of one descriptor.
#[derive(Debug)]
pub enum Outbound {
    /// Null pointer; the address alone is the message.
    Probe,
    /// A buffer we own. It comes back through `on_transmit_done`.
    Owned(BufferHandle),
    /// A buffer the peer owns, re-sent to hand control back for another exchange.
    Peer(BufferRef),
}

impl Outbound {
    /// Pointer published in the ring slot.
    pub fn pointer(&self) -> BufferRef {
        match self {
            Outbound::Probe => BufferRef::NULL,
            Outbound::Owned(handle) => handle.buffer_ref(),
            Outbound::Peer(buffer) => *buffer,
        }
    }

    pub fn into_handle(self) -> Option<BufferHandle> {
        match self {
            Outbound::Owned(handle) => Some(handle),
            _ => None,
        }
    }
}

/// What `submit` does when the target lane is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitPolicy {
    /// Fail with `QueueFull` and hand the payload back.
    #[default]
    Reject,
    /// Park the caller until the worker frees a lane slot or the endpoint closes.
    Block,
}

struct Pending {
    address: u32,
    priority: Priority,
    payload: Outbound,
}

pub(crate) struct TxQueue {
    lanes: Mutex<PriorityLanes<Pending>>,
    space: Condvar,
    wake: Arc<WakeSignal>,
    policy: SubmitPolicy,
    closed: AtomicBool,
    client_slots: usize,
    metrics: Arc<IpcMetrics>,
}

impl TxQueue {
    pub(crate) fn new(
        lane_capacity: usize,
        policy: SubmitPolicy,
        client_slots: usize,
        wake: Arc<WakeSignal>,
        metrics: Arc<IpcMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            lanes: Mutex::new(PriorityLanes::new(lane_capacity)),
            space: Condvar::new(),
            wake,
            policy,
            closed: AtomicBool::new(false),
            client_slots,
            metrics,
        })
    }

    pub(crate) fn close(&self) {
        // Flip the flag under the lane lock so a blocked submitter cannot miss it.
        let lanes = self.lanes.lock();
        self.closed.store(true, Ordering::Release);
        drop(lanes);
        self.space.notify_all();
        self.wake.close();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Cloneable submit side of the pipeline.
#[derive(Clone)]
pub struct TxSubmitter {
    queue: Arc<TxQueue>,
}

impl fmt::Debug for TxSubmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxSubmitter")
            .field("policy", &self.queue.policy)
            .field("queued", &self.queued())
            .finish()
    }
}

impl TxSubmitter {
    pub(crate) fn new(queue: Arc<TxQueue>) -> Self {
        Self { queue }
    }

    /// Queues `payload` for `address` on `priority`'s lane and wakes the worker.
    pub fn submit(&self, address: u32, priority: Priority, payload: Outbound) -> Result<(), Rejected> {
        let queue = &*self.queue;
        if address as usize >= queue.client_slots {
            queue.metrics.record(IpcEvent::Rejected);
            return Err(Rejected {
                reason: IpcError::InvalidAddress {
                    address,
                    slots: queue.client_slots,
                },
                payload,
            });
        }

        let mut item = Pending {
            address,
            priority,
            payload,
        };
        let mut lanes = queue.lanes.lock();
        loop {
            if queue.is_closed() {
                return Err(Rejected {
                    reason: IpcError::Closed,
                    payload: item.payload,
                });
            }
            match lanes.try_push(priority, item) {
                Ok(()) => break,
                Err(back) => {
                    item = back;
                    match queue.policy {
                        SubmitPolicy::Reject => {
                            queue.metrics.record(IpcEvent::Rejected);
                            tracing::debug!(address, ?priority, "lane full, rejecting submit");
                            return Err(Rejected {
                                reason: IpcError::QueueFull {
                                    lane: priority,
                                    capacity: lanes.capacity(),
                                },
                                payload: item.payload,
                            });
                        }
                        SubmitPolicy::Block => queue.space.wait(&mut lanes),
                    }
                }
            }
        }
        drop(lanes);

        queue.metrics.record(IpcEvent::Submitted);
        queue.wake.notify();
        Ok(())
    }

    /// Descriptors waiting per lane, ordered as [High, Mid, Low].
    pub fn queued(&self) -> [usize; 3] {
        self.queue.lanes.lock().len_per_lane()
    }

    pub fn policy(&self) -> SubmitPolicy {
        self.queue.policy
    }
}

/// Outcome of one [`TxWorker::drain_once`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub reclaimed: usize,
    pub published: usize,
    pub doorbell_rung: bool,
}

/// Sole owner of the outbound ring.
pub struct TxWorker {
    side: Side,
    queue: Arc<TxQueue>,
    producer: RingProducer,
    reclaim: VecDeque<Pending>,
    reclaim_capacity: usize,
    /// Sequence of the oldest descriptor still in `reclaim`.
    postprocessed: u32,
    registry: Arc<ClientRegistry>,
    doorbell: Arc<dyn Doorbell>,
}

impl TxWorker {
    pub(crate) fn new(
        side: Side,
        queue: Arc<TxQueue>,
        producer: RingProducer,
        reclaim_capacity: usize,
        registry: Arc<ClientRegistry>,
        doorbell: Arc<dyn Doorbell>,
    ) -> Self {
        let postprocessed = producer.published();
        Self {
            side,
            queue,
            reclaim: VecDeque::with_capacity(reclaim_capacity),
            reclaim_capacity,
            postprocessed,
            producer,
            registry,
            doorbell,
        }
    }

    /// Published descriptors the peer has not consumed yet.
    pub fn in_flight(&self) -> usize {
        self.reclaim.len()
    }

    /// One pass of the drain loop.
    pub fn drain_once(&mut self) -> DrainStats {
        let mut stats = DrainStats::default();
        loop {
            stats.reclaimed += self.reclaim_consumed();

            if self.producer.is_full() || self.reclaim.len() >= self.reclaim_capacity {
                break;
            }

            let next = {
                let mut lanes = self.queue.lanes.lock();
                lanes.pop_next()
            };
            let Some((_, pending)) = next else {
                break;
            };
            self.queue.space.notify_all();

            let entry = RingEntry {
                address: pending.address,
                pointer: pending.payload.pointer(),
            };
            if !self.producer.try_publish(entry) {
                tracing::error!(side = self.side.label(), "ring refused entry after space check");
                self.queue.lanes.lock().push_front(pending.priority, pending);
                break;
            }
            if let Outbound::Owned(handle) = &pending.payload {
                handle.mark_in_flight();
            }
            self.reclaim.push_back(pending);
            stats.published += 1;
        }

        if stats.published > 0 {
            self.doorbell.ring();
            stats.doorbell_rung = true;
            self.queue
                .metrics
                .record_n(IpcEvent::Published, stats.published as u64);
            self.queue.metrics.record(IpcEvent::Doorbell);
        }
        if stats.reclaimed > 0 {
            self.queue
                .metrics
                .record_n(IpcEvent::Reclaimed, stats.reclaimed as u64);
        }
        if stats != DrainStats::default() {
            tracing::debug!(
                side = self.side.label(),
                published = stats.published,
                reclaimed = stats.reclaimed,
                in_flight = self.reclaim.len(),
                "tx drain pass"
            );
        }
        stats
    }

    /// Hands back every payload the peer's read cursor has passed.
    fn reclaim_consumed(&mut self) -> usize {
        let acknowledged = self.producer.acknowledged();
        let mut reclaimed = 0;
        while seq_delta(acknowledged, self.postprocessed) > 0 {
            let Some(done) = self.reclaim.pop_front() else {
                tracing::error!(
                    side = self.side.label(),
                    acknowledged,
                    postprocessed = self.postprocessed,
                    "peer acknowledged more than was published"
                );
                self.postprocessed = acknowledged;
                break;
            };
            self.postprocessed = self.postprocessed.wrapping_add(1);
            if let Outbound::Owned(handle) = &done.payload {
                handle.mark_returned();
            }
            self.registry
                .dispatch_transmit_done(done.address, done.payload);
            reclaimed += 1;
        }
        reclaimed
    }

    fn release_all(&mut self) {
        let queued = self.queue.lanes.lock().drain_all();
        if !queued.is_empty() || !self.reclaim.is_empty() {
            tracing::debug!(
                side = self.side.label(),
                queued = queued.len(),
                in_flight = self.reclaim.len(),
                "releasing undelivered descriptors on shutdown"
            );
        }
        drop(queued);
        self.reclaim.clear();
    }
}

impl ServiceEngine for TxWorker {
    fn poll(&mut self) -> usize {
        let stats = self.drain_once();
        stats.published + stats.reclaimed
    }

    fn name(&self) -> &'static str {
        match self.side {
            Side::Device => "ipc-tx-device",
            Side::Host => "ipc-tx-host",
        }
    }

    fn wait(&mut self) -> Wake {
        self.queue.wake.wait()
    }

    fn finish(&mut self) {
        self.release_all();
    }
}
