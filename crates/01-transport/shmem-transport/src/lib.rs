//! Shared-memory primitives for the inter-processor link.
//!
//! * [`SharedRegion`] – contiguous, aligned memory visible to both processors.
//! * [`ShmemLayout`] – the formatted window holding the two descriptor rings.
//! * [`RingProducer`] / [`RingConsumer`] – the single writer and single reader of a ring.
//! * [`BufferPool`] / [`BufferHandle`] / [`BufferRef`] – payload slots and the references rings carry.
//! * [`Doorbell`] / [`IrqLine`] / [`WakeSignal`] – interrupt delivery and worker wakeups.
//! * [`spin_until`] – bounded busy-wait for in-place handshakes.

mod buffer;
mod doorbell;
mod error;
mod layout;
mod region;
mod ring;
mod signal;
mod spin;
mod wait;

pub use buffer::{
    BufferHandle, BufferPool, BufferPoolConfig, BufferRef, BufferView, PoolDirectory, MAX_POOL_ID,
    MAX_SLOTS, SLOT_ALIGNMENT,
};
pub use doorbell::{
    Doorbell, DoorbellLatch, DoorbellRegister, DoorbellState, IrqLine, LoopbackDoorbell,
    MmioDoorbell, DEFAULT_MMIO_BASE, MMIO_STRIDE,
};
pub use error::{TransportError, TransportResult};
pub use layout::{ShmemLayout, Side, DEFAULT_RING_CAPACITY, LAYOUT_MAGIC, LAYOUT_VERSION};
pub use region::{RegionInit, SharedBlock, SharedRegion};
pub use ring::{seq_delta, Drain, RingConsumer, RingEntry, RingProducer};
pub use signal::{Wake, WakeSignal};
pub use spin::{spin_until, SpinBudget, SpinStep};
