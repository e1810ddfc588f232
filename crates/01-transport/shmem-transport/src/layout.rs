//! Shared window layout: a header followed by the two descriptor rings.
//!
//! ```text
//! offset 0    LayoutHeader { magic, version, capacity, reserved, rings[2] }
//!             rings[0]: device -> host   (device writes, host reads)
//!             rings[1]: host -> device   (host writes, device reads)
//! offset N    slots of ring 0   [capacity x {address, pointer}]
//! offset M    slots of ring 1
//! ```
//!
//! The device formats the window once; the host attaches to it and validates
//! the header. Each processor claims its own producer/consumer pair exactly
//! once.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::region::{RegionInit, SharedBlock, SharedRegion};
use crate::ring::{RingConsumer, RingHeader, RingProducer};
use crate::{TransportError, TransportResult};

/// "SHMQ" in little-endian byte order.
pub const LAYOUT_MAGIC: u32 = 0x514D_4853;
pub const LAYOUT_VERSION: u32 = 1;
/// Ring capacity used by the firmware.
pub const DEFAULT_RING_CAPACITY: u32 = 64;

const LAYOUT_ALIGNMENT: usize = 64;
const SLOT_BYTES: usize = 8;

/// Which processor a handle belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Device,
    Host,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Device => Side::Host,
            Side::Host => Side::Device,
        }
    }

    /// Index of the ring this side writes.
    pub fn outbound_queue(self) -> usize {
        match self {
            Side::Device => 0,
            Side::Host => 1,
        }
    }

    /// Index of the ring this side reads.
    pub fn inbound_queue(self) -> usize {
        self.peer().outbound_queue()
    }

    pub fn label(self) -> &'static str {
        match self {
            Side::Device => "device",
            Side::Host => "host",
        }
    }
}

#[repr(C, align(64))]
struct LayoutHeader {
    magic: AtomicU32,
    version: AtomicU32,
    capacity: AtomicU32,
    reserved: AtomicU32,
    rings: [RingHeader; 2],
}

// SAFETY: plain atomics, valid for any bit pattern.
unsafe impl SharedBlock for LayoutHeader {}

/// Handle to a formatted shared window.
pub struct ShmemLayout {
    region: SharedRegion,
    capacity: u32,
    claimed: [AtomicBool; 2],
}

impl std::fmt::Debug for ShmemLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmemLayout")
            .field("capacity", &self.capacity)
            .field("len", &self.region.len())
            .finish()
    }
}

impl ShmemLayout {
    /// Bytes needed for a layout whose rings hold `capacity` entries.
    pub fn required_len(capacity: u32) -> usize {
        let ring_bytes = round_up(capacity as usize * SLOT_BYTES, LAYOUT_ALIGNMENT);
        mem::size_of::<LayoutHeader>() + 2 * ring_bytes
    }

    /// Allocates and formats a private window, used by in-process links.
    pub fn new(capacity: u32) -> TransportResult<Arc<Self>> {
        Self::new_with_cursor(capacity, 0)
    }

    /// Like [`ShmemLayout::new`] but starts both rings at sequence `start`,
    /// which lets callers exercise cursor wraparound without pushing four
    /// billion entries first.
    pub fn new_with_cursor(capacity: u32, start: u32) -> TransportResult<Arc<Self>> {
        validate_capacity(capacity)?;
        let region = SharedRegion::new_aligned(
            Self::required_len(capacity),
            LAYOUT_ALIGNMENT,
            RegionInit::Zeroed,
        )?;
        Self::format_at(region, capacity, start)
    }

    /// Formats `region` as a fresh layout. Run by the side that owns the window.
    pub fn format(region: SharedRegion, capacity: u32) -> TransportResult<Arc<Self>> {
        validate_capacity(capacity)?;
        Self::format_at(region, capacity, 0)
    }

    fn format_at(region: SharedRegion, capacity: u32, start: u32) -> TransportResult<Arc<Self>> {
        let required = Self::required_len(capacity);
        if region.len() < required {
            return Err(TransportError::RegionTooSmall {
                len: region.len(),
                required,
            });
        }

        let header = region.view::<LayoutHeader>(0);
        let ring_bytes = round_up(capacity as usize * SLOT_BYTES, LAYOUT_ALIGNMENT);
        for (queue, ring) in header.rings.iter().enumerate() {
            let offset = mem::size_of::<LayoutHeader>() + queue * ring_bytes;
            ring.write.store(start, Ordering::Relaxed);
            ring.read.store(start, Ordering::Relaxed);
            ring.offset.store(offset as u32, Ordering::Relaxed);
            ring.mask.store(capacity - 1, Ordering::Relaxed);
        }
        header.capacity.store(capacity, Ordering::Relaxed);
        header.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        header.magic.store(LAYOUT_MAGIC, Ordering::Release);

        tracing::debug!(capacity, bytes = required, "formatted shared layout");
        Ok(Arc::new(Self {
            region,
            capacity,
            claimed: [AtomicBool::new(false), AtomicBool::new(false)],
        }))
    }

    /// Attaches to a window the peer already formatted.
    pub fn attach(region: SharedRegion) -> TransportResult<Arc<Self>> {
        if region.len() < mem::size_of::<LayoutHeader>() {
            return Err(TransportError::RegionTooSmall {
                len: region.len(),
                required: mem::size_of::<LayoutHeader>(),
            });
        }
        let header = region.view::<LayoutHeader>(0);
        let magic = header.magic.load(Ordering::Acquire);
        let version = header.version.load(Ordering::Relaxed);
        if magic != LAYOUT_MAGIC || version != LAYOUT_VERSION {
            return Err(TransportError::BadLayout { magic, version });
        }
        let capacity = header.capacity.load(Ordering::Relaxed);
        validate_capacity(capacity)?;
        for ring in &header.rings {
            let end = ring.offset.load(Ordering::Relaxed) as usize + capacity as usize * SLOT_BYTES;
            if ring.mask.load(Ordering::Relaxed) != capacity - 1 || end > region.len() {
                return Err(TransportError::BadLayout { magic, version });
            }
        }
        Ok(Arc::new(Self {
            region,
            capacity,
            claimed: [AtomicBool::new(false), AtomicBool::new(false)],
        }))
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Hands out `side`'s producer (its outbound ring) and consumer (its
    /// inbound ring). Fails if the side was already claimed.
    pub fn claim(self: &Arc<Self>, side: Side) -> TransportResult<(RingProducer, RingConsumer)> {
        let flag = match side {
            Side::Device => &self.claimed[0],
            Side::Host => &self.claimed[1],
        };
        if flag.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyClaimed(side));
        }
        Ok((
            RingProducer::new(Arc::clone(self), side.outbound_queue()),
            RingConsumer::new(Arc::clone(self), side.inbound_queue()),
        ))
    }

    pub(crate) fn ring_header(&self, queue: usize) -> &RingHeader {
        &self.region.view::<LayoutHeader>(0).rings[queue]
    }
}

fn validate_capacity(capacity: u32) -> TransportResult<()> {
    if capacity < 2 || !capacity.is_power_of_two() || capacity > (1 << 30) {
        return Err(TransportError::InvalidCapacity {
            requested: capacity as usize,
            minimum: 2,
        });
    }
    Ok(())
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
