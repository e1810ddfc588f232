//! Single-producer/single-consumer descriptor ring living in shared memory.
//!
//! Each direction of the link owns one ring. A slot carries a client address
//! and a [`BufferRef`]; the producer alone advances `write`, the consumer
//! alone advances `read`. Both cursors are free-running `u32`s that are
//! masked into the slot array, so they wrap naturally and are only ever
//! compared through [`seq_delta`].

use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

use crate::buffer::BufferRef;
use crate::layout::ShmemLayout;
use crate::region::SharedBlock;

/// Ring header as laid out in the shared window.
#[repr(C)]
#[derive(Debug)]
pub struct RingHeader {
    pub(crate) write: AtomicU32,
    pub(crate) read: AtomicU32,
    /// Byte offset of the slot array from the layout base.
    pub(crate) offset: AtomicU32,
    pub(crate) mask: AtomicU32,
}

// SAFETY: plain atomics, valid for any bit pattern.
unsafe impl SharedBlock for RingHeader {}

#[repr(C)]
#[derive(Debug)]
pub(crate) struct RingSlot {
    address: AtomicU32,
    pointer: AtomicU32,
}

// SAFETY: plain atomics, valid for any bit pattern.
unsafe impl SharedBlock for RingSlot {}

/// One published descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingEntry {
    pub address: u32,
    pub pointer: BufferRef,
}

/// Wrap-safe distance from `b` to `a`.
///
/// Positive when `a` is ahead of `b`, valid while the true distance stays
/// below `2^31`.
#[inline]
pub fn seq_delta(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

struct RingRef {
    layout: Arc<ShmemLayout>,
    queue: usize,
    mask: u32,
    slots_offset: usize,
}

impl RingRef {
    fn new(layout: Arc<ShmemLayout>, queue: usize) -> Self {
        let header = layout.ring_header(queue);
        let mask = header.mask.load(Ordering::Relaxed);
        let slots_offset = header.offset.load(Ordering::Relaxed) as usize;
        Self {
            layout,
            queue,
            mask,
            slots_offset,
        }
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        self.layout.ring_header(self.queue)
    }

    #[inline]
    fn slot(&self, seq: u32) -> &RingSlot {
        let index = (seq & self.mask) as usize;
        let offset = self.slots_offset + index * std::mem::size_of::<RingSlot>();
        self.layout.region().view::<RingSlot>(offset)
    }

    #[inline]
    fn capacity(&self) -> u32 {
        self.mask + 1
    }
}

/// Writing end of a ring. Exactly one exists per ring per processor.
pub struct RingProducer {
    ring: RingRef,
}

impl RingProducer {
    pub(crate) fn new(layout: Arc<ShmemLayout>, queue: usize) -> Self {
        Self {
            ring: RingRef::new(layout, queue),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.ring.capacity()
    }

    /// Publishes `entry` if a slot is free.
    ///
    /// The slot contents are made visible to the consumer before the `write`
    /// cursor moves. Returns `false` when the ring is full.
    pub fn try_publish(&mut self, entry: RingEntry) -> bool {
        let header = self.ring.header();
        let write = header.write.load(Ordering::Relaxed);
        let read = header.read.load(Ordering::Acquire);
        if write.wrapping_sub(read) >= self.ring.capacity() {
            return false;
        }

        let slot = self.ring.slot(write);
        slot.address.store(entry.address, Ordering::Relaxed);
        slot.pointer.store(entry.pointer.raw(), Ordering::Relaxed);

        fence(Ordering::Release);
        header.write.store(write.wrapping_add(1), Ordering::Relaxed);
        tracing::trace!(
            queue = self.ring.queue,
            seq = write,
            address = entry.address,
            "published ring entry"
        );
        true
    }

    /// The consumer's `read` cursor: every sequence before it has been consumed.
    pub fn acknowledged(&self) -> u32 {
        self.ring.header().read.load(Ordering::Acquire)
    }

    /// The producer's own `write` cursor.
    pub fn published(&self) -> u32 {
        self.ring.header().write.load(Ordering::Relaxed)
    }

    /// Number of entries published but not yet consumed.
    pub fn in_flight(&self) -> u32 {
        self.published().wrapping_sub(self.acknowledged())
    }

    pub fn is_full(&self) -> bool {
        self.in_flight() >= self.capacity()
    }
}

/// Reading end of a ring. Exactly one exists per ring per processor.
pub struct RingConsumer {
    ring: RingRef,
}

impl RingConsumer {
    pub(crate) fn new(layout: Arc<ShmemLayout>, queue: usize) -> Self {
        Self {
            ring: RingRef::new(layout, queue),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.ring.capacity()
    }

    /// Number of entries waiting to be drained.
    pub fn pending(&self) -> u32 {
        let header = self.ring.header();
        let write = header.write.load(Ordering::Acquire);
        let read = header.read.load(Ordering::Relaxed);
        write.wrapping_sub(read)
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Drains every entry published before this call.
    ///
    /// The `read` cursor for an entry advances when the iterator moves past
    /// it or is dropped, so the producer cannot reclaim a buffer while the
    /// caller is still handling its entry. Entries published during the drain
    /// are left for the next call.
    pub fn drain(&mut self) -> Drain<'_> {
        let header = self.ring.header();
        let start = header.read.load(Ordering::Relaxed);
        let mut end = header.write.load(Ordering::Acquire);
        let available = seq_delta(end, start);
        if available < 0 || available as u32 > self.ring.capacity() {
            tracing::error!(
                queue = self.ring.queue,
                read = start,
                write = end,
                "ring cursors out of range, ignoring batch"
            );
            end = start;
        }
        Drain {
            ring: &self.ring,
            cursor: start,
            end,
            uncommitted: false,
        }
    }
}

/// Lazy batch returned by [`RingConsumer::drain`].
pub struct Drain<'a> {
    ring: &'a RingRef,
    cursor: u32,
    end: u32,
    uncommitted: bool,
}

impl Drain<'_> {
    #[inline]
    fn commit(&mut self) {
        if self.uncommitted {
            self.ring
                .header()
                .read
                .store(self.cursor, Ordering::Release);
            self.uncommitted = false;
        }
    }

    /// Entries left in this batch.
    pub fn remaining(&self) -> u32 {
        self.end.wrapping_sub(self.cursor)
    }
}

impl Iterator for Drain<'_> {
    type Item = RingEntry;

    fn next(&mut self) -> Option<RingEntry> {
        self.commit();
        if self.cursor == self.end {
            return None;
        }
        let slot = self.ring.slot(self.cursor);
        let entry = RingEntry {
            address: slot.address.load(Ordering::Relaxed),
            pointer: BufferRef::from_raw(slot.pointer.load(Ordering::Relaxed)),
        };
        self.cursor = self.cursor.wrapping_add(1);
        self.uncommitted = true;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining() as usize;
        (remaining, Some(remaining))
    }
}

impl Drop for Drain<'_> {
    fn drop(&mut self) {
        self.commit();
    }
}
