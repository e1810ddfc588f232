//! Fixed-size buffer pools with generation-tagged references.
//!
//! Every payload that crosses the link lives in a pool slot inside shared
//! memory. The sender owns a slot through a move-only [`BufferHandle`]; the
//! ring only ever carries the 32-bit [`BufferRef`] naming it. A reference
//! encodes the slot index, the pool id and a generation counter that is
//! bumped each time the slot is released, so a reference that outlives its
//! buffer is detected on resolve instead of silently aliasing the next user.
//!
//! ```text
//!  31           20 19   16 15             0
//! +---------------+-------+----------------+
//! |  generation   | pool  |   slot + 1     |
//! +---------------+-------+----------------+
//! ```

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::region::{RegionInit, SharedBlock, SharedRegion};
use crate::{TransportError, TransportResult};

/// Alignment enforced for every slot inside a pool.
pub const SLOT_ALIGNMENT: usize = 64;
/// Largest slot count a pool may have.
pub const MAX_SLOTS: u32 = INDEX_MASK;
/// Largest pool id; id 0 is reserved.
pub const MAX_POOL_ID: u8 = POOL_MASK as u8;

const INDEX_MASK: u32 = 0xFFFF;
const POOL_SHIFT: u32 = 16;
const POOL_MASK: u32 = 0xF;
const GENERATION_SHIFT: u32 = 20;
const GENERATION_MASK: u32 = 0xFFF;

/// Opaque 32-bit pointer published in a ring slot. Zero is the null sentinel.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BufferRef(u32);

impl BufferRef {
    pub const NULL: BufferRef = BufferRef(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn pool_id(self) -> u8 {
        ((self.0 >> POOL_SHIFT) & POOL_MASK) as u8
    }

    fn compose(pool: u8, index: u32, generation: u32) -> Self {
        Self(
            ((generation & GENERATION_MASK) << GENERATION_SHIFT)
                | ((pool as u32 & POOL_MASK) << POOL_SHIFT)
                | ((index + 1) & INDEX_MASK),
        )
    }

    fn index(self) -> Option<u32> {
        (self.0 & INDEX_MASK).checked_sub(1)
    }

    fn generation(self) -> u32 {
        (self.0 >> GENERATION_SHIFT) & GENERATION_MASK
    }
}

impl fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index() {
            None => write!(f, "BufferRef(null)"),
            Some(index) => write!(
                f,
                "BufferRef(pool={}, slot={}, gen={})",
                self.pool_id(),
                index,
                self.generation()
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
enum SlotState {
    Free = 0,
    Owned = 1,
    InFlight = 2,
}

#[derive(Debug, Default)]
struct SlotMeta {
    generation: AtomicU32,
    len: AtomicU32,
    state: AtomicU32,
}

impl SlotMeta {
    fn state(&self) -> SlotState {
        match self.state.load(Ordering::Acquire) {
            1 => SlotState::Owned,
            2 => SlotState::InFlight,
            _ => SlotState::Free,
        }
    }
}

/// Shape of a buffer pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferPoolConfig {
    /// Id stamped into every reference; unique per shared window, 1..=15.
    pub pool_id: u8,
    /// Number of slots managed by the pool.
    pub slot_count: u32,
    /// Size in bytes of each slot; must be a multiple of [`SLOT_ALIGNMENT`].
    pub slot_size: usize,
}

/// Fixed-size slot pool backed by shared memory.
pub struct BufferPool {
    id: u8,
    slots: SharedRegion,
    meta: Box<[SlotMeta]>,
    free: Mutex<Vec<u32>>,
    slot_size: usize,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.id)
            .field("slot_count", &self.meta.len())
            .field("slot_size", &self.slot_size)
            .field("available", &self.available())
            .finish()
    }
}

impl BufferPool {
    /// Allocates a pool with every slot free.
    pub fn new(config: BufferPoolConfig) -> TransportResult<Arc<Self>> {
        validate_config(&config)?;
        let BufferPoolConfig {
            pool_id,
            slot_count,
            slot_size,
        } = config;

        let slots_len =
            slot_size
                .checked_mul(slot_count as usize)
                .ok_or(TransportError::InvalidCapacity {
                    requested: slot_size,
                    minimum: SLOT_ALIGNMENT,
                })?;
        let slots = SharedRegion::new_aligned(slots_len, SLOT_ALIGNMENT.max(4096), RegionInit::Zeroed)?;
        let meta = (0..slot_count).map(|_| SlotMeta::default()).collect();
        // Popped from the back, so slot 0 goes out first.
        let free = (0..slot_count).rev().collect();

        Ok(Arc::new(Self {
            id: pool_id,
            slots,
            meta,
            free: Mutex::new(free),
            slot_size,
        }))
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn slot_count(&self) -> u32 {
        self.meta.len() as u32
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Checks out a free slot.
    pub fn acquire(self: &Arc<Self>) -> TransportResult<BufferHandle> {
        let index = self
            .free
            .lock()
            .pop()
            .ok_or(TransportError::PoolExhausted { pool: self.id })?;
        let meta = &self.meta[index as usize];
        meta.len.store(0, Ordering::Relaxed);
        meta.state.store(SlotState::Owned as u32, Ordering::Release);
        let generation = meta.generation.load(Ordering::Relaxed);
        Ok(BufferHandle {
            pool: Arc::clone(self),
            index,
            generation,
        })
    }

    /// Resolves a reference published by either side into a read view.
    pub fn resolve(&self, buffer: BufferRef) -> TransportResult<BufferView<'_>> {
        let stale = TransportError::StaleBuffer { raw: buffer.raw() };
        if buffer.pool_id() != self.id {
            return Err(stale);
        }
        let index = buffer.index().ok_or(stale.clone())?;
        let meta = self.meta.get(index as usize).ok_or(stale.clone())?;
        if meta.state() == SlotState::Free
            || meta.generation.load(Ordering::Acquire) & GENERATION_MASK != buffer.generation()
        {
            return Err(stale);
        }
        Ok(BufferView {
            pool: self,
            index,
            len: meta.len.load(Ordering::Acquire) as usize,
            buffer,
        })
    }

    fn slot_ptr(&self, index: u32) -> *mut u8 {
        self.slots
            .byte_ptr(index as usize * self.slot_size, self.slot_size)
    }

    fn block<T: SharedBlock>(&self, index: u32) -> TransportResult<&T> {
        if mem::size_of::<T>() > self.slot_size || mem::align_of::<T>() > SLOT_ALIGNMENT {
            return Err(TransportError::PayloadTooLarge {
                len: mem::size_of::<T>(),
                capacity: self.slot_size,
            });
        }
        Ok(self.slots.view::<T>(index as usize * self.slot_size))
    }

    fn release(&self, index: u32) {
        let meta = &self.meta[index as usize];
        meta.generation.fetch_add(1, Ordering::AcqRel);
        meta.len.store(0, Ordering::Relaxed);
        meta.state.store(SlotState::Free as u32, Ordering::Release);
        self.free.lock().push(index);
    }
}

fn validate_config(config: &BufferPoolConfig) -> TransportResult<()> {
    if config.pool_id == 0 || config.pool_id > MAX_POOL_ID {
        return Err(TransportError::InvalidCapacity {
            requested: config.pool_id as usize,
            minimum: 1,
        });
    }

    if config.slot_count == 0 || config.slot_count > MAX_SLOTS {
        return Err(TransportError::InvalidCapacity {
            requested: config.slot_count as usize,
            minimum: 1,
        });
    }

    if config.slot_size == 0 || config.slot_size % SLOT_ALIGNMENT != 0 {
        return Err(TransportError::InvalidCapacity {
            requested: config.slot_size,
            minimum: SLOT_ALIGNMENT,
        });
    }

    Ok(())
}

/// Exclusive ownership of one pool slot. Dropping the handle frees the slot.
pub struct BufferHandle {
    pool: Arc<BufferPool>,
    index: u32,
    generation: u32,
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("buffer", &self.buffer_ref())
            .field("len", &self.len())
            .finish()
    }
}

impl BufferHandle {
    /// Reference to publish in a ring slot.
    pub fn buffer_ref(&self) -> BufferRef {
        BufferRef::compose(self.pool.id, self.index, self.generation)
    }

    pub fn capacity(&self) -> usize {
        self.pool.slot_size
    }

    pub fn len(&self) -> usize {
        self.meta().len.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sets the number of valid bytes the receiver will see.
    pub fn set_len(&mut self, len: usize) -> TransportResult<()> {
        if len > self.capacity() {
            return Err(TransportError::PayloadTooLarge {
                len,
                capacity: self.capacity(),
            });
        }
        self.meta().len.store(len as u32, Ordering::Release);
        Ok(())
    }

    /// The whole slot, regardless of the current length.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let ptr = self.pool.slot_ptr(self.index);
        // SAFETY: the handle is the unique owner of this slot and `&mut self`
        // rules out other borrows through it.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.pool.slot_size) }
    }

    /// The valid bytes of the slot.
    pub fn as_slice(&self) -> &[u8] {
        let ptr = self.pool.slot_ptr(self.index);
        // SAFETY: the handle owns the slot; `len <= slot_size` is kept by `set_len`.
        unsafe { std::slice::from_raw_parts(ptr, self.len()) }
    }

    /// Copies `bytes` to the start of the slot and sets the length.
    pub fn fill_from(&mut self, bytes: &[u8]) -> TransportResult<()> {
        if bytes.len() > self.capacity() {
            return Err(TransportError::PayloadTooLarge {
                len: bytes.len(),
                capacity: self.capacity(),
            });
        }
        self.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        self.set_len(bytes.len())
    }

    /// Views the slot as a shared control block, for buffers both sides
    /// keep mutating in place after the first exchange.
    pub fn block<T: SharedBlock>(&self) -> TransportResult<&T> {
        self.pool.block::<T>(self.index)
    }

    /// Records that the slot has been published into a ring.
    pub fn mark_in_flight(&self) {
        self.meta()
            .state
            .store(SlotState::InFlight as u32, Ordering::Release);
    }

    /// Records that the peer has consumed the slot and it is ours again.
    pub fn mark_returned(&self) {
        self.meta()
            .state
            .store(SlotState::Owned as u32, Ordering::Release);
    }

    pub fn is_in_flight(&self) -> bool {
        self.meta().state() == SlotState::InFlight
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    fn meta(&self) -> &SlotMeta {
        &self.pool.meta[self.index as usize]
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

/// Read-only view of a resolved buffer.
#[derive(Clone, Copy)]
pub struct BufferView<'a> {
    pool: &'a BufferPool,
    index: u32,
    len: usize,
    buffer: BufferRef,
}

impl fmt::Debug for BufferView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferView")
            .field("buffer", &self.buffer)
            .field("len", &self.len)
            .finish()
    }
}

impl<'a> BufferView<'a> {
    pub fn buffer_ref(&self) -> BufferRef {
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The bytes the owner published.
    pub fn as_slice(&self) -> &'a [u8] {
        let ptr = self.pool.slot_ptr(self.index);
        // SAFETY: the owner does not touch an in-flight slot until the read
        // cursor has moved past it, which happens after this view is dropped.
        unsafe { std::slice::from_raw_parts(ptr, self.len) }
    }

    /// Views the slot as a shared control block.
    pub fn block<T: SharedBlock>(&self) -> TransportResult<&'a T> {
        self.pool.block::<T>(self.index)
    }
}

/// Every pool mapped into the shared window, looked up by the pool id bits of
/// a [`BufferRef`].
#[derive(Clone, Debug, Default)]
pub struct PoolDirectory {
    pools: SmallVec<[Arc<BufferPool>; 2]>,
}

impl PoolDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pool: Arc<BufferPool>) -> TransportResult<()> {
        if self.pools.iter().any(|p| p.id == pool.id) {
            return Err(TransportError::DuplicatePool { pool: pool.id });
        }
        self.pools.push(pool);
        Ok(())
    }

    pub fn get(&self, pool_id: u8) -> Option<&Arc<BufferPool>> {
        self.pools.iter().find(|p| p.id == pool_id)
    }

    pub fn resolve(&self, buffer: BufferRef) -> TransportResult<BufferView<'_>> {
        self.get(buffer.pool_id())
            .ok_or(TransportError::StaleBuffer { raw: buffer.raw() })?
            .resolve(buffer)
    }
}
