use thiserror::Error;

use crate::layout::Side;

/// Convenience alias for results returned by the transport primitives.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised while building or operating the shared-memory primitives.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// A ring, pool or queue was configured with an unusable size.
    #[error("invalid capacity {requested} (minimum {minimum})")]
    InvalidCapacity { requested: usize, minimum: usize },

    /// Backing memory could not be obtained.
    #[error("failed to allocate {size} bytes aligned to {alignment}")]
    AllocationFailed { size: usize, alignment: usize },

    /// An attached region is smaller than the layout it must hold.
    #[error("shared region of {len} bytes cannot hold {required} bytes")]
    RegionTooSmall { len: usize, required: usize },

    /// An attached region does not carry a recognised layout header.
    #[error("bad layout header (magic {magic:#010x}, version {version})")]
    BadLayout { magic: u32, version: u32 },

    /// The producer/consumer pair for a side was already handed out.
    #[error("{0:?} ring endpoints already claimed")]
    AlreadyClaimed(Side),

    /// Every slot of a buffer pool is checked out.
    #[error("buffer pool {pool} exhausted")]
    PoolExhausted { pool: u8 },

    /// Two pools registered in one directory share an id.
    #[error("buffer pool id {pool} registered twice")]
    DuplicatePool { pool: u8 },

    /// A buffer reference names a slot that was released or never existed.
    #[error("buffer reference {raw:#010x} is stale or unknown")]
    StaleBuffer { raw: u32 },

    /// A payload does not fit into one pool slot.
    #[error("{len} bytes exceed slot capacity {capacity}")]
    PayloadTooLarge { len: usize, capacity: usize },

    /// A bounded spin ran out of budget.
    #[error("spin wait expired after {polls} polls")]
    SpinTimeout { polls: u64 },

    /// A handshake field held a value outside its state machine.
    #[error("unexpected protocol state {value}")]
    UnexpectedState { value: u32 },
}
