use thiserror::Error;

use shmem_transport::TransportError;

use crate::lanes::Priority;
use crate::pipeline::Outbound;

pub type IpcResult<T> = Result<T, IpcError>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IpcError {
    #[error("{lane:?} lane is full ({capacity} descriptors queued)")]
    QueueFull { lane: Priority, capacity: usize },

    #[error("client address {address} outside the {slots} registered slots")]
    InvalidAddress { address: u32, slots: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unexpected protocol state: {0}")]
    UnexpectedProtocolState(String),

    #[error("endpoint closed")]
    Closed,

    #[error("invalid ipc configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl IpcError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        IpcError::MalformedFrame(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        IpcError::InvalidConfig(msg.into())
    }
}

/// A submit that did not make it onto a lane. The payload comes back to the
/// caller so the buffer is never lost.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct Rejected {
    pub reason: IpcError,
    pub payload: Outbound,
}

impl Rejected {
    pub fn into_reason(self) -> IpcError {
        self.reason
    }
}

impl From<Rejected> for IpcError {
    fn from(rejected: Rejected) -> Self {
        rejected.reason
    }
}
