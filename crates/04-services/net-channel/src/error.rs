use hosted_framing::FrameError;
use shmem_ipc::IpcError;
use shmem_transport::TransportError;
use thiserror::Error;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("empty payload")]
    Empty,

    #[error("payload of {len} bytes exceeds the {max} byte frame limit")]
    TooLarge { len: usize, max: usize },

    #[error("invalid net channel configuration: {0}")]
    InvalidConfig(String),

    #[error("net channel closed")]
    Closed,

    #[error("timed out waiting for a frame")]
    Timeout,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
