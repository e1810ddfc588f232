use std::time::Duration;

use shmem_ipc::IpcError;
use shmem_transport::TransportError;
use thiserror::Error;

use crate::block::FlashCode;

pub type FlashResult<T> = Result<T, FlashError>;

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("flash range {addr:#x}+{len} exceeds the {capacity} byte device")]
    OutOfRange { addr: u32, len: u32, capacity: u32 },

    #[error("{len} bytes do not fit the {window} byte data window")]
    WindowExceeded { len: usize, window: usize },

    #[error("no command block received within {0:?}")]
    ConnectTimeout(Duration),

    #[error("tunnel has no command block")]
    NotConnected,

    #[error("device failed {code:?} at {addr:#x}")]
    DeviceFailed { code: FlashCode, addr: u32 },

    #[error("peer did not reach {awaited} in time ({polls} polls)")]
    HandshakeTimeout { awaited: &'static str, polls: u64 },

    #[error("unexpected handshake state {value} while waiting for {awaited}")]
    UnexpectedState { awaited: &'static str, value: u32 },

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl FlashError {
    /// Converts a failed handshake wait into a flash error naming the awaited state.
    pub(crate) fn from_spin(err: TransportError, awaited: &'static str) -> Self {
        match err {
            TransportError::SpinTimeout { polls } => FlashError::HandshakeTimeout { awaited, polls },
            TransportError::UnexpectedState { value } => {
                FlashError::UnexpectedState { awaited, value }
            }
            other => FlashError::Transport(other),
        }
    }
}
