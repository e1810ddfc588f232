use thiserror::Error;

use crate::header::IfType;

pub type FrameResult<T> = Result<T, FrameError>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {got} bytes is shorter than the {needed} bytes required")]
    Short { needed: usize, got: usize },

    #[error("frame declares zero payload bytes")]
    ZeroLength,

    #[error("payload length {len} exceeds the {max} byte maximum")]
    TooLong { len: usize, max: usize },

    #[error("payload at offset {offset} with length {len} overruns the {available} byte buffer")]
    BadOffset {
        offset: usize,
        len: usize,
        available: usize,
    },

    #[error("expected an internal interface frame, got {0:?}")]
    NotInternal(IfType),

    #[error("event code {0} is not a bootup announcement")]
    NotBootup(u8),

    #[error("tlv with tag {tag:#04x} at byte {at} runs past the end of the block")]
    TruncatedTlv { tag: u8, at: usize },

    #[error("tlv with tag {tag:#04x} carries {len} bytes, expected {expected}")]
    BadTlvLength { tag: u8, len: usize, expected: usize },

    #[error("tlv block of {0} bytes does not fit the one-byte length field")]
    TlvOverflow(usize),
}
