//! Wire formats carried inside shared buffers by the data channel.
//!
//! Every network or control payload starts with a little-endian
//! [`PayloadHeader`] naming the interface it belongs to. Once per boot the
//! device also sends a [`BootupEvent`] describing itself as a TLV list.

mod bootup;
mod error;
mod header;

pub use bootup::{
    BootupEvent, BootupInfo, Capabilities, FirmwareInfo, TlvIter, TlvRecord, BOOTUP_EVENT_CODE,
    EVENT_HEADER_LEN, TAG_CAPABILITY, TAG_CHIP_ID, TAG_FW_DATA, TAG_RAW_TP,
};
pub use error::{FrameError, FrameResult};
pub use header::{IfType, PacketType, PayloadHeader, DEFAULT_MAX_FRAME_SIZE, HEADER_LEN};
