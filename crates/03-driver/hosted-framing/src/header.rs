//! The header prepended to every data-channel payload.
//!
//! ```text
//! 0        1        2        3        4                6                8
//! +--------+--------+--------+--------+----------------+----------------+
//! | if_type| if_num | flags  | pkt    | len (u16 LE)   | offset (u16 LE)|
//! +--------+--------+--------+--------+----------------+----------------+
//! ```
//!
//! `offset` is measured from the start of the header to the first data byte.

use crate::error::{FrameError, FrameResult};

pub const HEADER_LEN: usize = 8;

/// Largest payload the firmware accepts in one frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1600;

/// Logical interface a frame belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IfType {
    Sta,
    Ap,
    Hci,
    Internal,
    Test,
    Unknown(u8),
}

impl IfType {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => IfType::Sta,
            1 => IfType::Ap,
            2 => IfType::Hci,
            3 => IfType::Internal,
            4 => IfType::Test,
            other => IfType::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            IfType::Sta => 0,
            IfType::Ap => 1,
            IfType::Hci => 2,
            IfType::Internal => 3,
            IfType::Test => 4,
            IfType::Unknown(raw) => raw,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    Data,
    CommandRequest,
    CommandResponse,
    Event,
    Eapol,
    Other(u8),
}

impl PacketType {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0x00 => PacketType::Data,
            0x11 => PacketType::CommandRequest,
            0x22 => PacketType::CommandResponse,
            0x33 => PacketType::Event,
            0x44 => PacketType::Eapol,
            other => PacketType::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            PacketType::Data => 0x00,
            PacketType::CommandRequest => 0x11,
            PacketType::CommandResponse => 0x22,
            PacketType::Event => 0x33,
            PacketType::Eapol => 0x44,
            PacketType::Other(raw) => raw,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadHeader {
    pub if_type: IfType,
    pub if_num: u8,
    pub flags: u8,
    pub packet_type: PacketType,
    pub len: u16,
    pub offset: u16,
}

impl PayloadHeader {
    /// Header for `len` data bytes placed directly after it.
    pub fn new(if_type: IfType, if_num: u8, packet_type: PacketType, len: u16) -> Self {
        Self {
            if_type,
            if_num,
            flags: 0,
            packet_type,
            len,
            offset: HEADER_LEN as u16,
        }
    }

    pub fn write_to(&self, out: &mut [u8]) -> FrameResult<()> {
        let got = out.len();
        let Some(out) = out.get_mut(..HEADER_LEN) else {
            return Err(FrameError::Short {
                needed: HEADER_LEN,
                got,
            });
        };
        out[0] = self.if_type.as_u8();
        out[1] = self.if_num;
        out[2] = self.flags;
        out[3] = self.packet_type.as_u8();
        out[4..6].copy_from_slice(&self.len.to_le_bytes());
        out[6..8].copy_from_slice(&self.offset.to_le_bytes());
        Ok(())
    }

    /// Reads the header fields without validating them.
    pub fn read_from(bytes: &[u8]) -> FrameResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Short {
                needed: HEADER_LEN,
                got: bytes.len(),
            });
        }
        Ok(Self {
            if_type: IfType::from_u8(bytes[0]),
            if_num: bytes[1],
            flags: bytes[2],
            packet_type: PacketType::from_u8(bytes[3]),
            len: u16::from_le_bytes([bytes[4], bytes[5]]),
            offset: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    /// Parses a frame and returns its header and data.
    ///
    /// Rejects a zero length, a length above `max_frame_size` and an
    /// `offset`/`len` pair that does not fit inside `bytes`.
    pub fn parse(bytes: &[u8], max_frame_size: usize) -> FrameResult<(Self, &[u8])> {
        let header = Self::read_from(bytes)?;
        let len = header.len as usize;
        let offset = header.offset as usize;
        if len == 0 {
            return Err(FrameError::ZeroLength);
        }
        if len > max_frame_size {
            return Err(FrameError::TooLong {
                len,
                max: max_frame_size,
            });
        }
        if offset < HEADER_LEN || offset + len > bytes.len() {
            return Err(FrameError::BadOffset {
                offset,
                len,
                available: bytes.len(),
            });
        }
        Ok((header, &bytes[offset..offset + len]))
    }

    /// Bytes from the header start through the last data byte.
    pub fn frame_len(&self) -> usize {
        self.offset as usize + self.len as usize
    }
}
