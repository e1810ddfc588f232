//! Bring-up announcement sent once per boot on the internal interface.
//!
//! Layout after the payload header:
//!
//! ```text
//! event_code u8 | status u8 | len u16 LE | tlv_len u8 | pad[3] | tlv[tlv_len]
//! ```
//!
//! `len` counts the TLV block plus the `tlv_len` byte. Each TLV is
//! `tag u8 | length u8 | value[length]`; readers skip tags they do not know.

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::error::{FrameError, FrameResult};
use crate::header::{IfType, PacketType, PayloadHeader, HEADER_LEN};

pub const BOOTUP_EVENT_CODE: u8 = 1;
pub const EVENT_HEADER_LEN: usize = 8;

pub const TAG_CAPABILITY: u8 = 0x11;
pub const TAG_CHIP_ID: u8 = 0x12;
pub const TAG_RAW_TP: u8 = 0x13;
pub const TAG_FW_DATA: u8 = 0x14;

const FW_DATA_LEN: usize = 7;

bitflags! {
    /// Transports and features the firmware was built with.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        const WLAN_SDIO = 1 << 0;
        const BT_UART = 1 << 1;
        const BT_SDIO = 1 << 2;
        const BLE_ONLY = 1 << 3;
        const BR_EDR_ONLY = 1 << 4;
        const WLAN_SPI = 1 << 5;
        const BT_SPI = 1 << 6;
        const CHECKSUM = 1 << 7;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub major1: u8,
    pub major2: u8,
    pub minor: u8,
    pub last_reset_reason: u32,
}

impl FirmwareInfo {
    fn to_bytes(self) -> [u8; FW_DATA_LEN] {
        let reason = self.last_reset_reason.to_le_bytes();
        [
            self.major1,
            self.major2,
            self.minor,
            reason[0],
            reason[1],
            reason[2],
            reason[3],
        ]
    }

    fn from_bytes(value: &[u8]) -> FrameResult<Self> {
        if value.len() < FW_DATA_LEN {
            return Err(FrameError::BadTlvLength {
                tag: TAG_FW_DATA,
                len: value.len(),
                expected: FW_DATA_LEN,
            });
        }
        Ok(Self {
            major1: value[0],
            major2: value[1],
            minor: value[2],
            last_reset_reason: u32::from_le_bytes([value[3], value[4], value[5], value[6]]),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlvRecord<'a> {
    pub tag: u8,
    pub value: &'a [u8],
}

/// Walks a TLV block. Stops after the first truncated record.
#[derive(Clone, Debug)]
pub struct TlvIter<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> TlvIter<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = FrameResult<TlvRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.bytes.get(self.pos..)?;
        let (&tag, rest) = rest.split_first()?;
        let at = self.pos;
        let Some((&len, rest)) = rest.split_first() else {
            self.pos = self.bytes.len();
            return Some(Err(FrameError::TruncatedTlv { tag, at }));
        };
        let len = len as usize;
        if rest.len() < len {
            self.pos = self.bytes.len();
            return Some(Err(FrameError::TruncatedTlv { tag, at }));
        }
        self.pos += 2 + len;
        Some(Ok(TlvRecord {
            tag,
            value: &rest[..len],
        }))
    }
}

/// What the device reports about itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootupInfo {
    pub chip_id: Option<u8>,
    pub capabilities: Option<Capabilities>,
    /// Raw-throughput test mode enabled.
    pub raw_tp: Option<bool>,
    pub firmware: Option<FirmwareInfo>,
    /// Tags that were present but not understood, in arrival order.
    pub unknown_tags: SmallVec<[u8; 4]>,
}

impl BootupInfo {
    pub fn from_tlvs(block: &[u8]) -> FrameResult<Self> {
        let mut info = BootupInfo::default();
        for record in TlvIter::new(block) {
            let TlvRecord { tag, value } = record?;
            match tag {
                TAG_CHIP_ID => info.chip_id = Some(single_byte(tag, value)?),
                TAG_CAPABILITY => {
                    info.capabilities =
                        Some(Capabilities::from_bits_retain(single_byte(tag, value)?))
                }
                TAG_RAW_TP => info.raw_tp = Some(single_byte(tag, value)? != 0),
                TAG_FW_DATA => info.firmware = Some(FirmwareInfo::from_bytes(value)?),
                other => {
                    tracing::debug!(tag = other, len = value.len(), "skipping unknown bootup tlv");
                    info.unknown_tags.push(other);
                }
            }
        }
        Ok(info)
    }

    /// Appends the known fields as TLVs, in firmware order.
    pub fn write_tlvs(&self, out: &mut Vec<u8>) {
        if let Some(chip_id) = self.chip_id {
            out.extend_from_slice(&[TAG_CHIP_ID, 1, chip_id]);
        }
        if let Some(caps) = self.capabilities {
            out.extend_from_slice(&[TAG_CAPABILITY, 1, caps.bits()]);
        }
        if let Some(raw_tp) = self.raw_tp {
            out.extend_from_slice(&[TAG_RAW_TP, 1, raw_tp as u8]);
        }
        if let Some(firmware) = self.firmware {
            out.extend_from_slice(&[TAG_FW_DATA, FW_DATA_LEN as u8]);
            out.extend_from_slice(&firmware.to_bytes());
        }
    }
}

fn single_byte(tag: u8, value: &[u8]) -> FrameResult<u8> {
    match value {
        [byte] => Ok(*byte),
        _ => Err(FrameError::BadTlvLength {
            tag,
            len: value.len(),
            expected: 1,
        }),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootupEvent {
    pub status: u8,
    pub info: BootupInfo,
}

impl BootupEvent {
    pub fn new(info: BootupInfo) -> Self {
        Self { status: 0, info }
    }

    /// Event header and TLV block, without the payload header.
    pub fn encode(&self) -> FrameResult<Vec<u8>> {
        let mut tlvs = Vec::with_capacity(16);
        self.info.write_tlvs(&mut tlvs);
        let tlv_len = u8::try_from(tlvs.len()).map_err(|_| FrameError::TlvOverflow(tlvs.len()))?;

        let mut out = Vec::with_capacity(EVENT_HEADER_LEN + tlvs.len());
        out.push(BOOTUP_EVENT_CODE);
        out.push(self.status);
        out.extend_from_slice(&(u16::from(tlv_len) + 1).to_le_bytes());
        out.push(tlv_len);
        out.extend_from_slice(&[0; 3]);
        out.extend_from_slice(&tlvs);
        Ok(out)
    }

    /// Complete frame on the internal interface.
    pub fn encode_frame(&self) -> FrameResult<Vec<u8>> {
        let body = self.encode()?;
        let mut out = vec![0; HEADER_LEN];
        PayloadHeader::new(IfType::Internal, 0, PacketType::Event, body.len() as u16)
            .write_to(&mut out)?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> FrameResult<Self> {
        if data.len() < EVENT_HEADER_LEN {
            return Err(FrameError::Short {
                needed: EVENT_HEADER_LEN,
                got: data.len(),
            });
        }
        if data[0] != BOOTUP_EVENT_CODE {
            return Err(FrameError::NotBootup(data[0]));
        }
        let status = data[1];
        let declared = u16::from_le_bytes([data[2], data[3]]);
        let tlv_len = data[4] as usize;
        let end = EVENT_HEADER_LEN + tlv_len;
        let Some(block) = data.get(EVENT_HEADER_LEN..end) else {
            return Err(FrameError::BadOffset {
                offset: EVENT_HEADER_LEN,
                len: tlv_len,
                available: data.len(),
            });
        };
        if declared as usize != tlv_len + 1 {
            tracing::warn!(declared, tlv_len, "bootup event length disagrees with tlv length");
        }
        Ok(Self {
            status,
            info: BootupInfo::from_tlvs(block)?,
        })
    }

    /// Parses a full frame and checks it is on the internal interface.
    pub fn decode_frame(bytes: &[u8], max_frame_size: usize) -> FrameResult<Self> {
        let (header, data) = PayloadHeader::parse(bytes, max_frame_size)?;
        if header.if_type != IfType::Internal {
            return Err(FrameError::NotInternal(header.if_type));
        }
        Self::decode(data)
    }
}
