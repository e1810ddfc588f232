use hosted_framing::{DEFAULT_MAX_FRAME_SIZE, HEADER_LEN};
use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetChannelConfig {
    /// Largest data length accepted in either direction, header excluded.
    pub max_frame_size: usize,
    /// Frames each receive lane may hold before new arrivals are dropped.
    pub rx_lane_capacity: usize,
}

impl Default for NetChannelConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            rx_lane_capacity: 20,
        }
    }
}

impl NetChannelConfig {
    /// Checks the limits against the size of the buffers frames travel in.
    pub fn validate(&self, slot_size: usize) -> NetResult<()> {
        if self.max_frame_size == 0 || self.max_frame_size > u16::MAX as usize {
            return Err(NetError::InvalidConfig(format!(
                "max_frame_size {} outside 1..={}",
                self.max_frame_size,
                u16::MAX
            )));
        }
        if self.rx_lane_capacity == 0 {
            return Err(NetError::InvalidConfig(
                "rx_lane_capacity must be non-zero".into(),
            ));
        }
        if HEADER_LEN + self.max_frame_size > slot_size {
            return Err(NetError::InvalidConfig(format!(
                "max_frame_size {} plus the {HEADER_LEN} byte header does not fit {slot_size} byte buffers",
                self.max_frame_size
            )));
        }
        Ok(())
    }
}
