//! Endpoint configuration.
//!
//! Every field has a firmware-derived default, so an empty JSON object is a
//! valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shmem_transport::{BufferPoolConfig, SpinBudget, DEFAULT_MMIO_BASE, DEFAULT_RING_CAPACITY, SLOT_ALIGNMENT};

use crate::error::{IpcError, IpcResult};
use crate::pipeline::SubmitPolicy;

/// Upper bound on the client table.
pub const MAX_CLIENT_SLOTS: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IpcConfig {
    /// Entries per descriptor ring; a power of two.
    pub ring_capacity: u32,
    /// Descriptors each priority lane may hold.
    pub lane_capacity: usize,
    /// Published-but-unreclaimed descriptors; defaults to `ring_capacity`.
    pub reclaim_capacity: Option<usize>,
    /// Size of the client table; addresses are `0..client_slots`.
    pub client_slots: usize,
    pub submit_policy: SubmitPolicy,
    /// Ring the outbound doorbell after consuming a batch so the peer can reclaim.
    pub ack_doorbell: bool,
    pub doorbell: DoorbellConfig,
    pub pool: PoolConfig,
    pub handshake: HandshakeConfig,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            lane_capacity: 20,
            reclaim_capacity: None,
            client_slots: 4,
            submit_policy: SubmitPolicy::Reject,
            ack_doorbell: true,
            doorbell: DoorbellConfig::default(),
            pool: PoolConfig::default(),
            handshake: HandshakeConfig::default(),
        }
    }
}

/// Doorbell register placement on the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DoorbellConfig {
    pub mmio_base: u64,
    /// Register this side writes to interrupt the peer.
    pub to_peer_index: usize,
    /// Register the peer writes to interrupt this side.
    pub from_peer_index: usize,
}

impl Default for DoorbellConfig {
    fn default() -> Self {
        Self {
            mmio_base: DEFAULT_MMIO_BASE as u64,
            to_peer_index: 0,
            from_peer_index: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub slot_count: u32,
    pub slot_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slot_count: 128,
            slot_size: 2048,
        }
    }
}

/// Budget for the in-place handshakes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandshakeConfig {
    pub max_polls: u64,
    pub timeout_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_polls: u64::MAX,
            timeout_ms: 1000,
        }
    }
}

impl HandshakeConfig {
    pub fn budget(&self) -> SpinBudget {
        SpinBudget {
            max_polls: self.max_polls,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

impl IpcConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> IpcResult<Self> {
        let config: IpcConfig =
            serde_json::from_str(json).map_err(|err| IpcError::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn reclaim_capacity(&self) -> usize {
        self.reclaim_capacity
            .unwrap_or(self.ring_capacity as usize)
    }

    /// Pool shape for the pool stamped with `pool_id`.
    pub fn pool_config(&self, pool_id: u8) -> BufferPoolConfig {
        BufferPoolConfig {
            pool_id,
            slot_count: self.pool.slot_count,
            slot_size: self.pool.slot_size,
        }
    }

    pub fn validate(&self) -> IpcResult<()> {
        if self.ring_capacity < 2 || !self.ring_capacity.is_power_of_two() {
            return Err(IpcError::config(format!(
                "ring_capacity {} must be a power of two >= 2",
                self.ring_capacity
            )));
        }
        if self.lane_capacity == 0 {
            return Err(IpcError::config("lane_capacity must be non-zero"));
        }
        if self.reclaim_capacity() < self.ring_capacity as usize {
            return Err(IpcError::config(format!(
                "reclaim_capacity {} is below ring_capacity {}",
                self.reclaim_capacity(),
                self.ring_capacity
            )));
        }
        if self.client_slots == 0 || self.client_slots > MAX_CLIENT_SLOTS {
            return Err(IpcError::config(format!(
                "client_slots {} outside 1..={MAX_CLIENT_SLOTS}",
                self.client_slots
            )));
        }
        if self.pool.slot_count == 0 {
            return Err(IpcError::config("pool.slot_count must be non-zero"));
        }
        if self.pool.slot_size == 0 || self.pool.slot_size % SLOT_ALIGNMENT != 0 {
            return Err(IpcError::config(format!(
                "pool.slot_size {} must be a non-zero multiple of {SLOT_ALIGNMENT}",
                self.pool.slot_size
            )));
        }
        if self.doorbell.to_peer_index == self.doorbell.from_peer_index {
            return Err(IpcError::config("doorbell indices must differ"));
        }
        if self.handshake.max_polls == 0 || self.handshake.timeout_ms == 0 {
            return Err(IpcError::config("handshake budget must be non-zero"));
        }
        Ok(())
    }
}
