//! Network and control traffic on client address 1.
//!
//! Outgoing payloads are copied into a pool buffer behind a
//! [`PayloadHeader`](hosted_framing::PayloadHeader) and submitted on the lane
//! their interface maps to. Incoming buffers are validated, copied out of
//! shared memory and queued on three bounded receive lanes that
//! [`NetChannel::read`] drains in strict priority order.

mod channel;
mod config;
mod error;
mod stats;

pub use channel::{lane_for, Frame, NetChannel, NET_ADDRESS};
pub use config::NetChannelConfig;
pub use error::{NetError, NetResult};
pub use stats::NetStatsSnapshot;
