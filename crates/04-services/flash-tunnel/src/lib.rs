//! Flash access tunneled through one shared command block.
//!
//! Only the device may touch the flash controller, so the host asks the
//! device to do it. The block is exchanged once; every command after that is
//! negotiated in place through two state words:
//!
//! ```text
//! host                                   device (rx worker)
//! write code/addr/size/data
//! re-send block ref ───────────────────▶ local  = Ready
//! wait local == Ready                    wait remote == Ready
//! remote = Ready                         run the operation
//! wait local == Done                     result, local = Done
//! read result/data, remote = Idle
//! ```

mod backend;
mod block;
mod client;
mod error;
mod server;

pub use backend::{FlashBackend, MemFlash};
pub use block::{FlashCode, FlashCommandBlock, HandshakeState, FLASH_DATA_WINDOW};
pub use client::FlashTunnelClient;
pub use error::{FlashError, FlashResult};
pub use server::{FlashTunnelServer, ServerStats};

/// Client address of the flash tunnel.
pub const FLASH_ADDRESS: u32 = 2;
