//! UDP tunneling
//!
//! Per-source associations with idle eviction, plus the reserved-byte
//! rewrite applied to both directions.

pub mod reserved;
mod session;

pub use reserved::{clear_reply, mask_outbound};
pub use session::UdpTunnel;
