//! I/O utilities
//!
//! - [`BufferPool`]: reusable fixed-size buffers shared by all relays
//! - [`read_http_head`]: pull one HTTP message head off a raw stream

pub mod buffer_pool;
pub mod head;

pub use buffer_pool::{BufferPool, PooledBuffer, RELAY_BUFFER_SIZE, UDP_BUFFER_SIZE};
pub use head::{read_http_head, MAX_HEAD_SIZE};
