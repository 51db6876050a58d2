pub mod bridge;
pub mod compress;
pub mod config;
pub mod engine;
pub mod error;
pub mod framing;
pub mod iface;
pub mod params;
pub mod ringbuf;
pub mod transport;
