//! flowlat: attach a tc classifier to both directions of an interface,
//! configure it, and stream the events it emits.

pub mod cli;
pub mod config;
pub mod ebpf;
pub mod error;
pub mod mac;
pub mod netlink;
pub mod probe;
pub mod tc;

pub use error::{FlowlatError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
