//! The hook program as a capability: load it, hand out its program handle,
//! config table and event source, close it.
//!
//! [`loader::AyaHookLoader`] is the kernel-backed implementation. The
//! lifecycle code only sees these traits.

pub mod events;
#[cfg(target_os = "linux")]
pub mod loader;
pub mod maps;
#[cfg(target_os = "linux")]
pub mod syscall;

use crate::tc::ProgramHandle;
use crate::{FlowlatError, Result};
use async_trait::async_trait;
use bytes::Bytes;

pub trait HookLoader {
    type Hook: Hook;

    fn load(&self) -> Result<Self::Hook>;
}

pub trait Hook: Send {
    type Table: ConfigTable;
    type Events: EventSource;

    fn program(&self) -> &ProgramHandle;

    fn config_table(&mut self) -> &mut Self::Table;

    /// Hand the event source over to the exporter. Succeeds once.
    fn take_events(&mut self) -> Result<Self::Events>;

    /// Release the program and its maps.
    fn close(self) -> Result<()>;
}

/// Keyed configuration table: small integer keys, one byte each.
pub trait ConfigTable {
    fn set(&mut self, key: u32, value: u8) -> Result<()>;

    fn get(&self, key: u32) -> Result<u8>;
}

/// Kernel-to-user event ring.
#[async_trait]
pub trait EventSource: Send + 'static {
    /// Wait for the next record.
    async fn next_record(&mut self) -> Result<Bytes>;
}

/// Classify a failed program load.
///
/// Only a load that left a verifier log behind is a verifier rejection, and
/// the log is kept as is. Without one (EPERM, ENOMEM, E2BIG, an EINVAL from a
/// bad attribute) it is a generic load failure.
pub fn classify_load_failure(program: &str, error: &std::io::Error, log: String) -> FlowlatError {
    if log.trim().is_empty() {
        return FlowlatError::ProgramLoadFailed(format!("{program}: {error}"));
    }
    FlowlatError::Verifier {
        program: program.to_string(),
        reason: error.to_string(),
        log,
    }
}
