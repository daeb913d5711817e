use std::fmt;
use thiserror::Error;

use crate::tc::Direction;

#[derive(Error, Debug)]
pub enum FlowlatError {
    #[error("Failed to open netlink control channel: {0}")]
    ControlChannel(#[source] std::io::Error),

    #[error("Netlink {operation} on link {link_index} failed: {message}")]
    Netlink {
        operation: &'static str,
        link_index: u32,
        errno: Option<i32>,
        message: String,
    },

    #[error("Failed to raise RLIMIT_MEMLOCK to {limit} bytes: {source}")]
    MemlockLimit {
        limit: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Kernel version {version} is too old. Minimum required: {min_version}")]
    KernelVersionTooOld {
        version: String,
        min_version: String,
    },

    /// The verifier rejected the program. `log` is the complete verifier
    /// output and is never shortened.
    #[error("Verifier rejected program {program} ({reason}):\n{log}")]
    Verifier {
        program: String,
        reason: String,
        log: String,
    },

    #[error("Failed to load eBPF program: {0}")]
    ProgramLoadFailed(String),

    #[error("A clsact qdisc is already attached to {iface}; remove it before starting a probe")]
    QdiscExists { iface: String },

    #[error("Failed to install tc filters on {iface}: {}", describe_failures(.failures))]
    FilterInstall {
        iface: String,
        installed: Vec<Direction>,
        failures: Vec<(Direction, FlowlatError)>,
    },

    #[error("Config table write failed at key {key} (keys written: {written:?}): {message}")]
    ConfigWrite {
        key: u32,
        written: Vec<u32>,
        message: String,
    },

    #[error("Config table read failed at key {key}: {message}")]
    ConfigRead { key: u32, message: String },

    #[error("Event read failed: {0}")]
    EventRead(String),

    #[error("Event source failed {failures} consecutive reads, last error: {last}")]
    EventReadExhausted { failures: u32, last: String },

    #[error("Event exporter failed: {0}")]
    ExporterFailed(String),

    #[error("Hook object error: {0}")]
    HookObject(String),

    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Invalid hardware address {input:?}: {reason}")]
    InvalidMac { input: String, reason: &'static str },

    #[error("Probe is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Teardown incomplete: {0}")]
    Teardown(TeardownErrors),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl FlowlatError {
    /// Errno reported by the kernel, when the failure came from a netlink reply.
    pub fn errno(&self) -> Option<i32> {
        match self {
            FlowlatError::Netlink { errno, .. } => *errno,
            _ => None,
        }
    }
}

fn describe_failures(failures: &[(Direction, FlowlatError)]) -> String {
    failures
        .iter()
        .map(|(direction, err)| format!("{direction}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// One step of the teardown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    StopExporter,
    DetachQdisc,
    RemoveFilter(Direction),
    CloseHook,
    CloseChannel,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownStep::StopExporter => write!(f, "stop exporter"),
            TeardownStep::DetachQdisc => write!(f, "detach qdisc"),
            TeardownStep::RemoveFilter(direction) => write!(f, "remove {direction} filter"),
            TeardownStep::CloseHook => write!(f, "close hook"),
            TeardownStep::CloseChannel => write!(f, "close control channel"),
        }
    }
}

/// Every failure hit while tearing a probe down.
///
/// Teardown keeps going after a failed step, so this can hold several
/// errors at once.
#[derive(Debug, Default)]
pub struct TeardownErrors {
    errors: Vec<(TeardownStep, FlowlatError)>,
}

impl TeardownErrors {
    pub fn push(&mut self, step: TeardownStep, err: FlowlatError) {
        self.errors.push((step, err));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn steps(&self) -> impl Iterator<Item = TeardownStep> + '_ {
        self.errors.iter().map(|(step, _)| *step)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(TeardownStep, FlowlatError)> {
        self.errors.iter()
    }

    pub fn into_result(self) -> std::result::Result<(), TeardownErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for TeardownErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} step(s) failed", self.errors.len())?;
        for (step, err) in &self.errors {
            write!(f, "; {step}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TeardownErrors {}

pub type Result<T> = std::result::Result<T, FlowlatError>;
