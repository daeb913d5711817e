//! Traffic-control objects the probe installs: one clsact qdisc and two
//! direct-action bpf filters hanging off it.

pub mod filter;
pub mod qdisc;

use serde::{Deserialize, Serialize};

/// `TC_H_CLSACT`, the reserved parent a clsact qdisc is attached to.
pub const TC_H_CLSACT: u32 = 0xFFFF_FFF1;

/// Ingress hook point of a clsact qdisc (`TC_H_MAKE(TC_H_CLSACT, TC_H_MIN_INGRESS)`).
pub const TC_H_INGRESS_MIN: u32 = 0xFFFF_FFF2;

/// Egress hook point of a clsact qdisc (`TC_H_MAKE(TC_H_CLSACT, TC_H_MIN_EGRESS)`).
pub const TC_H_EGRESS_MIN: u32 = 0xFFFF_FFF3;

/// Handle of the clsact qdisc, `ffff:0000`.
pub const CLSACT_HANDLE: u32 = 0xFFFF_0000;

/// Match every protocol.
pub const ETH_P_ALL: u16 = 0x0003;

/// A network interface resolved by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub index: u32,
    pub name: String,
}

impl Interface {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }

    /// Resolve an interface name to its kernel index.
    #[cfg(target_os = "linux")]
    pub fn by_name(name: &str) -> crate::Result<Self> {
        let c_name = std::ffi::CString::new(name)
            .map_err(|_| crate::FlowlatError::InterfaceNotFound(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string for the duration of the call
        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if index == 0 {
            return Err(crate::FlowlatError::InterfaceNotFound(format!(
                "{}: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self::new(index, name))
    }
}

impl std::fmt::Display for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (index {})", self.name, self.index)
    }
}

/// Direction of traffic a filter sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Ingress, Direction::Egress];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }

    /// Parent handle of the filter for this direction.
    pub const fn parent(&self) -> u32 {
        match self {
            Direction::Ingress => TC_H_INGRESS_MIN,
            Direction::Egress => TC_H_EGRESS_MIN,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The clsact qdisc anchoring both filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qdisc {
    pub link_index: u32,
    pub handle: u32,
    pub parent: u32,
}

impl Qdisc {
    pub fn clsact(iface: &Interface) -> Self {
        Self {
            link_index: iface.index,
            handle: CLSACT_HANDLE,
            parent: TC_H_CLSACT,
        }
    }

    pub const fn kind(&self) -> &'static str {
        "clsact"
    }
}

/// Reference to a loaded classifier program.
///
/// `fd` is borrowed from the hook that loaded the program and is only valid
/// until that hook is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramHandle {
    pub fd: i32,
    pub name: String,
}

/// A direct-action bpf filter on one hook point of the clsact qdisc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub link_index: u32,
    pub direction: Direction,
    pub handle: u32,
    pub priority: u16,
    pub protocol: u16,
    pub program: ProgramHandle,
    pub direct_action: bool,
}

impl Filter {
    pub fn new(
        iface: &Interface,
        direction: Direction,
        program: &ProgramHandle,
        options: &FilterOptions,
    ) -> Self {
        Self {
            link_index: iface.index,
            direction,
            handle: options.handle,
            priority: options.priority,
            protocol: ETH_P_ALL,
            program: program.clone(),
            direct_action: true,
        }
    }

    pub const fn parent(&self) -> u32 {
        self.direction.parent()
    }

    pub const fn kind(&self) -> &'static str {
        "bpf"
    }

    /// Whether `other` occupies the same slot (replace targets it).
    pub fn same_slot(&self, other: &Filter) -> bool {
        self.link_index == other.link_index
            && self.direction == other.direction
            && self.priority == other.priority
            && self.handle == other.handle
            && self.protocol == other.protocol
    }
}

/// Fixed handle and priority both filters are installed with, so a repeated
/// install replaces instead of stacking new filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterOptions {
    pub priority: u16,
    pub handle: u32,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            priority: 1,
            handle: 1,
        }
    }
}
