//! Shared types between the tc probe (kernel) and userspace
//!
//! Everything here must stay:
//! - `#[repr(C)]` for a stable memory layout
//! - `no_std` compatible for eBPF

#![cfg_attr(not(feature = "userspace"), no_std)]

/// Name of the classifier program inside the probe object.
pub const PROGRAM_NAME: &str = "probe";

/// Array map holding the source hardware address, one byte per key.
pub const CONFIG_MAP: &str = "SMAC";

/// Ring buffer map the probe publishes events on.
pub const EVENTS_MAP: &str = "EVENTS";

/// Number of keys in the config table (one per hardware address byte).
pub const MAC_LEN: usize = 6;

/// PPPoE discovery stage ethertype.
pub const ETH_P_PPP_DISC: u16 = 0x8863;

/// PPPoE session stage ethertype.
pub const ETH_P_PPP_SES: u16 = 0x8864;

/// Emitted every time the probe rewrites the source address of a PPPoE frame.
///
/// Layout (24 bytes total, 8-byte aligned):
/// - timestamp_ns: `bpf_ktime_get_ns` when the frame was seen
/// - packet_len: skb length in bytes
/// - ether_type: host byte order
/// - original_source: source address before the rewrite
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct RewriteEvent {
    pub timestamp_ns: u64,
    pub packet_len: u32,
    pub ether_type: u16,
    pub original_source: [u8; MAC_LEN],
    pub _padding: [u8; 4],
}

#[cfg(feature = "userspace")]
const _: () = {
    assert!(
        core::mem::size_of::<RewriteEvent>() == 24,
        "RewriteEvent must be exactly 24 bytes"
    );
    assert!(
        core::mem::align_of::<RewriteEvent>() == 8,
        "RewriteEvent must be 8-byte aligned"
    );
};
