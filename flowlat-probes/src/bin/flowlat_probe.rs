//! tc classifier attached to both ingress and egress of one interface
//!
//! For PPPoE frames (discovery and session) the probe rewrites the Ethernet
//! source address with the one userspace wrote into `SMAC`, then publishes a
//! `RewriteEvent` on the `EVENTS` ring buffer. Every other frame passes
//! through untouched. The verdict is always `TC_ACT_OK`.
//!
//! Note: This binary must be built for the bpfel-unknown-none target.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::TC_ACT_OK,
    helpers::bpf_ktime_get_ns,
    macros::{classifier, map},
    maps::{Array, RingBuf},
    programs::TcContext,
};
use aya_log_ebpf::debug;
use flowlat_common::{RewriteEvent, ETH_P_PPP_DISC, ETH_P_PPP_SES, MAC_LEN};

/// Ring buffer size in bytes. 256KB holds ~10K events before dropping.
const RING_BUF_SIZE: u32 = 256 * 1024;

const ETH_SOURCE_OFFSET: usize = 6;
const ETH_PROTO_OFFSET: usize = 12;

#[map]
static SMAC: Array<u8> = Array::with_max_entries(MAC_LEN as u32, 0);

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(RING_BUF_SIZE, 0);

#[classifier]
pub fn probe(ctx: TcContext) -> i32 {
    match try_probe(ctx) {
        Ok(ret) => ret,
        Err(_) => TC_ACT_OK,
    }
}

fn try_probe(mut ctx: TcContext) -> Result<i32, ()> {
    let ether_type = u16::from_be(ctx.load::<u16>(ETH_PROTO_OFFSET).map_err(|_| ())?);
    if ether_type != ETH_P_PPP_SES && ether_type != ETH_P_PPP_DISC {
        return Ok(TC_ACT_OK);
    }

    // An all-zero address means userspace has not configured us yet.
    let Some(source) = configured_source() else {
        return Ok(TC_ACT_OK);
    };

    let original: [u8; MAC_LEN] = ctx.load(ETH_SOURCE_OFFSET).map_err(|_| ())?;
    ctx.store(ETH_SOURCE_OFFSET, &source, 0).map_err(|_| ())?;

    // SAFETY: bpf_ktime_get_ns is always safe to call from eBPF context
    let timestamp_ns = unsafe { bpf_ktime_get_ns() };

    if let Some(mut entry) = EVENTS.reserve::<RewriteEvent>(0) {
        entry.write(RewriteEvent {
            timestamp_ns,
            packet_len: ctx.len(),
            ether_type,
            original_source: original,
            _padding: [0; 4],
        });
        entry.submit(0);
    }

    debug!(&ctx, "rewrote source address, ether_type={}", ether_type);
    Ok(TC_ACT_OK)
}

fn configured_source() -> Option<[u8; MAC_LEN]> {
    let mut source = [0u8; MAC_LEN];
    for (key, byte) in source.iter_mut().enumerate() {
        *byte = *SMAC.get(key as u32)?;
    }
    if source == [0u8; MAC_LEN] {
        None
    } else {
        Some(source)
    }
}

#[cfg(not(test))]
#[cfg(target_arch = "bpf")]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
