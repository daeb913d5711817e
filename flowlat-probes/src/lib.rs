//! eBPF probes for flowlat
//!
//! The tc classifier lives in src/bin/ and is built for the
//! bpfel-unknown-none target through flowlat's build.rs.

#![cfg_attr(not(test), no_std)]

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
