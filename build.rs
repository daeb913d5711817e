use anyhow::{anyhow, Context};
use std::env;

fn main() -> anyhow::Result<()> {
    println!("cargo:rerun-if-changed=flowlat-probes/src");

    // Without embed-probe the object is read from disk at runtime
    if env::var("CARGO_FEATURE_EMBED_PROBE").is_err() {
        return Ok(());
    }

    // Skip eBPF build if we're already building for the eBPF target
    if env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default() == "bpf" {
        return Ok(());
    }

    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("linux") {
        return Err(anyhow!("embed-probe requires a Linux target"));
    }

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").context("CARGO_MANIFEST_DIR not set")?;
    let probes_dir = format!("{}/flowlat-probes", manifest_dir);
    if !std::path::Path::new(&probes_dir).join("Cargo.toml").exists() {
        return Err(anyhow!("flowlat-probes package not found"));
    }

    let ebpf_package = aya_build::Package {
        name: "flowlat-probes",
        root_dir: &probes_dir,
        ..Default::default()
    };

    aya_build::build_ebpf([ebpf_package], aya_build::Toolchain::default())?;

    let out_dir = env::var("OUT_DIR")?;
    let probe_path = format!("{}/flowlat-probe", out_dir);
    if !std::path::Path::new(&probe_path).exists() {
        return Err(anyhow!(
            "eBPF probe compilation failed: {} not found",
            probe_path
        ));
    }

    Ok(())
}
