//! Loads the probe object with aya.

use super::events::RingBufSource;
use super::maps::AyaConfigTable;
use super::{classify_load_failure, Hook, HookLoader};
use crate::tc::ProgramHandle;
use crate::{FlowlatError, Result};
use aya::maps::{Array, MapData, RingBuf};
use aya::programs::{ProgramError, SchedClassifier};
use aya::{Ebpf, EbpfLoader, VerifierLogLevel};
use aya_log::EbpfLogger;
use std::borrow::Cow;
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Minimum kernel for BPF ring buffers.
const MIN_KERNEL: (u32, u32) = (5, 8);

/// Where the probe object comes from.
#[derive(Debug, Clone)]
pub enum HookSource {
    File(PathBuf),
    Bytes(Cow<'static, [u8]>),
}

impl HookSource {
    /// The object built into the binary.
    #[cfg(feature = "embed-probe")]
    pub fn embedded() -> Self {
        HookSource::Bytes(Cow::Borrowed(aya::include_bytes_aligned!(concat!(
            env!("OUT_DIR"),
            "/flowlat-probe"
        ))))
    }
}

/// Object and map names plus the memlock limit to raise before loading.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub program_name: String,
    pub config_map: String,
    pub events_map: String,
    pub memlock_limit: u64,
    pub preflight: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            program_name: flowlat_common::PROGRAM_NAME.to_string(),
            config_map: flowlat_common::CONFIG_MAP.to_string(),
            events_map: flowlat_common::EVENTS_MAP.to_string(),
            memlock_limit: crate::config::DEFAULT_MEMLOCK_LIMIT,
            preflight: true,
        }
    }
}

pub struct AyaHookLoader {
    source: HookSource,
    options: LoaderOptions,
}

impl AyaHookLoader {
    pub fn new(source: HookSource, options: LoaderOptions) -> Self {
        Self { source, options }
    }
}

impl HookLoader for AyaHookLoader {
    type Hook = AyaHook;

    fn load(&self) -> Result<AyaHook> {
        if self.options.preflight {
            run_preflight_checks()?;
        }
        raise_memlock_limit(self.options.memlock_limit)?;

        let bytes = match &self.source {
            HookSource::File(path) => Cow::Owned(read_object(path)?),
            HookSource::Bytes(bytes) => bytes.clone(),
        };

        info!(program = %self.options.program_name, "Loading probe object...");
        let mut bpf = EbpfLoader::new()
            .verifier_log_level(VerifierLogLevel::VERBOSE | VerifierLogLevel::STATS)
            .load(&bytes)
            .map_err(|e| FlowlatError::ProgramLoadFailed(format!("probe object: {e}")))?;

        if let Err(e) = EbpfLogger::init(&mut bpf) {
            debug!(error = %e, "probe has no log map, kernel-side logs will not be forwarded");
        }

        let program = load_classifier(&mut bpf, &self.options.program_name)?;
        let config = take_config_table(&mut bpf, &self.options.config_map)?;
        let events = take_ring(&mut bpf, &self.options.events_map)?;

        info!(program = %program.name, fd = program.fd, "probe loaded");
        Ok(AyaHook {
            program,
            config,
            events: Some(events),
            bpf,
        })
    }
}

/// A loaded probe: the classifier plus its config table and event ring.
pub struct AyaHook {
    program: ProgramHandle,
    config: AyaConfigTable,
    events: Option<RingBuf<MapData>>,
    bpf: Ebpf,
}

impl Hook for AyaHook {
    type Table = AyaConfigTable;
    type Events = RingBufSource;

    fn program(&self) -> &ProgramHandle {
        &self.program
    }

    fn config_table(&mut self) -> &mut AyaConfigTable {
        &mut self.config
    }

    fn take_events(&mut self) -> Result<RingBufSource> {
        let ring = self
            .events
            .take()
            .ok_or_else(|| FlowlatError::HookObject("event ring already taken".to_string()))?;
        RingBufSource::new(ring)
    }

    fn close(self) -> Result<()> {
        let AyaHook {
            program,
            config,
            events,
            bpf,
        } = self;
        drop(events);
        drop(config);
        // Dropping the Ebpf closes the program fd; filters still referencing
        // it keep the program alive until the qdisc goes.
        drop(bpf);
        info!(program = %program.name, "probe closed");
        Ok(())
    }
}

fn read_object(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        FlowlatError::ProgramLoadFailed(format!("Probe file not found: {}: {}", path.display(), e))
    })
}

fn load_classifier(bpf: &mut Ebpf, name: &str) -> Result<ProgramHandle> {
    let program: &mut SchedClassifier = bpf
        .program_mut(name)
        .ok_or_else(|| {
            FlowlatError::ProgramLoadFailed(format!("{name} program not found in probe object"))
        })?
        .try_into()
        .map_err(|e: ProgramError| {
            FlowlatError::ProgramLoadFailed(format!("{name} is not a tc classifier: {e}"))
        })?;

    program.load().map_err(|e| classify_load_error(name, e))?;

    let fd = program
        .fd()
        .map_err(|e| FlowlatError::ProgramLoadFailed(format!("{name}: {e}")))?
        .as_fd()
        .as_raw_fd();

    Ok(ProgramHandle {
        fd,
        name: name.to_string(),
    })
}

fn classify_load_error(program: &str, err: ProgramError) -> FlowlatError {
    match err {
        ProgramError::LoadError {
            io_error,
            verifier_log,
        } => classify_load_failure(program, &io_error, verifier_log.to_string()),
        other => FlowlatError::ProgramLoadFailed(format!("{program}: {other}")),
    }
}

fn take_config_table(bpf: &mut Ebpf, name: &str) -> Result<AyaConfigTable> {
    let map = bpf
        .take_map(name)
        .ok_or_else(|| missing_map(bpf, name))?;
    let array = Array::<MapData, u8>::try_from(map)
        .map_err(|e| FlowlatError::HookObject(format!("{name} is not a u8 array: {e}")))?;
    Ok(AyaConfigTable::new(array))
}

fn take_ring(bpf: &mut Ebpf, name: &str) -> Result<RingBuf<MapData>> {
    let map = bpf
        .take_map(name)
        .ok_or_else(|| missing_map(bpf, name))?;
    RingBuf::try_from(map)
        .map_err(|e| FlowlatError::HookObject(format!("{name} is not a ring buffer: {e}")))
}

fn missing_map(bpf: &Ebpf, name: &str) -> FlowlatError {
    let available: Vec<_> = bpf.maps().map(|(name, _)| name.to_string()).collect();
    FlowlatError::HookObject(format!(
        "{name} map not found in probe object. Available maps: {available:?}"
    ))
}

/// Raise RLIMIT_MEMLOCK (current and max) so program and map memory can be pinned.
pub fn raise_memlock_limit(limit: u64) -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: limit as libc::rlim_t,
        rlim_max: limit as libc::rlim_t,
    };

    // SAFETY: rlim is a valid, initialized rlimit for the duration of the call
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        return Err(FlowlatError::MemlockLimit {
            limit,
            source: std::io::Error::last_os_error(),
        });
    }

    debug!(limit, "RLIMIT_MEMLOCK raised");
    Ok(())
}

/// Run pre-flight checks to validate the system can run the probe
fn run_preflight_checks() -> Result<()> {
    info!("Running pre-flight checks...");

    check_kernel_version()?;
    check_btf();
    check_capabilities();

    info!("Pre-flight checks passed");
    Ok(())
}

fn check_kernel_version() -> Result<()> {
    let output = std::process::Command::new("uname")
        .arg("-r")
        .output()
        .map_err(uname_failed)?;

    let release = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let Some(version) = parse_kernel_version(&release) else {
        warn!("Could not parse kernel version {:?}, skipping check", release);
        return Ok(());
    };

    if version < MIN_KERNEL {
        return Err(FlowlatError::KernelVersionTooOld {
            version: release,
            min_version: format!("{}.{}", MIN_KERNEL.0, MIN_KERNEL.1),
        });
    }

    info!("Kernel version: {} (supported)", release);
    Ok(())
}

fn uname_failed(err: std::io::Error) -> FlowlatError {
    FlowlatError::ProgramLoadFailed(format!("pre-flight: failed to get kernel version: {err}"))
}

/// `"6.1.0-18-amd64"` -> `(6, 1)`
fn parse_kernel_version(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.trim().parse().ok()?;
    let minor = parts
        .next()?
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()?;
    Some((major, minor))
}

fn check_btf() {
    if !Path::new("/sys/kernel/btf/vmlinux").exists() {
        warn!("BTF not found at /sys/kernel/btf/vmlinux");
        return;
    }
    debug!("BTF available");
}

fn check_capabilities() {
    // SAFETY: geteuid has no preconditions
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        warn!(
            "Not running as root (euid={}). Ensure CAP_BPF and CAP_NET_ADMIN are granted.",
            euid
        );
    } else {
        debug!("Running with root privileges");
    }
}
