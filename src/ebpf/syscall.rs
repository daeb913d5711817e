//! Raw `bpf(2)` commands aya does not expose: running a loaded program
//! against a packet (`BPF_PROG_TEST_RUN`) and loading hand-assembled
//! instructions. Used to exercise the probe without a live interface.

use super::classify_load_failure;
use crate::{FlowlatError, Result};
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

const BPF_PROG_LOAD: libc::c_long = 5;
const BPF_PROG_TEST_RUN: libc::c_long = 10;

pub const BPF_PROG_TYPE_SCHED_CLS: u32 = 3;

/// Classifier verdict: continue normal processing.
pub const TC_ACT_OK: u32 = 0;

const LOG_LEVEL_VERBOSE: u32 = 2;
const INITIAL_LOG_SIZE: usize = 64 * 1024;
const MAX_LOG_SIZE: usize = 16 * 1024 * 1024;

/// Head of `union bpf_attr` for `BPF_PROG_LOAD`; the kernel zero-fills the rest.
#[repr(C)]
#[derive(Default)]
struct ProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
}

/// Head of `union bpf_attr` for `BPF_PROG_TEST_RUN`.
#[repr(C)]
#[derive(Default)]
struct TestRunAttr {
    prog_fd: u32,
    retval: u32,
    data_size_in: u32,
    data_size_out: u32,
    data_in: u64,
    data_out: u64,
    repeat: u32,
    duration: u32,
}

/// One `struct bpf_insn`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub code: u8,
    /// dst in the low nibble, src in the high nibble.
    pub regs: u8,
    pub off: i16,
    pub imm: i32,
}

impl Instruction {
    pub const fn new(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> Self {
        Self {
            code,
            regs: (src << 4) | (dst & 0x0f),
            off,
            imm,
        }
    }

    /// `dst = imm` (64-bit).
    pub const fn mov64_imm(dst: u8, imm: i32) -> Self {
        Self::new(0xb7, dst, 0, 0, imm)
    }

    /// `dst = *(u64 *)(src + off)`
    pub const fn ldx_dw(dst: u8, src: u8, off: i16) -> Self {
        Self::new(0x79, dst, src, off, 0)
    }

    pub const fn exit() -> Self {
        Self::new(0x95, 0, 0, 0, 0)
    }

    pub fn dst(&self) -> u8 {
        self.regs & 0x0f
    }

    pub fn src(&self) -> u8 {
        self.regs >> 4
    }
}

/// Result of one `BPF_PROG_TEST_RUN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRunOutput {
    pub retval: u32,
    pub data: Vec<u8>,
}

fn bpf<T>(cmd: libc::c_long, attr: &mut T) -> io::Result<libc::c_long> {
    // SAFETY: attr points to a live, correctly sized bpf_attr prefix
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            mem::size_of::<T>(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

/// Load `insns` as a program of `prog_type` with a verbose verifier log.
///
/// A rejection that produced a verifier log is reported as
/// [`FlowlatError::Verifier`] with the whole log; anything else as
/// [`FlowlatError::ProgramLoadFailed`].
pub fn load_instructions(
    name: &str,
    prog_type: u32,
    insns: &[Instruction],
    license: &str,
) -> Result<OwnedFd> {
    let license = CString::new(license)
        .map_err(|_| FlowlatError::ProgramLoadFailed("license contains NUL".to_string()))?;
    let mut log = vec![0u8; INITIAL_LOG_SIZE];

    loop {
        let mut attr = ProgLoadAttr {
            prog_type,
            insn_cnt: insns.len() as u32,
            insns: insns.as_ptr() as u64,
            license: license.as_ptr() as u64,
            log_level: LOG_LEVEL_VERBOSE,
            log_size: log.len() as u32,
            log_buf: log.as_mut_ptr() as u64,
            ..Default::default()
        };

        match bpf(BPF_PROG_LOAD, &mut attr) {
            // SAFETY: a successful BPF_PROG_LOAD returns a new fd we now own
            Ok(fd) => return Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) }),
            Err(e) if e.raw_os_error() == Some(libc::ENOSPC) && log.len() < MAX_LOG_SIZE => {
                log = vec![0u8; log.len() * 4];
            }
            Err(e) => return Err(classify_load_failure(name, &e, log_text(&log))),
        }
    }
}

fn log_text(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).trim_end().to_string()
}

/// Run the program once over `data` and return its verdict and the packet as
/// the program left it.
pub fn test_run(prog: BorrowedFd<'_>, data: &[u8]) -> io::Result<TestRunOutput> {
    let mut out = vec![0u8; data.len() + 256];
    let mut attr = TestRunAttr {
        prog_fd: prog.as_raw_fd() as u32,
        data_size_in: data.len() as u32,
        data_size_out: out.len() as u32,
        data_in: data.as_ptr() as u64,
        data_out: out.as_mut_ptr() as u64,
        repeat: 1,
        ..Default::default()
    };

    bpf(BPF_PROG_TEST_RUN, &mut attr)?;

    out.truncate(attr.data_size_out as usize);
    Ok(TestRunOutput {
        retval: attr.retval,
        data: out,
    })
}
