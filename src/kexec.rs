//! Handoff to kexec_load(2).
//!
//! The kernel copies each segment's buffer to the start of its physical range,
//! zero-fills the remainder and, on the next kexec reboot, jumps to the entry
//! point. Preconditions established by [`Layout::finalize`]: segments are
//! whole pages, do not overlap and contain the entry point.

use std::fmt;

use bitflags::bitflags;

use crate::error::Result;
use crate::layout::{Layout, StagedSegment};
use crate::segment::Range;

bitflags! {
    /// Mode flags for kexec_load(2).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KexecFlags: u64 {
        /// Load as the crash kernel.
        const ON_CRASH = 0x0000_0001;
        /// Return to the current kernel after the loaded image runs.
        const PRESERVE_CONTEXT = 0x0000_0002;
        /// Architecture field, bits 16..31.
        const ARCH_MASK = 0xffff_0000;
    }
}

impl KexecFlags {
    /// Sets the architecture field to `arch` (already shifted into place).
    pub fn with_arch(self, arch: u64) -> Self {
        (self - Self::ARCH_MASK) | Self::from_bits_retain(arch & Self::ARCH_MASK.bits())
    }
}

/// A segment as handed to the kernel: host buffer address and length, and the
/// physical range it fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSegment {
    pub buf: Range,
    pub phys: Range,
}

impl RawSegment {
    fn from_staged(staged: &StagedSegment<'_>) -> Self {
        Self {
            // A live allocation never wraps the address space.
            buf: Range::new(staged.data.as_ptr() as u64, staged.data.len() as u64)
                .unwrap_or_default(),
            phys: staged.phys,
        }
    }
}

impl fmt::Display for RawSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[virt {} -> phys {}]", self.buf, self.phys)
    }
}

/// A failed kexec_load(2), with everything that was passed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexecError {
    pub entry: u64,
    pub segments: Vec<RawSegment>,
    pub flags: KexecFlags,
    pub errno: i32,
}

impl fmt::Display for KexecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kexec_load(entry={:#x}, segments=[", self.entry)?;
        for (i, s) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{s}")?;
        }
        write!(
            f,
            "], flags {:#x}) = errno {} ({})",
            self.flags.bits(),
            self.errno,
            std::io::Error::from_raw_os_error(self.errno)
        )
    }
}

impl std::error::Error for KexecError {}

/// The privileged primitive that places segments and arms the jump.
pub trait LoadPrimitive {
    /// Returns the raw errno on failure.
    fn raw_load(&mut self, entry: u64, segments: &[RawSegment], flags: KexecFlags) -> Result<(), i32>;
}

/// kexec_load(2) on the running kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct KexecLoad;

/// `struct kexec_segment` from linux/kexec.h.
#[cfg(target_os = "linux")]
#[repr(C)]
struct KexecSegment {
    buf: *const libc::c_void,
    bufsz: libc::size_t,
    mem: *const libc::c_void,
    memsz: libc::size_t,
}

impl LoadPrimitive for KexecLoad {
    #[cfg(target_os = "linux")]
    fn raw_load(&mut self, entry: u64, segments: &[RawSegment], flags: KexecFlags) -> Result<(), i32> {
        let raw: Vec<KexecSegment> = segments
            .iter()
            .map(|s| KexecSegment {
                buf: s.buf.start() as *const libc::c_void,
                bufsz: s.buf.size() as libc::size_t,
                mem: s.phys.start() as *const libc::c_void,
                memsz: s.phys.size() as libc::size_t,
            })
            .collect();

        // SAFETY: every buffer referenced by `raw` is borrowed by the caller
        // for the duration of this call, and the kernel only reads them.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_kexec_load,
                entry as libc::c_ulong,
                raw.len() as libc::c_ulong,
                raw.as_ptr(),
                flags.bits() as libc::c_ulong,
            )
        };
        if ret != 0 {
            return Err(std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EINVAL));
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn raw_load(&mut self, _entry: u64, _segments: &[RawSegment], _flags: KexecFlags) -> Result<(), i32> {
        Err(libc::ENOSYS)
    }
}

/// Hands a finalized layout to `primitive`.
///
/// `staged` must come from [`Layout::stage`] on the same layout; the buffers
/// it borrows stay alive until the primitive returns.
pub fn load<P: LoadPrimitive>(
    primitive: &mut P,
    layout: &Layout,
    staged: &[StagedSegment<'_>],
    flags: KexecFlags,
) -> Result<()> {
    let entry = layout.entry();
    let segments: Vec<RawSegment> = staged.iter().map(RawSegment::from_staged).collect();

    primitive.raw_load(entry, &segments, flags).map_err(|errno| {
        let err = KexecError {
            entry,
            segments,
            flags,
            errno,
        };
        tracing::error!("{}", err);
        err.into()
    })
}
