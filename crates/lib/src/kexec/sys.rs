//! The kexec system calls.
//!
//! Neither `kexec_file_load` nor `kexec_load` is wrapped by rustix, so they
//! are issued through `libc::syscall`. Everything else goes through rustix.
//!
//! `kexec_file_load` is only issued on x86_64 and aarch64; elsewhere it fails
//! with `ENOSYS` and only the legacy interface is usable.

use std::ffi::CStr;
use std::io::Write;
use std::os::fd::BorrowedFd;

use rustix::io::Errno;

use super::segments::KexecSegment;

/// Skip signature verification in `kexec_file_load`.
pub const KEXEC_FILE_LOAD_UNSAFE: libc::c_ulong = 0x1;

/// The `kexec_load` architecture flag for this build.
#[cfg(target_arch = "x86_64")]
pub const KEXEC_ARCH: libc::c_ulong = 62 << 16;
/// The `kexec_load` architecture flag for this build.
#[cfg(target_arch = "aarch64")]
pub const KEXEC_ARCH: libc::c_ulong = 183 << 16;
/// `KEXEC_ARCH_DEFAULT`
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const KEXEC_ARCH: libc::c_ulong = 0;

/// The kernel calls needed to load and start a new kernel.
///
/// Implemented by [`LinuxKexec`] for the real thing; tests substitute a
/// recording fake.
pub trait KexecSyscalls {
    /// `kexec_file_load(2)`. `cmdline` of `None` passes a null pointer
    /// and zero length.
    fn kexec_file_load(
        &self,
        kernel: BorrowedFd<'_>,
        initrd: BorrowedFd<'_>,
        cmdline: Option<&CStr>,
        flags: libc::c_ulong,
    ) -> Result<(), Errno>;

    /// `kexec_load(2)` with an entry point of zero, which makes the kernel
    /// take it from the image header.
    fn kexec_load(&self, segments: &[KexecSegment<'_>], flags: libc::c_ulong)
        -> Result<(), Errno>;

    /// `reboot(LINUX_REBOOT_CMD_KEXEC)`. Does not return on success.
    fn reboot_kexec(&self) -> Result<(), Errno>;
}

/// The layout of `struct kexec_segment` from `<linux/kexec.h>`.
#[repr(C)]
#[derive(Debug)]
// Only ever read by the kernel
#[allow(dead_code)]
struct RawSegment {
    buf: *const libc::c_void,
    bufsz: libc::size_t,
    mem: libc::c_ulong,
    memsz: libc::size_t,
}

impl From<&KexecSegment<'_>> for RawSegment {
    fn from(s: &KexecSegment<'_>) -> Self {
        Self {
            buf: s.buf.as_ptr().cast(),
            bufsz: s.buf.len(),
            mem: s.mem as libc::c_ulong,
            memsz: s.memsz as libc::size_t,
        }
    }
}

fn check(r: libc::c_long) -> Result<(), Errno> {
    if r == -1 {
        Err(Errno::from_io_error(&std::io::Error::last_os_error()).unwrap_or(Errno::IO))
    } else {
        Ok(())
    }
}

/// The running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxKexec;

impl KexecSyscalls for LinuxKexec {
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[allow(unsafe_code)]
    fn kexec_file_load(
        &self,
        kernel: BorrowedFd<'_>,
        initrd: BorrowedFd<'_>,
        cmdline: Option<&CStr>,
        flags: libc::c_ulong,
    ) -> Result<(), Errno> {
        use std::os::fd::AsRawFd;

        let (ptr, len) = match cmdline {
            Some(c) => (c.as_ptr(), c.to_bytes_with_nul().len()),
            None => (std::ptr::null(), 0),
        };
        // SAFETY: Both descriptors are borrowed for the duration of the call,
        // and `ptr` is either null with a zero length or points at `len`
        // bytes ending in NUL that outlive the call.
        let r = unsafe {
            libc::syscall(
                libc::SYS_kexec_file_load,
                kernel.as_raw_fd(),
                initrd.as_raw_fd(),
                len as libc::c_ulong,
                ptr,
                flags,
            )
        };
        check(r)
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn kexec_file_load(
        &self,
        _kernel: BorrowedFd<'_>,
        _initrd: BorrowedFd<'_>,
        _cmdline: Option<&CStr>,
        _flags: libc::c_ulong,
    ) -> Result<(), Errno> {
        Err(Errno::NOSYS)
    }

    #[allow(unsafe_code)]
    fn kexec_load(
        &self,
        segments: &[KexecSegment<'_>],
        flags: libc::c_ulong,
    ) -> Result<(), Errno> {
        let raw = segments.iter().map(RawSegment::from).collect::<Vec<_>>();
        // SAFETY: `raw` holds `raw.len()` segments laid out as the kernel
        // expects, each pointing into a buffer borrowed from `segments`, and
        // all of it lives until the call returns.
        let r = unsafe {
            libc::syscall(
                libc::SYS_kexec_load,
                0 as libc::c_ulong,
                raw.len() as libc::c_ulong,
                raw.as_ptr(),
                flags,
            )
        };
        check(r)
    }

    fn reboot_kexec(&self) -> Result<(), Errno> {
        // Nothing after this point gets a chance to flush
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
        rustix::system::reboot(rustix::system::RebootCommand::Kexec)
    }
}
