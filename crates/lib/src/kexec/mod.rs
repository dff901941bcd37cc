//! Loading a new kernel with kexec and switching to it.
//!
//! Two kernel interfaces are supported. `kexec_file_load` takes file
//! descriptors and lets the kernel parse and verify the image; the kernel and
//! initrd are staged in memfds so nothing touches disk. The older
//! `kexec_load` takes a table of raw memory segments and does no
//! verification at all.

use std::convert::Infallible;
use std::ffi::CString;
use std::io::{self, Read};
use std::os::fd::AsFd;

use anyhow::Context;
use camino::Utf8Path;
use clap::ValueEnum;
use fn_error_context::context;
use rustix::io::Errno;
use serde::Deserialize;

use btt_uki::BootAssets;

use crate::config::Config;

mod diagnose;
mod segments;
mod stage;
mod sys;

pub use diagnose::{Diagnostics, PermissionDenied};
pub use segments::{page_align, KexecSegment, LegacyLayout, PAGE_SIZE};
pub use sys::{KexecSyscalls, LinuxKexec, KEXEC_ARCH, KEXEC_FILE_LOAD_UNSAFE};

/// Which kexec interface to use.
#[derive(ValueEnum, Debug, Copy, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// `kexec_file_load`, with signature verification by the kernel (default)
    #[default]
    File,
    /// `kexec_load` with a fixed segment layout, for kernels without
    /// `CONFIG_KEXEC_FILE`
    Legacy,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::File => "file",
            Self::Legacy => "legacy",
        })
    }
}

/// Why loading or starting the new kernel failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `ENOSYS`
    #[error(
        "kexec support is disabled in the kernel (CONFIG_KEXEC not enabled); \
         install to disk and reboot through firmware instead"
    )]
    Unsupported,
    /// `EPERM`, with the diagnosed cause.
    #[error("{0}")]
    Permission(PermissionDenied),
    /// `EBUSY`
    #[error("kexec is busy (another kexec may be in progress)")]
    Busy,
    /// `EKEYREJECTED`
    #[error(
        "kernel signature verification failed (unsigned kernel with lockdown enabled); \
         use a signed image or boot with 'lockdown=none'"
    )]
    SignatureRejected,
    /// `ENOTSUP`
    #[error(
        "kexec_file_load not supported (old kernel or missing CONFIG_KEXEC_FILE); \
         set protocol = \"legacy\" in [kexec]"
    )]
    NotSupported,
    /// `EINVAL` from `kexec_load`
    #[error(
        "kexec_load rejected the segment layout; \
         check [kexec.legacy-layout] against this machine's memory map"
    )]
    InvalidArgument,
    /// Anything else.
    #[error("error loading kernel for kexec: {errno} (errno {}); check dmesg for details", .errno.raw_os_error())]
    UnknownSyscall {
        /// The raw error
        errno: Errno,
    },
    /// Preparing the payloads failed before any syscall was made.
    #[error("staging {what}")]
    Staging {
        /// Which payload
        what: &'static str,
        /// The underlying error
        #[source]
        source: io::Error,
    },
    /// The image loaded, but the reboot into it failed.
    #[error("reboot with kexec failed: {0}")]
    Reboot(Errno),
}

impl Error {
    fn staging(what: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Staging { what, source }
    }
}

/// Join the image command line with extra arguments: image first, then each
/// extra in order, separated by single spaces, skipping empty parts.
pub fn join_cmdline<S: AsRef<str>>(image: &str, extra: &[S]) -> String {
    std::iter::once(image)
        .chain(extra.iter().map(|s| s.as_ref()))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Loads kernels through a [`KexecSyscalls`] implementation.
#[derive(Debug)]
pub struct Loader<S = LinuxKexec> {
    sys: S,
    protocol: Protocol,
    layout: LegacyLayout,
    diagnostics: Diagnostics,
}

impl Loader<LinuxKexec> {
    /// A loader for the running kernel, configured from `config`.
    pub fn host(config: &Config) -> anyhow::Result<Self> {
        let diagnostics = Diagnostics::host(&config.efi.efivars_path)
            .context("Opening the root filesystem for diagnostics")?;
        Ok(Self::new(
            LinuxKexec,
            config.kexec.protocol,
            config.kexec.legacy_layout,
            diagnostics,
        ))
    }
}

impl<S: KexecSyscalls> Loader<S> {
    /// A loader with explicit parts.
    pub fn new(
        sys: S,
        protocol: Protocol,
        layout: LegacyLayout,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            sys,
            protocol,
            layout,
            diagnostics,
        }
    }

    /// Load `assets` as the kernel to switch to, without switching.
    pub fn load<X: AsRef<str>>(&self, assets: BootAssets, extra: &[X]) -> Result<(), Error> {
        let cmdline = join_cmdline(&assets.cmdline, extra);
        tracing::info!(protocol = %self.protocol, "cmdline: {cmdline}");
        let r = match self.protocol {
            Protocol::File => self.load_file(assets, &cmdline),
            Protocol::Legacy => self.load_segments(assets, &cmdline),
        };
        r?;
        tracing::info!("kexec loaded successfully");
        Ok(())
    }

    fn load_file(&self, assets: BootAssets, cmdline: &str) -> Result<(), Error> {
        let BootAssets {
            mut kernel,
            mut initrd,
            ..
        } = assets;
        let kernel = stage::memfd_from_reader("kernel", &mut kernel)
            .map_err(Error::staging("kernel"))?;
        let initrd = stage::memfd_from_reader("initramfs", &mut initrd)
            .map_err(Error::staging("initramfs"))?;
        let cmdline = if cmdline.is_empty() {
            None
        } else {
            Some(CString::new(cmdline).map_err(|e| Error::Staging {
                what: "cmdline",
                source: io::Error::new(io::ErrorKind::InvalidInput, e),
            })?)
        };

        let call = |flags: libc::c_ulong| {
            tracing::debug!(flags, "calling kexec_file_load");
            self.sys
                .kexec_file_load(kernel.as_fd(), initrd.as_fd(), cmdline.as_deref(), flags)
        };
        let r = match call(0) {
            Err(Errno::PERM) => {
                tracing::warn!(
                    "kexec_file_load failed with EPERM, retrying with KEXEC_FILE_LOAD_UNSAFE"
                );
                call(KEXEC_FILE_LOAD_UNSAFE)
            }
            r => r,
        };
        r.map_err(|errno| self.classify(errno))
    }

    fn load_segments(&self, assets: BootAssets, cmdline: &str) -> Result<(), Error> {
        let BootAssets {
            mut kernel,
            mut initrd,
            ..
        } = assets;
        let mut kbuf = Vec::new();
        kernel
            .read_to_end(&mut kbuf)
            .map_err(Error::staging("kernel"))?;
        let mut ibuf = Vec::new();
        initrd
            .read_to_end(&mut ibuf)
            .map_err(Error::staging("initramfs"))?;
        let cbuf = CString::new(cmdline)
            .map_err(|e| Error::Staging {
                what: "cmdline",
                source: io::Error::new(io::ErrorKind::InvalidInput, e),
            })?
            .into_bytes_with_nul();

        let segments = self.layout.segments(&kbuf, &ibuf, &cbuf);
        tracing::debug!(
            kernel = kbuf.len(),
            initrd = ibuf.len(),
            cmdline = cbuf.len(),
            "calling kexec_load"
        );
        self.sys
            .kexec_load(&segments, KEXEC_ARCH)
            .map_err(|errno| self.classify(errno))
    }

    /// Map a syscall error to its operator-facing meaning.
    pub fn classify(&self, errno: Errno) -> Error {
        tracing::debug!(%errno, "kexec failed");
        match errno {
            Errno::NOSYS => Error::Unsupported,
            Errno::PERM => Error::Permission(self.diagnostics.permission_denied()),
            Errno::BUSY => Error::Busy,
            Errno::KEYREJECTED => Error::SignatureRejected,
            Errno::NOTSUP => Error::NotSupported,
            Errno::INVAL if self.protocol == Protocol::Legacy => Error::InvalidArgument,
            errno => Error::UnknownSyscall { errno },
        }
    }

    /// Reboot into the loaded kernel.
    ///
    /// On success the running system is gone; the call only returns with an
    /// error.
    pub fn transition(&self) -> Result<Infallible, Error> {
        tracing::info!("rebooting into the loaded kernel");
        self.sys.reboot_kexec().map_err(Error::Reboot)?;
        // The kernel is being replaced; wait for it.
        loop {
            std::thread::park();
        }
    }

    /// [`Self::load`] followed by [`Self::transition`].
    pub fn load_and_transition<X: AsRef<str>>(
        &self,
        assets: BootAssets,
        extra: &[X],
    ) -> Result<Infallible, Error> {
        self.load(assets, extra)?;
        self.transition()
    }
}

/// Boot the UKI at `path` in place of the running kernel.
#[context("Booting {path} with kexec")]
pub fn kexec_uki<X: AsRef<str>>(
    config: &Config,
    path: &Utf8Path,
    extra: &[X],
) -> anyhow::Result<Infallible> {
    let assets = btt_uki::extract(path)?.into_boot_assets()?;
    let loader = Loader::host(config)?;
    Ok(loader.load_and_transition(assets, extra)?)
}
