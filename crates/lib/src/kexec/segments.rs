//! Segment layout for the legacy `kexec_load` interface.

use anyhow::{ensure, Result};
use serde::Deserialize;

/// Page size assumed for segment placement.
pub const PAGE_SIZE: u64 = 4096;
const FOUR_GIB: u64 = 1 << 32;

/// One piece of memory handed to `kexec_load`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KexecSegment<'a> {
    /// Source bytes in our address space
    pub buf: &'a [u8],
    /// Physical destination address
    pub mem: u64,
    /// Bytes reserved at `mem`; never less than `buf.len()`
    pub memsz: u64,
}

impl<'a> KexecSegment<'a> {
    /// Place `buf` at `mem`, reserving whole pages.
    pub fn new(buf: &'a [u8], mem: u64) -> Self {
        Self {
            buf,
            mem,
            memsz: page_align(buf.len().max(1) as u64),
        }
    }
}

/// Round `n` up to a multiple of [`PAGE_SIZE`].
pub fn page_align(n: u64) -> u64 {
    n.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Physical addresses at which the legacy protocol places its segments.
///
/// These assume a conventional PC memory map: the kernel at 1 MiB, the
/// initrd at 768 MiB and the command line in low memory. Machines with holes
/// in those ranges need different values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct LegacyLayout {
    /// Kernel image destination
    pub kernel_address: u64,
    /// Initial ramdisk destination; must stay below 4 GiB
    pub initrd_address: u64,
    /// NUL terminated command line destination
    pub cmdline_address: u64,
}

impl Default for LegacyLayout {
    fn default() -> Self {
        Self {
            kernel_address: 0x100000,
            initrd_address: 0x30000000,
            cmdline_address: 0x90000,
        }
    }
}

impl LegacyLayout {
    /// Check that every address is page aligned, below 4 GiB, and distinct.
    pub fn validate(&self) -> Result<()> {
        let addrs = [
            ("kernel-address", self.kernel_address),
            ("initrd-address", self.initrd_address),
            ("cmdline-address", self.cmdline_address),
        ];
        for (name, addr) in addrs {
            ensure!(addr % PAGE_SIZE == 0, "{name} {addr:#x} is not page aligned");
            ensure!(addr < FOUR_GIB, "{name} {addr:#x} is not below 4 GiB");
        }
        for (i, (a, av)) in addrs.iter().enumerate() {
            for (b, bv) in &addrs[i + 1..] {
                ensure!(av != bv, "{a} and {b} are both {av:#x}");
            }
        }
        Ok(())
    }

    /// The kernel, initrd and command line segments, in that order.
    ///
    /// Overlap between the resulting ranges is not checked here; the kernel
    /// rejects such a table with `EINVAL`.
    pub fn segments<'a>(
        &self,
        kernel: &'a [u8],
        initrd: &'a [u8],
        cmdline: &'a [u8],
    ) -> [KexecSegment<'a>; 3] {
        [
            KexecSegment::new(kernel, self.kernel_address),
            KexecSegment::new(initrd, self.initrd_address),
            KexecSegment::new(cmdline, self.cmdline_address),
        ]
    }
}
