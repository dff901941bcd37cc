//! Reading and patching Unified Kernel Images.
//!
//! A UKI is a PE executable carrying the kernel, the initial ramdisk and the
//! kernel command line as named sections. This crate finds those sections
//! and hands them out as lazy, bounded byte streams over a single open file,
//! so nothing is copied until a consumer actually reads.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;

use camino::{Utf8Path, Utf8PathBuf};

mod pe;
mod section;
#[cfg(test)]
mod testutil;

use section::ImageHandle;
pub use section::SectionReader;

/// Section holding the kernel image.
pub const SECTION_KERNEL: &str = ".linux";
/// Section holding the initial ramdisk.
pub const SECTION_INITRD: &str = ".initrd";
/// Section holding the NUL-padded kernel command line.
pub const SECTION_CMDLINE: &str = ".cmdline";

const REQUIRED_SECTIONS: [&str; 3] = [SECTION_KERNEL, SECTION_INITRD, SECTION_CMDLINE];

/// Errors from reading or patching an image.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The file could not be opened.
    #[error("opening {path}")]
    Open {
        /// The image path
        path: Utf8PathBuf,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },
    /// The file is not a well-formed PE image.
    #[error("invalid PE image: {0}")]
    Format(String),
    /// One or more required sections are absent; all of them are listed.
    #[error("required sections not found in PE image: {}", .0.join(", "))]
    MissingSections(Vec<&'static str>),
    /// A replacement command line does not fit the existing section.
    #[error("new cmdline too long: {len} bytes, max {max} bytes")]
    PayloadTooLarge {
        /// Length of the rejected value
        len: usize,
        /// Space available in the section
        max: u64,
    },
    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Turn the raw contents of a `.cmdline` section into a usable string:
/// trailing NUL padding and surrounding whitespace are removed.
pub fn decode_cmdline(raw: &[u8]) -> String {
    let end = raw.iter().rposition(|&c| c != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&raw[..end]).trim().to_owned()
}

/// The three payload streams of a UKI.
///
/// They share one file handle, which stays open until every stream has been
/// closed or dropped.
#[derive(Debug)]
pub struct UkiAssets {
    /// The `.linux` section
    pub kernel: SectionReader,
    /// The `.initrd` section
    pub initrd: SectionReader,
    /// The raw `.cmdline` section, NUL padding included
    pub cmdline: SectionReader,
}

impl UkiAssets {
    /// Read and decode the command line, producing the form consumed by the kexec loader.
    pub fn into_boot_assets(self) -> Result<BootAssets, Error> {
        let Self {
            kernel,
            initrd,
            mut cmdline,
        } = self;
        let mut raw = Vec::new();
        cmdline.read_to_end(&mut raw)?;
        cmdline.close();
        Ok(BootAssets::new(kernel, initrd, decode_cmdline(&raw)))
    }

    /// Release all three streams, closing the image file.
    pub fn close(mut self) {
        self.kernel.close();
        self.initrd.close();
        self.cmdline.close();
    }
}

/// A kernel, an initrd and a command line ready to be booted.
///
/// Any image source can produce this; the streams are read exactly once, by
/// the loader.
pub struct BootAssets {
    /// Kernel image stream
    pub kernel: Box<dyn Read + Send>,
    /// Initial ramdisk stream
    pub initrd: Box<dyn Read + Send>,
    /// Decoded, trimmed command line embedded in the image
    pub cmdline: String,
}

impl BootAssets {
    /// Bundle two streams and a command line.
    pub fn new(
        kernel: impl Read + Send + 'static,
        initrd: impl Read + Send + 'static,
        cmdline: impl Into<String>,
    ) -> Self {
        Self {
            kernel: Box::new(kernel),
            initrd: Box::new(initrd),
            cmdline: cmdline.into(),
        }
    }
}

impl fmt::Debug for BootAssets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootAssets")
            .field("cmdline", &self.cmdline)
            .finish_non_exhaustive()
    }
}

fn open(path: &Utf8Path, write: bool) -> Result<File, Error> {
    OpenOptions::new()
        .read(true)
        .write(write)
        .open(path)
        .map_err(|source| Error::Open {
            path: path.to_owned(),
            source,
        })
}

/// Locate the kernel, initrd and cmdline sections of the UKI at `path`.
///
/// Either all three are returned or none: if any is missing the file is
/// closed and the error names every absent section.
pub fn extract(path: &Utf8Path) -> Result<UkiAssets, Error> {
    let file = open(path, false)?;
    let table = pe::read_section_table(&file)?;
    let image = ImageHandle::new(file, path);

    let mut found: [Option<SectionReader>; 3] = Default::default();
    for header in &table.sections {
        let Some(idx) = REQUIRED_SECTIONS
            .iter()
            .position(|n| n.as_bytes() == header.name())
        else {
            continue;
        };
        let name = REQUIRED_SECTIONS[idx];
        if found[idx].is_some() {
            tracing::debug!(section = name, "ignoring duplicate section");
            continue;
        }
        table.check_bounds(header, name)?;
        tracing::debug!(
            section = name,
            offset = header.offset(),
            len = header.payload_len(),
            "found section"
        );
        found[idx] = Some(SectionReader::new(
            &image,
            name,
            header.offset(),
            header.payload_len(),
        ));
    }

    match found {
        [Some(kernel), Some(initrd), Some(cmdline)] => Ok(UkiAssets {
            kernel,
            initrd,
            cmdline,
        }),
        found => {
            let missing = REQUIRED_SECTIONS
                .iter()
                .zip(&found)
                .filter(|(_, r)| r.is_none())
                .map(|(n, _)| *n)
                .collect();
            // Dropping `found` and `image` here closes the file.
            Err(Error::MissingSections(missing))
        }
    }
}

/// Read just the command line of the UKI at `path`.
pub fn read_cmdline(path: &Utf8Path) -> Result<String, Error> {
    let file = open(path, false)?;
    let table = pe::read_section_table(&file)?;
    let section = table
        .find(SECTION_CMDLINE)
        .ok_or_else(|| Error::MissingSections(vec![SECTION_CMDLINE]))?;
    table.check_bounds(section, SECTION_CMDLINE)?;
    let mut raw = vec![0u8; usize::try_from(section.payload_len()).map_err(std::io::Error::other)?];
    file.read_exact_at(&mut raw, section.offset())?;
    Ok(decode_cmdline(&raw))
}

/// Overwrite the command line of the UKI at `path` in place.
///
/// Section layout is fixed, so the new value must fit in the existing
/// payload; the remainder is zero filled. On any error the file is left
/// untouched.
pub fn patch_cmdline(path: &Utf8Path, cmdline: &str) -> Result<(), Error> {
    let file = open(path, true)?;
    let table = pe::read_section_table(&file)?;
    let section = table
        .find(SECTION_CMDLINE)
        .ok_or_else(|| Error::MissingSections(vec![SECTION_CMDLINE]))?;
    table.check_bounds(section, SECTION_CMDLINE)?;

    let max = section.payload_len();
    let len = cmdline.len();
    if len as u64 > max {
        return Err(Error::PayloadTooLarge { len, max });
    }
    let mut buf = vec![0u8; usize::try_from(max).map_err(std::io::Error::other)?];
    buf[..len].copy_from_slice(cmdline.as_bytes());
    file.write_all_at(&buf, section.offset())?;
    file.sync_data()?;
    tracing::info!(%path, len, max, "patched cmdline");
    Ok(())
}
