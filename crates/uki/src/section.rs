//! Bounded read views over one shared image file handle.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

/// The open image file. Every [`SectionReader`] holds a strong reference,
/// and the file is closed when the last one goes away.
#[derive(Debug)]
pub(crate) struct ImageHandle {
    file: File,
    path: Utf8PathBuf,
}

impl ImageHandle {
    pub(crate) fn new(file: File, path: &Utf8Path) -> Arc<Self> {
        Arc::new(Self {
            file,
            path: path.to_owned(),
        })
    }
}

impl Drop for ImageHandle {
    fn drop(&mut self) {
        tracing::trace!(path = %self.path, "closing image");
    }
}

/// A lazy reader over the payload of one PE section.
///
/// Reads are positional, so several readers over the same image can be
/// consumed in any order or interleaved. Closing a reader only gives up
/// this reader's share of the underlying file; the others keep working.
#[derive(Debug)]
pub struct SectionReader {
    image: Option<Arc<ImageHandle>>,
    name: &'static str,
    start: u64,
    len: u64,
    pos: u64,
}

impl SectionReader {
    pub(crate) fn new(image: &Arc<ImageHandle>, name: &'static str, start: u64, len: u64) -> Self {
        Self {
            image: Some(Arc::clone(image)),
            name,
            start,
            len,
            pos: 0,
        }
    }

    /// The section name, e.g. `.linux`.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Total payload length in bytes, independent of how much was read.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True if the section has no payload at all.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Release this reader's reference to the image file.
    ///
    /// Calling this more than once is harmless.
    pub fn close(&mut self) {
        if self.image.take().is_some() {
            tracing::trace!(section = self.name, "closed section reader");
        }
    }

    /// Whether [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.image.is_none()
    }
}

impl Read for SectionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(image) = self.image.as_ref() else {
            return Err(io::Error::other(format!(
                "section {} has been closed",
                self.name
            )));
        };
        let remaining = self.len - self.pos;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let n = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let read = image.file.read_at(&mut buf[..n], self.start + self.pos)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} truncated while reading section {}", image.path, self.name),
            ));
        }
        self.pos += read as u64;
        Ok(read)
    }
}
