//! Staging payloads in anonymous memory files for `kexec_file_load`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use rustix::fs::MemfdFlags;

/// Copy `src` into a new close-on-exec memfd named `name`, rewound to the start.
pub(crate) fn memfd_from_reader(name: &str, src: &mut dyn Read) -> io::Result<File> {
    let fd = rustix::fs::memfd_create(name, MemfdFlags::CLOEXEC)?;
    let mut f = File::from(fd);
    let n = io::copy(src, &mut f)?;
    f.seek(SeekFrom::Start(0))?;
    tracing::debug!(name, bytes = n, "staged in memfd");
    Ok(f)
}
