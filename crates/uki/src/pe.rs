//! Just enough of the PE/COFF format to walk a section table.
//!
//! We never map or relocate the image; all we need is where each named
//! section lives in the file and how many bytes of it are real payload.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use crate::Error;

/// DOS header magic "MZ"
const DOS_MAGIC: &[u8; 2] = b"MZ";
/// Size of the DOS header we read; `e_lfanew` is its last field.
const DOS_HEADER_SIZE: usize = 64;
/// Offset of `e_lfanew`, the file offset of the PE signature.
const PE_POINTER_OFFSET: usize = 0x3c;
/// PE signature "PE\0\0"
const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
/// PE signature followed by the COFF file header.
const PE_HEADER_SIZE: usize = 4 + 20;
const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;
const SECTION_HEADER_SIZE: usize = 40;
/// The loader limit from the PE specification.
const MAX_SECTIONS: u16 = 96;

fn le_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn le_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

/// Like `read_exact_at`, but a short file is a format problem, not an I/O one.
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64, what: &str) -> Result<(), Error> {
    file.read_exact_at(buf, offset).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Format(format!("truncated {what}")),
        _ => Error::Io(e),
    })
}

/// One entry of the section table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SectionHeader {
    name: [u8; 8],
    virtual_size: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
}

impl SectionHeader {
    fn parse(b: &[u8]) -> Self {
        let mut name = [0u8; 8];
        name.copy_from_slice(&b[..8]);
        Self {
            name,
            virtual_size: le_u32(b, 8),
            size_of_raw_data: le_u32(b, 16),
            pointer_to_raw_data: le_u32(b, 20),
        }
    }

    /// The section name with its NUL padding removed.
    pub(crate) fn name(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .rposition(|&c| c != 0)
            .map_or(0, |i| i + 1);
        &self.name[..end]
    }

    /// File offset of the section data.
    pub(crate) fn offset(&self) -> u64 {
        self.pointer_to_raw_data.into()
    }

    /// Number of payload bytes in this section.
    ///
    /// The on-disk size is rounded up to the file alignment, so the padding
    /// would leak into a kernel or initrd if we used it. `VirtualSize` is the
    /// real length, capped by what is actually present in the file.
    pub(crate) fn payload_len(&self) -> u64 {
        if self.virtual_size == 0 {
            self.size_of_raw_data.into()
        } else {
            self.virtual_size.min(self.size_of_raw_data).into()
        }
    }
}

/// The parsed section table of a PE image.
#[derive(Debug)]
pub(crate) struct SectionTable {
    pub(crate) sections: Vec<SectionHeader>,
    file_len: u64,
}

impl SectionTable {
    /// The first section with the given name.
    pub(crate) fn find(&self, name: &str) -> Option<&SectionHeader> {
        self.sections.iter().find(|s| s.name() == name.as_bytes())
    }

    /// Verify the payload of `section` is entirely contained in the file.
    pub(crate) fn check_bounds(&self, section: &SectionHeader, name: &str) -> Result<(), Error> {
        let end = section.offset() + section.payload_len();
        if end > self.file_len {
            return Err(Error::Format(format!(
                "section {name} ends at {end}, past the end of the {} byte file",
                self.file_len
            )));
        }
        Ok(())
    }
}

/// Parse the headers of the PE image in `file` and return its section table.
pub(crate) fn read_section_table(file: &File) -> Result<SectionTable, Error> {
    let file_len = file.metadata()?.len();

    let mut dos = [0u8; DOS_HEADER_SIZE];
    read_exact_at(file, &mut dos, 0, "DOS header")?;
    if &dos[..2] != DOS_MAGIC {
        return Err(Error::Format("missing MZ signature".into()));
    }
    let pe_offset = u64::from(le_u32(&dos, PE_POINTER_OFFSET));

    let mut pe = [0u8; PE_HEADER_SIZE];
    read_exact_at(file, &mut pe, pe_offset, "PE header")?;
    if &pe[..4] != PE_SIGNATURE {
        return Err(Error::Format(format!(
            "missing PE signature at offset {pe_offset:#x}"
        )));
    }
    let coff = &pe[4..];
    let nsections = le_u16(coff, 2);
    let optional_header_size = le_u16(coff, 16);
    if nsections > MAX_SECTIONS {
        return Err(Error::Format(format!("too many sections: {nsections}")));
    }

    let optional_header_offset = pe_offset + PE_HEADER_SIZE as u64;
    if optional_header_size >= 2 {
        let mut magic = [0u8; 2];
        read_exact_at(file, &mut magic, optional_header_offset, "optional header")?;
        let magic = u16::from_le_bytes(magic);
        if magic != PE32_MAGIC && magic != PE32_PLUS_MAGIC {
            return Err(Error::Format(format!(
                "unknown optional header magic {magic:#x}"
            )));
        }
    }

    let table_offset = optional_header_offset + u64::from(optional_header_size);
    let mut table = vec![0u8; usize::from(nsections) * SECTION_HEADER_SIZE];
    read_exact_at(file, &mut table, table_offset, "section table")?;
    let sections = table
        .chunks_exact(SECTION_HEADER_SIZE)
        .map(SectionHeader::parse)
        .collect::<Vec<_>>();
    tracing::trace!(count = sections.len(), "read PE section table");
    Ok(SectionTable { sections, file_len })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::testutil;

    fn parse(buf: &[u8]) -> Result<SectionTable, Error> {
        let mut tf = tempfile::tempfile()?;
        tf.write_all(buf)?;
        read_section_table(&tf)
    }

    #[test]
    fn test_section_names_trimmed() {
        let img = testutil::build_pe(&[(".linux", b"kernel"), (".sbat", b"sbat,1")], 0);
        let table = parse(&img).unwrap();
        let names = table
            .sections
            .iter()
            .map(|s| String::from_utf8_lossy(s.name()).into_owned())
            .collect::<Vec<_>>();
        similar_asserts::assert_eq!(names, [".linux", ".sbat"]);
        let linux = table.find(".linux").unwrap();
        assert_eq!(linux.payload_len(), 6);
        assert_eq!(linux.offset() % testutil::FILE_ALIGNMENT as u64, 0);
        assert!(table.find(".linu").is_none());
    }

    #[test]
    fn test_payload_len() {
        let mut h = SectionHeader {
            name: *b".cmdline",
            virtual_size: 13,
            size_of_raw_data: 512,
            pointer_to_raw_data: 1024,
        };
        assert_eq!(h.payload_len(), 13);
        // Only what is present in the file counts
        h.virtual_size = 4096;
        assert_eq!(h.payload_len(), 512);
        h.virtual_size = 0;
        assert_eq!(h.payload_len(), 512);
        // All eight bytes used, no padding to trim
        assert_eq!(h.name(), b".cmdline");
    }

    #[test]
    fn test_not_pe() {
        let e = parse(b"not a PE file").unwrap_err();
        assert!(matches!(e, Error::Format(_)), "{e}");

        let mut img = testutil::build_pe(&[(".linux", b"k")], 0);
        img[0] = b'Z';
        let e = parse(&img).unwrap_err();
        assert!(matches!(e, Error::Format(ref m) if m.contains("MZ")), "{e}");

        let mut img = testutil::build_pe(&[(".linux", b"k")], 0);
        img[64] = b'X';
        let e = parse(&img).unwrap_err();
        assert!(matches!(e, Error::Format(ref m) if m.contains("PE signature")), "{e}");
    }

    #[test]
    fn test_truncated_section_table() {
        let img = testutil::build_pe(&[(".linux", b"k"), (".initrd", b"i")], 0);
        // Cut the file in the middle of the second section header
        let cut = 64 + 24 + 112 + 40 + 20;
        let e = parse(&img[..cut]).unwrap_err();
        assert!(matches!(e, Error::Format(ref m) if m.contains("section table")), "{e}");
    }

    #[test]
    fn test_bounds() {
        let img = testutil::build_pe(&[(".linux", &[b'K'; 700])], 0);
        let table = parse(&img[..img.len() - 512]).unwrap();
        let linux = table.find(".linux").unwrap();
        assert!(table.check_bounds(linux, ".linux").is_err());
    }
}
