//! Builders for minimal PE images used by the tests.

use std::path::Path;

use camino::Utf8PathBuf;

/// File alignment used by the builder; every section's raw data is padded to it.
pub(crate) const FILE_ALIGNMENT: usize = 512;

fn align(n: usize) -> usize {
    n.div_ceil(FILE_ALIGNMENT) * FILE_ALIGNMENT
}

/// Build a PE32+ image holding the given sections in order.
///
/// The raw data of each section is padded with `pad` up to the file
/// alignment, so a reader that honours the on-disk size rather than
/// `VirtualSize` sees those bytes.
pub(crate) fn build_pe(sections: &[(&str, &[u8])], pad: u8) -> Vec<u8> {
    let nsections = sections.len();
    let header_size = 64 + 4 + 20 + 112 + nsections * 40;
    let data_start = align(header_size);

    let mut out = vec![0u8; data_start];
    // DOS header
    out[0..2].copy_from_slice(b"MZ");
    out[0x3c..0x40].copy_from_slice(&64u32.to_le_bytes());
    // PE signature
    out[64..68].copy_from_slice(b"PE\0\0");
    // COFF header
    let coff = 68;
    out[coff..coff + 2].copy_from_slice(&0x8664u16.to_le_bytes());
    out[coff + 2..coff + 4].copy_from_slice(&(nsections as u16).to_le_bytes());
    out[coff + 16..coff + 18].copy_from_slice(&112u16.to_le_bytes());
    out[coff + 18..coff + 20].copy_from_slice(&0x22u16.to_le_bytes());
    // Optional header, PE32+
    let opt = coff + 20;
    out[opt..opt + 2].copy_from_slice(&0x20bu16.to_le_bytes());

    let mut offset = data_start;
    let mut data = Vec::new();
    for (i, (name, payload)) in sections.iter().enumerate() {
        let hdr = opt + 112 + i * 40;
        let raw_size = align(payload.len());
        out[hdr..hdr + name.len()].copy_from_slice(name.as_bytes());
        out[hdr + 8..hdr + 12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        out[hdr + 12..hdr + 16].copy_from_slice(&(offset as u32).to_le_bytes());
        out[hdr + 16..hdr + 20].copy_from_slice(&(raw_size as u32).to_le_bytes());
        out[hdr + 20..hdr + 24].copy_from_slice(&(offset as u32).to_le_bytes());
        data.extend_from_slice(payload);
        data.resize(data.len() + raw_size - payload.len(), pad);
        offset += raw_size;
    }
    out.extend(data);
    out
}

/// Write a UKI with the three standard sections into `dir`.
pub(crate) fn write_uki(dir: &Path, kernel: &[u8], initrd: &[u8], cmdline: &[u8]) -> Utf8PathBuf {
    write_pe(
        dir,
        "test.efi",
        &[(".linux", kernel), (".initrd", initrd), (".cmdline", cmdline)],
    )
}

/// Write an arbitrary PE image into `dir`.
pub(crate) fn write_pe(dir: &Path, name: &str, sections: &[(&str, &[u8])]) -> Utf8PathBuf {
    let path = Utf8PathBuf::from_path_buf(dir.join(name)).unwrap();
    std::fs::write(&path, build_pe(sections, 0)).unwrap();
    path
}
