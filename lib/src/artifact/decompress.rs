//! Per-entry decompression, auto-detected from magic bytes.

use std::io::{Cursor, Read};

use anyhow::Result;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const XZ_MAGIC: &[u8] = &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Format {
    Plain,
    Gzip,
    Xz,
    Zstd,
}

pub(crate) fn detect(magic: &[u8]) -> Format {
    if magic.starts_with(GZIP_MAGIC) {
        Format::Gzip
    } else if magic.starts_with(XZ_MAGIC) {
        Format::Xz
    } else if magic.starts_with(ZSTD_MAGIC) {
        Format::Zstd
    } else {
        Format::Plain
    }
}

/// Wrap `src` in the decompressor its leading bytes call for; data with no
/// known magic passes through unchanged.
pub(crate) fn decompress<'a>(mut src: impl Read + 'a) -> Result<Box<dyn Read + 'a>> {
    // Peek the longest magic, then stitch the peeked bytes back on
    let mut magic = [0u8; 6];
    let mut filled = 0;
    while filled < magic.len() {
        let n = src.read(&mut magic[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let head = Cursor::new(magic[..filled].to_vec());
    let chained = head.chain(src);
    Ok(match detect(&magic[..filled]) {
        Format::Gzip => Box::new(flate2::read::GzDecoder::new(chained)),
        Format::Xz => Box::new(xz2::read::XzDecoder::new(chained)),
        Format::Zstd => Box::new(zstd::stream::read::Decoder::new(chained)?),
        Format::Plain => Box::new(chained),
    })
}
