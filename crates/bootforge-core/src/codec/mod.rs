//! Kernel compression detection and decompression.
//!
//! Boot image kernels are usually shipped compressed. This module recognizes
//! the formats the Linux build system produces and reverses them.
//!
//! ## Trailing data
//!
//! Segments inside a boot image are padded to a page boundary, and some build
//! systems append a size word after the stream. Every decoder here stops at the
//! stream's own end marker and leaves whatever follows untouched:
//!
//! | format     | end of stream                                   |
//! |------------|-------------------------------------------------|
//! | gzip       | first member trailer (CRC32 + ISIZE)            |
//! | xz         | stream footer, no concatenated streams          |
//! | bzip2      | end-of-stream marker of the first stream        |
//! | zstd       | end of the first frame                          |
//! | lz4-legacy | zero chunk length, end of input, or size word   |
//! | lzo        | zero-length terminator block of the lzop file   |

mod lz4;
mod lzo;

use crate::error::{Error, Result};
use liblzma::stream::{Action, Status, Stream};
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::sync::OnceLock;
use tracing::{debug, trace};

/// Default ceiling for decompressed output (decompression bomb guard)
pub const DEFAULT_MAX_DECOMPRESSED_SIZE: usize = 512 * 1024 * 1024;

const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];
const XZ_MAGIC: &[u8] = &[0xFD, b'7', b'z', b'X', b'Z', 0x00];
const BZIP2_MAGIC: &[u8] = b"BZh";
const LZ4_LEGACY_MAGIC: &[u8] = &[0x02, 0x21, 0x4C, 0x18];
const LZO_MAGIC: &[u8] = &[0x89, b'L', b'Z', b'O'];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xB5, 0x2F, 0xFD];

/// Signatures strong enough to trust in the middle of arbitrary data.
///
/// The short magics used by [`detect`] collide with ordinary bytes far too
/// often for a scan, so each one is extended with the bytes that always
/// follow it in practice (deflate method, bzip2 block header, full lzop magic).
const SIGNATURE_PATTERN: &str = concat!(
    r"(?-u)\x1F\x8B\x08",
    r"|\xFD7zXZ\x00",
    r"|BZh[1-9]1AY&SY",
    r"|\x02\x21\x4C\x18",
    r"|\x89LZO\x00\r\n\x1A\n",
    r"|\x28\xB5\x2F\xFD",
);

/// Compression format of a kernel (or any other segment)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionKind {
    /// Not compressed, or an unknown format
    None,
    /// gzip (deflate)
    Gzip,
    /// xz (LZMA2)
    Xz,
    /// bzip2
    Bzip2,
    /// LZ4 legacy frame format, as produced by `lz4 -l`
    Lz4Legacy,
    /// lzop container with LZO1X blocks
    Lzo,
    /// Zstandard
    Zstd,
}

impl CompressionKind {
    /// All compressed formats, in detection order
    pub const COMPRESSED: [CompressionKind; 6] = [
        CompressionKind::Gzip,
        CompressionKind::Xz,
        CompressionKind::Bzip2,
        CompressionKind::Lz4Legacy,
        CompressionKind::Lzo,
        CompressionKind::Zstd,
    ];

    /// Leading magic bytes for this format (empty for [`CompressionKind::None`])
    pub fn magic(&self) -> &'static [u8] {
        match self {
            CompressionKind::None => &[],
            CompressionKind::Gzip => GZIP_MAGIC,
            CompressionKind::Xz => XZ_MAGIC,
            CompressionKind::Bzip2 => BZIP2_MAGIC,
            CompressionKind::Lz4Legacy => LZ4_LEGACY_MAGIC,
            CompressionKind::Lzo => LZO_MAGIC,
            CompressionKind::Zstd => ZSTD_MAGIC,
        }
    }

    /// Returns the short lowercase name of the format
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionKind::None => "none",
            CompressionKind::Gzip => "gzip",
            CompressionKind::Xz => "xz",
            CompressionKind::Bzip2 => "bzip2",
            CompressionKind::Lz4Legacy => "lz4-legacy",
            CompressionKind::Lzo => "lzo",
            CompressionKind::Zstd => "zstd",
        }
    }

    /// Returns true for every format except [`CompressionKind::None`]
    pub fn is_compressed(&self) -> bool {
        !matches!(self, CompressionKind::None)
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detect the compression format from the leading magic bytes.
///
/// Reads at most six bytes. Anything unrecognized, including an empty
/// buffer, is [`CompressionKind::None`].
pub fn detect(data: &[u8]) -> CompressionKind {
    CompressionKind::COMPRESSED
        .into_iter()
        .find(|kind| data.starts_with(kind.magic()))
        .unwrap_or(CompressionKind::None)
}

/// Find the earliest strong compression signature at or after `from`.
///
/// Returns the absolute offset and the detected format.
pub fn find_signature(data: &[u8], from: usize) -> Option<(usize, CompressionKind)> {
    static SIGNATURES: OnceLock<Regex> = OnceLock::new();
    let signatures = SIGNATURES
        .get_or_init(|| Regex::new(SIGNATURE_PATTERN).expect("signature pattern is valid"));

    if from >= data.len() {
        return None;
    }

    let found = signatures.find(&data[from..])?;
    let offset = from + found.start();
    let kind = detect(&data[offset..]);
    trace!("Found {} signature at offset {:#x}", kind, offset);
    Some((offset, kind))
}

/// Decompress `data` as `kind` with the default output ceiling.
///
/// [`CompressionKind::None`] returns a copy of the input.
pub fn decompress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    decompress_bounded(data, kind, DEFAULT_MAX_DECOMPRESSED_SIZE)
}

/// Decompress `data` as `kind`, refusing to produce more than `limit` bytes.
pub fn decompress_bounded(data: &[u8], kind: CompressionKind, limit: usize) -> Result<Vec<u8>> {
    debug!("Decompressing {} bytes as {}", data.len(), kind);

    let output = match kind {
        CompressionKind::None => data.to_vec(),
        CompressionKind::Gzip => read_bounded(flate2::read::GzDecoder::new(data), kind, limit)?,
        CompressionKind::Bzip2 => read_bounded(bzip2::read::BzDecoder::new(data), kind, limit)?,
        CompressionKind::Zstd => {
            let decoder = zstd::stream::read::Decoder::with_buffer(data)
                .map_err(|e| Error::decompression(kind, 0, e.to_string()))?
                .single_frame();
            read_bounded(decoder, kind, limit)?
        }
        CompressionKind::Xz => decode_xz(data, limit)?,
        CompressionKind::Lz4Legacy => lz4::decompress(data, limit)?,
        CompressionKind::Lzo => lzo::decompress(data, limit)?,
    };

    debug!("Decompressed {} -> {} bytes", data.len(), output.len());
    Ok(output)
}

/// Drain a streaming decoder, failing once output passes `limit`
fn read_bounded<R: Read>(reader: R, kind: CompressionKind, limit: usize) -> Result<Vec<u8>> {
    // One byte past the limit is enough to tell "exactly at" from "over"
    let ceiling = u64::try_from(limit).map_or(u64::MAX, |l| l.saturating_add(1));
    let mut output = Vec::new();
    reader
        .take(ceiling)
        .read_to_end(&mut output)
        .map_err(|e| Error::decompression(kind, 0, e.to_string()))?;

    if output.len() > limit {
        return Err(Error::resource("decompression", output.len(), limit));
    }
    Ok(output)
}

/// Decode exactly one xz stream.
///
/// The stream decoder is created without `LZMA_CONCATENATED`, so it reports
/// `StreamEnd` at the first footer and never looks at the padding after it.
fn decode_xz(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    const CHUNK: usize = 64 * 1024;
    let kind = CompressionKind::Xz;

    let mut stream = Stream::new_stream_decoder(u64::MAX, 0)
        .map_err(|e| Error::decompression(kind, 0, e.to_string()))?;
    let mut output: Vec<u8> = Vec::with_capacity(data.len().saturating_mul(3).clamp(CHUNK, limit.max(CHUNK)));

    loop {
        let consumed = stream.total_in() as usize;
        let input = &data[consumed.min(data.len())..];
        let action = if input.is_empty() { Action::Finish } else { Action::Run };

        if output.len() == output.capacity() {
            output.reserve(output.capacity().clamp(CHUNK, 64 * 1024 * 1024));
        }

        let produced_before = output.len();
        let status = stream
            .process_vec(input, &mut output, action)
            .map_err(|e| Error::decompression(kind, stream.total_in() as usize, e.to_string()))?;

        if output.len() > limit {
            return Err(Error::resource("decompression", output.len(), limit));
        }

        if matches!(status, Status::StreamEnd) {
            trace!(
                "xz stream ended after {} of {} input bytes",
                stream.total_in(),
                data.len()
            );
            return Ok(output);
        }

        let progressed = stream.total_in() as usize != consumed || output.len() != produced_before;
        if !progressed && (input.is_empty() || output.len() < output.capacity()) {
            return Err(Error::decompression(
                kind,
                consumed,
                "stream truncated before its end marker",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PAYLOAD: &[u8] = b"Linux version 5.15.41-android13 (builder@host) #1 SMP PREEMPT\n";

    fn padded(mut stream: Vec<u8>) -> Vec<u8> {
        // Page padding as found after a segment inside a boot image
        stream.resize(stream.len() + 4096 - stream.len() % 4096, 0);
        stream
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_detect_each_format() {
        assert_eq!(detect(&[0x1F, 0x8B, 0x08, 0x00]), CompressionKind::Gzip);
        assert_eq!(detect(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, 0x00]), CompressionKind::Xz);
        assert_eq!(detect(b"BZh91AY&SY"), CompressionKind::Bzip2);
        assert_eq!(detect(&[0x02, 0x21, 0x4C, 0x18, 0x10]), CompressionKind::Lz4Legacy);
        assert_eq!(detect(&[0x89, 0x4C, 0x5A, 0x4F, 0x00, 0x0D]), CompressionKind::Lzo);
        assert_eq!(detect(&[0x28, 0xB5, 0x2F, 0xFD, 0x04]), CompressionKind::Zstd);
    }

    #[test]
    fn test_detect_unknown() {
        assert_eq!(detect(&[]), CompressionKind::None);
        assert_eq!(detect(&[0x1F]), CompressionKind::None);
        assert_eq!(detect(b"ANDROID!"), CompressionKind::None);
        assert_eq!(detect(&[0x13, 0x37, 0xC0, 0xDE, 0x42, 0x99]), CompressionKind::None);
    }

    #[test]
    fn test_find_signature() {
        let mut data = vec![0x41u8; 100];
        data.extend_from_slice(&gzip(PAYLOAD));
        assert_eq!(find_signature(&data, 0), Some((100, CompressionKind::Gzip)));
        assert_eq!(find_signature(&data, 101), None);
        // A bare "BZh" is too weak to count
        assert_eq!(find_signature(b"xxBZhxx", 0), None);
    }

    #[test]
    fn test_gzip_with_trailing_padding() {
        let data = padded(gzip(PAYLOAD));
        let out = decompress(&data, CompressionKind::Gzip).unwrap();
        assert_eq!(out, PAYLOAD);
    }

    #[test]
    fn test_gzip_bad_checksum() {
        let mut data = gzip(PAYLOAD);
        let crc_offset = data.len() - 8;
        data[crc_offset] ^= 0xFF;
        let err = decompress(&data, CompressionKind::Gzip).unwrap_err();
        assert!(matches!(err, Error::Decompression { kind: CompressionKind::Gzip, .. }));
    }

    #[test]
    fn test_xz_with_trailing_padding() {
        let mut encoder = liblzma::write::XzEncoder::new(Vec::new(), 6);
        encoder.write_all(PAYLOAD).unwrap();
        let data = padded(encoder.finish().unwrap());

        assert_eq!(detect(&data), CompressionKind::Xz);
        assert_eq!(decompress(&data, CompressionKind::Xz).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_xz_truncated() {
        let mut encoder = liblzma::write::XzEncoder::new(Vec::new(), 6);
        encoder.write_all(PAYLOAD).unwrap();
        let data = encoder.finish().unwrap();

        let err = decompress(&data[..data.len() / 2], CompressionKind::Xz).unwrap_err();
        assert!(matches!(err, Error::Decompression { kind: CompressionKind::Xz, .. }));
    }

    #[test]
    fn test_bzip2_with_trailing_padding() {
        let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        encoder.write_all(PAYLOAD).unwrap();
        let data = padded(encoder.finish().unwrap());

        assert_eq!(detect(&data), CompressionKind::Bzip2);
        assert_eq!(decompress(&data, CompressionKind::Bzip2).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_zstd_with_trailing_padding() {
        let data = padded(zstd::encode_all(PAYLOAD, 3).unwrap());

        assert_eq!(detect(&data), CompressionKind::Zstd);
        assert_eq!(decompress(&data, CompressionKind::Zstd).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_output_limit() {
        let data = gzip(&vec![0u8; 64 * 1024]);
        let err = decompress_bounded(&data, CompressionKind::Gzip, 1024).unwrap_err();
        assert!(matches!(err, Error::Resource { limit: 1024, .. }));
    }

    #[test]
    fn test_unbounded_limit_streams() {
        let mut bz = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        bz.write_all(PAYLOAD).unwrap();
        let streams = [
            (CompressionKind::Gzip, gzip(PAYLOAD)),
            (CompressionKind::Bzip2, bz.finish().unwrap()),
            (CompressionKind::Zstd, zstd::encode_all(PAYLOAD, 3).unwrap()),
        ];

        for (kind, data) in streams {
            let out = decompress_bounded(&padded(data), kind, usize::MAX).unwrap();
            assert_eq!(out, PAYLOAD, "{}", kind);
        }
    }

    #[test]
    fn test_limit_exactly_reached() {
        let data = gzip(PAYLOAD);
        let out = decompress_bounded(&data, CompressionKind::Gzip, PAYLOAD.len()).unwrap();
        assert_eq!(out.len(), PAYLOAD.len());
    }

    #[test]
    fn test_none_is_passthrough() {
        assert_eq!(decompress(PAYLOAD, CompressionKind::None).unwrap(), PAYLOAD);
    }
}
