//! lzop container decoding.
//!
//! Kernels built with `CONFIG_KERNEL_LZO` are wrapped in the lzop file format:
//! a variable-length header followed by blocks of LZO1X data, terminated by a
//! block whose uncompressed length is zero. Integers are big-endian.

use super::CompressionKind;
use crate::error::{Error, Result};
use rust_lzo::{LZOContext, LZOError};
use tracing::trace;

const LZOP_MAGIC: &[u8] = &[0x89, b'L', b'Z', b'O', 0x00, 0x0D, 0x0A, 0x1A, 0x0A];

/// First lzop version whose header carries the extra version/level/mtime fields
const VERSION_EXTENDED_HEADER: u16 = 0x0940;

const F_ADLER32_D: u32 = 0x0000_0001;
const F_ADLER32_C: u32 = 0x0000_0002;
const F_H_EXTRA_FIELD: u32 = 0x0000_0040;
const F_CRC32_D: u32 = 0x0000_0100;
const F_CRC32_C: u32 = 0x0000_0200;
const F_H_FILTER: u32 = 0x0000_0800;

/// Largest block lzop will ever write
const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024;

/// Bounds-checked big-endian reader over the container
struct Cursor<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                Error::decompression(
                    CompressionKind::Lzo,
                    self.position,
                    format!("truncated: needed {} more bytes", len),
                )
            })?;
        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

pub(super) fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let kind = CompressionKind::Lzo;
    let mut cursor = Cursor::new(data);

    if cursor.take(LZOP_MAGIC.len())? != LZOP_MAGIC {
        return Err(Error::decompression(kind, 0, "bad lzop magic"));
    }

    let flags = read_header(&mut cursor)?;
    trace!("lzop header ends at {:#x}, flags {:#x}", cursor.position, flags);

    let mut output = Vec::new();
    loop {
        let block_offset = cursor.position;
        let dst_len = cursor.u32()? as usize;
        if dst_len == 0 {
            trace!("lzop terminator at {:#x}", block_offset);
            return Ok(output);
        }
        if dst_len > MAX_BLOCK_SIZE {
            return Err(Error::decompression(
                kind,
                block_offset,
                format!("block size {} exceeds lzop maximum", dst_len),
            ));
        }

        let src_len = cursor.u32()? as usize;
        let d_adler = if flags & F_ADLER32_D != 0 { Some(cursor.u32()?) } else { None };
        let d_crc = if flags & F_CRC32_D != 0 { Some(cursor.u32()?) } else { None };
        if src_len < dst_len {
            // Checksums of the compressed bytes, not worth verifying twice
            if flags & F_ADLER32_C != 0 {
                cursor.u32()?;
            }
            if flags & F_CRC32_C != 0 {
                cursor.u32()?;
            }
        }
        if src_len > dst_len {
            return Err(Error::decompression(
                kind,
                block_offset,
                format!("compressed block ({}) larger than its output ({})", src_len, dst_len),
            ));
        }

        let src_offset = cursor.position;
        let src = cursor.take(src_len)?;
        let start = output.len();

        if src_len == dst_len {
            // Stored block
            output.extend_from_slice(src);
        } else {
            output.resize(start + dst_len, 0);
            let (decoded, status) = LZOContext::decompress_to_slice(src, &mut output[start..]);
            let decoded_len = decoded.len();
            if !matches!(status, LZOError::OK) || decoded_len != dst_len {
                return Err(Error::decompression(
                    kind,
                    src_offset,
                    format!("lzo1x block rejected ({} of {} bytes decoded)", decoded_len, dst_len),
                ));
            }
        }

        let block = &output[start..];
        if let Some(expected) = d_adler {
            if adler2::adler32_slice(block) != expected {
                return Err(Error::decompression(kind, src_offset, "adler32 mismatch"));
            }
        }
        if let Some(expected) = d_crc {
            let mut crc = flate2::Crc::new();
            crc.update(block);
            if crc.sum() != expected {
                return Err(Error::decompression(kind, src_offset, "crc32 mismatch"));
            }
        }

        if output.len() > limit {
            return Err(Error::resource("decompression", output.len(), limit));
        }
    }
}

/// Skip the lzop file header and return its flags word
fn read_header(cursor: &mut Cursor<'_>) -> Result<u32> {
    let version = cursor.u16()?;
    let _lib_version = cursor.u16()?;
    if version >= VERSION_EXTENDED_HEADER {
        let _version_needed = cursor.u16()?;
    }
    let _method = cursor.u8()?;
    if version >= VERSION_EXTENDED_HEADER {
        let _level = cursor.u8()?;
    }
    let flags = cursor.u32()?;
    if flags & F_H_FILTER != 0 {
        cursor.u32()?;
    }
    let _mode = cursor.u32()?;
    let _mtime_low = cursor.u32()?;
    if version >= VERSION_EXTENDED_HEADER {
        let _mtime_high = cursor.u32()?;
    }
    let name_len = cursor.u8()? as usize;
    cursor.take(name_len)?;
    let _header_checksum = cursor.u32()?;

    if flags & F_H_EXTRA_FIELD != 0 {
        let extra_len = cursor.u32()? as usize;
        cursor.take(extra_len)?;
        let _extra_checksum = cursor.u32()?;
    }
    Ok(flags)
}
