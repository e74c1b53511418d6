//! LZ4 legacy frame decoding.
//!
//! The legacy format is the 4-byte magic followed by chunks, each a 4-byte
//! little-endian compressed length and one raw LZ4 block that expands to at
//! most 8 MiB. There is no end marker: the stream simply stops. The kernel
//! build appends the uncompressed size as a trailing word, and the boot image
//! adds page padding after that.

use super::CompressionKind;
use crate::error::{Error, Result};
use tracing::trace;

const LEGACY_MAGIC: u32 = 0x184C_2102;

/// Uncompressed size of every chunk but the last
const LEGACY_BLOCK_SIZE: usize = 8 * 1024 * 1024;

pub(super) fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let kind = CompressionKind::Lz4Legacy;
    let max_chunk = lz4_flex::block::get_maximum_output_size(LEGACY_BLOCK_SIZE);

    let mut output = Vec::new();
    let mut block = vec![0u8; LEGACY_BLOCK_SIZE];
    let mut position = kind.magic().len();
    let mut chunks = 0usize;

    while let Some(chunk_len) = read_u32_le(data, position) {
        if chunk_len == LEGACY_MAGIC {
            // Concatenated legacy streams
            position += 4;
            continue;
        }

        let chunk_len = chunk_len as usize;
        if chunk_len == 0 || chunk_len > max_chunk {
            trace!("lz4 legacy stream ends at {:#x} (next word {:#x})", position, chunk_len);
            break;
        }

        let start = position + 4;
        let end = start.saturating_add(chunk_len);
        if end > data.len() {
            if chunks > 0 {
                // Trailing uncompressed-size word, not a chunk
                trace!("lz4 legacy stream ends at {:#x} (size word {:#x})", position, chunk_len);
                break;
            }
            return Err(Error::decompression(
                kind,
                position,
                format!(
                    "chunk of {} bytes runs past end of input ({} bytes left)",
                    chunk_len,
                    data.len() - start.min(data.len())
                ),
            ));
        }

        let written = lz4_flex::block::decompress_into(&data[start..end], &mut block)
            .map_err(|e| Error::decompression(kind, start, e.to_string()))?;
        output.extend_from_slice(&block[..written]);
        chunks += 1;

        if output.len() > limit {
            return Err(Error::resource("decompression", output.len(), limit));
        }
        position = end;
    }

    if chunks == 0 {
        return Err(Error::decompression(kind, position, "stream contains no chunks"));
    }
    Ok(output)
}

fn read_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_stream(payload: &[u8]) -> Vec<u8> {
        let block = lz4_flex::block::compress(payload);
        let mut data = LEGACY_MAGIC.to_le_bytes().to_vec();
        data.extend_from_slice(&(block.len() as u32).to_le_bytes());
        data.extend_from_slice(&block);
        data
    }

    #[test]
    fn test_single_chunk_with_padding() {
        let payload = b"ARMd kernel image payload ".repeat(100);
        let mut data = legacy_stream(&payload);
        data.resize(data.len() + 2048, 0);

        assert_eq!(decompress(&data, usize::MAX).unwrap(), payload);
    }

    #[test]
    fn test_trailing_size_word() {
        let payload = b"some kernel bytes".repeat(64);
        let mut data = legacy_stream(&payload);
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());

        assert_eq!(decompress(&data, usize::MAX).unwrap(), payload);
    }

    #[test]
    fn test_truncated_first_chunk() {
        let payload = b"some kernel bytes".repeat(64);
        let data = legacy_stream(&payload);

        let err = decompress(&data[..data.len() - 10], usize::MAX).unwrap_err();
        assert!(matches!(err, Error::Decompression { offset: 4, .. }));
    }

    #[test]
    fn test_empty_stream() {
        let data = LEGACY_MAGIC.to_le_bytes();
        assert!(decompress(&data, usize::MAX).is_err());
    }
}
