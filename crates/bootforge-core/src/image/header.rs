//! Versioned boot image header layouts.
//!
//! All integers are little-endian. Versions 0 to 2 grow by appending fields;
//! version 3 is a reduced layout that moved addresses, the second stage and
//! the device trees into `vendor_boot`.
//!
//! ```text
//! v0  magic[8] kernel_size kernel_addr ramdisk_size ramdisk_addr
//!     second_size second_addr tags_addr page_size header_version
//!     os_version name[16] cmdline[512] id[32] extra_cmdline[1024]   1632 bytes
//! v1  + recovery_dtbo_size recovery_dtbo_offset(u64) header_size     1648 bytes
//! v2  + dtb_size dtb_addr(u64)                                        1660 bytes
//! v3  magic[8] kernel_size ramdisk_size os_version header_size
//!     reserved[16] header_version cmdline[1536]                       1580 bytes
//! ```

use super::ComponentKind;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Magic tag at offset 0 of every structured boot image
pub const BOOT_MAGIC: &[u8; 8] = b"ANDROID!";

/// Offset of `header_version`, identical in every layout
pub const HEADER_VERSION_OFFSET: usize = 40;

/// Offset of `page_size` in layouts 0 to 2
pub const PAGE_SIZE_OFFSET: usize = 36;

/// Highest header version this crate understands
pub const MAX_HEADER_VERSION: u32 = 3;

/// Page size mandated by header version 3
pub const V3_PAGE_SIZE: u32 = 4096;

/// Capacity of the product name field
pub const NAME_SIZE: usize = 16;

const CMDLINE_SIZE: usize = 512;
const EXTRA_CMDLINE_SIZE: usize = 1024;
const V3_CMDLINE_SIZE: usize = 1536;
const ID_SIZE: usize = 32;

const V0_HEADER_SIZE: usize = 1632;
const V1_HEADER_SIZE: usize = 1648;
const V2_HEADER_SIZE: usize = 1660;
const V3_HEADER_SIZE: usize = 1580;

/// Round `value` up to the next multiple of `page`
pub fn align_up(value: u64, page: u64) -> u64 {
    if page == 0 {
        return value;
    }
    value.div_ceil(page) * page
}

/// Encoded size of the header for `version`
pub fn layout_size(version: u32) -> Option<usize> {
    match version {
        0 => Some(V0_HEADER_SIZE),
        1 => Some(V1_HEADER_SIZE),
        2 => Some(V2_HEADER_SIZE),
        3 => Some(V3_HEADER_SIZE),
        _ => None,
    }
}

/// Maximum command line length (in bytes) a header of `version` can hold.
///
/// Every field keeps one byte for its terminating NUL. Multibyte characters
/// near the `cmdline`/`extra_cmdline` boundary can lower this for v0 to v2;
/// [`cmdline_fits`] gives the exact answer.
pub fn cmdline_capacity(version: u32) -> usize {
    if version >= 3 {
        V3_CMDLINE_SIZE - 1
    } else {
        CMDLINE_SIZE - 1 + EXTRA_CMDLINE_SIZE - 1
    }
}

/// Returns true when `cmdline` can be encoded in a header of `version`
pub fn cmdline_fits(version: u32, cmdline: &str) -> bool {
    if version >= 3 {
        return cmdline.len() < V3_CMDLINE_SIZE;
    }
    let (_, extra) = split_cmdline(cmdline);
    extra.len() < EXTRA_CMDLINE_SIZE
}

/// Split a v0 to v2 command line like `mkbootimg`: up to 511 bytes in
/// `cmdline`, the rest in `extra_cmdline`, never inside a character
fn split_cmdline(cmdline: &str) -> (&str, &str) {
    let mut split = cmdline.len().min(CMDLINE_SIZE - 1);
    while !cmdline.is_char_boundary(split) {
        split -= 1;
    }
    cmdline.split_at(split)
}

/// Returns true when a header of `version` has a size field for `kind`
pub fn version_supports(version: u32, kind: ComponentKind) -> bool {
    match kind {
        ComponentKind::Kernel | ComponentKind::Ramdisk => version <= MAX_HEADER_VERSION,
        ComponentKind::Second => version <= 2,
        ComponentKind::RecoveryDtbo => (1..=2).contains(&version),
        ComponentKind::Dtb => version == 2,
    }
}

/// Decoded boot image header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootImageHeader {
    /// Magic tag (`ANDROID!` for structured images)
    #[serde(with = "super::hex_bytes")]
    pub magic: [u8; 8],
    /// Header layout version (0 to 3)
    pub header_version: u32,
    /// Page size used for segment alignment
    pub page_size: u32,
    /// Size of the header as recorded (layout size for versions without the field)
    pub header_size: u32,
    /// Kernel segment size
    pub kernel_size: u32,
    /// Kernel load address
    pub kernel_addr: u32,
    /// Ramdisk segment size
    pub ramdisk_size: u32,
    /// Ramdisk load address
    pub ramdisk_addr: u32,
    /// Second stage bootloader size
    pub second_size: u32,
    /// Second stage load address
    pub second_addr: u32,
    /// Kernel tags (ATAGS / DT) address
    pub tags_addr: u32,
    /// Packed OS version and security patch level
    pub os_version: u32,
    /// Product name
    pub name: String,
    /// Kernel command line (`cmdline` and `extra_cmdline` joined)
    pub cmdline: String,
    /// Image id (usually a digest of the segments)
    #[serde(with = "super::hex_bytes")]
    pub id: [u8; 32],
    /// Recovery DTBO / ACPIO size (version 1+)
    pub recovery_dtbo_size: u32,
    /// Recovery DTBO offset within the image (version 1+)
    pub recovery_dtbo_offset: u64,
    /// Device tree blob size (version 2)
    pub dtb_size: u32,
    /// Device tree blob load address (version 2)
    pub dtb_addr: u64,
}

impl BootImageHeader {
    /// Decode a structured header from the start of `data`.
    ///
    /// Only the magic and the version-specific layout are checked here; page
    /// size and segment bounds are the parser's business.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_VERSION_OFFSET + 4 {
            return Err(Error::format(0, format!("{} bytes is too short for a boot image header", data.len())));
        }
        if &data[..8] != BOOT_MAGIC {
            return Err(Error::format(0, "missing ANDROID! magic"));
        }

        let header_version = (&data[HEADER_VERSION_OFFSET..]).get_u32_le();
        let size = layout_size(header_version).ok_or_else(|| {
            Error::format(
                HEADER_VERSION_OFFSET,
                format!("unsupported header version {}", header_version),
            )
        })?;
        if data.len() < size {
            return Err(Error::format(
                data.len(),
                format!("header v{} needs {} bytes, image has {}", header_version, size, data.len()),
            ));
        }

        let mut buf = &data[8..size];
        if header_version == 3 {
            Ok(Self::decode_v3(&mut buf))
        } else {
            Ok(Self::decode_legacy(&mut buf, header_version))
        }
    }

    fn decode_legacy(buf: &mut &[u8], header_version: u32) -> Self {
        let kernel_size = buf.get_u32_le();
        let kernel_addr = buf.get_u32_le();
        let ramdisk_size = buf.get_u32_le();
        let ramdisk_addr = buf.get_u32_le();
        let second_size = buf.get_u32_le();
        let second_addr = buf.get_u32_le();
        let tags_addr = buf.get_u32_le();
        let page_size = buf.get_u32_le();
        let _header_version = buf.get_u32_le();
        let os_version = buf.get_u32_le();
        let name = read_cstr(&buf[..NAME_SIZE]);
        buf.advance(NAME_SIZE);
        let mut cmdline = cstr_bytes(&buf[..CMDLINE_SIZE]).to_vec();
        buf.advance(CMDLINE_SIZE);
        let mut id = [0u8; ID_SIZE];
        buf.copy_to_slice(&mut id);
        cmdline.extend_from_slice(cstr_bytes(&buf[..EXTRA_CMDLINE_SIZE]));
        buf.advance(EXTRA_CMDLINE_SIZE);
        let cmdline = String::from_utf8_lossy(&cmdline).into_owned();

        let mut header = Self {
            magic: *BOOT_MAGIC,
            header_version,
            page_size,
            header_size: V0_HEADER_SIZE as u32,
            kernel_size,
            kernel_addr,
            ramdisk_size,
            ramdisk_addr,
            second_size,
            second_addr,
            tags_addr,
            os_version,
            name,
            cmdline,
            id,
            recovery_dtbo_size: 0,
            recovery_dtbo_offset: 0,
            dtb_size: 0,
            dtb_addr: 0,
        };

        if header_version >= 1 {
            header.recovery_dtbo_size = buf.get_u32_le();
            header.recovery_dtbo_offset = buf.get_u64_le();
            header.header_size = buf.get_u32_le();
        }
        if header_version >= 2 {
            header.dtb_size = buf.get_u32_le();
            header.dtb_addr = buf.get_u64_le();
        }
        header
    }

    fn decode_v3(buf: &mut &[u8]) -> Self {
        let kernel_size = buf.get_u32_le();
        let ramdisk_size = buf.get_u32_le();
        let os_version = buf.get_u32_le();
        let header_size = buf.get_u32_le();
        buf.advance(16); // reserved
        let _header_version = buf.get_u32_le();
        let cmdline = read_cstr(&buf[..V3_CMDLINE_SIZE]);

        Self {
            magic: *BOOT_MAGIC,
            header_version: 3,
            page_size: V3_PAGE_SIZE,
            header_size,
            kernel_size,
            ramdisk_size,
            os_version,
            cmdline,
            ..Self::empty(3)
        }
    }

    /// A zeroed header of the given version
    pub fn empty(header_version: u32) -> Self {
        Self {
            magic: *BOOT_MAGIC,
            header_version,
            page_size: if header_version >= 3 { V3_PAGE_SIZE } else { 2048 },
            header_size: layout_size(header_version).unwrap_or(V0_HEADER_SIZE) as u32,
            kernel_size: 0,
            kernel_addr: 0,
            ramdisk_size: 0,
            ramdisk_addr: 0,
            second_size: 0,
            second_addr: 0,
            tags_addr: 0,
            os_version: 0,
            name: String::new(),
            cmdline: String::new(),
            id: [0u8; ID_SIZE],
            recovery_dtbo_size: 0,
            recovery_dtbo_offset: 0,
            dtb_size: 0,
            dtb_addr: 0,
        }
    }

    /// Encode the header into its on-disk layout (without page padding).
    ///
    /// Callers must have validated the version, name and command line.
    pub fn encode(&self) -> BytesMut {
        let size = layout_size(self.header_version).unwrap_or(V0_HEADER_SIZE);
        let mut buf = BytesMut::with_capacity(size);
        buf.put_slice(&self.magic);

        if self.header_version >= 3 {
            buf.put_u32_le(self.kernel_size);
            buf.put_u32_le(self.ramdisk_size);
            buf.put_u32_le(self.os_version);
            buf.put_u32_le(self.header_size);
            buf.put_bytes(0, 16);
            buf.put_u32_le(self.header_version);
            put_padded(&mut buf, self.cmdline.as_bytes(), V3_CMDLINE_SIZE);
            return buf;
        }

        buf.put_u32_le(self.kernel_size);
        buf.put_u32_le(self.kernel_addr);
        buf.put_u32_le(self.ramdisk_size);
        buf.put_u32_le(self.ramdisk_addr);
        buf.put_u32_le(self.second_size);
        buf.put_u32_le(self.second_addr);
        buf.put_u32_le(self.tags_addr);
        buf.put_u32_le(self.page_size);
        buf.put_u32_le(self.header_version);
        buf.put_u32_le(self.os_version);
        put_padded(&mut buf, self.name.as_bytes(), NAME_SIZE);

        let (cmdline, extra_cmdline) = split_cmdline(&self.cmdline);
        put_padded(&mut buf, cmdline.as_bytes(), CMDLINE_SIZE);
        buf.put_slice(&self.id);
        put_padded(&mut buf, extra_cmdline.as_bytes(), EXTRA_CMDLINE_SIZE);

        if self.header_version >= 1 {
            buf.put_u32_le(self.recovery_dtbo_size);
            buf.put_u64_le(self.recovery_dtbo_offset);
            buf.put_u32_le(self.header_size);
        }
        if self.header_version >= 2 {
            buf.put_u32_le(self.dtb_size);
            buf.put_u64_le(self.dtb_addr);
        }
        buf
    }

    /// Number of bytes the header occupies once padded to a page boundary
    pub fn padded_header_len(&self) -> u64 {
        let layout = layout_size(self.header_version).unwrap_or(V0_HEADER_SIZE) as u64;
        align_up(u64::from(self.header_size).max(layout), u64::from(self.page_size))
    }

    /// Recorded segment sizes, in on-disk order
    pub fn segment_sizes(&self) -> [(ComponentKind, u64); 5] {
        [
            (ComponentKind::Kernel, u64::from(self.kernel_size)),
            (ComponentKind::Ramdisk, u64::from(self.ramdisk_size)),
            (ComponentKind::Second, u64::from(self.second_size)),
            (ComponentKind::RecoveryDtbo, u64::from(self.recovery_dtbo_size)),
            (ComponentKind::Dtb, u64::from(self.dtb_size)),
        ]
    }

    /// Place every present segment after the header.
    ///
    /// Each segment starts at the page-aligned end of the previous one;
    /// zero-sized segments take no space at all.
    pub fn layout(&self) -> SegmentLayout {
        let page = u64::from(self.page_size);
        let mut offset = self.padded_header_len();
        let mut spans = Vec::new();

        for (kind, size) in self.segment_sizes() {
            if size == 0 || !version_supports(self.header_version, kind) {
                continue;
            }
            spans.push(SegmentSpan { kind, offset, size });
            offset += align_up(size, page);
        }

        SegmentLayout {
            spans,
            total_len: offset,
        }
    }

    /// Decoded `a.b.c` OS version, if set
    pub fn os_version_string(&self) -> Option<String> {
        let version = self.os_version >> 11;
        if version == 0 {
            return None;
        }
        Some(format!(
            "{}.{}.{}",
            (version >> 14) & 0x7F,
            (version >> 7) & 0x7F,
            version & 0x7F
        ))
    }

    /// Decoded `YYYY-MM` security patch level, if set
    pub fn os_patch_level(&self) -> Option<String> {
        let level = self.os_version & 0x7FF;
        if level == 0 {
            return None;
        }
        Some(format!("{}-{:02}", (level >> 4) + 2000, level & 0xF))
    }
}

/// Location of one segment inside an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpan {
    /// Which component lives here
    pub kind: ComponentKind,
    /// Byte offset from the start of the image
    pub offset: u64,
    /// Unpadded size in bytes
    pub size: u64,
}

/// Result of laying out segments after a header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLayout {
    /// Present segments in on-disk order
    pub spans: Vec<SegmentSpan>,
    /// Total image length including the final segment's padding
    pub total_len: u64,
}

/// Bytes of a fixed-size field up to its first NUL
fn cstr_bytes(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

/// Read a NUL-terminated string out of a fixed-size field
fn read_cstr(field: &[u8]) -> String {
    String::from_utf8_lossy(cstr_bytes(field)).into_owned()
}

/// Write `value` and zero-fill up to `width` bytes
fn put_padded(buf: &mut BytesMut, value: &[u8], width: usize) {
    let len = value.len().min(width);
    buf.put_slice(&value[..len]);
    buf.put_bytes(0, width - len);
}
