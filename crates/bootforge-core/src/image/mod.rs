//! Boot image container parsing.
//!
//! A boot image is split into its header and segments by trying a list of
//! [`ParseStrategy`] implementations in order. The first strategy that accepts
//! the input wins:
//!
//! 1. [`StructuredParser`]: the `ANDROID!` container, header versions 0 to 3
//! 2. [`RawKernelParser`]: a bare, uncompressed kernel with a known boot stub
//! 3. [`CompressedBlobParser`]: anything holding a compressed stream, taken
//!    from the stream's first byte to the end of the buffer
//!
//! Only when all of them refuse is the input reported as a format error.
//!
//! ## Extensibility
//!
//! Custom strategies (for OEM containers, say) plug in through
//! [`BootImageParser::with_strategies`]:
//!
//! ```no_run
//! use bootforge_core::image::{ParseStrategy, ParsedImage};
//! use bootforge_core::Result;
//! use bytes::Bytes;
//!
//! struct OemContainer;
//!
//! impl ParseStrategy for OemContainer {
//!     fn name(&self) -> &'static str {
//!         "oem"
//!     }
//!
//!     fn parse(&self, data: &Bytes) -> Result<ParsedImage> {
//!         Err(bootforge_core::Error::format(0, "not an OEM container"))
//!     }
//! }
//! ```

pub mod builder;
pub mod header;

use crate::codec::{self, CompressionKind};
use crate::error::{Error, Result};
use crate::kernel::arch::{self, Architecture};
use bytes::Bytes;
use header::{BootImageHeader, PAGE_SIZE_OFFSET, V3_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace, warn};

pub use builder::{BootImageBuilder, BuildOptions, SegmentSizes};

/// Default ceiling for a whole boot image
pub const DEFAULT_MAX_IMAGE_SIZE: usize = 256 * 1024 * 1024;

/// ARM `mov r0, r0` nop that opens every 32-bit zImage
const ARM_NOP_SLED: &[u8] = &[0x00, 0x00, 0xA0, 0xE1];

/// Named segment of a boot image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Kernel image
    Kernel,
    /// Initial ramdisk
    Ramdisk,
    /// Second stage bootloader
    Second,
    /// Recovery DTBO / ACPIO
    RecoveryDtbo,
    /// Device tree blob
    Dtb,
}

impl ComponentKind {
    /// Every component, in on-disk order
    pub const ALL: [ComponentKind; 5] = [
        ComponentKind::Kernel,
        ComponentKind::Ramdisk,
        ComponentKind::Second,
        ComponentKind::RecoveryDtbo,
        ComponentKind::Dtb,
    ];

    /// Returns the component name (also used as its file name when unpacked)
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Kernel => "kernel",
            ComponentKind::Ramdisk => "ramdisk",
            ComponentKind::Second => "second",
            ComponentKind::RecoveryDtbo => "recovery_dtbo",
            ComponentKind::Dtb => "dtb",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the components were located
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Decoded from a valid boot image header
    Structured,
    /// Guessed from signatures in a headerless blob
    Heuristic,
}

/// Header values carried alongside the components so an image can be rebuilt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// Header layout version
    pub header_version: u32,
    /// Page size
    pub page_size: u32,
    /// Kernel load address
    pub kernel_addr: u32,
    /// Ramdisk load address
    pub ramdisk_addr: u32,
    /// Second stage load address
    pub second_addr: u32,
    /// Tags address
    pub tags_addr: u32,
    /// Device tree load address
    pub dtb_addr: u64,
    /// Packed OS version and patch level
    pub os_version: u32,
    /// Product name
    pub name: String,
    /// Kernel command line
    pub cmdline: String,
    /// Image id
    #[serde(with = "hex_bytes")]
    pub id: [u8; 32],
}

impl Default for BootConfig {
    /// The stock `mkbootimg` defaults (base `0x10000000`, 2 KiB pages)
    fn default() -> Self {
        Self::with_base(0x1000_0000)
    }
}

impl BootConfig {
    /// Creates a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Default load addresses relative to `base`, as `mkbootimg` computes them
    pub fn with_base(base: u32) -> Self {
        Self {
            header_version: 0,
            page_size: 2048,
            kernel_addr: base.wrapping_add(0x0000_8000),
            ramdisk_addr: base.wrapping_add(0x0100_0000),
            second_addr: base.wrapping_add(0x00F0_0000),
            tags_addr: base.wrapping_add(0x0000_0100),
            dtb_addr: u64::from(base) + 0x01F0_0000,
            os_version: 0,
            name: String::new(),
            cmdline: String::new(),
            id: [0u8; 32],
        }
    }

    /// Capture the reusable values of a decoded header
    pub fn from_header(header: &BootImageHeader) -> Self {
        Self {
            header_version: header.header_version,
            page_size: header.page_size,
            kernel_addr: header.kernel_addr,
            ramdisk_addr: header.ramdisk_addr,
            second_addr: header.second_addr,
            tags_addr: header.tags_addr,
            dtb_addr: header.dtb_addr,
            os_version: header.os_version,
            name: header.name.clone(),
            cmdline: header.cmdline.clone(),
            id: header.id,
        }
    }

    /// Sets the header version
    pub fn header_version(mut self, version: u32) -> Self {
        self.header_version = version;
        self
    }

    /// Sets the page size
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the kernel command line
    pub fn cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.cmdline = cmdline.into();
        self
    }

    /// Sets the product name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Drop the values a header of this version has no field for.
    ///
    /// Below v2 there is no device tree address. v3 keeps only the OS version
    /// and command line and always uses 4 KiB pages. Unsupported versions are
    /// left as they are for the builder to reject.
    pub fn normalized(mut self) -> Self {
        match self.header_version {
            0 | 1 => self.dtb_addr = 0,
            2 => {}
            3 => {
                if self.page_size != V3_PAGE_SIZE {
                    warn!("Header v3 uses {} byte pages, ignoring {}", V3_PAGE_SIZE, self.page_size);
                }
                if !self.name.is_empty() {
                    warn!("Header v3 has no product name field, dropping {:?}", self.name);
                }
                return Self {
                    header_version: 3,
                    page_size: V3_PAGE_SIZE,
                    kernel_addr: 0,
                    ramdisk_addr: 0,
                    second_addr: 0,
                    tags_addr: 0,
                    dtb_addr: 0,
                    os_version: self.os_version,
                    name: String::new(),
                    cmdline: self.cmdline,
                    id: [0u8; 32],
                };
            }
            _ => {}
        }
        self
    }
}

/// Segments of one boot image plus the header values needed to rebuild it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedComponents {
    kernel: Bytes,
    ramdisk: Option<Bytes>,
    second: Option<Bytes>,
    recovery_dtbo: Option<Bytes>,
    dtb: Option<Bytes>,
    config: BootConfig,
}

impl ExtractedComponents {
    /// Creates a component set holding only a kernel.
    ///
    /// `config` is [normalized](BootConfig::normalized) to its header version.
    pub fn new(kernel: impl Into<Bytes>, config: BootConfig) -> Self {
        Self {
            kernel: kernel.into(),
            ramdisk: None,
            second: None,
            recovery_dtbo: None,
            dtb: None,
            config: config.normalized(),
        }
    }

    /// Returns a copy with `kind` set to `data` (an empty buffer marks it absent)
    pub fn with_component(mut self, kind: ComponentKind, data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        let slot = if data.is_empty() { None } else { Some(data.clone()) };
        match kind {
            ComponentKind::Kernel => self.kernel = data,
            ComponentKind::Ramdisk => self.ramdisk = slot,
            ComponentKind::Second => self.second = slot,
            ComponentKind::RecoveryDtbo => self.recovery_dtbo = slot,
            ComponentKind::Dtb => self.dtb = slot,
        }
        self
    }

    /// Returns a copy carrying a different (normalized) boot config
    pub fn with_config(mut self, config: BootConfig) -> Self {
        self.config = config.normalized();
        self
    }

    /// The kernel bytes
    pub fn kernel(&self) -> &Bytes {
        &self.kernel
    }

    /// The boot config carried for round trips
    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    /// Bytes of `kind`, or `None` if the image does not carry it
    pub fn get(&self, kind: ComponentKind) -> Option<&Bytes> {
        match kind {
            ComponentKind::Kernel => Some(&self.kernel).filter(|k| !k.is_empty()),
            ComponentKind::Ramdisk => self.ramdisk.as_ref(),
            ComponentKind::Second => self.second.as_ref(),
            ComponentKind::RecoveryDtbo => self.recovery_dtbo.as_ref(),
            ComponentKind::Dtb => self.dtb.as_ref(),
        }
    }

    /// Bytes of `kind`, failing with [`Error::NotFound`] when absent
    pub fn component(&self, kind: ComponentKind) -> Result<&Bytes> {
        self.get(kind).ok_or_else(|| Error::not_found(kind.as_str()))
    }

    /// Present components in on-disk order
    pub fn present(&self) -> impl Iterator<Item = (ComponentKind, &Bytes)> + '_ {
        ComponentKind::ALL
            .into_iter()
            .filter_map(move |kind| self.get(kind).map(|data| (kind, data)))
    }
}

/// Output of a successful parse
#[derive(Debug, Clone)]
pub struct ParsedImage {
    /// Decoded (or, for heuristic parses, synthesized) header
    pub header: BootImageHeader,
    /// The segments
    pub components: ExtractedComponents,
    /// Whether a real header was decoded
    pub provenance: Provenance,
    /// Name of the strategy that produced this result
    pub strategy: &'static str,
}

impl ParsedImage {
    /// Wrap a bare kernel found by a heuristic strategy
    fn heuristic(kernel: Bytes, strategy: &'static str) -> Self {
        let config = BootConfig::default();
        let header = BootImageHeader {
            magic: [0u8; 8],
            kernel_size: u32::try_from(kernel.len()).unwrap_or(u32::MAX),
            kernel_addr: config.kernel_addr,
            ramdisk_addr: config.ramdisk_addr,
            second_addr: config.second_addr,
            tags_addr: config.tags_addr,
            ..BootImageHeader::empty(0)
        };
        Self {
            header,
            components: ExtractedComponents::new(kernel, config),
            provenance: Provenance::Heuristic,
            strategy,
        }
    }
}

/// Trait for the strategies tried by [`BootImageParser`]
pub trait ParseStrategy: Send + Sync {
    /// Short name used in logs and reports
    fn name(&self) -> &'static str;

    /// Split `data` into header and components, or explain why not
    fn parse(&self, data: &Bytes) -> Result<ParsedImage>;
}

/// Decodes the `ANDROID!` container
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredParser;

impl ParseStrategy for StructuredParser {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn parse(&self, data: &Bytes) -> Result<ParsedImage> {
        let header = BootImageHeader::decode(data)?;
        trace!(
            "Header v{}: page size {}, kernel {} bytes, ramdisk {} bytes",
            header.header_version,
            header.page_size,
            header.kernel_size,
            header.ramdisk_size
        );

        if header.page_size == 0 || !header.page_size.is_power_of_two() {
            return Err(Error::format(
                PAGE_SIZE_OFFSET,
                format!("page size {} is not a power of two", header.page_size),
            ));
        }
        if header.kernel_size == 0 {
            return Err(Error::format(8, "header declares no kernel"));
        }

        let layout = header.layout();
        let mut components = ExtractedComponents::new(Bytes::new(), BootConfig::from_header(&header));
        for span in &layout.spans {
            let start = usize::try_from(span.offset).unwrap_or(usize::MAX);
            let end = start.saturating_add(usize::try_from(span.size).unwrap_or(usize::MAX));
            if end > data.len() {
                return Err(Error::format(
                    start.min(data.len()),
                    format!(
                        "{} segment ({} bytes at {:#x}) runs past end of image ({} bytes)",
                        span.kind,
                        span.size,
                        span.offset,
                        data.len()
                    ),
                ));
            }
            trace!("{} segment at {:#x}..{:#x}", span.kind, start, end);
            components = components.with_component(span.kind, data.slice(start..end));
        }

        let expected = layout.total_len;
        if (data.len() as u64) > expected {
            debug!(
                "{} trailing bytes after the last segment",
                data.len() as u64 - expected
            );
        }

        Ok(ParsedImage {
            header,
            components,
            provenance: Provenance::Structured,
            strategy: self.name(),
        })
    }
}

/// Accepts a bare kernel whose boot stub is recognizable at offset 0
#[derive(Debug, Clone, Copy, Default)]
pub struct RawKernelParser;

impl ParseStrategy for RawKernelParser {
    fn name(&self) -> &'static str {
        "raw-kernel"
    }

    fn parse(&self, data: &Bytes) -> Result<ParsedImage> {
        let architecture = arch::detect_architecture(data);
        if architecture == Architecture::Unknown && !data.starts_with(ARM_NOP_SLED) {
            return Err(Error::format(0, "no known kernel boot stub at offset 0"));
        }
        debug!("Raw {} kernel image, {} bytes", architecture, data.len());
        Ok(ParsedImage::heuristic(data.clone(), self.name()))
    }
}

/// Takes everything from the first compressed stream to the end as the kernel
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressedBlobParser;

impl ParseStrategy for CompressedBlobParser {
    fn name(&self) -> &'static str {
        "compressed-blob"
    }

    fn parse(&self, data: &Bytes) -> Result<ParsedImage> {
        let (offset, kind) = codec::find_signature(data, 0)
            .ok_or_else(|| Error::format(0, "no compression signature found"))?;
        debug!("Treating {} stream at {:#x} as a bare kernel", kind, offset);
        debug_assert_ne!(kind, CompressionKind::None);
        Ok(ParsedImage::heuristic(data.slice(offset..), self.name()))
    }
}

/// Configuration for the parser
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Largest accepted input
    pub max_image_size: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
        }
    }
}

impl ParserConfig {
    /// Creates a new parser config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the largest accepted input
    pub fn max_image_size(mut self, size: usize) -> Self {
        self.max_image_size = size;
        self
    }
}

/// Splits boot images into header and components
pub struct BootImageParser {
    config: ParserConfig,
    strategies: Vec<Box<dyn ParseStrategy>>,
}

impl fmt::Debug for BootImageParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootImageParser")
            .field("config", &self.config)
            .field(
                "strategies",
                &self.strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for BootImageParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BootImageParser {
    /// Creates a parser with the default strategies and configuration
    pub fn new() -> Self {
        Self::with_config(ParserConfig::default())
    }

    /// Creates a parser with the default strategies and a custom configuration
    pub fn with_config(config: ParserConfig) -> Self {
        Self::with_strategies(
            config,
            vec![
                Box::new(StructuredParser),
                Box::new(RawKernelParser),
                Box::new(CompressedBlobParser),
            ],
        )
    }

    /// Creates a parser that tries `strategies` in order
    pub fn with_strategies(config: ParserConfig, strategies: Vec<Box<dyn ParseStrategy>>) -> Self {
        Self { config, strategies }
    }

    /// Parse a boot image held in caller memory (the bytes are copied once)
    pub fn parse(&self, data: &[u8]) -> Result<ParsedImage> {
        self.check_size(data.len())?;
        self.parse_bytes(Bytes::copy_from_slice(data))
    }

    /// Parse a boot image already held in a [`Bytes`] buffer
    pub fn parse_bytes(&self, data: Bytes) -> Result<ParsedImage> {
        self.check_size(data.len())?;
        debug!("Parsing {} bytes", data.len());

        let mut failures = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            match strategy.parse(&data) {
                Ok(parsed) => {
                    debug!(
                        "Parsed with {} strategy ({:?})",
                        strategy.name(),
                        parsed.provenance
                    );
                    return Ok(parsed);
                }
                Err(e) => {
                    if strategy.name() == StructuredParser.name()
                        && data.starts_with(header::BOOT_MAGIC)
                    {
                        warn!("Image has a boot header but it is unusable: {}", e);
                    } else {
                        trace!("{} strategy rejected input: {}", strategy.name(), e);
                    }
                    failures.push(format!("{}: {}", strategy.name(), e));
                }
            }
        }

        Err(Error::format(0, failures.join("; ")))
    }

    fn check_size(&self, len: usize) -> Result<()> {
        if len > self.config.max_image_size {
            return Err(Error::resource("boot image parse", len, self.config.max_image_size));
        }
        Ok(())
    }
}

/// Read and parse a boot image file
pub fn parse_file(path: impl AsRef<std::path::Path>) -> Result<ParsedImage> {
    parse_file_with_config(path, ParserConfig::default())
}

/// Read and parse a boot image file with custom configuration
pub fn parse_file_with_config(
    path: impl AsRef<std::path::Path>,
    config: ParserConfig,
) -> Result<ParsedImage> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|e| Error::file_read(path, e))?;
    BootImageParser::with_config(config).parse_bytes(Bytes::from(data))
}

/// Fixed-size byte arrays as lowercase hex strings
pub(crate) mod hex_bytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::fmt::Write as _;

    pub(crate) fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut hex = String::with_capacity(N * 2);
        for byte in bytes {
            let _ = write!(hex, "{:02x}", byte);
        }
        serializer.serialize_str(&hex)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let hex = String::deserialize(deserializer)?;
        if hex.len() != N * 2 || !hex.is_ascii() {
            return Err(D::Error::custom(format!("expected {} hex digits", N * 2)));
        }
        let mut out = [0u8; N];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(D::Error::custom)?;
        }
        Ok(out)
    }
}
