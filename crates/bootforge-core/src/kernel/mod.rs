//! Forensic analysis of a kernel image.
//!
//! [`KernelAnalyzer::analyze`] turns the kernel segment of a boot image into a
//! [`KernelBinary`]. Apart from the input size ceiling, nothing here fails:
//! a payload that will not decompress is analyzed as stored, and every
//! individual finding degrades to "unknown" or "absent".
//!
//! ## Scanning
//!
//! Version, IKCONFIG and security tokens are found by scanning the whole
//! payload. Strings come from the kernel as stored, compressed or not. Cost is bounded by [`AnalyzerConfig::max_input_size`] and
//! [`AnalyzerConfig::max_decompressed_size`], not by a scan window.

pub mod arch;
pub mod ikconfig;
pub mod security;
pub mod strings;

use crate::codec::{self, CompressionKind};
use crate::error::{Error, Result};
use crate::features::{ConfigFeatureClassifier, FeatureLists};
use bstr::ByteSlice;
use bytes::Bytes;
use regex::bytes::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use tracing::{debug, warn};

pub use arch::{detect_architecture, Architecture};
pub use ikconfig::{ConfigValue, KernelConfig};
pub use security::{merge_security_signals, SecurityFlag, SecurityFlags, SignalSource};
pub use strings::{extract_strings, StringBucket, StringBuckets, StringCategory, StringLimits};

/// Default ceiling for the raw kernel handed to the analyzer
pub const DEFAULT_MAX_INPUT_SIZE: usize = 128 * 1024 * 1024;

const VERSION_PATTERN: &str = r"(?-u)Linux version (\S+) \(";
const VERSION_BANNER: &[u8] = b"Linux version ";
const MAX_VERSION_STRING_LEN: usize = 256;

/// Configuration for the analyzer
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Largest raw kernel accepted
    pub max_input_size: usize,
    /// Largest decompressed payload produced
    pub max_decompressed_size: usize,
    /// Shortest printable run reported as a string
    pub min_string_len: usize,
    /// Strings retained per category
    pub max_strings_per_category: usize,
    /// Retained strings are cut to this many bytes
    pub max_string_len: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_input_size: DEFAULT_MAX_INPUT_SIZE,
            max_decompressed_size: codec::DEFAULT_MAX_DECOMPRESSED_SIZE,
            min_string_len: 4,
            max_strings_per_category: 64,
            max_string_len: 120,
        }
    }
}

impl AnalyzerConfig {
    /// Creates a new analyzer config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the largest raw kernel accepted
    pub fn max_input_size(mut self, size: usize) -> Self {
        self.max_input_size = size;
        self
    }

    /// Sets the largest decompressed payload produced
    pub fn max_decompressed_size(mut self, size: usize) -> Self {
        self.max_decompressed_size = size;
        self
    }

    /// Sets the shortest printable run reported as a string
    pub fn min_string_len(mut self, len: usize) -> Self {
        self.min_string_len = len;
        self
    }

    /// Sets how many strings are retained per category
    pub fn max_strings_per_category(mut self, max: usize) -> Self {
        self.max_strings_per_category = max;
        self
    }

    /// Sets the length retained strings are cut to
    pub fn max_string_len(mut self, len: usize) -> Self {
        self.max_string_len = len;
        self
    }

    fn string_limits(&self) -> StringLimits {
        StringLimits {
            min_len: self.min_string_len,
            max_per_category: self.max_strings_per_category,
            max_len: self.max_string_len,
        }
    }
}

/// Everything learned about one kernel image
#[derive(Debug, Clone, Serialize)]
pub struct KernelBinary {
    /// The kernel as found in the boot image
    #[serde(skip)]
    pub raw: Bytes,
    /// Decompressed payload, when decompression succeeded
    #[serde(skip)]
    pub decompressed: Option<Bytes>,
    /// BLAKE3 digest of `raw`
    pub content_hash: String,
    /// Length of `raw`
    pub size: usize,
    /// Compression of the payload
    pub compression: CompressionKind,
    /// Offset of the compressed payload within `raw` (non-zero for zImage)
    pub payload_offset: usize,
    /// Length of `decompressed`
    pub decompressed_size: Option<usize>,
    /// Dotted numeric version, e.g. `5.15.41`
    pub kernel_version: Option<String>,
    /// Full `Linux version ...` banner
    pub version_string: Option<String>,
    /// First parenthesized group of the banner (builder and host)
    pub build_info: Option<String>,
    /// Architecture from the boot stub
    pub architecture: Architecture,
    /// Security features
    pub security: SecurityFlags,
    /// Features from the embedded config
    pub features: FeatureLists,
    /// Number of embedded config keys
    pub config_entries: usize,
    /// Embedded config
    #[serde(skip)]
    pub config: KernelConfig,
    /// Categorized strings
    pub strings: StringBuckets,
}

impl KernelBinary {
    /// The bytes analysis ran on: the payload if decompressed, else the raw kernel
    pub fn payload(&self) -> &[u8] {
        self.decompressed.as_deref().unwrap_or(&self.raw)
    }
}

struct VersionInfo {
    kernel_version: String,
    version_string: String,
    build_info: Option<String>,
}

/// Analyzes kernel images
#[derive(Debug, Clone, Default)]
pub struct KernelAnalyzer {
    config: AnalyzerConfig,
    classifier: ConfigFeatureClassifier,
}

impl KernelAnalyzer {
    /// Creates an analyzer with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an analyzer with custom configuration
    pub fn with_config(config: AnalyzerConfig) -> Self {
        Self {
            config,
            classifier: ConfigFeatureClassifier::new(),
        }
    }

    /// Returns the analyzer configuration
    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Analyze a kernel held in caller memory (the bytes are copied once)
    pub fn analyze(&self, data: &[u8]) -> Result<KernelBinary> {
        self.check_size(data.len())?;
        self.analyze_bytes(Bytes::copy_from_slice(data))
    }

    /// Analyze a kernel already held in a [`Bytes`] buffer
    pub fn analyze_bytes(&self, raw: Bytes) -> Result<KernelBinary> {
        self.check_size(raw.len())?;
        debug!("Analyzing {} byte kernel", raw.len());

        let content_hash = crate::content_hash(&raw);
        let (compression, payload_offset) = locate_payload(&raw);
        let decompressed = self.decompress(&raw, compression, payload_offset);
        let payload: &[u8] = decompressed.as_deref().unwrap_or(&raw);

        let version = extract_version(payload).or_else(|| extract_version(&raw));
        match &version {
            Some(v) => debug!("Kernel version {}", v.kernel_version),
            None => debug!("No version banner found"),
        }

        let mut architecture = detect_architecture(&raw);
        if architecture == Architecture::Unknown && decompressed.is_some() {
            architecture = detect_architecture(payload);
        }

        let mut config = ikconfig::extract(payload, self.config.max_decompressed_size);
        if config.is_empty() && decompressed.is_some() {
            config = ikconfig::extract(&raw, self.config.max_decompressed_size);
        }

        let features = self.classifier.classify(&config);
        let security = merge_security_signals(&config, payload);
        let strings = extract_strings(&raw, &self.config.string_limits());

        let (kernel_version, version_string, build_info) = match version {
            Some(v) => (Some(v.kernel_version), Some(v.version_string), v.build_info),
            None => (None, None, None),
        };

        Ok(KernelBinary {
            size: raw.len(),
            decompressed_size: decompressed.as_ref().map(Bytes::len),
            content_hash,
            compression,
            payload_offset,
            kernel_version,
            version_string,
            build_info,
            architecture,
            security,
            features,
            config_entries: config.len(),
            config,
            strings,
            decompressed,
            raw,
        })
    }

    fn check_size(&self, len: usize) -> Result<()> {
        if len > self.config.max_input_size {
            return Err(Error::resource("kernel analysis", len, self.config.max_input_size));
        }
        Ok(())
    }

    fn decompress(&self, raw: &[u8], kind: CompressionKind, offset: usize) -> Option<Bytes> {
        if !kind.is_compressed() {
            return None;
        }
        match codec::decompress_bounded(&raw[offset..], kind, self.config.max_decompressed_size) {
            Ok(payload) => Some(Bytes::from(payload)),
            Err(e) => {
                warn!("Could not decompress {} kernel at {:#x}: {}", kind, offset, e);
                None
            }
        }
    }
}

/// Find the compressed payload: at offset 0, or embedded in a self-extracting
/// image that carries no version banner of its own
fn locate_payload(raw: &[u8]) -> (CompressionKind, usize) {
    let kind = codec::detect(raw);
    if kind.is_compressed() {
        return (kind, 0);
    }
    if raw.find(VERSION_BANNER).is_some() {
        return (CompressionKind::None, 0);
    }
    match codec::find_signature(raw, 0) {
        Some((offset, kind)) => {
            debug!("Embedded {} payload at {:#x}", kind, offset);
            (kind, offset)
        }
        None => (CompressionKind::None, 0),
    }
}

fn extract_version(data: &[u8]) -> Option<VersionInfo> {
    static VERSION: OnceLock<Regex> = OnceLock::new();
    let pattern = VERSION.get_or_init(|| Regex::new(VERSION_PATTERN).expect("version pattern is valid"));

    let captures = pattern.captures(data)?;
    let banner = captures.get(0)?;
    let token = String::from_utf8_lossy(captures.get(1)?.as_bytes()).into_owned();

    let numeric_len = token
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(token.len());
    let numeric = token[..numeric_len].trim_end_matches('.');
    let kernel_version = if numeric.is_empty() { token.clone() } else { numeric.to_string() };

    let rest = &data[banner.start()..];
    let line_end = rest
        .iter()
        .position(|&b| b == 0 || b == b'\n')
        .unwrap_or(rest.len())
        .min(MAX_VERSION_STRING_LEN);
    let line = String::from_utf8_lossy(&rest[..line_end]).trim_end().to_string();

    let group_start = banner.end() - banner.start();
    let build_info = line
        .get(group_start..)
        .and_then(|tail| tail.find(')').map(|close| tail[..close].to_string()))
        .filter(|info| !info.is_empty());

    Some(VersionInfo {
        kernel_version,
        version_string: line,
        build_info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const BANNER: &[u8] =
        b"Linux version 5.15.41-android13-9-00006-g0e7c139da09b (foo@bar) (clang version 14.0.6) #1 SMP PREEMPT\n";

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn arm64_image(extra: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; 0x40];
        image[0x38..0x3C].copy_from_slice(b"ARM\x64");
        image.extend_from_slice(extra);
        image
    }

    #[test]
    fn test_version_extraction() {
        let mut data = vec![0u8; 100];
        data.extend_from_slice(BANNER);

        let kernel = KernelAnalyzer::new().analyze(&data).unwrap();
        assert_eq!(kernel.kernel_version.as_deref(), Some("5.15.41"));
        assert_eq!(kernel.build_info.as_deref(), Some("foo@bar"));
        assert_eq!(
            kernel.version_string.as_deref(),
            Some("Linux version 5.15.41-android13-9-00006-g0e7c139da09b (foo@bar) (clang version 14.0.6) #1 SMP PREEMPT")
        );
        assert_eq!(kernel.compression, CompressionKind::None);
        assert_eq!(kernel.decompressed_size, None);
    }

    #[test]
    fn test_ikconfig_drives_flags_and_features() {
        let mut data = arm64_image(BANNER);
        data.extend_from_slice(&ikconfig::tests::embedded(
            "CONFIG_SELINUX=y\n# CONFIG_FOO is not set\n",
        ));

        let kernel = KernelAnalyzer::new().analyze(&data).unwrap();
        assert_eq!(kernel.architecture, Architecture::Arm64);
        assert_eq!(kernel.config_entries, 2);
        assert_eq!(
            kernel.security.selinux,
            SecurityFlag { enabled: true, source: SignalSource::Config }
        );
        assert!(kernel.features.is_empty());
        assert!(kernel
            .config
            .iter()
            .all(|(key, value)| key != "CONFIG_FOO" || *value == ConfigValue::NotSet));
    }

    #[test]
    fn test_compressed_kernel_with_padding() {
        let image = arm64_image(BANNER);
        let mut data = gzip(&image);
        data.resize(data.len() + 4096, 0);

        let kernel = KernelAnalyzer::new().analyze(&data).unwrap();
        assert_eq!(kernel.compression, CompressionKind::Gzip);
        assert_eq!(kernel.payload_offset, 0);
        assert_eq!(kernel.decompressed_size, Some(image.len()));
        assert_eq!(kernel.payload(), &image[..]);
        assert_eq!(kernel.kernel_version.as_deref(), Some("5.15.41"));
        assert_eq!(kernel.architecture, Architecture::Arm64);
    }

    #[test]
    fn test_zimage_piggy_payload() {
        let mut data = vec![0u8; 0x200];
        data[..4].copy_from_slice(&[0x00, 0x00, 0xA0, 0xE1]);
        data[0x24..0x28].copy_from_slice(&0x016F_2818u32.to_le_bytes());
        let offset = data.len();
        data.extend_from_slice(&gzip(BANNER));

        let kernel = KernelAnalyzer::new().analyze(&data).unwrap();
        assert_eq!(kernel.architecture, Architecture::Arm);
        assert_eq!(kernel.compression, CompressionKind::Gzip);
        assert_eq!(kernel.payload_offset, offset);
        assert_eq!(kernel.kernel_version.as_deref(), Some("5.15.41"));
    }

    #[test]
    fn test_corrupt_payload_degrades() {
        let mut data = gzip(&arm64_image(BANNER));
        let len = data.len();
        data[len - 8] ^= 0xFF; // CRC32

        let kernel = KernelAnalyzer::new().analyze(&data).unwrap();
        assert_eq!(kernel.compression, CompressionKind::Gzip);
        assert!(kernel.decompressed.is_none());
        assert_eq!(kernel.decompressed_size, None);
        assert_eq!(kernel.size, len);
    }

    #[test]
    fn test_oversized_input() {
        let analyzer = KernelAnalyzer::with_config(AnalyzerConfig::new().max_input_size(16));
        let err = analyzer.analyze(&[0u8; 17]).unwrap_err();
        assert!(matches!(err, Error::Resource { size: 17, limit: 16, .. }));
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        let analyzer = KernelAnalyzer::new();
        let a = analyzer.analyze(BANNER).unwrap();
        let b = analyzer.analyze(BANNER).unwrap();

        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.content_hash.len(), 64);
    }

    #[test]
    fn test_content_hash_single_byte_change() {
        let mut flipped = BANNER.to_vec();
        flipped[BANNER.len() / 2] ^= 0x01;
        assert_eq!(flipped.len(), BANNER.len());

        let analyzer = KernelAnalyzer::new();
        let a = analyzer.analyze(BANNER).unwrap();
        let b = analyzer.analyze(&flipped).unwrap();
        assert_ne!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_strings_come_from_stored_bytes() {
        let mut data = gzip(&arm64_image(BANNER));
        data.extend_from_slice(b"\0ext4_fill_super marker\0");

        let kernel = KernelAnalyzer::new().analyze(&data).unwrap();
        assert_eq!(kernel.compression, CompressionKind::Gzip);
        assert!(kernel
            .strings
            .filesystem
            .strings
            .iter()
            .any(|s| s == "ext4_fill_super marker"));
    }

    #[test]
    fn test_json_skips_buffers() {
        let kernel = KernelAnalyzer::new().analyze(BANNER).unwrap();
        let json = serde_json::to_value(&kernel).unwrap();
        assert!(json.get("raw").is_none());
        assert_eq!(json["kernel_version"], "5.15.41");
        assert_eq!(json["architecture"], "unknown");
        assert_eq!(json["security"]["selinux"]["source"], "heuristic");
    }
}
