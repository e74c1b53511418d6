//! Embedded kernel configuration (`CONFIG_IKCONFIG`).
//!
//! The build embeds a gzip copy of `.config` between the markers `IKCFG_ST`
//! and `IKCFG_ED`. Its lines are `CONFIG_KEY=value` or
//! `# CONFIG_KEY is not set`; everything else is a comment.

use crate::codec::{self, CompressionKind};
use bstr::ByteSlice;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::{debug, warn};

/// Marker preceding the compressed config
pub const IKCONFIG_START: &[u8] = b"IKCFG_ST";
/// Marker following the compressed config
pub const IKCONFIG_END: &[u8] = b"IKCFG_ED";

/// Value of one configuration key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// `CONFIG_KEY=value` (quotes around string values are removed)
    Set(String),
    /// `# CONFIG_KEY is not set`
    NotSet,
}

impl ConfigValue {
    /// Returns true for `y` (built in) and `m` (module)
    pub fn is_enabled(&self) -> bool {
        matches!(self, ConfigValue::Set(value) if value == "y" || value == "m")
    }

    /// The raw value, if the key is set
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Set(value) => Some(value),
            ConfigValue::NotSet => None,
        }
    }
}

/// Parsed kernel configuration, keyed by the full `CONFIG_` name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelConfig {
    entries: BTreeMap<String, ConfigValue>,
}

impl KernelConfig {
    /// Parse `.config` text
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in text.lines().map(str::trim) {
            if let Some(comment) = line.strip_prefix('#') {
                if let Some(key) = comment.trim().strip_suffix(" is not set") {
                    if key.starts_with("CONFIG_") {
                        entries.insert(key.to_string(), ConfigValue::NotSet);
                    }
                }
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if !key.starts_with("CONFIG_") {
                continue;
            }
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            entries.insert(key.to_string(), ConfigValue::Set(value.to_string()));
        }
        Self { entries }
    }

    /// Value of `key` (full name, e.g. `CONFIG_SMP`)
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.entries.get(key)
    }

    /// Returns true when `key` is `y` or `m`
    pub fn is_enabled(&self, key: &str) -> bool {
        self.get(key).is_some_and(ConfigValue::is_enabled)
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no keys were parsed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys and values in sorted key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, ConfigValue)> for KernelConfig {
    fn from_iter<I: IntoIterator<Item = (String, ConfigValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Byte range of the compressed config inside `data`, if both markers exist
pub fn locate(data: &[u8]) -> Option<Range<usize>> {
    let start = data.find(IKCONFIG_START)? + IKCONFIG_START.len();
    let end = start + data[start..].find(IKCONFIG_END)?;
    Some(start..end)
}

/// Extract and parse the embedded config.
///
/// A missing marker yields an empty config. So does a corrupt stream, with a
/// warning, since the rest of the analysis does not depend on it.
pub fn extract(data: &[u8], limit: usize) -> KernelConfig {
    let Some(range) = locate(data) else {
        debug!("No IKCONFIG markers");
        return KernelConfig::default();
    };
    debug!("IKCONFIG stream at {:#x}..{:#x}", range.start, range.end);

    match codec::decompress_bounded(&data[range.clone()], CompressionKind::Gzip, limit) {
        Ok(text) => {
            let config = KernelConfig::parse(&String::from_utf8_lossy(&text));
            debug!("Parsed {} config entries", config.len());
            config
        }
        Err(e) => {
            warn!("Embedded config at {:#x} is unreadable: {}", range.start, e);
            KernelConfig::default()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    /// Wrap `text` the way the kernel build embeds it
    pub(crate) fn embedded(text: &str) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        let mut data = IKCONFIG_START.to_vec();
        data.extend_from_slice(&encoder.finish().unwrap());
        data.extend_from_slice(IKCONFIG_END);
        data
    }

    #[test]
    fn test_parse_lines() {
        let config = KernelConfig::parse(
            "#\n# Automatically generated file; DO NOT EDIT.\n#\n\
             CONFIG_SMP=y\n\
             CONFIG_EXT4_FS=m\n\
             CONFIG_LOCALVERSION=\"-perf\"\n\
             CONFIG_NR_CPUS=8\n\
             # CONFIG_HIBERNATION is not set\n\
             NOT_A_CONFIG=y\n",
        );

        assert_eq!(config.len(), 5);
        assert!(config.is_enabled("CONFIG_SMP"));
        assert!(config.is_enabled("CONFIG_EXT4_FS"));
        assert!(!config.is_enabled("CONFIG_NR_CPUS"));
        assert_eq!(config.get("CONFIG_LOCALVERSION").and_then(ConfigValue::as_str), Some("-perf"));
        assert_eq!(config.get("CONFIG_HIBERNATION"), Some(&ConfigValue::NotSet));
        assert_eq!(config.get("NOT_A_CONFIG"), None);
    }

    #[test]
    fn test_extract_between_markers() {
        let mut kernel = b"\x00\x01 code before ".to_vec();
        kernel.extend_from_slice(&embedded("CONFIG_SELINUX=y\n# CONFIG_FOO is not set\n"));
        kernel.extend_from_slice(b" code after");

        let config = extract(&kernel, usize::MAX);
        assert_eq!(config.len(), 2);
        assert!(config.is_enabled("CONFIG_SELINUX"));
        assert_eq!(config.get("CONFIG_FOO"), Some(&ConfigValue::NotSet));
    }

    #[test]
    fn test_missing_or_corrupt_is_empty() {
        assert!(extract(b"IKCFG_ST but never closed", usize::MAX).is_empty());
        assert!(extract(b"no markers at all", usize::MAX).is_empty());
        assert!(extract(b"IKCFG_ST\x1f\x8b\x08garbageIKCFG_ED", usize::MAX).is_empty());
    }

    #[test]
    fn test_json_shape() {
        let config = KernelConfig::parse("CONFIG_SMP=y\n# CONFIG_PM is not set\n");
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"CONFIG_PM":null,"CONFIG_SMP":"y"}"#);
    }
}
