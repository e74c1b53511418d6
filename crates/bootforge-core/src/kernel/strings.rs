//! Printable string extraction, bucketed by topic.

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::trace;

const SECURITY_KEYWORDS: &[&str] = &["selinux", "apparmor", "seccomp", "dm-verity", "dm_verity"];
const FILESYSTEM_KEYWORDS: &[&str] = &["ext4", "f2fs", "vfat", "ntfs", "exfat", "btrfs", "erofs"];
const DRIVER_KEYWORDS: &[&str] = &["driver", "device", "module"];

/// Topic of an extracted string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringCategory {
    /// Mentions a security mechanism
    Security,
    /// Mentions a filesystem
    Filesystem,
    /// Mentions drivers, devices or modules
    Driver,
    /// Everything else
    Other,
}

impl StringCategory {
    /// Classify one string; the first matching category wins
    pub fn of(s: &str) -> Self {
        let lower = s.to_ascii_lowercase();
        let mentions = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));
        if mentions(SECURITY_KEYWORDS) {
            StringCategory::Security
        } else if mentions(FILESYSTEM_KEYWORDS) {
            StringCategory::Filesystem
        } else if mentions(DRIVER_KEYWORDS) {
            StringCategory::Driver
        } else {
            StringCategory::Other
        }
    }
}

/// Limits applied while extracting strings
#[derive(Debug, Clone, Copy)]
pub struct StringLimits {
    /// Shortest printable run kept
    pub min_len: usize,
    /// Strings retained per category
    pub max_per_category: usize,
    /// Retained strings are cut to this many bytes
    pub max_len: usize,
}

/// Strings of one category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringBucket {
    /// Distinct strings seen in this category, retained or not
    pub total: usize,
    /// The first strings seen, up to the per-category cap
    pub strings: Vec<String>,
}

impl StringBucket {
    fn push(&mut self, s: &str, limits: &StringLimits) {
        self.total += 1;
        if self.strings.len() < limits.max_per_category {
            self.strings.push(s[..s.len().min(limits.max_len)].to_string());
        }
    }
}

/// Extracted strings, one bucket per category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringBuckets {
    /// Security related strings
    pub security: StringBucket,
    /// Filesystem related strings
    pub filesystem: StringBucket,
    /// Driver related strings
    pub driver: StringBucket,
    /// Uncategorized strings
    pub other: StringBucket,
}

impl StringBuckets {
    /// Bucket for `category`
    pub fn get(&self, category: StringCategory) -> &StringBucket {
        match category {
            StringCategory::Security => &self.security,
            StringCategory::Filesystem => &self.filesystem,
            StringCategory::Driver => &self.driver,
            StringCategory::Other => &self.other,
        }
    }

    fn get_mut(&mut self, category: StringCategory) -> &mut StringBucket {
        match category {
            StringCategory::Security => &mut self.security,
            StringCategory::Filesystem => &mut self.filesystem,
            StringCategory::Driver => &mut self.driver,
            StringCategory::Other => &mut self.other,
        }
    }
}

/// Extract printable ASCII runs from `data` and bucket them
pub fn extract_strings(data: &[u8], limits: &StringLimits) -> StringBuckets {
    let mut buckets = StringBuckets::default();
    let Ok(printable) = Regex::new(&format!(r"(?-u)[\x20-\x7E]{{{},}}", limits.min_len.max(1)))
    else {
        return buckets;
    };

    let mut seen = HashSet::new();
    for found in printable.find_iter(data) {
        let bytes = found.as_bytes();
        if !seen.insert(bytes) {
            continue;
        }
        // Printable ASCII is always valid UTF-8
        let s = String::from_utf8_lossy(bytes);
        buckets.get_mut(StringCategory::of(&s)).push(&s, limits);
    }

    trace!(
        "{} distinct strings: {} security, {} filesystem, {} driver",
        seen.len(),
        buckets.security.total,
        buckets.filesystem.total,
        buckets.driver.total
    );
    buckets
}
