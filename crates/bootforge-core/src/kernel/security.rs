//! Security feature fingerprinting.
//!
//! Each flag is decided by the first source that has an opinion:
//!
//! 1. the embedded config, if it contains one of the flag's authoritative keys
//!    (the first key present decides; `y`/`m` is on, anything else is off)
//! 2. a case-insensitive search of the kernel for the flag's literal tokens
//!
//! The result is a pure function of the config and the bytes.

use super::ikconfig::KernelConfig;
use regex::bytes::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Where a flag's value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    /// An authoritative key in the embedded config
    Config,
    /// A literal token found in the kernel bytes
    Heuristic,
}

/// One detected security feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFlag {
    /// Whether the feature is present
    pub enabled: bool,
    /// Which signal decided it
    pub source: SignalSource,
}

/// Security features of a kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFlags {
    /// SELinux
    pub selinux: SecurityFlag,
    /// dm-verity
    pub dm_verity: SecurityFlag,
    /// seccomp
    pub seccomp: SecurityFlag,
    /// KASLR
    pub kaslr: SecurityFlag,
}

struct Rule {
    config_keys: &'static [&'static str],
    tokens: &'static [&'static str],
}

const SELINUX: Rule = Rule {
    config_keys: &["CONFIG_SECURITY_SELINUX", "CONFIG_SELINUX"],
    tokens: &["selinux"],
};
const DM_VERITY: Rule = Rule {
    config_keys: &["CONFIG_DM_VERITY"],
    tokens: &["dm-verity", "dm_verity"],
};
const SECCOMP: Rule = Rule {
    config_keys: &["CONFIG_SECCOMP", "CONFIG_SECCOMP_FILTER"],
    tokens: &["seccomp"],
};
const KASLR: Rule = Rule {
    config_keys: &["CONFIG_RANDOMIZE_BASE"],
    tokens: &["kaslr"],
};

/// Merge config and byte-search signals into [`SecurityFlags`]
pub fn merge_security_signals(config: &KernelConfig, data: &[u8]) -> SecurityFlags {
    SecurityFlags {
        selinux: decide("selinux", &SELINUX, config, data),
        dm_verity: decide("dm_verity", &DM_VERITY, config, data),
        seccomp: decide("seccomp", &SECCOMP, config, data),
        kaslr: decide("kaslr", &KASLR, config, data),
    }
}

fn decide(name: &str, rule: &Rule, config: &KernelConfig, data: &[u8]) -> SecurityFlag {
    if let Some((key, value)) = rule
        .config_keys
        .iter()
        .find_map(|key| config.get(key).map(|value| (key, value)))
    {
        let enabled = value.is_enabled();
        trace!("{}: {} from {} = {:?}", name, enabled, key, value);
        return SecurityFlag {
            enabled,
            source: SignalSource::Config,
        };
    }

    let enabled = rule.tokens.iter().any(|token| contains_ignore_case(data, token));
    trace!("{}: {} from byte search", name, enabled);
    SecurityFlag {
        enabled,
        source: SignalSource::Heuristic,
    }
}

fn contains_ignore_case(data: &[u8], token: &str) -> bool {
    RegexBuilder::new(&regex::escape(token))
        .case_insensitive(true)
        .unicode(false)
        .build()
        .map(|re| re.is_match(data))
        .unwrap_or(false)
}

impl SecurityFlags {
    /// Flags paired with their names, in a fixed order
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, SecurityFlag)> {
        [
            ("selinux", self.selinux),
            ("dm_verity", self.dm_verity),
            ("seccomp", self.seccomp),
            ("kaslr", self.kaslr),
        ]
        .into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(text: &str) -> KernelConfig {
        KernelConfig::parse(text)
    }

    #[test]
    fn test_config_wins_over_strings() {
        // The binary mentions selinux, but the config says it is off
        let flags = merge_security_signals(
            &config("# CONFIG_SECURITY_SELINUX is not set\n"),
            b"avc: denied by SELinux policy",
        );
        assert_eq!(
            flags.selinux,
            SecurityFlag { enabled: false, source: SignalSource::Config }
        );
    }

    #[test]
    fn test_heuristic_fallback() {
        let flags = merge_security_signals(
            &KernelConfig::default(),
            b"device-mapper: DM-VERITY corruption; Seccomp filter",
        );
        assert_eq!(
            flags.dm_verity,
            SecurityFlag { enabled: true, source: SignalSource::Heuristic }
        );
        assert!(flags.seccomp.enabled);
        assert!(!flags.selinux.enabled);
        assert_eq!(flags.kaslr.source, SignalSource::Heuristic);
    }

    #[test]
    fn test_alias_key_and_first_key_precedence() {
        let flags = merge_security_signals(&config("CONFIG_SELINUX=y\n"), b"");
        assert!(flags.selinux.enabled);
        assert_eq!(flags.selinux.source, SignalSource::Config);

        let flags = merge_security_signals(
            &config("CONFIG_SECCOMP=n\nCONFIG_SECCOMP_FILTER=y\n"),
            b"seccomp",
        );
        assert!(!flags.seccomp.enabled);
    }

    #[test]
    fn test_module_counts_as_enabled() {
        let flags = merge_security_signals(&config("CONFIG_DM_VERITY=m\n"), b"");
        assert!(flags.dm_verity.enabled);
        assert_eq!(flags.iter().count(), 4);
    }
}
