//! Kernel feature classification from the embedded configuration.

use crate::kernel::ikconfig::{ConfigValue, KernelConfig};
use serde::Serialize;
use std::fmt;
use FeatureCategory::{Filesystem, Networking, Performance, Power, Security};

/// Feature group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureCategory {
    /// Access control and hardening
    Security,
    /// Network stack
    Networking,
    /// Filesystem drivers
    Filesystem,
    /// Scheduling and CPU scaling
    Performance,
    /// Power management
    Power,
}

impl FeatureCategory {
    /// Every category, in report order
    pub const ALL: [FeatureCategory; 5] = [
        FeatureCategory::Security,
        FeatureCategory::Networking,
        FeatureCategory::Filesystem,
        FeatureCategory::Performance,
        FeatureCategory::Power,
    ];

    /// Returns the category name
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureCategory::Security => "security",
            FeatureCategory::Networking => "networking",
            FeatureCategory::Filesystem => "filesystem",
            FeatureCategory::Performance => "performance",
            FeatureCategory::Power => "power",
        }
    }
}

impl fmt::Display for FeatureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recognized configuration key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureRule {
    /// Group the key belongs to
    pub category: FeatureCategory,
    /// Key without the `CONFIG_` prefix
    pub key: &'static str,
    /// Human readable description
    pub description: &'static str,
}

const fn rule(category: FeatureCategory, key: &'static str, description: &'static str) -> FeatureRule {
    FeatureRule {
        category,
        key,
        description,
    }
}

/// Keys recognized by [`ConfigFeatureClassifier::new`]
pub const DEFAULT_RULES: &[FeatureRule] = &[
    rule(Security, "SECURITY_SELINUX", "SELinux mandatory access control"),
    rule(Security, "SECURITY_APPARMOR", "AppArmor mandatory access control"),
    rule(Security, "SECCOMP", "Seccomp system call filtering"),
    rule(Security, "DM_VERITY", "dm-verity verified boot"),
    rule(Security, "SECURITY_NETWORK", "Network security hooks"),
    rule(Security, "RANDOMIZE_BASE", "Kernel address space layout randomization"),
    rule(Security, "STACKPROTECTOR_STRONG", "Strong stack protector"),
    rule(Security, "CFI_CLANG", "Clang control flow integrity"),
    rule(Networking, "IPV6", "IPv6 support"),
    rule(Networking, "NETFILTER", "Netfilter packet filtering"),
    rule(Networking, "IP_NF_IPTABLES", "iptables support"),
    rule(Networking, "TCP_CONG_BBR", "BBR congestion control"),
    rule(Networking, "WIREGUARD", "WireGuard VPN"),
    rule(Filesystem, "EXT4_FS", "ext4 filesystem"),
    rule(Filesystem, "F2FS_FS", "f2fs filesystem"),
    rule(Filesystem, "EXFAT_FS", "exFAT filesystem"),
    rule(Filesystem, "NTFS_FS", "NTFS filesystem"),
    rule(Filesystem, "EROFS_FS", "EROFS filesystem"),
    rule(Filesystem, "FUSE_FS", "FUSE userspace filesystems"),
    rule(Performance, "SMP", "Symmetric multiprocessing"),
    rule(Performance, "PREEMPT", "Preemptible kernel"),
    rule(Performance, "CPU_FREQ", "CPU frequency scaling"),
    rule(Performance, "HOTPLUG_CPU", "CPU hotplug"),
    rule(Performance, "SCHED_MC", "Multi-core scheduler"),
    rule(Power, "PM", "Power management"),
    rule(Power, "CPU_IDLE", "CPU idle states"),
    rule(Power, "SUSPEND", "Suspend to RAM"),
    rule(Power, "HIBERNATION", "Hibernation"),
    rule(Power, "PM_WAKELOCKS", "Userspace wakelocks"),
];

/// An enabled feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Feature {
    /// Full configuration key
    pub key: String,
    /// Human readable description
    pub description: &'static str,
    /// Built as a module (`m`) rather than into the kernel (`y`)
    pub module: bool,
}

/// Enabled features, grouped by category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeatureLists {
    /// Security features
    pub security: Vec<Feature>,
    /// Networking features
    pub networking: Vec<Feature>,
    /// Filesystem features
    pub filesystem: Vec<Feature>,
    /// Performance features
    pub performance: Vec<Feature>,
    /// Power management features
    pub power: Vec<Feature>,
}

impl FeatureLists {
    /// Features of one category
    pub fn get(&self, category: FeatureCategory) -> &[Feature] {
        match category {
            FeatureCategory::Security => &self.security,
            FeatureCategory::Networking => &self.networking,
            FeatureCategory::Filesystem => &self.filesystem,
            FeatureCategory::Performance => &self.performance,
            FeatureCategory::Power => &self.power,
        }
    }

    fn get_mut(&mut self, category: FeatureCategory) -> &mut Vec<Feature> {
        match category {
            FeatureCategory::Security => &mut self.security,
            FeatureCategory::Networking => &mut self.networking,
            FeatureCategory::Filesystem => &mut self.filesystem,
            FeatureCategory::Performance => &mut self.performance,
            FeatureCategory::Power => &mut self.power,
        }
    }

    /// Total number of enabled features
    pub fn len(&self) -> usize {
        FeatureCategory::ALL.iter().map(|c| self.get(*c).len()).sum()
    }

    /// Returns true if no feature is enabled
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Maps configuration keys to feature groups
#[derive(Debug, Clone)]
pub struct ConfigFeatureClassifier {
    rules: &'static [FeatureRule],
}

impl Default for ConfigFeatureClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigFeatureClassifier {
    /// Creates a classifier with [`DEFAULT_RULES`]
    pub fn new() -> Self {
        Self::with_rules(DEFAULT_RULES)
    }

    /// Creates a classifier with a custom dictionary
    pub fn with_rules(rules: &'static [FeatureRule]) -> Self {
        Self { rules }
    }

    /// Group the enabled (`y` or `m`) keys of `config` that the dictionary knows
    pub fn classify(&self, config: &KernelConfig) -> FeatureLists {
        let mut lists = FeatureLists::default();
        for rule in self.rules {
            let key = format!("CONFIG_{}", rule.key);
            let Some(value) = config.get(&key).filter(|v| v.is_enabled()) else {
                continue;
            };
            let module = matches!(value, ConfigValue::Set(v) if v == "m");
            lists.get_mut(rule.category).push(Feature {
                key,
                description: rule.description,
                module,
            });
        }
        lists
    }
}
