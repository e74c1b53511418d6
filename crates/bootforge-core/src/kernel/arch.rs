//! Architecture detection from boot stub signatures.
//!
//! Only fixed-offset signatures are trusted. A buffer that matches none of
//! them is [`Architecture::Unknown`]; nothing is inferred from string content.

use serde::{Deserialize, Serialize};
use std::fmt;

const ELF_MAGIC: &[u8] = b"\x7FELF";
const ELF_DATA_OFFSET: usize = 5;
const ELF_MACHINE_OFFSET: usize = 18;
const EM_386: u16 = 3;
const EM_ARM: u16 = 40;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

/// `Image` header magic of an arm64 kernel
const ARM64_MAGIC: &[u8] = b"ARM\x64";
const ARM64_MAGIC_OFFSET: usize = 0x38;

/// `zImage` magic of a 32-bit ARM kernel
const ZIMAGE_MAGIC: u32 = 0x016F_2818;
const ZIMAGE_MAGIC_OFFSET: usize = 0x24;

/// x86 real-mode setup header
const X86_SETUP_MAGIC: &[u8] = b"HdrS";
const X86_SETUP_MAGIC_OFFSET: usize = 0x202;
const X86_PROTOCOL_OFFSET: usize = 0x206;
const X86_XLOADFLAGS_OFFSET: usize = 0x236;
/// First boot protocol carrying `xloadflags`
const X86_PROTOCOL_XLOADFLAGS: u16 = 0x020C;
const XLF_KERNEL_64: u16 = 1;

/// CPU architecture a kernel was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// 32-bit ARM
    Arm,
    /// AArch64
    Arm64,
    /// 32-bit x86
    X86,
    /// x86-64
    X86_64,
    /// No known signature matched
    Unknown,
}

impl Architecture {
    /// Returns the conventional short name
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Arm => "arm",
            Architecture::Arm64 => "arm64",
            Architecture::X86 => "x86",
            Architecture::X86_64 => "x86_64",
            Architecture::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identify the architecture from the boot stub at the start of `data`
pub fn detect_architecture(data: &[u8]) -> Architecture {
    if data.starts_with(ELF_MAGIC) {
        return elf_machine(data);
    }
    if data.get(ARM64_MAGIC_OFFSET..ARM64_MAGIC_OFFSET + ARM64_MAGIC.len()) == Some(ARM64_MAGIC) {
        return Architecture::Arm64;
    }
    if read_u32_le(data, ZIMAGE_MAGIC_OFFSET) == Some(ZIMAGE_MAGIC) {
        return Architecture::Arm;
    }
    if data.get(X86_SETUP_MAGIC_OFFSET..X86_SETUP_MAGIC_OFFSET + X86_SETUP_MAGIC.len())
        == Some(X86_SETUP_MAGIC)
    {
        let protocol = read_u16_le(data, X86_PROTOCOL_OFFSET).unwrap_or(0);
        let xloadflags = read_u16_le(data, X86_XLOADFLAGS_OFFSET).unwrap_or(0);
        if protocol >= X86_PROTOCOL_XLOADFLAGS && xloadflags & XLF_KERNEL_64 != 0 {
            return Architecture::X86_64;
        }
        return Architecture::X86;
    }
    Architecture::Unknown
}

fn elf_machine(data: &[u8]) -> Architecture {
    let Some(raw) = data.get(ELF_MACHINE_OFFSET..ELF_MACHINE_OFFSET + 2) else {
        return Architecture::Unknown;
    };
    let machine = match data.get(ELF_DATA_OFFSET) {
        Some(2) => u16::from_be_bytes([raw[0], raw[1]]),
        _ => u16::from_le_bytes([raw[0], raw[1]]),
    };
    match machine {
        EM_ARM => Architecture::Arm,
        EM_AARCH64 => Architecture::Arm64,
        EM_386 => Architecture::X86,
        EM_X86_64 => Architecture::X86_64,
        _ => Architecture::Unknown,
    }
}

fn read_u16_le(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
