// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Information about the system that produced a `Minidump`.

use std::borrow::Cow;
use std::fmt;

use minidump_common::format::{PlatformId, ProcessorArchitecture};
use num_traits::FromPrimitive;

/// Known operating systems.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Os {
    Windows,
    MacOs,
    Linux,
    Solaris,
    Android,
    Unknown(u32),
}

impl Os {
    /// Get an `Os` value matching the `platform_id` of a system info stream.
    pub fn from_platform_id(id: u32) -> Os {
        match PlatformId::from_u32(id) {
            Some(PlatformId::VER_PLATFORM_WIN32_NT) => Os::Windows,
            Some(PlatformId::MacOs) => Os::MacOs,
            Some(PlatformId::Linux) => Os::Linux,
            Some(PlatformId::Solaris) => Os::Solaris,
            Some(PlatformId::Android) => Os::Android,
            _ => Os::Unknown(id),
        }
    }

    /// The `platform_id` value this `Os` is stored as.
    pub fn platform_id(&self) -> u32 {
        match *self {
            Os::Windows => PlatformId::VER_PLATFORM_WIN32_NT as u32,
            Os::MacOs => PlatformId::MacOs as u32,
            Os::Linux => PlatformId::Linux as u32,
            Os::Solaris => PlatformId::Solaris as u32,
            Os::Android => PlatformId::Android as u32,
            Os::Unknown(id) => id,
        }
    }

    /// Get a human-readable friendly name for an `Os`.
    pub fn long_name(&self) -> Cow<'_, str> {
        match *self {
            Os::Windows => Cow::Borrowed("Windows NT"),
            Os::MacOs => Cow::Borrowed("Mac OS X"),
            Os::Linux => Cow::Borrowed("Linux"),
            Os::Solaris => Cow::Borrowed("Solaris"),
            Os::Android => Cow::Borrowed("Android"),
            Os::Unknown(val) => Cow::Owned(format!("{val:#08x}")),
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                Os::Windows => "windows",
                Os::MacOs => "mac",
                Os::Linux => "linux",
                Os::Solaris => "solaris",
                Os::Android => "android",
                Os::Unknown(_) => "unknown",
            }
        )
    }
}

/// Known CPU types.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Cpu {
    X86,
    X86_64,
    Arm,
    Arm64,
    Unknown(u32),
}

impl Cpu {
    /// Get a `Cpu` value matching the `processor_architecture` of a system info stream.
    pub fn from_processor_architecture(arch: u16) -> Cpu {
        match ProcessorArchitecture::from_u16(arch) {
            Some(ProcessorArchitecture::PROCESSOR_ARCHITECTURE_INTEL) => Cpu::X86,
            Some(ProcessorArchitecture::PROCESSOR_ARCHITECTURE_AMD64) => Cpu::X86_64,
            Some(ProcessorArchitecture::PROCESSOR_ARCHITECTURE_ARM) => Cpu::Arm,
            Some(ProcessorArchitecture::PROCESSOR_ARCHITECTURE_ARM64) => Cpu::Arm64,
            _ => Cpu::Unknown(arch as u32),
        }
    }

    /// The `processor_architecture` value this `Cpu` is stored as.
    pub fn processor_architecture(&self) -> u16 {
        match *self {
            Cpu::X86 => ProcessorArchitecture::PROCESSOR_ARCHITECTURE_INTEL as u16,
            Cpu::X86_64 => ProcessorArchitecture::PROCESSOR_ARCHITECTURE_AMD64 as u16,
            Cpu::Arm => ProcessorArchitecture::PROCESSOR_ARCHITECTURE_ARM as u16,
            Cpu::Arm64 => ProcessorArchitecture::PROCESSOR_ARCHITECTURE_ARM64 as u16,
            Cpu::Unknown(arch) => arch as u16,
        }
    }

    pub fn pointer_width(&self) -> PointerWidth {
        match self {
            Cpu::X86 | Cpu::Arm => PointerWidth::Bits32,
            Cpu::X86_64 | Cpu::Arm64 => PointerWidth::Bits64,
            Cpu::Unknown(_) => PointerWidth::Unknown,
        }
    }
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                Cpu::X86 => "x86",
                Cpu::X86_64 => "amd64",
                Cpu::Arm => "arm",
                Cpu::Arm64 => "arm64",
                Cpu::Unknown(_) => "unknown",
            }
        )
    }
}

/// The width of a pointer on the dumped system.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PointerWidth {
    Unknown,
    Bits32,
    Bits64,
}

impl PointerWidth {
    /// Size of a pointer in bytes, if known.
    pub fn size_in_bytes(self) -> Option<u8> {
        match self {
            PointerWidth::Unknown => None,
            PointerWidth::Bits32 => Some(4),
            PointerWidth::Bits64 => Some(8),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_os_roundtrip() {
        for os in [Os::Linux, Os::Windows, Os::Android, Os::Unknown(0x1234)] {
            assert_eq!(Os::from_platform_id(os.platform_id()), os);
        }
        assert_eq!(Os::Linux.to_string(), "linux");
        assert_eq!(Os::Linux.long_name(), "Linux");
    }

    #[test]
    fn test_cpu_pointer_width() {
        assert_eq!(Cpu::from_processor_architecture(9), Cpu::X86_64);
        assert_eq!(Cpu::X86.pointer_width().size_in_bytes(), Some(4));
        assert_eq!(Cpu::Unknown(77).pointer_width(), PointerWidth::Unknown);
    }
}
