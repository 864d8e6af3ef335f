//! Minidump structure definitions.
//!
//! The layouts here follow Microsoft's `minidumpapiset.h` plus the Breakpad
//! extension streams that Linux dumps carry. Every struct can be read with
//! `scroll::Pread` and written back with `scroll::Pwrite`, always little-endian.
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(clippy::upper_case_acronyms)]

use bitflags::bitflags;
use enum_primitive_derive::Primitive;
use scroll::ctx::{SizeWith, TryFromCtx, TryIntoCtx};
use scroll::{Endian, Pread, Pwrite, SizeWith};
use smart_default::SmartDefault;

/// An offset from the start of the minidump file.
pub type RVA = u32;

/// The 4-byte magic number at the start of a minidump file ('MDMP').
pub const MINIDUMP_SIGNATURE: u32 = 0x504d444d;

/// The version of the minidump format.
///
/// Only the low 16 bits are significant, the high 16 bits are
/// implementation-specific.
pub const MINIDUMP_VERSION: u32 = 42899;

/// The header at the start of a minidump file.
#[derive(Debug, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct MINIDUMP_HEADER {
    /// Always [`MINIDUMP_SIGNATURE`].
    pub signature: u32,
    /// [`MINIDUMP_VERSION`] in the low 16 bits.
    pub version: u32,
    /// The number of [`MINIDUMP_DIRECTORY`] entries.
    pub stream_count: u32,
    /// Offset of the stream directory, usually right after the header.
    pub stream_directory_rva: RVA,
    pub checksum: u32,
    /// Dump creation time as a `time_t`.
    pub time_date_stamp: u32,
    pub flags: u64,
}

/// A location within a minidump file: a size and an offset.
#[derive(Debug, Copy, Default, Clone, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct MINIDUMP_LOCATION_DESCRIPTOR {
    pub data_size: u32,
    pub rva: RVA,
}

/// A range of process memory embedded in the dump.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct MINIDUMP_MEMORY_DESCRIPTOR {
    /// The address of this memory in the dumped process.
    pub start_of_memory_range: u64,
    /// Where the bytes live inside the dump.
    pub memory: MINIDUMP_LOCATION_DESCRIPTOR,
}

/// An entry of the stream directory.
#[derive(Debug, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct MINIDUMP_DIRECTORY {
    /// Usually a [`MINIDUMP_STREAM_TYPE`], but user streams may use any value.
    pub stream_type: u32,
    pub location: MINIDUMP_LOCATION_DESCRIPTOR,
}

/// The types of known minidump data streams.
///
/// Values above `LastReservedStream` are Breakpad extensions (0x4767 = "Gg").
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Primitive)]
pub enum MINIDUMP_STREAM_TYPE {
    UnusedStream = 0,
    ReservedStream0 = 1,
    ReservedStream1 = 2,
    /// A count followed by [`MINIDUMP_THREAD`] entries.
    ThreadListStream = 3,
    /// A count followed by [`MINIDUMP_MODULE`] entries.
    ModuleListStream = 4,
    /// A count followed by [`MINIDUMP_MEMORY_DESCRIPTOR`] entries.
    MemoryListStream = 5,
    /// A [`MINIDUMP_EXCEPTION_STREAM`].
    ExceptionStream = 6,
    /// A [`MINIDUMP_SYSTEM_INFO`].
    SystemInfoStream = 7,
    ThreadExListStream = 8,
    Memory64ListStream = 9,
    CommentStreamA = 10,
    CommentStreamW = 11,
    HandleDataStream = 12,
    FunctionTable = 13,
    UnloadedModuleListStream = 14,
    /// A [`MINIDUMP_MISC_INFO`].
    MiscInfoStream = 15,
    MemoryInfoListStream = 16,
    ThreadInfoListStream = 17,
    HandleOperationListStream = 18,
    TokenStream = 19,
    JavaScriptDataStream = 20,
    SystemMemoryInfoStream = 21,
    ProcessVmCountersStream = 22,
    IptTraceStream = 23,
    ThreadNamesStream = 24,
    LastReservedStream = 0x0000ffff,
    /// A [`MINIDUMP_BREAKPAD_INFO`].
    BreakpadInfoStream = 0x47670001,
    AssertionInfoStream = 0x47670002,
    /// The contents of /proc/cpuinfo
    LinuxCpuInfo = 0x47670003,
    /// The contents of /proc/<pid>/status
    LinuxProcStatus = 0x47670004,
    /// The contents of /etc/lsb-release
    LinuxLsbRelease = 0x47670005,
    /// The contents of /proc/<pid>/cmdline
    LinuxCmdLine = 0x47670006,
    /// The contents of /proc/<pid>/environ
    LinuxEnviron = 0x47670007,
    /// The contents of /proc/<pid>/auxv
    LinuxAuxv = 0x47670008,
    /// The contents of /proc/<pid>/maps
    LinuxMaps = 0x47670009,
    LinuxDsoDebug = 0x4767000A,
}

impl From<MINIDUMP_STREAM_TYPE> for u32 {
    fn from(ty: MINIDUMP_STREAM_TYPE) -> Self {
        ty as u32
    }
}

/// A single executable or shared library loaded in the process.
///
/// The on-disk size is 108 bytes: the trailing reserved fields are declared
/// as pairs of `u32` so no alignment padding is inserted.
#[derive(Debug, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct MINIDUMP_MODULE {
    pub base_of_image: u64,
    pub size_of_image: u32,
    pub checksum: u32,
    pub time_date_stamp: u32,
    /// Offset of a length-prefixed UTF-16LE string holding the module path.
    pub module_name_rva: RVA,
    pub version_info: VS_FIXEDFILEINFO,
    /// Location of a CodeView record, see [`CvSignature`].
    pub cv_record: MINIDUMP_LOCATION_DESCRIPTOR,
    pub misc_record: MINIDUMP_LOCATION_DESCRIPTOR,
    pub reserved0: [u32; 2],
    pub reserved1: [u32; 2],
}

/// Version information for a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct VS_FIXEDFILEINFO {
    /// [`VS_FFI_SIGNATURE`] when the rest of the struct is meaningful.
    pub signature: u32,
    pub struct_version: u32,
    pub file_version_hi: u32,
    pub file_version_lo: u32,
    pub product_version_hi: u32,
    pub product_version_lo: u32,
    pub file_flags_mask: u32,
    pub file_flags: u32,
    pub file_os: u32,
    pub file_type: u32,
    pub file_subtype: u32,
    pub file_date_hi: u32,
    pub file_date_lo: u32,
}

/// The expected value of `VS_FIXEDFILEINFO.signature`
pub const VS_FFI_SIGNATURE: u32 = 0xfeef04bd;

/// The expected value of `VS_FIXEDFILEINFO.struct_version`
pub const VS_FFI_STRUCVERSION: u32 = 0x00010000;

/// Known values for the first four bytes of a CodeView record.
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Primitive)]
pub enum CvSignature {
    /// 'NB10', see [`CV_INFO_PDB20`]
    Pdb20 = 0x3031424e,
    /// 'RSDS', see [`CV_INFO_PDB70`]
    Pdb70 = 0x53445352,
    /// 'BpEL', a Breakpad extension carrying an ELF build id, see [`CV_INFO_ELF`]
    Elf = 0x4270454c,
}

/// CodeView record in the PDB 2.0 ("NB10") format.
#[derive(Debug, Clone)]
pub struct CV_INFO_PDB20 {
    pub cv_signature: u32,
    pub cv_offset: u32,
    pub signature: u32,
    pub age: u32,
    /// Zero-terminated PDB file name.
    pub pdb_file_name: Vec<u8>,
}

impl<'a> TryFromCtx<'a, Endian> for CV_INFO_PDB20 {
    type Error = scroll::Error;

    fn try_from_ctx(src: &'a [u8], endian: Endian) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;
        let cv_signature = src.gread_with(offset, endian)?;
        let cv_offset = src.gread_with(offset, endian)?;
        let signature = src.gread_with(offset, endian)?;
        let age = src.gread_with(offset, endian)?;
        let rest = src.len() - *offset;
        let pdb_file_name = src.gread_with::<&[u8]>(offset, rest)?.to_owned();
        Ok((
            CV_INFO_PDB20 {
                cv_signature,
                cv_offset,
                signature,
                age,
                pdb_file_name,
            },
            *offset,
        ))
    }
}

/// CodeView record in the PDB 7.0 ("RSDS") format.
#[derive(Debug, Clone)]
pub struct CV_INFO_PDB70 {
    pub cv_signature: u32,
    pub signature: GUID,
    pub age: u32,
    /// Zero-terminated PDB file name.
    pub pdb_file_name: Vec<u8>,
}

impl<'a> TryFromCtx<'a, Endian> for CV_INFO_PDB70 {
    type Error = scroll::Error;

    fn try_from_ctx(src: &'a [u8], endian: Endian) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;
        let cv_signature = src.gread_with(offset, endian)?;
        let signature = src.gread_with(offset, endian)?;
        let age = src.gread_with(offset, endian)?;
        let rest = src.len() - *offset;
        let pdb_file_name = src.gread_with::<&[u8]>(offset, rest)?.to_owned();
        Ok((
            CV_INFO_PDB70 {
                cv_signature,
                signature,
                age,
                pdb_file_name,
            },
            *offset,
        ))
    }
}

/// A GUID as laid out in `Rpcdce.h`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct GUID {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

/// An ELF build id, Breakpad's extension to CodeView records.
///
/// The build id may have any length; GNU ld emits 20 bytes by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CV_INFO_ELF {
    pub cv_signature: u32,
    pub build_id: Vec<u8>,
}

impl<'a> TryFromCtx<'a, Endian> for CV_INFO_ELF {
    type Error = scroll::Error;

    fn try_from_ctx(src: &'a [u8], endian: Endian) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;
        let cv_signature = src.gread_with(offset, endian)?;
        let rest = src.len() - *offset;
        let build_id = src.gread_with::<&[u8]>(offset, rest)?.to_owned();
        Ok((
            CV_INFO_ELF {
                cv_signature,
                build_id,
            },
            *offset,
        ))
    }
}

impl<'a> TryIntoCtx<Endian> for &'a CV_INFO_ELF {
    type Error = scroll::Error;

    fn try_into_ctx(self, dst: &mut [u8], endian: Endian) -> Result<usize, Self::Error> {
        let offset = &mut 0;
        dst.gwrite_with(self.cv_signature, offset, endian)?;
        dst.gwrite_with(self.build_id.as_slice(), offset, ())?;
        Ok(*offset)
    }
}

/// A single thread of the dumped process.
#[derive(Debug, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct MINIDUMP_THREAD {
    pub thread_id: u32,
    /// Greater than zero if the thread was suspended.
    pub suspend_count: u32,
    pub priority_class: u32,
    pub priority: u32,
    /// Thread environment block (Windows) or TLS base.
    pub teb: u64,
    /// Base address and dump location of this thread's stack memory.
    pub stack: MINIDUMP_MEMORY_DESCRIPTOR,
    /// Location of a `CONTEXT_*` struct for this thread.
    pub thread_context: MINIDUMP_LOCATION_DESCRIPTOR,
}

/// The exception that caused the dump to be written.
#[derive(Debug, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct MINIDUMP_EXCEPTION_STREAM {
    /// The thread that hit the exception.
    pub thread_id: u32,
    pub __align: u32,
    pub exception_record: MINIDUMP_EXCEPTION,
    /// Location of the `CONTEXT_*` at the time of the exception.
    pub thread_context: MINIDUMP_LOCATION_DESCRIPTOR,
}

/// Detailed information about an exception.
#[derive(Debug, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct MINIDUMP_EXCEPTION {
    /// On Linux a signal number, see [`crate::errors::ExceptionCodeLinux`].
    pub exception_code: u32,
    /// On Linux the `si_code` of the signal.
    pub exception_flags: u32,
    pub exception_record: u64,
    /// The faulting address (`si_addr`).
    pub exception_address: u64,
    /// The number of valid entries in `exception_information`.
    pub number_parameters: u32,
    pub __align: u32,
    pub exception_information: [u64; 15],
}

/// The bits of `context_flags` that identify the CPU.
pub const CONTEXT_CPU_MASK: u32 = 0xffffff00;

bitflags! {
    /// CPU type values in the `context_flags` member of `CONTEXT_` structs
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlagsCpu: u32 {
        const CONTEXT_X86 = 0x10000;
        const CONTEXT_AMD64 = 0x100000;
        const CONTEXT_ARM = 0x40000000;
        const CONTEXT_ARM64 = 0x400000;
    }
}

impl ContextFlagsCpu {
    /// Keep only the CPU bits of `flags`.
    pub fn from_flags(flags: u32) -> ContextFlagsCpu {
        ContextFlagsCpu::from_bits_truncate(flags & CONTEXT_CPU_MASK)
    }
}

bitflags! {
    /// Which parts of an x86 or amd64 context are filled in.
    ///
    /// These are the low bits of `context_flags`; the CPU bit must be
    /// or'ed in as well.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlagsX86: u32 {
        const CONTEXT_CONTROL = 0x1;
        const CONTEXT_INTEGER = 0x2;
        const CONTEXT_SEGMENTS = 0x4;
        const CONTEXT_FLOATING_POINT = 0x8;
        const CONTEXT_DEBUG_REGISTERS = 0x10;
        const CONTEXT_EXTENDED_REGISTERS = 0x20;
        const CONTEXT_FULL = Self::CONTEXT_CONTROL.bits()
            | Self::CONTEXT_INTEGER.bits()
            | Self::CONTEXT_SEGMENTS.bits();
    }
}

/// An x86-64 (amd64) CPU context, `CONTEXT` from WinNT.h.
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Pread, Pwrite, SizeWith)]
pub struct CONTEXT_AMD64 {
    pub p1_home: u64,
    pub p2_home: u64,
    pub p3_home: u64,
    pub p4_home: u64,
    pub p5_home: u64,
    pub p6_home: u64,
    pub context_flags: u32,
    pub mx_csr: u32,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
    pub eflags: u32,
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    /// Raw `XMM_SAVE_AREA32` bytes.
    #[default([0; 512])]
    pub float_save: [u8; 512],
    #[default([0; 26])]
    pub vector_register: [u128; 26],
    pub vector_control: u64,
    pub debug_control: u64,
    pub last_branch_to_rip: u64,
    pub last_branch_from_rip: u64,
    pub last_exception_to_rip: u64,
    pub last_exception_from_rip: u64,
}

/// x86 floating point state, `FLOATING_SAVE_AREA` from WinNT.h.
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Pread, Pwrite, SizeWith)]
pub struct FLOATING_SAVE_AREA_X86 {
    pub control_word: u32,
    pub status_word: u32,
    pub tag_word: u32,
    pub error_offset: u32,
    pub error_selector: u32,
    pub data_offset: u32,
    pub data_selector: u32,
    #[default([0; 80])]
    pub register_area: [u8; 80],
    pub cr0_npx_state: u32,
}

/// An x86 CPU context, `CONTEXT` from WinNT.h.
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Pread, Pwrite, SizeWith)]
pub struct CONTEXT_X86 {
    pub context_flags: u32,
    pub dr0: u32,
    pub dr1: u32,
    pub dr2: u32,
    pub dr3: u32,
    pub dr6: u32,
    pub dr7: u32,
    pub float_save: FLOATING_SAVE_AREA_X86,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ebp: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
    #[default([0; 512])]
    pub extended_registers: [u8; 512],
}

/// CPU information inside [`MINIDUMP_SYSTEM_INFO`].
///
/// This is a union in the C headers; read an [`X86CpuInfo`] out of `data`
/// with `Pread` when the architecture is x86 or amd64.
#[derive(Debug, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct CPU_INFORMATION {
    pub data: [u8; 24],
}

/// x86 CPU information derived from `cpuid`.
#[derive(Debug, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct X86CpuInfo {
    pub vendor_id: [u32; 3],
    pub version_information: u32,
    pub feature_information: u32,
    pub amd_extended_cpu_features: u32,
}

/// Processor and operating system information.
#[derive(Debug, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct MINIDUMP_SYSTEM_INFO {
    /// See [`ProcessorArchitecture`].
    pub processor_architecture: u16,
    pub processor_level: u16,
    pub processor_revision: u16,
    pub number_of_processors: u8,
    pub product_type: u8,
    pub major_version: u32,
    pub minor_version: u32,
    pub build_number: u32,
    /// See [`PlatformId`].
    pub platform_id: u32,
    /// Offset of a length-prefixed UTF-16LE string with a free-form OS version.
    pub csd_version_rva: RVA,
    pub suite_mask: u16,
    pub reserved2: u16,
    pub cpu: CPU_INFORMATION,
}

/// Known values of `MINIDUMP_SYSTEM_INFO.processor_architecture`
#[repr(u16)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Primitive)]
pub enum ProcessorArchitecture {
    PROCESSOR_ARCHITECTURE_INTEL = 0,
    PROCESSOR_ARCHITECTURE_MIPS = 1,
    PROCESSOR_ARCHITECTURE_PPC = 3,
    PROCESSOR_ARCHITECTURE_ARM = 5,
    PROCESSOR_ARCHITECTURE_AMD64 = 9,
    PROCESSOR_ARCHITECTURE_ARM64 = 12,
    PROCESSOR_ARCHITECTURE_UNKNOWN = 0xffff,
}

/// Known values of `MINIDUMP_SYSTEM_INFO.platform_id`
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Primitive)]
pub enum PlatformId {
    /// Windows NT, 2000+
    VER_PLATFORM_WIN32_NT = 3,
    /// Generic Unix-ish (Breakpad extension)
    Unix = 0x8000,
    /// macOS/Darwin (Breakpad extension)
    MacOs = 0x8101,
    /// Linux (Breakpad extension)
    Linux = 0x8201,
    /// Solaris (Breakpad extension)
    Solaris = 0x8202,
    /// Android (Breakpad extension)
    Android = 0x8203,
}

/// Miscellaneous process information, the first revision of the struct.
///
/// Later revisions only append fields, so the first `size_of_info` bytes of
/// any newer struct can be read as this one.
#[derive(Debug, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct MINIDUMP_MISC_INFO {
    pub size_of_info: u32,
    /// See [`MiscInfoFlags`].
    pub flags1: u32,
    pub process_id: u32,
    pub process_create_time: u32,
    pub process_user_time: u32,
    pub process_kernel_time: u32,
}

bitflags! {
    /// Known flags for `MINIDUMP_MISC_INFO.flags1`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MiscInfoFlags: u32 {
        const MINIDUMP_MISC1_PROCESS_ID = 0x00000001;
        const MINIDUMP_MISC1_PROCESS_TIMES = 0x00000002;
    }
}

/// Breakpad's record of which threads were involved in writing the dump.
#[derive(Debug, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct MINIDUMP_BREAKPAD_INFO {
    /// See [`BreakpadInfoValid`].
    pub validity: u32,
    /// The thread that wrote the dump.
    pub dump_thread_id: u32,
    /// The thread that crashed or asked for the dump.
    pub requesting_thread_id: u32,
}

bitflags! {
    /// Potential values for `MINIDUMP_BREAKPAD_INFO.validity`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BreakpadInfoValid: u32 {
        const DumpThreadId = 1 << 0;
        const RequestingThreadId = 1 << 1;
    }
}

/// The size of a serialized struct, as laid out in the dump.
pub fn size_of<T: SizeWith<Endian>>() -> usize {
    T::size_with(&Endian::Little)
}
