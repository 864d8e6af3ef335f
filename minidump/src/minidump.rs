// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::iter;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::path::Path;

use debugid::{CodeId, DebugId};
use encoding_rs::{UTF_16BE, UTF_16LE};
use memmap2::Mmap;
use minidump_common::errors as err;
use minidump_common::format::{self as md, CvSignature, MINIDUMP_STREAM_TYPE};
use minidump_common::traits::{IntoRangeMapSafe, Module};
use minidump_common::utils::basename;
use num_traits::FromPrimitive;
use range_map::{Range, RangeMap};
use scroll::ctx::{SizeWith, TryFromCtx};
use scroll::{Pread, BE, LE};
use time::format_description::well_known::Rfc3339;
use tracing::warn;
use uuid::Uuid;

use crate::context::MinidumpContext;
use crate::memory::{read_from_region, MemoryReadError, MemoryReader};
use crate::system_info::{Cpu, Os, PointerWidth};

/// An index into the contents of a minidump.
///
/// The `Minidump` struct represents the parsed header and
/// indices contained at the start of a minidump file. It can be instantiated
/// by calling the [`Minidump::read`][read] or
/// [`Minidump::read_path`][read_path] methods.
///
/// ```no_run
/// use minidump::{Minidump, MinidumpThreadList, Error};
///
/// fn work() -> Result<(), Error> {
///     let dump = Minidump::read_path("../testdata/test.dmp")?;
///     let thread_list = dump.get_stream::<MinidumpThreadList>()?;
///     for t in &thread_list.threads {
///         println!("Thread {:#x}", t.raw.thread_id);
///     }
///     Ok(())
/// }
/// ```
///
/// [read]: Minidump::read
/// [read_path]: Minidump::read_path
pub struct Minidump<'a, T>
where
    T: Deref<Target = [u8]> + 'a,
{
    data: T,
    /// The raw minidump header from the file.
    pub header: md::MINIDUMP_HEADER,
    streams: HashMap<u32, (u32, md::MINIDUMP_DIRECTORY)>,
    system_info: Option<MinidumpSystemInfo>,
    /// The endianness of this minidump file.
    pub endian: scroll::Endian,
    _phantom: PhantomData<&'a [u8]>,
}

/// Errors encountered while reading a `Minidump`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("File not found")]
    FileNotFound,
    #[error("I/O error")]
    IoError,
    #[error("Not a minidump (bad signature)")]
    BadSignature,
    #[error("Minidump version mismatch")]
    VersionMismatch,
    #[error("Minidump is truncated")]
    Truncated,
    #[error("Required stream {0} is missing")]
    UnknownRequiredStream(&'static str),
    #[error("Error reading stream")]
    StreamReadFailure,
    #[error("Stream size mismatch: expected {expected} bytes, found {actual} bytes")]
    StreamSizeMismatch { expected: usize, actual: usize },
    #[error("Stream not found")]
    StreamNotFound,
    #[error("Module read failure")]
    ModuleReadFailure,
    #[error("Memory read failure")]
    MemoryReadFailure,
    #[error("Data error")]
    DataError,
    #[error("Error reading CodeView data")]
    CodeViewReadFailure,
}

impl Error {
    /// Returns just the name of the error, as a more human-friendly version of
    /// an error-code for error logging.
    pub fn name(&self) -> &'static str {
        match self {
            Error::FileNotFound => "FileNotFound",
            Error::IoError => "IoError",
            Error::BadSignature => "BadSignature",
            Error::VersionMismatch => "VersionMismatch",
            Error::Truncated => "Truncated",
            Error::UnknownRequiredStream(_) => "UnknownRequiredStream",
            Error::StreamReadFailure => "StreamReadFailure",
            Error::StreamSizeMismatch { .. } => "StreamSizeMismatch",
            Error::StreamNotFound => "StreamNotFound",
            Error::ModuleReadFailure => "ModuleReadFailure",
            Error::MemoryReadFailure => "MemoryReadFailure",
            Error::DataError => "DataError",
            Error::CodeViewReadFailure => "CodeViewReadFailure",
        }
    }
}

/// The fundamental unit of data in a `Minidump`.
pub trait MinidumpStream<'a>: Sized {
    /// The stream type constant used in the `md::MINIDUMP_DIRECTORY` entry.
    const STREAM_TYPE: u32;

    /// Read this `MinidumpStream` type from `bytes`.
    ///
    /// * `bytes` is the contents of this specific stream.
    /// * `all` refers to the full contents of the minidump, for reading auxilliary data
    ///   referred to with `MINIDUMP_LOCATION_DESCRIPTOR`s.
    /// * `system_info` is the preparsed SystemInfo stream, if it exists in the minidump.
    fn read(
        bytes: &'a [u8],
        all: &'a [u8],
        endian: scroll::Endian,
        system_info: Option<&MinidumpSystemInfo>,
    ) -> Result<Self, Error>;
}

/// CodeView data describes how to locate debug symbols.
#[derive(Debug, Clone)]
pub enum CodeView {
    /// PDB 2.0 format data.
    Pdb20(md::CV_INFO_PDB20),
    /// PDB 7.0 format data.
    Pdb70(md::CV_INFO_PDB70),
    /// An ELF build id.
    Elf(md::CV_INFO_ELF),
    /// An unknown format containing the raw bytes of data.
    Unknown(Vec<u8>),
}

/// An executable or shared library loaded in the process at the time the `Minidump` was written.
#[derive(Debug, Clone)]
pub struct MinidumpModule {
    /// The `MINIDUMP_MODULE` direct from the minidump file.
    pub raw: md::MINIDUMP_MODULE,
    /// The module name. This is stored separately in the minidump.
    pub name: String,
    /// A `CodeView` record, if one is present.
    pub codeview_info: Option<CodeView>,
    debug_id: Option<DebugId>,
}

/// A list of `MinidumpModule`s contained in a `Minidump`.
#[derive(Debug, Clone)]
pub struct MinidumpModuleList {
    /// The modules, in the order they were stored in the minidump.
    modules: Vec<MinidumpModule>,
    /// Map from address range to index in modules. Use `MinidumpModuleList::module_at_address`.
    modules_by_addr: RangeMap<u64, usize>,
}

/// The state of a thread from the process when the minidump was written.
#[derive(Debug)]
pub struct MinidumpThread<'a> {
    /// The `MINIDUMP_THREAD` direct from the minidump file.
    pub raw: md::MINIDUMP_THREAD,
    /// The CPU context for the thread, if present.
    context: Option<&'a [u8]>,
    /// The stack memory for the thread, if present.
    pub stack: Option<MinidumpMemory<'a>>,
    endian: scroll::Endian,
}

/// A list of `MinidumpThread`s contained in a `Minidump`.
#[derive(Debug)]
pub struct MinidumpThreadList<'a> {
    /// The threads, in the order they were present in the `Minidump`.
    pub threads: Vec<MinidumpThread<'a>>,
    /// A map of thread id to index in `threads`.
    thread_ids: HashMap<u32, usize>,
}

/// Information about the system that generated the minidump.
#[derive(Debug, Clone)]
pub struct MinidumpSystemInfo {
    /// The `MINIDUMP_SYSTEM_INFO` direct from the minidump.
    pub raw: md::MINIDUMP_SYSTEM_INFO,
    /// The operating system that generated the minidump.
    pub os: Os,
    /// The CPU on which the minidump was generated.
    pub cpu: Cpu,
    /// A free-form OS version string; on Linux the `uname` output.
    pub csd_version: Option<String>,
    /// A string identifying the specific CPU, such as
    /// "GenuineIntel family 6 model 158 stepping 10".
    pub cpu_info: Option<String>,
}

/// A region of memory from the process that wrote the minidump.
#[derive(Debug, Clone)]
pub struct MinidumpMemory<'a> {
    /// The raw `MINIDUMP_MEMORY_DESCRIPTOR` from the minidump.
    pub desc: md::MINIDUMP_MEMORY_DESCRIPTOR,
    /// The starting address of this range of memory.
    pub base_address: u64,
    /// The length of this range of memory.
    pub size: u64,
    /// The contents of the memory.
    pub bytes: &'a [u8],
    /// The byte order of the minidump this memory came from.
    pub endian: scroll::Endian,
}

/// A list of memory regions included in a minidump.
#[derive(Debug, Clone)]
pub struct MinidumpMemoryList<'a> {
    /// The memory regions, in the order they were stored in the minidump.
    regions: Vec<MinidumpMemory<'a>>,
    /// Map from address range to index in regions. Use `MinidumpMemoryList::memory_at_address`.
    regions_by_addr: RangeMap<u64, usize>,
}

/// Miscellaneous information about the process that wrote the minidump.
#[derive(Debug, Clone)]
pub struct MinidumpMiscInfo {
    /// The first revision of `MINIDUMP_MISC_INFO`, the only one Linux writers emit.
    pub raw: md::MINIDUMP_MISC_INFO,
}

/// Additional information about process state.
///
/// Breakpad-generated minidumps record which thread wrote the dump and which
/// thread requested it (usually the crashing thread).
#[derive(Debug, Clone)]
pub struct MinidumpBreakpadInfo {
    pub raw: md::MINIDUMP_BREAKPAD_INFO,
    /// The thread that wrote the minidump.
    pub dump_thread_id: Option<u32>,
    /// The thread that requested that a minidump be written.
    pub requesting_thread_id: Option<u32>,
}

/// The contents of `/etc/lsb-release` from a Linux system.
#[derive(Debug, Clone)]
pub struct MinidumpLinuxLsbRelease<'a> {
    data: &'a [u8],
}

/// A raw Breakpad Linux stream (`/proc` files copied verbatim into the dump).
#[derive(Debug, Clone)]
pub struct MinidumpLinuxStream<'a> {
    pub stream_type: MINIDUMP_STREAM_TYPE,
    pub data: &'a [u8],
}

/// The reason for a process crash.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CrashReason {
    /// A Linux signal with no other interesting metadata.
    LinuxGeneral(err::ExceptionCodeLinux, u32),
    LinuxSigill(err::ExceptionCodeLinuxSigillKind),
    LinuxSigbus(err::ExceptionCodeLinuxSigbusKind),
    LinuxSigfpe(err::ExceptionCodeLinuxSigfpeKind),
    LinuxSigsegv(err::ExceptionCodeLinuxSigsegvKind),

    /// An exception code and flags with no known meaning.
    Unknown(u32, u32),
}

/// Information about the exception that caused the minidump to be generated.
///
/// `MinidumpException` wraps `MINIDUMP_EXCEPTION_STREAM`. It also provides
/// access to the CPU context of the exception thread at the time the
/// exception occurred, which should be preferred over the thread's own
/// context: the latter usually points into the handler that wrote the dump.
#[derive(Debug)]
pub struct MinidumpException<'a> {
    /// The raw exception information from the minidump stream.
    pub raw: md::MINIDUMP_EXCEPTION_STREAM,
    /// The thread that encountered this exception.
    pub thread_id: u32,
    context: Option<&'a [u8]>,
    endian: scroll::Endian,
}

//======================================================
// Implementations

fn format_time_t(t: u32) -> String {
    time::OffsetDateTime::from_unix_timestamp(t as i64)
        .ok()
        .and_then(|datetime| datetime.format(&Rfc3339).ok())
        .unwrap_or_default()
}

/// Produce a slice of `bytes` corresponding to the offset and size in `loc`, or an
/// `Error` if the data is not fully contained within `bytes`.
fn location_slice<'a>(
    bytes: &'a [u8],
    loc: &md::MINIDUMP_LOCATION_DESCRIPTOR,
) -> Result<&'a [u8], Error> {
    let start = loc.rva as usize;
    start
        .checked_add(loc.data_size as usize)
        .and_then(|end| bytes.get(start..end))
        .ok_or(Error::Truncated)
}

/// Read a u32 length-prefixed UTF-16 string from `bytes` at `offset`.
fn read_string_utf16(offset: &mut usize, bytes: &[u8], endian: scroll::Endian) -> Option<String> {
    let u: u32 = bytes.gread_with(offset, endian).ok()?;
    let size = u as usize;
    if size % 2 != 0 {
        return None;
    }
    let end = offset.checked_add(size)?;
    let raw = bytes.get(*offset..end)?;
    let encoding = match endian {
        scroll::Endian::Little => UTF_16LE,
        scroll::Endian::Big => UTF_16BE,
    };
    let s = encoding
        .decode_without_bom_handling_and_without_replacement(raw)?
        .into_owned();
    *offset = end;
    Some(s)
}

/// Whether the u32 length-prefixed string at `rva` lies within `bytes`.
fn string_in_bounds(bytes: &[u8], rva: u32, endian: scroll::Endian) -> bool {
    let start = rva as usize;
    bytes
        .pread_with::<u32>(start, endian)
        .ok()
        .and_then(|len| start.checked_add(4)?.checked_add(len as usize))
        .is_some_and(|end| end <= bytes.len())
}

/// Convert `bytes` with trailing NUL characters to a string
fn string_from_bytes_nul(bytes: &[u8]) -> Option<Cow<'_, str>> {
    bytes.split(|&b| b == 0).next().map(String::from_utf8_lossy)
}

/// Format `bytes` as a String of hex digits
fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Attempt to read a CodeView record from `data` at `location`
fn read_codeview(
    location: &md::MINIDUMP_LOCATION_DESCRIPTOR,
    data: &[u8],
    endian: scroll::Endian,
) -> Option<CodeView> {
    let bytes = location_slice(data, location).ok()?;
    // The signature says which of the known layouts follows.
    let signature: u32 = bytes.pread_with(0, endian).ok()?;
    Some(match CvSignature::from_u32(signature) {
        Some(CvSignature::Pdb70) => CodeView::Pdb70(bytes.pread_with(0, endian).ok()?),
        Some(CvSignature::Pdb20) => CodeView::Pdb20(bytes.pread_with(0, endian).ok()?),
        Some(CvSignature::Elf) => CodeView::Elf(bytes.pread_with(0, endian).ok()?),
        _ => CodeView::Unknown(bytes.to_owned()),
    })
}

fn read_debug_id(codeview_info: &CodeView, endian: scroll::Endian) -> Option<DebugId> {
    match codeview_info {
        CodeView::Pdb70(ref raw) => {
            let uuid = Uuid::from_fields(
                raw.signature.data1,
                raw.signature.data2,
                raw.signature.data3,
                &raw.signature.data4,
            );
            (!uuid.is_nil()).then(|| DebugId::from_parts(uuid, raw.age))
        }
        CodeView::Pdb20(ref raw) => Some(DebugId::from_pdb20(raw.signature, raw.age)),
        CodeView::Elf(ref raw) => {
            // Non-executable mappings (fonts, data files) carry an empty id.
            if raw.build_id.iter().all(|byte| *byte == 0) {
                return None;
            }
            // Symbol files identify ELF modules by the first 16 bytes of the
            // build id read as a GUID, zero-padded if shorter.
            let guid_size = <md::GUID>::size_with(&endian);
            let padded: Vec<u8> = raw
                .build_id
                .iter()
                .cloned()
                .chain(iter::repeat(0))
                .take(guid_size)
                .collect();
            let g: md::GUID = padded.pread_with(0, endian).ok()?;
            Some(DebugId::from_uuid(Uuid::from_fields(
                g.data1, g.data2, g.data3, &g.data4,
            )))
        }
        _ => None,
    }
}

/// Checks that the buffer is large enough for the given number of items.
///
/// Essentially ensures that `buf.len() >= offset + (number_of_entries * size_of_entry)`.
/// Returns `(number_of_entries, expected_size)` on success.
fn ensure_count_in_bound(
    buf: &[u8],
    number_of_entries: usize,
    size_of_entry: usize,
    offset: usize,
) -> Result<(usize, usize), Error> {
    let expected_size = number_of_entries
        .checked_mul(size_of_entry)
        .and_then(|v| v.checked_add(offset))
        .ok_or(Error::Truncated)?;
    if buf.len() < expected_size {
        return Err(Error::StreamSizeMismatch {
            expected: expected_size,
            actual: buf.len(),
        });
    }
    Ok((number_of_entries, expected_size))
}

fn read_stream_list<'a, T>(
    offset: &mut usize,
    bytes: &'a [u8],
    endian: scroll::Endian,
) -> Result<Vec<T>, Error>
where
    T: TryFromCtx<'a, scroll::Endian, [u8], Error = scroll::Error>,
    T: SizeWith<scroll::Endian>,
{
    let u: u32 = bytes
        .gread_with(offset, endian)
        .or(Err(Error::StreamReadFailure))?;

    let (count, counted_size) = ensure_count_in_bound(
        bytes,
        u as usize,
        <T>::size_with(&endian),
        mem::size_of::<u32>(),
    )?;

    match bytes.len() - counted_size {
        0 => {}
        4 => {
            // 4 bytes of padding.
            *offset += 4;
        }
        _ => {
            return Err(Error::StreamSizeMismatch {
                expected: counted_size,
                actual: bytes.len(),
            });
        }
    };
    let mut raw_entries = Vec::with_capacity(count);
    for _ in 0..count {
        let raw: T = bytes
            .gread_with(offset, endian)
            .or(Err(Error::StreamReadFailure))?;
        raw_entries.push(raw);
    }
    Ok(raw_entries)
}

impl MinidumpModule {
    /// Create a `MinidumpModule` with some basic info.
    ///
    /// Useful for testing.
    pub fn new(base: u64, size: u32, name: &str) -> MinidumpModule {
        MinidumpModule {
            raw: md::MINIDUMP_MODULE {
                base_of_image: base,
                size_of_image: size,
                ..md::MINIDUMP_MODULE::default()
            },
            name: String::from(name),
            codeview_info: None,
            debug_id: None,
        }
    }

    /// Create a `MinidumpModule` for an ELF object with the given build id.
    pub fn with_build_id(base: u64, size: u32, name: &str, build_id: &[u8]) -> MinidumpModule {
        let codeview_info = CodeView::Elf(md::CV_INFO_ELF {
            cv_signature: CvSignature::Elf as u32,
            build_id: build_id.to_owned(),
        });
        let debug_id = read_debug_id(&codeview_info, LE);
        MinidumpModule {
            codeview_info: Some(codeview_info),
            debug_id,
            ..MinidumpModule::new(base, size, name)
        }
    }

    /// Read additional data to construct a `MinidumpModule` from `bytes` using the information
    /// from the module list in `raw`.
    pub fn read(
        raw: md::MINIDUMP_MODULE,
        bytes: &[u8],
        endian: scroll::Endian,
    ) -> Result<MinidumpModule, Error> {
        let mut offset = raw.module_name_rva as usize;
        let name = match read_string_utf16(&mut offset, bytes, endian) {
            Some(name) => name,
            None if string_in_bounds(bytes, raw.module_name_rva, endian) => {
                return Err(Error::CodeViewReadFailure)
            }
            None => return Err(Error::Truncated),
        };
        let codeview_info = if raw.cv_record.data_size == 0 {
            None
        } else {
            location_slice(bytes, &raw.cv_record)?;
            Some(read_codeview(&raw.cv_record, bytes, endian).ok_or(Error::CodeViewReadFailure)?)
        };

        let debug_id = codeview_info
            .as_ref()
            .and_then(|cv| read_debug_id(cv, endian));

        Ok(MinidumpModule {
            raw,
            name,
            codeview_info,
            debug_id,
        })
    }

    /// The raw ELF build id, if this module has one.
    pub fn build_id(&self) -> Option<&[u8]> {
        match self.codeview_info {
            Some(CodeView::Elf(ref raw)) if raw.build_id.iter().any(|&b| b != 0) => {
                Some(&raw.build_id)
            }
            _ => None,
        }
    }

    /// The four components of the file version, if a version resource is present.
    pub fn version_parts(&self) -> Option<[u16; 4]> {
        let info = &self.raw.version_info;
        (info.signature == md::VS_FFI_SIGNATURE && info.struct_version == md::VS_FFI_STRUCVERSION)
            .then(|| {
                [
                    (info.file_version_hi >> 16) as u16,
                    (info.file_version_hi & 0xffff) as u16,
                    (info.file_version_lo >> 16) as u16,
                    (info.file_version_lo & 0xffff) as u16,
                ]
            })
    }

    /// The address range this module covers, `None` for an empty module.
    pub fn memory_range(&self) -> Option<Range<u64>> {
        if self.size() == 0 {
            return None;
        }
        Some(Range::new(
            self.base_address(),
            self.base_address().checked_add(self.size())? - 1,
        ))
    }

    /// Write a human-readable description of this `MinidumpModule` to `f`.
    ///
    /// This is very verbose, it is the format used by `minidump_dump`.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        write!(
            f,
            "MINIDUMP_MODULE
  base_of_image                   = {:#x}
  size_of_image                   = {:#x}
  checksum                        = {:#x}
  time_date_stamp                 = {:#x} {}
  module_name_rva                 = {:#x}
  version_info.signature          = {:#x}
  version_info.file_version       = {:#x}:{:#x}
  cv_record.data_size             = {}
  cv_record.rva                   = {:#x}
  (code_file)                     = \"{}\"
  (code_identifier)               = \"{}\"
",
            self.raw.base_of_image,
            self.raw.size_of_image,
            self.raw.checksum,
            self.raw.time_date_stamp,
            format_time_t(self.raw.time_date_stamp),
            self.raw.module_name_rva,
            self.raw.version_info.signature,
            self.raw.version_info.file_version_hi,
            self.raw.version_info.file_version_lo,
            self.raw.cv_record.data_size,
            self.raw.cv_record.rva,
            self.code_file(),
            self.code_identifier()
                .map(|id| id.to_string())
                .unwrap_or_default(),
        )?;
        match self.codeview_info {
            Some(CodeView::Pdb70(ref raw)) => {
                let pdb_file_name =
                    string_from_bytes_nul(&raw.pdb_file_name).unwrap_or(Cow::Borrowed("(invalid)"));
                writeln!(f, "  (cv_record).cv_signature        = {:#x}", raw.cv_signature)?;
                writeln!(f, "  (cv_record).age                 = {}", raw.age)?;
                writeln!(f, "  (cv_record).pdb_file_name       = \"{pdb_file_name}\"")?;
            }
            Some(CodeView::Pdb20(ref raw)) => {
                writeln!(f, "  (cv_record).cv_signature        = {:#x}", raw.cv_signature)?;
                writeln!(f, "  (cv_record).signature           = {:#x}", raw.signature)?;
                writeln!(f, "  (cv_record).age                 = {}", raw.age)?;
            }
            Some(CodeView::Elf(ref raw)) => {
                writeln!(f, "  (cv_record).cv_signature        = {:#x}", raw.cv_signature)?;
                writeln!(
                    f,
                    "  (cv_record).build_id            = {}",
                    bytes_to_hex(&raw.build_id)
                )?;
            }
            Some(CodeView::Unknown(ref bytes)) => {
                writeln!(f, "  (cv_record)                     = {}", bytes_to_hex(bytes))?;
            }
            None => {
                writeln!(f, "  (cv_record)                     = (null)")?;
            }
        }
        writeln!(
            f,
            "  (debug_file)                    = \"{}\"
  (debug_identifier)              = \"{}\"
  (version)                       = \"{}\"
",
            self.debug_file().unwrap_or(Cow::Borrowed("")),
            self.debug_identifier()
                .map(|id| id.breakpad().to_string())
                .unwrap_or_default(),
            self.version().unwrap_or(Cow::Borrowed("")),
        )
    }
}

impl Module for MinidumpModule {
    fn base_address(&self) -> u64 {
        self.raw.base_of_image
    }
    fn size(&self) -> u64 {
        self.raw.size_of_image as u64
    }
    fn code_file(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.name)
    }
    fn code_identifier(&self) -> Option<CodeId> {
        match self.codeview_info {
            Some(CodeView::Pdb20(_)) | Some(CodeView::Pdb70(_)) => Some(CodeId::new(format!(
                "{0:08X}{1:x}",
                self.raw.time_date_stamp, self.raw.size_of_image
            ))),
            Some(CodeView::Elf(_)) => self.build_id().map(CodeId::from_binary),
            _ => None,
        }
    }
    fn debug_file(&self) -> Option<Cow<'_, str>> {
        match self.codeview_info {
            Some(CodeView::Pdb70(ref raw)) => string_from_bytes_nul(&raw.pdb_file_name),
            Some(CodeView::Pdb20(ref raw)) => string_from_bytes_nul(&raw.pdb_file_name),
            Some(CodeView::Elf(_)) => Some(Cow::Borrowed(basename(&self.name))),
            _ => None,
        }
    }
    fn debug_identifier(&self) -> Option<DebugId> {
        self.debug_id
    }
    fn version(&self) -> Option<Cow<'_, str>> {
        self.version_parts()
            .map(|[a, b, c, d]| Cow::Owned(format!("{a}.{b}.{c}.{d}")))
    }
}

impl MinidumpModuleList {
    /// Return an empty `MinidumpModuleList`.
    pub fn new() -> MinidumpModuleList {
        MinidumpModuleList {
            modules: vec![],
            modules_by_addr: RangeMap::new(),
        }
    }

    /// Create a `MinidumpModuleList` from a list of `MinidumpModule`s.
    ///
    /// Modules overlapping an earlier module are left out of address lookups.
    pub fn from_modules(modules: Vec<MinidumpModule>) -> MinidumpModuleList {
        let modules_by_addr = modules
            .iter()
            .enumerate()
            .map(|(i, module)| (module.memory_range(), i))
            .into_rangemap_safe();
        MinidumpModuleList {
            modules,
            modules_by_addr,
        }
    }

    /// Returns the module corresponding to the main executable.
    pub fn main_module(&self) -> Option<&MinidumpModule> {
        // The main code module is the first one in the module list.
        self.modules.first()
    }

    /// Return a `MinidumpModule` whose address range covers `address`.
    pub fn module_at_address(&self, address: u64) -> Option<&MinidumpModule> {
        self.modules_by_addr
            .get(address)
            .map(|&index| &self.modules[index])
    }

    /// Iterate over the modules in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &MinidumpModule> {
        self.modules.iter()
    }

    /// Iterate over the modules in order by memory address.
    pub fn by_addr(&self) -> impl DoubleEndedIterator<Item = &MinidumpModule> {
        self.modules_by_addr
            .ranges_values()
            .map(move |&(_, index)| &self.modules[index])
    }

    /// Write a human-readable description of this `MinidumpModuleList` to `f`.
    ///
    /// This is very verbose, it is the format used by `minidump_dump`.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        write!(
            f,
            "MinidumpModuleList
  module_count = {}

",
            self.modules.len()
        )?;
        for (i, module) in self.modules.iter().enumerate() {
            writeln!(f, "module[{i}]")?;
            module.print(f)?;
        }
        Ok(())
    }
}

impl Default for MinidumpModuleList {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> MinidumpStream<'a> for MinidumpModuleList {
    const STREAM_TYPE: u32 = MINIDUMP_STREAM_TYPE::ModuleListStream as u32;

    fn read(
        bytes: &'a [u8],
        all: &'a [u8],
        endian: scroll::Endian,
        _system_info: Option<&MinidumpSystemInfo>,
    ) -> Result<MinidumpModuleList, Error> {
        let mut offset = 0;
        let raw_modules: Vec<md::MINIDUMP_MODULE> = read_stream_list(&mut offset, bytes, endian)?;
        let mut modules = Vec::with_capacity(raw_modules.len());
        for raw in raw_modules.into_iter() {
            if raw.size_of_image == 0 || raw.size_of_image as u64 > (u64::MAX - raw.base_of_image)
            {
                warn!(
                    "skipping module at {:#x} with bad size {:#x}",
                    raw.base_of_image, raw.size_of_image
                );
                continue;
            }
            modules.push(MinidumpModule::read(raw, all, endian)?);
        }
        Ok(MinidumpModuleList::from_modules(modules))
    }
}

impl<'a> MinidumpMemory<'a> {
    pub fn read(
        desc: &md::MINIDUMP_MEMORY_DESCRIPTOR,
        data: &'a [u8],
        endian: scroll::Endian,
    ) -> Result<MinidumpMemory<'a>, Error> {
        if desc.memory.rva == 0 || desc.memory.data_size == 0 {
            return Err(Error::MemoryReadFailure);
        }
        let bytes = location_slice(data, &desc.memory)?;
        Ok(MinidumpMemory {
            desc: *desc,
            base_address: desc.start_of_memory_range,
            size: desc.memory.data_size as u64,
            bytes,
            endian,
        })
    }

    /// Get `mem::size_of::<T>()` bytes of memory at `addr` from this region.
    ///
    /// Return `None` if the requested address range falls out of the bounds
    /// of this memory region.
    pub fn get_memory_at_address<T>(&self, addr: u64) -> Option<T>
    where
        T: TryFromCtx<'a, scroll::Endian, [u8], Error = scroll::Error>,
        T: SizeWith<scroll::Endian>,
    {
        let start = addr.checked_sub(self.base_address)? as usize;
        self.bytes.pread_with::<T>(start, self.endian).ok()
    }

    pub fn memory_range(&self) -> Option<Range<u64>> {
        if self.size == 0 {
            return None;
        }
        Some(Range::new(
            self.base_address,
            self.base_address.checked_add(self.size)? - 1,
        ))
    }

    /// Write the contents of this `MinidumpMemory` to `f` as a hex string.
    pub fn print_contents<T: Write>(&self, f: &mut T) -> io::Result<()> {
        const PARAGRAPH_SIZE: usize = 16;
        for (i, paragraph) in self.bytes.chunks(PARAGRAPH_SIZE).enumerate() {
            write!(f, "    {:08x}: ", i * PARAGRAPH_SIZE)?;
            for j in 0..PARAGRAPH_SIZE {
                match paragraph.get(j) {
                    Some(byte) => write!(f, "{byte:02x} ")?,
                    None => write!(f, "   ")?,
                }
            }
            for &byte in paragraph {
                let ascii_char = if !byte.is_ascii() || byte.is_ascii_control() {
                    '.'
                } else {
                    char::from(byte)
                };
                write!(f, "{ascii_char}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }

    /// Write a human-readable description of this `MinidumpMemory` to `f`.
    ///
    /// This is very verbose, it is the format used by `minidump_dump`.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        write!(
            f,
            "MINIDUMP_MEMORY_DESCRIPTOR
  start_of_memory_range = {:#x}
  memory.data_size      = {:#x}
  memory.rva            = {:#x}
Memory
",
            self.desc.start_of_memory_range, self.desc.memory.data_size, self.desc.memory.rva,
        )?;
        self.print_contents(f)?;
        writeln!(f)
    }
}

impl<'a> MemoryReader for MinidumpMemory<'a> {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryReadError> {
        read_from_region(self.base_address, self.bytes, address, buf)
    }

    fn endian(&self) -> scroll::Endian {
        self.endian
    }
}

impl<'mdmp> MinidumpMemoryList<'mdmp> {
    /// Return an empty `MinidumpMemoryList`.
    pub fn new() -> MinidumpMemoryList<'mdmp> {
        MinidumpMemoryList {
            regions: vec![],
            regions_by_addr: RangeMap::new(),
        }
    }

    /// Create a `MinidumpMemoryList` from a list of `MinidumpMemory`s.
    pub fn from_regions(regions: Vec<MinidumpMemory<'mdmp>>) -> MinidumpMemoryList<'mdmp> {
        let regions_by_addr = regions
            .iter()
            .enumerate()
            .map(|(i, region)| (region.memory_range(), i))
            .into_rangemap_safe();
        MinidumpMemoryList {
            regions,
            regions_by_addr,
        }
    }

    /// Return a `MinidumpMemory` containing memory at `address`, if one exists.
    pub fn memory_at_address(&self, address: u64) -> Option<&MinidumpMemory<'mdmp>> {
        self.regions_by_addr
            .get(address)
            .map(|&index| &self.regions[index])
    }

    /// Iterate over the memory regions in the order contained in the minidump.
    pub fn iter<'slf>(&'slf self) -> impl Iterator<Item = &'slf MinidumpMemory<'mdmp>> {
        self.regions.iter()
    }

    /// Iterate over the memory regions in order by memory address.
    pub fn by_addr<'slf>(&'slf self) -> impl Iterator<Item = &'slf MinidumpMemory<'mdmp>> {
        self.regions_by_addr
            .ranges_values()
            .map(move |&(_, index)| &self.regions[index])
    }

    /// Write a human-readable description of this `MinidumpMemoryList` to `f`.
    ///
    /// This is very verbose, it is the format used by `minidump_dump`.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        write!(
            f,
            "MinidumpMemoryList
  region_count = {}

",
            self.regions.len()
        )?;
        for (i, region) in self.regions.iter().enumerate() {
            writeln!(f, "region[{i}]")?;
            region.print(f)?;
        }
        Ok(())
    }
}

impl<'a> Default for MinidumpMemoryList<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> MemoryReader for MinidumpMemoryList<'a> {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryReadError> {
        let region = self
            .memory_at_address(address)
            .ok_or(MemoryReadError::NotMapped {
                address,
                len: buf.len(),
            })?;
        region.read_memory(address, buf)
    }

    fn endian(&self) -> scroll::Endian {
        self.regions
            .first()
            .map_or(scroll::Endian::Little, |region| region.endian)
    }
}

impl<'a> MinidumpStream<'a> for MinidumpMemoryList<'a> {
    const STREAM_TYPE: u32 = MINIDUMP_STREAM_TYPE::MemoryListStream as u32;

    fn read(
        bytes: &'a [u8],
        all: &'a [u8],
        endian: scroll::Endian,
        _system_info: Option<&MinidumpSystemInfo>,
    ) -> Result<MinidumpMemoryList<'a>, Error> {
        let mut offset = 0;
        let descriptors: Vec<md::MINIDUMP_MEMORY_DESCRIPTOR> =
            read_stream_list(&mut offset, bytes, endian)?;
        let mut regions = Vec::with_capacity(descriptors.len());
        for raw in descriptors.into_iter() {
            match MinidumpMemory::read(&raw, all, endian) {
                Ok(memory) => regions.push(memory),
                Err(Error::MemoryReadFailure) => warn!(
                    "skipping empty memory region at {:#x}",
                    raw.start_of_memory_range
                ),
                Err(e) => return Err(e),
            }
        }
        Ok(MinidumpMemoryList::from_regions(regions))
    }
}

impl<'a> MinidumpThread<'a> {
    /// The id of this thread.
    pub fn thread_id(&self) -> u32 {
        self.raw.thread_id
    }

    /// Get the CPU context of this thread.
    ///
    /// Without `system_info` the CPU type is guessed from the context itself.
    pub fn context(&self, system_info: Option<&MinidumpSystemInfo>) -> Option<MinidumpContext> {
        MinidumpContext::read(self.context?, self.endian, system_info).ok()
    }

    /// The stack memory of this thread.
    ///
    /// Some writers leave the stack descriptor's rva empty but list the
    /// memory in the memory list, so fall back to looking it up there.
    pub fn stack_memory<'m>(
        &'m self,
        memory_list: &'m MinidumpMemoryList<'a>,
    ) -> Option<&'m MinidumpMemory<'a>> {
        self.stack
            .as_ref()
            .or_else(|| memory_list.memory_at_address(self.raw.stack.start_of_memory_range))
    }

    /// Write a human-readable description of this `MinidumpThread` to `f`.
    ///
    /// This is very verbose, it is the format used by `minidump_dump`.
    pub fn print<T: Write>(
        &self,
        f: &mut T,
        memory: Option<&MinidumpMemoryList<'a>>,
        system: Option<&MinidumpSystemInfo>,
    ) -> io::Result<()> {
        write!(
            f,
            r#"MINIDUMP_THREAD
  thread_id                   = {:#x}
  suspend_count               = {}
  priority_class              = {:#x}
  priority                    = {:#x}
  teb                         = {:#x}
  stack.start_of_memory_range = {:#x}
  stack.memory.data_size      = {:#x}
  stack.memory.rva            = {:#x}
  thread_context.data_size    = {:#x}
  thread_context.rva          = {:#x}

"#,
            self.raw.thread_id,
            self.raw.suspend_count,
            self.raw.priority_class,
            self.raw.priority,
            self.raw.teb,
            self.raw.stack.start_of_memory_range,
            self.raw.stack.memory.data_size,
            self.raw.stack.memory.rva,
            self.raw.thread_context.data_size,
            self.raw.thread_context.rva,
        )?;
        match self.context(system) {
            Some(ctx) => ctx.print(f)?,
            None => write!(f, "  (no context)\n\n")?,
        }

        let pointer_width = system.map_or(PointerWidth::Unknown, |info| info.cpu.pointer_width());
        let empty = MinidumpMemoryList::default();
        let memory = memory.unwrap_or(&empty);
        match self.stack_memory(memory) {
            Some(stack) => {
                writeln!(f, "Stack")?;
                // Unknown CPUs are printed as 64-bit.
                let width = pointer_width.size_in_bytes().unwrap_or(8) as u64;
                let mut address = stack.base_address;
                while address + width <= stack.base_address + stack.size {
                    let offset = address - stack.base_address;
                    match stack.read_pointer(address, width) {
                        Some(value) if width == 4 => {
                            writeln!(f, "    0x{offset:08x}: 0x{value:08x}")?
                        }
                        Some(value) => writeln!(f, "    0x{offset:08x}: 0x{value:016x}")?,
                        None => break,
                    }
                    address += width;
                }
            }
            None => writeln!(f, "No stack")?,
        }
        writeln!(f)
    }
}

impl<'a> MinidumpThreadList<'a> {
    /// Get the thread with id `id` from this thread list if it exists.
    pub fn get_thread(&self, id: u32) -> Option<&MinidumpThread<'a>> {
        self.thread_ids.get(&id).map(|&index| &self.threads[index])
    }

    /// Write a human-readable description of this `MinidumpThreadList` to `f`.
    ///
    /// This is very verbose, it is the format used by `minidump_dump`.
    pub fn print<T: Write>(
        &self,
        f: &mut T,
        memory: Option<&MinidumpMemoryList<'a>>,
        system: Option<&MinidumpSystemInfo>,
    ) -> io::Result<()> {
        write!(
            f,
            r#"MinidumpThreadList
  thread_count = {}

"#,
            self.threads.len()
        )?;

        for (i, thread) in self.threads.iter().enumerate() {
            writeln!(f, "thread[{i}]")?;
            thread.print(f, memory, system)?;
        }
        Ok(())
    }
}

impl<'a> MinidumpStream<'a> for MinidumpThreadList<'a> {
    const STREAM_TYPE: u32 = MINIDUMP_STREAM_TYPE::ThreadListStream as u32;

    fn read(
        bytes: &'a [u8],
        all: &'a [u8],
        endian: scroll::Endian,
        _system_info: Option<&MinidumpSystemInfo>,
    ) -> Result<MinidumpThreadList<'a>, Error> {
        let mut offset = 0;
        let raw_threads: Vec<md::MINIDUMP_THREAD> = read_stream_list(&mut offset, bytes, endian)?;
        let mut threads = Vec::with_capacity(raw_threads.len());
        let mut thread_ids = HashMap::with_capacity(raw_threads.len());
        for raw in raw_threads.into_iter() {
            thread_ids.insert(raw.thread_id, threads.len());

            let context = location_slice(all, &raw.thread_context)?;
            let context = (!context.is_empty()).then_some(context);
            let stack = match MinidumpMemory::read(&raw.stack, all, endian) {
                Ok(stack) => Some(stack),
                Err(Error::MemoryReadFailure) => None,
                Err(e) => return Err(e),
            };
            threads.push(MinidumpThread {
                raw,
                context,
                stack,
                endian,
            });
        }
        Ok(MinidumpThreadList {
            threads,
            thread_ids,
        })
    }
}

impl<'a> MinidumpStream<'a> for MinidumpSystemInfo {
    const STREAM_TYPE: u32 = MINIDUMP_STREAM_TYPE::SystemInfoStream as u32;

    fn read(
        bytes: &[u8],
        all: &[u8],
        endian: scroll::Endian,
        _system_info: Option<&MinidumpSystemInfo>,
    ) -> Result<MinidumpSystemInfo, Error> {
        let raw: md::MINIDUMP_SYSTEM_INFO = bytes
            .pread_with(0, endian)
            .or(Err(Error::StreamReadFailure))?;
        let os = Os::from_platform_id(raw.platform_id);
        let cpu = Cpu::from_processor_architecture(raw.processor_architecture);

        let csd_version = if raw.csd_version_rva != 0 {
            if !string_in_bounds(all, raw.csd_version_rva, endian) {
                return Err(Error::Truncated);
            }
            let mut offset = raw.csd_version_rva as usize;
            read_string_utf16(&mut offset, all, endian)
        } else {
            None
        };

        let cpu_info = match cpu {
            Cpu::X86 | Cpu::X86_64 => raw
                .cpu
                .data
                .pread_with::<md::X86CpuInfo>(0, endian)
                .ok()
                .map(|info| {
                    let vendor: Vec<u8> = info
                        .vendor_id
                        .iter()
                        .flat_map(|word| word.to_le_bytes())
                        .collect();
                    format!(
                        "{} family {} model {} stepping {}",
                        String::from_utf8_lossy(&vendor).trim_end_matches('\0'),
                        raw.processor_level,
                        (raw.processor_revision >> 8) & 0xff,
                        raw.processor_revision & 0xff,
                    )
                }),
            _ => None,
        };

        Ok(MinidumpSystemInfo {
            raw,
            os,
            cpu,
            csd_version,
            cpu_info,
        })
    }
}

impl MinidumpSystemInfo {
    /// The number of processors in the system.
    pub fn cpu_count(&self) -> usize {
        self.raw.number_of_processors as usize
    }

    /// The `cpuid` vendor string on x86, if one was recorded.
    pub fn cpu_vendor(&self) -> Option<String> {
        if !matches!(self.cpu, Cpu::X86 | Cpu::X86_64) {
            return None;
        }
        let info: md::X86CpuInfo = self.raw.cpu.data.pread_with(0, LE).ok()?;
        let vendor: Vec<u8> = info
            .vendor_id
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect();
        let vendor = String::from_utf8_lossy(&vendor);
        let vendor = vendor.trim_end_matches('\0');
        (!vendor.is_empty()).then(|| vendor.to_owned())
    }

    /// A string identifying the version of the operating system, such as
    /// "4.19.0 #1 SMP Debian".
    pub fn os_version(&self) -> String {
        let mut version = format!(
            "{}.{}.{}",
            self.raw.major_version, self.raw.minor_version, self.raw.build_number
        );
        if let Some(ref csd) = self.csd_version {
            version.push(' ');
            version.push_str(csd);
        }
        version
    }

    /// Write a human-readable description of this `MinidumpSystemInfo` to `f`.
    ///
    /// This is very verbose, it is the format used by `minidump_dump`.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        write!(
            f,
            "MINIDUMP_SYSTEM_INFO
  processor_architecture                     = {:#x}
  processor_level                            = {}
  processor_revision                         = {:#x}
  number_of_processors                       = {}
  major_version                              = {}
  minor_version                              = {}
  build_number                               = {}
  platform_id                                = {:#x}
  csd_version_rva                            = {:#x}
  (csd_version)                              = \"{}\"
  (cpu_info)                                 = \"{}\"
  (os)                                       = \"{}\"
  (cpu)                                      = \"{}\"

",
            self.raw.processor_architecture,
            self.raw.processor_level,
            self.raw.processor_revision,
            self.raw.number_of_processors,
            self.raw.major_version,
            self.raw.minor_version,
            self.raw.build_number,
            self.raw.platform_id,
            self.raw.csd_version_rva,
            self.csd_version.as_deref().unwrap_or("(null)"),
            self.cpu_info.as_deref().unwrap_or("(null)"),
            self.os.long_name(),
            self.cpu,
        )
    }
}

impl<'a> MinidumpStream<'a> for MinidumpMiscInfo {
    const STREAM_TYPE: u32 = MINIDUMP_STREAM_TYPE::MiscInfoStream as u32;

    fn read(
        bytes: &[u8],
        _all: &[u8],
        endian: scroll::Endian,
        _system_info: Option<&MinidumpSystemInfo>,
    ) -> Result<MinidumpMiscInfo, Error> {
        // Newer revisions only append fields, so the prefix always parses.
        let raw: md::MINIDUMP_MISC_INFO = bytes
            .pread_with(0, endian)
            .or(Err(Error::StreamReadFailure))?;
        if (raw.size_of_info as usize) < md::size_of::<md::MINIDUMP_MISC_INFO>() {
            return Err(Error::StreamSizeMismatch {
                expected: md::size_of::<md::MINIDUMP_MISC_INFO>(),
                actual: raw.size_of_info as usize,
            });
        }
        Ok(MinidumpMiscInfo { raw })
    }
}

impl MinidumpMiscInfo {
    pub fn process_id(&self) -> Option<u32> {
        md::MiscInfoFlags::from_bits_truncate(self.raw.flags1)
            .contains(md::MiscInfoFlags::MINIDUMP_MISC1_PROCESS_ID)
            .then_some(self.raw.process_id)
    }

    /// The time the process was created, as a `time_t`.
    pub fn process_create_time(&self) -> Option<u32> {
        md::MiscInfoFlags::from_bits_truncate(self.raw.flags1)
            .contains(md::MiscInfoFlags::MINIDUMP_MISC1_PROCESS_TIMES)
            .then_some(self.raw.process_create_time)
    }

    /// Write a human-readable description of this `MinidumpMiscInfo` to `f`.
    ///
    /// This is very verbose, it is the format used by `minidump_dump`.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        write!(
            f,
            "MINIDUMP_MISC_INFO
  size_of_info                 = {}
  flags1                       = {:#x}
  process_id                   = {}
  process_create_time          = {:#x} {}
  process_user_time            = {}
  process_kernel_time          = {}

",
            self.raw.size_of_info,
            self.raw.flags1,
            self.process_id()
                .map_or_else(|| "(invalid)".to_owned(), |pid| pid.to_string()),
            self.raw.process_create_time,
            format_time_t(self.raw.process_create_time),
            self.raw.process_user_time,
            self.raw.process_kernel_time,
        )
    }
}

impl<'a> MinidumpStream<'a> for MinidumpBreakpadInfo {
    const STREAM_TYPE: u32 = MINIDUMP_STREAM_TYPE::BreakpadInfoStream as u32;

    fn read(
        bytes: &[u8],
        _all: &[u8],
        endian: scroll::Endian,
        _system_info: Option<&MinidumpSystemInfo>,
    ) -> Result<MinidumpBreakpadInfo, Error> {
        let raw: md::MINIDUMP_BREAKPAD_INFO = bytes
            .pread_with(0, endian)
            .or(Err(Error::StreamReadFailure))?;
        let flags = md::BreakpadInfoValid::from_bits_truncate(raw.validity);
        let dump_thread_id = flags
            .contains(md::BreakpadInfoValid::DumpThreadId)
            .then_some(raw.dump_thread_id);
        let requesting_thread_id = flags
            .contains(md::BreakpadInfoValid::RequestingThreadId)
            .then_some(raw.requesting_thread_id);
        Ok(MinidumpBreakpadInfo {
            raw,
            dump_thread_id,
            requesting_thread_id,
        })
    }
}

fn option_or_invalid<T: fmt::LowerHex>(what: &Option<T>) -> String {
    match what {
        Some(val) => format!("{val:#x}"),
        None => String::from("(invalid)"),
    }
}

impl MinidumpBreakpadInfo {
    /// Write a human-readable description of this `MinidumpBreakpadInfo` to `f`.
    ///
    /// This is very verbose, it is the format used by `minidump_dump`.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        write!(
            f,
            "MINIDUMP_BREAKPAD_INFO
  validity             = {:#x}
  dump_thread_id       = {}
  requesting_thread_id = {}

",
            self.raw.validity,
            option_or_invalid(&self.dump_thread_id),
            option_or_invalid(&self.requesting_thread_id),
        )
    }
}

impl<'a> MinidumpStream<'a> for MinidumpLinuxLsbRelease<'a> {
    const STREAM_TYPE: u32 = MINIDUMP_STREAM_TYPE::LinuxLsbRelease as u32;

    fn read(
        bytes: &'a [u8],
        _all: &'a [u8],
        _endian: scroll::Endian,
        _system_info: Option<&MinidumpSystemInfo>,
    ) -> Result<Self, Error> {
        Ok(Self { data: bytes })
    }
}

impl<'a> MinidumpLinuxLsbRelease<'a> {
    /// Get an iterator over the `KEY=value` pairs of the file.
    ///
    /// Surrounding whitespace and quotes are stripped from both halves.
    /// Lines without a `=` or that aren't UTF-8 are skipped.
    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a str)> {
        fn strip_quotes(input: &str) -> &str {
            let input = input.trim();
            input
                .strip_prefix('"')
                .and_then(|input| input.strip_suffix('"'))
                .unwrap_or(input)
        }

        self.data
            .split(|&b| b == b'\n')
            .filter_map(|line| std::str::from_utf8(line).ok())
            .filter_map(|line| line.split_once('='))
            .map(|(key, val)| (strip_quotes(key), strip_quotes(val)))
    }

    /// Look up a single key, for instance `DISTRIB_ID`.
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.iter().find(|&(k, _)| k == key).map(|(_, v)| v)
    }
}

impl<'a> MinidumpLinuxStream<'a> {
    /// The Breakpad stream types that hold verbatim copies of Linux files.
    pub const STREAM_TYPES: [MINIDUMP_STREAM_TYPE; 7] = [
        MINIDUMP_STREAM_TYPE::LinuxCpuInfo,
        MINIDUMP_STREAM_TYPE::LinuxProcStatus,
        MINIDUMP_STREAM_TYPE::LinuxLsbRelease,
        MINIDUMP_STREAM_TYPE::LinuxCmdLine,
        MINIDUMP_STREAM_TYPE::LinuxEnviron,
        MINIDUMP_STREAM_TYPE::LinuxAuxv,
        MINIDUMP_STREAM_TYPE::LinuxMaps,
    ];

    /// Write the stream contents to `f`, escaping anything that isn't text.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        writeln!(f, "Stream {:?}:", self.stream_type)?;
        for &byte in self.data {
            match byte {
                b'\n' | b'\t' => f.write_all(&[byte])?,
                0 => f.write_all(b"\\0")?,
                _ if byte.is_ascii() && !byte.is_ascii_control() => f.write_all(&[byte])?,
                _ => write!(f, "\\x{byte:02x}")?,
            }
        }
        writeln!(f)
    }
}

impl CrashReason {
    /// Interpret an exception code and flags for the given operating system.
    pub fn from_exception(os: Os, code: u32, flags: u32) -> CrashReason {
        let reason = match os {
            Os::Linux | Os::Android => Self::from_linux_exception(code, flags),
            _ => None,
        };
        reason.unwrap_or(CrashReason::Unknown(code, flags))
    }

    fn from_linux_exception(code: u32, flags: u32) -> Option<CrashReason> {
        let linux_reason = err::ExceptionCodeLinux::from_u32(code)?;
        let mut reason = CrashReason::LinuxGeneral(linux_reason, flags);
        // Refine the output for signals whose si_code is interesting.
        match linux_reason {
            err::ExceptionCodeLinux::SIGILL => {
                if let Some(ty) = err::ExceptionCodeLinuxSigillKind::from_u32(flags) {
                    reason = CrashReason::LinuxSigill(ty);
                }
            }
            err::ExceptionCodeLinux::SIGFPE => {
                if let Some(ty) = err::ExceptionCodeLinuxSigfpeKind::from_u32(flags) {
                    reason = CrashReason::LinuxSigfpe(ty);
                }
            }
            err::ExceptionCodeLinux::SIGSEGV => {
                if let Some(ty) = err::ExceptionCodeLinuxSigsegvKind::from_u32(flags) {
                    reason = CrashReason::LinuxSigsegv(ty);
                }
            }
            err::ExceptionCodeLinux::SIGBUS => {
                if let Some(ty) = err::ExceptionCodeLinuxSigbusKind::from_u32(flags) {
                    reason = CrashReason::LinuxSigbus(ty);
                }
            }
            _ => {}
        }
        Some(reason)
    }
}

impl fmt::Display for CrashReason {
    /// A string describing the crash reason, such as "SIGSEGV / SEGV_MAPERR".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CrashReason::*;

        // The variant names of the code enums are the names people expect
        // to see, so lean on Debug.
        match *self {
            LinuxGeneral(err::ExceptionCodeLinux::DUMP_REQUESTED, _) => {
                write!(f, "DUMP_REQUESTED")
            }
            LinuxGeneral(ex, 0) => write!(f, "{ex:?}"),
            LinuxGeneral(ex, flags) => write!(f, "{ex:?} / {flags:#010x}"),
            LinuxSigill(ex) => write!(f, "SIGILL / {ex:?}"),
            LinuxSigbus(ex) => write!(f, "SIGBUS / {ex:?}"),
            LinuxSigfpe(ex) => write!(f, "SIGFPE / {ex:?}"),
            LinuxSigsegv(ex) => write!(f, "SIGSEGV / {ex:?}"),
            Unknown(code, flags) => write!(f, "{code:#010x} / {flags:#010x}"),
        }
    }
}

impl<'a> MinidumpStream<'a> for MinidumpException<'a> {
    const STREAM_TYPE: u32 = MINIDUMP_STREAM_TYPE::ExceptionStream as u32;

    fn read(
        bytes: &'a [u8],
        all: &'a [u8],
        endian: scroll::Endian,
        _system_info: Option<&MinidumpSystemInfo>,
    ) -> Result<Self, Error> {
        let raw: md::MINIDUMP_EXCEPTION_STREAM = bytes
            .pread_with(0, endian)
            .or(Err(Error::StreamReadFailure))?;
        let context = if raw.thread_context.data_size == 0 {
            None
        } else {
            Some(location_slice(all, &raw.thread_context)?)
        };
        let thread_id = raw.thread_id;
        Ok(MinidumpException {
            raw,
            thread_id,
            context,
            endian,
        })
    }
}

impl<'a> MinidumpException<'a> {
    /// Get the CPU context of the crashing thread at the time of the exception.
    pub fn context(&self, system_info: Option<&MinidumpSystemInfo>) -> Option<MinidumpContext> {
        MinidumpContext::read(self.context?, self.endian, system_info).ok()
    }

    /// Get the address that "caused" the crash.
    ///
    /// For memory faults this is the faulting address, otherwise usually the
    /// instruction pointer. 32-bit writers sometimes sign-extend it, so it is
    /// masked to the pointer width.
    pub fn get_crash_address(&self, cpu: Cpu) -> u64 {
        let addr = self.raw.exception_record.exception_address;
        match cpu.pointer_width() {
            PointerWidth::Bits32 => addr as u32 as u64,
            _ => addr,
        }
    }

    /// Get the crash reason for an exception.
    pub fn get_crash_reason(&self, os: Os) -> CrashReason {
        CrashReason::from_exception(
            os,
            self.raw.exception_record.exception_code,
            self.raw.exception_record.exception_flags,
        )
    }

    /// The id of the thread that caused the crash (or otherwise requested
    /// the minidump, even if there wasn't actually a crash).
    pub fn get_crashing_thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Write a human-readable description of this `MinidumpException` to `f`.
    ///
    /// This is very verbose, it is the format used by `minidump_dump`.
    pub fn print<T: Write>(&self, f: &mut T, system: Option<&MinidumpSystemInfo>) -> io::Result<()> {
        write!(
            f,
            "MINIDUMP_EXCEPTION
  thread_id                                  = {:#x}
  exception_record.exception_code            = {:#x}
  exception_record.exception_flags           = {:#x}
  exception_record.exception_address         = {:#x}
  thread_context.data_size                   = {}
  thread_context.rva                         = {:#x}
",
            self.thread_id,
            self.raw.exception_record.exception_code,
            self.raw.exception_record.exception_flags,
            self.raw.exception_record.exception_address,
            self.raw.thread_context.data_size,
            self.raw.thread_context.rva,
        )?;
        if let Some(system) = system {
            writeln!(f, "  (crash_reason)                             = {}", self.get_crash_reason(system.os))?;
        }
        match self.context(system) {
            Some(context) => {
                writeln!(f)?;
                context.print(f)
            }
            None => write!(f, "  (no context)\n\n"),
        }
    }
}

impl<'a> Minidump<'a, Mmap> {
    /// Read a `Minidump` from a `Path` to a file on disk.
    pub fn read_path<P>(path: P) -> Result<Minidump<'a, Mmap>, Error>
    where
        P: AsRef<Path>,
    {
        let f = File::open(path).or(Err(Error::FileNotFound))?;
        // Safety: the dump file is not expected to change while it is mapped.
        let mmap = unsafe { Mmap::map(&f).or(Err(Error::IoError))? };
        Minidump::read(mmap)
    }
}

impl<'a, T> Minidump<'a, T>
where
    T: Deref<Target = [u8]> + 'a,
{
    /// Read a `Minidump` from the provided `data`.
    ///
    /// Typically this will be a `Vec<u8>` or `&[u8]` with the full contents of the minidump,
    /// but you can also use something like `memmap2::Mmap`.
    pub fn read(data: T) -> Result<Minidump<'a, T>, Error> {
        let signature: u32 = data.pread_with(0, LE).or(Err(Error::BadSignature))?;
        let endian = if signature == md::MINIDUMP_SIGNATURE {
            LE
        } else if signature.swap_bytes() == md::MINIDUMP_SIGNATURE {
            BE
        } else {
            return Err(Error::BadSignature);
        };

        let mut offset = 0;
        let header: md::MINIDUMP_HEADER = data
            .gread_with(&mut offset, endian)
            .or(Err(Error::Truncated))?;
        if (header.version & 0x0000ffff) != md::MINIDUMP_VERSION {
            return Err(Error::VersionMismatch);
        }

        offset = header.stream_directory_rva as usize;

        let (count, _) = ensure_count_in_bound(
            &data,
            header.stream_count as usize,
            <md::MINIDUMP_DIRECTORY>::size_with(&endian),
            offset,
        )
        .map_err(|_| Error::Truncated)?;

        let mut streams = HashMap::with_capacity(count);
        for i in 0..header.stream_count {
            let dir: md::MINIDUMP_DIRECTORY = data
                .gread_with(&mut offset, endian)
                .or(Err(Error::Truncated))?;
            if let Some(&(old_idx, _)) = streams.get(&dir.stream_type) {
                warn!(
                    "Minidump contains multiple streams of type {:#x} at indices {} and {} (using {})",
                    dir.stream_type, old_idx, i, old_idx,
                );
                continue;
            }
            streams.insert(dir.stream_type, (i, dir));
        }

        let system_info = streams
            .get(&MinidumpSystemInfo::STREAM_TYPE)
            .and_then(|(_, dir)| location_slice(data.deref(), &dir.location).ok())
            .and_then(|bytes| MinidumpSystemInfo::read(bytes, data.deref(), endian, None).ok());

        Ok(Minidump {
            data,
            header,
            streams,
            endian,
            system_info,
            _phantom: PhantomData,
        })
    }

    /// Read and parse the specified [`MinidumpStream`][] `S` from the Minidump, if it exists.
    ///
    /// Missing streams are [`Error::StreamNotFound`]; callers decide which
    /// streams they can live without.
    pub fn get_stream<S>(&'a self) -> Result<S, Error>
    where
        S: MinidumpStream<'a>,
    {
        let bytes = self.get_raw_stream(S::STREAM_TYPE)?;
        S::read(bytes, self.data.deref(), self.endian, self.system_info.as_ref())
    }

    /// Get a stream of raw data from the minidump.
    ///
    /// This can be used to get the contents of arbitrary minidump streams.
    /// For streams of known types you almost certainly want to use
    /// [`Minidump::get_stream`][] instead.
    pub fn get_raw_stream(&'a self, stream_type: u32) -> Result<&'a [u8], Error> {
        match self.streams.get(&stream_type) {
            None => Err(Error::StreamNotFound),
            Some((_, dir)) => location_slice(self.data.deref(), &dir.location),
        }
    }

    /// The pre-parsed system info stream, if the dump has one.
    pub fn system_info(&self) -> Option<&MinidumpSystemInfo> {
        self.system_info.as_ref()
    }

    /// Every directory entry, in the order they appear in the file.
    pub fn all_streams(&self) -> impl Iterator<Item = &md::MINIDUMP_DIRECTORY> {
        let mut dirs: Vec<_> = self.streams.values().collect();
        dirs.sort_by_key(|&&(idx, _)| idx);
        dirs.into_iter().map(|(_, dir)| dir)
    }

    /// Write a human-readable description of the header and directory to `f`.
    ///
    /// This is very verbose, it is the format used by `minidump_dump`.
    pub fn print<W: Write>(&self, f: &mut W) -> io::Result<()> {
        fn get_stream_name(stream_type: u32) -> Cow<'static, str> {
            match MINIDUMP_STREAM_TYPE::from_u32(stream_type) {
                Some(known) => Cow::Owned(format!("{known:?}")),
                None => Cow::Borrowed("unknown"),
            }
        }

        write!(
            f,
            r#"MINIDUMP_HEADER
  signature            = {:#x}
  version              = {:#x}
  stream_count         = {}
  stream_directory_rva = {:#x}
  checksum             = {:#x}
  time_date_stamp      = {:#x} {}
  flags                = {:#x}

"#,
            self.header.signature,
            self.header.version,
            self.header.stream_count,
            self.header.stream_directory_rva,
            self.header.checksum,
            self.header.time_date_stamp,
            format_time_t(self.header.time_date_stamp),
            self.header.flags,
        )?;
        for (i, dir) in self.all_streams().enumerate() {
            write!(
                f,
                r#"mDirectory[{}]
MINIDUMP_DIRECTORY
  stream_type        = {:#x} ({})
  location.data_size = {}
  location.rva       = {:#x}

"#,
                i,
                dir.stream_type,
                get_stream_name(dir.stream_type),
                dir.location.data_size,
                dir.location.rva
            )?;
        }
        Ok(())
    }
}
