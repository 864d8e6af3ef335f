// Copyright 2016 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Synthetic minidumps for tests.
//!
//! Layouts are spelled out field by field with `test_assembler` instead of
//! going through minidump-common's `Pwrite` impls, so a broken struct
//! definition there shows up as a test failure instead of round-tripping
//! silently.
//!
//! Build a [`SynthMinidump`], add streams and data to it, then call
//! [`SynthMinidump::finish`] to get the bytes.

// Some test_assembler types do not have Debug, so be a bit more lenient here.
#![allow(missing_debug_implementations)]

use std::marker::PhantomData;
use std::mem;

use minidump_common::format as md;
use scroll::ctx::SizeWith;
use scroll::LE;
use test_assembler::*;

/// A writer of synthetic minidumps.
pub struct SynthMinidump {
    /// The `Section` containing the minidump contents.
    section: Section,
    /// The number of streams.
    stream_count: u32,
    /// The number of streams, as a label for the header.
    stream_count_label: Label,
    /// The directory's file offset, for the header.
    stream_directory_rva: Label,
    /// The contents of the stream directory.
    stream_directory: Section,
    system_info: Option<SystemInfo>,
    exception: Option<Exception>,
    misc_info: Option<MiscStream>,
    breakpad_info: Option<BreakpadInfo>,
    module_list: ListStream<Module>,
    thread_list: ListStream<Thread>,
    memory_list: ListStream<Section>,
    /// Raw Linux streams (`/proc` and `/etc` files), in insertion order.
    linux_streams: Vec<SimpleStream>,
}

/// A block of data contained in a minidump.
pub trait DumpSection {
    /// A label representing this `DumpSection`'s offset in bytes from the start of the minidump.
    fn file_offset(&self) -> Label;

    /// A label representing this `DumpSection`'s size in bytes within the minidump.
    fn file_size(&self) -> Label;
}

pub trait CiteLocation {
    /// Append a `MINIDUMP_LOCATION_DESCRIPTOR` to `section` referring to this section.
    fn cite_location_in(&self, section: Section) -> Section;
}

impl<T: DumpSection> CiteLocation for T {
    fn cite_location_in(&self, section: Section) -> Section {
        section.D32(self.file_size()).D32(self.file_offset())
    }
}

impl CiteLocation for (Label, Label) {
    fn cite_location_in(&self, section: Section) -> Section {
        section.D32(&self.0).D32(&self.1)
    }
}

impl<T: CiteLocation> CiteLocation for Option<T> {
    fn cite_location_in(&self, section: Section) -> Section {
        match self {
            Some(inner) => inner.cite_location_in(section),
            None => section.D32(0).D32(0),
        }
    }
}

/// Chainable helpers for citing other sections.
pub trait SectionExtra {
    fn cite_location<T: CiteLocation>(self, thing: &T) -> Self;
    fn cite_memory(self, memory: &Memory) -> Self;
}

impl SectionExtra for Section {
    fn cite_location<T: CiteLocation>(self, thing: &T) -> Self {
        thing.cite_location_in(self)
    }
    fn cite_memory(self, memory: &Memory) -> Self {
        memory.cite_memory_in(self)
    }
}

/// A minidump stream.
pub trait Stream: DumpSection + Into<Section> {
    /// The stream type, used in the stream directory.
    fn stream_type(&self) -> u32;
    /// Append a `MINIDUMP_DIRECTORY` referring to this stream to `section`.
    fn cite_stream_in(&self, section: Section) -> Section {
        section.D32(self.stream_type()).cite_location(self)
    }
}

impl SynthMinidump {
    /// Create a little-endian `SynthMinidump`.
    pub fn new() -> SynthMinidump {
        SynthMinidump::with_endian(Endian::Little)
    }

    pub fn with_endian(endian: Endian) -> SynthMinidump {
        let stream_count_label = Label::new();
        let stream_directory_rva = Label::new();
        let section = Section::with_endian(endian)
            .D32(md::MINIDUMP_SIGNATURE)
            .D32(md::MINIDUMP_VERSION)
            .D32(&stream_count_label)
            .D32(&stream_directory_rva)
            .D32(0) // checksum
            .D32(1262805309) // time_date_stamp, arbitrary
            .D64(0); // flags
        section.start().set_const(0);
        assert_eq!(section.size(), md::size_of::<md::MINIDUMP_HEADER>() as u64);

        SynthMinidump {
            section,
            stream_count: 0,
            stream_count_label,
            stream_directory_rva,
            stream_directory: Section::with_endian(endian),
            system_info: None,
            exception: None,
            misc_info: None,
            breakpad_info: None,
            module_list: ListStream::new(md::MINIDUMP_STREAM_TYPE::ModuleListStream, endian),
            thread_list: ListStream::new(md::MINIDUMP_STREAM_TYPE::ThreadListStream, endian),
            memory_list: ListStream::new(md::MINIDUMP_STREAM_TYPE::MemoryListStream, endian),
            linux_streams: Vec::new(),
        }
    }

    /// Append `section` to `self`, setting its location appropriately.
    #[allow(clippy::should_implement_trait)]
    pub fn add<T>(mut self, section: T) -> SynthMinidump
    where
        T: DumpSection + Into<Section>,
    {
        let offset = section.file_offset();
        self.section = self.section.mark(&offset).append_section(section);
        self
    }

    /// Add `module` to the module list stream.
    ///
    /// The module's name and CodeView record must be added separately with
    /// [`SynthMinidump::add`].
    pub fn add_module(mut self, module: Module) -> SynthMinidump {
        self.module_list = self.module_list.add(module);
        self
    }

    /// Add `memory` to `self`, listing it in the memory list stream as well.
    pub fn add_memory(mut self, memory: Memory) -> SynthMinidump {
        let descriptor = memory.cite_memory_in(Section::with_endian(self.section.endian));
        self.memory_list = self.memory_list.add(descriptor);
        self.add(memory)
    }

    /// Add `thread` to the thread list stream.
    pub fn add_thread(mut self, thread: Thread) -> SynthMinidump {
        self.thread_list = self.thread_list.add(thread);
        self
    }

    pub fn add_system_info(mut self, system_info: SystemInfo) -> Self {
        self.system_info = Some(system_info);
        self
    }

    pub fn add_exception(mut self, exception: Exception) -> Self {
        self.exception = Some(exception);
        self
    }

    pub fn add_misc_info(mut self, misc_info: MiscStream) -> Self {
        self.misc_info = Some(misc_info);
        self
    }

    pub fn add_breakpad_info(mut self, breakpad_info: BreakpadInfo) -> Self {
        self.breakpad_info = Some(breakpad_info);
        self
    }

    /// Set the contents of one of the raw Linux streams, such as
    /// `LinuxLsbRelease` or `LinuxMaps`.
    pub fn set_linux_stream(
        mut self,
        stream_type: md::MINIDUMP_STREAM_TYPE,
        contents: &[u8],
    ) -> SynthMinidump {
        self.linux_streams
            .retain(|stream| stream.stream_type != stream_type as u32);
        self.linux_streams.push(SimpleStream {
            stream_type: stream_type as u32,
            section: Section::with_endian(self.section.endian).append_bytes(contents),
        });
        self
    }

    /// Append `stream` to `self` and list it in the stream directory.
    pub fn add_stream<T: Stream>(mut self, stream: T) -> SynthMinidump {
        self.stream_directory = stream.cite_stream_in(self.stream_directory);
        self.stream_count += 1;
        self.add(stream)
    }

    fn finish_list<T: ListItem>(self, list: ListStream<T>) -> SynthMinidump {
        if list.is_empty() {
            self
        } else {
            self.add_stream(list)
        }
    }

    /// Finish generating the minidump and return the contents.
    ///
    /// List streams are only written if something was added to them.
    pub fn finish(mut self) -> Option<Vec<u8>> {
        let endian = self.section.endian;
        let modules = mem::replace(
            &mut self.module_list,
            ListStream::new(md::MINIDUMP_STREAM_TYPE::ModuleListStream, endian),
        );
        let memories = mem::replace(
            &mut self.memory_list,
            ListStream::new(md::MINIDUMP_STREAM_TYPE::MemoryListStream, endian),
        );
        let threads = mem::replace(
            &mut self.thread_list,
            ListStream::new(md::MINIDUMP_STREAM_TYPE::ThreadListStream, endian),
        );
        self = self
            .finish_list(modules)
            .finish_list(memories)
            .finish_list(threads);

        if let Some(stream) = self.system_info.take() {
            self = self.add_stream(stream);
        }
        if let Some(stream) = self.exception.take() {
            self = self.add_stream(stream);
        }
        if let Some(stream) = self.misc_info.take() {
            self = self.add_stream(stream);
        }
        if let Some(stream) = self.breakpad_info.take() {
            self = self.add_stream(stream);
        }
        for stream in mem::take(&mut self.linux_streams) {
            self = self.add_stream(stream);
        }

        let SynthMinidump {
            section,
            stream_count,
            stream_count_label,
            stream_directory_rva,
            stream_directory,
            ..
        } = self;
        stream_count_label.set_const(stream_count as u64);
        section
            .mark(&stream_directory_rva)
            .append_section(stream_directory)
            .get_contents()
    }
}

impl Default for SynthMinidump {
    fn default() -> Self {
        Self::new()
    }
}

impl DumpSection for Section {
    fn file_offset(&self) -> Label {
        self.start()
    }

    fn file_size(&self) -> Label {
        self.final_size()
    }
}

macro_rules! impl_dumpsection {
    ( $x:ty ) => {
        impl DumpSection for $x {
            fn file_offset(&self) -> Label {
                self.section.file_offset()
            }
            fn file_size(&self) -> Label {
                self.section.file_size()
            }
        }
    };
}

/// A stream of arbitrary data.
pub struct SimpleStream {
    pub stream_type: u32,
    pub section: Section,
}

impl From<SimpleStream> for Section {
    fn from(stream: SimpleStream) -> Self {
        stream.section
    }
}

impl_dumpsection!(SimpleStream);

impl Stream for SimpleStream {
    fn stream_type(&self) -> u32 {
        self.stream_type
    }
}

/// Anything that can be an entry of a [`ListStream`].
pub trait ListItem: DumpSection + Into<Section> {}

impl<T: DumpSection + Into<Section>> ListItem for T {}

/// A stream holding a u32 count followed by that many entries.
pub struct ListStream<T: ListItem> {
    stream_type: u32,
    section: Section,
    count: u32,
    count_label: Label,
    _type: PhantomData<T>,
}

impl<T: ListItem> ListStream<T> {
    pub fn new<S: Into<u32>>(stream_type: S, endian: Endian) -> Self {
        let count_label = Label::new();
        ListStream {
            stream_type: stream_type.into(),
            section: Section::with_endian(endian).D32(&count_label),
            count: 0,
            count_label,
            _type: PhantomData,
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn add(mut self, entry: T) -> Self {
        self.count += 1;
        self.section = self
            .section
            .mark(&entry.file_offset())
            .append_section(entry);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl<T: ListItem> From<ListStream<T>> for Section {
    fn from(stream: ListStream<T>) -> Self {
        stream.count_label.set_const(stream.count as u64);
        stream.section
    }
}

impl<T: ListItem> DumpSection for ListStream<T> {
    fn file_offset(&self) -> Label {
        self.section.file_offset()
    }

    fn file_size(&self) -> Label {
        self.section.file_size()
    }
}

impl<T: ListItem> Stream for ListStream<T> {
    fn stream_type(&self) -> u32 {
        self.stream_type
    }
}

/// A `MINIDUMP_STRING`: a byte length followed by UTF-16 code units.
pub struct DumpString {
    section: Section,
}

impl DumpString {
    pub fn new(s: &str, endian: Endian) -> DumpString {
        let units: Vec<u16> = s.encode_utf16().collect();
        let mut section = Section::with_endian(endian).D32((units.len() * 2) as u32);
        for unit in units {
            section = section.D16(unit);
        }
        DumpString { section }
    }
}

impl From<DumpString> for Section {
    fn from(string: DumpString) -> Self {
        string.section
    }
}

impl_dumpsection!(DumpString);

/// A Breakpad `BpEL` CodeView record carrying an ELF build id.
pub struct CvElf {
    section: Section,
}

impl CvElf {
    pub fn new(build_id: &[u8], endian: Endian) -> CvElf {
        let section = Section::with_endian(endian)
            .D32(md::CvSignature::Elf as u32)
            .append_bytes(build_id);
        CvElf { section }
    }
}

impl From<CvElf> for Section {
    fn from(cv: CvElf) -> Self {
        cv.section
    }
}

impl_dumpsection!(CvElf);

/// A fixed set of version info to use for tests.
pub const STOCK_VERSION_INFO: md::VS_FIXEDFILEINFO = md::VS_FIXEDFILEINFO {
    signature: md::VS_FFI_SIGNATURE,
    struct_version: md::VS_FFI_STRUCVERSION,
    file_version_hi: 0x00010002,
    file_version_lo: 0x00030004,
    product_version_hi: 0x00010002,
    product_version_lo: 0x00030004,
    file_flags_mask: 0,
    file_flags: 0,
    file_os: 0,
    file_type: 0,
    file_subtype: 0,
    file_date_hi: 0,
    file_date_lo: 0,
};

/// A `MINIDUMP_MODULE`.
pub struct Module {
    section: Section,
    cv_record: Option<(Label, Label)>,
}

impl Module {
    /// A module with no version resource, the usual case on Linux.
    pub fn new(endian: Endian, base_of_image: u64, size_of_image: u32, name: &DumpString) -> Module {
        Module::with_version(
            endian,
            base_of_image,
            size_of_image,
            name,
            &md::VS_FIXEDFILEINFO::default(),
        )
    }

    pub fn with_version(
        endian: Endian,
        base_of_image: u64,
        size_of_image: u32,
        name: &DumpString,
        version_info: &md::VS_FIXEDFILEINFO,
    ) -> Module {
        let section = Section::with_endian(endian)
            .D64(base_of_image)
            .D32(size_of_image)
            .D32(0) // checksum
            .D32(0) // time_date_stamp
            .D32(name.file_offset())
            .D32(version_info.signature)
            .D32(version_info.struct_version)
            .D32(version_info.file_version_hi)
            .D32(version_info.file_version_lo)
            .D32(version_info.product_version_hi)
            .D32(version_info.product_version_lo)
            .D32(version_info.file_flags_mask)
            .D32(version_info.file_flags)
            .D32(version_info.file_os)
            .D32(version_info.file_type)
            .D32(version_info.file_subtype)
            .D32(version_info.file_date_hi)
            .D32(version_info.file_date_lo);
        Module {
            section,
            cv_record: None,
        }
    }

    pub fn cv_record<T: DumpSection>(mut self, cv_record: &T) -> Module {
        self.cv_record = Some((cv_record.file_size(), cv_record.file_offset()));
        self
    }
}

impl_dumpsection!(Module);

impl From<Module> for Section {
    fn from(module: Module) -> Self {
        let Module { section, cv_record } = module;
        section
            .cite_location(&cv_record)
            .D32(0) // misc_record.data_size
            .D32(0) // misc_record.rva
            .D64(0) // reserved0
            .D64(0) // reserved1
    }
}

/// A `MINIDUMP_THREAD`.
pub struct Thread {
    section: Section,
}

impl Thread {
    pub fn new<T>(endian: Endian, id: u32, stack: &Memory, context: &T) -> Thread
    where
        T: DumpSection,
    {
        let section = Section::with_endian(endian)
            .D32(id)
            .D32(0) // suspend_count
            .D32(0) // priority_class
            .D32(0) // priority
            .D64(0) // teb
            .cite_memory(stack)
            .cite_location(context);
        Thread { section }
    }
}

impl_dumpsection!(Thread);

impl From<Thread> for Section {
    fn from(thread: Thread) -> Self {
        thread.section
    }
}

/// A range of memory contents.
pub struct Memory {
    section: Section,
    pub address: u64,
}

impl Memory {
    /// Memory starting at `address` holding the contents of `section`.
    pub fn with_section(section: Section, address: u64) -> Memory {
        Memory { section, address }
    }

    /// Append a `MINIDUMP_MEMORY_DESCRIPTOR` referring to this memory to `section`.
    pub fn cite_memory_in(&self, section: Section) -> Section {
        section.D64(self.address).cite_location(self)
    }
}

impl_dumpsection!(Memory);

impl From<Memory> for Section {
    fn from(memory: Memory) -> Self {
        memory.section
    }
}

/// The `MINIDUMP_SYSTEM_INFO` stream.
pub struct SystemInfo {
    section: Section,
    pub processor_architecture: u16,
    pub processor_level: u16,
    pub processor_revision: u16,
    pub number_of_processors: u8,
    pub major_version: u32,
    pub minor_version: u32,
    pub build_number: u32,
    pub platform_id: u32,
    csd_version: Option<Label>,
    pub vendor_id: [u32; 3],
}

impl SystemInfo {
    /// An amd64 Linux machine with one CPU.
    pub fn new(endian: Endian) -> Self {
        Self {
            section: Section::with_endian(endian),
            processor_architecture: md::ProcessorArchitecture::PROCESSOR_ARCHITECTURE_AMD64 as u16,
            processor_level: 6,
            processor_revision: 0x9e0a,
            number_of_processors: 1,
            major_version: 0,
            minor_version: 0,
            build_number: 0,
            platform_id: md::PlatformId::Linux as u32,
            csd_version: None,
            // "GenuineIntel"
            vendor_id: [0x756e6547, 0x49656e69, 0x6c65746e],
        }
    }

    pub fn set_processor_architecture(mut self, arch: u16) -> Self {
        self.processor_architecture = arch;
        self
    }

    pub fn set_platform_id(mut self, platform_id: u32) -> Self {
        self.platform_id = platform_id;
        self
    }

    /// Point `csd_version_rva` at `csd`, which must be added to the dump too.
    pub fn set_csd_version(mut self, csd: &DumpString) -> Self {
        self.csd_version = Some(csd.file_offset());
        self
    }
}

impl_dumpsection!(SystemInfo);

impl From<SystemInfo> for Section {
    fn from(info: SystemInfo) -> Self {
        let section = info
            .section
            .D16(info.processor_architecture)
            .D16(info.processor_level)
            .D16(info.processor_revision)
            .D8(info.number_of_processors)
            .D8(0) // product_type
            .D32(info.major_version)
            .D32(info.minor_version)
            .D32(info.build_number)
            .D32(info.platform_id);
        let section = match info.csd_version {
            Some(label) => section.D32(&label),
            None => section.D32(0),
        };
        section
            .D16(0) // suite_mask
            .D16(0) // reserved2
            .D32(info.vendor_id[0])
            .D32(info.vendor_id[1])
            .D32(info.vendor_id[2])
            .D32(0) // version_information
            .D32(0) // feature_information
            .D32(0) // amd_extended_cpu_features
    }
}

impl Stream for SystemInfo {
    fn stream_type(&self) -> u32 {
        md::MINIDUMP_STREAM_TYPE::SystemInfoStream as u32
    }
}

/// The `MINIDUMP_EXCEPTION_STREAM`.
pub struct Exception {
    section: Section,
    pub thread_id: u32,
    pub exception_code: u32,
    pub exception_flags: u32,
    pub exception_address: u64,
    thread_context: Option<(Label, Label)>,
}

impl Exception {
    pub fn new(endian: Endian) -> Self {
        Self {
            section: Section::with_endian(endian),
            thread_id: 0,
            exception_code: 0,
            exception_flags: 0,
            exception_address: 0,
            thread_context: None,
        }
    }

    /// Cite `context`, which must be added to the dump too.
    pub fn context<T: DumpSection>(mut self, context: &T) -> Self {
        self.thread_context = Some((context.file_size(), context.file_offset()));
        self
    }
}

impl_dumpsection!(Exception);

impl From<Exception> for Section {
    fn from(info: Exception) -> Self {
        info.section
            .D32(info.thread_id)
            .D32(0) // __align
            .D32(info.exception_code)
            .D32(info.exception_flags)
            .D64(0) // exception_record
            .D64(info.exception_address)
            .D32(0) // number_parameters
            .D32(0) // __align
            .append_repeated(0, mem::size_of::<u64>() * 15) // exception_information
            .cite_location(&info.thread_context)
    }
}

impl Stream for Exception {
    fn stream_type(&self) -> u32 {
        md::MINIDUMP_STREAM_TYPE::ExceptionStream as u32
    }
}

/// The first revision of `MINIDUMP_MISC_INFO`.
pub struct MiscStream {
    section: Section,
    pub process_id: Option<u32>,
    /// `(create, user, kernel)` times.
    pub process_times: Option<(u32, u32, u32)>,
}

impl MiscStream {
    pub fn new(endian: Endian) -> MiscStream {
        MiscStream {
            section: Section::with_endian(endian),
            process_id: None,
            process_times: None,
        }
    }
}

impl From<MiscStream> for Section {
    fn from(stream: MiscStream) -> Self {
        let mut flags = md::MiscInfoFlags::empty();
        if stream.process_id.is_some() {
            flags |= md::MiscInfoFlags::MINIDUMP_MISC1_PROCESS_ID;
        }
        if stream.process_times.is_some() {
            flags |= md::MiscInfoFlags::MINIDUMP_MISC1_PROCESS_TIMES;
        }
        let (create, user, kernel) = stream.process_times.unwrap_or_default();
        stream
            .section
            .D32(md::size_of::<md::MINIDUMP_MISC_INFO>() as u32)
            .D32(flags.bits())
            .D32(stream.process_id.unwrap_or_default())
            .D32(create)
            .D32(user)
            .D32(kernel)
    }
}

impl_dumpsection!(MiscStream);

impl Stream for MiscStream {
    fn stream_type(&self) -> u32 {
        md::MINIDUMP_STREAM_TYPE::MiscInfoStream as u32
    }
}

/// The Breakpad info stream.
pub struct BreakpadInfo {
    section: Section,
    pub dump_thread_id: Option<u32>,
    pub requesting_thread_id: Option<u32>,
}

impl BreakpadInfo {
    pub fn new(endian: Endian) -> BreakpadInfo {
        BreakpadInfo {
            section: Section::with_endian(endian),
            dump_thread_id: None,
            requesting_thread_id: None,
        }
    }
}

impl From<BreakpadInfo> for Section {
    fn from(info: BreakpadInfo) -> Self {
        let mut validity = md::BreakpadInfoValid::empty();
        if info.dump_thread_id.is_some() {
            validity |= md::BreakpadInfoValid::DumpThreadId;
        }
        if info.requesting_thread_id.is_some() {
            validity |= md::BreakpadInfoValid::RequestingThreadId;
        }
        info.section
            .D32(validity.bits())
            .D32(info.dump_thread_id.unwrap_or_default())
            .D32(info.requesting_thread_id.unwrap_or_default())
    }
}

impl_dumpsection!(BreakpadInfo);

impl Stream for BreakpadInfo {
    fn stream_type(&self) -> u32 {
        md::MINIDUMP_STREAM_TYPE::BreakpadInfoStream as u32
    }
}

/// Populate a `CONTEXT_X86` struct with the given `endian`, `eip`, and `esp`.
pub fn x86_context(endian: Endian, eip: u32, esp: u32) -> Section {
    let section = Section::with_endian(endian)
        .D32(0x1007f) // context_flags: CONTEXT_ALL
        .append_repeated(0, 4 * 6) // dr0,1,2,3,6,7
        .append_repeated(0, md::FLOATING_SAVE_AREA_X86::size_with(&LE)) // float_save
        .append_repeated(0, 4 * 11) // gs-ebp
        .D32(eip)
        .D32(0) // cs
        .D32(0) // eflags
        .D32(esp)
        .D32(0) // ss
        .append_repeated(0, 512); // extended_registers
    assert_eq!(section.size(), md::CONTEXT_X86::size_with(&LE) as u64);
    section
}

/// Populate a `CONTEXT_AMD64` struct with the given `endian`, `rip`, `rsp`
/// and `rbp`.
pub fn amd64_context(endian: Endian, rip: u64, rsp: u64, rbp: u64) -> Section {
    let section = Section::with_endian(endian)
        .append_repeated(0, mem::size_of::<u64>() * 6) // p[1-6]_home
        .D32(0x10001f) // context_flags: CONTEXT_ALL
        .D32(0) // mx_csr
        .append_repeated(0, mem::size_of::<u16>() * 6) // cs,ds,es,fs,gs,ss
        .D32(0) // eflags
        .append_repeated(0, mem::size_of::<u64>() * 6) // dr0,1,2,3,6,7
        .append_repeated(0, mem::size_of::<u64>() * 4) // rax,rcx,rdx,rbx
        .D64(rsp)
        .D64(rbp)
        .append_repeated(0, mem::size_of::<u64>() * 10) // rsi-r15
        .D64(rip)
        .append_repeated(0, 512) // float_save
        .append_repeated(0, mem::size_of::<u128>() * 26) // vector_register
        .append_repeated(0, mem::size_of::<u64>() * 6); // debug_control etc.
    assert_eq!(section.size(), md::CONTEXT_AMD64::size_with(&LE) as u64);
    section
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dump_header() {
        let dump = SynthMinidump::with_endian(Endian::Little);
        assert_eq!(
            dump.finish().unwrap(),
            vec![
                0x4d, 0x44, 0x4d, 0x50, // signature
                0x93, 0xa7, 0x00, 0x00, // version
                0, 0, 0, 0, // stream count
                0x20, 0, 0, 0, // directory RVA
                0, 0, 0, 0, // checksum
                0x3d, 0xe1, 0x44, 0x4b, // time_date_stamp
                0, 0, 0, 0, // flags
                0, 0, 0, 0,
            ]
        );
    }

    #[test]
    fn test_section_cite() {
        let s1 = Section::with_endian(Endian::Little).append_repeated(0, 0x0a);
        s1.start().set_const(0xff00ee11);
        let s2 = Section::with_endian(Endian::Little);
        let s2 = s1.cite_location_in(s2);
        s1.get_contents().unwrap();
        assert_eq!(
            s2.get_contents().unwrap(),
            vec![0x0a, 0, 0, 0, 0x11, 0xee, 0x00, 0xff]
        );
    }

    #[test]
    fn test_dump_string() {
        let dump = SynthMinidump::with_endian(Endian::Little);
        let s = DumpString::new("hello", Endian::Little);
        let contents = dump.add(s).finish().unwrap();
        // Skip over the header
        assert_eq!(
            &contents[md::size_of::<md::MINIDUMP_HEADER>()..],
            &[
                0xa, 0x0, 0x0, 0x0, // length
                b'h', 0x0, b'e', 0x0, b'l', 0x0, b'l', 0x0, b'o', 0x0
            ]
        );
    }

    #[test]
    fn test_list_stream() {
        let list = ListStream::<DumpString>::new(0x11223344u32, Endian::Little);
        assert_eq!(
            Into::<Section>::into(list).get_contents().unwrap(),
            vec![0, 0, 0, 0]
        );
        let list = ListStream::new(0x11223344u32, Endian::Little)
            .add(DumpString::new("a", Endian::Little))
            .add(DumpString::new("b", Endian::Little));
        assert_eq!(
            Into::<Section>::into(list).get_contents().unwrap(),
            vec![
                2, 0, 0, 0, // entry count
                2, 0, 0, 0, b'a', 0, // first entry
                2, 0, 0, 0, b'b', 0, // second entry
            ]
        );
    }

    #[test]
    fn test_linux_stream_replaces() {
        let dump = SynthMinidump::new()
            .set_linux_stream(md::MINIDUMP_STREAM_TYPE::LinuxCmdLine, b"old")
            .set_linux_stream(md::MINIDUMP_STREAM_TYPE::LinuxCmdLine, b"new")
            .finish()
            .unwrap();
        // Header, then the one stream's contents, then a single directory entry.
        assert_eq!(dump.len(), 32 + 3 + 12);
        assert_eq!(&dump[32..35], b"new");
        assert_eq!(&dump[8..12], &[1, 0, 0, 0]);
    }

    #[test]
    fn test_breakpad_info_layout() {
        let mut info = BreakpadInfo::new(Endian::Little);
        info.requesting_thread_id = Some(0x1234);
        let section: Section = info.into();
        assert_eq!(
            section.get_contents().unwrap(),
            vec![
                2, 0, 0, 0, // validity
                0, 0, 0, 0, // dump_thread_id
                0x34, 0x12, 0, 0, // requesting_thread_id
            ]
        );
    }
}
