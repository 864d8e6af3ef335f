//! An owned, fully parsed view of a minidump.
//!
//! [`Minidump`] borrows its data and parses streams lazily. A
//! [`ProcessSnapshot`] is what the writer produces before serializing and
//! what [`parse`] hands back: every record copied out and validated, with
//! all captured memory gathered into a single [`MemoryMap`].

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::ops::Deref;

use debugid::{CodeId, DebugId};
use minidump_common::format::MINIDUMP_STREAM_TYPE;
use minidump_common::traits::Module;
use tracing::warn;

use crate::context::MinidumpRawContext;
use crate::memory::{MemoryMap, MemoryReader};
use crate::minidump::*;
use crate::system_info::{Cpu, Os};

/// Operating system and CPU of the dumped process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemRecord {
    pub os: Os,
    pub cpu: Cpu,
    pub cpu_count: u8,
    pub processor_level: u16,
    pub processor_revision: u16,
    /// The `cpuid` vendor string, like "GenuineIntel", on x86.
    pub cpu_vendor: Option<String>,
    /// Free-form version string, the `uname` output on Linux.
    pub os_version: Option<String>,
}

impl Default for SystemRecord {
    fn default() -> Self {
        SystemRecord {
            os: Os::Unknown(0),
            cpu: Cpu::Unknown(0xffff),
            cpu_count: 0,
            processor_level: 0,
            processor_revision: 0,
            cpu_vendor: None,
            os_version: None,
        }
    }
}

/// A module mapped into the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub base_address: u64,
    pub size: u64,
    /// Full path of the mapped file.
    pub name: String,
    pub debug_file: Option<String>,
    pub debug_id: Option<DebugId>,
    pub code_id: Option<CodeId>,
    pub version: Option<[u16; 4]>,
}

impl ModuleRecord {
    /// Describe an ELF module by its build id.
    ///
    /// An empty or all-zero build id leaves the module without identifiers.
    pub fn from_build_id(base_address: u64, size: u64, name: &str, build_id: &[u8]) -> Self {
        let size32 = u32::try_from(size).unwrap_or(u32::MAX);
        let module = MinidumpModule::with_build_id(base_address, size32, name, build_id);
        ModuleRecord {
            size,
            ..ModuleRecord::from(&module)
        }
    }

    /// The ELF build id encoded in `code_id`, if it is one.
    pub fn build_id(&self) -> Option<Vec<u8>> {
        let hex = self.code_id.as_ref()?.as_str();
        if hex.len() % 2 != 0 {
            return None;
        }
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
            .collect()
    }

    pub fn end_address(&self) -> u64 {
        self.base_address.saturating_add(self.size)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address < self.end_address()
    }
}

impl From<&MinidumpModule> for ModuleRecord {
    fn from(module: &MinidumpModule) -> Self {
        ModuleRecord {
            base_address: module.base_address(),
            size: module.size(),
            name: module.name.clone(),
            debug_file: module.debug_file().map(Cow::into_owned),
            debug_id: module.debug_identifier(),
            code_id: module.code_identifier(),
            version: module.version_parts(),
        }
    }
}

impl Module for ModuleRecord {
    fn base_address(&self) -> u64 {
        self.base_address
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn code_file(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.name)
    }
    fn code_identifier(&self) -> Option<CodeId> {
        self.code_id.clone()
    }
    fn debug_file(&self) -> Option<Cow<'_, str>> {
        self.debug_file.as_deref().map(Cow::Borrowed)
    }
    fn debug_identifier(&self) -> Option<DebugId> {
        self.debug_id
    }
    fn version(&self) -> Option<Cow<'_, str>> {
        self.version
            .map(|[a, b, c, d]| Cow::Owned(format!("{a}.{b}.{c}.{d}")))
    }
}

/// A thread and the registers it was stopped with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub thread_id: u32,
    pub context: MinidumpRawContext,
    /// `(start, len)` of the captured stack, always one region of the
    /// snapshot's memory map.
    pub stack: Option<(u64, u64)>,
}

/// The signal that triggered the dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRecord {
    pub thread_id: u32,
    /// The signal number on Linux.
    pub code: u32,
    /// The signal's `si_code` on Linux.
    pub flags: u32,
    pub address: u64,
    /// Registers at the time of the fault, as opposed to the thread's
    /// context which points into the signal handler.
    pub context: Option<MinidumpRawContext>,
}

impl ExceptionRecord {
    pub fn crash_reason(&self, os: Os) -> CrashReason {
        CrashReason::from_exception(os, self.code, self.flags)
    }
}

/// Everything a minidump records about a process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub system: SystemRecord,
    pub process_id: Option<u32>,
    /// Modules ordered as in the dump; the main executable comes first.
    pub modules: Vec<ModuleRecord>,
    pub threads: Vec<ThreadRecord>,
    pub exception: Option<ExceptionRecord>,
    pub memory: MemoryMap,
    /// The thread that asked for the dump, usually the crashing one.
    pub requesting_thread: Option<u32>,
    /// The thread that wrote the dump, when written in-process.
    pub dump_thread: Option<u32>,
    /// Verbatim copies of Linux system files, by stream type.
    pub linux_streams: BTreeMap<u32, Vec<u8>>,
}

fn optional<S>(stream: Result<S, Error>) -> Result<Option<S>, Error> {
    match stream {
        Ok(stream) => Ok(Some(stream)),
        Err(Error::StreamNotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

impl ProcessSnapshot {
    /// Copy every stream this crate understands out of `dump`.
    ///
    /// The thread list is required; every other stream may be absent. A
    /// stream that is present but corrupt fails the whole parse.
    pub fn from_minidump<'a, T>(dump: &'a Minidump<'a, T>) -> Result<ProcessSnapshot, Error>
    where
        T: Deref<Target = [u8]> + 'a,
    {
        let thread_list = match dump.get_stream::<MinidumpThreadList>() {
            Ok(threads) => threads,
            Err(Error::StreamNotFound) => {
                return Err(Error::UnknownRequiredStream("ThreadListStream"))
            }
            Err(e) => return Err(e),
        };
        // The cached copy is dropped quietly when the stream is cut short.
        optional(dump.get_stream::<MinidumpSystemInfo>())?;
        let system_info = dump.system_info();
        let module_list = optional(dump.get_stream::<MinidumpModuleList>())?.unwrap_or_default();
        let memory_list = optional(dump.get_stream::<MinidumpMemoryList>())?.unwrap_or_default();
        let exception = optional(dump.get_stream::<MinidumpException>())?;
        let misc_info = optional(dump.get_stream::<MinidumpMiscInfo>())?;
        let breakpad_info = optional(dump.get_stream::<MinidumpBreakpadInfo>())?;

        let system = system_info
            .map(|info| SystemRecord {
                os: info.os,
                cpu: info.cpu,
                cpu_count: info.raw.number_of_processors,
                processor_level: info.raw.processor_level,
                processor_revision: info.raw.processor_revision,
                cpu_vendor: info.cpu_vendor(),
                os_version: info.csd_version.clone(),
            })
            .unwrap_or_default();

        let mut memory = MemoryMap::with_endian(dump.endian);
        for region in memory_list.iter() {
            memory.insert(region.base_address, region.bytes.to_vec());
        }

        let mut threads = Vec::with_capacity(thread_list.threads.len());
        for thread in &thread_list.threads {
            let Some(context) = thread.context(system_info) else {
                warn!(
                    "thread {:#x} has no usable context, skipping",
                    thread.thread_id()
                );
                continue;
            };
            let stack = thread.stack_memory(&memory_list).map(|stack| {
                let already_mapped = memory.region_at(stack.base_address).is_some_and(|r| {
                    r.base_address == stack.base_address && r.bytes.len() as u64 == stack.size
                });
                if !already_mapped {
                    memory.insert(stack.base_address, stack.bytes.to_vec());
                }
                (stack.base_address, stack.size)
            });
            threads.push(ThreadRecord {
                thread_id: thread.thread_id(),
                context: context.raw,
                stack,
            });
        }

        let exception = exception.map(|exception| ExceptionRecord {
            thread_id: exception.get_crashing_thread_id(),
            code: exception.raw.exception_record.exception_code,
            flags: exception.raw.exception_record.exception_flags,
            address: exception.get_crash_address(system.cpu),
            context: exception.context(system_info).map(|ctx| ctx.raw),
        });

        // Only modules that won their address range survive.
        let modules = module_list
            .iter()
            .filter(|module| {
                let owner = module_list.module_at_address(module.base_address());
                let kept = owner.is_some_and(|owner| std::ptr::eq(owner, *module));
                if !kept {
                    warn!(
                        "dropping module {} at {:#x}: overlaps another module",
                        module.name,
                        module.base_address()
                    );
                }
                kept
            })
            .map(ModuleRecord::from)
            .collect();

        let mut linux_streams = BTreeMap::new();
        for stream_type in MinidumpLinuxStream::STREAM_TYPES {
            if let Some(bytes) = optional(dump.get_raw_stream(stream_type as u32))? {
                linux_streams.insert(stream_type as u32, bytes.to_vec());
            }
        }

        Ok(ProcessSnapshot {
            system,
            process_id: misc_info.and_then(|misc| misc.process_id()),
            modules,
            threads,
            exception,
            memory,
            requesting_thread: breakpad_info
                .as_ref()
                .and_then(|info| info.requesting_thread_id),
            dump_thread: breakpad_info.and_then(|info| info.dump_thread_id),
            linux_streams,
        })
    }

    pub fn thread(&self, thread_id: u32) -> Option<&ThreadRecord> {
        self.threads.iter().find(|t| t.thread_id == thread_id)
    }

    /// The thread the exception happened on, if there was one.
    pub fn crashing_thread(&self) -> Option<&ThreadRecord> {
        self.thread(self.exception.as_ref()?.thread_id)
    }

    pub fn module_at_address(&self, address: u64) -> Option<&ModuleRecord> {
        self.modules.iter().find(|m| m.contains(address))
    }

    /// The captured stack bytes of `thread`.
    pub fn stack_bytes(&self, thread: &ThreadRecord) -> Option<&[u8]> {
        let (start, len) = thread.stack?;
        let region = self.memory.region_at(start)?;
        let offset = (start - region.base_address) as usize;
        region.bytes.get(offset..offset.checked_add(len as usize)?)
    }

    /// Whether every captured thread has its stack mapped.
    pub fn stacks_mapped(&self) -> bool {
        self.threads
            .iter()
            .filter_map(|t| t.stack)
            .all(|(start, len)| len == 0 || self.memory.contains(start + len - 1))
    }

    pub fn lsb_release(&self) -> Option<&[u8]> {
        self.linux_streams
            .get(&(MINIDUMP_STREAM_TYPE::LinuxLsbRelease as u32))
            .map(Vec::as_slice)
    }

    /// A [`MemoryReader`] over all captured memory.
    pub fn memory_reader(&self) -> &dyn MemoryReader {
        &self.memory
    }
}

/// Parse a complete minidump held in memory.
pub fn parse(bytes: &[u8]) -> Result<ProcessSnapshot, Error> {
    let dump = Minidump::read(bytes)?;
    ProcessSnapshot::from_minidump(&dump)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_module_record_from_build_id() {
        let build_id = [0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04];
        let module = ModuleRecord::from_build_id(0x400000, 0x2000, "/usr/bin/crasher", &build_id);
        assert_eq!(module.debug_file.as_deref(), Some("crasher"));
        assert_eq!(module.build_id().as_deref(), Some(&build_id[..]));
        assert!(module.contains(0x401fff));
        assert!(!module.contains(0x402000));
        assert_eq!(module.version, None);

        let anonymous = ModuleRecord::from_build_id(0x1000, 0x1000, "[vdso]", &[]);
        assert_eq!(anonymous.code_id, None);
        assert_eq!(anonymous.build_id(), None);
    }

    #[test]
    fn test_stack_bytes() {
        let mut snapshot = ProcessSnapshot::default();
        snapshot.memory.insert(0x7000, (0..32).collect());
        snapshot.threads.push(ThreadRecord {
            thread_id: 1,
            context: MinidumpRawContext::Amd64(Default::default()),
            stack: Some((0x7010, 0x10)),
        });
        let thread = &snapshot.threads[0];
        assert_eq!(snapshot.stack_bytes(thread), Some(&(16..32).collect::<Vec<u8>>()[..]));
        assert!(snapshot.stacks_mapped());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse(b"not a minidump at all").err(), Some(Error::BadSignature));
        assert_eq!(parse(&[]).err(), Some(Error::BadSignature));
    }
}
