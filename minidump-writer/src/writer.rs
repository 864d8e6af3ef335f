use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use minidump::{
    ExceptionRecord, MemoryMap, MemoryReadError, MinidumpRawContext, ModuleRecord,
    ProcessSnapshot, ThreadRecord,
};
use tracing::{debug, info, warn};

use crate::error::WriteError;
use crate::sections;
use crate::source::{AuxStream, Mapping, ProcessSource, SourceError};

const PAGE_SIZE: u64 = 4096;

/// The most stack captured for one thread, by default.
pub const MAX_STACK_LEN: u64 = 32 * 1024;

/// Bytes captured around the crashing instruction and the faulting address.
const IP_MEMORY_SIZE: u64 = 256;

// With a size limit set, dumps are assumed to cost this much per thread on
// top of a fixed overhead. If that exceeds the limit, threads past the first
// LIMIT_BASE_THREAD_COUNT keep only LIMIT_MAX_EXTRA_THREAD_STACK_LEN of stack.
const LIMIT_AVERAGE_THREAD_STACK_LEN: u64 = 8 * 1024;
const LIMIT_BASE_THREAD_COUNT: usize = 20;
const LIMIT_MAX_EXTRA_THREAD_STACK_LEN: u64 = 2 * 1024;
const LIMIT_MINIDUMP_FUDGE_FACTOR: u64 = 64 * 1024;

/// The signal that triggered the dump, as seen by the crashing thread's
/// signal handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashContext {
    pub signal: u32,
    /// The signal's `si_code`.
    pub si_code: u32,
    /// `si_addr`, the faulting address for memory faults.
    pub fault_address: u64,
    /// Registers at the time of the fault.
    pub context: MinidumpRawContext,
}

/// A range of target memory the caller wants in the dump regardless of
/// what the writer would pick on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppMemory {
    pub ptr: u64,
    pub length: usize,
}

/// Target memory that should have been captured but couldn't be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryGap {
    pub start: u64,
    pub len: u64,
}

/// Writes a minidump of another process.
///
/// ```no_run
/// use minidump_writer::MinidumpWriter;
///
/// # fn main() -> Result<(), minidump_writer::WriteError> {
/// let pid = 1234;
/// MinidumpWriter::new(pid, pid)
///     .set_max_stack_len(16 * 1024)
///     .write("/tmp/1234.dmp".as_ref())?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MinidumpWriter {
    pid: u32,
    crashing_thread: u32,
    crash_context: Option<CrashContext>,
    size_limit: Option<u64>,
    max_stack_len: u64,
    app_memory: Vec<AppMemory>,
    gaps: Vec<MemoryGap>,
}

impl MinidumpWriter {
    /// A writer for process `pid`, blaming thread `crashing_thread`.
    pub fn new(pid: u32, crashing_thread: u32) -> MinidumpWriter {
        MinidumpWriter {
            pid,
            crashing_thread,
            crash_context: None,
            size_limit: None,
            max_stack_len: MAX_STACK_LEN,
            app_memory: vec![],
            gaps: vec![],
        }
    }

    /// Record an exception. The crashing thread's registers come from
    /// `context` instead of the thread itself.
    pub fn set_crash_context(&mut self, context: CrashContext) -> &mut Self {
        self.crash_context = Some(context);
        self
    }

    /// Try to keep the dump under `limit` bytes by trimming the stacks of
    /// less interesting threads.
    pub fn set_minidump_size_limit(&mut self, limit: u64) -> &mut Self {
        self.size_limit = Some(limit);
        self
    }

    pub fn set_max_stack_len(&mut self, len: u64) -> &mut Self {
        self.max_stack_len = len;
        self
    }

    pub fn set_app_memory(&mut self, app_memory: Vec<AppMemory>) -> &mut Self {
        self.app_memory = app_memory;
        self
    }

    /// Memory the last capture failed to read.
    pub fn gaps(&self) -> &[MemoryGap] {
        &self.gaps
    }

    /// Capture the target through `source` and write the dump to `out`.
    ///
    /// If the target vanishes partway through, whatever was captured is
    /// still written and `WriteError::TargetVanished` is returned.
    pub fn dump<S, W>(&mut self, source: &mut S, out: &mut W) -> Result<(), WriteError>
    where
        S: ProcessSource,
        W: Write,
    {
        let (bytes, vanished) = self.capture_bytes(source)?;
        out.write_all(&bytes)?;
        out.flush()?;
        finish(vanished)
    }

    /// Capture the target through `source` and write the dump to `path`.
    ///
    /// Nothing is created until the capture is done. If writing fails, the
    /// partial file is removed.
    pub fn write_with_source<S>(&mut self, source: &mut S, path: &Path) -> Result<(), WriteError>
    where
        S: ProcessSource,
    {
        let (bytes, vanished) = self.capture_bytes(source)?;
        if let Err(e) = write_file(path, &bytes) {
            if let Err(remove) = fs::remove_file(path) {
                debug!("couldn't remove {}: {}", path.display(), remove);
            }
            return Err(e.into());
        }
        info!("wrote {} bytes to {}", bytes.len(), path.display());
        finish(vanished)
    }

    /// Capture the live process with ptrace and write the dump to `path`.
    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86", target_arch = "x86_64")
    ))]
    pub fn write(&mut self, path: &Path) -> Result<(), WriteError> {
        let mut process = crate::PtraceProcess::new(self.pid);
        self.write_with_source(&mut process, path)
    }

    fn capture_bytes<S: ProcessSource>(
        &mut self,
        source: &mut S,
    ) -> Result<(Vec<u8>, bool), WriteError> {
        let (snapshot, vanished) = self.capture(source)?;
        let time_date_stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let bytes = sections::write_minidump(&snapshot, time_date_stamp)?;
        Ok((bytes, vanished))
    }

    /// Suspend the target, copy it into a [`ProcessSnapshot`], and let it go.
    ///
    /// The flag is set when the target exited before the capture finished.
    pub fn capture<S: ProcessSource>(
        &mut self,
        source: &mut S,
    ) -> Result<(ProcessSnapshot, bool), WriteError> {
        self.gaps.clear();
        info!("capturing process {}", self.pid);
        source
            .suspend()
            .map_err(|e| WriteError::from_source(self.pid, e))?;

        let mut snapshot = ProcessSnapshot {
            process_id: Some(source.pid()),
            requesting_thread: Some(self.crashing_thread),
            dump_thread: source.dump_thread(),
            ..ProcessSnapshot::default()
        };
        let result = self.capture_suspended(source, &mut snapshot);
        source.resume();

        match result {
            Ok(()) => Ok((snapshot, false)),
            Err(SourceError::Vanished) => {
                warn!(
                    "process {} exited during the capture, keeping {} threads",
                    self.pid,
                    snapshot.threads.len()
                );
                Ok((snapshot, true))
            }
            Err(e) => Err(WriteError::from_source(self.pid, e)),
        }
    }

    fn capture_suspended<S: ProcessSource>(
        &mut self,
        source: &mut S,
        snapshot: &mut ProcessSnapshot,
    ) -> Result<(), SourceError> {
        snapshot.system = source.system();
        if let Some(crash) = &self.crash_context {
            snapshot.exception = Some(ExceptionRecord {
                thread_id: self.crashing_thread,
                code: crash.signal,
                flags: crash.si_code,
                address: crash.fault_address,
                context: Some(crash.context.clone()),
            });
        }

        let mappings = source.mappings()?;
        snapshot.modules = modules(source, &mappings);
        debug!("{} mappings, {} modules", mappings.len(), snapshot.modules.len());

        let tids = source.threads()?;
        let truncate = self.should_truncate(tids.len());
        for (index, &tid) in tids.iter().enumerate() {
            let is_crashing = tid == self.crashing_thread;
            let context = match &self.crash_context {
                Some(crash) if is_crashing => crash.context.clone(),
                _ => match source.thread_context(tid) {
                    Ok(context) => context,
                    Err(SourceError::ThreadGone(tid)) => {
                        debug!("thread {} exited during the capture", tid);
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            let max_len = if truncate && index >= LIMIT_BASE_THREAD_COUNT && !is_crashing {
                self.max_stack_len.min(LIMIT_MAX_EXTRA_THREAD_STACK_LEN)
            } else {
                self.max_stack_len
            };
            let stack = match stack_range(&mappings, context.get_stack_pointer(), max_len) {
                Some((start, len)) => {
                    capture_stack(source, start, len, &mut snapshot.memory, &mut self.gaps)?
                }
                None => {
                    warn!(
                        "stack pointer {:#x} of thread {} is not in any mapping",
                        context.get_stack_pointer(),
                        tid
                    );
                    None
                }
            };
            snapshot.threads.push(ThreadRecord {
                thread_id: tid,
                context,
                stack,
            });
        }

        let mut windows: Vec<u64> = snapshot
            .threads
            .iter()
            .map(|thread| thread.context.get_instruction_pointer())
            .collect();
        if let Some(crash) = &self.crash_context {
            windows.push(crash.fault_address);
        }
        for address in windows {
            if let Some((start, len)) = window(&mappings, address) {
                read_uncovered(source, start, len, &mut snapshot.memory, &mut self.gaps)?;
            }
        }

        for app in &self.app_memory {
            read_uncovered(
                source,
                app.ptr,
                app.length as u64,
                &mut snapshot.memory,
                &mut self.gaps,
            )?;
        }

        for stream in AuxStream::ALL {
            if let Some(bytes) = source.aux_stream(stream) {
                snapshot.linux_streams.insert(stream.stream_type(), bytes);
            }
        }
        Ok(())
    }

    fn should_truncate(&self, thread_count: usize) -> bool {
        let Some(limit) = self.size_limit else {
            return false;
        };
        let estimate =
            thread_count as u64 * LIMIT_AVERAGE_THREAD_STACK_LEN + LIMIT_MINIDUMP_FUDGE_FACTOR;
        if estimate > limit {
            info!(
                "estimated dump size {} exceeds limit {}, truncating stacks",
                estimate, limit
            );
        }
        estimate > limit
    }
}

fn finish(vanished: bool) -> Result<(), WriteError> {
    if vanished {
        Err(WriteError::TargetVanished)
    } else {
        Ok(())
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    file.write_all(bytes)?;
    file.into_inner().map_err(|e| e.into_error())?.sync_all()
}

/// Whether a mapping deserves a module entry: a named file mapped from its
/// start, or executable, and big enough to identify.
fn should_include(mapping: &Mapping) -> bool {
    let Some(name) = &mapping.name else {
        return false;
    };
    if name.starts_with("/dev/") || (name.starts_with('[') && name != "[vdso]") {
        return false;
    }
    (mapping.offset == 0 || mapping.executable) && mapping.size() >= PAGE_SIZE
}

/// One module per mapped file, merging the adjacent mappings a loader makes
/// of a single ELF.
fn modules<S: ProcessSource>(source: &mut S, mappings: &[Mapping]) -> Vec<ModuleRecord> {
    let mut merged: Vec<Mapping> = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        if let Some(last) = merged.last_mut() {
            if last.name.is_some() && last.name == mapping.name && last.end == mapping.start {
                last.end = mapping.end;
                last.executable |= mapping.executable;
                last.readable |= mapping.readable;
                continue;
            }
        }
        merged.push(mapping.clone());
    }

    merged
        .iter()
        .filter(|mapping| should_include(mapping))
        .map(|mapping| {
            let build_id = source.build_id(mapping).unwrap_or_default();
            let name = mapping.name.as_deref().unwrap_or_default();
            if build_id.is_empty() {
                debug!("no build id for {}", name);
            }
            ModuleRecord::from_build_id(mapping.start, mapping.size(), name, &build_id)
        })
        .collect()
}

/// The stack to capture for a thread stopped at `sp`: from the page holding
/// `sp` to the end of its mapping, at most `max_len` bytes.
fn stack_range(mappings: &[Mapping], sp: u64, max_len: u64) -> Option<(u64, u64)> {
    let mapping = mappings.iter().find(|m| m.readable && m.contains(sp))?;
    let start = (sp & !(PAGE_SIZE - 1)).max(mapping.start);
    let len = (mapping.end - start).min(max_len);
    (len > 0).then_some((start, len))
}

/// `IP_MEMORY_SIZE` bytes centered on `address`, clipped to its mapping.
fn window(mappings: &[Mapping], address: u64) -> Option<(u64, u64)> {
    let mapping = mappings.iter().find(|m| m.readable && m.contains(address))?;
    let start = address.saturating_sub(IP_MEMORY_SIZE / 2).max(mapping.start);
    let end = address.saturating_add(IP_MEMORY_SIZE / 2).min(mapping.end);
    Some((start, end - start))
}

/// Copy `len` bytes at `start` into `memory`.
///
/// Unreadable memory becomes a gap. Only a vanished process is an error.
fn read_region<S: ProcessSource>(
    source: &S,
    start: u64,
    len: u64,
    memory: &mut MemoryMap,
    gaps: &mut Vec<MemoryGap>,
) -> Result<bool, SourceError> {
    if len == 0 {
        return Ok(false);
    }
    let mut bytes = vec![0u8; len as usize];
    match source.read_memory(start, &mut bytes) {
        Ok(()) => Ok(memory.insert(start, bytes)),
        Err(MemoryReadError::ProcessGone) => Err(SourceError::Vanished),
        Err(e) => {
            warn!("memory gap at {:#x}, {} bytes: {}", start, len, e);
            gaps.push(MemoryGap { start, len });
            Ok(false)
        }
    }
}

/// A thread's stack becomes a region of its own so it can be described by
/// one memory descriptor. Stacks already captured in full are shared.
fn capture_stack<S: ProcessSource>(
    source: &S,
    start: u64,
    len: u64,
    memory: &mut MemoryMap,
    gaps: &mut Vec<MemoryGap>,
) -> Result<Option<(u64, u64)>, SourceError> {
    let end = start + len;
    if let Some(region) = memory.region_at(start) {
        if region.end_address() >= end {
            return Ok(Some((start, len)));
        }
    }
    if uncovered(memory, start, len) != [(start, len)] {
        warn!("stack at {:#x} overlaps memory already captured", start);
        return Ok(None);
    }
    let captured = read_region(source, start, len, memory, gaps)?;
    Ok(captured.then_some((start, len)))
}

/// The parts of `start..start + len` no region of `memory` covers yet.
fn uncovered(memory: &MemoryMap, start: u64, len: u64) -> Vec<(u64, u64)> {
    let end = start.saturating_add(len);
    let mut pieces = vec![];
    let mut cursor = start;
    for region in memory.iter() {
        if region.end_address() <= cursor {
            continue;
        }
        if region.base_address >= end {
            break;
        }
        if region.base_address > cursor {
            pieces.push((cursor, region.base_address - cursor));
        }
        cursor = cursor.max(region.end_address());
    }
    if cursor < end {
        pieces.push((cursor, end - cursor));
    }
    pieces
}

fn read_uncovered<S: ProcessSource>(
    source: &S,
    start: u64,
    len: u64,
    memory: &mut MemoryMap,
    gaps: &mut Vec<MemoryGap>,
) -> Result<(), SourceError> {
    for (piece_start, piece_len) in uncovered(memory, start, len) {
        read_region(source, piece_start, piece_len, memory, gaps)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn mapping(start: u64, end: u64, name: Option<&str>) -> Mapping {
        Mapping {
            start,
            end,
            offset: 0,
            readable: true,
            executable: false,
            name: name.map(str::to_owned),
        }
    }

    #[test]
    fn test_stack_range() {
        let mappings = [mapping(0x7000_0000, 0x7001_0000, Some("[stack]"))];
        assert_eq!(
            stack_range(&mappings, 0x7000_8123, MAX_STACK_LEN),
            Some((0x7000_8000, 0x8000))
        );
        assert_eq!(
            stack_range(&mappings, 0x7000_0010, 0x1000),
            Some((0x7000_0000, 0x1000))
        );
        assert_eq!(stack_range(&mappings, 0x1000, MAX_STACK_LEN), None);
    }

    #[test]
    fn test_window_clipped_to_mapping() {
        let mappings = [mapping(0x400000, 0x401000, Some("/bin/true"))];
        assert_eq!(window(&mappings, 0x400500), Some((0x400480, 0x100)));
        assert_eq!(window(&mappings, 0x400010), Some((0x400000, 0x90)));
        assert_eq!(window(&mappings, 0x400ff0), Some((0x400f70, 0x90)));
        assert_eq!(window(&mappings, 0x500000), None);
    }

    #[test]
    fn test_uncovered() {
        let mut memory = MemoryMap::new();
        memory.insert(0x1000, vec![0; 0x100]);
        memory.insert(0x1200, vec![0; 0x100]);
        assert_eq!(
            uncovered(&memory, 0xf00, 0x500),
            vec![(0xf00, 0x100), (0x1100, 0x100), (0x1300, 0x100)]
        );
        assert!(uncovered(&memory, 0x1010, 0x10).is_empty());
        assert_eq!(uncovered(&memory, 0x2000, 0x10), vec![(0x2000, 0x10)]);
    }

    #[test]
    fn test_should_include() {
        assert!(should_include(&mapping(0x1000, 0x3000, Some("/lib/libc.so"))));
        assert!(should_include(&mapping(0x1000, 0x3000, Some("[vdso]"))));
        assert!(!should_include(&mapping(0x1000, 0x3000, Some("[heap]"))));
        assert!(!should_include(&mapping(0x1000, 0x3000, None)));
        assert!(!should_include(&mapping(0x1000, 0x1800, Some("/lib/libc.so"))));
        assert!(!should_include(&mapping(0x1000, 0x3000, Some("/dev/shm/x"))));

        let data = Mapping {
            offset: 0x2000,
            ..mapping(0x1000, 0x3000, Some("/lib/libc.so"))
        };
        assert!(!should_include(&data));
        let text = Mapping {
            executable: true,
            ..data
        };
        assert!(should_include(&text));
    }

    #[test]
    fn test_size_limit() {
        let mut writer = MinidumpWriter::new(1, 1);
        assert!(!writer.should_truncate(1000));
        writer.set_minidump_size_limit(64 * 1024 + 10 * 8 * 1024);
        assert!(!writer.should_truncate(10));
        assert!(writer.should_truncate(11));
    }
}
