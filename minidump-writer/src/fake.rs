//! A scripted [`ProcessSource`], for exercising the writer without a live
//! target.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};

use minidump::{MemoryMap, MemoryReadError, MemoryReader, MinidumpRawContext, SystemRecord};

use crate::source::{AuxStream, Mapping, ProcessSource, SourceError};

/// A process described entirely in memory.
///
/// Only memory inserted into `memory` is readable; reads of anything else
/// fail as unmapped, which the writer records as a gap.
#[derive(Debug, Default)]
pub struct FakeProcess {
    pub pid: u32,
    pub system: SystemRecord,
    /// `(tid, registers)` in listing order.
    pub threads: Vec<(u32, MinidumpRawContext)>,
    pub mappings: Vec<Mapping>,
    /// Build ids by mapping name.
    pub build_ids: HashMap<String, Vec<u8>>,
    pub memory: MemoryMap,
    pub aux_streams: BTreeMap<u32, Vec<u8>>,
    pub dump_thread: Option<u32>,
    /// Refuse `suspend` with this error.
    pub refuse_attach: Option<fn() -> SourceError>,
    /// The process exits once this many memory reads have succeeded.
    pub vanish_after_reads: Option<usize>,
    reads: Cell<usize>,
    suspended: bool,
    resumed: bool,
}

impl FakeProcess {
    pub fn new(pid: u32, system: SystemRecord) -> FakeProcess {
        FakeProcess {
            pid,
            system,
            ..FakeProcess::default()
        }
    }

    /// Add a readable mapping backed by `bytes`.
    pub fn map(&mut self, start: u64, bytes: Vec<u8>, executable: bool, name: Option<&str>) {
        let end = start + bytes.len() as u64;
        self.mappings.push(Mapping {
            start,
            end,
            offset: 0,
            readable: true,
            executable,
            name: name.map(str::to_owned),
        });
        self.mappings.sort_by_key(|m| m.start);
        self.memory.insert(start, bytes);
    }

    pub fn add_thread(&mut self, tid: u32, context: impl Into<MinidumpRawContext>) {
        self.threads.push((tid, context.into()));
    }

    /// Whether the writer let the process run again.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    fn gone(&self) -> bool {
        self.vanish_after_reads
            .is_some_and(|limit| self.reads.get() >= limit)
    }
}

impl MemoryReader for FakeProcess {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryReadError> {
        if self.gone() {
            return Err(MemoryReadError::ProcessGone);
        }
        self.memory.read_memory(address, buf)?;
        self.reads.set(self.reads.get() + 1);
        Ok(())
    }
}

impl ProcessSource for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn suspend(&mut self) -> Result<(), SourceError> {
        if let Some(refusal) = self.refuse_attach {
            return Err(refusal());
        }
        self.suspended = true;
        Ok(())
    }

    fn resume(&mut self) {
        self.resumed = self.suspended;
    }

    fn threads(&mut self) -> Result<Vec<u32>, SourceError> {
        Ok(self.threads.iter().map(|(tid, _)| *tid).collect())
    }

    fn thread_context(&mut self, tid: u32) -> Result<MinidumpRawContext, SourceError> {
        if self.gone() {
            return Err(SourceError::Vanished);
        }
        self.threads
            .iter()
            .find(|(id, _)| *id == tid)
            .map(|(_, context)| context.clone())
            .ok_or(SourceError::ThreadGone(tid))
    }

    fn mappings(&mut self) -> Result<Vec<Mapping>, SourceError> {
        Ok(self.mappings.clone())
    }

    fn build_id(&mut self, mapping: &Mapping) -> Option<Vec<u8>> {
        self.build_ids.get(mapping.name.as_deref()?).cloned()
    }

    fn system(&mut self) -> SystemRecord {
        self.system.clone()
    }

    fn aux_stream(&mut self, stream: AuxStream) -> Option<Vec<u8>> {
        self.aux_streams.get(&stream.stream_type()).cloned()
    }

    fn dump_thread(&self) -> Option<u32> {
        self.dump_thread
    }
}
