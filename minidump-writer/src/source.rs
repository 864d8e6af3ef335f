//! Where the writer gets its view of the target process.
//!
//! [`ProcessSource`] is the capability the writer captures through: suspend
//! the target, list its threads and mappings, fetch registers and copy
//! memory. [`PtraceProcess`](crate::PtraceProcess) implements it for live
//! Linux processes and [`FakeProcess`](crate::FakeProcess) for tests.

use std::io;

use minidump::format::MINIDUMP_STREAM_TYPE;
use minidump::{MemoryReader, MinidumpRawContext, SystemRecord};

/// Errors from a [`ProcessSource`].
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("no such process")]
    NoSuchProcess,
    #[error("not permitted to trace the process")]
    PermissionDenied,
    /// The whole process went away.
    #[error("the process exited")]
    Vanished,
    /// One thread exited; the rest of the process is still there.
    #[error("thread {0} exited")]
    ThreadGone(u32),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A mapped range of the target's address space, one line of
/// `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    /// Offset of the mapping in the file it maps.
    pub offset: u64,
    pub readable: bool,
    pub executable: bool,
    /// The mapped file's path or a pseudo-name like `[stack]`.
    pub name: Option<String>,
}

impl Mapping {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }
}

/// A Linux system file copied verbatim into its own stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxStream {
    CpuInfo,
    ProcStatus,
    LsbRelease,
    CmdLine,
    Environ,
    Auxv,
    Maps,
}

impl AuxStream {
    pub const ALL: [AuxStream; 7] = [
        AuxStream::CpuInfo,
        AuxStream::ProcStatus,
        AuxStream::LsbRelease,
        AuxStream::CmdLine,
        AuxStream::Environ,
        AuxStream::Auxv,
        AuxStream::Maps,
    ];

    pub fn stream_type(self) -> u32 {
        let ty = match self {
            AuxStream::CpuInfo => MINIDUMP_STREAM_TYPE::LinuxCpuInfo,
            AuxStream::ProcStatus => MINIDUMP_STREAM_TYPE::LinuxProcStatus,
            AuxStream::LsbRelease => MINIDUMP_STREAM_TYPE::LinuxLsbRelease,
            AuxStream::CmdLine => MINIDUMP_STREAM_TYPE::LinuxCmdLine,
            AuxStream::Environ => MINIDUMP_STREAM_TYPE::LinuxEnviron,
            AuxStream::Auxv => MINIDUMP_STREAM_TYPE::LinuxAuxv,
            AuxStream::Maps => MINIDUMP_STREAM_TYPE::LinuxMaps,
        };
        ty.into()
    }

    /// The file the stream is copied from.
    pub fn path(self, pid: u32) -> String {
        match self {
            AuxStream::CpuInfo => "/proc/cpuinfo".to_owned(),
            AuxStream::ProcStatus => format!("/proc/{pid}/status"),
            AuxStream::LsbRelease => "/etc/lsb-release".to_owned(),
            AuxStream::CmdLine => format!("/proc/{pid}/cmdline"),
            AuxStream::Environ => format!("/proc/{pid}/environ"),
            AuxStream::Auxv => format!("/proc/{pid}/auxv"),
            AuxStream::Maps => format!("/proc/{pid}/maps"),
        }
    }
}

/// A process the writer can capture.
///
/// Memory reads go through [`MemoryReader`]; a read failing with
/// `MemoryReadError::ProcessGone` means the whole target vanished, any other
/// error leaves a gap in the dump.
pub trait ProcessSource: MemoryReader {
    fn pid(&self) -> u32;

    /// Stop every thread of the target. Nothing is captured before this
    /// succeeds.
    fn suspend(&mut self) -> Result<(), SourceError>;

    /// Let the target run again. Called once whether or not the capture
    /// succeeded.
    fn resume(&mut self);

    /// Thread ids of the target, in the order the system lists them.
    fn threads(&mut self) -> Result<Vec<u32>, SourceError>;

    fn thread_context(&mut self, tid: u32) -> Result<MinidumpRawContext, SourceError>;

    /// The address space layout, sorted by address.
    fn mappings(&mut self) -> Result<Vec<Mapping>, SourceError>;

    /// The ELF build id of the file behind `mapping`, if it has one.
    fn build_id(&mut self, mapping: &Mapping) -> Option<Vec<u8>>;

    fn system(&mut self) -> SystemRecord;

    /// The contents of `stream`'s file, or `None` if it can't be read.
    fn aux_stream(&mut self, stream: AuxStream) -> Option<Vec<u8>>;

    /// The thread doing the capture, if it is one the dump should name.
    fn dump_thread(&self) -> Option<u32> {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_aux_stream_types() {
        let types: Vec<u32> = AuxStream::ALL.iter().map(|s| s.stream_type()).collect();
        let expected: Vec<u32> = minidump::MinidumpLinuxStream::STREAM_TYPES
            .iter()
            .map(|&ty| ty.into())
            .collect();
        assert_eq!(types, expected);
        assert_eq!(AuxStream::Maps.path(17), "/proc/17/maps");
        assert_eq!(AuxStream::LsbRelease.path(17), "/etc/lsb-release");
    }

    #[test]
    fn test_mapping() {
        let mapping = Mapping {
            start: 0x1000,
            end: 0x3000,
            offset: 0,
            readable: true,
            executable: false,
            name: None,
        };
        assert_eq!(mapping.size(), 0x2000);
        assert!(mapping.contains(0x2fff));
        assert!(!mapping.contains(0x3000));
    }
}
