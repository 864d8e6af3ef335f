//! Writes [minidumps] of Linux processes from outside the process.
//!
//! A [`MinidumpWriter`] suspends its target through a [`ProcessSource`],
//! copies the threads, modules and the interesting parts of memory into a
//! [`ProcessSnapshot`](minidump::ProcessSnapshot), and serializes that in the
//! Breakpad flavor of the minidump format. The dumps read back with the
//! [minidump](https://crates.io/crates/minidump) crate.
//!
//! Memory that can't be read is skipped and reported by
//! [`MinidumpWriter::gaps`]. A target that exits during the capture still
//! gets a dump of whatever was captured, and the write reports
//! [`WriteError::TargetVanished`].
//!
//! [minidumps]: https://docs.microsoft.com/en-us/windows/win32/api/minidumpapiset/

mod dump_buf;
pub mod elf;
mod error;
mod fake;
#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86", target_arch = "x86_64")
))]
mod ptrace;
mod sections;
mod source;
mod writer;

pub use crate::dump_buf::DumpBuf;
pub use crate::error::WriteError;
pub use crate::fake::FakeProcess;
#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86", target_arch = "x86_64")
))]
pub use crate::ptrace::PtraceProcess;
pub use crate::source::{AuxStream, Mapping, ProcessSource, SourceError};
pub use crate::writer::{AppMemory, CrashContext, MemoryGap, MinidumpWriter, MAX_STACK_LEN};
