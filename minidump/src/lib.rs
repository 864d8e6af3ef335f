// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! A parser for the minidump file format.
//!
//! The `minidump` module provides a parser for the
//! [minidump](https://msdn.microsoft.com/en-us/library/windows/desktop/ms680369%28v=vs.85%29.aspx)
//! file format as produced by Breakpad on Linux.
//!
//! The primary API for this module is the [`Minidump`] struct, which can be
//! instantiated by calling the [`Minidump::read`] or [`Minidump::read_path`]
//! methods. Individual streams are read with [`Minidump::get_stream`].
//!
//! [`parse`] copies everything out into an owned [`ProcessSnapshot`], the
//! same structure the writer serializes.
//!
//! ```no_run
//! use minidump::{Minidump, MinidumpThreadList};
//!
//! # fn foo() -> Result<(), minidump::Error> {
//! let dump = Minidump::read_path("../testdata/test.dmp")?;
//! let threads: MinidumpThreadList = dump.get_stream()?;
//! for t in &threads.threads {
//!     println!("Thread {:#x}", t.raw.thread_id);
//! }
//! # Ok(())
//! # }
//! ```

pub use minidump_common::format;
pub use minidump_common::traits::Module;

mod context;
mod memory;
mod minidump;
mod snapshot;
pub mod system_info;

pub use crate::context::*;
pub use crate::memory::*;
pub use crate::minidump::*;
pub use crate::snapshot::*;
pub use crate::system_info::{Cpu, Os, PointerWidth};
