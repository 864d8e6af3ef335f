//! A library for producing stack traces and other useful information from minidump files.
//!
//! You can use the [minidump](https://crates.io/crates/minidump) crate to parse a minidump file,
//! and then use the [`process_minidump`] function to produce stack traces. If you provide paths to
//! Breakpad-format .sym files, the stack traces will include function and source line information.
//!
//! Stacks are unwound with call frame information from the symbol files when it is available,
//! falling back to following frame pointers and then to scanning the stack for return addresses.
//! Each [`StackFrame`] records which of these found it in its [`FrameTrust`].
//!
//! ```no_run
//! use minidump::Minidump;
//! use minidump_processor::{SimpleSymbolSupplier, Symbolizer};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dump = Minidump::read_path("../testdata/test.dmp")?;
//! let provider = Symbolizer::new(SimpleSymbolSupplier::new(vec![PathBuf::from(
//!     "../testdata/symbols",
//! )]));
//! let state = minidump_processor::process_minidump(&dump, &provider)?;
//! println!("Processed {} threads", state.threads.len());
//! # Ok(())
//! # }
//! ```

mod process_state;
mod processor;
mod stackwalker;
mod symbols;
mod system_info;

pub use crate::process_state::*;
pub use crate::processor::*;
pub use crate::stackwalker::{walk_stack, StackWalker};
pub use crate::symbols::*;
pub use crate::system_info::*;
