//! This module defines the interface between minidump-processor and its [Symbolizer][].
//!
//! minidump-processor and the [Symbolizer][] communicate using a series of traits. The symbolizer
//! must provide implementations of these traits:
//!
//! * [SymbolProvider][] - provides symbolication, cfi evaluation, and debug statistics
//!     * Implemented by [Symbolizer][]
//!     * Several providers can be consulted in turn via [MultiSymbolProvider][].
//!
//! While minidump-processor provides implementations of these traits:
//!
//! * [FrameSymbolizer][] - callbacks that symbolication uses to return its results.
//!     * Implemented by [StackFrame][crate::process_state::StackFrame]
//!     * Implemented by DummyFrame (private, for a stack scanning heuristic)
//! * [FrameWalker][] - callbacks that cfi eval uses to read callee state and write caller state.
//!     * Implemented by CfiStackWalker (private)
//!
//! # Example
//!
//! ```no_run
//! use minidump::Minidump;
//! use minidump_processor::{ProcessorOptions, SimpleSymbolSupplier, Symbolizer};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dump = Minidump::read_path("../testdata/test.dmp")?;
//! let provider = Symbolizer::new(SimpleSymbolSupplier::new(vec![PathBuf::from(
//!     "../testdata/symbols",
//! )]));
//! let options = ProcessorOptions::default();
//! let state = minidump_processor::process_minidump_with_options(&dump, &provider, options)?;
//! state.print(&mut std::io::stdout())?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

pub use breakpad_symbols::{
    FillSymbolError, FrameSymbolizer, FrameWalker, SimpleSymbolSupplier, StringSymbolSupplier,
    SymbolError, SymbolFile, SymbolStats, SymbolSupplier, Symbolizer,
};
use minidump::Module;

/// The symbol lookups the stack walker needs.
pub trait SymbolProvider {
    /// Fill in the function, source line and inline frames of `frame`.
    ///
    /// An `Err` means there were no symbols for `module` at all, as opposed
    /// to symbols that happen not to cover the frame's address.
    fn fill_symbol(
        &self,
        module: &dyn Module,
        frame: &mut dyn FrameSymbolizer,
    ) -> Result<(), FillSymbolError>;
    /// Recover the caller's registers with CFI, `None` if there is none.
    fn walk_frame(&self, module: &dyn Module, walker: &mut dyn FrameWalker) -> Option<()>;
    fn stats(&self) -> HashMap<String, SymbolStats>;
}

impl SymbolProvider for Symbolizer {
    fn fill_symbol(
        &self,
        module: &dyn Module,
        frame: &mut dyn FrameSymbolizer,
    ) -> Result<(), FillSymbolError> {
        self.fill_symbol(module, frame)
    }
    fn walk_frame(&self, module: &dyn Module, walker: &mut dyn FrameWalker) -> Option<()> {
        self.walk_frame(module, walker)
    }
    fn stats(&self) -> HashMap<String, SymbolStats> {
        self.stats()
    }
}

/// Consult several [`SymbolProvider`]s, in the order they were added.
#[derive(Default)]
pub struct MultiSymbolProvider {
    providers: Vec<Box<dyn SymbolProvider>>,
}

impl MultiSymbolProvider {
    pub fn new() -> MultiSymbolProvider {
        Default::default()
    }

    pub fn add(&mut self, provider: Box<dyn SymbolProvider>) {
        self.providers.push(provider);
    }
}

impl SymbolProvider for MultiSymbolProvider {
    fn fill_symbol(
        &self,
        module: &dyn Module,
        frame: &mut dyn FrameSymbolizer,
    ) -> Result<(), FillSymbolError> {
        // Return Ok if any of the providers had symbols.
        let mut result = Err(FillSymbolError {});
        for p in self.providers.iter() {
            if p.fill_symbol(module, frame).is_ok() {
                result = Ok(());
            }
        }
        result
    }

    fn walk_frame(&self, module: &dyn Module, walker: &mut dyn FrameWalker) -> Option<()> {
        self.providers
            .iter()
            .find_map(|p| p.walk_frame(module, walker))
    }

    fn stats(&self) -> HashMap<String, SymbolStats> {
        let mut result = HashMap::new();
        for p in self.providers.iter() {
            for (name, stats) in p.stats() {
                // Whichever provider actually loaded symbols has the interesting stats.
                let slot = result.entry(name).or_insert_with(SymbolStats::default);
                if !slot.loaded_symbols {
                    *slot = stats;
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use breakpad_symbols::{SimpleFrame, SimpleModule};
    use debugid::DebugId;

    fn provider(name: &str, contents: &str) -> Box<dyn SymbolProvider> {
        Box::new(Symbolizer::new(StringSymbolSupplier::new(HashMap::from([(
            name.to_string(),
            contents.to_string(),
        )]))))
    }

    #[test]
    fn test_multi_provider() {
        let debug_id = "D3096ED481217FD4C16B29CD9BC208BA0";
        let mut multi = MultiSymbolProvider::new();
        multi.add(provider(
            "other",
            &format!("MODULE Linux x86_64 {debug_id} other\nFUNC 10 10 0 nope\n"),
        ));
        multi.add(provider(
            "app",
            &format!("MODULE Linux x86_64 {debug_id} app\nFUNC 1000 50 0 main\n"),
        ));
        let module = SimpleModule::new(
            0x40_0000,
            0x1_0000,
            "app",
            DebugId::from_breakpad(debug_id).unwrap(),
        );
        let mut frame = SimpleFrame::with_instruction(0x40_1010);
        assert!(multi.fill_symbol(&module, &mut frame).is_ok());
        assert_eq!(frame.function.as_deref(), Some("main"));
        assert!(multi.stats()["app"].loaded_symbols);

        let empty = MultiSymbolProvider::new();
        assert!(empty.fill_symbol(&module, &mut frame).is_err());
    }
}
