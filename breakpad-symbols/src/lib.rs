// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! A library for working with [Google Breakpad][breakpad]'s
//! text-format [symbol files][symbolfiles].
//!
//! The highest-level API provided by this crate is to use the
//! [`Symbolizer`][symbolizer] struct. It loads and caches one
//! [`SymbolFile`] per module, located through a [`SymbolSupplier`].
//! A symbol file is only accepted for a module if its `MODULE` record
//! carries the module's debug id.
//!
//! [breakpad]: https://chromium.googlesource.com/breakpad/breakpad/+/master/
//! [symbolfiles]: https://chromium.googlesource.com/breakpad/breakpad/+/master/docs/symbol_files.md
//! [symbolizer]: struct.Symbolizer.html
//!
//! # Examples
//!
//! ```
//! use std::collections::HashMap;
//! use breakpad_symbols::{SimpleFrame, SimpleModule, StringSymbolSupplier, Symbolizer};
//! use debugid::DebugId;
//!
//! let id = DebugId::from_breakpad("D3096ED481217FD4C16B29CD9BC208BA0").unwrap();
//! let sym = "MODULE Linux x86_64 D3096ED481217FD4C16B29CD9BC208BA0 app\n\
//!            FUNC 1000 50 0 main\n";
//! let supplier = StringSymbolSupplier::new(HashMap::from([
//!     ("app".to_string(), sym.to_string()),
//! ]));
//! let symbolizer = Symbolizer::new(supplier);
//!
//! let module = SimpleModule::new(0x40_0000, 0x1_0000, "app", id);
//! let mut frame = SimpleFrame::with_instruction(0x40_1010);
//! symbolizer.fill_symbol(&module, &mut frame).unwrap();
//! assert_eq!(frame.function.as_deref(), Some("main"));
//! ```

use std::borrow::Cow;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use debugid::{CodeId, DebugId};
use minidump_common::utils::basename;
use tracing::{debug, trace};

pub use minidump_common::traits::Module;
pub use sym_file::walker::CfiError;
pub use sym_file::{
    CfiRules, Function, InlineFrame, Inlinee, ModuleInfo, PublicSymbol, SourceLine,
    StackInfoCfi, SymbolFile, SymbolParser,
};
pub use symbolizer::Symbolizer;

mod sym_file;
mod symbolizer;

/// A trait for setting symbol information on something like a stack frame.
pub trait FrameSymbolizer {
    /// Get the program counter value for this frame.
    fn get_instruction(&self) -> u64;
    /// Set the name, base address, and parameter size of the function in
    /// which this frame is executing.
    fn set_function(&mut self, name: &str, base: u64, parameter_size: u32);
    /// Set the source file and (1-based) line number this frame represents.
    fn set_source_file(&mut self, file: &str, line: u32, base: u64);
    /// Add an inlined call, called in order from outermost to innermost.
    fn add_inline_frame(&mut self, _name: &str, _file: Option<&str>, _line: Option<u32>) {}
}

/// Callbacks CFI evaluation uses to read the callee's state and write the
/// caller's.
pub trait FrameWalker {
    /// Get the instruction address that we're trying to unwind from.
    fn get_instruction(&self) -> u64;
    /// Get a register-sized value stored at this address.
    fn get_register_at_address(&self, address: u64) -> Option<u64>;
    /// Get the value of a register from the callee's frame.
    fn get_callee_register(&self, name: &str) -> Option<u64>;
    /// Set the value of a register for the caller's frame.
    fn set_caller_register(&mut self, name: &str, val: u64) -> Option<()>;
    /// Explicitly mark one of the caller's registers as invalid.
    fn clear_caller_register(&mut self, name: &str);
    /// Set whatever registers in the caller should be set based on the cfa (e.g. rsp).
    fn set_cfa(&mut self, val: u64) -> Option<()>;
    /// Set whatever registers in the caller should be set based on the return address (e.g. rip).
    fn set_ra(&mut self, val: u64) -> Option<()>;
}

/// Possible results of locating symbols for a module.
#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
    /// Symbol file could not be found.
    #[error("symbol file not found")]
    NotFound,
    /// The module was lacking either the debug file or debug id.
    #[error("the debug file or id were missing")]
    MissingDebugFileOrId,
    /// Symbol file could not be loaded.
    #[error("couldn't read input stream")]
    LoadError(#[from] io::Error),
    /// The symbol file describes a different build of the module.
    #[error("symbol file is for {found}, expected {expected}")]
    IdMismatch { expected: DebugId, found: DebugId },
    /// The symbol file is unusable as a whole.
    #[error("malformed symbol file: {0}")]
    MalformedFile(&'static str),
}

impl SymbolError {
    /// Returns just the name of the error, as a more human-friendly version of
    /// an error-code for error logging.
    pub fn name(&self) -> &'static str {
        match self {
            SymbolError::NotFound => "NotFound",
            SymbolError::MissingDebugFileOrId => "MissingDebugFileOrId",
            SymbolError::LoadError(_) => "LoadError",
            SymbolError::IdMismatch { .. } => "IdMismatch",
            SymbolError::MalformedFile(_) => "MalformedFile",
        }
    }
}

/// An error produced by `fill_symbol`: there were no symbols for the module.
///
/// Having symbols that just don't cover the address is not an error.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FillSymbolError {}

/// Statistics on the symbols of a module.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct SymbolStats {
    /// The `INFO URL` of the loaded symbol file, if any.
    pub symbol_url: Option<String>,
    /// If the symbols were found and loaded into memory.
    pub loaded_symbols: bool,
    /// If we tried to parse the symbols, but failed.
    pub corrupt_symbols: bool,
    /// If a symbol file was found but was for another build of the module.
    pub mismatched_id: bool,
    /// Lines of the symbol file that were skipped as malformed.
    pub skipped_lines: u64,
}

/// A trait for things that can locate symbols for a given module.
pub trait SymbolSupplier {
    /// Locate and load a symbol file for `module`.
    ///
    /// Implementations must reject symbol files whose debug id doesn't match
    /// the module's, [`SymbolFile::load`] does that check.
    fn locate_symbols(&self, module: &dyn Module) -> Result<SymbolFile, SymbolError>;
}

/// The path of a module's symbol file relative to a symbol directory.
///
/// This is the Breakpad layout: `<debug file>/<DEBUG ID>/<stem>.<extension>`,
/// where `stem` is the debug file with a trailing `.pdb` removed. Returns
/// `None` if the module has no debug file or id.
pub fn relative_symbol_path(module: &dyn Module, extension: &str) -> Option<String> {
    let debug_file = module.debug_file()?;
    let debug_id = module.debug_identifier()?;
    let leaf = basename(&debug_file);
    if leaf.is_empty() {
        return None;
    }
    let stem = leaf.strip_suffix(".pdb").unwrap_or(leaf);
    Some(format!(
        "{}/{}/{}.{}",
        leaf,
        debug_id.breakpad(),
        stem,
        extension
    ))
}

fn load_for_module(bytes: &[u8], module: &dyn Module) -> Result<SymbolFile, SymbolError> {
    match module.debug_identifier() {
        Some(id) => SymbolFile::load(bytes, &id),
        None => SymbolFile::from_bytes(bytes),
    }
}

/// An implementation of `SymbolSupplier` that loads Breakpad text-format
/// symbols from local disk paths.
#[derive(Debug)]
pub struct SimpleSymbolSupplier {
    /// Local disk paths in which to search for symbols.
    paths: Vec<PathBuf>,
}

impl SimpleSymbolSupplier {
    /// Instantiate a new `SimpleSymbolSupplier` that will search in `paths`.
    pub fn new(paths: Vec<PathBuf>) -> SimpleSymbolSupplier {
        SimpleSymbolSupplier { paths }
    }
}

impl SymbolSupplier for SimpleSymbolSupplier {
    fn locate_symbols(&self, module: &dyn Module) -> Result<SymbolFile, SymbolError> {
        let rel_path =
            relative_symbol_path(module, "sym").ok_or(SymbolError::MissingDebugFileOrId)?;
        let mut result = Err(SymbolError::NotFound);
        for path in &self.paths {
            let test_path = path.join(&rel_path);
            if !test_path.is_file() {
                continue;
            }
            trace!("trying symbol file {}", test_path.display());
            let bytes = std::fs::read(&test_path)?;
            match load_for_module(&bytes, module) {
                Ok(file) => return Ok(file),
                // Another search path may have the right build.
                Err(err @ SymbolError::IdMismatch { .. }) => {
                    debug!("{}: {}", test_path.display(), err);
                    result = Err(err);
                }
                Err(err) => return Err(err),
            }
        }
        result
    }
}

/// A `SymbolSupplier` that maps debug file names to symbol file contents.
///
/// Useful for tests.
#[derive(Debug, Default)]
pub struct StringSymbolSupplier {
    modules: HashMap<String, String>,
}

impl StringSymbolSupplier {
    /// Make a new `StringSymbolSupplier` with symbols for `modules`, keyed
    /// by debug file name.
    pub fn new(modules: HashMap<String, String>) -> Self {
        Self { modules }
    }
}

impl SymbolSupplier for StringSymbolSupplier {
    fn locate_symbols(&self, module: &dyn Module) -> Result<SymbolFile, SymbolError> {
        let debug_file = module
            .debug_file()
            .ok_or(SymbolError::MissingDebugFileOrId)?;
        match self.modules.get(debug_file.as_ref()) {
            Some(symbols) => load_for_module(symbols.as_bytes(), module),
            None => Err(SymbolError::NotFound),
        }
    }
}

/// A simple implementation of `Module` for callers that don't have one.
#[derive(Clone, Debug, Default)]
pub struct SimpleModule {
    pub base_address: u64,
    pub size: u64,
    pub code_file: String,
    pub debug_file: String,
    pub debug_id: Option<DebugId>,
    pub code_id: Option<CodeId>,
    pub version: Option<String>,
}

impl SimpleModule {
    /// A module loaded at `base_address` whose code and debug file are both `name`.
    pub fn new(base_address: u64, size: u64, name: &str, debug_id: DebugId) -> SimpleModule {
        SimpleModule {
            base_address,
            size,
            code_file: name.to_string(),
            debug_file: name.to_string(),
            debug_id: Some(debug_id),
            ..SimpleModule::default()
        }
    }
}

impl Module for SimpleModule {
    fn base_address(&self) -> u64 {
        self.base_address
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn code_file(&self) -> Cow<str> {
        Cow::Borrowed(&self.code_file)
    }
    fn code_identifier(&self) -> Option<CodeId> {
        self.code_id.clone()
    }
    fn debug_file(&self) -> Option<Cow<str>> {
        Some(Cow::Borrowed(&self.debug_file))
    }
    fn debug_identifier(&self) -> Option<DebugId> {
        self.debug_id
    }
    fn version(&self) -> Option<Cow<str>> {
        self.version.as_deref().map(Cow::Borrowed)
    }
}

/// A simple implementation of `FrameSymbolizer` that just holds data.
#[derive(Debug, Default)]
pub struct SimpleFrame {
    /// The program counter value for this frame.
    pub instruction: u64,
    /// The name of the function in which the current instruction is executing.
    pub function: Option<String>,
    /// The offset of the start of `function` from the module base.
    pub function_base: Option<u64>,
    /// The size, in bytes, that this function's parameters take up on the stack.
    pub parameter_size: Option<u32>,
    /// The name of the source file in which the current instruction is executing.
    pub source_file: Option<String>,
    /// The 1-based index of the line number in `source_file` in which the current instruction is
    /// executing.
    pub source_line: Option<u32>,
    /// The offset of the start of `source_line` from the function base.
    pub source_line_base: Option<u64>,
    /// Inlined calls as `(name, file, line)`, outermost first.
    pub inlines: Vec<(String, Option<String>, Option<u32>)>,
}

impl SimpleFrame {
    /// Instantiate a `SimpleFrame` with instruction pointer `instruction`.
    pub fn with_instruction(instruction: u64) -> SimpleFrame {
        SimpleFrame {
            instruction,
            ..SimpleFrame::default()
        }
    }
}

impl FrameSymbolizer for SimpleFrame {
    fn get_instruction(&self) -> u64 {
        self.instruction
    }
    fn set_function(&mut self, name: &str, base: u64, parameter_size: u32) {
        self.function = Some(String::from(name));
        self.function_base = Some(base);
        self.parameter_size = Some(parameter_size);
    }
    fn set_source_file(&mut self, file: &str, line: u32, base: u64) {
        self.source_file = Some(String::from(file));
        self.source_line = Some(line);
        self.source_line_base = Some(base);
    }
    fn add_inline_frame(&mut self, name: &str, file: Option<&str>, line: Option<u32>) {
        self.inlines
            .push((name.to_string(), file.map(String::from), line));
    }
}
