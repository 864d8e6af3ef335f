// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::cmp::Ordering;
use std::collections::HashMap;

use debugid::DebugId;
use range_map::{Range, RangeMap};

/// The contents of a `MODULE` record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    /// The operating system the module was built for (`Linux`, `windows`, ...).
    pub os: String,
    /// The CPU architecture (`x86`, `x86_64`, ...).
    pub cpu: String,
    /// The identifier that ties this file to exactly one build of the module.
    pub debug_id: DebugId,
    /// The debug file name the symbols were dumped from.
    pub name: String,
}

/// A publicly visible linker symbol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublicSymbol {
    /// The symbol's address relative to the module's load address.
    pub address: u64,
    /// The size of parameters passed to the function.
    pub parameter_size: u32,
    /// The name of the symbol.
    pub name: String,
}

impl Ord for PublicSymbol {
    fn cmp(&self, other: &PublicSymbol) -> Ordering {
        self.address
            .cmp(&other.address)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.parameter_size.cmp(&other.parameter_size))
    }
}

impl PartialOrd for PublicSymbol {
    fn partial_cmp(&self, other: &PublicSymbol) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A mapping from machine code bytes to source line and file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLine {
    /// The start address relative to the module's load address.
    pub address: u64,
    /// The size of this range of instructions in bytes.
    pub size: u32,
    /// The source file name that generated this machine code.
    ///
    /// This is an index into `SymbolFile::files`.
    pub file: u32,
    /// The line number in `file` that generated this machine code.
    pub line: u32,
}

impl SourceLine {
    pub fn memory_range(&self) -> Option<Range<u64>> {
        if self.size == 0 {
            return None;
        }
        let end = self.address.checked_add(self.size as u64 - 1)?;
        Some(Range::new(self.address, end))
    }
}

/// One address range of a function that was inlined into a `FUNC`.
///
/// A single `INLINE` record can cover several ranges, each becomes its own
/// `Inlinee` so they can be kept sorted by address.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Inlinee {
    /// How deeply nested this call is, 0 for a call made directly by the
    /// outer function.
    pub depth: u32,
    /// The start address relative to the module's load address.
    pub address: u64,
    /// The size of this range in bytes.
    pub size: u32,
    /// The file of the call site, an index into `SymbolFile::files`.
    pub call_file: u32,
    /// The line of the call site.
    pub call_line: u32,
    /// The called function, an index into `SymbolFile::inline_origins`.
    pub origin_id: u32,
}

/// A source-language function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    /// The function's start address relative to the module's load address.
    pub address: u64,
    /// The size of the function in bytes.
    pub size: u32,
    /// The size of parameters passed to the function.
    pub parameter_size: u32,
    /// The name of the function as declared in the source.
    pub name: String,
    /// Source line information for this function.
    pub lines: RangeMap<u64, SourceLine>,
    /// Inlined calls, sorted by `(depth, address)`.
    pub inlinees: Vec<Inlinee>,
}

impl Function {
    pub fn memory_range(&self) -> Option<Range<u64>> {
        if self.size == 0 {
            return None;
        }
        let end = self.address.checked_add(self.size as u64 - 1)?;
        Some(Range::new(self.address, end))
    }

    /// The inlined call at nesting level `depth` covering `address`, if any.
    pub fn inlinee_at_depth(&self, depth: u32, address: u64) -> Option<&Inlinee> {
        let index = self
            .inlinees
            .binary_search_by(|inlinee| match inlinee.depth.cmp(&depth) {
                Ordering::Equal => {
                    if address < inlinee.address {
                        Ordering::Greater
                    } else if address - inlinee.address >= inlinee.size as u64 {
                        Ordering::Less
                    } else {
                        Ordering::Equal
                    }
                }
                other => other,
            })
            .ok()?;
        self.inlinees.get(index)
    }
}

/// DWARF CFI rules for recovering registers at a specific address.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct CfiRules {
    /// The address in question.
    pub address: u64,
    /// Postfix expressions to evaluate to recover register values.
    pub rules: String,
}

/// Information used for unwinding stack frames using DWARF CFI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackInfoCfi {
    /// The initial rules for this address range.
    pub init: CfiRules,
    /// The size of this entire address range.
    pub size: u32,
    /// Additional rules to use at specified addresses, sorted by address.
    pub add_rules: Vec<CfiRules>,
}

impl StackInfoCfi {
    pub fn memory_range(&self) -> Option<Range<u64>> {
        if self.size == 0 {
            return None;
        }
        let end = self.init.address.checked_add(self.size as u64 - 1)?;
        Some(Range::new(self.init.address, end))
    }

    /// The `STACK CFI` rules that apply at `address`, in order.
    pub fn rules_at(&self, address: u64) -> &[CfiRules] {
        let count = self
            .add_rules
            .partition_point(|rule| rule.address <= address);
        &self.add_rules[..count]
    }
}

/// A parsed .sym file containing debug symbols.
#[derive(Debug, PartialEq)]
pub struct SymbolFile {
    /// The `MODULE` record this file starts with.
    pub module: ModuleInfo,
    /// The set of source files involved in compilation.
    pub files: HashMap<u32, String>,
    /// Names of functions that were inlined somewhere, keyed by origin id.
    pub inline_origins: HashMap<u32, String>,
    /// Publicly visible symbols, sorted by address.
    pub publics: Vec<PublicSymbol>,
    /// Functions.
    pub functions: RangeMap<u64, Function>,
    /// DWARF CFI unwind information.
    pub cfi_stack_info: RangeMap<u64, StackInfoCfi>,
    /// The `INFO URL` the file was downloaded from, if it says.
    pub url: Option<String>,
    /// Number of lines that could not be parsed and were ignored.
    pub skipped_lines: u64,
}
