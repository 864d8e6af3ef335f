// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::fs;
use std::io;
use std::path::Path;

use debugid::DebugId;
use tracing::trace;

use crate::{FrameSymbolizer, FrameWalker, Module, SymbolError};

pub use self::parser::SymbolParser;
pub use self::types::*;
pub use self::walker::CfiError;

mod parser;
mod types;
pub mod walker;

/// One level of inlined call at an address, see
/// [`SymbolFile::inline_frames_at`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineFrame<'a> {
    /// The name of the inlined function.
    pub name: &'a str,
    /// The source file executing inside the inlined function.
    pub file: Option<&'a str>,
    /// The source line executing inside the inlined function.
    pub line: Option<u32>,
}

impl SymbolFile {
    /// Parse `bytes` and check that they describe the module build `expected_id`.
    ///
    /// A file whose `MODULE` record carries a different id is rejected with
    /// [`SymbolError::IdMismatch`]: its addresses would describe some other
    /// binary.
    pub fn load(bytes: &[u8], expected_id: &DebugId) -> Result<SymbolFile, SymbolError> {
        let file = Self::from_bytes(bytes)?;
        if file.module.debug_id != *expected_id {
            return Err(SymbolError::IdMismatch {
                expected: *expected_id,
                found: file.module.debug_id,
            });
        }
        Ok(file)
    }

    /// Parse an in-memory `SymbolFile` from `bytes` without checking its id.
    pub fn from_bytes(bytes: &[u8]) -> Result<SymbolFile, SymbolError> {
        parser::parse_symbol_bytes(bytes)
    }

    /// Parse a `SymbolFile` from `path` without checking its id.
    pub fn from_file(path: &Path) -> Result<SymbolFile, SymbolError> {
        let bytes = fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SymbolError::NotFound,
            _ => SymbolError::LoadError(e.into()),
        })?;
        Self::from_bytes(&bytes)
    }

    /// The id from this file's `MODULE` record.
    pub fn debug_id(&self) -> DebugId {
        self.module.debug_id
    }

    /// The `FUNC` covering the module-relative `address`.
    pub fn function_at(&self, address: u64) -> Option<&Function> {
        self.functions.get(address)
    }

    /// The source file and line of the module-relative `address`.
    ///
    /// Only line records of the function covering `address` are considered.
    pub fn line_at(&self, address: u64) -> Option<(&str, u32)> {
        let line = self.function_at(address)?.lines.get(address)?;
        let file = self.files.get(&line.file)?;
        Some((file.as_str(), line.line))
    }

    /// Find the nearest `PublicSymbol` whose address is less than or equal to `addr`.
    pub fn find_nearest_public(&self, addr: u64) -> Option<&PublicSymbol> {
        let idx = self.publics.partition_point(|p| p.address <= addr);
        idx.checked_sub(1).and_then(|i| self.publics.get(i))
    }

    /// The inlined calls active at the module-relative `address`, outermost first.
    pub fn inline_frames_at(&self, address: u64) -> Vec<InlineFrame<'_>> {
        let Some(func) = self.function_at(address) else {
            return Vec::new();
        };
        let chain = inline_chain(func, address);
        chain
            .iter()
            .enumerate()
            .map(|(depth, inlinee)| {
                let name = self
                    .inline_origins
                    .get(&inlinee.origin_id)
                    .map(String::as_str)
                    .unwrap_or("<name omitted>");
                // Where we are inside this inlinee is either where it makes
                // the next inlined call, or the line record itself.
                let (file, line) = match chain.get(depth + 1) {
                    Some(next) => (
                        self.files.get(&next.call_file).map(String::as_str),
                        Some(next.call_line),
                    ),
                    None => self.line_at(address).unzip(),
                };
                InlineFrame { name, file, line }
            })
            .collect()
    }

    /// Fill in as much source information for `frame` as possible.
    pub fn fill_symbol(&self, module: &dyn Module, frame: &mut dyn FrameSymbolizer) {
        let base = module.base_address();
        let Some(addr) = frame.get_instruction().checked_sub(base) else {
            return;
        };

        // Look for a FUNC covering the address first.
        if let Some(func) = self.function_at(addr) {
            frame.set_function(&func.name, func.address + base, func.parameter_size);

            // With inlining, the real function is sitting at the call site
            // of the outermost inlined call.
            let chain = inline_chain(func, addr);
            match chain.first() {
                Some(outer) => {
                    if let Some(file) = self.files.get(&outer.call_file) {
                        frame.set_source_file(file, outer.call_line, outer.address + base);
                    }
                }
                None => {
                    if let Some(line) = func.lines.get(addr) {
                        if let Some(file) = self.files.get(&line.file) {
                            frame.set_source_file(file, line.line, line.address + base);
                        }
                    }
                }
            }

            for inline in self.inline_frames_at(addr) {
                frame.add_inline_frame(inline.name, inline.file, inline.line);
            }
        } else if let Some(public) = self.find_nearest_public(addr) {
            // Settle for a PUBLIC.
            frame.set_function(&public.name, public.address + base, public.parameter_size);
        }
    }

    /// Use CFI to recover the caller of the frame `walker` is unwinding.
    pub fn walk_frame(&self, module: &dyn Module, walker: &mut dyn FrameWalker) -> Option<()> {
        let addr = walker
            .get_instruction()
            .checked_sub(module.base_address())?;
        let info = self.cfi_stack_info.get(addr)?;
        trace!("unwind: found STACK CFI for {:#x}", addr);
        match walker::walk_with_stack_cfi(&info.init, info.rules_at(addr), walker) {
            Ok(()) => Some(()),
            Err(err) => {
                trace!("unwind: STACK CFI evaluation failed: {}", err);
                None
            }
        }
    }
}

fn inline_chain(func: &Function, address: u64) -> Vec<&Inlinee> {
    let mut chain = Vec::new();
    while let Some(inlinee) = func.inlinee_at_depth(chain.len() as u32, address) {
        chain.push(inlinee);
    }
    chain
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{SimpleFrame, SimpleModule};
    use std::io::Write;
    use std::str::FromStr;

    const ID: &str = "D3096ED481217FD4C16B29CD9BC208BA0";

    fn debug_id() -> DebugId {
        DebugId::from_breakpad(ID).unwrap()
    }

    fn sample() -> Vec<u8> {
        format!(
            "MODULE Linux x86_64 {ID} crasher
FILE 0 a.c
FILE 1 b.h
FILE 2 c.h
INLINE_ORIGIN 0 helper
INLINE_ORIGIN 1 inner_helper
FUNC 1000 50 0 myFunction
1000 10 42 0
1010 20 43 0
1030 20 44 0
INLINE 0 50 0 0 1010 20
INLINE 1 7 1 1 1018 8
PUBLIC 900 0 early_public
PUBLIC 2000 8 late_public
STACK CFI INIT 1000 50 .cfa: $rsp 8 + .ra: .cfa -8 + ^
STACK CFI 1001 .cfa: $rsp 16 + $rbp: .cfa -16 + ^
"
        )
        .into_bytes()
    }

    #[test]
    fn test_function_and_line_lookup() {
        let sym = SymbolFile::load(
            b"MODULE Linux x86 D3096ED481217FD4C16B29CD9BC208BA0 a.out
FILE 0 a.c
FUNC 1000 50 0 myFunction
1000 10 42 0
",
            &debug_id(),
        )
        .unwrap();
        assert_eq!(sym.function_at(0x1005).unwrap().name, "myFunction");
        assert_eq!(sym.line_at(0x1005), Some(("a.c", 42)));
        assert_eq!(sym.function_at(0x0fff), None);
        assert_eq!(sym.function_at(0x1050), None);
        assert_eq!(sym.line_at(0x1020), None);
    }

    #[test]
    fn test_load_id_mismatch() {
        let other = DebugId::from_str("5A9832E5-2872-41C1-838E-D98914E9B7FF-1").unwrap();
        match SymbolFile::load(&sample(), &other) {
            Err(SymbolError::IdMismatch { expected, found }) => {
                assert_eq!(expected, other);
                assert_eq!(found, debug_id());
            }
            other => panic!("expected IdMismatch, got {other:?}"),
        }
        // Without an expected id anything goes.
        assert_eq!(
            SymbolFile::from_bytes(&sample()).unwrap().debug_id(),
            debug_id()
        );
    }

    #[test]
    fn test_find_nearest_public() {
        let sym = SymbolFile::from_bytes(&sample()).unwrap();
        assert_eq!(sym.find_nearest_public(0x8ff), None);
        assert_eq!(sym.find_nearest_public(0x900).unwrap().name, "early_public");
        assert_eq!(sym.find_nearest_public(0x1fff).unwrap().name, "early_public");
        assert_eq!(sym.find_nearest_public(0x9000).unwrap().name, "late_public");
    }

    #[test]
    fn test_inline_frames() {
        let sym = SymbolFile::from_bytes(&sample()).unwrap();
        assert!(sym.inline_frames_at(0x1005).is_empty());
        assert_eq!(
            sym.inline_frames_at(0x1012),
            vec![InlineFrame {
                name: "helper",
                file: Some("a.c"),
                line: Some(43),
            }]
        );
        assert_eq!(
            sym.inline_frames_at(0x101a),
            vec![
                InlineFrame {
                    name: "helper",
                    file: Some("b.h"),
                    line: Some(7),
                },
                InlineFrame {
                    name: "inner_helper",
                    file: Some("a.c"),
                    line: Some(43),
                },
            ]
        );
    }

    #[test]
    fn test_fill_symbol() {
        let sym = SymbolFile::from_bytes(&sample()).unwrap();
        let module = SimpleModule::new(0x40_0000, 0x10000, "crasher", debug_id());

        let mut frame = SimpleFrame::with_instruction(0x40_1005);
        sym.fill_symbol(&module, &mut frame);
        assert_eq!(frame.function.as_deref(), Some("myFunction"));
        assert_eq!(frame.function_base, Some(0x40_1000));
        assert_eq!(frame.source_file.as_deref(), Some("a.c"));
        assert_eq!(frame.source_line, Some(42));
        assert_eq!(frame.source_line_base, Some(0x40_1000));
        assert!(frame.inlines.is_empty());

        // Inside an inlined call the outer frame reports the call site.
        let mut frame = SimpleFrame::with_instruction(0x40_1012);
        sym.fill_symbol(&module, &mut frame);
        assert_eq!(frame.source_line, Some(50));
        assert_eq!(frame.inlines.len(), 1);
        assert_eq!(frame.inlines[0].0, "helper");

        let mut frame = SimpleFrame::with_instruction(0x40_2010);
        sym.fill_symbol(&module, &mut frame);
        assert_eq!(frame.function.as_deref(), Some("late_public"));
        assert_eq!(frame.parameter_size, Some(8));
        assert_eq!(frame.source_file, None);

        // Below the module base nothing can match.
        let mut frame = SimpleFrame::with_instruction(0x10);
        sym.fill_symbol(&module, &mut frame);
        assert_eq!(frame.function, None);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&sample()).unwrap();
        let sym = SymbolFile::from_file(file.path()).unwrap();
        assert_eq!(sym.module.name, "crasher");
        assert!(matches!(
            SymbolFile::from_file(Path::new("/nonexistent/crasher.sym")),
            Err(SymbolError::NotFound)
        ));
    }
}
