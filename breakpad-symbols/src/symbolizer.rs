use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use debugid::DebugId;
use minidump_common::utils::basename;
use tracing::{debug, trace};

use crate::{
    FillSymbolError, FrameSymbolizer, FrameWalker, Module, SimpleFrame, SymbolError, SymbolFile,
    SymbolStats, SymbolSupplier,
};

type ModuleKey = (String, Option<String>, Option<String>);

fn module_key(module: &dyn Module) -> ModuleKey {
    (
        module.code_file().to_string(),
        module.debug_file().map(|s| s.to_string()),
        module.debug_identifier().map(|id| id.breakpad().to_string()),
    )
}

type CachedSymbols = Arc<Result<SymbolFile, SymbolError>>;

/// Symbolicate stack frames.
///
/// A `Symbolizer` manages loading symbols and looking up symbols in them
/// including caching so that symbols for a given module are only loaded once.
///
/// Call [`Symbolizer::new`][new] to instantiate a `Symbolizer`. A Symbolizer
/// requires a [`SymbolSupplier`][supplier] to locate symbols. If you have
/// symbols on disk in the customary directory layout, a
/// [`SimpleSymbolSupplier`][simple] will work.
///
/// Use [`get_symbol_at_address`][get_symbol] or [`fill_symbol`][fill_symbol] to
/// do symbol lookup.
///
/// [new]: struct.Symbolizer.html#method.new
/// [supplier]: trait.SymbolSupplier.html
/// [simple]: struct.SimpleSymbolSupplier.html
/// [get_symbol]: struct.Symbolizer.html#method.get_symbol_at_address
/// [fill_symbol]: struct.Symbolizer.html#method.fill_symbol
pub struct Symbolizer {
    /// Symbol supplier for locating symbols.
    supplier: Box<dyn SymbolSupplier + Send + Sync + 'static>,
    /// Cache of symbol locating results.
    symbols: Mutex<HashMap<ModuleKey, CachedSymbols>>,
}

impl Symbolizer {
    /// Create a `Symbolizer` that uses `supplier` to locate symbols.
    pub fn new<T: SymbolSupplier + Send + Sync + 'static>(supplier: T) -> Symbolizer {
        Symbolizer {
            supplier: Box::new(supplier),
            symbols: Mutex::new(HashMap::new()),
        }
    }

    /// Helper method for non-minidump-using callers.
    ///
    /// Pass `debug_file` and `debug_id` describing a specific module,
    /// and `address`, a module-relative address, and get back
    /// a symbol in that module that covers that address, or `None`.
    pub fn get_symbol_at_address(
        &self,
        debug_file: &str,
        debug_id: DebugId,
        address: u64,
    ) -> Option<String> {
        let k = (debug_file, debug_id);
        let mut frame = SimpleFrame::with_instruction(address);
        self.fill_symbol(&k, &mut frame).ok()?;
        frame.function
    }

    /// Fill symbol information in `frame` using the instruction address
    /// from `frame`, and the module information from `module`.
    ///
    /// An Error indicates that no symbols could be found for the relevant
    /// module.
    pub fn fill_symbol(
        &self,
        module: &dyn Module,
        frame: &mut dyn FrameSymbolizer,
    ) -> Result<(), FillSymbolError> {
        let cached = self.get_symbols(module);
        match *cached {
            Ok(ref sym) => {
                sym.fill_symbol(module, frame);
                Ok(())
            }
            Err(_) => Err(FillSymbolError {}),
        }
    }

    /// Tries to use CFI to walk the stack frame of the FrameWalker
    /// using the symbols of the given Module. Output will be written
    /// using the FrameWalker's `set_caller_*` APIs.
    pub fn walk_frame(&self, module: &dyn Module, walker: &mut dyn FrameWalker) -> Option<()> {
        let cached = self.get_symbols(module);
        match *cached {
            Ok(ref sym) => {
                trace!("unwind: found symbols for address, searching for cfi entries");
                sym.walk_frame(module, walker)
            }
            Err(_) => {
                trace!("unwind: couldn't find symbols for address, cannot use cfi");
                None
            }
        }
    }

    /// Collect various statistics on the symbols.
    ///
    /// Keys are the file name of the module (code_file's file name, or the
    /// debug file for modules without one).
    pub fn stats(&self) -> HashMap<String, SymbolStats> {
        let symbols = self.symbols.lock().unwrap_or_else(PoisonError::into_inner);
        symbols
            .iter()
            .map(|((code_file, debug_file, _), res)| {
                let mut stats = SymbolStats::default();
                match **res {
                    Ok(ref sym) => {
                        stats.symbol_url = sym.url.clone();
                        stats.loaded_symbols = true;
                        stats.skipped_lines = sym.skipped_lines;
                    }
                    Err(SymbolError::MalformedFile(_)) => {
                        stats.corrupt_symbols = true;
                    }
                    Err(SymbolError::IdMismatch { .. }) => {
                        stats.mismatched_id = true;
                    }
                    Err(_) => {}
                }
                let name = match basename(code_file) {
                    "" => debug_file.as_deref().unwrap_or_default(),
                    leaf => leaf,
                };
                (name.to_string(), stats)
            })
            .collect()
    }

    /// Gets the parsed SymbolFile for a given module (or an Error), loading
    /// it on first use.
    fn get_symbols(&self, module: &dyn Module) -> CachedSymbols {
        // The lock is held while loading so a module is only ever loaded once.
        let mut symbols = self.symbols.lock().unwrap_or_else(PoisonError::into_inner);
        symbols
            .entry(module_key(module))
            .or_insert_with(|| {
                trace!("locating symbols for module {}", module.code_file());
                let result = self.supplier.locate_symbols(module);
                if let Err(ref err) = result {
                    debug!("no symbols for {}: {}", module.code_file(), err);
                }
                Arc::new(result)
            })
            .clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{SimpleModule, StringSymbolSupplier};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ID: &str = "D3096ED481217FD4C16B29CD9BC208BA0";

    struct CountingSupplier {
        inner: StringSymbolSupplier,
        calls: Arc<AtomicUsize>,
    }

    impl SymbolSupplier for CountingSupplier {
        fn locate_symbols(&self, module: &dyn Module) -> Result<SymbolFile, SymbolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.locate_symbols(module)
        }
    }

    fn symbolizer(calls: Arc<AtomicUsize>) -> Symbolizer {
        let symbols = HashMap::from([
            (
                "app".to_string(),
                format!(
                    "MODULE Linux x86_64 {ID} app\n\
                     INFO URL https://symbols.example.com/app.sym\n\
                     FUNC 1000 50 0 main\n\
                     not a record\n"
                ),
            ),
            (
                "stale".to_string(),
                "MODULE Linux x86_64 5A9832E5287241C1838ED98914E9B7FF1 stale\n".to_string(),
            ),
            ("broken".to_string(), "FUNC 1000 50 0 main\n".to_string()),
        ]);
        Symbolizer::new(CountingSupplier {
            inner: StringSymbolSupplier::new(symbols),
            calls,
        })
    }

    fn module(name: &str) -> SimpleModule {
        SimpleModule::new(0x40_0000, 0x1_0000, name, DebugId::from_breakpad(ID).unwrap())
    }

    #[test]
    fn test_symbols_are_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let symbolizer = symbolizer(calls.clone());
        for _ in 0..3 {
            let mut frame = SimpleFrame::with_instruction(0x40_1010);
            symbolizer.fill_symbol(&module("app"), &mut frame).unwrap();
            assert_eq!(frame.function.as_deref(), Some("main"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut frame = SimpleFrame::with_instruction(0x40_1010);
        assert!(symbolizer.fill_symbol(&module("nope"), &mut frame).is_err());
        assert!(symbolizer.fill_symbol(&module("nope"), &mut frame).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_id_mismatch_means_no_symbols() {
        let symbolizer = symbolizer(Arc::new(AtomicUsize::new(0)));
        let mut frame = SimpleFrame::with_instruction(0x40_1010);
        assert!(symbolizer.fill_symbol(&module("stale"), &mut frame).is_err());
        assert_eq!(frame.function, None);
    }

    #[test]
    fn test_get_symbol_at_address() {
        let symbolizer = symbolizer(Arc::new(AtomicUsize::new(0)));
        let id = DebugId::from_breakpad(ID).unwrap();
        assert_eq!(
            symbolizer.get_symbol_at_address("app", id, 0x1010),
            Some("main".to_string())
        );
        assert_eq!(symbolizer.get_symbol_at_address("app", id, 0x9000), None);
    }

    #[test]
    fn test_stats() {
        let symbolizer = symbolizer(Arc::new(AtomicUsize::new(0)));
        let mut frame = SimpleFrame::with_instruction(0x40_1010);
        for name in ["app", "stale", "broken", "missing"] {
            let _ = symbolizer.fill_symbol(&module(name), &mut frame);
        }
        let stats = symbolizer.stats();
        assert_eq!(stats.len(), 4);
        assert_eq!(
            stats["app"],
            SymbolStats {
                symbol_url: Some("https://symbols.example.com/app.sym".to_string()),
                loaded_symbols: true,
                corrupt_symbols: false,
                mismatched_id: false,
                skipped_lines: 1,
            }
        );
        assert!(stats["stale"].mismatched_id);
        assert!(stats["broken"].corrupt_symbols);
        assert_eq!(stats["missing"], SymbolStats::default());
    }
}
