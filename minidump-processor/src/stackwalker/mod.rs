// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Unwind stack frames for a thread.
//!
//! Each caller is recovered with the best strategy that works for its
//! callee: call frame information from symbols first, then the frame
//! pointer chain, then scanning the stack for something that looks like a
//! return address. The trust level of every frame records which of these
//! produced it.

mod amd64;
mod unwind;
mod x86;

use std::collections::HashSet;
use std::mem;

use minidump::*;
use tracing::trace;

use crate::process_state::*;
use crate::symbols::{FrameSymbolizer, FrameWalker};
use crate::{ProcessorOptions, SymbolProvider};

use self::unwind::Unwind;

/// Number of pointer-sized values to scan through looking for a return address.
const DEFAULT_SCAN_RANGE: u64 = 40;
/// The first frame of an unwind is often in a messy state (signal handlers,
/// partially set up frames), so it gets a longer scan.
const EXTENDED_SCAN_RANGE: u64 = DEFAULT_SCAN_RANGE * 4;

/// Max reasonable size for a single frame is 128 KB. This is used when
/// recovering the frame pointer chain after a scan for a return address.
const MAX_REASONABLE_GAP_BETWEEN_FRAMES: u64 = 128 * 1024;

/// The number of pointers to scan when unwinding a frame of trust `trust`.
fn scan_range(trust: FrameTrust) -> u64 {
    if trust == FrameTrust::Context {
        EXTENDED_SCAN_RANGE
    } else {
        DEFAULT_SCAN_RANGE
    }
}

/// [`FrameWalker`] over a callee's registers, writing the caller's.
///
/// The caller starts out with the callee-saved registers forwarded from the
/// callee. The CFI evaluator overwrites or clears them as its rules say.
struct CfiStackWalker<'a, C: CpuContext> {
    instruction: u64,

    callee_ctx: &'a C,
    callee_validity: &'a MinidumpContextValidity,

    caller_ctx: C,
    caller_validity: HashSet<&'static str>,

    stack_memory: &'a dyn MemoryReader,
}

impl<'a, C> CfiStackWalker<'a, C>
where
    C: CpuContext + Clone,
{
    fn new(
        callee_ctx: &'a C,
        callee_validity: &'a MinidumpContextValidity,
        callee_saved: &[&'static str],
        stack_memory: &'a dyn MemoryReader,
    ) -> Self {
        let instruction = callee_ctx
            .get_register_always(callee_ctx.instruction_pointer_register_name())
            .map(Into::into)
            .unwrap_or_default();
        let caller_validity = callee_saved
            .iter()
            .copied()
            .filter(|reg| callee_ctx.get_register(reg, callee_validity).is_some())
            .collect();
        CfiStackWalker {
            instruction,
            callee_ctx,
            callee_validity,
            caller_ctx: callee_ctx.clone(),
            caller_validity,
            stack_memory,
        }
    }

    fn into_context(self) -> MinidumpContext
    where
        C: Into<MinidumpRawContext>,
    {
        MinidumpContext {
            raw: self.caller_ctx.into(),
            valid: MinidumpContextValidity::Some(self.caller_validity),
        }
    }
}

impl<C> FrameWalker for CfiStackWalker<'_, C>
where
    C: CpuContext,
{
    fn get_instruction(&self) -> u64 {
        self.instruction
    }
    fn get_register_at_address(&self, address: u64) -> Option<u64> {
        self.stack_memory
            .read_pointer(address, mem::size_of::<C::Register>() as u64)
    }
    fn get_callee_register(&self, name: &str) -> Option<u64> {
        self.callee_ctx
            .get_register(name, self.callee_validity)
            .map(Into::into)
    }
    fn set_caller_register(&mut self, name: &str, val: u64) -> Option<()> {
        let name = self.caller_ctx.memoize_register(name)?;
        let val = <C::Register as TryFrom<u64>>::try_from(val).ok()?;
        self.caller_ctx.set_register(name, val)?;
        self.caller_validity.insert(name);
        Some(())
    }
    fn clear_caller_register(&mut self, name: &str) {
        self.caller_validity.remove(name);
    }
    fn set_cfa(&mut self, val: u64) -> Option<()> {
        // The canonical frame address is the caller's stack pointer.
        let reg = self.caller_ctx.stack_pointer_register_name();
        self.set_caller_register(reg, val)
    }
    fn set_ra(&mut self, val: u64) -> Option<()> {
        let reg = self.caller_ctx.instruction_pointer_register_name();
        self.set_caller_register(reg, val)
    }
}

/// A [`FrameSymbolizer`] that only records whether anything matched.
struct DummyFrame {
    instruction: u64,
    has_name: bool,
}

impl FrameSymbolizer for DummyFrame {
    fn get_instruction(&self) -> u64 {
        self.instruction
    }
    fn set_function(&mut self, _name: &str, _base: u64, _parameter_size: u32) {
        self.has_name = true;
    }
    fn set_source_file(&mut self, _file: &str, _line: u32, _base: u64) {}
}

/// Whether `instruction` could be a return address.
///
/// It has to point into a loaded module, and if that module has symbols it
/// has to land inside a known function.
fn instruction_seems_valid<P>(
    instruction: u64,
    modules: &MinidumpModuleList,
    symbol_provider: &P,
) -> bool
where
    P: SymbolProvider,
{
    let Some(module) = modules.module_at_address(instruction) else {
        return false;
    };
    let mut frame = DummyFrame {
        instruction,
        has_name: false,
    };
    match symbol_provider.fill_symbol(module, &mut frame) {
        Ok(()) => frame.has_name,
        // No symbols, so no reason to doubt it.
        Err(_) => true,
    }
}

/// Unwinding must make progress up the stack, and stay on it.
fn stack_seems_valid(caller_sp: u64, callee_sp: u64, stack_memory: &dyn MemoryReader) -> bool {
    caller_sp > callee_sp && stack_memory.contains(caller_sp)
}

/// A caller's ip is the return address, which is the instruction after the
/// CALL that got us to the callee. Point at the CALL itself instead so that
/// symbol lookups describe the call site.
fn adjust_instruction(frame: &mut StackFrame, caller_ip: u64) {
    if caller_ip > 0 {
        frame.instruction = caller_ip - 1;
    }
}

/// A context holding only `(register, value)` pairs, with exactly those valid.
fn partial_context<C>(mut raw: C, regs: &[(&'static str, C::Register)]) -> MinidumpContext
where
    C: CpuContext + Into<MinidumpRawContext>,
{
    let mut valid = HashSet::new();
    for &(reg, val) in regs {
        if raw.set_register(reg, val).is_some() {
            valid.insert(reg);
        }
    }
    MinidumpContext {
        raw: raw.into(),
        valid: MinidumpContextValidity::Some(valid),
    }
}

fn get_caller_frame<P>(
    callee: &MinidumpContext,
    trust: FrameTrust,
    stack_memory: &dyn MemoryReader,
    modules: &MinidumpModuleList,
    symbol_provider: &P,
) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    let valid = &callee.valid;
    match callee.raw {
        MinidumpRawContext::X86(ref ctx) => {
            ctx.get_caller_frame(valid, trust, stack_memory, modules, symbol_provider)
        }
        MinidumpRawContext::Amd64(ref ctx) => {
            ctx.get_caller_frame(valid, trust, stack_memory, modules, symbol_provider)
        }
    }
}

fn fill_source_line_info<P>(
    frame: &mut StackFrame,
    modules: &MinidumpModuleList,
    symbol_provider: &P,
) where
    P: SymbolProvider,
{
    // Find the module whose address range covers this frame's instruction.
    if let Some(module) = modules.module_at_address(frame.instruction) {
        frame.module = Some(module.clone());
        // Missing symbols are already counted in the provider's stats.
        let _ = symbol_provider.fill_symbol(module, frame);
    }
}

/// An iterator over the frames of one thread's stack, innermost first.
///
/// Frames are unwound lazily, so dropping the iterator abandons the walk.
/// The first frame is the starting context itself, even without stack
/// memory. The walk ends when no strategy finds a caller, when a caller's
/// stack pointer leaves the stack memory, when a `(pc, sp)` pair repeats,
/// or after `max_frames` frames.
pub struct StackWalker<'a, P> {
    start: Option<MinidumpContext>,
    callee: Option<(MinidumpContext, FrameTrust)>,
    stack_memory: Option<&'a dyn MemoryReader>,
    modules: &'a MinidumpModuleList,
    symbol_provider: &'a P,
    seen: HashSet<(u64, u64)>,
    emitted: usize,
    max_frames: usize,
}

impl<'a, P> StackWalker<'a, P>
where
    P: SymbolProvider,
{
    pub fn new(
        context: Option<&MinidumpContext>,
        stack_memory: Option<&'a dyn MemoryReader>,
        modules: &'a MinidumpModuleList,
        symbol_provider: &'a P,
        max_frames: usize,
    ) -> Self {
        StackWalker {
            start: context.cloned(),
            callee: None,
            stack_memory,
            modules,
            symbol_provider,
            seen: HashSet::new(),
            emitted: 0,
            max_frames,
        }
    }

    fn unwind_one(&mut self) -> Option<StackFrame> {
        if self.emitted >= self.max_frames {
            trace!("unwind: hit the {} frame limit", self.max_frames);
            return None;
        }
        let stack_memory = self.stack_memory?;
        let (callee, trust) = self.callee.as_ref()?;
        let caller = get_caller_frame(
            callee,
            *trust,
            stack_memory,
            self.modules,
            self.symbol_provider,
        )?;

        let pc = caller.context.get_instruction_pointer();
        let sp = caller.context.get_stack_pointer();
        if !self.seen.insert((pc, sp)) {
            trace!("unwind: ({:#x}, {:#x}) seen before, stopping", pc, sp);
            return None;
        }
        if !stack_memory.contains(sp) {
            trace!("unwind: sp {:#x} left the stack, stopping", sp);
            return None;
        }
        Some(caller)
    }
}

impl<P> Iterator for StackWalker<'_, P>
where
    P: SymbolProvider,
{
    type Item = StackFrame;

    fn next(&mut self) -> Option<StackFrame> {
        let mut frame = match self.start.take() {
            Some(context) => {
                self.seen.insert((
                    context.get_instruction_pointer(),
                    context.get_stack_pointer(),
                ));
                StackFrame::from_context(context, FrameTrust::Context)
            }
            None => match self.unwind_one() {
                Some(frame) => frame,
                None => {
                    // Once a step fails the walk is over for good.
                    self.callee = None;
                    return None;
                }
            },
        };
        fill_source_line_info(&mut frame, self.modules, self.symbol_provider);
        self.callee = Some((frame.context.clone(), frame.trust));
        self.emitted += 1;
        Some(frame)
    }
}

/// Unwind the stack of one thread, starting from `maybe_context`.
pub fn walk_stack<P>(
    thread_id: u32,
    maybe_context: Option<&MinidumpContext>,
    stack_memory: Option<&dyn MemoryReader>,
    modules: &MinidumpModuleList,
    symbol_provider: &P,
    options: &ProcessorOptions,
) -> CallStack
where
    P: SymbolProvider,
{
    let info = match (maybe_context, stack_memory) {
        (None, _) => CallStackInfo::MissingContext,
        (Some(_), None) => {
            trace!("unwind: thread {} has no stack memory", thread_id);
            CallStackInfo::MissingMemory
        }
        (Some(_), Some(_)) => CallStackInfo::Ok,
    };
    let frames = StackWalker::new(
        maybe_context,
        stack_memory,
        modules,
        symbol_provider,
        options.max_frames,
    )
    .collect();
    CallStack {
        frames,
        info,
        thread_id,
    }
}

#[cfg(test)]
mod amd64_unittest;
#[cfg(test)]
mod x86_unittest;
