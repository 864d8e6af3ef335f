// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use super::{
    adjust_instruction, instruction_seems_valid, partial_context, scan_range, stack_seems_valid,
    CfiStackWalker, MAX_REASONABLE_GAP_BETWEEN_FRAMES,
};
use crate::process_state::{FrameTrust, StackFrame};
use crate::stackwalker::unwind::Unwind;
use crate::SymbolProvider;
use minidump::format::CONTEXT_X86;
use minidump::{MemoryReader, MinidumpContextValidity, MinidumpModuleList};
use tracing::trace;

type Pointer = u32;
const POINTER_WIDTH: Pointer = 4;
const INSTRUCTION_REGISTER: &str = "eip";
const STACK_POINTER_REGISTER: &str = "esp";
const FRAME_POINTER_REGISTER: &str = "ebp";
const CALLEE_SAVED_REGS: &[&str] = &["ebx", "esi", "edi", "ebp"];

fn is_valid(valid: &MinidumpContextValidity, reg: &str) -> bool {
    match valid {
        MinidumpContextValidity::All => true,
        MinidumpContextValidity::Some(ref which) => which.contains(reg),
    }
}

fn read_pointer(stack_memory: &dyn MemoryReader, address: Pointer) -> Option<Pointer> {
    stack_memory.read_u32(address as u64)
}

fn get_caller_by_cfi<P>(
    ctx: &CONTEXT_X86,
    valid: &MinidumpContextValidity,
    stack_memory: &dyn MemoryReader,
    modules: &MinidumpModuleList,
    symbol_provider: &P,
) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    trace!("unwind: trying cfi");
    if !is_valid(valid, INSTRUCTION_REGISTER) {
        return None;
    }
    let module = modules.module_at_address(ctx.eip as u64)?;

    let mut stack_walker = CfiStackWalker::new(ctx, valid, CALLEE_SAVED_REGS, stack_memory);
    symbol_provider.walk_frame(module, &mut stack_walker)?;
    let caller_ip = stack_walker.caller_ctx.eip;
    let caller_sp = stack_walker.caller_ctx.esp;
    trace!("unwind: cfi gave ip {:#x} sp {:#x}", caller_ip, caller_sp);

    if !stack_seems_valid(caller_sp as u64, ctx.esp as u64, stack_memory) {
        return None;
    }

    let context = stack_walker.into_context();
    let mut frame = StackFrame::from_context(context, FrameTrust::CallFrameInfo);
    adjust_instruction(&mut frame, caller_ip as u64);
    Some(frame)
}

fn get_caller_by_frame_pointer(
    ctx: &CONTEXT_X86,
    valid: &MinidumpContextValidity,
    stack_memory: &dyn MemoryReader,
) -> Option<StackFrame> {
    trace!("unwind: trying frame pointer");
    if !is_valid(valid, FRAME_POINTER_REGISTER) {
        return None;
    }

    // %eip_new = *(%ebp_old + 4)
    // %esp_new = %ebp_old + 8
    // %ebp_new = *(%ebp_old)
    //
    // Unlike amd64 the results aren't checked further here. Rejecting
    // them sends the walker into scanning, which on x86 mostly turns up
    // bogus frames.
    let last_bp = ctx.ebp;
    let caller_ip = read_pointer(stack_memory, last_bp.checked_add(POINTER_WIDTH)?)?;
    let caller_bp = read_pointer(stack_memory, last_bp)?;
    let caller_sp = last_bp.checked_add(POINTER_WIDTH * 2)?;

    let context = partial_context(
        CONTEXT_X86::default(),
        &[
            (INSTRUCTION_REGISTER, caller_ip),
            (STACK_POINTER_REGISTER, caller_sp),
            (FRAME_POINTER_REGISTER, caller_bp),
        ],
    );
    let mut frame = StackFrame::from_context(context, FrameTrust::FramePointer);
    adjust_instruction(&mut frame, caller_ip as u64);
    Some(frame)
}

fn get_caller_by_scan<P>(
    ctx: &CONTEXT_X86,
    valid: &MinidumpContextValidity,
    trust: FrameTrust,
    stack_memory: &dyn MemoryReader,
    modules: &MinidumpModuleList,
    symbol_provider: &P,
) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    trace!("unwind: trying scan");
    if !is_valid(valid, STACK_POINTER_REGISTER) {
        return None;
    }
    let last_bp = is_valid(valid, FRAME_POINTER_REGISTER).then_some(ctx.ebp);
    let last_sp = ctx.esp;

    for i in 0..scan_range(trust) as Pointer {
        let address_of_ip = last_sp.checked_add(i * POINTER_WIDTH)?;
        let caller_ip = read_pointer(stack_memory, address_of_ip)?;
        if !instruction_seems_valid(caller_ip as u64, modules, symbol_provider) {
            continue;
        }
        // ip is pushed by CALL, so sp is just past it.
        let caller_sp = address_of_ip + POINTER_WIDTH;

        // A standard prologue leaves the caller's ebp right below the return
        // address. Otherwise the callee didn't touch ebp and the current
        // value still belongs to the caller.
        let mut caller_bp = None;
        let address_of_bp = address_of_ip.wrapping_sub(POINTER_WIDTH);
        match read_pointer(stack_memory, address_of_bp) {
            Some(bp)
                if bp > address_of_ip
                    && (bp - address_of_bp) as u64 <= MAX_REASONABLE_GAP_BETWEEN_FRAMES
                    && stack_memory.contains(bp as u64) =>
            {
                caller_bp = Some(bp);
            }
            _ => {
                if let Some(last_bp) = last_bp {
                    if last_bp >= caller_sp && stack_memory.contains(last_bp as u64) {
                        caller_bp = Some(last_bp);
                    }
                }
            }
        }

        let mut regs = vec![
            (INSTRUCTION_REGISTER, caller_ip),
            (STACK_POINTER_REGISTER, caller_sp),
        ];
        if let Some(bp) = caller_bp {
            regs.push((FRAME_POINTER_REGISTER, bp));
        }
        let context = partial_context(CONTEXT_X86::default(), &regs);
        let mut frame = StackFrame::from_context(context, FrameTrust::Scan);
        adjust_instruction(&mut frame, caller_ip as u64);
        return Some(frame);
    }

    None
}

impl Unwind for CONTEXT_X86 {
    fn get_caller_frame<P>(
        &self,
        valid: &MinidumpContextValidity,
        trust: FrameTrust,
        stack_memory: &dyn MemoryReader,
        modules: &MinidumpModuleList,
        symbol_provider: &P,
    ) -> Option<StackFrame>
    where
        P: SymbolProvider,
    {
        let frame = get_caller_by_cfi(self, valid, stack_memory, modules, symbol_provider)
            .or_else(|| get_caller_by_frame_pointer(self, valid, stack_memory))
            .or_else(|| {
                get_caller_by_scan(self, valid, trust, stack_memory, modules, symbol_provider)
            })?;

        // Treat an instruction address of 0 as end-of-stack.
        if frame.context.get_instruction_pointer() == 0 {
            return None;
        }
        // Make progress or stop.
        if frame.context.get_stack_pointer() <= self.esp as u64 {
            return None;
        }
        Some(frame)
    }
}
