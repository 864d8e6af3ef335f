// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use super::{
    adjust_instruction, instruction_seems_valid, partial_context, scan_range, stack_seems_valid,
    CfiStackWalker, MAX_REASONABLE_GAP_BETWEEN_FRAMES,
};
use crate::process_state::{FrameTrust, StackFrame};
use crate::stackwalker::unwind::Unwind;
use crate::SymbolProvider;
use minidump::format::CONTEXT_AMD64;
use minidump::{MemoryReader, MinidumpContextValidity, MinidumpModuleList};
use tracing::trace;

const POINTER_WIDTH: u64 = 8;
const INSTRUCTION_REGISTER: &str = "rip";
const STACK_POINTER_REGISTER: &str = "rsp";
const FRAME_POINTER_REGISTER: &str = "rbp";
// The System V callee-saved set. rdi and rsi are also preserved on Windows.
const CALLEE_SAVED_REGS: &[&str] = &["rbx", "rbp", "rsp", "r12", "r13", "r14", "r15"];

fn is_valid(valid: &MinidumpContextValidity, reg: &str) -> bool {
    match valid {
        MinidumpContextValidity::All => true,
        MinidumpContextValidity::Some(ref which) => which.contains(reg),
    }
}

fn get_caller_by_cfi<P>(
    ctx: &CONTEXT_AMD64,
    valid: &MinidumpContextValidity,
    stack_memory: &dyn MemoryReader,
    modules: &MinidumpModuleList,
    symbol_provider: &P,
) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    trace!("unwind: trying cfi");
    if !is_valid(valid, INSTRUCTION_REGISTER) || !is_valid(valid, STACK_POINTER_REGISTER) {
        return None;
    }
    let module = modules.module_at_address(ctx.rip)?;

    let mut stack_walker = CfiStackWalker::new(ctx, valid, CALLEE_SAVED_REGS, stack_memory);
    symbol_provider.walk_frame(module, &mut stack_walker)?;
    let caller_ip = stack_walker.caller_ctx.rip;
    let caller_sp = stack_walker.caller_ctx.rsp;
    trace!("unwind: cfi gave ip {:#x} sp {:#x}", caller_ip, caller_sp);

    // Don't accept obviously wrong instruction pointers.
    if is_non_canonical(caller_ip) || !instruction_seems_valid(caller_ip, modules, symbol_provider)
    {
        return None;
    }
    // Don't accept obviously wrong stack pointers.
    if !stack_seems_valid(caller_sp, ctx.rsp, stack_memory) {
        return None;
    }

    let context = stack_walker.into_context();
    let mut frame = StackFrame::from_context(context, FrameTrust::CallFrameInfo);
    adjust_instruction(&mut frame, caller_ip);
    Some(frame)
}

fn get_caller_by_frame_pointer<P>(
    ctx: &CONTEXT_AMD64,
    valid: &MinidumpContextValidity,
    stack_memory: &dyn MemoryReader,
    modules: &MinidumpModuleList,
    symbol_provider: &P,
) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    trace!("unwind: trying frame pointer");
    if !is_valid(valid, FRAME_POINTER_REGISTER) || !is_valid(valid, STACK_POINTER_REGISTER) {
        return None;
    }

    // With frame pointers, a function's prologue pushes the caller's %rbp
    // right below the return address CALL pushed, then points %rbp there:
    //
    // %rip_new = *(%rbp_old + 8)
    // %rsp_new = %rbp_old + 16
    // %rbp_new = *(%rbp_old)
    let last_bp = ctx.rbp;
    let caller_ip = stack_memory.read_u64(last_bp.checked_add(POINTER_WIDTH)?)?;
    let caller_bp = stack_memory.read_u64(last_bp)?;
    let caller_sp = last_bp.checked_add(POINTER_WIDTH * 2)?;

    // The chain must be well-ordered...
    if caller_bp < caller_sp {
        return None;
    }
    // ...and stay inside stack memory.
    if !stack_memory.contains(caller_bp) {
        return None;
    }
    if is_non_canonical(caller_ip) || !instruction_seems_valid(caller_ip, modules, symbol_provider)
    {
        return None;
    }
    if !stack_seems_valid(caller_sp, ctx.rsp, stack_memory) {
        return None;
    }

    let context = partial_context(
        CONTEXT_AMD64::default(),
        &[
            (INSTRUCTION_REGISTER, caller_ip),
            (STACK_POINTER_REGISTER, caller_sp),
            (FRAME_POINTER_REGISTER, caller_bp),
        ],
    );
    let mut frame = StackFrame::from_context(context, FrameTrust::FramePointer);
    adjust_instruction(&mut frame, caller_ip);
    Some(frame)
}

fn get_caller_by_scan<P>(
    ctx: &CONTEXT_AMD64,
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
    let last_bp = is_valid(valid, FRAME_POINTER_REGISTER).then_some(ctx.rbp);
    let last_sp = ctx.rsp;

    // Walk up from the stack pointer until something looks like a return
    // address pushed by the CALL that created the current frame.
    for i in 0..scan_range(trust) {
        let address_of_ip = last_sp.checked_add(i * POINTER_WIDTH)?;
        let caller_ip = stack_memory.read_u64(address_of_ip)?;
        if is_non_canonical(caller_ip)
            || !instruction_seems_valid(caller_ip, modules, symbol_provider)
        {
            continue;
        }
        let caller_sp = address_of_ip + POINTER_WIDTH;

        // Try to restore rbp as well. If the callee has a standard prologue,
        // it pushed rbp right below the return address and rbp points at
        // that slot. A callee that doesn't use rbp left the caller's value
        // in place, in which case it has to point above the return address.
        let mut caller_bp = None;
        if let Some(last_bp) = last_bp {
            let address_of_bp = address_of_ip - POINTER_WIDTH;
            match stack_memory.read_u64(address_of_bp) {
                Some(bp)
                    if last_bp == address_of_bp
                        && bp > address_of_ip
                        && bp - address_of_bp <= MAX_REASONABLE_GAP_BETWEEN_FRAMES
                        && stack_memory.contains(bp) =>
                {
                    caller_bp = Some(bp);
                }
                _ => {
                    if last_bp >= caller_sp && stack_memory.contains(last_bp) {
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
        let context = partial_context(CONTEXT_AMD64::default(), &regs);
        let mut frame = StackFrame::from_context(context, FrameTrust::Scan);
        adjust_instruction(&mut frame, caller_ip);
        return Some(frame);
    }

    None
}

/// x86-64 only uses 48 bits of address space (57 with 5-level paging, which
/// Linux only hands out on request). Valid pointers copy bit 47 into all the
/// high bits, which leaves a hole no pointer can point into.
fn is_non_canonical(ptr: u64) -> bool {
    ptr > 0x7FFF_FFFF_FFFF && ptr < 0xFFFF_8000_0000_0000
}

impl Unwind for CONTEXT_AMD64 {
    fn get_caller_frame<P>(
        &self,
        valid: &MinidumpContextValidity,
        trust: FrameTrust,
        stack_memory: &dyn MemoryReader,
        modules: &MinidumpModuleList,
        syms: &P,
    ) -> Option<StackFrame>
    where
        P: SymbolProvider,
    {
        let frame = get_caller_by_cfi(self, valid, stack_memory, modules, syms)
            .or_else(|| get_caller_by_frame_pointer(self, valid, stack_memory, modules, syms))
            .or_else(|| get_caller_by_scan(self, valid, trust, stack_memory, modules, syms))?;

        // Treat an instruction address of 0 as end-of-stack.
        if frame.context.get_instruction_pointer() == 0 {
            return None;
        }
        // A caller below its callee would let the walk loop forever.
        if frame.context.get_stack_pointer() <= self.rsp {
            return None;
        }
        Some(frame)
    }
}
