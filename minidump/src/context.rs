// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! CPU contexts.

use std::collections::HashSet;
use std::fmt;
use std::io::{self, Write};
use std::mem;

use minidump_common::format::{self as md, ContextFlagsCpu};
use scroll::Pread;

use crate::minidump::MinidumpSystemInfo;
use crate::system_info::{Cpu, PointerWidth};

/// The CPU-specific context structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MinidumpRawContext {
    X86(md::CONTEXT_X86),
    Amd64(md::CONTEXT_AMD64),
}

/// Information about which registers are valid in a `MinidumpContext`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MinidumpContextValidity {
    /// All registers are valid.
    All,
    /// The registers in this set are valid.
    Some(HashSet<&'static str>),
}

/// CPU context such as register states.
///
/// Each thread has its own context, and the exception record, if present,
/// also has its own context. The exception record's context is the state at
/// the time of the fault, while the crashing thread's own context usually
/// points into the signal handler that wrote the dump.
///
/// Unwound frames also carry a context, in which case `valid` records which
/// registers the unwinder actually recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinidumpContext {
    /// The raw CPU register state.
    pub raw: MinidumpRawContext,
    /// Which registers are valid in `raw`.
    pub valid: MinidumpContextValidity,
}

/// Errors encountered while reading a `MinidumpContext`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("failed to read context data")]
    ReadFailure,
    #[error("unknown CPU context")]
    UnknownCpuContext,
}

/// Generic access to the registers of a raw CPU context.
///
/// Register names are the ones Breakpad symbol files use in `STACK CFI`
/// rules, without the leading `$`.
pub trait CpuContext {
    /// The natural register size of this CPU.
    type Register: fmt::LowerHex + Copy + Into<u64> + TryFrom<u64>;

    /// All the registers this context knows about.
    const REGISTERS: &'static [&'static str];

    /// Get a register value if `valid` says it is known.
    fn get_register(&self, reg: &str, valid: &MinidumpContextValidity) -> Option<Self::Register> {
        if let MinidumpContextValidity::Some(ref which) = valid {
            if !which.contains(reg) {
                return None;
            }
        }
        self.get_register_always(reg)
    }

    /// Get a register value regardless of whether it is valid.
    fn get_register_always(&self, reg: &str) -> Option<Self::Register>;

    /// Set a register. Returns `None` for a register this CPU doesn't have.
    fn set_register(&mut self, reg: &str, val: Self::Register) -> Option<()>;

    /// Turn a borrowed register name into the `'static` one from `REGISTERS`.
    fn memoize_register(&self, reg: &str) -> Option<&'static str> {
        Self::REGISTERS.iter().copied().find(|&name| name == reg)
    }

    /// Format a register as zero-padded hex.
    fn format_register(&self, reg: &str) -> String {
        match self.get_register_always(reg) {
            Some(val) => format!("0x{:01$x}", val, mem::size_of::<Self::Register>() * 2),
            None => String::from("(invalid)"),
        }
    }

    fn stack_pointer_register_name(&self) -> &'static str;

    fn instruction_pointer_register_name(&self) -> &'static str;

    fn frame_pointer_register_name(&self) -> &'static str;
}

impl CpuContext for md::CONTEXT_X86 {
    type Register = u32;

    const REGISTERS: &'static [&'static str] = &[
        "eip", "esp", "ebp", "ebx", "esi", "edi", "eax", "ecx", "edx", "efl",
    ];

    fn get_register_always(&self, reg: &str) -> Option<u32> {
        match reg {
            "eip" => Some(self.eip),
            "esp" => Some(self.esp),
            "ebp" => Some(self.ebp),
            "ebx" => Some(self.ebx),
            "esi" => Some(self.esi),
            "edi" => Some(self.edi),
            "eax" => Some(self.eax),
            "ecx" => Some(self.ecx),
            "edx" => Some(self.edx),
            "efl" => Some(self.eflags),
            _ => None,
        }
    }

    fn set_register(&mut self, reg: &str, val: u32) -> Option<()> {
        match reg {
            "eip" => self.eip = val,
            "esp" => self.esp = val,
            "ebp" => self.ebp = val,
            "ebx" => self.ebx = val,
            "esi" => self.esi = val,
            "edi" => self.edi = val,
            "eax" => self.eax = val,
            "ecx" => self.ecx = val,
            "edx" => self.edx = val,
            "efl" => self.eflags = val,
            _ => return None,
        }
        Some(())
    }

    fn stack_pointer_register_name(&self) -> &'static str {
        "esp"
    }

    fn instruction_pointer_register_name(&self) -> &'static str {
        "eip"
    }

    fn frame_pointer_register_name(&self) -> &'static str {
        "ebp"
    }
}

impl CpuContext for md::CONTEXT_AMD64 {
    type Register = u64;

    const REGISTERS: &'static [&'static str] = &[
        "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15", "rip",
    ];

    fn get_register_always(&self, reg: &str) -> Option<u64> {
        match reg {
            "rax" => Some(self.rax),
            "rdx" => Some(self.rdx),
            "rcx" => Some(self.rcx),
            "rbx" => Some(self.rbx),
            "rsi" => Some(self.rsi),
            "rdi" => Some(self.rdi),
            "rbp" => Some(self.rbp),
            "rsp" => Some(self.rsp),
            "r8" => Some(self.r8),
            "r9" => Some(self.r9),
            "r10" => Some(self.r10),
            "r11" => Some(self.r11),
            "r12" => Some(self.r12),
            "r13" => Some(self.r13),
            "r14" => Some(self.r14),
            "r15" => Some(self.r15),
            "rip" => Some(self.rip),
            _ => None,
        }
    }

    fn set_register(&mut self, reg: &str, val: u64) -> Option<()> {
        match reg {
            "rax" => self.rax = val,
            "rdx" => self.rdx = val,
            "rcx" => self.rcx = val,
            "rbx" => self.rbx = val,
            "rsi" => self.rsi = val,
            "rdi" => self.rdi = val,
            "rbp" => self.rbp = val,
            "rsp" => self.rsp = val,
            "r8" => self.r8 = val,
            "r9" => self.r9 = val,
            "r10" => self.r10 = val,
            "r11" => self.r11 = val,
            "r12" => self.r12 = val,
            "r13" => self.r13 = val,
            "r14" => self.r14 = val,
            "r15" => self.r15 = val,
            "rip" => self.rip = val,
            _ => return None,
        }
        Some(())
    }

    fn stack_pointer_register_name(&self) -> &'static str {
        "rsp"
    }

    fn instruction_pointer_register_name(&self) -> &'static str {
        "rip"
    }

    fn frame_pointer_register_name(&self) -> &'static str {
        "rbp"
    }
}

impl From<md::CONTEXT_X86> for MinidumpRawContext {
    fn from(ctx: md::CONTEXT_X86) -> Self {
        MinidumpRawContext::X86(ctx)
    }
}

impl From<md::CONTEXT_AMD64> for MinidumpRawContext {
    fn from(ctx: md::CONTEXT_AMD64) -> Self {
        MinidumpRawContext::Amd64(ctx)
    }
}

impl MinidumpRawContext {
    pub fn get_instruction_pointer(&self) -> u64 {
        match self {
            MinidumpRawContext::X86(ctx) => ctx.eip as u64,
            MinidumpRawContext::Amd64(ctx) => ctx.rip,
        }
    }

    pub fn get_stack_pointer(&self) -> u64 {
        match self {
            MinidumpRawContext::X86(ctx) => ctx.esp as u64,
            MinidumpRawContext::Amd64(ctx) => ctx.rsp,
        }
    }

    pub fn get_frame_pointer(&self) -> u64 {
        match self {
            MinidumpRawContext::X86(ctx) => ctx.ebp as u64,
            MinidumpRawContext::Amd64(ctx) => ctx.rbp,
        }
    }

    pub fn context_flags(&self) -> u32 {
        match self {
            MinidumpRawContext::X86(ctx) => ctx.context_flags,
            MinidumpRawContext::Amd64(ctx) => ctx.context_flags,
        }
    }

    pub fn cpu(&self) -> Cpu {
        match self {
            MinidumpRawContext::X86(_) => Cpu::X86,
            MinidumpRawContext::Amd64(_) => Cpu::X86_64,
        }
    }

    /// The size of this context as stored in a minidump.
    pub fn size(&self) -> usize {
        match self {
            MinidumpRawContext::X86(_) => md::size_of::<md::CONTEXT_X86>(),
            MinidumpRawContext::Amd64(_) => md::size_of::<md::CONTEXT_AMD64>(),
        }
    }
}

impl MinidumpContext {
    /// Return a MinidumpContext given a `MinidumpRawContext`.
    pub fn from_raw(raw: MinidumpRawContext) -> MinidumpContext {
        MinidumpContext {
            raw,
            valid: MinidumpContextValidity::All,
        }
    }

    /// Read a `MinidumpContext` from `bytes`.
    ///
    /// The CPU type comes from `system_info` when it is available. Without
    /// it, an amd64 context is recognized by its size and anything else by
    /// the CPU bits of its leading `context_flags` word.
    pub fn read(
        bytes: &[u8],
        endian: scroll::Endian,
        system_info: Option<&MinidumpSystemInfo>,
    ) -> Result<MinidumpContext, ContextError> {
        let cpu = match system_info.map(|info| info.cpu) {
            Some(cpu @ (Cpu::X86 | Cpu::X86_64)) => cpu,
            _ if bytes.len() == md::size_of::<md::CONTEXT_AMD64>() => Cpu::X86_64,
            _ => {
                let flags: u32 = bytes
                    .pread_with(0, endian)
                    .or(Err(ContextError::ReadFailure))?;
                match ContextFlagsCpu::from_flags(flags) {
                    ContextFlagsCpu::CONTEXT_X86 => Cpu::X86,
                    ContextFlagsCpu::CONTEXT_AMD64 => Cpu::X86_64,
                    _ => return Err(ContextError::UnknownCpuContext),
                }
            }
        };

        let raw = match cpu {
            Cpu::X86 => {
                let ctx: md::CONTEXT_X86 = bytes
                    .pread_with(0, endian)
                    .or(Err(ContextError::ReadFailure))?;
                if ContextFlagsCpu::from_flags(ctx.context_flags) != ContextFlagsCpu::CONTEXT_X86 {
                    return Err(ContextError::ReadFailure);
                }
                MinidumpRawContext::X86(ctx)
            }
            _ => {
                let ctx: md::CONTEXT_AMD64 = bytes
                    .pread_with(0, endian)
                    .or(Err(ContextError::ReadFailure))?;
                if ContextFlagsCpu::from_flags(ctx.context_flags) != ContextFlagsCpu::CONTEXT_AMD64
                {
                    return Err(ContextError::ReadFailure);
                }
                MinidumpRawContext::Amd64(ctx)
            }
        };
        Ok(MinidumpContext::from_raw(raw))
    }

    pub fn get_instruction_pointer(&self) -> u64 {
        self.raw.get_instruction_pointer()
    }

    pub fn get_stack_pointer(&self) -> u64 {
        self.raw.get_stack_pointer()
    }

    /// Get a register by name, as long as it is valid in this context.
    pub fn get_register(&self, reg: &str) -> Option<u64> {
        match self.raw {
            MinidumpRawContext::X86(ref ctx) => ctx.get_register(reg, &self.valid).map(u64::from),
            MinidumpRawContext::Amd64(ref ctx) => ctx.get_register(reg, &self.valid),
        }
    }

    pub fn pointer_width(&self) -> PointerWidth {
        self.raw.cpu().pointer_width()
    }

    /// The registers worth showing for this context, in display order.
    pub fn general_purpose_registers(&self) -> &'static [&'static str] {
        match self.raw {
            MinidumpRawContext::X86(_) => md::CONTEXT_X86::REGISTERS,
            MinidumpRawContext::Amd64(_) => md::CONTEXT_AMD64::REGISTERS,
        }
    }

    /// Iterate over the valid registers as `(name, formatted value)` pairs.
    pub fn valid_registers(&self) -> impl Iterator<Item = (&'static str, String)> + '_ {
        self.general_purpose_registers()
            .iter()
            .filter(move |reg| match self.valid {
                MinidumpContextValidity::All => true,
                MinidumpContextValidity::Some(ref which) => which.contains(**reg),
            })
            .map(move |&reg| (reg, self.format_register(reg)))
    }

    pub fn format_register(&self, reg: &str) -> String {
        match self.raw {
            MinidumpRawContext::X86(ref ctx) => ctx.format_register(reg),
            MinidumpRawContext::Amd64(ref ctx) => ctx.format_register(reg),
        }
    }

    /// Write a human-readable description of this `MinidumpContext` to `f`.
    ///
    /// This is very verbose, it is the format used by `minidump_dump`.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        let name = match self.raw {
            MinidumpRawContext::X86(_) => "CONTEXT_X86",
            MinidumpRawContext::Amd64(_) => "CONTEXT_AMD64",
        };
        writeln!(f, "{name}")?;
        writeln!(
            f,
            "  context_flags                = {:#x}",
            self.raw.context_flags()
        )?;
        for reg in self.general_purpose_registers() {
            writeln!(f, "  {:<28} = {}", reg, self.format_register(reg))?;
        }
        writeln!(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use scroll::Pwrite;

    fn amd64_bytes(rip: u64, rsp: u64) -> Vec<u8> {
        let ctx = md::CONTEXT_AMD64 {
            context_flags: ContextFlagsCpu::CONTEXT_AMD64.bits(),
            rip,
            rsp,
            ..Default::default()
        };
        let mut bytes = vec![0u8; md::size_of::<md::CONTEXT_AMD64>()];
        bytes.pwrite_with(ctx, 0, scroll::LE).unwrap();
        bytes
    }

    #[test]
    fn test_read_amd64_without_system_info() {
        let bytes = amd64_bytes(0x1000, 0x8000);
        let ctx = MinidumpContext::read(&bytes, scroll::LE, None).unwrap();
        assert_eq!(ctx.get_instruction_pointer(), 0x1000);
        assert_eq!(ctx.get_stack_pointer(), 0x8000);
        assert_eq!(ctx.get_register("rsp"), Some(0x8000));
        assert_eq!(ctx.get_register("eip"), None);
    }

    #[test]
    fn test_read_x86_by_flags() {
        let ctx = md::CONTEXT_X86 {
            context_flags: ContextFlagsCpu::CONTEXT_X86.bits(),
            eip: 0x4000,
            ebp: 0x9000,
            ..Default::default()
        };
        let mut bytes = vec![0u8; md::size_of::<md::CONTEXT_X86>()];
        bytes.pwrite_with(ctx, 0, scroll::LE).unwrap();
        let ctx = MinidumpContext::read(&bytes, scroll::LE, None).unwrap();
        assert_eq!(ctx.raw.cpu(), Cpu::X86);
        assert_eq!(ctx.get_register("ebp"), Some(0x9000));
    }

    #[test]
    fn test_unknown_context() {
        let bytes = [0u8; 64];
        assert_eq!(
            MinidumpContext::read(&bytes, scroll::LE, None),
            Err(ContextError::UnknownCpuContext)
        );
    }

    #[test]
    fn test_validity_and_set_register() {
        let bytes = amd64_bytes(0x1000, 0x8000);
        let mut ctx = MinidumpContext::read(&bytes, scroll::LE, None).unwrap();
        if let MinidumpRawContext::Amd64(ref mut raw) = ctx.raw {
            assert_eq!(raw.set_register("rbx", 7), Some(()));
            assert_eq!(raw.set_register("xmm0", 7), None);
            assert_eq!(raw.memoize_register("rbx"), Some("rbx"));
        }
        ctx.valid = MinidumpContextValidity::Some(["rip", "rbx"].into_iter().collect());
        assert_eq!(ctx.get_register("rbx"), Some(7));
        assert_eq!(ctx.get_register("rsp"), None);
        let names: Vec<_> = ctx.valid_registers().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["rbx", "rip"]);
    }
}
