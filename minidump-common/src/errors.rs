//! Exception codes and signal details for Linux crashes.
#![allow(non_camel_case_types)]
#![allow(clippy::upper_case_acronyms)]

use enum_primitive_derive::Primitive;

/// Values for [`MINIDUMP_EXCEPTION::exception_code`] on Linux.
///
/// These are signal numbers from bits/signum.h.
///
/// [`MINIDUMP_EXCEPTION::exception_code`]: crate::format::MINIDUMP_EXCEPTION::exception_code
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Primitive)]
pub enum ExceptionCodeLinux {
    SIGHUP = 0x1u32,
    SIGINT = 0x2,
    SIGQUIT = 0x3,
    /// Illegal instruction
    SIGILL = 0x4,
    SIGTRAP = 0x5,
    /// Abort, usually from `abort()` or a failed assertion
    SIGABRT = 0x6,
    /// Bus error
    SIGBUS = 0x7,
    /// Floating-point exception
    SIGFPE = 0x8,
    SIGKILL = 0x9,
    SIGUSR1 = 0xa,
    /// Segmentation violation
    SIGSEGV = 0xb,
    SIGUSR2 = 0xc,
    SIGPIPE = 0xd,
    SIGALRM = 0xe,
    SIGTERM = 0xf,
    SIGSTKFLT = 0x10,
    SIGCHLD = 0x11,
    SIGCONT = 0x12,
    SIGSTOP = 0x13,
    SIGTSTP = 0x14,
    SIGTTIN = 0x15,
    SIGTTOU = 0x16,
    SIGURG = 0x17,
    SIGXCPU = 0x18,
    SIGXFSZ = 0x19,
    SIGVTALRM = 0x1a,
    SIGPROF = 0x1b,
    SIGWINCH = 0x1c,
    SIGIO = 0x1d,
    SIGPWR = 0x1e,
    SIGSYS = 0x1f,
    /// No signal, the dump was requested by the process itself
    DUMP_REQUESTED = 0xffffffff,
}

// si_code values from asm-generic/siginfo.h

#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Primitive)]
pub enum ExceptionCodeLinuxSigillKind {
    SI_USER = 0,
    ILL_ILLOPC = 1,
    ILL_ILLOPN = 2,
    ILL_ILLADR = 3,
    ILL_ILLTRP = 4,
    ILL_PRVOPC = 5,
    ILL_PRVREG = 6,
    ILL_COPROC = 7,
    ILL_BADSTK = 8,
    SI_KERNEL = 0x80,
}

#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Primitive)]
pub enum ExceptionCodeLinuxSigfpeKind {
    SI_USER = 0,
    FPE_INTDIV = 1,
    FPE_INTOVF = 2,
    FPE_FLTDIV = 3,
    FPE_FLTOVF = 4,
    FPE_FLTUND = 5,
    FPE_FLTRES = 6,
    FPE_FLTINV = 7,
    FPE_FLTSUB = 8,
    SI_KERNEL = 0x80,
}

#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Primitive)]
pub enum ExceptionCodeLinuxSigsegvKind {
    SI_USER = 0,
    SEGV_MAPERR = 1,
    SEGV_ACCERR = 2,
    SEGV_BNDERR = 3,
    SEGV_PKUERR = 4,
    SI_KERNEL = 0x80,
}

#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Primitive)]
pub enum ExceptionCodeLinuxSigbusKind {
    SI_USER = 0,
    BUS_ADRALN = 1,
    BUS_ADRERR = 2,
    BUS_OBJERR = 3,
    BUS_MCEERR_AR = 4,
    BUS_MCEERR_AO = 5,
    SI_KERNEL = 0x80,
}
