// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::collections::HashMap;
use std::time::Duration;

use minidump::format as md;
use minidump::*;
// The synthetic `Module` would clash with the trait.
use minidump::Module;
use minidump_processor::{
    CallStackInfo, FrameTrust, ProcessError, ProcessorOptions, StringSymbolSupplier, Symbolizer,
};
use minidump_synth::*;
use test_assembler::*;

const BUILD_ID: [u8; 20] = [
    0x8f, 0x2a, 0x1e, 0x4b, 0x33, 0x0c, 0x5d, 0x71, 0x90, 0x4e, 0x13, 0x67, 0xaa, 0xb0, 0x55,
    0xc2, 0x01, 0x02, 0x03, 0x04,
];
const LSB_RELEASE: &[u8] = b"DISTRIB_ID=Ubuntu\nDISTRIB_RELEASE=22.04\nDISTRIB_CODENAME=jammy\nDISTRIB_DESCRIPTION=\"Ubuntu 22.04.3 LTS\"\n";
// Matches the time_date_stamp SynthMinidump writes.
const DUMP_TIME: u32 = 1262805309;

const CRASHING_THREAD: u32 = 0x1234;
const DUMP_THREAD: u32 = 0x5678;

/// An amd64 Linux dump where `main` called `foo` called `bar`, which
/// segfaulted. The crash handler ran on its own thread.
fn crashed_dump(with_breakpad_info: bool) -> Vec<u8> {
    let e = Endian::Little;
    let name = DumpString::new("/usr/bin/crasher", e);
    let cv = CvElf::new(&BUILD_ID, e);
    let module = minidump_synth::Module::new(e, 0x400000, 0x2000, &name).cv_record(&cv);

    let stack = Memory::with_section(
        Section::with_endian(e)
            .D64(0x401150) // return into foo
            .D64(0x401050) // return into main
            .D64(0)
            .D64(0),
        0x7fff0000,
    );
    // Where the crashing thread was when the handler suspended it.
    let context = amd64_context(e, 0x401280, 0x7fff0000, 0);
    let thread = Thread::new(e, CRASHING_THREAD, &stack, &context);

    let handler_stack = Memory::with_section(Section::with_endian(e).D64(0).D64(0), 0x7ffe0000);
    let handler_context = amd64_context(e, 0x401010, 0x7ffe0000, 0);
    let handler = Thread::new(e, DUMP_THREAD, &handler_stack, &handler_context);

    let fault_context = amd64_context(e, 0x401210, 0x7fff0000, 0);
    let mut exception = Exception::new(e).context(&fault_context);
    exception.thread_id = CRASHING_THREAD;
    exception.exception_code = 11; // SIGSEGV
    exception.exception_flags = 1; // SEGV_MAPERR
    exception.exception_address = 0xdead;

    let mut misc = MiscStream::new(e);
    misc.process_id = Some(4242);
    misc.process_times = Some((DUMP_TIME - 100, 0, 0));

    let mut dump = SynthMinidump::with_endian(e)
        .add_module(module)
        .add(name)
        .add(cv)
        .add_thread(thread)
        .add_thread(handler)
        .add_memory(stack)
        .add_memory(handler_stack)
        .add(context)
        .add(handler_context)
        .add(fault_context)
        .add_exception(exception)
        .add_system_info(SystemInfo::new(e))
        .add_misc_info(misc)
        .set_linux_stream(md::MINIDUMP_STREAM_TYPE::LinuxLsbRelease, LSB_RELEASE);
    if with_breakpad_info {
        let mut breakpad_info = BreakpadInfo::new(e);
        breakpad_info.dump_thread_id = Some(DUMP_THREAD);
        breakpad_info.requesting_thread_id = Some(CRASHING_THREAD);
        dump = dump.add_breakpad_info(breakpad_info);
    }
    dump.finish().unwrap()
}

/// Symbols for the crasher module with CFI for `foo` and `bar`.
fn crasher_symbols(dump: &Minidump<&[u8]>) -> Symbolizer {
    let modules = dump.get_stream::<MinidumpModuleList>().unwrap();
    let module = modules.main_module().unwrap();
    let id = module.debug_identifier().unwrap();
    let contents = format!(
        "MODULE Linux x86_64 {} crasher
FILE 0 /src/crasher.c
FUNC 1000 100 0 main
1000 100 10 0
FUNC 1100 100 0 foo
1100 100 20 0
FUNC 1200 100 0 bar
1200 100 30 0
STACK CFI INIT 1100 100 .cfa: $rsp 8 + .ra: .cfa -8 + ^
STACK CFI INIT 1200 100 .cfa: $rsp 8 + .ra: .cfa -8 + ^
",
        id.breakpad()
    );
    let mut symbols = HashMap::new();
    symbols.insert("crasher".to_string(), contents);
    Symbolizer::new(StringSymbolSupplier::new(symbols))
}

fn no_symbols() -> Symbolizer {
    Symbolizer::new(StringSymbolSupplier::new(HashMap::new()))
}

#[test]
fn test_processor() {
    let bytes = crashed_dump(true);
    let dump = Minidump::read(&bytes[..]).unwrap();
    let provider = crasher_symbols(&dump);
    let state = minidump_processor::process_minidump(&dump, &provider).unwrap();

    assert_eq!(state.system_info.os, Os::Linux);
    assert_eq!(state.system_info.cpu, Cpu::X86_64);
    assert_eq!(state.process_id, Some(4242));
    assert_eq!(
        state.time.duration_since(state.process_create_time.unwrap()).unwrap(),
        Duration::from_secs(100)
    );
    assert!(state.crashed());
    assert_eq!(
        state.crash_reason.unwrap().to_string(),
        "SIGSEGV / SEGV_MAPERR"
    );
    assert_eq!(state.crash_address, Some(0xdead));
    assert_eq!(state.requesting_thread, Some(0));
    assert_eq!(state.threads.len(), 2);

    let stack = &state.threads[0];
    assert_eq!(stack.info, CallStackInfo::Ok);
    assert_eq!(stack.thread_id, CRASHING_THREAD);
    let names: Vec<_> = stack
        .frames
        .iter()
        .map(|f| f.function_name.as_deref().unwrap())
        .collect();
    assert_eq!(names, ["bar", "foo", "main"]);

    // Frame 0 comes from the exception, not the thread's own context.
    let f0 = &stack.frames[0];
    assert_eq!(f0.trust, FrameTrust::Context);
    assert_eq!(f0.context.get_instruction_pointer(), 0x401210);
    assert_eq!(f0.source_line, Some(30));
    assert_eq!(f0.module.as_ref().unwrap().code_file(), "/usr/bin/crasher");

    let f1 = &stack.frames[1];
    assert_eq!(f1.trust, FrameTrust::CallFrameInfo);
    assert_eq!(f1.context.get_instruction_pointer(), 0x401150);
    assert_eq!(f1.context.get_stack_pointer(), 0x7fff0008);
    assert_eq!(f1.instruction, 0x40114f);
    assert_eq!(f1.source_line, Some(20));

    let f2 = &stack.frames[2];
    assert_eq!(f2.trust, FrameTrust::CallFrameInfo);
    assert_eq!(f2.context.get_stack_pointer(), 0x7fff0010);
    assert_eq!(f2.source_line, Some(10));

    assert_eq!(state.threads[1].info, CallStackInfo::DumpThreadSkipped);
    assert_eq!(state.threads[1].thread_id, DUMP_THREAD);
    assert!(state.threads[1].frames.is_empty());
    assert!(state.symbol_stats["crasher"].loaded_symbols);

    let lsb = state.linux_standard_base.as_ref().unwrap();
    assert_eq!(lsb.id, "Ubuntu");
    assert_eq!(lsb.codename, "jammy");
}

#[test]
fn test_exception_thread_requests_without_breakpad_info() {
    let bytes = crashed_dump(false);
    let dump = Minidump::read(&bytes[..]).unwrap();
    let state = minidump_processor::process_minidump(&dump, &no_symbols()).unwrap();

    assert_eq!(state.requesting_thread, Some(0));
    // Without Breakpad info nothing says which thread wrote the dump.
    assert_eq!(state.threads[1].info, CallStackInfo::Ok);
    assert_eq!(state.threads[1].frames.len(), 1);
    assert_eq!(
        state.threads[0].frames[0].context.get_instruction_pointer(),
        0x401210
    );
    assert!(!state.symbol_stats["crasher"].loaded_symbols);
}

#[test]
fn test_max_frames() {
    let bytes = crashed_dump(true);
    let dump = Minidump::read(&bytes[..]).unwrap();
    let provider = crasher_symbols(&dump);
    let options = ProcessorOptions::with_max_frames(2);
    let state =
        minidump_processor::process_minidump_with_options(&dump, &provider, options).unwrap();
    assert_eq!(state.threads[0].frames.len(), 2);
}

#[test]
fn test_print() {
    let bytes = crashed_dump(true);
    let dump = Minidump::read(&bytes[..]).unwrap();
    let provider = crasher_symbols(&dump);
    let state = minidump_processor::process_minidump(&dump, &provider).unwrap();

    let mut out = Vec::new();
    state.print(&mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("Linux Ubuntu 22.04 - jammy (Ubuntu 22.04.3 LTS)"));
    assert!(out.contains("Crash reason:  SIGSEGV / SEGV_MAPERR\nCrash address: 0xdead\n"));
    assert!(out.contains("Process uptime: 100 seconds"));
    assert!(out.contains("Thread 0 (crashed)"));
    assert!(out.contains(" 0  crasher!bar [crasher.c : 30 + 0x10]"));
    assert!(out.contains(" 2  crasher!main [crasher.c : 10 + 0x4f]"));
    assert!(out.contains("    Found by: call frame info"));
    // The dump thread is left out entirely.
    assert!(!out.contains("Thread 1"));
    assert!(out.contains("Loaded modules:"));

    let mut brief = Vec::new();
    state.print_brief(&mut brief).unwrap();
    let brief = String::from_utf8(brief).unwrap();
    assert!(brief.contains("Thread 0 (crashed)"));
    assert!(!brief.contains("Loaded modules:"));
}

#[test]
fn test_no_crash() {
    let e = Endian::Little;
    let stack = Memory::with_section(Section::with_endian(e).D64(0), 0x7fff0000);
    let context = amd64_context(e, 0x401010, 0x7fff0000, 0);
    let thread = Thread::new(e, 1, &stack, &context);
    let bytes = SynthMinidump::with_endian(e)
        .add_thread(thread)
        .add_memory(stack)
        .add(context)
        .add_system_info(SystemInfo::new(e))
        .finish()
        .unwrap();
    let dump = Minidump::read(&bytes[..]).unwrap();
    let state = minidump_processor::process_minidump(&dump, &no_symbols()).unwrap();

    assert!(!state.crashed());
    assert_eq!(state.requesting_thread, None);
    assert_eq!(state.process_create_time, None);
    // Nothing covers the instruction pointer, so there's no module to unwind through.
    assert_eq!(state.threads[0].frames.len(), 1);
    assert!(state.threads[0].frames[0].module.is_none());

    let mut out = Vec::new();
    state.print(&mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("No crash"));
    assert!(out.contains("Process uptime: not available"));
}

#[test]
fn test_missing_thread_list() {
    let bytes = SynthMinidump::new()
        .add_system_info(SystemInfo::new(Endian::Little))
        .finish()
        .unwrap();
    let dump = Minidump::read(&bytes[..]).unwrap();
    match minidump_processor::process_minidump(&dump, &no_symbols()) {
        Err(ProcessError::MissingThreadList) => {}
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_missing_system_info() {
    let e = Endian::Little;
    let stack = Memory::with_section(Section::with_endian(e).D64(0), 0x7fff0000);
    let context = amd64_context(e, 0x401010, 0x7fff0000, 0);
    let thread = Thread::new(e, 1, &stack, &context);
    let bytes = SynthMinidump::with_endian(e)
        .add_thread(thread)
        .add_memory(stack)
        .add(context)
        .finish()
        .unwrap();
    let dump = Minidump::read(&bytes[..]).unwrap();
    let state = minidump_processor::process_minidump(&dump, &no_symbols()).unwrap();
    // The CPU comes from the thread's context, nothing is known of the OS.
    assert_eq!(state.system_info.cpu, Cpu::X86_64);
    assert_eq!(state.system_info.os, Os::Unknown(0));
    assert_eq!(state.system_info.os_version, None);
    assert_eq!(state.threads.len(), 1);
    assert_eq!(state.threads[0].info, CallStackInfo::Ok);
    assert_eq!(state.threads[0].frames[0].instruction, 0x401010);

    let mut out = Vec::new();
    state.print(&mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("CPU: amd64"));
}
