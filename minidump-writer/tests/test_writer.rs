use std::collections::HashMap;
use std::fs;

use minidump::format::{self as md, MINIDUMP_STREAM_TYPE};
use minidump::{Cpu, Minidump, MinidumpModuleList, Module, Os, SystemRecord};
use minidump_processor::{CallStackInfo, FrameTrust, StringSymbolSupplier, Symbolizer};
use minidump_writer::{
    AppMemory, CrashContext, FakeProcess, MinidumpWriter, SourceError, WriteError,
};

const PID: u32 = 4242;
const CRASHING_THREAD: u32 = 4242;
const OTHER_THREAD: u32 = 4243;
const BUILD_ID: [u8; 20] = [
    0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c,
    0x0d, 0x0e, 0x0f, 0x10,
];
const LSB_RELEASE: &[u8] = b"DISTRIB_ID=Ubuntu\nDISTRIB_RELEASE=22.04\nDISTRIB_CODENAME=jammy\n";

fn context(rip: u64, rsp: u64) -> md::CONTEXT_AMD64 {
    md::CONTEXT_AMD64 {
        context_flags: md::ContextFlagsCpu::CONTEXT_AMD64.bits(),
        rip,
        rsp,
        ..Default::default()
    }
}

/// A process that crashed in `bar`, called from `foo`, called from `main`.
fn crasher() -> FakeProcess {
    let mut process = FakeProcess::new(
        PID,
        SystemRecord {
            os: Os::Linux,
            cpu: Cpu::X86_64,
            cpu_count: 4,
            processor_level: 6,
            processor_revision: 0x9e0a,
            cpu_vendor: Some("GenuineIntel".to_owned()),
            os_version: Some("Linux 5.15.0 #1 SMP x86_64".to_owned()),
        },
    );
    process.map(0x400000, vec![0x90; 0x2000], true, Some("/usr/bin/crasher"));
    process
        .build_ids
        .insert("/usr/bin/crasher".to_owned(), BUILD_ID.to_vec());

    let mut stack = vec![0u8; 0x4000];
    stack[0..8].copy_from_slice(&0x401150u64.to_le_bytes());
    stack[8..16].copy_from_slice(&0x401050u64.to_le_bytes());
    process.map(0x7fff0000, stack, false, Some("[stack]"));
    process.map(0x7ffe0000, vec![0x11; 0x1000], false, None);

    // The crashing thread's own registers point into the signal handler.
    process.add_thread(CRASHING_THREAD, context(0x401280, 0x7fff0000));
    process.add_thread(OTHER_THREAD, context(0x401000, 0x7ffe0100));
    process
        .aux_streams
        .insert(MINIDUMP_STREAM_TYPE::LinuxLsbRelease.into(), LSB_RELEASE.to_vec());
    process
}

fn segv() -> CrashContext {
    CrashContext {
        signal: 11,
        si_code: 1,
        fault_address: 0xdead,
        context: context(0x401210, 0x7fff0000).into(),
    }
}

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

#[test]
fn test_write_and_parse() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crash.dmp");
    let mut process = crasher();
    let mut writer = MinidumpWriter::new(PID, CRASHING_THREAD);
    writer.set_crash_context(segv());
    writer.write_with_source(&mut process, &path).unwrap();
    assert!(process.resumed());
    assert!(writer.gaps().is_empty());

    let bytes = fs::read(&path).unwrap();
    let snapshot = minidump::parse(&bytes).unwrap();
    assert_eq!(snapshot.system.os, Os::Linux);
    assert_eq!(snapshot.system.cpu, Cpu::X86_64);
    assert_eq!(snapshot.system.cpu_vendor.as_deref(), Some("GenuineIntel"));
    assert_eq!(snapshot.process_id, Some(PID));
    assert_eq!(snapshot.requesting_thread, Some(CRASHING_THREAD));
    assert_eq!(snapshot.dump_thread, None);

    assert_eq!(snapshot.modules.len(), 1);
    let module = &snapshot.modules[0];
    assert_eq!(module.name, "/usr/bin/crasher");
    assert_eq!(module.base_address, 0x400000);
    assert_eq!(module.size, 0x2000);
    assert_eq!(module.build_id().as_deref(), Some(&BUILD_ID[..]));

    let ids: Vec<u32> = snapshot.threads.iter().map(|t| t.thread_id).collect();
    assert_eq!(ids, [CRASHING_THREAD, OTHER_THREAD]);
    let crashing = snapshot.crashing_thread().unwrap();
    // The thread record holds the fault-time registers, not the handler's.
    assert_eq!(crashing.context.get_instruction_pointer(), 0x401210);
    assert_eq!(crashing.stack, Some((0x7fff0000, 0x4000)));
    let stack = snapshot.stack_bytes(crashing).unwrap();
    assert_eq!(&stack[..8], &0x401150u64.to_le_bytes());
    assert_eq!(snapshot.threads[1].stack, Some((0x7ffe0000, 0x1000)));
    assert!(snapshot.stacks_mapped());

    let exception = snapshot.exception.as_ref().unwrap();
    assert_eq!(exception.thread_id, CRASHING_THREAD);
    assert_eq!(exception.code, 11);
    assert_eq!(exception.flags, 1);
    assert_eq!(exception.address, 0xdead);
    assert_eq!(exception.crash_reason(Os::Linux).to_string(), "SIGSEGV / SEGV_MAPERR");

    // 128 bytes on either side of the crashing instruction.
    let ip_region = snapshot.memory.region_at(0x401210).unwrap();
    assert_eq!(ip_region.range(), 0x401190..0x401290);
    let other_ip_region = snapshot.memory.region_at(0x401000).unwrap();
    assert_eq!(other_ip_region.range(), 0x400f80..0x401080);

    assert_eq!(snapshot.lsb_release(), Some(LSB_RELEASE));
    assert_eq!(snapshot.linux_streams.len(), 1);
}

#[test]
fn test_process_written_dump() {
    let mut process = crasher();
    let mut bytes = vec![];
    MinidumpWriter::new(PID, CRASHING_THREAD)
        .set_crash_context(segv())
        .dump(&mut process, &mut bytes)
        .unwrap();

    let dump = Minidump::read(&bytes[..]).unwrap();
    let provider = crasher_symbols(&dump);
    let state = minidump_processor::process_minidump(&dump, &provider).unwrap();
    assert_eq!(state.process_id, Some(PID));
    assert_eq!(state.crash_address, Some(0xdead));
    assert_eq!(state.requesting_thread, Some(0));

    let stack = &state.threads[0];
    assert_eq!(stack.info, CallStackInfo::Ok);
    let names: Vec<_> = stack
        .frames
        .iter()
        .map(|f| f.function_name.as_deref().unwrap())
        .collect();
    assert_eq!(names, ["bar", "foo", "main"]);
    assert_eq!(stack.frames[0].trust, FrameTrust::Context);
    assert_eq!(stack.frames[1].trust, FrameTrust::CallFrameInfo);
    assert_eq!(
        stack.frames[0].module.as_ref().unwrap().code_file(),
        "/usr/bin/crasher"
    );

    let lsb = state.linux_standard_base.as_ref().unwrap();
    assert_eq!(lsb.release, "22.04");
}

#[test]
fn test_dump_without_crash() {
    let mut process = crasher();
    let mut bytes = vec![];
    MinidumpWriter::new(PID, CRASHING_THREAD)
        .dump(&mut process, &mut bytes)
        .unwrap();

    let snapshot = minidump::parse(&bytes).unwrap();
    assert!(snapshot.exception.is_none());
    let thread = snapshot.thread(CRASHING_THREAD).unwrap();
    assert_eq!(thread.context.get_instruction_pointer(), 0x401280);
    // Every thread still gets its instruction pointer window.
    let ip_region = snapshot.memory.region_at(0x401280).unwrap();
    assert_eq!(ip_region.range(), 0x401200..0x401300);
    assert!(snapshot.memory.contains(0x401000));
    assert!(!snapshot.memory.contains(0xdead));
}

#[test]
fn test_memory_around_every_thread_ip() {
    let mut process = crasher();
    // Near the end of the module, so its window is clipped.
    process.add_thread(4244, context(0x401fc0, 0x7ffe0200));
    // Outside any mapping, so it has no window at all.
    process.add_thread(4245, context(0x900000, 0x7ffe0300));

    let mut bytes = vec![];
    MinidumpWriter::new(PID, CRASHING_THREAD)
        .set_crash_context(segv())
        .dump(&mut process, &mut bytes)
        .unwrap();

    let snapshot = minidump::parse(&bytes).unwrap();
    assert_eq!(snapshot.threads.len(), 4);
    for thread in &snapshot.threads[..3] {
        let ip = thread.context.get_instruction_pointer();
        assert!(snapshot.memory.contains(ip), "no memory around {:#x}", ip);
    }
    assert_eq!(
        snapshot.memory.region_at(0x401fc0).unwrap().range(),
        0x401f40..0x402000
    );
    assert!(!snapshot.memory.contains(0x900000));
}

#[test]
fn test_unreadable_memory_leaves_gaps() {
    let mut process = crasher();
    // A stack mapping that is listed but can't be read.
    process.mappings.push(minidump_writer::Mapping {
        start: 0x7ffd0000,
        end: 0x7ffd2000,
        offset: 0,
        readable: true,
        executable: false,
        name: None,
    });
    process.mappings.sort_by_key(|m| m.start);
    process.add_thread(4244, context(0x401000, 0x7ffd1008));

    let mut writer = MinidumpWriter::new(PID, CRASHING_THREAD);
    writer.set_crash_context(segv()).set_app_memory(vec![
        AppMemory {
            ptr: 0x7ffe0800,
            length: 0x100,
        },
        AppMemory {
            ptr: 0x10000,
            length: 0x20,
        },
    ]);
    let mut bytes = vec![];
    writer.dump(&mut process, &mut bytes).unwrap();

    let gaps: Vec<(u64, u64)> = writer.gaps().iter().map(|g| (g.start, g.len)).collect();
    assert_eq!(gaps, [(0x7ffd1000, 0x1000), (0x10000, 0x20)]);

    let snapshot = minidump::parse(&bytes).unwrap();
    assert_eq!(snapshot.threads.len(), 3);
    assert_eq!(snapshot.thread(4244).unwrap().stack, None);
    // App memory inside an already captured stack adds nothing new.
    assert_eq!(
        snapshot.memory.region_at(0x7ffe0800).unwrap().base_address,
        0x7ffe0000
    );
}

#[test]
fn test_target_vanished() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.dmp");
    let mut process = crasher();
    // The crashing thread's stack is read, then the process is gone.
    process.vanish_after_reads = Some(1);

    let mut writer = MinidumpWriter::new(PID, CRASHING_THREAD);
    writer.set_crash_context(segv());
    let err = writer.write_with_source(&mut process, &path).unwrap_err();
    assert!(matches!(err, WriteError::TargetVanished));
    assert!(process.resumed());

    let snapshot = minidump::parse(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(snapshot.threads.len(), 1);
    assert_eq!(snapshot.threads[0].thread_id, CRASHING_THREAD);
    assert!(snapshot.exception.is_some());
    assert_eq!(snapshot.modules.len(), 1);
    assert!(snapshot.linux_streams.is_empty());
}

#[test]
fn test_attach_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("never.dmp");
    let mut process = crasher();
    process.refuse_attach = Some(|| SourceError::PermissionDenied);

    let err = MinidumpWriter::new(PID, CRASHING_THREAD)
        .write_with_source(&mut process, &path)
        .unwrap_err();
    assert!(matches!(err, WriteError::PermissionDenied(PID)));
    assert!(!path.exists());

    process.refuse_attach = Some(|| SourceError::NoSuchProcess);
    let err = MinidumpWriter::new(PID, CRASHING_THREAD)
        .write_with_source(&mut process, &path)
        .unwrap_err();
    assert_eq!(err.name(), "TargetUnreachable");
    assert!(!path.exists());
}

#[test]
fn test_disk_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing-dir").join("crash.dmp");
    let mut process = crasher();
    let err = MinidumpWriter::new(PID, CRASHING_THREAD)
        .write_with_source(&mut process, &path)
        .unwrap_err();
    assert!(matches!(err, WriteError::Io(_)));
    assert!(!path.exists());
    assert!(process.resumed());
}

#[test]
fn test_size_limit_truncates_extra_threads() {
    let mut process = crasher();
    for i in 0..24u64 {
        let base = 0x1000_0000 + i * 0x10000;
        process.map(base, vec![0; 0x4000], false, None);
        process.add_thread(5000 + i as u32, context(0x401000, base + 0x10));
    }

    let mut writer = MinidumpWriter::new(PID, CRASHING_THREAD);
    writer.set_minidump_size_limit(128 * 1024);
    let mut bytes = vec![];
    writer.dump(&mut process, &mut bytes).unwrap();

    let snapshot = minidump::parse(&bytes).unwrap();
    assert_eq!(snapshot.threads.len(), 26);
    let lens: Vec<u64> = snapshot
        .threads
        .iter()
        .map(|t| t.stack.unwrap().1)
        .collect();
    assert_eq!(lens[0], 0x4000);
    assert!(lens[2..20].iter().all(|&len| len == 0x4000));
    assert!(lens[20..].iter().all(|&len| len == 0x800));

    let mut unlimited = vec![];
    MinidumpWriter::new(PID, CRASHING_THREAD)
        .dump(&mut crasher(), &mut unlimited)
        .unwrap();
    assert!(bytes.len() > unlimited.len());
}
