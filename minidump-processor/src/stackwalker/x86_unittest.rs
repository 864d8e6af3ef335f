// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::collections::HashMap;

use crate::process_state::*;
use crate::stackwalker::{walk_stack, StackWalker};
use crate::ProcessorOptions;
use breakpad_symbols::{StringSymbolSupplier, Symbolizer};
use minidump::format::CONTEXT_X86;
use minidump::*;
use test_assembler::*;

const BUILD_ID: &[u8] = &[
    0x10, 0x32, 0x54, 0x76, 0x98, 0xba, 0xdc, 0xfe, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef,
];

struct TestFixture {
    pub raw: CONTEXT_X86,
    pub modules: MinidumpModuleList,
    pub symbols: HashMap<String, String>,
    pub max_frames: usize,
}

impl TestFixture {
    pub fn new() -> TestFixture {
        TestFixture {
            raw: CONTEXT_X86::default(),
            // Give the two modules reasonable standard locations and names
            // for tests to play with.
            modules: MinidumpModuleList::from_modules(vec![
                MinidumpModule::with_build_id(0x40000000, 0x10000, "module1", BUILD_ID),
                MinidumpModule::new(0x50000000, 0x10000, "module2"),
            ]),
            symbols: HashMap::new(),
            max_frames: 1024,
        }
    }

    /// Give module1 symbols, `records` goes after the MODULE line.
    pub fn add_symbols(&mut self, records: &str) {
        let id = self
            .modules
            .main_module()
            .and_then(|m| m.debug_identifier())
            .unwrap();
        self.symbols.insert(
            "module1".to_string(),
            format!("MODULE Linux x86 {} module1\n{}", id.breakpad(), records),
        );
    }

    pub fn walk_stack(&self, stack: Section) -> CallStack {
        let context = MinidumpContext {
            raw: MinidumpRawContext::X86(self.raw.clone()),
            valid: MinidumpContextValidity::All,
        };
        let base = stack.start().value().unwrap();
        let size = stack.size();
        let stack = stack.get_contents().unwrap();
        let stack_memory = MinidumpMemory {
            desc: Default::default(),
            base_address: base,
            size,
            bytes: &stack,
            endian: scroll::Endian::Little,
        };
        let symbolizer = Symbolizer::new(StringSymbolSupplier::new(self.symbols.clone()));
        walk_stack(
            0,
            Some(&context),
            Some(&stack_memory),
            &self.modules,
            &symbolizer,
            &ProcessorOptions {
                max_frames: self.max_frames,
            },
        )
    }
}

#[test]
fn test_simple() {
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack.D32(0).D32(0); // end-of-stack marker
    f.raw.eip = 0x40000200;
    f.raw.ebp = 0x80000000;
    let s = f.walk_stack(stack);
    assert_eq!(s.info, CallStackInfo::Ok);
    assert_eq!(s.frames.len(), 1);
    let f = &s.frames[0];
    let m = f.module.as_ref().unwrap();
    assert_eq!(m.code_file(), "module1");
}

// Walk a traditional frame. A traditional frame saves the caller's
// %ebp just below the return address, and has its own %ebp pointing
// at the saved %ebp.
#[test]
fn test_traditional() {
    let mut f = TestFixture::new();
    let frame0_ebp = Label::new();
    let frame1_ebp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        .append_repeated(0, 12) // frame 0: space
        .mark(&frame0_ebp) // frame 0 %ebp points here
        .D32(&frame1_ebp) // frame 0: saved %ebp
        .D32(0x40008679) // frame 0: return address
        .append_repeated(0, 8) // frame 1: space
        .mark(&frame1_ebp) // frame 1 %ebp points here
        .D32(0) // frame 1: saved %ebp (stack end)
        .D32(0); // frame 1: return address (stack end)
    f.raw.eip = 0x4000c7a5;
    f.raw.esp = stack.start().value().unwrap() as u32;
    f.raw.ebp = frame0_ebp.value().unwrap() as u32;
    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);

    let f0 = &s.frames[0];
    assert_eq!(f0.trust, FrameTrust::Context);
    assert_eq!(f0.context.valid, MinidumpContextValidity::All);
    assert_eq!(f0.instruction, 0x4000c7a5);

    let f1 = &s.frames[1];
    assert_eq!(f1.trust, FrameTrust::FramePointer);
    assert_eq!(f1.instruction, 0x40008678);
    assert_eq!(f1.context.get_register("ebp"), frame1_ebp.value());
    assert_eq!(f1.context.get_register("esi"), None);
}

// Walk a traditional frame, but use a bogus %ebp value, forcing a scan
// of the stack for something that looks like a return address.
#[test]
fn test_traditional_scan() {
    let mut f = TestFixture::new();
    let frame1_esp = Label::new();
    let frame1_ebp = Label::new();
    let mut stack = Section::new();
    let stack_start = 0x80000000;
    stack.start().set_const(stack_start);
    stack = stack
        // frame 0
        .D32(0xf065dc76) // locals area:
        .D32(0x46ee2167) // garbage that doesn't look like
        .D32(0xbab023ec) // a return address
        .D32(&frame1_ebp) // saved %ebp (%ebp fails to point here, forcing scan)
        .D32(0x4000129d) // return address
        // frame 1
        .mark(&frame1_esp)
        .append_repeated(0, 8) // space
        .mark(&frame1_ebp) // %ebp points here
        .D32(0) // saved %ebp (stack end)
        .D32(0); // return address (stack end)

    f.raw.eip = 0x4000f49d;
    f.raw.esp = stack.start().value().unwrap() as u32;
    // Make the frame pointer bogus, to make the stackwalker scan the stack
    // for something that looks like a return address.
    f.raw.ebp = 0xd43eed6e;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);

    let f0 = &s.frames[0];
    assert_eq!(f0.trust, FrameTrust::Context);
    if let MinidumpRawContext::X86(ctx) = &f0.context.raw {
        assert_eq!(ctx.eip, 0x4000f49d);
        assert_eq!(ctx.esp, stack_start as u32);
        assert_eq!(ctx.ebp, 0xd43eed6e);
    } else {
        unreachable!();
    }

    let f1 = &s.frames[1];
    assert_eq!(f1.trust, FrameTrust::Scan);
    if let MinidumpContextValidity::Some(ref which) = f1.context.valid {
        assert!(which.contains("eip"));
        assert!(which.contains("esp"));
        assert!(which.contains("ebp"));
    } else {
        unreachable!();
    }
    assert_eq!(f1.instruction + 1, 0x4000129d);
    if let MinidumpRawContext::X86(ctx) = &f1.context.raw {
        assert_eq!(ctx.eip, 0x4000129d);
        assert_eq!(ctx.esp, frame1_esp.value().unwrap() as u32);
        assert_eq!(ctx.ebp, frame1_ebp.value().unwrap() as u32);
    } else {
        unreachable!();
    }
}

// Force scanning for a return address a long way down the stack. The
// context frame gets a longer scan than any other frame.
#[test]
fn test_traditional_scan_long_way() {
    let mut f = TestFixture::new();
    let frame1_esp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        .D32(0xf065dc76) // garbage
        .append_repeated(0, 60 * 4) // well past the normal scan range
        .D32(0x4000129d) // return address
        .mark(&frame1_esp)
        .append_repeated(0, 8);

    f.raw.eip = 0x4000f49d;
    f.raw.esp = stack.start().value().unwrap() as u32;
    f.raw.ebp = 0xd43eed6e;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    assert_eq!(s.frames[1].trust, FrameTrust::Scan);
    assert_eq!(
        s.frames[1].context.get_stack_pointer(),
        frame1_esp.value().unwrap()
    );
}

#[test]
fn test_scan_rejects_addresses_outside_functions() {
    // module1 has symbols, so a return address into it has to land in a
    // function. module2 has none, so anything inside it will do.
    let mut f = TestFixture::new();
    f.add_symbols("FUNC 1000 100 0 real_function\n");
    let frame1_esp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        .D32(0x40008000) // in module1, but no function there
        .D32(0x50000123) // in module2, which has no symbols
        .mark(&frame1_esp)
        .append_repeated(0, 8);

    f.raw.eip = 0x40001010;
    f.raw.esp = stack.start().value().unwrap() as u32;
    f.raw.ebp = 0xd43eed6e;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    assert_eq!(s.frames[0].function_name.as_deref(), Some("real_function"));
    assert_eq!(s.frames[1].instruction, 0x50000122);
    assert_eq!(
        s.frames[1].module.as_ref().map(|m| m.code_file().into_owned()),
        Some("module2".to_string())
    );
}

#[test]
fn test_cfi() {
    let mut f = TestFixture::new();
    f.add_symbols(
        "FUNC 4000 100 0 enchiridion
FUNC 5000 100 0 epictetus
FUNC 6000 100 0 discourses
STACK CFI INIT 4000 100 .cfa: $esp 8 + .ra: .cfa 4 - ^ $ebx: .cfa 8 - ^
STACK CFI INIT 5000 100 .cfa: $esp 4 + .ra: .cfa 4 - ^
",
    );
    let frame1_esp = Label::new();
    let frame2_esp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        // frame 0
        .D32(0x12345678) // saved %ebx
        .D32(0x40005020) // return address
        // frame 1
        .mark(&frame1_esp)
        .D32(0x40006030) // return address
        // frame 2
        .mark(&frame2_esp)
        .append_repeated(0, 16);

    f.raw.eip = 0x40004010;
    f.raw.esp = stack.start().value().unwrap() as u32;
    f.raw.ebx = 0xdeadbeef;
    f.raw.esi = 0x5a5a5a5a;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 3);

    let f0 = &s.frames[0];
    assert_eq!(f0.trust, FrameTrust::Context);
    assert_eq!(f0.function_name.as_deref(), Some("enchiridion"));

    let f1 = &s.frames[1];
    assert_eq!(f1.trust, FrameTrust::CallFrameInfo);
    assert_eq!(f1.function_name.as_deref(), Some("epictetus"));
    assert_eq!(f1.instruction, 0x4000501f);
    assert_eq!(f1.context.get_register("esp"), frame1_esp.value());
    // Recovered from the stack, not forwarded from the callee.
    assert_eq!(f1.context.get_register("ebx"), Some(0x12345678));
    // Callee-saved, so forwarded.
    assert_eq!(f1.context.get_register("esi"), Some(0x5a5a5a5a));
    // Caller-saved, so unknown.
    assert_eq!(f1.context.get_register("eax"), None);

    let f2 = &s.frames[2];
    assert_eq!(f2.trust, FrameTrust::CallFrameInfo);
    assert_eq!(f2.function_name.as_deref(), Some("discourses"));
    assert_eq!(f2.context.get_register("esp"), frame2_esp.value());
    assert_eq!(f2.context.get_register("ebx"), Some(0x12345678));
}

#[test]
fn test_cfi_register_rules() {
    // Rules can copy another callee register.
    let mut f = TestFixture::new();
    f.add_symbols(
        "FUNC 4000 100 0 enchiridion
FUNC 5000 100 0 epictetus
STACK CFI INIT 4000 100 .cfa: $esp 4 + .ra: .cfa 4 - ^ $esi: $eax
",
    );
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack.D32(0x40005020).append_repeated(0, 8);

    f.raw.eip = 0x40004010;
    f.raw.esp = stack.start().value().unwrap() as u32;
    f.raw.esi = 0x5a5a5a5a;
    f.raw.eax = 0x11111111;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    let f1 = &s.frames[1];
    assert_eq!(f1.trust, FrameTrust::CallFrameInfo);
    assert_eq!(f1.context.get_register("esi"), Some(0x11111111));

    // A register whose rule can't be evaluated is left unknown in the
    // caller instead of failing the whole frame.
    let mut f = TestFixture::new();
    f.add_symbols(
        "FUNC 4000 100 0 enchiridion
FUNC 5000 100 0 epictetus
STACK CFI INIT 4000 100 .cfa: $esp 4 + .ra: .cfa 4 - ^ $esi: 16 ^
",
    );
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack.D32(0x40005020).append_repeated(0, 8);
    f.raw.eip = 0x40004010;
    f.raw.esp = stack.start().value().unwrap() as u32;
    f.raw.esi = 0x5a5a5a5a;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    assert_eq!(s.frames[1].trust, FrameTrust::CallFrameInfo);
    assert_eq!(s.frames[1].context.get_register("esi"), None);
}

#[test]
fn test_self_referential_frame_pointer() {
    // An %ebp that points at itself makes no progress up the stack after
    // one frame. The walk has to stop instead of looping.
    let mut f = TestFixture::new();
    let frame0_ebp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        .append_repeated(0, 8)
        .mark(&frame0_ebp)
        .D32(&frame0_ebp) // saved %ebp points right back here
        .D32(0x40008679) // return address
        .append_repeated(0, 16);
    f.raw.eip = 0x4000c7a5;
    f.raw.esp = stack.start().value().unwrap() as u32;
    f.raw.ebp = frame0_ebp.value().unwrap() as u32;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    assert_eq!(s.frames[1].trust, FrameTrust::FramePointer);
}

fn frame_pointer_chain(frames: u32) -> Section {
    // Each frame is a saved %ebp pointing at the next pair, then a return
    // address. The last saved %ebp is 0.
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    for i in 0..frames {
        let next_ebp = if i + 1 < frames {
            0x80000000 + (i + 1) * 8
        } else {
            0
        };
        stack = stack.D32(next_ebp).D32(0x40008000 + i * 0x10);
    }
    stack.append_repeated(0, 16)
}

#[test]
fn test_max_frames() {
    let mut f = TestFixture::new();
    f.raw.eip = 0x4000c7a5;
    f.raw.esp = 0x80000000;
    f.raw.ebp = 0x80000000;

    let s = f.walk_stack(frame_pointer_chain(4));
    assert_eq!(s.frames.len(), 5);
    assert!(s.frames[1..]
        .iter()
        .all(|frame| frame.trust == FrameTrust::FramePointer));

    f.max_frames = 3;
    let s = f.walk_stack(frame_pointer_chain(4));
    assert_eq!(s.frames.len(), 3);
    assert_eq!(s.info, CallStackInfo::Ok);

    // The context frame is there no matter what.
    f.max_frames = 0;
    let s = f.walk_stack(frame_pointer_chain(4));
    assert_eq!(s.frames.len(), 1);
}

#[test]
fn test_missing_memory_and_context() {
    let f = TestFixture::new();
    let context = MinidumpContext {
        raw: MinidumpRawContext::X86(CONTEXT_X86 {
            eip: 0x40000200,
            ..CONTEXT_X86::default()
        }),
        valid: MinidumpContextValidity::All,
    };
    let symbolizer = Symbolizer::new(StringSymbolSupplier::new(HashMap::new()));

    let options = ProcessorOptions::default();
    let s = walk_stack(7, Some(&context), None, &f.modules, &symbolizer, &options);
    assert_eq!(s.info, CallStackInfo::MissingMemory);
    assert_eq!(s.thread_id, 7);
    assert_eq!(s.frames.len(), 1);
    assert_eq!(s.frames[0].instruction, 0x40000200);

    let s = walk_stack(7, None, None, &f.modules, &symbolizer, &options);
    assert_eq!(s.info, CallStackInfo::MissingContext);
    assert!(s.frames.is_empty());
}

#[test]
fn test_walker_can_be_abandoned() {
    let mut f = TestFixture::new();
    f.add_symbols("FUNC c000 1000 0 innermost\n");
    let stack = frame_pointer_chain(4);
    let base = stack.start().value().unwrap();
    let size = stack.size();
    let bytes = stack.get_contents().unwrap();
    let stack_memory = MinidumpMemory {
        desc: Default::default(),
        base_address: base,
        size,
        bytes: &bytes,
        endian: scroll::Endian::Little,
    };
    let context = MinidumpContext {
        raw: MinidumpRawContext::X86(CONTEXT_X86 {
            eip: 0x4000c7a5,
            esp: 0x80000000,
            ebp: 0x80000000,
            ..CONTEXT_X86::default()
        }),
        valid: MinidumpContextValidity::All,
    };
    let symbolizer = Symbolizer::new(StringSymbolSupplier::new(f.symbols.clone()));

    let mut walker = StackWalker::new(
        Some(&context),
        Some(&stack_memory),
        &f.modules,
        &symbolizer,
        1024,
    );
    let first = walker.next().unwrap();
    assert_eq!(first.trust, FrameTrust::Context);
    assert_eq!(first.function_name.as_deref(), Some("innermost"));
    let second = walker.next().unwrap();
    assert_eq!(second.instruction, 0x40007fff);
    drop(walker);

    let count = StackWalker::new(
        Some(&context),
        Some(&stack_memory),
        &f.modules,
        &symbolizer,
        1024,
    )
    .count();
    assert_eq!(count, 5);
}
