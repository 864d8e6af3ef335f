// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::collections::HashMap;

use crate::process_state::*;
use crate::stackwalker::walk_stack;
use crate::ProcessorOptions;
use breakpad_symbols::{StringSymbolSupplier, Symbolizer};
use minidump::format::CONTEXT_AMD64;
use minidump::*;
use test_assembler::*;

const BUILD_ID: &[u8] = &[
    0xb1, 0x6e, 0x5e, 0x2a, 0x57, 0x1c, 0x4d, 0x0e, 0x9a, 0x6f, 0x07, 0x33, 0x1b, 0x28, 0xc4, 0x15,
    0x8d, 0x02, 0x44, 0x6b,
];

struct TestFixture {
    pub raw: CONTEXT_AMD64,
    pub modules: MinidumpModuleList,
    pub symbols: HashMap<String, String>,
}

impl TestFixture {
    pub fn new() -> TestFixture {
        TestFixture {
            raw: CONTEXT_AMD64::default(),
            // Give the two modules reasonable standard locations and names
            // for tests to play with.
            modules: MinidumpModuleList::from_modules(vec![
                MinidumpModule::with_build_id(0x00007400c0000000, 0x10000, "module1", BUILD_ID),
                MinidumpModule::new(0x00007500b0000000, 0x10000, "module2"),
            ]),
            symbols: HashMap::new(),
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
            format!("MODULE Linux x86_64 {} module1\n{}", id.breakpad(), records),
        );
    }

    pub fn walk_stack(&self, stack: Section) -> CallStack {
        let context = MinidumpContext {
            raw: MinidumpRawContext::Amd64(self.raw.clone()),
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
            &ProcessorOptions::default(),
        )
    }
}

#[test]
fn test_simple() {
    let mut f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x80000000);
    // There should be no references to the stack in this walk: we don't
    // provide any call frame information, so trying to reconstruct the
    // context frame's caller should fail. So there's no need for us to
    // provide stack contents.
    f.raw.rip = 0x00007400c0000200;
    f.raw.rbp = 0x8000000080000000;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 1);
    let f = &s.frames[0];
    let m = f.module.as_ref().unwrap();
    assert_eq!(m.code_file(), "module1");
}

#[test]
fn test_caller_pushed_rbp() {
    // Functions typically push their %rbp upon entry and set %rbp pointing
    // there.  If stackwalking finds a plausible address for the next frame's
    // %rbp directly below the return address, assume that it is indeed the
    // next frame's %rbp.
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    let stack_start = 0x8000000080000000;
    let return_address = 0x00007500b0000110;
    stack.start().set_const(stack_start);

    let frame0_rbp = Label::new();
    let frame1_sp = Label::new();
    let frame1_rbp = Label::new();

    stack = stack
        // frame 0
        .append_repeated(0, 16) // space
        .D64(0x00007400b0000000) // junk that's not
        .D64(0x00007500b0000000) // a return address
        .D64(0x00007400c0001000) // a couple of plausible addresses
        .D64(0x00007500b000aaaa) // that are not within functions
        .mark(&frame0_rbp)
        .D64(&frame1_rbp) // caller-pushed %rbp
        .D64(return_address) // actual return address
        // frame 1
        .mark(&frame1_sp)
        .append_repeated(0, 32) // body of frame1
        .mark(&frame1_rbp) // end of stack
        .D64(0);

    f.raw.rip = 0x00007400c0000200;
    f.raw.rbp = frame0_rbp.value().unwrap();
    f.raw.rsp = stack.start().value().unwrap();

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);

    {
        let f0 = &s.frames[0];
        assert_eq!(f0.trust, FrameTrust::Context);
        assert_eq!(f0.context.valid, MinidumpContextValidity::All);
        if let MinidumpRawContext::Amd64(ctx) = &f0.context.raw {
            assert_eq!(ctx.rbp, frame0_rbp.value().unwrap());
        } else {
            unreachable!();
        }
    }

    {
        let f1 = &s.frames[1];
        assert_eq!(f1.trust, FrameTrust::FramePointer);
        if let MinidumpContextValidity::Some(ref which) = f1.context.valid {
            assert!(which.contains("rip"));
            assert!(which.contains("rsp"));
            assert!(which.contains("rbp"));
        } else {
            unreachable!();
        }
        if let MinidumpRawContext::Amd64(ctx) = &f1.context.raw {
            assert_eq!(ctx.rip, return_address);
            assert_eq!(ctx.rsp, frame1_sp.value().unwrap());
            assert_eq!(ctx.rbp, frame1_rbp.value().unwrap());
        } else {
            unreachable!();
        }
    }
}

#[test]
fn test_scan_without_symbols() {
    // When the stack walker resorts to scanning the stack,
    // only addresses located within loaded modules are
    // considered valid return addresses.
    // Force scanning through three frames to ensure that the
    // stack pointer is set properly in scan-recovered frames.
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    let stack_start = 0x8000000080000000;
    stack.start().set_const(stack_start);

    let return_address1 = 0x00007500b0000100;
    let return_address2 = 0x00007500b0000900;

    let frame1_sp = Label::new();
    let frame2_sp = Label::new();
    let frame1_rbp = Label::new();
    stack = stack
        // frame 0
        .append_repeated(0, 16) // space
        .D64(0x00007400b0000000) // junk that's not
        .D64(0x00007500d0000000) // a return address
        .D64(return_address1) // actual return address
        // frame 1
        .mark(&frame1_sp)
        .append_repeated(0, 16) // space
        .D64(0x00007400b0000000) // more junk
        .D64(0x00007500d0000000)
        .mark(&frame1_rbp)
        .D64(stack_start) // This is in the right place to be
        // a saved rbp, but it's bogus, so
        // we shouldn't report it.
        .D64(return_address2) // actual return address
        // frame 2
        .mark(&frame2_sp)
        .append_repeated(0, 32); // end of stack

    f.raw.rip = 0x00007400c0000200;
    f.raw.rbp = frame1_rbp.value().unwrap();
    f.raw.rsp = stack.start().value().unwrap();

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 3);

    {
        let f0 = &s.frames[0];
        assert_eq!(f0.trust, FrameTrust::Context);
        assert_eq!(f0.context.valid, MinidumpContextValidity::All);
    }

    {
        let f1 = &s.frames[1];
        assert_eq!(f1.trust, FrameTrust::Scan);
        if let MinidumpContextValidity::Some(ref which) = f1.context.valid {
            assert!(which.contains("rip"));
            assert!(which.contains("rsp"));
            assert!(which.contains("rbp"));
        } else {
            unreachable!();
        }

        if let MinidumpRawContext::Amd64(ctx) = &f1.context.raw {
            assert_eq!(ctx.rip, return_address1);
            assert_eq!(ctx.rsp, frame1_sp.value().unwrap());
            assert_eq!(ctx.rbp, frame1_rbp.value().unwrap());
        } else {
            unreachable!();
        }
    }

    {
        let f2 = &s.frames[2];
        assert_eq!(f2.trust, FrameTrust::Scan);
        if let MinidumpContextValidity::Some(ref which) = f2.context.valid {
            assert!(which.contains("rip"));
            assert!(which.contains("rsp"));
        } else {
            unreachable!();
        }

        if let MinidumpRawContext::Amd64(ctx) = &f2.context.raw {
            assert_eq!(ctx.rip, return_address2);
            assert_eq!(ctx.rsp, frame2_sp.value().unwrap());
        } else {
            unreachable!();
        }
    }
}

#[test]
fn test_non_canonical_return_address() {
    // Something that points into module2 once its high bits are dropped is
    // still not an address.
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        .D64(0x80007500b0000100) // non-canonical
        .D64(0x00007500b0000200) // real return address
        .append_repeated(0, 16);
    f.raw.rip = 0x00007400c0000200;
    f.raw.rsp = stack.start().value().unwrap();
    f.raw.rbp = 0;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    assert_eq!(s.frames[1].trust, FrameTrust::Scan);
    assert_eq!(s.frames[1].instruction, 0x00007500b00001ff);
}

#[test]
fn test_cfi() {
    // main calls foo calls bar, every frame described by CFI.
    let mut f = TestFixture::new();
    f.add_symbols(
        "FILE 0 crasher.c
FUNC 1000 100 0 main
1000 100 10 0
FUNC 2000 100 0 foo
2000 100 20 0
FUNC 3000 100 0 bar
3000 100 30 0
STACK CFI INIT 2000 100 .cfa: $rsp 8 + .ra: .cfa -8 + ^
STACK CFI INIT 3000 100 .cfa: $rsp 8 + .ra: .cfa -8 + ^
STACK CFI 3001 .cfa: $rsp 16 + $rbx: .cfa -16 + ^
",
    );
    let frame1_rsp = Label::new();
    let frame2_rsp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x7fff_0000_0000);
    stack = stack
        // frame 0: bar, after pushing %rbx
        .D64(0x0123_4567_89ab_cdef) // saved %rbx
        .D64(0x00007400c0002050) // return into foo
        // frame 1: foo
        .mark(&frame1_rsp)
        .D64(0x00007400c0001040) // return into main
        // frame 2: main
        .mark(&frame2_rsp)
        .append_repeated(0, 32);

    f.raw.rip = 0x00007400c0003010;
    f.raw.rsp = stack.start().value().unwrap();
    f.raw.rbx = 0xdead_beef;
    f.raw.r12 = 0x1212;
    f.raw.rax = 0xaaaa;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 3);

    let names: Vec<_> = s
        .frames
        .iter()
        .map(|frame| frame.function_name.as_deref().unwrap_or("?"))
        .collect();
    assert_eq!(names, ["bar", "foo", "main"]);

    assert_eq!(s.frames[0].trust, FrameTrust::Context);
    assert_eq!(s.frames[0].source_line, Some(30));

    let f1 = &s.frames[1];
    assert_eq!(f1.trust, FrameTrust::CallFrameInfo);
    assert_eq!(f1.instruction, 0x00007400c000204f);
    assert_eq!(f1.source_line, Some(20));
    assert_eq!(f1.context.get_register("rsp"), frame1_rsp.value());
    assert_eq!(f1.context.get_register("rbx"), Some(0x0123_4567_89ab_cdef));
    assert_eq!(f1.context.get_register("r12"), Some(0x1212));
    assert_eq!(f1.context.get_register("rax"), None);

    let f2 = &s.frames[2];
    assert_eq!(f2.trust, FrameTrust::CallFrameInfo);
    assert_eq!(f2.source_line, Some(10));
    assert_eq!(f2.context.get_register("rsp"), frame2_rsp.value());
    assert_eq!(f2.context.get_register("rbx"), Some(0x0123_4567_89ab_cdef));
}

#[test]
fn test_cfi_falls_back_to_frame_pointer() {
    // CFI that evaluates to garbage is ignored in favor of %rbp.
    let mut f = TestFixture::new();
    f.add_symbols(
        "FUNC 1000 100 0 main
FUNC 3000 100 0 bar
STACK CFI INIT 3000 100 .cfa: $rsp 8 + .ra: 0
",
    );
    let frame0_rbp = Label::new();
    let frame1_rbp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x7fff_0000_0000);
    stack = stack
        .append_repeated(0, 16)
        .mark(&frame0_rbp)
        .D64(&frame1_rbp)
        .D64(0x00007400c0001040)
        .append_repeated(0, 16)
        .mark(&frame1_rbp)
        .D64(0)
        .D64(0);

    f.raw.rip = 0x00007400c0003010;
    f.raw.rsp = stack.start().value().unwrap();
    f.raw.rbp = frame0_rbp.value().unwrap();

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    assert_eq!(s.frames[1].trust, FrameTrust::FramePointer);
    assert_eq!(s.frames[1].function_name.as_deref(), Some("main"));
}
