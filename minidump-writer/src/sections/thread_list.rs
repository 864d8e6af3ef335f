use minidump::format::{
    MINIDUMP_DIRECTORY, MINIDUMP_LOCATION_DESCRIPTOR, MINIDUMP_MEMORY_DESCRIPTOR,
    MINIDUMP_STREAM_TYPE, MINIDUMP_THREAD,
};
use minidump::{MinidumpRawContext, ProcessSnapshot};
use tracing::warn;

use super::memory_list;
use crate::dump_buf::DumpBuf;

pub(super) fn write_context(
    buf: &mut DumpBuf,
    context: &MinidumpRawContext,
) -> Result<MINIDUMP_LOCATION_DESCRIPTOR, scroll::Error> {
    match context {
        MinidumpRawContext::X86(ctx) => buf.write(ctx),
        MinidumpRawContext::Amd64(ctx) => buf.write(ctx),
    }
}

pub(super) fn write(
    buf: &mut DumpBuf,
    snapshot: &ProcessSnapshot,
    regions: &[MINIDUMP_MEMORY_DESCRIPTOR],
) -> Result<MINIDUMP_DIRECTORY, scroll::Error> {
    let mut threads = Vec::with_capacity(snapshot.threads.len());
    for thread in &snapshot.threads {
        let stack = match thread.stack {
            Some((start, len)) => memory_list::descriptor_for(regions, start, len)
                .unwrap_or_else(|| {
                    warn!(
                        "stack of thread {} at {:#x} was not captured",
                        thread.thread_id, start
                    );
                    MINIDUMP_MEMORY_DESCRIPTOR::default()
                }),
            None => MINIDUMP_MEMORY_DESCRIPTOR::default(),
        };
        threads.push(MINIDUMP_THREAD {
            thread_id: thread.thread_id,
            stack,
            thread_context: write_context(buf, &thread.context)?,
            ..MINIDUMP_THREAD::default()
        });
    }
    Ok(MINIDUMP_DIRECTORY {
        stream_type: MINIDUMP_STREAM_TYPE::ThreadListStream.into(),
        location: buf.write_list(&threads)?,
    })
}
