use minidump::format::{
    BreakpadInfoValid, MINIDUMP_BREAKPAD_INFO, MINIDUMP_DIRECTORY, MINIDUMP_STREAM_TYPE,
};
use minidump::ProcessSnapshot;

use crate::dump_buf::DumpBuf;

/// Whether `snapshot` names any thread worth a Breakpad info stream.
pub(super) fn present(snapshot: &ProcessSnapshot) -> bool {
    snapshot.dump_thread.is_some() || snapshot.requesting_thread.is_some()
}

pub(super) fn write(
    buf: &mut DumpBuf,
    snapshot: &ProcessSnapshot,
) -> Result<Option<MINIDUMP_DIRECTORY>, scroll::Error> {
    if !present(snapshot) {
        return Ok(None);
    }
    let mut validity = BreakpadInfoValid::empty();
    if snapshot.dump_thread.is_some() {
        validity |= BreakpadInfoValid::DumpThreadId;
    }
    if snapshot.requesting_thread.is_some() {
        validity |= BreakpadInfoValid::RequestingThreadId;
    }
    let info = MINIDUMP_BREAKPAD_INFO {
        validity: validity.bits(),
        dump_thread_id: snapshot.dump_thread.unwrap_or(0),
        requesting_thread_id: snapshot.requesting_thread.unwrap_or(0),
    };
    Ok(Some(MINIDUMP_DIRECTORY {
        stream_type: MINIDUMP_STREAM_TYPE::BreakpadInfoStream.into(),
        location: buf.write(&info)?,
    }))
}
