use minidump::format::{
    MINIDUMP_DIRECTORY, MINIDUMP_EXCEPTION, MINIDUMP_EXCEPTION_STREAM,
    MINIDUMP_LOCATION_DESCRIPTOR, MINIDUMP_STREAM_TYPE,
};
use minidump::ExceptionRecord;

use super::thread_list::write_context;
use crate::dump_buf::DumpBuf;

pub(super) fn write(
    buf: &mut DumpBuf,
    exception: &ExceptionRecord,
) -> Result<MINIDUMP_DIRECTORY, scroll::Error> {
    let thread_context = match &exception.context {
        Some(context) => write_context(buf, context)?,
        None => MINIDUMP_LOCATION_DESCRIPTOR::default(),
    };
    let stream = MINIDUMP_EXCEPTION_STREAM {
        thread_id: exception.thread_id,
        exception_record: MINIDUMP_EXCEPTION {
            exception_code: exception.code,
            exception_flags: exception.flags,
            exception_address: exception.address,
            ..MINIDUMP_EXCEPTION::default()
        },
        thread_context,
        ..MINIDUMP_EXCEPTION_STREAM::default()
    };
    Ok(MINIDUMP_DIRECTORY {
        stream_type: MINIDUMP_STREAM_TYPE::ExceptionStream.into(),
        location: buf.write(&stream)?,
    })
}
