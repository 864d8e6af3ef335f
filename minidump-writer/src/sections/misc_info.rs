use minidump::format::{
    self as md, MiscInfoFlags, MINIDUMP_DIRECTORY, MINIDUMP_MISC_INFO, MINIDUMP_STREAM_TYPE,
};

use crate::dump_buf::DumpBuf;

pub(super) fn write(
    buf: &mut DumpBuf,
    process_id: Option<u32>,
) -> Result<MINIDUMP_DIRECTORY, scroll::Error> {
    let mut info = MINIDUMP_MISC_INFO {
        size_of_info: md::size_of::<MINIDUMP_MISC_INFO>() as u32,
        ..MINIDUMP_MISC_INFO::default()
    };
    if let Some(pid) = process_id {
        info.flags1 |= MiscInfoFlags::MINIDUMP_MISC1_PROCESS_ID.bits();
        info.process_id = pid;
    }
    Ok(MINIDUMP_DIRECTORY {
        stream_type: MINIDUMP_STREAM_TYPE::MiscInfoStream.into(),
        location: buf.write(&info)?,
    })
}
